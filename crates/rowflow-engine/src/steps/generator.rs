use std::sync::Arc;

use rowflow_types::{variables, FieldMeta, Row, RowMeta, Value, ValueType};
use serde::Deserialize;

use crate::error::StepError;
use crate::step::{Step, StepContext};

fn default_start() -> i64 {
    1
}

fn default_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorSettings {
    #[serde(default = "default_start")]
    pub start: i64,
    /// Inclusive.
    pub end: i64,
    #[serde(default = "default_field")]
    pub field: String,
    /// On a slave, emit only this slave's share of the range.
    #[serde(default)]
    pub partition: bool,
}

/// Emits a single integer field counting from `start` to `end`.
#[derive(Default)]
pub struct GeneratorStep {
    meta: Option<Arc<RowMeta>>,
    next: i64,
    end: i64,
    stride: i64,
    exhausted: bool,
}

impl Step for GeneratorStep {
    fn init(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let settings: GeneratorSettings = ctx.settings()?;
        if settings.field.is_empty() {
            return Err(StepError::Settings("field name must not be empty".into()));
        }
        let (offset, stride) = if settings.partition {
            slave_share(ctx)?
        } else {
            (0, 1)
        };
        self.meta = Some(Arc::new(RowMeta::new(vec![FieldMeta::new(
            settings.field,
            ValueType::Integer,
        )])));
        self.next = settings.start;
        self.exhausted = false;
        match settings.start.checked_add(offset) {
            Some(first) => self.next = first,
            None => self.exhausted = true,
        }
        self.end = settings.end;
        self.stride = stride;
        Ok(())
    }

    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        let Some(meta) = &self.meta else {
            return Err(StepError::fatal("generator was not initialized"));
        };
        if self.exhausted || self.next > self.end {
            return Ok(false);
        }
        let value = self.next;
        match self.next.checked_add(self.stride) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Ok(ctx.put_row(Arc::clone(meta), Row::new(vec![Value::Integer(value)])))
    }
}

/// `(offset, stride)` for this slave from the cluster identity variables.
/// Outside a cluster the whole range is emitted.
fn slave_share(ctx: &StepContext) -> Result<(i64, i64), StepError> {
    let (Some(number), Some(size)) = (
        ctx.variable(variables::SLAVE_SERVER_NUMBER),
        ctx.variable(variables::CLUSTER_SIZE),
    ) else {
        return Ok((0, 1));
    };
    let parse = |name: &str, raw: &str| {
        raw.parse::<i64>()
            .map_err(|_| StepError::Settings(format!("{name} is not a number: '{raw}'")))
    };
    let number = parse(variables::SLAVE_SERVER_NUMBER, number)?;
    let size = parse(variables::CLUSTER_SIZE, size)?;
    if size < 1 || number < 0 || number >= size {
        return Err(StepError::Settings(format!(
            "slave number {number} out of range for cluster size {size}"
        )));
    }
    Ok((number, size))
}

#[cfg(test)]
mod tests {
    use rowflow_types::Variables;
    use serde_json::json;

    use super::*;
    use crate::meta::{Distribution, StepMeta};
    use crate::queue::StopSignal;

    fn ctx(vars: Variables) -> StepContext {
        StepContext::new(
            &StepMeta::new("gen", "generator")
                .with_settings(json!({"start": 1, "end": 10, "partition": true})),
            0,
            "s1",
            vars,
            Distribution::Distribute,
            StopSignal::new(Vec::new()),
            false,
        )
    }

    #[test]
    fn test_partition_uses_slave_identity() {
        let vars = Variables::new()
            .with(variables::SLAVE_SERVER_NUMBER, "1")
            .with(variables::CLUSTER_SIZE, "3");
        let mut step = GeneratorStep::default();
        step.init(&mut ctx(vars)).unwrap();
        assert_eq!((step.next, step.stride, step.end), (2, 3, 10));
    }

    #[test]
    fn test_partition_outside_cluster_emits_everything() {
        let mut step = GeneratorStep::default();
        step.init(&mut ctx(Variables::new())).unwrap();
        assert_eq!((step.next, step.stride), (1, 1));
    }

    #[test]
    fn test_partition_rejects_bad_slave_number() {
        let vars = Variables::new()
            .with(variables::SLAVE_SERVER_NUMBER, "3")
            .with(variables::CLUSTER_SIZE, "3");
        let err = GeneratorStep::default().init(&mut ctx(vars)).unwrap_err();
        assert!(matches!(err, StepError::Settings(_)));
    }
}
