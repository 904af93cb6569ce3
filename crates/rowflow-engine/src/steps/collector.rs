use crate::error::StepError;
use crate::step::{Step, StepContext};

/// Keeps every row in the run result and forwards it if it has outputs.
pub struct CollectorStep;

impl Step for CollectorStep {
    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        let Some((meta, row)) = ctx.get_row()? else {
            return Ok(false);
        };
        ctx.add_result_row(row.clone());
        ctx.inc_lines_output();
        Ok(ctx.put_row(meta, row))
    }
}
