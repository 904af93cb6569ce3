use crate::error::StepError;
use crate::step::{Step, StepContext};

/// Forwards every row unchanged.
pub struct PassthroughStep;

impl Step for PassthroughStep {
    fn process_row(&mut self, ctx: &mut StepContext) -> Result<bool, StepError> {
        let Some((meta, row)) = ctx.get_row()? else {
            return Ok(false);
        };
        Ok(ctx.put_row(meta, row))
    }
}
