use crate::error::{Result, RuntimeError};
use crate::operator::{Operator, OperatorBase, OperatorContext};
use crate::schema::OpSchema;

use super::link::APPLY_LINK_OP;

pub(crate) fn schema() -> OpSchema {
    OpSchema::new(APPLY_LINK_OP)
        .num_inputs(2)
        .num_outputs(2)
        .enforce_inplace(1, 1)
        .private()
        .doc("Internal recurrent operator: exposes a window of an external buffer for one timestep.")
}

/// Points its internal output at `window` rows of the external buffer.
///
/// Inputs: the timestep blob and the external buffer. Outputs: the internal
/// view and the external buffer itself, listed so dependency analysis sees
/// the link as touching the buffer. The buffer's contents are not modified.
pub struct ApplyLinkOp {
    base: OperatorBase,
    offset: i32,
    window: usize,
}

impl ApplyLinkOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        let base = OperatorBase::new(&ctx)?;
        let offset: i32 = base
            .single_arg("offset")?
            .ok_or_else(|| RuntimeError::invalid_argument("offset", "offset not set"))?;
        let window: usize = base
            .single_arg("window")?
            .filter(|w: &usize| *w > 0)
            .ok_or_else(|| RuntimeError::invalid_argument("window", "window not set"))?;
        Ok(ApplyLinkOp {
            base,
            offset,
            window,
        })
    }
}

impl Operator for ApplyLinkOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn run(&mut self) -> Result<()> {
        let t = self.base.input_tensor(0)?.scalar_value::<i32>()?;
        let external = self.base.input_tensor(1)?;
        let rows = external.shape().dim(0).unwrap_or(0);
        if external.is_empty() {
            return Err(RuntimeError::tensor(format!(
                "link external '{}' is empty",
                self.base.input_name(1)
            )));
        }
        let start = external.time_origin() as i64 + i64::from(t) + i64::from(self.offset);
        if start < 0 || start as usize + self.window > rows {
            return Err(RuntimeError::tensor(format!(
                "link window [{start}, {}) of '{}' is outside its {rows} rows at timestep {t}",
                start + self.window as i64,
                self.base.input_name(1)
            )));
        }
        let view = external.view_rows(start as usize, self.window)?;
        self.base.output(0).set_tensor(view);
        Ok(())
    }
}
