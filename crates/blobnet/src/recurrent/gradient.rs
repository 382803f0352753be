use crate::error::{Result, RuntimeError};
use crate::operator::{Operator, OperatorBase, OperatorContext};
use crate::schema::OpSchema;

pub const ACCUMULATE_INPUT_GRADIENT_OP: &str = "AccumulateInputGradient";

pub(crate) fn schema() -> OpSchema {
    OpSchema::new(ACCUMULATE_INPUT_GRADIENT_OP)
        .num_inputs(3)
        .num_outputs(1)
        .enforce_inplace(2, 0)
        .doc(
            "Adds the timestep-t slice of an incoming gradient into slice t + offset of \
             an accumulator. Inputs: timestep, gradient, accumulator. Output: accumulator.",
        )
}

/// `acc[t + offset] += grad[t]`, with the timestep read from input 0.
pub struct AccumulateInputGradientOp {
    base: OperatorBase,
    offset: usize,
}

impl AccumulateInputGradientOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        let base = OperatorBase::new(&ctx)?;
        let offset: usize = base
            .single_arg::<i64>("offset")?
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| RuntimeError::invalid_argument("offset", "offset not set"))?;
        Ok(AccumulateInputGradientOp { base, offset })
    }
}

impl Operator for AccumulateInputGradientOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn run(&mut self) -> Result<()> {
        let t = usize::try_from(self.base.input_tensor(0)?.scalar_value::<i32>()?)
            .map_err(|_| RuntimeError::tensor("negative timestep"))?;
        let grad = self.base.input_tensor(1)?;
        let acc = self
            .base
            .output(0)
            .require_tensor(self.base.output_name(0))?;

        let rows = acc.shape().dim(0).unwrap_or(0);
        if rows == 0 {
            return Err(RuntimeError::tensor("accumulator has no timesteps"));
        }
        let step = acc.len() / rows;
        let dst = (t + self.offset) * step;
        if dst + step > acc.len() {
            return Err(RuntimeError::tensor(
                "accumulation destination address out of bounds",
            ));
        }
        if (t + 1) * step > grad.len() {
            return Err(RuntimeError::tensor("accumulation source address out of bounds"));
        }

        let incoming = grad.read_elements::<f32>(t * step, step)?;
        let mut current = acc.read_elements::<f32>(dst, step)?;
        for (value, delta) in current.iter_mut().zip(&incoming) {
            *value += delta;
        }
        acc.write_elements(dst, &current)
    }
}
