use anyhow::{bail, Context};
use blobnet::{DType, Operator, OperatorBase, OperatorContext, Result, Shape};

pub const CONSTANT_FILL: &str = "ConstantFill";

/// Fills its output with a constant.
///
/// The output takes the input's shape when an input is given, otherwise the
/// `shape` argument. `dtype` selects `"float"` (default) or `"int32"`.
pub struct ConstantFillOp {
    base: OperatorBase,
    shape: Option<Shape>,
    dtype: DType,
    value: f32,
}

impl ConstantFillOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        let base = OperatorBase::new(&ctx)?;
        let dims: Vec<i64> = base.repeated_arg("shape")?;
        let shape = if base.num_inputs() == 0 {
            let dims = dims
                .into_iter()
                .map(|dim| usize::try_from(dim).with_context(|| format!("negative dimension {dim}")))
                .collect::<anyhow::Result<Vec<_>>>()?;
            Some(Shape::new(dims))
        } else {
            None
        };
        let dtype = parse_dtype(&base.single_arg_or("dtype", "float".to_string())?)?;
        let value = base.single_arg_or("value", 0.0f32)?;
        Ok(ConstantFillOp {
            base,
            shape,
            dtype,
            value,
        })
    }
}

fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    match name {
        "float" => Ok(DType::F32),
        "int32" => Ok(DType::I32),
        other => bail!("{CONSTANT_FILL}: unsupported dtype '{other}'"),
    }
}

impl Operator for ConstantFillOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn run(&mut self) -> Result<()> {
        let shape = match &self.shape {
            Some(shape) => shape.clone(),
            None => self.base.input_tensor(0)?.shape().clone(),
        };
        let output = self.base.output(0).resize_tensor(shape, self.dtype);
        match self.dtype {
            DType::I32 => output.fill(self.value as i32),
            _ => output.fill(self.value),
        }
    }
}
