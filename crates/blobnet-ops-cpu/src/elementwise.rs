//! Element-wise f32 kernels.
//!
//! Inputs are always copied out before the output is written: an output may
//! alias an input (in-place schemas) or share storage with it (link views), and
//! tensor storage locks are not re-entrant.

use anyhow::{ensure, Context};
use blobnet::{DType, Operator, OperatorBase, OperatorContext, Result, Shape, Tensor};

pub const COPY: &str = "Copy";
pub const SCALE: &str = "Scale";
pub const SUM: &str = "Sum";

fn read_f32(base: &OperatorBase, index: usize) -> anyhow::Result<(Shape, Vec<f32>)> {
    let tensor = base.input_tensor(index)?;
    ensure!(
        tensor.dtype() == DType::F32,
        "{}: input '{}' holds {} values, expected f32",
        base.op_type(),
        base.input_name(index),
        tensor.dtype().name()
    );
    let values = tensor
        .to_vec::<f32>()
        .with_context(|| format!("reading input '{}'", base.input_name(index)))?;
    Ok((tensor.shape().clone(), values))
}

fn write_f32(base: &OperatorBase, shape: Shape, values: &[f32]) -> anyhow::Result<Tensor> {
    let output = base.output(0).resize_tensor(shape, DType::F32);
    output
        .copy_from_slice(values)
        .with_context(|| format!("writing output '{}'", base.output_name(0)))?;
    Ok(output)
}

macro_rules! impl_operator_base {
    () => {
        fn base(&self) -> &OperatorBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut OperatorBase {
            &mut self.base
        }
    };
}

/// Copies input 0 into output 0. Running in place is a no-op.
pub struct CopyOp {
    base: OperatorBase,
}

impl CopyOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        Ok(CopyOp {
            base: OperatorBase::new(&ctx)?,
        })
    }
}

impl Operator for CopyOp {
    impl_operator_base!();

    fn run(&mut self) -> Result<()> {
        if self.base.input_name(0) == self.base.output_name(0) {
            return Ok(());
        }
        let input = self.base.input_tensor(0)?;
        let bytes = input.with_bytes(|bytes| bytes.to_vec());
        let output = self
            .base
            .output(0)
            .resize_tensor(input.shape().clone(), input.dtype());
        output.with_bytes_mut(|out| out.copy_from_slice(&bytes));
        Ok(())
    }
}

/// Multiplies input 0 by the `scale` argument.
pub struct ScaleOp {
    base: OperatorBase,
    scale: f32,
}

impl ScaleOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        let base = OperatorBase::new(&ctx)?;
        let scale = base.single_arg_or("scale", 1.0f32)?;
        Ok(ScaleOp { base, scale })
    }
}

impl Operator for ScaleOp {
    impl_operator_base!();

    fn run(&mut self) -> Result<()> {
        let (shape, mut values) = read_f32(&self.base, 0)?;
        for value in &mut values {
            *value *= self.scale;
        }
        write_f32(&self.base, shape, &values)?;
        Ok(())
    }
}

/// Sums any number of same-shaped inputs.
pub struct SumOp {
    base: OperatorBase,
}

impl SumOp {
    pub fn new(ctx: OperatorContext<'_>) -> Result<Self> {
        Ok(SumOp {
            base: OperatorBase::new(&ctx)?,
        })
    }

    fn compute(&self) -> anyhow::Result<()> {
        let (shape, mut acc) = read_f32(&self.base, 0)?;
        for index in 1..self.base.num_inputs() {
            let (other_shape, other) = read_f32(&self.base, index)?;
            ensure!(
                other_shape == shape,
                "{SUM}: input '{}' has shape {:?}, expected {:?}",
                self.base.input_name(index),
                other_shape.dims(),
                shape.dims()
            );
            for (a, b) in acc.iter_mut().zip(&other) {
                *a += b;
            }
        }
        write_f32(&self.base, shape, &acc)?;
        Ok(())
    }
}

impl Operator for SumOp {
    impl_operator_base!();

    fn run(&mut self) -> Result<()> {
        Ok(self.compute()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Mul,
}

impl BinaryKind {
    pub fn op_type(self) -> &'static str {
        match self {
            BinaryKind::Add => "Add",
            BinaryKind::Mul => "Mul",
        }
    }

    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Mul => a * b,
        }
    }
}

/// `Add` / `Mul`. Shapes must match, or the second input holds one element.
pub struct BinaryOp {
    base: OperatorBase,
    kind: BinaryKind,
}

impl BinaryOp {
    pub fn new(ctx: OperatorContext<'_>, kind: BinaryKind) -> Result<Self> {
        Ok(BinaryOp {
            base: OperatorBase::new(&ctx)?,
            kind,
        })
    }

    fn compute(&self) -> anyhow::Result<()> {
        let (shape, lhs) = read_f32(&self.base, 0)?;
        let (rhs_shape, rhs) = read_f32(&self.base, 1)?;
        let out: Vec<f32> = if rhs.len() == 1 {
            lhs.iter().map(|a| self.kind.apply(*a, rhs[0])).collect()
        } else {
            ensure!(
                rhs_shape == shape,
                "{}: shapes {:?} and {:?} do not match",
                self.kind.op_type(),
                shape.dims(),
                rhs_shape.dims()
            );
            lhs.iter()
                .zip(&rhs)
                .map(|(a, b)| self.kind.apply(*a, *b))
                .collect()
        };
        write_f32(&self.base, shape, &out)?;
        Ok(())
    }
}

impl Operator for BinaryOp {
    impl_operator_base!();

    fn run(&mut self) -> Result<()> {
        Ok(self.compute()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Tanh,
    Sigmoid,
    Relu,
}

impl UnaryKind {
    pub fn op_type(self) -> &'static str {
        match self {
            UnaryKind::Tanh => "Tanh",
            UnaryKind::Sigmoid => "Sigmoid",
            UnaryKind::Relu => "Relu",
        }
    }

    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryKind::Tanh => x.tanh(),
            UnaryKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryKind::Relu => x.max(0.0),
        }
    }
}

pub struct UnaryOp {
    base: OperatorBase,
    kind: UnaryKind,
}

impl UnaryOp {
    pub fn new(ctx: OperatorContext<'_>, kind: UnaryKind) -> Result<Self> {
        Ok(UnaryOp {
            base: OperatorBase::new(&ctx)?,
            kind,
        })
    }
}

impl Operator for UnaryOp {
    impl_operator_base!();

    fn run(&mut self) -> Result<()> {
        let (shape, mut values) = read_f32(&self.base, 0)?;
        for value in &mut values {
            *value = self.kind.apply(*value);
        }
        write_f32(&self.base, shape, &values)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unary_kinds_match_reference_values() {
        assert_eq!(UnaryKind::Relu.apply(-2.0), 0.0);
        assert_eq!(UnaryKind::Relu.apply(3.5), 3.5);
        assert!((UnaryKind::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
        assert!((UnaryKind::Tanh.apply(1.0) - 1.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn binary_kinds_apply() {
        assert_eq!(BinaryKind::Add.apply(2.0, 3.0), 5.0);
        assert_eq!(BinaryKind::Mul.apply(2.0, 3.0), 6.0);
        assert_eq!(BinaryKind::Mul.op_type(), "Mul");
    }
}
