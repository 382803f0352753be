//! Reference CPU kernels for the blobnet runtime.
//!
//! The kernels are deliberately plain f32 loops. They exist so graphs and
//! recurrent step nets can be exercised end to end; faster implementations
//! register under their own engine names next to these.

pub mod elementwise;
pub mod fill;

pub use elementwise::{BinaryKind, BinaryOp, CopyOp, ScaleOp, SumOp, UnaryKind, UnaryOp};
pub use fill::ConstantFillOp;

use blobnet::{builder, DeviceType, OpSchema, Operator, Result, RuntimeBuilder};
use tracing::debug;

/// Registers every reference kernel, with its schema, on the CPU device.
///
/// Call this before [`RuntimeBuilder::build`]. Registering twice fails with a
/// duplicate-operator error.
pub fn register_cpu_operators(runtime: &mut RuntimeBuilder) -> Result<()> {
    runtime.register_operator(
        DeviceType::CPU,
        fill::CONSTANT_FILL,
        builder(|ctx| Ok(Box::new(ConstantFillOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    runtime.register_operator(
        DeviceType::CPU,
        elementwise::COPY,
        builder(|ctx| Ok(Box::new(CopyOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    runtime.register_operator(
        DeviceType::CPU,
        elementwise::SCALE,
        builder(|ctx| Ok(Box::new(ScaleOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    runtime.register_operator(
        DeviceType::CPU,
        elementwise::SUM,
        builder(|ctx| Ok(Box::new(SumOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    for kind in [BinaryKind::Add, BinaryKind::Mul] {
        runtime.register_operator(
            DeviceType::CPU,
            kind.op_type(),
            builder(move |ctx| Ok(Box::new(BinaryOp::new(ctx, kind)?) as Box<dyn Operator>)),
        )?;
    }
    for kind in [UnaryKind::Tanh, UnaryKind::Sigmoid, UnaryKind::Relu] {
        runtime.register_operator(
            DeviceType::CPU,
            kind.op_type(),
            builder(move |ctx| Ok(Box::new(UnaryOp::new(ctx, kind)?) as Box<dyn Operator>)),
        )?;
    }

    for schema in schemas() {
        runtime.register_schema(schema);
    }
    debug!("registered reference cpu operators");
    Ok(())
}

fn schemas() -> Vec<OpSchema> {
    let mut schemas = vec![
        OpSchema::new(fill::CONSTANT_FILL)
            .inputs_between(0, 1)
            .num_outputs(1)
            .doc("Fills the output with `value`, shaped like the input or by the `shape` argument."),
        OpSchema::new(elementwise::COPY)
            .num_inputs(1)
            .num_outputs(1)
            .allow_inplace(0, 0)
            .doc("Copies the input tensor into the output."),
        OpSchema::new(elementwise::SCALE)
            .num_inputs(1)
            .num_outputs(1)
            .allow_inplace(0, 0)
            .doc("Multiplies every element by the `scale` argument."),
        OpSchema::new(elementwise::SUM)
            .inputs_between(1, usize::MAX)
            .num_outputs(1)
            .allow_inplace(0, 0)
            .doc("Element-wise sum of all inputs, which must share a shape."),
    ];
    for kind in [BinaryKind::Add, BinaryKind::Mul] {
        schemas.push(
            OpSchema::new(kind.op_type())
                .num_inputs(2)
                .num_outputs(1)
                .allow_inplace(0, 0)
                .allow_inplace(1, 0)
                .doc("Element-wise binary op. A one-element second input is broadcast."),
        );
    }
    for kind in [UnaryKind::Tanh, UnaryKind::Sigmoid, UnaryKind::Relu] {
        schemas.push(
            OpSchema::new(kind.op_type())
                .num_inputs(1)
                .num_outputs(1)
                .allow_inplace(0, 0),
        );
    }
    schemas
}
