//! Recurrent execution of a step graph over a leading time dimension.
//!
//! A [`network::RecurrentNetworkOp`] rewrites its step graph so that every
//! [`link::Link`] is materialized by an apply-link operator at the start of
//! each timestep, runs the step graph in a per-timestep child scope (plainly
//! or through the [`executor::RecurrentExecutor`]), and finally exposes state
//! windows through zero-copy aliases.

pub mod apply_link;
pub mod executor;
pub mod gradient;
pub mod link;
pub mod network;
pub mod state;

pub use apply_link::ApplyLinkOp;
pub use executor::RecurrentExecutor;
pub use gradient::{AccumulateInputGradientOp, ACCUMULATE_INPUT_GRADIENT_OP};
pub use link::{Link, OffsetAlias, RecurrentInput, APPLY_LINK_OP};
pub use network::{RecurrentNetworkOp, RunPhase, StepScopes, RECURRENT_NETWORK_OP};

use crate::error::Result;
use crate::operator::{builder, Operator};
use crate::record::DeviceType;
use crate::runtime::RuntimeBuilder;

/// Registers the recurrent operators and their schemas on the CPU device.
pub(crate) fn register_operators(runtime: &mut RuntimeBuilder) -> Result<()> {
    runtime.register_operator(
        DeviceType::CPU,
        RECURRENT_NETWORK_OP,
        builder(|ctx| Ok(Box::new(RecurrentNetworkOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    runtime.register_operator(
        DeviceType::CPU,
        APPLY_LINK_OP,
        builder(|ctx| Ok(Box::new(ApplyLinkOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    runtime.register_operator(
        DeviceType::CPU,
        ACCUMULATE_INPUT_GRADIENT_OP,
        builder(|ctx| Ok(Box::new(AccumulateInputGradientOp::new(ctx)?) as Box<dyn Operator>)),
    )?;
    runtime
        .register_schema(network::schema())
        .register_schema(apply_link::schema())
        .register_schema(gradient::schema());
    Ok(())
}
