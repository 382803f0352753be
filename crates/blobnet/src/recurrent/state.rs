//! Recurrent state buffers, output aliases and the timestep blob.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};
use crate::scope::Scope;
use crate::tensor::{Shape, Tensor};

use super::link::{OffsetAlias, RecurrentInput};

/// Sizes `input.state` to `(seq_len + L) x batch x state` and copies the
/// initial state(s) into its first `L` rows.
///
/// `L` is the leading dimension of a 3-D initializer and 1 otherwise. A 1-D
/// initializer is replicated across the batch. The buffer's time origin is
/// set to `L` so links address logical timestep zero at row `L`.
pub fn initialize_recurrent_input(
    input: &RecurrentInput,
    seq_len: usize,
    batch: usize,
    scope: &Scope,
) -> Result<()> {
    let state_blob = scope
        .get_blob(&input.state)
        .ok_or_else(|| RuntimeError::MissingBlob(input.state.clone()))?;
    let init = scope
        .get_blob(&input.input)
        .ok_or_else(|| RuntimeError::MissingBlob(input.input.clone()))?
        .require_tensor(&input.input)?;

    let dims = init.dims().to_vec();
    if dims.is_empty() || dims.len() > 3 {
        return Err(RuntimeError::TypeMismatch {
            blob: input.input.clone(),
            reason: format!("initial state must have 1 to 3 dimensions, got {dims:?}"),
        });
    }
    let state_size = dims[dims.len() - 1];
    let initial_len = if dims.len() == 3 { dims[0] } else { 1 };
    if dims.len() >= 2 && dims[dims.len() - 2] != batch {
        return Err(RuntimeError::TypeMismatch {
            blob: input.input.clone(),
            reason: format!(
                "initial state batch dimension {} does not match input batch {batch}",
                dims[dims.len() - 2]
            ),
        });
    }

    let row_bytes = batch * state_size * init.dtype().size_in_bytes();
    let init_bytes = init.with_bytes(|bytes| bytes.to_vec());
    let state = state_blob.resize_tensor(
        Shape::new([seq_len + initial_len, batch, state_size]),
        init.dtype(),
    );
    state_blob.update_tensor(&input.state, |tensor| tensor.set_time_origin(initial_len))?;

    state.with_bytes_mut(|bytes| {
        if dims.len() >= 2 {
            bytes[..row_bytes * initial_len].copy_from_slice(&init_bytes);
        } else {
            for chunk in bytes[..row_bytes].chunks_exact_mut(init_bytes.len().max(1)) {
                chunk.copy_from_slice(&init_bytes);
            }
        }
    });
    trace!(
        state = %input.state,
        rows = seq_len + initial_len,
        batch,
        state_size,
        "initialized recurrent state"
    );
    Ok(())
}

/// Exposes rows `[start, rows)` of `alias.src` as `alias.dst` without copying.
///
/// A negative offset counts from the end of the source.
pub fn apply_offset_alias(alias: &OffsetAlias, scope: &Scope) -> Result<Tensor> {
    debug!(src = %alias.src, dst = %alias.dst, offset = alias.offset, "aliasing");
    let src = scope
        .get_blob(&alias.src)
        .ok_or_else(|| RuntimeError::MissingBlob(alias.src.clone()))?
        .require_tensor(&alias.src)?;
    let rows = src
        .shape()
        .dim(0)
        .ok_or_else(|| RuntimeError::tensor(format!("cannot alias rank-0 tensor '{}'", alias.src)))?
        as i64;
    let offset = i64::from(alias.offset);
    let start = if offset >= 0 { offset } else { rows + offset };
    let count = rows - start;
    if start < 0 || count < 1 {
        return Err(RuntimeError::tensor(format!(
            "invalid number of timesteps ({count}) aliasing '{}' at offset {}",
            alias.src, alias.offset
        )));
    }
    let view = src.view_rows(start as usize, count as usize)?;
    scope.create_blob(&alias.dst).set_tensor(view.clone());
    Ok(view)
}

/// Sets the scope-local timestep blob to a one-element `i32` tensor holding `t`.
pub fn update_timestep_blob(scope: &Arc<Scope>, name: &str, t: usize) -> Result<()> {
    let value = i32::try_from(t)
        .map_err(|_| RuntimeError::invalid_argument(name, format!("timestep {t} overflows i32")))?;
    let blob = scope.create_local_blob(name);
    let tensor = blob.resize_tensor([1], crate::tensor::DType::I32);
    tensor.write_elements(0, &[value])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn scope() -> Arc<Scope> {
        Runtime::new_default().unwrap().root_scope()
    }

    #[test]
    fn one_dimensional_initializer_is_broadcast() {
        let scope = scope();
        scope
            .create_blob("h0")
            .set_tensor(Tensor::from_vec([2], vec![1.0f32, 2.0]).unwrap());
        scope.create_blob("H");
        let input = RecurrentInput {
            state: "H".into(),
            input: "h0".into(),
        };
        initialize_recurrent_input(&input, 3, 2, &scope).unwrap();
        let state = scope.get_blob("H").unwrap().tensor().unwrap();
        assert_eq!(state.dims(), &[4, 2, 2]);
        assert_eq!(state.time_origin(), 1);
        assert_eq!(state.read_elements::<f32>(0, 4).unwrap(), vec![1.0, 2.0, 1.0, 2.0]);
        assert_eq!(state.read_elements::<f32>(4, 4).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn three_dimensional_initializer_sets_origin() {
        let scope = scope();
        scope
            .create_blob("h0")
            .set_tensor(Tensor::from_vec([2, 1, 1], vec![5.0f32, 6.0]).unwrap());
        scope.create_blob("H");
        let input = RecurrentInput {
            state: "H".into(),
            input: "h0".into(),
        };
        initialize_recurrent_input(&input, 3, 1, &scope).unwrap();
        let state = scope.get_blob("H").unwrap().tensor().unwrap();
        assert_eq!(state.dims(), &[5, 1, 1]);
        assert_eq!(state.time_origin(), 2);
        assert_eq!(state.read_elements::<f32>(0, 2).unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn batch_mismatch_is_rejected() {
        let scope = scope();
        scope
            .create_blob("h0")
            .set_tensor(Tensor::zeros([3, 4], crate::tensor::DType::F32));
        scope.create_blob("H");
        let input = RecurrentInput {
            state: "H".into(),
            input: "h0".into(),
        };
        assert!(initialize_recurrent_input(&input, 2, 2, &scope).is_err());
    }

    #[test]
    fn negative_alias_offset_counts_from_end() {
        let scope = scope();
        scope
            .create_blob("H")
            .set_tensor(Tensor::from_vec([3, 1], vec![1i32, 2, 3]).unwrap());
        let alias = OffsetAlias {
            src: "H".into(),
            dst: "last".into(),
            offset: -1,
        };
        let view = apply_offset_alias(&alias, &scope).unwrap();
        assert_eq!(view.to_vec::<i32>().unwrap(), vec![3]);
        let too_far = OffsetAlias {
            offset: 3,
            ..alias
        };
        assert!(apply_offset_alias(&too_far, &scope).is_err());
    }

    #[test]
    fn timestep_blob_is_local() {
        let root = scope();
        root.create_blob("timestep");
        let child = Scope::new_child(&root);
        update_timestep_blob(&child, "timestep", 4).unwrap();
        let local = child.get_blob("timestep").unwrap().tensor().unwrap();
        assert_eq!(local.scalar_value::<i32>().unwrap(), 4);
        assert!(root.get_blob("timestep").unwrap().is_empty());
    }
}
