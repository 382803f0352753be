//! Link, alias and recurrent-input descriptors plus the step-graph rewrite.

use std::collections::BTreeMap;

use crate::error::{Result, RuntimeError};
use crate::record::{DeviceOption, GraphRecord, OperatorRecord};

/// Operator type of the synthesized link-materialization step.
pub const APPLY_LINK_OP: &str = "rnn_internal_apply_link";

/// Maps an internal per-timestep blob onto `window` rows of an external
/// buffer, `offset` rows away from the current timestep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub internal: String,
    pub external: String,
    pub offset: i32,
    pub window: usize,
}

/// Post-run exposure of rows `offset..` of `src` under `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAlias {
    pub src: String,
    pub dst: String,
    pub offset: i32,
}

/// A recurrent state buffer and the operator input that initializes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrentInput {
    pub state: String,
    pub input: String,
}

fn mismatch(left: &str, right: &str, a: usize, b: usize) -> RuntimeError {
    RuntimeError::ArgumentMismatch(format!("{left} has {a} entries, {right} has {b}"))
}

/// Reads links from four parallel argument lists. Windows default to 1.
pub fn extract_links(
    record: &OperatorRecord,
    internal_arg: &str,
    external_arg: &str,
    offset_arg: &str,
    window_arg: &str,
) -> Result<Vec<Link>> {
    let internal: Vec<String> = record.repeated(internal_arg)?;
    let external: Vec<String> = record.repeated(external_arg)?;
    let offset: Vec<i32> = record.repeated(offset_arg)?;
    let window: Vec<i32> = record.repeated_or(window_arg, vec![1; offset.len()])?;

    if internal.len() != offset.len() {
        return Err(mismatch(internal_arg, offset_arg, internal.len(), offset.len()));
    }
    if external.len() != offset.len() {
        return Err(mismatch(external_arg, offset_arg, external.len(), offset.len()));
    }
    if external.len() != window.len() {
        return Err(mismatch(external_arg, window_arg, external.len(), window.len()));
    }

    internal
        .into_iter()
        .zip(external)
        .zip(offset)
        .zip(window)
        .map(|(((internal, external), offset), window)| {
            let window = usize::try_from(window)
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| {
                    RuntimeError::invalid_argument(
                        window_arg,
                        format!("window for link '{internal}' must be positive, got {window}"),
                    )
                })?;
            Ok(Link {
                internal,
                external,
                offset,
                window,
            })
        })
        .collect()
}

pub fn extract_aliases(record: &OperatorRecord) -> Result<Vec<OffsetAlias>> {
    let src: Vec<String> = record.repeated("alias_src")?;
    let dst: Vec<String> = record.repeated("alias_dst")?;
    let offset: Vec<i32> = record.repeated("alias_offset")?;
    if src.len() != offset.len() {
        return Err(mismatch("alias_src", "alias_offset", src.len(), offset.len()));
    }
    if dst.len() != offset.len() {
        return Err(mismatch("alias_dst", "alias_offset", dst.len(), offset.len()));
    }
    Ok(src
        .into_iter()
        .zip(dst)
        .zip(offset)
        .map(|((src, dst), offset)| OffsetAlias { src, dst, offset })
        .collect())
}

/// Pairs `recurrent_states` with the operator inputs named by `initial_recurrent_state_ids`.
pub fn extract_recurrent_inputs(record: &OperatorRecord) -> Result<Vec<RecurrentInput>> {
    let states: Vec<String> = record.repeated("recurrent_states")?;
    let ids: Vec<usize> = record.repeated("initial_recurrent_state_ids")?;
    if states.len() != ids.len() {
        return Err(mismatch(
            "recurrent_states",
            "initial_recurrent_state_ids",
            states.len(),
            ids.len(),
        ));
    }
    states
        .into_iter()
        .zip(ids)
        .map(|(state, id)| {
            let input = record.inputs.get(id).cloned().ok_or_else(|| {
                RuntimeError::invalid_argument(
                    "initial_recurrent_state_ids",
                    format!("input index {id} out of range for {} inputs", record.inputs.len()),
                )
            })?;
            Ok(RecurrentInput { state, input })
        })
        .collect()
}

/// Prepends one apply-link operator per link to `step`.
///
/// When the body's first use of a link's internal blob is as an output, that
/// operator gains a control input on the internal name so it stays ordered
/// after the link.
pub fn add_apply_link_ops(
    links: &[Link],
    timestep: &str,
    device: Option<DeviceOption>,
    step: &mut GraphRecord,
) {
    let mut link_ops = Vec::with_capacity(links.len());
    for link in links {
        let mut op = OperatorRecord::new(APPLY_LINK_OP)
            .input(timestep)
            .input(&link.external)
            .output(&link.internal)
            .output(&link.external)
            .arg("offset", link.offset)
            .arg("window", link.window as i64);
        op.device = device;

        let first_use = step
            .ops
            .iter_mut()
            .find(|body| body.has_input(&link.internal) || body.has_output(&link.internal));
        if let Some(body) = first_use {
            if !body.has_input(&link.internal) && !body.control_inputs.contains(&link.internal) {
                body.control_inputs.push(link.internal.clone());
            }
        }

        link_ops.push(op);
        step.external_inputs.push(link.internal.clone());
        step.external_inputs.push(link.external.clone());
    }
    link_ops.append(&mut step.ops);
    step.ops = link_ops;
}

/// Maps the internal name written at timestep `t` to the internal name that
/// reads the same external row at `t + 1`.
///
/// Links on the same external buffer pair up when their offsets differ by one:
/// forward pairs go from offset `o + 1` to `o`; `backward` reverses the order.
/// The order the links are listed in does not matter.
pub fn recurrent_mapping(links: &[Link], backward: bool) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for (i, reader) in links.iter().enumerate() {
        let writer_offset = if backward {
            reader.offset - 1
        } else {
            reader.offset + 1
        };
        if let Some((_, writer)) = links.iter().enumerate().find(|(j, l)| {
            *j != i && l.external == reader.external && l.offset == writer_offset
        }) {
            mapping.insert(writer.internal.clone(), reader.internal.clone());
        }
    }
    mapping
}
