//! Optional per-type structural validation of operator records.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, RuntimeError};
use crate::record::OperatorRecord;

/// Structural contract of one operator type.
///
/// Arity ranges are inclusive. An input/output pair listed as in-place may
/// share a blob name; an enforced pair must.
#[derive(Debug, Clone)]
pub struct OpSchema {
    op_type: String,
    min_inputs: usize,
    max_inputs: usize,
    min_outputs: usize,
    max_outputs: usize,
    allowed_inplace: Vec<(usize, usize)>,
    enforced_inplace: Vec<(usize, usize)>,
    cross_device: bool,
    private: bool,
    doc: String,
}

impl OpSchema {
    pub fn new(op_type: impl Into<String>) -> Self {
        OpSchema {
            op_type: op_type.into(),
            min_inputs: 0,
            max_inputs: usize::MAX,
            min_outputs: 0,
            max_outputs: usize::MAX,
            allowed_inplace: Vec::new(),
            enforced_inplace: Vec::new(),
            cross_device: false,
            private: false,
            doc: String::new(),
        }
    }

    /// Requires exactly `n` inputs.
    pub fn num_inputs(self, n: usize) -> Self {
        self.inputs_between(n, n)
    }

    /// Accepts between `min` and `max` inputs, inclusive.
    pub fn inputs_between(mut self, min: usize, max: usize) -> Self {
        self.min_inputs = min;
        self.max_inputs = max;
        self
    }

    /// Requires exactly `n` outputs.
    pub fn num_outputs(self, n: usize) -> Self {
        self.outputs_between(n, n)
    }

    /// Accepts between `min` and `max` outputs, inclusive.
    pub fn outputs_between(mut self, min: usize, max: usize) -> Self {
        self.min_outputs = min;
        self.max_outputs = max;
        self
    }

    /// Permits `output` to name the same blob as `input`.
    pub fn allow_inplace(mut self, input: usize, output: usize) -> Self {
        self.allowed_inplace.push((input, output));
        self
    }

    /// Requires `output` to name the same blob as `input`.
    pub fn enforce_inplace(mut self, input: usize, output: usize) -> Self {
        self.enforced_inplace.push((input, output));
        self
    }

    /// Marks the operator as accepting inputs that live on other devices.
    pub fn allows_cross_device(mut self) -> Self {
        self.cross_device = true;
        self
    }

    /// Marks the operator as internal; it is hidden from documentation listings.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs_allow_cross_device(&self) -> bool {
        self.cross_device
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn doc_string(&self) -> &str {
        &self.doc
    }

    fn violation(&self, detail: String) -> RuntimeError {
        RuntimeError::SchemaViolation {
            op_type: self.op_type.clone(),
            detail,
        }
    }

    /// Checks arity and in-place pairing of `record`.
    pub fn verify(&self, record: &OperatorRecord) -> Result<()> {
        let n_in = record.inputs.len();
        if n_in < self.min_inputs || n_in > self.max_inputs {
            return Err(self.violation(format!(
                "takes between {} and {} inputs, {n_in} given",
                self.min_inputs, self.max_inputs
            )));
        }
        let n_out = record.outputs.len();
        if n_out < self.min_outputs || n_out > self.max_outputs {
            return Err(self.violation(format!(
                "produces between {} and {} outputs, {n_out} given",
                self.min_outputs, self.max_outputs
            )));
        }

        for (i, input) in record.inputs.iter().enumerate() {
            for (o, output) in record.outputs.iter().enumerate() {
                if input != output {
                    continue;
                }
                let pair = (i, o);
                if !self.allowed_inplace.contains(&pair) && !self.enforced_inplace.contains(&pair) {
                    return Err(self.violation(format!(
                        "input {i} and output {o} share blob '{input}' but in-place is not allowed"
                    )));
                }
            }
        }

        for &(i, o) in &self.enforced_inplace {
            if let (Some(input), Some(output)) = (record.inputs.get(i), record.outputs.get(o)) {
                if input != output {
                    return Err(self.violation(format!(
                        "input {i} ('{input}') must be computed in place as output {o} ('{output}')"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, record: &OperatorRecord) -> bool {
        self.verify(record).is_ok()
    }
}

/// Schemas keyed by operator type name.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<OpSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `schema` under its operator type, replacing any earlier one.
    pub fn register(&mut self, schema: OpSchema) {
        let key = schema.op_type.clone();
        if self.schemas.insert(key.clone(), Arc::new(schema)).is_some() {
            warn!(op_type = %key, "replacing previously registered operator schema");
        }
    }

    /// Schema registered for `op_type`.
    pub fn get(&self, op_type: &str) -> Option<Arc<OpSchema>> {
        self.schemas.get(op_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
