//! Named, type-erased value containers owned by scopes.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{Result, RuntimeError};
use crate::tensor::{DType, Shape, Tensor};

/// Shared handle to a blob. Operators keep these from construction onward.
pub type BlobRef = Arc<Blob>;

/// The single value a blob holds.
#[derive(Clone, Default)]
pub enum BlobValue {
    /// Freshly created, nothing written yet.
    #[default]
    Empty,
    /// Dense numeric tensor.
    Tensor(Tensor),
    /// Any other runtime state (for example a pool of step scopes).
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl BlobValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            BlobValue::Empty => "empty",
            BlobValue::Tensor(_) => "tensor",
            BlobValue::Opaque(_) => "opaque",
        }
    }
}

impl fmt::Debug for BlobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobValue::Empty => f.write_str("Empty"),
            BlobValue::Tensor(tensor) => f
                .debug_struct("Tensor")
                .field("dims", &tensor.dims())
                .field("dtype", &tensor.dtype())
                .finish(),
            BlobValue::Opaque(_) => f.write_str("Opaque"),
        }
    }
}

/// Mutable container holding exactly one [`BlobValue`]. Writes overwrite in place.
#[derive(Default)]
pub struct Blob {
    value: RwLock<BlobValue>,
}

impl Blob {
    pub fn new() -> BlobRef {
        Arc::new(Blob::default())
    }

    pub fn with_tensor(tensor: Tensor) -> BlobRef {
        Arc::new(Blob {
            value: RwLock::new(BlobValue::Tensor(tensor)),
        })
    }

    /// Snapshot of the stored value. Tensors are returned as handles onto the same storage.
    pub fn value(&self) -> BlobValue {
        self.value.read().expect("blob poisoned").clone()
    }

    pub fn type_name(&self) -> &'static str {
        self.value.read().expect("blob poisoned").type_name()
    }

    pub fn is_empty(&self) -> bool {
        matches!(*self.value.read().expect("blob poisoned"), BlobValue::Empty)
    }

    pub fn is_tensor(&self) -> bool {
        matches!(*self.value.read().expect("blob poisoned"), BlobValue::Tensor(_))
    }

    /// Dtype and shape of a tensor payload, for untyped introspection.
    pub fn tensor_meta(&self) -> Option<(DType, Shape)> {
        match &*self.value.read().expect("blob poisoned") {
            BlobValue::Tensor(tensor) => Some((tensor.dtype(), tensor.shape().clone())),
            _ => None,
        }
    }

    /// Handle onto the stored tensor, if the blob holds one.
    pub fn tensor(&self) -> Option<Tensor> {
        match &*self.value.read().expect("blob poisoned") {
            BlobValue::Tensor(tensor) => Some(tensor.clone()),
            _ => None,
        }
    }

    /// Like [`Blob::tensor`], but a missing tensor is an error naming `name`.
    pub fn require_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensor().ok_or_else(|| RuntimeError::TypeMismatch {
            blob: name.to_string(),
            reason: format!("expected a tensor, found {}", self.type_name()),
        })
    }

    /// Replaces the stored value with `tensor`.
    pub fn set_tensor(&self, tensor: Tensor) {
        *self.value.write().expect("blob poisoned") = BlobValue::Tensor(tensor);
    }

    /// Ensures the blob holds a tensor of `shape`/`dtype` and returns a handle to it.
    ///
    /// An existing tensor is resized in place, which keeps its storage when the
    /// byte size is unchanged. Kernels write outputs through the returned handle.
    pub fn resize_tensor(&self, shape: impl Into<Shape>, dtype: DType) -> Tensor {
        let shape = shape.into();
        let mut guard = self.value.write().expect("blob poisoned");
        match &mut *guard {
            BlobValue::Tensor(tensor) => {
                tensor.resize(shape, dtype);
                tensor.clone()
            }
            other => {
                let tensor = Tensor::zeros(shape, dtype);
                *other = BlobValue::Tensor(tensor.clone());
                tensor
            }
        }
    }

    /// Runs `f` with mutable access to the stored tensor.
    pub fn update_tensor<R>(&self, name: &str, f: impl FnOnce(&mut Tensor) -> R) -> Result<R> {
        let mut guard = self.value.write().expect("blob poisoned");
        match &mut *guard {
            BlobValue::Tensor(tensor) => Ok(f(tensor)),
            other => Err(RuntimeError::TypeMismatch {
                blob: name.to_string(),
                reason: format!("expected a tensor, found {}", other.type_name()),
            }),
        }
    }

    pub fn set_opaque<T: Any + Send + Sync>(&self, value: Arc<T>) {
        *self.value.write().expect("blob poisoned") = BlobValue::Opaque(value);
    }

    /// Downcasts an opaque payload to `T`.
    pub fn opaque<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &*self.value.read().expect("blob poisoned") {
            BlobValue::Opaque(value) => Arc::clone(value).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Returns the opaque `T`, installing `init()` first when the blob holds anything else.
    pub fn get_or_init_opaque<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut guard = self.value.write().expect("blob poisoned");
        if let BlobValue::Opaque(value) = &*guard {
            if let Ok(existing) = Arc::clone(value).downcast::<T>() {
                return existing;
            }
        }
        let created = Arc::new(init());
        *guard = BlobValue::Opaque(Arc::clone(&created) as Arc<dyn Any + Send + Sync>);
        created
    }

    /// Drops the payload, returning the blob to the empty state.
    pub fn reset(&self) {
        *self.value.write().expect("blob poisoned") = BlobValue::Empty;
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.try_read() {
            Ok(value) => f.debug_tuple("Blob").field(&*value).finish(),
            Err(_) => f.debug_tuple("Blob").field(&"<locked>").finish(),
        }
    }
}
