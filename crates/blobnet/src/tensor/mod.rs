//! Dense tensor value type stored inside blobs.
//!
//! The runtime never interprets numeric contents. It only needs to resize
//! tensors, reach their raw bytes, count elements, and build zero-copy views
//! along the leading (time) axis. Leaf kernels use the typed helpers on top.

mod dtype;
mod shape;
mod storage;

pub use dtype::{DType, Element};
pub use shape::Shape;
pub use storage::Storage;

use std::sync::Arc;

use crate::error::{Result, RuntimeError};

/// Dense tensor: a shape and dtype over a window of shared byte storage.
///
/// Cloning a `Tensor` produces a second handle onto the same storage, not a
/// copy. Use [`Tensor::deep_copy`] when an independent buffer is required.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    storage: Arc<Storage>,
    byte_offset: usize,
    time_origin: usize,
}

impl Tensor {
    /// Returns a zero-initialised tensor of the requested shape and dtype.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape = shape.into();
        let len = shape.num_elements() * dtype.size_in_bytes();
        Tensor {
            shape,
            dtype,
            storage: Storage::zeroed(len),
            byte_offset: 0,
            time_origin: 0,
        }
    }

    /// Constructs a tensor from typed values, validating the length against the shape.
    pub fn from_vec<T: Element>(shape: impl Into<Shape>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            return Err(RuntimeError::tensor(format!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        let width = T::DTYPE.size_in_bytes();
        let mut bytes = vec![0u8; data.len() * width];
        for (value, chunk) in data.iter().zip(bytes.chunks_exact_mut(width)) {
            value.write_le(chunk);
        }
        Ok(Tensor {
            shape,
            dtype: T::DTYPE,
            storage: Storage::from_bytes(bytes),
            byte_offset: 0,
            time_origin: 0,
        })
    }

    /// One-element tensor holding `value`.
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut bytes = vec![0u8; T::DTYPE.size_in_bytes()];
        value.write_le(&mut bytes);
        Tensor {
            shape: Shape::new([1]),
            dtype: T::DTYPE,
            storage: Storage::from_bytes(bytes),
            byte_offset: 0,
            time_origin: 0,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype.size_in_bytes()
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Number of leading rows that precede logical timestep zero.
    ///
    /// Recurrent state buffers store their initial state(s) in front of the
    /// per-timestep rows; links address rows relative to this origin.
    pub fn time_origin(&self) -> usize {
        self.time_origin
    }

    pub fn set_time_origin(&mut self, origin: usize) {
        self.time_origin = origin;
    }

    /// Elements in one slice of the leading axis.
    pub fn row_elements(&self) -> usize {
        self.shape.row_elements()
    }

    /// Resizes the tensor in place.
    ///
    /// When the byte size is unchanged the existing storage is kept, so a
    /// tensor that is a view into a larger buffer keeps writing through to it.
    /// Any other size allocates fresh zeroed storage and drops the sharing.
    pub fn resize(&mut self, shape: impl Into<Shape>, dtype: DType) {
        let shape = shape.into();
        let new_bytes = shape.num_elements() * dtype.size_in_bytes();
        if new_bytes != self.nbytes() {
            self.storage = Storage::zeroed(new_bytes);
            self.byte_offset = 0;
            self.time_origin = 0;
        }
        self.shape = shape;
        self.dtype = dtype;
    }

    /// Whether both tensors point into the same storage allocation.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Zero-copy view of `rows` consecutive slices starting at `start_row`.
    pub fn view_rows(&self, start_row: usize, rows: usize) -> Result<Tensor> {
        let total_rows = self.shape.dim(0).ok_or_else(|| {
            RuntimeError::tensor("cannot take row view of a rank-0 tensor")
        })?;
        if start_row + rows > total_rows {
            return Err(RuntimeError::tensor(format!(
                "row view [{start_row}, {}) out of bounds for leading dimension {total_rows}",
                start_row + rows
            )));
        }
        let row_bytes = self.row_elements() * self.dtype.size_in_bytes();
        Ok(Tensor {
            shape: self.shape.with_leading(rows),
            dtype: self.dtype,
            storage: Arc::clone(&self.storage),
            byte_offset: self.byte_offset + start_row * row_bytes,
            time_origin: 0,
        })
    }

    /// Independent copy of this tensor's bytes.
    pub fn deep_copy(&self) -> Tensor {
        let bytes = self.with_bytes(|bytes| bytes.to_vec());
        Tensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: Storage::from_bytes(bytes),
            byte_offset: 0,
            time_origin: self.time_origin,
        }
    }

    /// Runs `f` over the raw bytes covered by this tensor.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.storage.read();
        f(&guard[self.byte_offset..self.byte_offset + self.nbytes()])
    }

    /// Runs `f` over the raw bytes covered by this tensor, mutably.
    ///
    /// Writes are visible through every tensor sharing the storage.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.storage.write();
        let end = self.byte_offset + self.nbytes();
        f(&mut guard[self.byte_offset..end])
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if self.dtype != T::DTYPE {
            return Err(RuntimeError::tensor(format!(
                "tensor holds {} values, requested {}",
                self.dtype.name(),
                T::DTYPE.name()
            )));
        }
        Ok(())
    }

    /// Copies the elements out into a vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.read_elements(0, self.len())
    }

    /// Reads `count` elements starting at element index `start`.
    pub fn read_elements<T: Element>(&self, start: usize, count: usize) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        if start + count > self.len() {
            return Err(RuntimeError::tensor(format!(
                "read of {count} elements at {start} exceeds tensor size {}",
                self.len()
            )));
        }
        let width = T::DTYPE.size_in_bytes();
        Ok(self.with_bytes(|bytes| {
            bytes[start * width..(start + count) * width]
                .chunks_exact(width)
                .map(T::read_le)
                .collect()
        }))
    }

    /// Overwrites elements starting at element index `start`.
    pub fn write_elements<T: Element>(&self, start: usize, data: &[T]) -> Result<()> {
        self.check_dtype::<T>()?;
        if start + data.len() > self.len() {
            return Err(RuntimeError::tensor(format!(
                "write of {} elements at {start} exceeds tensor size {}",
                data.len(),
                self.len()
            )));
        }
        let width = T::DTYPE.size_in_bytes();
        self.with_bytes_mut(|bytes| {
            let region = &mut bytes[start * width..(start + data.len()) * width];
            for (value, chunk) in data.iter().zip(region.chunks_exact_mut(width)) {
                value.write_le(chunk);
            }
        });
        Ok(())
    }

    /// Overwrites every element; `data` must match the element count.
    pub fn copy_from_slice<T: Element>(&self, data: &[T]) -> Result<()> {
        if data.len() != self.len() {
            return Err(RuntimeError::tensor(format!(
                "source has {} elements, tensor has {}",
                data.len(),
                self.len()
            )));
        }
        self.write_elements(0, data)
    }

    /// Sets every element to `value`.
    pub fn fill<T: Element>(&self, value: T) -> Result<()> {
        self.check_dtype::<T>()?;
        let width = T::DTYPE.size_in_bytes();
        self.with_bytes_mut(|bytes| {
            for chunk in bytes.chunks_exact_mut(width) {
                value.write_le(chunk);
            }
        });
        Ok(())
    }

    /// Applies a unary function in place over every element.
    pub fn map_inplace<T, F>(&self, mut f: F) -> Result<()>
    where
        T: Element,
        F: FnMut(T) -> T,
    {
        self.check_dtype::<T>()?;
        let width = T::DTYPE.size_in_bytes();
        self.with_bytes_mut(|bytes| {
            for chunk in bytes.chunks_exact_mut(width) {
                f(T::read_le(chunk)).write_le(chunk);
            }
        });
        Ok(())
    }

    /// Reads a one-element tensor.
    pub fn scalar_value<T: Element>(&self) -> Result<T> {
        if self.len() != 1 {
            return Err(RuntimeError::tensor(format!(
                "expected a single element, tensor has {}",
                self.len()
            )));
        }
        Ok(self.read_elements::<T>(0, 1)?[0])
    }
}
