//! Shared byte storage backing tensors and zero-copy views.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reference-counted byte buffer.
///
/// Several tensors may point into the same storage at different byte offsets;
/// that is how link views and output aliases avoid copying.
pub struct Storage {
    bytes: RwLock<Vec<u8>>,
}

impl Storage {
    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Storage {
            bytes: RwLock::new(vec![0u8; len]),
        })
    }

    /// Wraps an existing byte vector.
    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Storage {
            bytes: RwLock::new(bytes),
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read().expect("tensor storage poisoned")
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write().expect("tensor storage poisoned")
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes.try_read() {
            Ok(bytes) => f.debug_struct("Storage").field("len", &bytes.len()).finish(),
            Err(_) => f.debug_struct("Storage").finish_non_exhaustive(),
        }
    }
}
