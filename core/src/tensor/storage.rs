//! Backing storage for chunk payloads.
//!
//! # What is Storage?
//!
//! A chunk owns one contiguous buffer. Depending on residency that buffer is
//! the whole chunk, this process's shard of it, or nothing at all. The
//! engine only needs two allocator operations:
//!
//! - `resize(n)`: grow or shrink the buffer. Growth is zero-initialized.
//! - `free()`: release everything. A zero-length storage means "released".

use crate::tensor::TensorElem;
use std::fmt::Debug;

/// A resizable, contiguous element buffer.
pub trait Storage<T>: Clone + Debug + Send + Sync {
    /// Returns the data as an immutable slice.
    fn as_slice(&self) -> &[T];

    /// Returns the data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Returns the number of elements in the storage.
    fn len(&self) -> usize;

    /// Returns `true` if the storage holds no elements (i.e. it is released).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resizes to `len` elements. New elements are zero.
    fn resize(&mut self, len: usize);

    /// Releases all elements.
    fn free(&mut self) {
        self.resize(0);
    }

    /// Copies data from a slice into the storage.
    ///
    /// # Arguments
    ///
    /// * `src` - The source slice to copy from. Must match `len()`.
    fn copy_from_slice(&mut self, src: &[T])
    where
        T: Copy,
    {
        self.as_mut_slice().copy_from_slice(src);
    }
}

/// Heap storage used for CPU chunks.
impl<T: TensorElem> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
    fn len(&self) -> usize {
        Vec::len(self)
    }
    fn resize(&mut self, len: usize) {
        if len == 0 {
            // Drop the allocation, not just the length.
            *self = Vec::new();
        } else {
            Vec::resize(self, len, T::zero());
        }
    }
}
