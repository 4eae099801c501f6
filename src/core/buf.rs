//! # Shared I/O Buffers
//!
//! Buffers handed to the block-device layer stay owned by the submitting
//! subsystem until the completion fires. On a single core thread that
//! ownership is expressed as a shared handle with interior mutability: the
//! submitter keeps a clone, the in-flight request keeps another, and the
//! completion returns exclusive use to the submitter.
//!
//! A buffer is either plain heap memory or a file mapping (shared-memory
//! objects, pmem files).

use std::cell::RefCell;
use std::rc::Rc;

use memmap2::MmapMut;

/// Backing storage of a [`DmaBuffer`].
enum Storage {
    Heap(Vec<u8>),
    Mapped(MmapMut),
}

/// A byte buffer with block-device lifetime semantics.
pub struct DmaBuffer {
    storage: Storage,
}

impl DmaBuffer {
    /// Allocate a zeroed heap buffer of `len` bytes.
    pub fn alloc(len: usize) -> Self {
        DmaBuffer {
            storage: Storage::Heap(vec![0u8; len]),
        }
    }

    /// Wrap an existing mapping.
    pub fn from_mapping(map: MmapMut) -> Self {
        DmaBuffer {
            storage: Storage::Mapped(map),
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Heap(v) => v.len(),
            Storage::Mapped(m) => m.len(),
        }
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable view of the whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap(v) => v.as_slice(),
            Storage::Mapped(m) => &m[..],
        }
    }

    /// Mutable view of the whole buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Heap(v) => v.as_mut_slice(),
            Storage::Mapped(m) => &mut m[..],
        }
    }

    /// Fill the whole buffer with one byte value.
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// Flush a mapped byte range to its backing file. No-op on heap
    /// buffers.
    pub fn flush_range(&self, offset: usize, len: usize) -> std::io::Result<()> {
        match &self.storage {
            Storage::Heap(_) => Ok(()),
            Storage::Mapped(m) => m.flush_range(offset, len),
        }
    }

    /// Pointer and length of the underlying memory, for page locking.
    pub(crate) fn raw_parts(&self) -> (*const u8, usize) {
        let slice = self.as_slice();
        (slice.as_ptr(), slice.len())
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.storage {
            Storage::Heap(_) => "heap",
            Storage::Mapped(_) => "mapped",
        };
        write!(f, "DmaBuffer({}, {} bytes)", kind, self.len())
    }
}

/// Shared handle to a [`DmaBuffer`].
pub type SharedBuf = Rc<RefCell<DmaBuffer>>;

/// Allocate a zeroed shared heap buffer.
pub fn shared_buf(len: usize) -> SharedBuf {
    Rc::new(RefCell::new(DmaBuffer::alloc(len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_buffer_round_trip() {
        let buf = shared_buf(16);
        buf.borrow_mut().as_mut_slice()[3] = 0xAB;
        assert_eq!(buf.borrow().as_slice()[3], 0xAB);
        assert_eq!(buf.borrow().len(), 16);
    }

    #[test]
    fn test_fill() {
        let mut buf = DmaBuffer::alloc(8);
        buf.fill(0xFF);
        assert!(buf.as_slice().iter().all(|&b| b == 0xFF));
    }
}
