//! Memory blocks and the allocator collaborator
//!
//! The component never interprets payload bytes. A `MemoryBlock` is what the
//! codec driver reads from and writes into; in Share mode it is the client's
//! own block, in Copy mode it comes from a per-port codec pool.

use crate::utils::error::{CodecError, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a memory block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(pub u64);

/// Allocate a fresh memory identity
pub fn next_memory_id() -> MemoryId {
    MemoryId(NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed))
}

/// Kind of memory requested from the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Ordinary process memory
    System,

    /// Physically contiguous memory the codec can DMA into
    Contiguous,

    /// Protected memory for secure playback
    Secure,
}

/// Shared handle to a memory block
pub type MemoryRef = Arc<MemoryBlock>;

/// A fixed-size byte region
pub struct MemoryBlock {
    id: MemoryId,
    kind: MemoryKind,
    capacity: usize,
    data: Mutex<Vec<u8>>,
}

impl MemoryBlock {
    /// Zero-filled block of `capacity` bytes
    pub fn new(id: MemoryId, kind: MemoryKind, capacity: usize) -> Self {
        Self {
            id,
            kind,
            capacity,
            data: Mutex::new(vec![0; capacity]),
        }
    }

    /// Wrap existing client memory; capacity is the vector length
    pub fn from_vec(id: MemoryId, kind: MemoryKind, data: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            capacity: data.len(),
            data: Mutex::new(data),
        }
    }

    /// Block identity
    pub fn id(&self) -> MemoryId {
        self.id
    }

    /// Memory kind
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Direct access to the bytes
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    /// Copy `src` to `offset`, truncating at the end of the block.
    ///
    /// Returns the number of bytes written.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = src.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }

    /// Copy of `len` bytes starting at `offset`, clamped to the block
    pub fn read_range(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        let start = offset.min(data.len());
        let end = offset.saturating_add(len).min(data.len());
        data[start..end].to_vec()
    }

    /// Copy `len` bytes from `src[src_offset..]` into the start of this block.
    ///
    /// Returns the number of bytes copied.
    pub fn copy_from(&self, src: &MemoryBlock, src_offset: usize, len: usize) -> usize {
        let bytes = src.read_range(src_offset, len);
        self.write_at(0, &bytes)
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Memory allocator collaborator
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes of the given kind
    fn alloc(&self, size: usize, kind: MemoryKind) -> Result<MemoryRef>;

    /// Release a block previously returned by `alloc`
    fn free(&self, block: &MemoryRef) -> Result<()>;
}

/// Heap-backed allocator with an optional byte budget
#[derive(Debug, Default)]
pub struct HeapAllocator {
    budget: Option<usize>,
    in_use: AtomicUsize,
    live_blocks: AtomicUsize,
}

impl HeapAllocator {
    /// Unlimited allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses to hand out more than `bytes` at once
    pub fn with_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            ..Self::default()
        }
    }

    /// Bytes currently allocated
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Blocks currently allocated
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::SeqCst)
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize, kind: MemoryKind) -> Result<MemoryRef> {
        if size == 0 {
            return Err(CodecError::BadParameter("cannot allocate zero bytes".to_string()));
        }

        let previous = self.in_use.fetch_add(size, Ordering::SeqCst);
        if let Some(budget) = self.budget {
            if previous + size > budget {
                self.in_use.fetch_sub(size, Ordering::SeqCst);
                return Err(CodecError::InsufficientResources(format!(
                    "allocation of {} bytes exceeds budget ({} of {} in use)",
                    size, previous, budget
                )));
            }
        }

        self.live_blocks.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryBlock::new(next_memory_id(), kind, size)))
    }

    fn free(&self, block: &MemoryRef) -> Result<()> {
        let size = block.capacity();
        let updated = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| used.checked_sub(size));
        if updated.is_err() {
            return Err(CodecError::InvalidBuffer(format!(
                "block {:?} was not allocated here",
                block.id()
            )));
        }
        self.live_blocks.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
