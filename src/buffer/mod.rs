//! Client-facing buffer handles and the per-port bookkeeping around them
//!
//! A `BufferHeader` is created once at registration and shared by `Arc`
//! between the client and the component. Which side may touch it at any
//! moment is decided by the port's `BufferOwnershipTable`, never by the
//! header itself.

mod data_buffer;
mod memory;
mod ownership;
mod queue;

pub use data_buffer::DataBuffer;
pub use memory::{next_memory_id, Allocator, HeapAllocator, MemoryBlock, MemoryId, MemoryKind, MemoryRef};
pub use ownership::BufferOwnershipTable;
pub use queue::{BoundedQueue, CodecBufferQueue, MessageKind, PipelineMessage, PortQueue};

use crate::component::ComponentId;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Flags carried by a buffer between client and codec.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const EOS = 0x0001;
        /// First buffer after a seek; carries the start time.
        const START_TIME = 0x0002;
        /// Decode but do not render.
        const DECODE_ONLY = 0x0004;
        /// Payload is known to be corrupted.
        const DATA_CORRUPT = 0x0008;
        /// Buffer ends a complete frame.
        const END_OF_FRAME = 0x0010;
        /// Frame is a sync (I/IDR) frame.
        const SYNC_FRAME = 0x0020;
        /// Buffer carries extra data after the payload.
        const EXTRA_DATA = 0x0040;
        /// Codec configuration data (headers) only.
        const CODEC_CONFIG = 0x0080;
    }
}

/// Direction of a port and of every buffer bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Bitstream (decoder) or raw frames (encoder) flowing into the codec
    Input,

    /// Codec results flowing back to the client
    Output,
}

impl Direction {
    /// Port index this direction is bound to
    pub fn port_index(self) -> usize {
        match self {
            Direction::Input => crate::port::INPUT_PORT_INDEX,
            Direction::Output => crate::port::OUTPUT_PORT_INDEX,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Unique identity of a registered buffer within one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque token that rides along with a buffer and fires an event when it
/// reaches its target component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMark {
    /// Component that raises the mark event
    pub target: ComponentId,

    /// Client data echoed in the event
    pub data: u64,
}

/// Mutable metadata of a buffer
#[derive(Debug, Clone, Default)]
pub struct BufferMeta {
    /// Number of valid payload bytes
    pub filled_len: usize,

    /// Start of the payload within the memory block
    pub offset: usize,

    /// Presentation timestamp in microseconds
    pub timestamp: i64,

    /// Buffer flags
    pub flags: BufferFlags,

    /// Pending mark, if any
    pub mark: Option<BufferMark>,
}

/// Shared buffer handle
pub type BufferRef = Arc<BufferHeader>;

/// A client buffer registered on one port
pub struct BufferHeader {
    id: BufferId,
    owner: ComponentId,
    port_index: usize,
    direction: Direction,
    slot: usize,
    memory: MemoryRef,
    allocated_by_component: bool,
    meta: Mutex<BufferMeta>,
}

impl BufferHeader {
    pub(crate) fn new(
        id: BufferId,
        owner: ComponentId,
        direction: Direction,
        slot: usize,
        memory: MemoryRef,
        allocated_by_component: bool,
    ) -> Self {
        Self {
            id,
            owner,
            port_index: direction.port_index(),
            direction,
            slot,
            memory,
            allocated_by_component,
            meta: Mutex::new(BufferMeta::default()),
        }
    }

    /// Buffer identity
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Component the buffer was registered with
    pub fn owner(&self) -> ComponentId {
        self.owner
    }

    /// Port the buffer is bound to
    pub fn port_index(&self) -> usize {
        self.port_index
    }

    /// Direction of the bound port
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index in the port's ownership table
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Backing memory
    pub fn memory(&self) -> &MemoryRef {
        &self.memory
    }

    /// Allocated size in bytes
    pub fn alloc_len(&self) -> usize {
        self.memory.capacity()
    }

    /// True if the memory came from the component allocator
    pub fn allocated_by_component(&self) -> bool {
        self.allocated_by_component
    }

    /// Copy of the current metadata
    pub fn meta(&self) -> BufferMeta {
        self.meta.lock().clone()
    }

    /// Number of valid payload bytes
    pub fn filled_len(&self) -> usize {
        self.meta.lock().filled_len
    }

    /// Presentation timestamp in microseconds
    pub fn timestamp(&self) -> i64 {
        self.meta.lock().timestamp
    }

    /// Buffer flags
    pub fn flags(&self) -> BufferFlags {
        self.meta.lock().flags
    }

    /// Pending mark
    pub fn mark(&self) -> Option<BufferMark> {
        self.meta.lock().mark
    }

    /// Replace the payload with `data`, resetting the offset.
    ///
    /// Only meaningful while the client owns the buffer.
    pub fn write(&self, data: &[u8]) -> crate::utils::Result<()> {
        if data.len() > self.alloc_len() {
            return Err(crate::utils::CodecError::BadParameter(format!(
                "payload of {} bytes exceeds buffer {} of {} bytes",
                data.len(),
                self.id,
                self.alloc_len()
            )));
        }
        self.memory.write_at(0, data);
        let mut meta = self.meta.lock();
        meta.filled_len = data.len();
        meta.offset = 0;
        Ok(())
    }

    /// Copy of the valid payload bytes
    pub fn read(&self) -> Vec<u8> {
        let meta = self.meta.lock();
        self.memory.read_range(meta.offset, meta.filled_len)
    }

    /// Set the presentation timestamp
    pub fn set_timestamp(&self, timestamp: i64) {
        self.meta.lock().timestamp = timestamp;
    }

    /// Set the buffer flags
    pub fn set_flags(&self, flags: BufferFlags) {
        self.meta.lock().flags = flags;
    }

    /// Attach a mark
    pub fn set_mark(&self, mark: Option<BufferMark>) {
        self.meta.lock().mark = mark;
    }

    /// Attach `mark` unless one is already present
    pub(crate) fn attach_mark_if_empty(&self, mark: BufferMark) -> bool {
        let mut meta = self.meta.lock();
        if meta.mark.is_none() {
            meta.mark = Some(mark);
            true
        } else {
            false
        }
    }

    /// Detach the mark
    pub(crate) fn take_mark(&self) -> Option<BufferMark> {
        self.meta.lock().mark.take()
    }

    /// Detach the mark only if it targets `component`
    pub(crate) fn take_mark_for(&self, component: ComponentId) -> Option<BufferMark> {
        let mut meta = self.meta.lock();
        match meta.mark {
            Some(mark) if mark.target == component => meta.mark.take(),
            _ => None,
        }
    }

    /// Mark the payload empty before handing the buffer back unfilled
    pub(crate) fn clear_payload(&self) {
        let mut meta = self.meta.lock();
        meta.filled_len = 0;
        meta.offset = 0;
        meta.flags = BufferFlags::empty();
    }

    /// Record a codec result in the header
    pub(crate) fn set_output(&self, len: usize, timestamp: i64, flags: BufferFlags, mark: Option<BufferMark>) {
        let mut meta = self.meta.lock();
        meta.filled_len = len;
        meta.offset = 0;
        meta.timestamp = timestamp;
        meta.flags = flags;
        if mark.is_some() {
            meta.mark = mark;
        }
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("slot", &self.slot)
            .field("alloc_len", &self.alloc_len())
            .field("meta", &*self.meta.lock())
            .finish()
    }
}
