//! In-flight staging slot of a pipeline stage

use super::{BufferFlags, BufferMark, BufferRef, MemoryRef};

/// Work currently held by a stage.
///
/// Each port has two of these ("in way" and "out way"), each behind its own
/// mutex. A stage only pops a message or hands memory to the driver while it
/// holds the corresponding lock, so a flush that takes both locks sees a
/// consistent picture.
#[derive(Debug, Default)]
pub struct DataBuffer {
    /// Client buffer being consumed or filled
    pub buffer: Option<BufferRef>,

    /// Codec pool block held in Copy mode
    pub codec_buffer: Option<MemoryRef>,

    /// Capacity of the held memory
    pub alloc_size: usize,

    /// Payload length
    pub data_len: usize,

    /// Bytes already handed on
    pub used_data_len: usize,

    /// Bytes still to hand on
    pub remain_data_len: usize,

    /// Start of the payload within the client memory
    pub offset: usize,

    /// True while the slot holds work
    pub valid: bool,

    /// Timestamp of the held work
    pub timestamp: i64,

    /// Flags of the held work
    pub flags: BufferFlags,

    /// Mark travelling with the held work
    pub mark: Option<BufferMark>,
}

impl DataBuffer {
    /// Empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a client buffer, snapshotting its metadata
    pub fn load_client(&mut self, buffer: BufferRef) {
        let meta = buffer.meta();
        self.alloc_size = buffer.alloc_len();
        self.data_len = meta.filled_len;
        self.used_data_len = 0;
        self.remain_data_len = meta.filled_len;
        self.offset = meta.offset;
        self.timestamp = meta.timestamp;
        self.flags = meta.flags;
        self.mark = buffer.take_mark();
        self.buffer = Some(buffer);
        self.valid = true;
    }

    /// Stage a codec result waiting for a client buffer
    pub fn load_codec(
        &mut self,
        block: MemoryRef,
        len: usize,
        timestamp: i64,
        flags: BufferFlags,
        mark: Option<BufferMark>,
    ) {
        self.alloc_size = block.capacity();
        self.data_len = len;
        self.used_data_len = 0;
        self.remain_data_len = len;
        self.offset = 0;
        self.timestamp = timestamp;
        self.flags = flags;
        self.mark = mark;
        self.codec_buffer = Some(block);
        self.valid = true;
    }

    /// Record that `n` bytes were handed on
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.remain_data_len);
        self.used_data_len += n;
        self.remain_data_len -= n;
    }

    /// Read position of the next unconsumed byte in the client memory
    pub fn read_position(&self) -> usize {
        self.offset + self.used_data_len
    }

    /// Clear the slot
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
