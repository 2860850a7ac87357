//! Port state and per-port synchronization
//!
//! A component has exactly two ports. Each `Port` owns everything the
//! pipeline stages for that direction synchronize on: the submit queue, the
//! codec pool queue, the two DataBuffer slots and the pause/enable/resource
//! signals.

mod definition;

pub use definition::{PortDefinition, ProcessType};

use crate::buffer::{
    Allocator, BufferOwnershipTable, BufferRef, CodecBufferQueue, DataBuffer, Direction, MemoryId,
    MemoryKind, MemoryRef, PortQueue,
};
use crate::buffer::BufferMark;
use crate::codec::PortFormat;
use crate::utils::config::PortConfig;
use crate::utils::error::{CodecError, Result};
use crate::utils::signal::{Event, Semaphore};
use log::{debug, warn};
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Index of the input port
pub const INPUT_PORT_INDEX: usize = 0;

/// Index of the output port
pub const OUTPUT_PORT_INDEX: usize = 1;

/// Number of ports on a component
pub const PORT_COUNT: usize = 2;

/// State of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Loaded,
    Idle,
    Executing,
    Pause,
    WaitForResources,
    /// Waiting for the client to register buffers
    Enabling,
    /// Waiting for the client to free buffers
    Disabling,
    /// Returning every buffer to the client
    Flushing,
    /// Flush issued as the first step of a disable
    FlushingForDisable,
    Invalid,
}

impl PortState {
    /// True while a flush runs on the port
    pub fn is_flushing(self) -> bool {
        matches!(self, PortState::Flushing | PortState::FlushingForDisable)
    }

    /// True while an enable or disable is in progress
    pub fn is_transitioning(self) -> bool {
        matches!(self, PortState::Enabling | PortState::Disabling | PortState::FlushingForDisable)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Exceptional condition layered on top of the port state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionFlag {
    /// Nothing unusual
    #[default]
    General,

    /// Output layout changed; the client must disable and re-enable the port
    NeedDisable,

    /// A flush is required before work continues
    NeedFlush,

    /// The port is unusable
    Invalid,
}

#[derive(Debug)]
struct PortStatus {
    state: PortState,
    exception: ExceptionFlag,
    definition: PortDefinition,
    pending_mark: Option<BufferMark>,
}

/// One input or output port
pub struct Port {
    index: usize,
    direction: Direction,
    status: Mutex<PortStatus>,
    ownership: Mutex<BufferOwnershipTable>,
    codec_pool: Mutex<Vec<MemoryRef>>,

    /// Held by a submit across its state check, acquire and push, and by a
    /// flush while it enters the Flushing state
    pub submission: Mutex<()>,

    /// Client buffers submitted to this port
    pub queue: PortQueue,

    /// Free codec pool blocks in Copy mode
    pub codec_queue: CodecBufferQueue,

    /// Staging slot of the stage feeding the codec
    pub in_way: Mutex<DataBuffer>,

    /// Staging slot of the stage draining the codec
    pub out_way: Mutex<DataBuffer>,

    /// Signalled whenever the component state changes
    pub pause_event: Event,

    /// Signalled whenever the port's running condition changes
    pub enable_event: Event,

    /// Posted when the port becomes populated
    pub loaded_resource: Semaphore,

    /// Posted when the last buffer is freed
    pub unloaded_resource: Semaphore,
}

impl Port {
    /// Build a port from its configuration
    pub fn new(direction: Direction, config: &PortConfig) -> Self {
        let definition = PortDefinition::from_config(direction, config);
        Self {
            index: direction.port_index(),
            direction,
            ownership: Mutex::new(BufferOwnershipTable::new(definition.buffer_count)),
            codec_pool: Mutex::new(Vec::new()),
            submission: Mutex::new(()),
            queue: PortQueue::new(definition.buffer_count),
            codec_queue: CodecBufferQueue::new(definition.codec_buffer_count),
            status: Mutex::new(PortStatus {
                state: PortState::Loaded,
                exception: ExceptionFlag::General,
                definition,
                pending_mark: None,
            }),
            in_way: Mutex::new(DataBuffer::new()),
            out_way: Mutex::new(DataBuffer::new()),
            pause_event: Event::new(),
            enable_event: Event::new(),
            loaded_resource: Semaphore::new(0),
            unloaded_resource: Semaphore::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> PortState {
        self.status.lock().state
    }

    pub fn set_state(&self, state: PortState) {
        let previous = std::mem::replace(&mut self.status.lock().state, state);
        if previous != state {
            debug!("{} port: {} -> {}", self.direction, previous, state);
            self.enable_event.signal();
            self.pause_event.signal();
        }
    }

    pub fn exception(&self) -> ExceptionFlag {
        self.status.lock().exception
    }

    pub fn set_exception(&self, exception: ExceptionFlag) {
        self.status.lock().exception = exception;
        self.enable_event.signal();
    }

    /// Snapshot of the port definition
    pub fn definition(&self) -> PortDefinition {
        let populated = self.ownership.lock().is_populated();
        let mut definition = self.status.lock().definition.clone();
        definition.populated = populated;
        definition
    }

    pub fn enabled(&self) -> bool {
        self.status.lock().definition.enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.status.lock().definition.enabled = enabled;
        self.enable_event.signal();
    }

    pub fn process_type(&self) -> ProcessType {
        self.status.lock().definition.process_type
    }

    pub fn is_tunneled(&self) -> bool {
        self.status.lock().definition.tunneled
    }

    pub fn is_supplier(&self) -> bool {
        self.status.lock().definition.buffer_supplier
    }

    pub fn is_flushing(&self) -> bool {
        self.state().is_flushing()
    }

    /// True when the stages of this port may move work
    pub fn is_running(&self) -> bool {
        let status = self.status.lock();
        status.definition.enabled
            && !matches!(
                status.state,
                PortState::Disabling | PortState::FlushingForDisable | PortState::Invalid
            )
            && !matches!(status.exception, ExceptionFlag::NeedDisable | ExceptionFlag::Invalid)
    }

    /// Replace the definition. The caller checks that the port may be reconfigured.
    pub fn apply_definition(&self, definition: &PortDefinition) -> Result<()> {
        let mut ownership = self.ownership.lock();
        ownership.resize(definition.buffer_count)?;
        self.queue.set_capacity(definition.buffer_count);
        self.codec_queue.set_capacity(definition.codec_buffer_count);

        let mut status = self.status.lock();
        let enabled = status.definition.enabled;
        status.definition = definition.clone();
        status.definition.enabled = enabled;
        status.definition.populated = false;
        Ok(())
    }

    /// Resize the ownership table and submit queue to the current definition.
    ///
    /// Fails unless every buffer has been freed.
    pub fn sync_capacity(&self) -> Result<()> {
        let count = self.status.lock().definition.buffer_count;
        self.ownership.lock().resize(count)?;
        self.queue.set_capacity(count);
        Ok(())
    }

    /// Adopt a layout announced by the codec
    pub fn apply_format(&self, format: PortFormat) {
        let mut status = self.status.lock();
        status.definition.buffer_size = status.definition.buffer_size.max(format.buffer_size);
        status.definition.buffer_count = status.definition.buffer_count.max(format.buffer_count);
    }

    pub fn set_tunnel(&self, tunneled: bool, supplier: bool) {
        let mut status = self.status.lock();
        status.definition.tunneled = tunneled;
        status.definition.buffer_supplier = tunneled && supplier;
    }

    pub fn set_pending_mark(&self, mark: BufferMark) {
        self.status.lock().pending_mark = Some(mark);
    }

    pub fn take_pending_mark(&self) -> Option<BufferMark> {
        self.status.lock().pending_mark.take()
    }

    /// Register a client buffer. Returns the buffer and whether the port is now populated.
    pub fn register<F>(&self, make: F) -> Result<(BufferRef, bool)>
    where
        F: FnOnce(usize) -> Result<BufferRef>,
    {
        let mut ownership = self.ownership.lock();
        let buffer = ownership.register(make)?;
        let populated = ownership.is_populated();
        drop(ownership);

        if populated {
            debug!("{} port populated", self.direction);
            self.loaded_resource.post();
        }
        Ok((buffer, populated))
    }

    /// Unregister a client buffer. Returns whether the port is now empty.
    pub fn unregister(&self, buffer: &BufferRef) -> Result<bool> {
        let mut ownership = self.ownership.lock();
        ownership.unregister(buffer)?;
        let empty = ownership.is_empty();
        drop(ownership);

        if empty {
            debug!("{} port unpopulated", self.direction);
            self.unloaded_resource.post();
        }
        Ok(empty)
    }

    /// Hand a buffer to the component
    pub fn acquire(&self, buffer: &BufferRef) -> Result<()> {
        self.ownership.lock().acquire(buffer)
    }

    /// Hand a buffer back to the client
    pub fn release(&self, buffer: &BufferRef) -> Result<()> {
        self.ownership.lock().release(buffer)
    }

    pub fn is_owned(&self, buffer: &BufferRef) -> bool {
        self.ownership.lock().is_owned(buffer)
    }

    pub fn find_by_memory(&self, memory: MemoryId) -> Option<BufferRef> {
        self.ownership.lock().find_by_memory(memory)
    }

    /// Buffers the component currently owns
    pub fn owned_buffers(&self) -> Vec<BufferRef> {
        self.ownership.lock().owned()
    }

    pub fn owned_count(&self) -> usize {
        self.ownership.lock().owned_count()
    }

    /// Every registered buffer
    pub fn buffers(&self) -> Vec<BufferRef> {
        self.ownership.lock().buffers()
    }

    pub fn is_populated(&self) -> bool {
        self.ownership.lock().is_populated()
    }

    pub fn is_unpopulated(&self) -> bool {
        self.ownership.lock().is_empty()
    }

    /// Block until every buffer slot is registered.
    ///
    /// `abort` is polled between bounded waits.
    pub fn wait_populated<F>(&self, max_wait: Duration, timeout: Duration, abort: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        self.rendezvous(&self.loaded_resource, max_wait, timeout, abort, || self.is_populated())
            .map_err(|err| match err {
                CodecError::Timeout(_) => CodecError::Timeout(format!("{} port population", self.direction)),
                other => other,
            })
    }

    /// Block until every buffer is freed
    pub fn wait_unpopulated<F>(&self, max_wait: Duration, timeout: Duration, abort: F) -> Result<()>
    where
        F: Fn() -> bool,
    {
        self.rendezvous(&self.unloaded_resource, max_wait, timeout, abort, || self.is_unpopulated())
            .map_err(|err| match err {
                CodecError::Timeout(_) => CodecError::Timeout(format!("{} port buffer release", self.direction)),
                other => other,
            })
    }

    fn rendezvous<A, D>(&self, signal: &Semaphore, max_wait: Duration, timeout: Duration, abort: A, done: D) -> Result<()>
    where
        A: Fn() -> bool,
        D: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                while signal.try_wait() {}
                return Ok(());
            }
            if abort() {
                return Err(CodecError::Shutdown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CodecError::Timeout(String::new()));
            }
            signal.wait_timeout(max_wait.min(deadline - now));
        }
    }

    /// Allocate the Copy-mode codec pool and queue every block as free
    pub fn allocate_codec_pool(&self, allocator: &dyn Allocator) -> Result<()> {
        if !self.process_type().uses_codec_pool() {
            return Ok(());
        }

        let (count, size) = {
            let status = self.status.lock();
            (status.definition.codec_buffer_count, status.definition.codec_buffer_size)
        };

        let mut pool = self.codec_pool.lock();
        if !pool.is_empty() {
            return Ok(());
        }
        for _ in 0..count {
            match allocator.alloc(size, MemoryKind::Contiguous) {
                Ok(block) => pool.push(block),
                Err(err) => {
                    for block in pool.drain(..) {
                        let _ = allocator.free(&block);
                    }
                    return Err(err);
                }
            }
        }
        debug!("{} port codec pool: {} x {} bytes", self.direction, count, size);
        drop(pool);

        self.refill_codec_queue();
        Ok(())
    }

    /// Reset the codec queue so every pool block is free again
    pub fn refill_codec_queue(&self) {
        self.codec_queue.reset();
        for block in self.codec_pool.lock().iter() {
            if let Err(err) = self.codec_queue.push(block.clone()) {
                warn!("{} port codec queue refill failed: {}", self.direction, err);
            }
        }
    }

    /// Return a pool block to the free queue
    pub fn recycle_codec_buffer(&self, block: MemoryRef) {
        let known = self.codec_pool.lock().iter().any(|b| b.id() == block.id());
        if !known {
            warn!("{} port: dropping foreign codec block {:?}", self.direction, block.id());
            return;
        }
        if let Err(err) = self.codec_queue.push(block) {
            warn!("{} port codec queue: {}", self.direction, err);
        }
    }

    /// Free the codec pool
    pub fn release_codec_pool(&self, allocator: &dyn Allocator) {
        self.codec_queue.reset();
        for block in self.codec_pool.lock().drain(..) {
            if let Err(err) = allocator.free(&block) {
                warn!("{} port: failed to free codec block: {}", self.direction, err);
            }
        }
    }

    /// Number of blocks in the codec pool
    pub fn codec_pool_size(&self) -> usize {
        self.codec_pool.lock().len()
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("index", &self.index)
            .field("status", &*self.status.lock())
            .finish()
    }
}
