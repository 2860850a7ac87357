//! Bounded FIFO queues feeding the pipeline stages

use super::{BufferRef, MemoryRef};
use crate::utils::error::{CodecError, Result};
use crate::utils::signal::Semaphore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Kind of a message on a port queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Input buffer to be consumed
    EmptyBuffer,

    /// Output buffer to be filled
    FillBuffer,

    /// Payload-free wake-up; consumers discard it
    FlushBarrier,
}

/// Entry on a port's submit queue
#[derive(Debug, Clone)]
pub struct PipelineMessage {
    pub kind: MessageKind,
    pub buffer: Option<BufferRef>,
}

impl PipelineMessage {
    /// Message carrying a client input buffer
    pub fn empty_buffer(buffer: BufferRef) -> Self {
        Self {
            kind: MessageKind::EmptyBuffer,
            buffer: Some(buffer),
        }
    }

    /// Message carrying a client output buffer
    pub fn fill_buffer(buffer: BufferRef) -> Self {
        Self {
            kind: MessageKind::FillBuffer,
            buffer: Some(buffer),
        }
    }

    /// Wake-up without payload
    pub fn barrier() -> Self {
        Self {
            kind: MessageKind::FlushBarrier,
            buffer: None,
        }
    }
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// FIFO paired with a semaphore counting pushed items.
///
/// Consumers `wait` on the semaphore outside any lock and then `take` under
/// the stage's DataBuffer lock. Surplus posts are harmless: `take` simply
/// returns `None`.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Semaphore,
}

/// Queue of client buffers submitted to one port
pub type PortQueue = BoundedQueue<PipelineMessage>;

/// Queue of free codec pool blocks
pub type CodecBufferQueue = BoundedQueue<MemoryRef>;

impl<T> BoundedQueue<T> {
    /// Empty queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                capacity,
            }),
            available: Semaphore::new(0),
        }
    }

    /// Append an item and post the semaphore
    pub fn push(&self, item: T) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.items.len() >= inner.capacity {
                return Err(CodecError::QueueFull(inner.capacity));
            }
            inner.items.push_back(item);
        }
        self.available.post();
        Ok(())
    }

    /// Wait up to `timeout` for a post
    pub fn wait(&self, timeout: Duration) -> bool {
        self.available.wait_timeout(timeout)
    }

    /// Pop the head without touching the semaphore
    pub fn take(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Wait for a post, then pop the head
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        if !self.wait(timeout) && self.is_empty() {
            return None;
        }
        self.take()
    }

    /// Post without an item so a waiting consumer re-checks its loop
    pub fn wake(&self) {
        self.available.post();
    }

    /// Remove every item, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().items.drain(..).collect()
    }

    /// Drop every item and every outstanding post
    pub fn reset(&self) {
        self.inner.lock().items.clear();
        self.available.reset();
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Change the maximum number of queued items
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
    }
}

impl PortQueue {
    /// Queue a wake-up message even when the queue is full
    pub fn push_barrier(&self) {
        self.inner.lock().items.push_back(PipelineMessage::barrier());
        self.available.post();
    }

    /// Drop queued wake-up messages, keeping buffers in order
    pub fn purge_barriers(&self) {
        self.inner
            .lock()
            .items
            .retain(|message| message.kind != MessageKind::FlushBarrier);
    }
}
