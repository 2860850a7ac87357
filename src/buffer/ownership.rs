//! Per-port buffer ownership table
//!
//! One entry per registered buffer. `in_component` is the only source of
//! truth for who may touch the buffer: the client after registration and
//! after every return, the component between a successful submit and the
//! matching return.

use super::{BufferRef, MemoryId};
use crate::utils::error::{CodecError, Result};

#[derive(Debug)]
struct OwnershipEntry {
    buffer: BufferRef,
    in_component: bool,
}

/// Fixed-capacity table of the buffers registered on one port
#[derive(Debug)]
pub struct BufferOwnershipTable {
    entries: Vec<Option<OwnershipEntry>>,
}

impl BufferOwnershipTable {
    /// Table with `capacity` empty slots
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of registered buffers
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// True if no buffer is registered
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    /// True if every slot holds a buffer
    pub fn is_populated(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|e| e.is_some())
    }

    /// Change the slot count. Only allowed while empty.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if !self.is_empty() {
            return Err(CodecError::invalid_state(format!(
                "cannot resize ownership table with {} registered buffers",
                self.len()
            )));
        }
        self.entries = (0..capacity).map(|_| None).collect();
        Ok(())
    }

    /// First free slot index
    pub fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.is_none())
    }

    /// Register a buffer built for the first free slot.
    ///
    /// The new buffer starts out owned by the client.
    pub fn register<F>(&mut self, make: F) -> Result<BufferRef>
    where
        F: FnOnce(usize) -> Result<BufferRef>,
    {
        let slot = self.free_slot().ok_or_else(|| {
            CodecError::InsufficientResources(format!(
                "all {} buffer slots are registered",
                self.capacity()
            ))
        })?;
        let buffer = make(slot)?;
        self.entries[slot] = Some(OwnershipEntry {
            buffer: buffer.clone(),
            in_component: false,
        });
        Ok(buffer)
    }

    /// Remove a client-owned buffer from the table
    pub fn unregister(&mut self, buffer: &BufferRef) -> Result<()> {
        let entry = self.entry(buffer)?;
        if entry.in_component {
            return Err(CodecError::AlreadyOwned(buffer.id().0));
        }
        self.entries[buffer.slot()] = None;
        Ok(())
    }

    /// Transfer a buffer from the client to the component
    pub fn acquire(&mut self, buffer: &BufferRef) -> Result<()> {
        let id = buffer.id();
        let entry = self.entry_mut(buffer)?;
        if entry.in_component {
            return Err(CodecError::AlreadyOwned(id.0));
        }
        entry.in_component = true;
        Ok(())
    }

    /// Transfer a buffer from the component back to the client
    pub fn release(&mut self, buffer: &BufferRef) -> Result<()> {
        let id = buffer.id();
        let entry = self.entry_mut(buffer)?;
        if !entry.in_component {
            return Err(CodecError::NotOwned(id.0));
        }
        entry.in_component = false;
        Ok(())
    }

    /// True if the component currently owns the buffer
    pub fn is_owned(&self, buffer: &BufferRef) -> bool {
        self.entry(buffer).map(|e| e.in_component).unwrap_or(false)
    }

    /// Registered buffer backed by the given memory block
    pub fn find_by_memory(&self, memory: MemoryId) -> Option<BufferRef> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.buffer.memory().id() == memory)
            .map(|e| e.buffer.clone())
    }

    /// Buffers the component currently owns, in slot order
    pub fn owned(&self) -> Vec<BufferRef> {
        self.entries
            .iter()
            .flatten()
            .filter(|e| e.in_component)
            .map(|e| e.buffer.clone())
            .collect()
    }

    /// Number of buffers the component currently owns
    pub fn owned_count(&self) -> usize {
        self.entries.iter().flatten().filter(|e| e.in_component).count()
    }

    /// Every registered buffer, in slot order
    pub fn buffers(&self) -> Vec<BufferRef> {
        self.entries.iter().flatten().map(|e| e.buffer.clone()).collect()
    }

    fn entry(&self, buffer: &BufferRef) -> Result<&OwnershipEntry> {
        match self.entries.get(buffer.slot()).and_then(|e| e.as_ref()) {
            Some(entry) if entry.buffer.id() == buffer.id() => Ok(entry),
            _ => Err(CodecError::InvalidBuffer(format!(
                "buffer {} is not registered on this port",
                buffer.id()
            ))),
        }
    }

    fn entry_mut(&mut self, buffer: &BufferRef) -> Result<&mut OwnershipEntry> {
        match self.entries.get_mut(buffer.slot()).and_then(|e| e.as_mut()) {
            Some(entry) if entry.buffer.id() == buffer.id() => Ok(entry),
            _ => Err(CodecError::InvalidBuffer(format!(
                "buffer {} is not registered on this port",
                buffer.id()
            ))),
        }
    }
}
