//! Integration test utilities for hwcodec
//!
//! This module provides common utilities for integration testing including:
//! - A callback recorder that forwards every notification to the test thread
//! - Scripted codec drivers for error and stall scenarios
//! - A fixture that walks a component through its states and runs streams

use anyhow::{bail, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use hwcodec::buffer::{BufferMark, MemoryRef};
use hwcodec::codec::{DriverError, DriverOutput, DriverResult, InputFrame};
use hwcodec::component::CompletedCommand;
use hwcodec::{
    BufferFlags, BufferRef, CodecDriver, CodecFamily, Command, Component, ComponentCallbacks,
    ComponentEvent, ComponentState, Config, Direction, HeapAllocator, LoopbackDriver, ProcessType,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default wait for anything the component does asynchronously
pub const WAIT: Duration = Duration::from_secs(3);

/// Something the component told the client
#[derive(Debug, Clone)]
pub enum Notification {
    Event(ComponentEvent),
    EmptyDone(BufferRef),
    FillDone(BufferRef),
}

/// Callbacks that forward every notification over a channel
pub struct RecordingCallbacks {
    tx: Sender<Notification>,
}

impl RecordingCallbacks {
    pub fn new() -> (Arc<Self>, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl ComponentCallbacks for RecordingCallbacks {
    fn event(&self, event: ComponentEvent) {
        let _ = self.tx.send(Notification::Event(event));
    }

    fn empty_buffer_done(&self, buffer: BufferRef) {
        let _ = self.tx.send(Notification::EmptyDone(buffer));
    }

    fn fill_buffer_done(&self, buffer: BufferRef) {
        let _ = self.tx.send(Notification::FillDone(buffer));
    }
}

/// Driver that rejects every input with a fixed error and sits on every
/// output buffer until stopped
pub struct ScriptedDriver {
    input_error: DriverError,
    input_attempts: AtomicUsize,
    held_outputs: Mutex<Vec<MemoryRef>>,
}

impl ScriptedDriver {
    pub fn rejecting(input_error: DriverError) -> Self {
        Self {
            input_error,
            input_attempts: AtomicUsize::new(0),
            held_outputs: Mutex::new(Vec::new()),
        }
    }

    /// Number of `submit_input` calls so far
    pub fn input_attempts(&self) -> usize {
        self.input_attempts.load(Ordering::SeqCst)
    }

    /// Output buffers currently held
    pub fn held_outputs(&self) -> usize {
        self.held_outputs.lock().len()
    }
}

impl CodecDriver for ScriptedDriver {
    fn family(&self) -> CodecFamily {
        CodecFamily::H264
    }

    fn submit_input(&self, _frame: InputFrame) -> DriverResult<()> {
        self.input_attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.input_error.clone())
    }

    fn submit_output(&self, buffer: MemoryRef) -> DriverResult<()> {
        self.held_outputs.lock().push(buffer);
        Ok(())
    }

    fn dequeue_input(&self, timeout: Duration) -> DriverResult<Option<MemoryRef>> {
        thread::sleep(timeout);
        Ok(None)
    }

    fn dequeue_output(&self, timeout: Duration) -> DriverResult<Option<DriverOutput>> {
        thread::sleep(timeout);
        Ok(None)
    }

    fn stop(&self, direction: Direction) -> DriverResult<Vec<MemoryRef>> {
        match direction {
            Direction::Input => Ok(Vec::new()),
            Direction::Output => Ok(self.held_outputs.lock().drain(..).collect()),
        }
    }
}

/// One input frame of a test stream
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub timestamp: i64,
    pub flags: BufferFlags,
}

impl Frame {
    pub fn new(payload: &[u8], timestamp: i64, flags: BufferFlags) -> Self {
        Self {
            payload: payload.to_vec(),
            timestamp,
            flags,
        }
    }
}

/// One output buffer as the client received it
#[derive(Debug, Clone)]
pub struct Delivered {
    pub payload: Vec<u8>,
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub mark: Option<BufferMark>,
}

/// Configuration tuned for fast tests: small buffers, short waits
pub fn test_config(process_type: ProcessType) -> Config {
    let mut config = Config::default();
    config.pipeline.max_wait_ms = 50;
    config.pipeline.poll_interval_ms = 2;
    config.pipeline.rendezvous_timeout_ms = 2000;
    config.pipeline.eos_drain_timeout_ms = 300;
    for port in [&mut config.input_port, &mut config.output_port] {
        port.buffer_count = 4;
        port.buffer_size = 4096;
        port.process_type = process_type;
        port.codec_buffer_count = 4;
        port.codec_buffer_size = 4096;
    }
    config
}

/// Test fixture owning a component and the client side of its callbacks
pub struct TestFixture {
    pub component: Component,
    pub allocator: Arc<HeapAllocator>,
    pub loopback: Option<Arc<LoopbackDriver>>,
    pub inputs: Vec<BufferRef>,
    pub outputs: Vec<BufferRef>,
    pub events: Vec<ComponentEvent>,
    notifications: Receiver<Notification>,
    stash: VecDeque<Notification>,
}

impl TestFixture {
    /// Create a fixture around any driver
    pub fn new(config: Config, driver: Arc<dyn CodecDriver>) -> Result<Self> {
        let (callbacks, notifications) = RecordingCallbacks::new();
        let allocator = Arc::new(HeapAllocator::new());
        let component = Component::builder()
            .with_config(config)
            .with_driver(driver)
            .with_allocator(allocator.clone())
            .with_callbacks(callbacks)
            .build()?;

        Ok(Self {
            component,
            allocator,
            loopback: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            events: Vec::new(),
            notifications,
            stash: VecDeque::new(),
        })
    }

    /// Create a fixture around a loopback codec
    pub fn loopback(process_type: ProcessType, reorder_depth: usize) -> Result<Self> {
        Self::loopback_with_config(test_config(process_type), reorder_depth)
    }

    pub fn loopback_with_config(config: Config, reorder_depth: usize) -> Result<Self> {
        let driver = Arc::new(
            LoopbackDriver::new(config.pipeline.codec_family, config.input_port.buffer_count)
                .with_reorder_depth(reorder_depth),
        );
        let mut fixture = Self::new(config, driver.clone())?;
        fixture.loopback = Some(driver);
        Ok(fixture)
    }

    /// Allocate every buffer of every enabled port
    pub fn allocate_all(&mut self) -> Result<()> {
        for port in 0..2 {
            let definition = self.component.port_definition(port)?;
            if !definition.enabled {
                continue;
            }
            for _ in 0..definition.buffer_count {
                let buffer = self.component.allocate_buffer(port, definition.buffer_size)?;
                match buffer.direction() {
                    Direction::Input => self.inputs.push(buffer),
                    Direction::Output => self.outputs.push(buffer),
                }
            }
        }
        Ok(())
    }

    /// Loaded -> Idle with every port populated
    pub fn to_idle(&mut self) -> Result<()> {
        self.component.send_command(Command::StateSet(ComponentState::Idle))?;
        self.allocate_all()?;
        self.wait_command(CompletedCommand::StateSet(ComponentState::Idle))
    }

    /// Loaded -> Idle -> Executing
    pub fn to_executing(&mut self) -> Result<()> {
        self.to_idle()?;
        self.set_state(ComponentState::Executing)
    }

    /// Send a state command and wait for it to complete
    pub fn set_state(&mut self, state: ComponentState) -> Result<()> {
        self.component.send_command(Command::StateSet(state))?;
        self.wait_command(CompletedCommand::StateSet(state))
    }

    /// Executing -> Idle -> Loaded, freeing every buffer
    pub fn to_loaded(&mut self) -> Result<()> {
        if self.component.state() != ComponentState::Idle {
            self.set_state(ComponentState::Idle)?;
        }
        self.component.send_command(Command::StateSet(ComponentState::Loaded))?;
        for buffer in self.inputs.drain(..).chain(self.outputs.drain(..)) {
            self.component.free_buffer(&buffer)?;
        }
        self.wait_command(CompletedCommand::StateSet(ComponentState::Loaded))
    }

    /// Hand every output buffer to the component
    pub fn submit_outputs(&self) -> Result<()> {
        for buffer in &self.outputs {
            self.component.fill_this_buffer(buffer)?;
        }
        Ok(())
    }

    /// Fill an input buffer and submit it
    pub fn feed(&self, buffer: &BufferRef, frame: &Frame) -> Result<()> {
        buffer.write(&frame.payload)?;
        buffer.set_timestamp(frame.timestamp);
        buffer.set_flags(frame.flags);
        self.component.empty_this_buffer(buffer)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Option<Notification> {
        match self.notifications.recv_timeout(timeout) {
            Ok(notification) => {
                if let Notification::Event(event) = &notification {
                    self.events.push(event.clone());
                }
                Some(notification)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next notification, oldest stashed first
    pub fn next_notification(&mut self, timeout: Duration) -> Option<Notification> {
        self.stash.pop_front().or_else(|| self.receive(timeout))
    }

    /// Wait for the first notification matching `pred`; others are stashed
    pub fn wait_for<F>(&mut self, pred: F) -> Result<Notification>
    where
        F: Fn(&Notification) -> bool,
    {
        if let Some(position) = self.stash.iter().position(&pred) {
            if let Some(found) = self.stash.remove(position) {
                return Ok(found);
            }
        }

        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(notification) = self.receive(Duration::from_millis(20)) {
                if pred(&notification) {
                    return Ok(notification);
                }
                self.stash.push_back(notification);
            }
        }
        bail!("timed out waiting for notification; stashed: {:?}", self.stash)
    }

    /// Wait for a command to complete, failing on an error event
    pub fn wait_command(&mut self, command: CompletedCommand) -> Result<()> {
        let found = self.wait_for(|n| {
            matches!(
                n,
                Notification::Event(ComponentEvent::CommandComplete(done)) if *done == command
            ) || matches!(n, Notification::Event(ComponentEvent::Error(_)))
        })?;
        match found {
            Notification::Event(ComponentEvent::Error(code)) => bail!("{:?} failed with {:?}", command, code),
            _ => Ok(()),
        }
    }

    /// Wait for an event matching `pred`
    pub fn wait_event<F>(&mut self, pred: F) -> Result<ComponentEvent>
    where
        F: Fn(&ComponentEvent) -> bool,
    {
        match self.wait_for(|n| matches!(n, Notification::Event(event) if pred(event)))? {
            Notification::Event(event) => Ok(event),
            other => bail!("unexpected notification {:?}", other),
        }
    }

    /// Wait for an input buffer to come back
    pub fn wait_empty_done(&mut self) -> Result<BufferRef> {
        match self.wait_for(|n| matches!(n, Notification::EmptyDone(_)))? {
            Notification::EmptyDone(buffer) => Ok(buffer),
            other => bail!("unexpected notification {:?}", other),
        }
    }

    /// Wait for an output buffer to come back
    pub fn wait_fill_done(&mut self) -> Result<BufferRef> {
        match self.wait_for(|n| matches!(n, Notification::FillDone(_)))? {
            Notification::FillDone(buffer) => Ok(buffer),
            other => bail!("unexpected notification {:?}", other),
        }
    }

    /// True if an event matching `pred` has been received
    pub fn saw_event<F>(&self, pred: F) -> bool
    where
        F: Fn(&ComponentEvent) -> bool,
    {
        self.events.iter().any(pred)
    }

    /// Feed `frames` through an Executing component until an EOS output
    /// arrives. Input buffers are reused as they come back and every output
    /// buffer is recycled.
    ///
    /// Expects every input buffer to be client-owned and the outputs already submitted.
    pub fn run_stream(&mut self, frames: &[Frame]) -> Result<Vec<Delivered>> {
        let mut free: Vec<BufferRef> = self.inputs.iter().rev().cloned().collect();
        let mut next = 0;
        let mut delivered = Vec::new();
        let deadline = Instant::now() + WAIT;

        loop {
            while next < frames.len() {
                let Some(buffer) = free.pop() else {
                    break;
                };
                self.feed(&buffer, &frames[next])?;
                next += 1;
            }

            if Instant::now() >= deadline {
                bail!(
                    "stream stalled: fed {} of {}, delivered {}",
                    next,
                    frames.len(),
                    delivered.len()
                );
            }

            match self.next_notification(Duration::from_millis(20)) {
                Some(Notification::EmptyDone(buffer)) => free.insert(0, buffer),
                Some(Notification::FillDone(buffer)) => {
                    let flags = buffer.flags();
                    if buffer.filled_len() > 0 || flags.contains(BufferFlags::EOS) {
                        delivered.push(Delivered {
                            payload: buffer.read(),
                            timestamp: buffer.timestamp(),
                            flags,
                            mark: buffer.mark(),
                        });
                    }
                    if flags.contains(BufferFlags::EOS) {
                        return Ok(delivered);
                    }
                    self.component.fill_this_buffer(&buffer)?;
                }
                Some(Notification::Event(_)) | None => {}
            }
        }
    }
}

/// Poll `cond` until it holds or the default wait runs out
pub fn wait_until<F>(cond: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(2));
    }
    bail!("condition not reached in {:?}", WAIT)
}

/// Frames with payload `frame-N` at the given timestamps; the last one carries EOS
pub fn numbered_stream(timestamps: &[i64]) -> Vec<Frame> {
    timestamps
        .iter()
        .enumerate()
        .map(|(index, &timestamp)| {
            let mut flags = BufferFlags::END_OF_FRAME;
            if index == 0 {
                flags |= BufferFlags::SYNC_FRAME;
            }
            if index + 1 == timestamps.len() {
                flags |= BufferFlags::EOS;
            }
            Frame::new(format!("frame-{}", index).as_bytes(), timestamp, flags)
        })
        .collect()
}
