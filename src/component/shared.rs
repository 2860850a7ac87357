//! State shared between the component handle, the command thread and the
//! pipeline threads

use super::{
    ComponentCallbacks, ComponentEvent, ComponentId, ComponentState, ErrorCode, PipelineCounters,
};
use crate::buffer::{Allocator, BufferFlags, BufferMark, BufferRef, Direction};
use crate::codec::{CodecDriver, PortFormat, Tag};
use crate::pipeline::{PipelineThreads, TimestampTable};
use crate::port::{ExceptionFlag, Port, PortState, INPUT_PORT_INDEX, OUTPUT_PORT_INDEX, PORT_COUNT};
use crate::utils::config::Config;
use crate::utils::error::{CodecError, Result};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// End-of-stream input that skipped the codec
#[derive(Debug, Clone, Copy)]
pub(crate) struct BypassFrame {
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub mark: Option<BufferMark>,
    pub queued_at: Instant,
}

/// What DstOut does with a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputDecision {
    Deliver {
        timestamp: i64,
        flags: BufferFlags,
        mark: Option<BufferMark>,
    },
    Drop,
}

pub(crate) struct ComponentShared {
    pub id: ComponentId,
    pub config: Config,
    pub ports: [Port; PORT_COUNT],
    pub driver: Arc<dyn CodecDriver>,
    pub allocator: Arc<dyn Allocator>,
    pub timestamps: Mutex<TimestampTable>,
    pub stats: PipelineCounters,
    pub pipeline: Mutex<PipelineThreads>,
    state: RwLock<ComponentState>,
    transition: Mutex<Option<ComponentState>>,
    callbacks: Arc<dyn ComponentCallbacks>,
    eos_bypass: Mutex<VecDeque<BypassFrame>>,
    exit_requested: AtomicBool,
    closing: AtomicBool,
    next_buffer_id: AtomicU32,
}

impl ComponentShared {
    pub fn new(
        config: Config,
        driver: Arc<dyn CodecDriver>,
        allocator: Arc<dyn Allocator>,
        callbacks: Arc<dyn ComponentCallbacks>,
    ) -> Self {
        let ports = [
            Port::new(Direction::Input, &config.input_port),
            Port::new(Direction::Output, &config.output_port),
        ];
        let timestamps = TimestampTable::new(config.pipeline.timestamp_slots);

        Self {
            id: ComponentId::next(),
            ports,
            driver,
            allocator,
            timestamps: Mutex::new(timestamps),
            stats: PipelineCounters::default(),
            pipeline: Mutex::new(PipelineThreads::default()),
            state: RwLock::new(ComponentState::Loaded),
            transition: Mutex::new(None),
            callbacks,
            eos_bypass: Mutex::new(VecDeque::new()),
            exit_requested: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            next_buffer_id: AtomicU32::new(1),
            config,
        }
    }

    pub fn port(&self, index: usize) -> Result<&Port> {
        self.ports.get(index).ok_or(CodecError::InvalidPort(index))
    }

    pub fn input_port(&self) -> &Port {
        &self.ports[INPUT_PORT_INDEX]
    }

    pub fn output_port(&self) -> &Port {
        &self.ports[OUTPUT_PORT_INDEX]
    }

    pub fn state(&self) -> ComponentState {
        *self.state.read()
    }

    /// Change the component state and mirror it onto idle ports
    pub fn set_state(&self, state: ComponentState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!("{}: {} -> {}", self.id, previous, state);
        }

        let port_state = Self::port_state_for(state);
        for port in &self.ports {
            let current = port.state();
            if !current.is_transitioning() && !current.is_flushing() {
                port.set_state(port_state);
            }
            port.pause_event.signal();
        }
    }

    /// Port state matching the current component state
    pub fn port_state(&self) -> PortState {
        Self::port_state_for(self.state())
    }

    fn port_state_for(state: ComponentState) -> PortState {
        match state {
            ComponentState::Loaded => PortState::Loaded,
            ComponentState::Idle => PortState::Idle,
            ComponentState::Executing => PortState::Executing,
            ComponentState::Pause => PortState::Pause,
            ComponentState::WaitForResources => PortState::WaitForResources,
            ComponentState::Invalid => PortState::Invalid,
        }
    }

    /// Target of the state command currently running, if any
    pub fn pending_transition(&self) -> Option<ComponentState> {
        *self.transition.lock()
    }

    pub fn set_pending_transition(&self, target: Option<ComponentState>) {
        *self.transition.lock() = target;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_exit(&self) {
        self.exit_requested.store(false, Ordering::SeqCst);
    }

    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// True if a blocking rendezvous should give up
    pub fn should_abort(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.state() == ComponentState::Invalid
    }

    pub fn next_buffer_id(&self) -> u32 {
        self.next_buffer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit(&self, event: ComponentEvent) {
        debug!("{}: event {:?}", self.id, event);
        self.callbacks.event(event);
    }

    /// Report an error event
    pub fn emit_error(&self, err: &CodecError) {
        self.emit(ComponentEvent::Error(err.error_code()));
    }

    /// Hand a buffer back to the client through the matching callback.
    ///
    /// A buffer the component does not own is skipped with a warning.
    pub fn return_to_client(&self, buffer: &BufferRef) {
        let port = &self.ports[buffer.port_index()];
        if let Err(err) = port.release(buffer) {
            warn!("{}: not returning buffer {}: {}", self.id, buffer.id(), err);
            PipelineCounters::bump(&self.stats.protocol_rejections);
            return;
        }

        match buffer.direction() {
            Direction::Input => {
                PipelineCounters::bump(&self.stats.input_returned);
                self.callbacks.empty_buffer_done(buffer.clone());
            }
            Direction::Output => {
                if let Some(mark) = buffer.take_mark_for(self.id) {
                    self.emit(ComponentEvent::Mark { data: mark.data });
                }
                PipelineCounters::bump(&self.stats.output_returned);
                self.callbacks.fill_buffer_done(buffer.clone());
            }
        }
    }

    /// Return a buffer with no payload
    pub fn return_unfilled(&self, buffer: &BufferRef) {
        buffer.clear_payload();
        self.return_to_client(buffer);
    }

    /// Fire a mark that targets this component; pass any other mark on
    pub fn consume_mark(&self, mark: Option<BufferMark>) -> Option<BufferMark> {
        match mark {
            Some(mark) if mark.target == self.id => {
                self.emit(ComponentEvent::Mark { data: mark.data });
                None
            }
            other => other,
        }
    }

    /// Hand a filled output buffer to the client, raising the EOS event first
    pub fn deliver_output(&self, buffer: &BufferRef) {
        let flags = buffer.flags();
        if flags.contains(BufferFlags::EOS) {
            info!("{}: end of stream on output", self.id);
            self.emit(ComponentEvent::BufferFlag {
                port: OUTPUT_PORT_INDEX,
                flags,
            });
        }
        self.return_to_client(buffer);
    }

    /// Look up the timestamp of a decoded frame and decide whether to keep it.
    ///
    /// Input flags are restored from the slot, except EOS which only the codec reports.
    pub fn resolve_output(&self, tag: Option<Tag>, driver_flags: BufferFlags) -> OutputDecision {
        let mut table = self.timestamps.lock();
        let retrieved = table.retrieve(tag, driver_flags.contains(BufferFlags::SYNC_FRAME));
        if retrieved.fallback {
            PipelineCounters::bump(&self.stats.timestamp_warnings);
        }

        if !driver_flags.contains(BufferFlags::EOS) && !table.passes_start_gate(retrieved.timestamp) {
            debug!("Dropping frame at {} before start timestamp", retrieved.timestamp);
            PipelineCounters::bump(&self.stats.frames_dropped);
            return OutputDecision::Drop;
        }

        let (timestamp, clamped) = table.finalize(retrieved.timestamp);
        if clamped {
            PipelineCounters::bump(&self.stats.timestamp_warnings);
        }

        OutputDecision::Deliver {
            timestamp,
            flags: driver_flags | (retrieved.flags - BufferFlags::EOS),
            mark: retrieved.mark,
        }
    }

    pub fn queue_eos_bypass(&self, frame: BypassFrame) {
        debug!("Queueing end-of-stream bypass at {}", frame.timestamp);
        self.eos_bypass.lock().push_back(frame);
    }

    /// True once a bypassed EOS may be emitted
    pub fn eos_bypass_ready(&self) -> bool {
        let bypass = self.eos_bypass.lock();
        let Some(front) = bypass.front() else {
            return false;
        };
        front.queued_at.elapsed() >= self.config.pipeline.eos_drain_timeout()
            || self.timestamps.lock().live_count() == 0
    }

    /// Complete `buffer` as the bypassed EOS. Returns false if none is pending.
    pub fn emit_eos_bypass(&self, buffer: &BufferRef) -> bool {
        let Some(frame) = self.eos_bypass.lock().pop_front() else {
            return false;
        };
        let (timestamp, _) = self.timestamps.lock().finalize(frame.timestamp);
        buffer.set_output(0, timestamp, frame.flags | BufferFlags::EOS, frame.mark);
        PipelineCounters::bump(&self.stats.eos_bypassed);
        self.deliver_output(buffer);
        true
    }

    pub fn clear_eos_bypass(&self) {
        self.eos_bypass.lock().clear();
    }

    /// Record a codec format change and park the output port
    pub fn port_settings_changed(&self, port: &Port, format: PortFormat) {
        info!(
            "{}: {} port settings changed to {} x {} bytes",
            self.id,
            port.direction(),
            format.buffer_count,
            format.buffer_size
        );
        port.apply_format(format);
        port.set_exception(ExceptionFlag::NeedDisable);
        self.emit(ComponentEvent::PortSettingsChanged { port: port.index() });
    }

    /// Enter the Invalid state and ask the pipeline to stop
    pub fn enter_invalid(&self, reason: &str) {
        let previous = std::mem::replace(&mut *self.state.write(), ComponentState::Invalid);
        if previous == ComponentState::Invalid {
            return;
        }
        error!("{}: entering Invalid state: {}", self.id, reason);

        for port in &self.ports {
            port.set_exception(ExceptionFlag::Invalid);
            port.set_state(PortState::Invalid);
        }
        self.request_exit();
        crate::pipeline::wake_all(self);
        self.emit(ComponentEvent::Error(ErrorCode::InvalidState));
    }
}
