//! Client-facing component handle

use super::command::{self, CommandMessage};
use super::{
    Command, ComponentBuilder, ComponentCallbacks, ComponentEvent, ComponentId, ComponentShared,
    ComponentState, ErrorCode, PipelineCounters, PipelineStats, PortSelector,
};
use crate::buffer::{
    next_memory_id, Allocator, BufferHeader, BufferId, BufferRef, Direction, MemoryBlock, MemoryKind,
    MemoryRef, PipelineMessage,
};
use crate::codec::{CodecDriver, CodecFamily};
use crate::pipeline;
use crate::port::{ExceptionFlag, Port, PortDefinition, PortState};
use crate::utils::config::Config;
use crate::utils::error::{CodecError, IntoCodecError, Result};
use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A codec component with one input and one output port
///
/// Dropping the component stops every thread it owns. Buffers the client
/// still holds stay valid but can no longer be submitted.
pub struct Component {
    shared: Arc<ComponentShared>,
    commands: Sender<CommandMessage>,
    command_thread: Option<JoinHandle<()>>,
}

impl Component {
    /// Create a component in the Loaded state
    pub fn new(
        config: Config,
        driver: Arc<dyn CodecDriver>,
        allocator: Arc<dyn Allocator>,
        callbacks: Arc<dyn ComponentCallbacks>,
    ) -> Result<Self> {
        config.validate()?;
        let family = driver.family();
        let shared = Arc::new(ComponentShared::new(config, driver, allocator, callbacks));

        let (commands, receiver) = crossbeam_channel::unbounded();
        let context = Arc::clone(&shared);
        let command_thread = thread::Builder::new()
            .name(format!("hwcodec-command-{}", shared.id.0))
            .spawn(move || command::run(context, receiver))
            .internal_err("Failed to spawn command thread")?;

        info!("{}: created {} component", shared.id, family);
        Ok(Self {
            shared,
            commands,
            command_thread: Some(command_thread),
        })
    }

    /// Start building a component
    pub fn builder() -> ComponentBuilder {
        ComponentBuilder::new()
    }

    pub fn id(&self) -> ComponentId {
        self.shared.id
    }

    /// Current component state
    pub fn state(&self) -> ComponentState {
        self.shared.state()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn codec_family(&self) -> CodecFamily {
        self.shared.driver.family()
    }

    /// Snapshot of the pipeline counters
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    /// Current state of one port
    pub fn port_state(&self, port: usize) -> Result<PortState> {
        Ok(self.shared.port(port)?.state())
    }

    /// Exception flag of one port
    pub fn port_exception(&self, port: usize) -> Result<ExceptionFlag> {
        Ok(self.shared.port(port)?.exception())
    }

    /// Queue an asynchronous command.
    ///
    /// Port indices and the Invalid state are checked here. Everything else
    /// is reported through `ComponentEvent::Error` once the command runs.
    pub fn send_command(&self, command: Command) -> Result<()> {
        match command {
            Command::StateSet(_) => {}
            Command::Flush(selector) | Command::PortDisable(selector) | Command::PortEnable(selector) => {
                if let PortSelector::Port(index) = selector {
                    self.shared.port(index)?;
                }
            }
            Command::MarkBuffer { port, .. } => {
                if self.shared.port(port)?.direction() != Direction::Input {
                    return Err(CodecError::BadParameter("marks are only accepted on the input port".to_string()));
                }
            }
        }

        if self.shared.state() == ComponentState::Invalid && !matches!(command, Command::StateSet(_)) {
            return Err(CodecError::invalid_state("component is Invalid"));
        }

        debug!("{}: queueing {:?}", self.shared.id, command);
        self.commands
            .send(CommandMessage::Run(command))
            .map_err(|_| CodecError::Shutdown)
    }

    /// Current definition of a port
    pub fn port_definition(&self, port: usize) -> Result<PortDefinition> {
        Ok(self.shared.port(port)?.definition())
    }

    /// Replace a port definition. Only allowed while Loaded or with the port disabled.
    pub fn set_port_definition(&self, definition: PortDefinition) -> Result<()> {
        let port = self.shared.port(definition.index)?;
        self.check_reconfigurable(port)?;
        definition.validate()?;
        port.apply_definition(&definition)?;
        debug!("{}: {} port definition updated", self.shared.id, port.direction());
        Ok(())
    }

    /// Configure tunneling on a port
    pub fn set_port_tunnel(&self, port: usize, tunneled: bool, supplier: bool) -> Result<()> {
        let port = self.shared.port(port)?;
        self.check_reconfigurable(port)?;
        port.set_tunnel(tunneled, supplier);
        Ok(())
    }

    fn check_reconfigurable(&self, port: &Port) -> Result<()> {
        if self.shared.state() == ComponentState::Loaded || !port.enabled() {
            Ok(())
        } else {
            Err(CodecError::invalid_state(format!(
                "{} port can only be reconfigured while Loaded or disabled",
                port.direction()
            )))
        }
    }

    /// Register client memory as a buffer on a port.
    ///
    /// # Arguments
    ///
    /// * `port` - Port index
    /// * `data` - Backing memory; at least the port's `buffer_size` bytes
    ///
    /// # Returns
    ///
    /// The new buffer, owned by the client
    pub fn register_buffer(&self, port: usize, data: Vec<u8>) -> Result<BufferRef> {
        let target = self.shared.port(port)?;
        self.check_registration(target, data.len())?;
        let memory = Arc::new(MemoryBlock::from_vec(next_memory_id(), MemoryKind::System, data));
        self.add_buffer(target, memory, false)
    }

    /// Allocate a buffer of `size` bytes on a port
    pub fn allocate_buffer(&self, port: usize, size: usize) -> Result<BufferRef> {
        let target = self.shared.port(port)?;
        self.check_registration(target, size)?;
        let memory = self.shared.allocator.alloc(size, MemoryKind::Contiguous)?;
        self.add_buffer(target, memory.clone(), true).inspect_err(|_| {
            if let Err(err) = self.shared.allocator.free(&memory) {
                warn!("{}: failed to free unregistered memory: {}", self.shared.id, err);
            }
        })
    }

    fn check_registration(&self, port: &Port, size: usize) -> Result<()> {
        let state = self.shared.state();
        let allowed = match port.state() {
            PortState::Enabling => true,
            _ => port.enabled() && matches!(state, ComponentState::Loaded | ComponentState::WaitForResources),
        };
        if !allowed {
            return Err(CodecError::invalid_state(format!(
                "cannot register buffers on the {} port in {}",
                port.direction(),
                state
            )));
        }

        let minimum = port.definition().buffer_size;
        if size < minimum {
            return Err(CodecError::BadParameter(format!(
                "buffer of {} bytes is smaller than the port minimum of {}",
                size, minimum
            )));
        }
        Ok(())
    }

    fn add_buffer(&self, port: &Port, memory: MemoryRef, allocated: bool) -> Result<BufferRef> {
        let id = BufferId(self.shared.next_buffer_id());
        let owner = self.shared.id;
        let direction = port.direction();
        let (buffer, populated) = port.register(|slot| {
            Ok(Arc::new(BufferHeader::new(id, owner, direction, slot, memory, allocated)))
        })?;

        debug!(
            "{}: registered buffer {} on {} port slot {}",
            owner,
            id.0,
            direction,
            buffer.slot()
        );
        if populated {
            info!("{}: {} port populated", owner, direction);
        }
        Ok(buffer)
    }

    /// Unregister a client-owned buffer.
    ///
    /// Freeing outside a Loaded transition or a port disable leaves the port
    /// unpopulated and raises `Error(PortUnpopulated)`.
    pub fn free_buffer(&self, buffer: &BufferRef) -> Result<()> {
        self.check_owner(buffer)?;
        let port = self.shared.port(buffer.port_index())?;
        let state = self.shared.state();
        let expected = matches!(
            state,
            ComponentState::Loaded | ComponentState::WaitForResources | ComponentState::Invalid
        ) || self.shared.pending_transition() == Some(ComponentState::Loaded)
            || port.state().is_transitioning()
            || !port.enabled();

        port.unregister(buffer).inspect_err(|err| {
            warn!("{}: cannot free buffer {}: {}", self.shared.id, buffer.id().0, err);
        })?;

        if buffer.allocated_by_component() {
            self.shared.allocator.free(buffer.memory())?;
        }
        trace!("{}: freed buffer {}", self.shared.id, buffer.id().0);

        if !expected {
            warn!(
                "{}: buffer {} freed while the {} port is in use",
                self.shared.id,
                buffer.id().0,
                port.direction()
            );
            self.shared.emit(ComponentEvent::Error(ErrorCode::PortUnpopulated));
        }
        Ok(())
    }

    fn check_owner(&self, buffer: &BufferRef) -> Result<()> {
        if buffer.owner() != self.shared.id {
            return Err(CodecError::InvalidBuffer(format!(
                "buffer {} belongs to {}",
                buffer.id().0,
                buffer.owner()
            )));
        }
        Ok(())
    }

    /// Hand a filled input buffer to the component
    pub fn empty_this_buffer(&self, buffer: &BufferRef) -> Result<()> {
        self.submit(buffer, Direction::Input)
    }

    /// Hand an empty output buffer to the component
    pub fn fill_this_buffer(&self, buffer: &BufferRef) -> Result<()> {
        self.submit(buffer, Direction::Output)
    }

    fn submit(&self, buffer: &BufferRef, direction: Direction) -> Result<()> {
        self.check_owner(buffer)?;
        if buffer.direction() != direction {
            return Err(CodecError::BadParameter(format!(
                "buffer {} belongs to the {} port",
                buffer.id().0,
                buffer.direction()
            )));
        }

        let port = self.shared.port(buffer.port_index())?;
        let _submission = port.submission.lock();
        let state = self.shared.state();
        if !state.accepts_buffers() {
            return Err(CodecError::invalid_state(format!("cannot submit buffers in {}", state)));
        }
        let port_state = port.state();
        if !port.enabled() || matches!(port_state, PortState::Disabling | PortState::FlushingForDisable) {
            return Err(CodecError::invalid_state(format!("{} port is disabled", port.direction())));
        }
        if port_state.is_flushing() && !(port.is_tunneled() && port.is_supplier()) {
            return Err(CodecError::invalid_state(format!("{} port is flushing", port.direction())));
        }

        let meta = buffer.meta();
        if meta.offset + meta.filled_len > buffer.alloc_len() {
            return Err(CodecError::BadParameter(format!(
                "buffer {} payload {}+{} exceeds {} bytes",
                buffer.id().0,
                meta.offset,
                meta.filled_len,
                buffer.alloc_len()
            )));
        }

        if let Err(err) = port.acquire(buffer) {
            warn!("{}: rejected submit: {}", self.shared.id, err);
            PipelineCounters::bump(&self.shared.stats.protocol_rejections);
            return Err(err);
        }

        let message = match direction {
            Direction::Input => {
                if let Some(mark) = port.take_pending_mark() {
                    if !buffer.attach_mark_if_empty(mark) {
                        port.set_pending_mark(mark);
                    }
                }
                PipelineMessage::empty_buffer(buffer.clone())
            }
            Direction::Output => PipelineMessage::fill_buffer(buffer.clone()),
        };

        if let Err(err) = port.queue.push(message) {
            if let Err(release_err) = port.release(buffer) {
                warn!("{}: cannot roll back buffer {}: {}", self.shared.id, buffer.id().0, release_err);
            }
            return Err(err);
        }
        trace!(
            "{}: buffer {} queued on {} port ({} bytes)",
            self.shared.id,
            buffer.id().0,
            direction,
            meta.filled_len
        );
        Ok(())
    }

    /// Flush a port synchronously and return how many buffers went back
    pub fn flush(&self, port: usize, raise_event: bool) -> Result<usize> {
        self.shared.port(port)?;
        pipeline::flush_port(&self.shared, port, raise_event, false)
    }

    /// Enable a port synchronously, waiting for it to be populated
    pub fn enable_port(&self, port: usize) -> Result<()> {
        command::enable_port(&self.shared, port)
    }

    /// Disable a port synchronously, waiting for its buffers to be freed
    pub fn disable_port(&self, port: usize) -> Result<()> {
        command::disable_port(&self.shared, port)
    }

    /// Spawn the stage threads outside a state transition
    pub fn start_pipeline(&self) -> Result<()> {
        pipeline::start(&self.shared)
    }

    /// Stop and join the stage threads
    pub fn stop_pipeline(&self) {
        pipeline::stop(&self.shared);
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        self.shared.set_closing();
        let _ = self.commands.send(CommandMessage::Shutdown);
        if let Some(handle) = self.command_thread.take() {
            if handle.join().is_err() {
                error!("{}: command thread panicked", self.shared.id);
            }
        }

        pipeline::stop(&self.shared);

        let allocator = self.shared.allocator.as_ref();
        for port in &self.shared.ports {
            port.release_codec_pool(allocator);
            for buffer in port.buffers() {
                if buffer.allocated_by_component() {
                    if let Err(err) = allocator.free(buffer.memory()) {
                        warn!("{}: failed to free buffer memory: {}", self.shared.id, err);
                    }
                }
            }
        }
        info!("{}: destroyed", self.shared.id);
    }
}
