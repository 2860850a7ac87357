//! Command thread
//!
//! Asynchronous commands run here one at a time, in submission order. Each
//! finishes with either a `CommandComplete` or an `Error` event.

use super::{
    CompletedCommand, Command, ComponentEvent, ComponentShared, ComponentState, ErrorCode,
};
use crate::pipeline::{self, flush_port};
use crate::port::{ExceptionFlag, PortState, OUTPUT_PORT_INDEX};
use crate::utils::error::{CodecError, Result};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Message on the command channel
#[derive(Debug)]
pub(crate) enum CommandMessage {
    Run(Command),
    Shutdown,
}

pub(crate) fn run(shared: Arc<ComponentShared>, commands: Receiver<CommandMessage>) {
    debug!("{}: command thread started", shared.id);
    for message in commands.iter() {
        match message {
            CommandMessage::Run(command) => execute(&shared, command),
            CommandMessage::Shutdown => break,
        }
    }
    debug!("{}: command thread exited", shared.id);
}

fn execute(shared: &Arc<ComponentShared>, command: Command) {
    debug!("{}: executing {:?}", shared.id, command);
    match command {
        Command::StateSet(target) => set_state(shared, target),
        Command::Flush(selector) => {
            for index in selector.indices() {
                if let Err(err) = flush_port(shared, index, true, false) {
                    report(shared, &err);
                }
            }
        }
        Command::PortDisable(selector) => {
            for index in selector.indices() {
                match disable_port(shared, index) {
                    Ok(()) => shared.emit(ComponentEvent::CommandComplete(CompletedCommand::PortDisable(index))),
                    Err(err) => report(shared, &err),
                }
            }
        }
        Command::PortEnable(selector) => {
            for index in selector.indices() {
                match enable_port(shared, index) {
                    Ok(()) => shared.emit(ComponentEvent::CommandComplete(CompletedCommand::PortEnable(index))),
                    Err(err) => report(shared, &err),
                }
            }
        }
        Command::MarkBuffer { port, mark } => match shared.port(port) {
            Ok(target) => {
                target.set_pending_mark(mark);
                shared.emit(ComponentEvent::CommandComplete(CompletedCommand::MarkBuffer(port)));
            }
            Err(err) => report(shared, &err),
        },
    }
}

fn report(shared: &ComponentShared, err: &CodecError) {
    if err.is_precondition() {
        warn!("{}: command rejected: {}", shared.id, err);
    } else {
        error!("{}: command failed: {}", shared.id, err);
    }
    shared.emit_error(err);
}

fn set_state(shared: &Arc<ComponentShared>, target: ComponentState) {
    let current = shared.state();
    if current == target {
        warn!("{}: already in {}", shared.id, target);
        shared.emit(ComponentEvent::Error(ErrorCode::SameState));
        return;
    }
    if !current.can_transition_to(target) {
        warn!("{}: illegal transition {} -> {}", shared.id, current, target);
        shared.emit(ComponentEvent::Error(ErrorCode::IncorrectStateTransition));
        return;
    }

    shared.set_pending_transition(Some(target));
    let result = transition(shared, current, target);
    shared.set_pending_transition(None);

    match result {
        Ok(()) if target == ComponentState::Invalid => {}
        Ok(()) => shared.emit(ComponentEvent::CommandComplete(CompletedCommand::StateSet(target))),
        Err(err) => report(shared, &err),
    }
}

fn transition(shared: &Arc<ComponentShared>, current: ComponentState, target: ComponentState) -> Result<()> {
    use ComponentState::*;
    match (current, target) {
        (_, Invalid) => {
            shared.enter_invalid("requested by client");
            Ok(())
        }
        (Loaded | WaitForResources, Idle) => load_resources(shared),
        (Idle, Loaded) => unload_resources(shared),
        (Executing | Pause, Idle) => {
            for port in &shared.ports {
                if port.enabled() {
                    flush_port(shared, port.index(), false, false)?;
                }
            }
            shared.set_state(Idle);
            Ok(())
        }
        _ => {
            shared.set_state(target);
            Ok(())
        }
    }
}

/// Loaded -> Idle: start the stage threads and wait for every enabled port
/// to be populated
fn load_resources(shared: &Arc<ComponentShared>) -> Result<()> {
    let config = &shared.config.pipeline;
    shared.timestamps.lock().clear();
    shared.clear_eos_bypass();
    pipeline::start(shared)?;

    let result = shared
        .ports
        .iter()
        .filter(|port| port.enabled())
        .try_for_each(|port| {
            port.wait_populated(config.max_wait(), config.rendezvous_timeout(), || shared.should_abort())?;
            port.allocate_codec_pool(shared.allocator.as_ref())
        });

    if let Err(err) = result {
        warn!("{}: resources not granted: {}", shared.id, err);
        for port in &shared.ports {
            port.release_codec_pool(shared.allocator.as_ref());
        }
        pipeline::stop(shared);
        return Err(err);
    }

    shared.set_state(ComponentState::Idle);
    Ok(())
}

/// Idle -> Loaded: wait for the client to free every buffer
fn unload_resources(shared: &ComponentShared) -> Result<()> {
    let config = &shared.config.pipeline;
    for port in &shared.ports {
        port.wait_unpopulated(config.max_wait(), config.rendezvous_timeout(), || shared.should_abort())?;
    }

    pipeline::stop(shared);
    for port in &shared.ports {
        port.release_codec_pool(shared.allocator.as_ref());
    }
    shared.set_state(ComponentState::Loaded);
    Ok(())
}

/// Re-enable a port, waiting for the client to populate it if the component
/// is past Loaded
pub(crate) fn enable_port(shared: &ComponentShared, index: usize) -> Result<()> {
    let port = shared.port(index)?;
    let state = shared.state();
    if state == ComponentState::Invalid {
        return Err(CodecError::invalid_state("component is Invalid"));
    }
    if port.enabled() {
        return Err(CodecError::invalid_state(format!("{} port is already enabled", port.direction())));
    }
    info!("{}: enabling {} port", shared.id, port.direction());

    if matches!(state, ComponentState::Loaded | ComponentState::WaitForResources) {
        port.set_exception(ExceptionFlag::General);
        port.set_enabled(true);
        return Ok(());
    }

    port.set_state(PortState::Enabling);
    let config = &shared.config.pipeline;
    let result = port
        .wait_populated(config.max_wait(), config.rendezvous_timeout(), || shared.should_abort())
        .and_then(|()| port.allocate_codec_pool(shared.allocator.as_ref()));

    if let Err(err) = result {
        warn!("{}: {} port enable failed: {}", shared.id, port.direction(), err);
        port.set_exception(ExceptionFlag::NeedDisable);
        port.set_state(shared.port_state());
        return Err(err);
    }

    if index == OUTPUT_PORT_INDEX {
        shared.timestamps.lock().reset_output_order();
    }
    port.set_exception(ExceptionFlag::General);
    port.set_enabled(true);
    port.set_state(shared.port_state());
    port.enable_event.signal();
    Ok(())
}

/// Take a port out of processing: flush it, then wait for the client to
/// free every buffer
pub(crate) fn disable_port(shared: &ComponentShared, index: usize) -> Result<()> {
    let port = shared.port(index)?;
    if !port.enabled() {
        return Err(CodecError::invalid_state(format!("{} port is already disabled", port.direction())));
    }
    info!("{}: disabling {} port", shared.id, port.direction());

    let state = shared.state();
    port.set_state(PortState::Disabling);
    port.enable_event.signal();

    if !matches!(state, ComponentState::Loaded | ComponentState::WaitForResources) {
        if let Err(err) = flush_port(shared, index, false, true) {
            port.set_state(shared.port_state());
            return Err(err);
        }
    }
    port.release_codec_pool(shared.allocator.as_ref());

    let config = &shared.config.pipeline;
    let result = port
        .wait_unpopulated(config.max_wait(), config.rendezvous_timeout(), || shared.should_abort())
        .and_then(|()| port.sync_capacity());

    if let Err(err) = result {
        if let Err(pool_err) = port.allocate_codec_pool(shared.allocator.as_ref()) {
            warn!("{} port: codec pool not restored: {}", port.direction(), pool_err);
        }
        port.set_state(shared.port_state());
        return Err(err);
    }

    port.set_enabled(false);
    port.set_exception(ExceptionFlag::General);
    port.set_state(shared.port_state());
    Ok(())
}
