//! Integration tests for component state, port commands and flushing
//!
//! These tests verify:
//! - Legal and illegal state transitions
//! - Resource rendezvous on Loaded -> Idle
//! - Flush returning every held buffer
//! - Port disable/enable after a codec format change
//! - Shutdown from any state

use anyhow::Result;
use hwcodec::codec::{DriverError, PortFormat};
use hwcodec::component::CompletedCommand;
use hwcodec::port::{ExceptionFlag, PortState};
use hwcodec::{
    BufferFlags, CodecError, Command, ComponentEvent, ComponentState, ErrorCode, PortSelector, ProcessType,
};
use hwcodec_integration_tests::{
    numbered_stream, test_config, wait_until, Frame, ScriptedDriver, TestFixture,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_full_state_cycle() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    assert_eq!(fixture.component.state(), ComponentState::Loaded);

    fixture.to_idle()?;
    assert_eq!(fixture.component.state(), ComponentState::Idle);
    assert_eq!(fixture.component.port_state(0)?, PortState::Idle);

    fixture.set_state(ComponentState::Executing)?;
    fixture.set_state(ComponentState::Pause)?;
    assert_eq!(fixture.component.port_state(1)?, PortState::Pause);
    fixture.set_state(ComponentState::Executing)?;

    fixture.to_loaded()?;
    assert_eq!(fixture.component.state(), ComponentState::Loaded);
    assert_eq!(fixture.allocator.live_blocks(), 0);
    Ok(())
}

#[test]
fn test_illegal_transitions_are_reported() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;

    fixture
        .component
        .send_command(Command::StateSet(ComponentState::Executing))?;
    fixture.wait_event(|e| *e == ComponentEvent::Error(ErrorCode::IncorrectStateTransition))?;

    fixture
        .component
        .send_command(Command::StateSet(ComponentState::Loaded))?;
    fixture.wait_event(|e| *e == ComponentEvent::Error(ErrorCode::SameState))?;

    assert_eq!(fixture.component.state(), ComponentState::Loaded);
    Ok(())
}

#[test]
fn test_idle_times_out_without_buffers() -> Result<()> {
    let mut config = test_config(ProcessType::Share);
    config.pipeline.rendezvous_timeout_ms = 200;
    let mut fixture = TestFixture::loopback_with_config(config, 0)?;

    fixture
        .component
        .send_command(Command::StateSet(ComponentState::Idle))?;
    fixture.wait_event(|e| *e == ComponentEvent::Error(ErrorCode::Timeout))?;
    assert_eq!(fixture.component.state(), ComponentState::Loaded);

    // A second attempt with buffers goes through
    fixture.to_idle()?;
    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_disabled_port_is_skipped_by_idle_transition() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.component.disable_port(0)?;
    assert!(!fixture.component.port_definition(0)?.enabled);
    assert!(fixture.component.disable_port(0).is_err());

    fixture.to_idle()?;
    assert!(fixture.inputs.is_empty());
    assert_eq!(fixture.outputs.len(), 4);

    fixture.to_loaded()?;
    fixture.component.enable_port(0)?;
    assert!(fixture.component.port_definition(0)?.enabled);
    Ok(())
}

#[test]
fn test_failed_enable_marks_port_for_disable() -> Result<()> {
    let mut config = test_config(ProcessType::Share);
    config.pipeline.rendezvous_timeout_ms = 200;
    let mut fixture = TestFixture::loopback_with_config(config, 0)?;
    fixture.component.disable_port(0)?;
    fixture.to_idle()?;

    // Nobody allocates input buffers, so the rendezvous times out
    let err = fixture.component.enable_port(0).unwrap_err();
    assert!(matches!(err, CodecError::Timeout(_)), "{:?}", err);
    assert_eq!(fixture.component.port_exception(0)?, ExceptionFlag::NeedDisable);
    assert!(!fixture.component.port_definition(0)?.enabled);
    assert_eq!(fixture.component.port_state(0)?, PortState::Idle);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_port_definition_locked_while_enabled_past_loaded() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_idle()?;

    let definition = fixture.component.port_definition(1)?;
    let err = fixture.component.set_port_definition(definition).unwrap_err();
    assert!(matches!(err, CodecError::InvalidState(_)), "{:?}", err);

    fixture.to_loaded()?;
    let definition = fixture.component.port_definition(1)?;
    fixture.component.set_port_definition(definition)?;
    Ok(())
}

#[test]
fn test_flush_returns_queued_and_staged_buffers() -> Result<()> {
    let driver = Arc::new(ScriptedDriver::rejecting(DriverError::DecodeYet));
    let mut fixture = TestFixture::new(test_config(ProcessType::Share), driver.clone())?;
    fixture.to_executing()?;

    let submitted: Vec<_> = fixture.inputs[..3].to_vec();
    for (index, buffer) in submitted.iter().enumerate() {
        fixture.feed(buffer, &Frame::new(b"stuck", index as i64, BufferFlags::empty()))?;
    }
    // One buffer sits in the src-in slot, retried against a busy codec
    wait_until(|| driver.input_attempts() > 0)?;

    let returned = fixture.component.flush(0, true)?;
    assert_eq!(returned, 3);

    let mut ids = HashSet::new();
    for _ in 0..3 {
        let buffer = fixture.wait_empty_done()?;
        assert_eq!(buffer.filled_len(), 0);
        ids.insert(buffer.id());
    }
    let expected: HashSet<_> = submitted.iter().map(|b| b.id()).collect();
    assert_eq!(ids, expected);

    fixture.wait_command(CompletedCommand::Flush(0))?;
    assert_eq!(fixture.component.stats().flushes, 1);
    assert_eq!(fixture.component.state(), ComponentState::Executing);
    assert_eq!(fixture.component.port_state(0)?, PortState::Executing);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_flush_output_returns_codec_held_buffers() -> Result<()> {
    let driver = Arc::new(ScriptedDriver::rejecting(DriverError::DecodeYet));
    let mut fixture = TestFixture::new(test_config(ProcessType::Share), driver.clone())?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;
    wait_until(|| driver.held_outputs() == 4)?;

    fixture
        .component
        .send_command(Command::Flush(PortSelector::Port(1)))?;
    for _ in 0..4 {
        assert_eq!(fixture.wait_fill_done()?.filled_len(), 0);
    }
    fixture.wait_command(CompletedCommand::Flush(1))?;
    assert_eq!(driver.held_outputs(), 0);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_stream_resumes_after_flush() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Copy, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    fixture
        .component
        .send_command(Command::Flush(PortSelector::All))?;
    fixture.wait_command(CompletedCommand::Flush(0))?;
    fixture.wait_command(CompletedCommand::Flush(1))?;
    for _ in 0..4 {
        fixture.wait_fill_done()?;
    }

    fixture.submit_outputs()?;
    let delivered = fixture.run_stream(&numbered_stream(&[500, 600, 700]))?;
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[0].timestamp, 500);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_executing_to_idle_returns_everything() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    fixture.set_state(ComponentState::Idle)?;
    for _ in 0..4 {
        assert_eq!(fixture.wait_fill_done()?.filled_len(), 0);
    }

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_port_reconfiguration_after_format_change() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let loopback = fixture.loopback.clone().expect("loopback driver");
    loopback.announce_format(PortFormat {
        buffer_size: 8192,
        buffer_count: 6,
    });
    fixture.wait_event(|e| *e == ComponentEvent::PortSettingsChanged { port: 1 })?;

    fixture
        .component
        .send_command(Command::PortDisable(PortSelector::Port(1)))?;
    for _ in 0..4 {
        let buffer = fixture.wait_fill_done()?;
        fixture.component.free_buffer(&buffer)?;
    }
    fixture.wait_command(CompletedCommand::PortDisable(1))?;
    fixture.outputs.clear();

    let definition = fixture.component.port_definition(1)?;
    assert!(!definition.enabled);
    assert_eq!(definition.buffer_count, 6);
    assert_eq!(definition.buffer_size, 8192);

    fixture
        .component
        .send_command(Command::PortEnable(PortSelector::Port(1)))?;
    wait_until(|| fixture.component.port_state(1).ok() == Some(PortState::Enabling))?;
    for _ in 0..6 {
        let buffer = fixture.component.allocate_buffer(1, 8192)?;
        fixture.outputs.push(buffer);
    }
    fixture.wait_command(CompletedCommand::PortEnable(1))?;
    assert!(!fixture.saw_event(|e| *e == ComponentEvent::Error(ErrorCode::PortUnpopulated)));

    fixture.submit_outputs()?;
    let delivered = fixture.run_stream(&numbered_stream(&[0, 1_000]))?;
    assert_eq!(delivered.len(), 2);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_free_buffer_while_executing_reports_unpopulated() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;

    let buffer = fixture.inputs.pop().expect("input buffer");
    fixture.component.free_buffer(&buffer)?;
    fixture.wait_event(|e| *e == ComponentEvent::Error(ErrorCode::PortUnpopulated))?;
    Ok(())
}

#[test]
fn test_shutdown_while_paused_is_bounded() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 2)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let first = fixture.inputs[0].clone();
    fixture.feed(&first, &Frame::new(b"held", 0, BufferFlags::SYNC_FRAME))?;
    fixture.set_state(ComponentState::Pause)?;

    let started = Instant::now();
    drop(fixture);
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test]
async fn test_stream_from_async_context() -> Result<()> {
    let delivered = tokio::task::spawn_blocking(|| -> Result<usize> {
        let mut fixture = TestFixture::loopback(ProcessType::CopyForced, 1)?;
        fixture.to_executing()?;
        fixture.submit_outputs()?;
        let delivered = fixture.run_stream(&numbered_stream(&[0, 40, 80, 120, 160]))?;
        fixture.to_loaded()?;
        Ok(delivered.len())
    })
    .await??;

    assert_eq!(delivered, 5);
    Ok(())
}
