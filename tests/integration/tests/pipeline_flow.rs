//! Integration tests for buffer flow through the four pipeline stages
//!
//! These tests verify:
//! - Payload and timestamp delivery in Share and Copy modes
//! - Reordering and the start-timestamp gate
//! - End-of-stream handling, with and without payload
//! - Mark propagation
//! - Driver error recovery

use anyhow::Result;
use hwcodec::buffer::BufferMark;
use hwcodec::codec::DriverError;
use hwcodec::component::CompletedCommand;
use hwcodec::{
    BufferFlags, Command, ComponentEvent, ComponentState, ErrorCode, ProcessType,
};
use hwcodec_integration_tests::{numbered_stream, test_config, Frame, ScriptedDriver, TestFixture};
use std::sync::Arc;

#[test]
fn test_share_mode_delivers_timestamps_in_order() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let delivered = fixture.run_stream(&numbered_stream(&[100, 200, 300]))?;

    let timestamps: Vec<i64> = delivered.iter().map(|d| d.timestamp).collect();
    assert_eq!(timestamps, vec![100, 200, 300]);
    assert_eq!(delivered[0].payload, b"frame-0");
    assert_eq!(delivered[2].payload, b"frame-2");
    assert!(delivered[2].flags.contains(BufferFlags::EOS));
    assert!(!delivered[0].flags.contains(BufferFlags::EOS));
    assert!(fixture.saw_event(|e| matches!(
        e,
        ComponentEvent::BufferFlag { port: 1, flags } if flags.contains(BufferFlags::EOS)
    )));

    let stats = fixture.component.stats();
    assert_eq!(stats.frames_submitted, 3);
    assert_eq!(stats.frames_delivered, 3);
    assert_eq!(stats.timestamp_warnings, 0);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_copy_mode_preserves_fifo_order() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Copy, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let timestamps: Vec<i64> = (0..10).map(|i| i * 1_000).collect();
    let delivered = fixture.run_stream(&numbered_stream(&timestamps))?;

    assert_eq!(delivered.len(), 10);
    for (index, frame) in delivered.iter().enumerate() {
        assert_eq!(frame.timestamp, timestamps[index]);
        assert_eq!(frame.payload, format!("frame-{}", index).into_bytes());
    }
    assert_eq!(fixture.component.stats().frames_delivered, 10);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_reordering_codec_output_follows_presentation_order() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 2)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    // Decode order I P B B
    let delivered = fixture.run_stream(&numbered_stream(&[0, 3_000, 1_000, 2_000]))?;

    let timestamps: Vec<i64> = delivered.iter().map(|d| d.timestamp).collect();
    assert_eq!(timestamps, vec![0, 1_000, 2_000, 3_000]);
    assert_eq!(delivered[1].payload, b"frame-2");
    assert_eq!(fixture.component.stats().timestamp_warnings, 0);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_frames_before_start_timestamp_are_dropped() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 2)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let delivered = fixture.run_stream(&numbered_stream(&[100, 50, 200]))?;

    let timestamps: Vec<i64> = delivered.iter().map(|d| d.timestamp).collect();
    assert_eq!(timestamps, vec![100, 200]);
    assert_eq!(fixture.component.stats().frames_dropped, 1);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_eos_only_input_bypasses_codec() -> Result<()> {
    for process_type in [ProcessType::Share, ProcessType::Copy] {
        let mut fixture = TestFixture::loopback(process_type, 0)?;
        fixture.to_executing()?;
        fixture.submit_outputs()?;

        let frames = vec![
            Frame::new(b"a", 10, BufferFlags::SYNC_FRAME),
            Frame::new(b"b", 20, BufferFlags::empty()),
            Frame::new(b"", 30, BufferFlags::EOS),
        ];
        let delivered = fixture.run_stream(&frames)?;

        assert_eq!(delivered.len(), 3, "{:?}", process_type);
        let last = &delivered[2];
        assert!(last.payload.is_empty());
        assert!(last.flags.contains(BufferFlags::EOS));
        assert_eq!(last.timestamp, 30);
        assert_eq!(fixture.component.stats().eos_bypassed, 1);

        fixture.to_loaded()?;
    }
    Ok(())
}

#[test]
fn test_mark_targeting_component_raises_event() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let mark = BufferMark {
        target: fixture.component.id(),
        data: 7,
    };
    fixture
        .component
        .send_command(Command::MarkBuffer { port: 0, mark })?;
    fixture.wait_command(CompletedCommand::MarkBuffer(0))?;

    fixture.run_stream(&numbered_stream(&[0, 1_000]))?;
    assert!(fixture.saw_event(|e| *e == ComponentEvent::Mark { data: 7 }));

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_foreign_mark_travels_to_output() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let mark = BufferMark {
        target: hwcodec::component::ComponentId(u64::MAX),
        data: 42,
    };
    fixture.inputs[0].set_mark(Some(mark));
    let delivered = fixture.run_stream(&numbered_stream(&[0, 1_000]))?;

    assert_eq!(delivered[0].mark, Some(mark));
    assert!(!fixture.saw_event(|e| matches!(e, ComponentEvent::Mark { .. })));

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_escalated_driver_error_returns_buffer() -> Result<()> {
    let driver = Arc::new(ScriptedDriver::rejecting(DriverError::Hardware("bus error".into())));
    let mut fixture = TestFixture::new(test_config(ProcessType::Share), driver.clone())?;
    fixture.to_executing()?;

    let input = fixture.inputs[0].clone();
    fixture.feed(&input, &Frame::new(b"payload", 0, BufferFlags::empty()))?;

    let returned = fixture.wait_empty_done()?;
    assert_eq!(returned.id(), input.id());
    assert_eq!(returned.filled_len(), 0);
    fixture.wait_event(|e| *e == ComponentEvent::Error(ErrorCode::Hardware))?;

    assert_eq!(fixture.component.state(), ComponentState::Executing);
    assert_eq!(fixture.component.stats().driver_errors, 1);
    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_corrupted_input_is_skipped() -> Result<()> {
    let driver = Arc::new(ScriptedDriver::rejecting(DriverError::Corrupted));
    let mut fixture = TestFixture::new(test_config(ProcessType::Share), driver)?;
    fixture.to_executing()?;

    let input = fixture.inputs[0].clone();
    fixture.feed(&input, &Frame::new(b"garbage", 0, BufferFlags::empty()))?;
    fixture.wait_empty_done()?;

    assert_eq!(fixture.component.stats().frames_corrupted, 1);
    assert!(!fixture.saw_event(|e| matches!(e, ComponentEvent::Error(_))));
    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_fatal_driver_error_invalidates_component() -> Result<()> {
    let driver = Arc::new(ScriptedDriver::rejecting(DriverError::InitFailed("firmware".into())));
    let mut fixture = TestFixture::new(test_config(ProcessType::Share), driver)?;
    fixture.to_executing()?;

    let input = fixture.inputs[0].clone();
    fixture.feed(&input, &Frame::new(b"payload", 0, BufferFlags::empty()))?;
    fixture.wait_event(|e| *e == ComponentEvent::Error(ErrorCode::InvalidState))?;

    assert_eq!(fixture.component.state(), ComponentState::Invalid);
    assert!(fixture
        .component
        .send_command(Command::Flush(hwcodec::PortSelector::All))
        .is_err());
    assert!(fixture.component.empty_this_buffer(&fixture.inputs[1]).is_err());
    Ok(())
}
