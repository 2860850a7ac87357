//! Integration tests for the buffer ownership protocol
//!
//! These tests verify:
//! - A buffer can be handed to the component only once
//! - Foreign and mis-directed buffers are rejected
//! - Owned buffers cannot be freed
//! - A flush hands every held buffer back exactly once
//! - A submit racing a flush is either rejected or returned exactly once

use anyhow::Result;
use hwcodec::codec::DriverError;
use hwcodec::utils::CodecError;
use hwcodec::{BufferFlags, ProcessType};
use hwcodec_integration_tests::{
    test_config, Frame, Notification, ScriptedDriver, TestFixture,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn stalled_fixture() -> Result<TestFixture> {
    let driver = Arc::new(ScriptedDriver::rejecting(DriverError::DecodeYet));
    let mut fixture = TestFixture::new(test_config(ProcessType::Share), driver)?;
    fixture.to_executing()?;
    Ok(fixture)
}

#[test]
fn test_double_submit_is_rejected() -> Result<()> {
    let mut fixture = stalled_fixture()?;
    let buffer = fixture.inputs[0].clone();
    fixture.feed(&buffer, &Frame::new(b"once", 0, BufferFlags::empty()))?;

    let err = fixture.component.empty_this_buffer(&buffer).unwrap_err();
    assert!(matches!(err, CodecError::AlreadyOwned(_)), "{:?}", err);
    assert_eq!(fixture.component.stats().protocol_rejections, 1);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_foreign_buffer_is_rejected() -> Result<()> {
    let mut first = TestFixture::loopback(ProcessType::Share, 0)?;
    let mut second = TestFixture::loopback(ProcessType::Share, 0)?;
    first.allocate_all()?;
    second.to_executing()?;

    let foreign = first.inputs[0].clone();
    let err = second.component.empty_this_buffer(&foreign).unwrap_err();
    assert!(matches!(err, CodecError::InvalidBuffer(_)), "{:?}", err);
    assert!(second.component.free_buffer(&foreign).is_err());

    second.to_loaded()?;
    Ok(())
}

#[test]
fn test_direction_mismatch_is_rejected() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;

    let output = fixture.outputs[0].clone();
    let err = fixture.component.empty_this_buffer(&output).unwrap_err();
    assert!(matches!(err, CodecError::BadParameter(_)), "{:?}", err);

    let input = fixture.inputs[0].clone();
    let err = fixture.component.fill_this_buffer(&input).unwrap_err();
    assert!(matches!(err, CodecError::BadParameter(_)), "{:?}", err);
    assert_eq!(fixture.component.stats().protocol_rejections, 0);

    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_owned_buffer_cannot_be_freed() -> Result<()> {
    let mut fixture = stalled_fixture()?;
    fixture.submit_outputs()?;

    let output = fixture.outputs[0].clone();
    assert!(fixture.component.free_buffer(&output).is_err());

    fixture.to_loaded()?;
    assert_eq!(fixture.allocator.live_blocks(), 0);
    Ok(())
}

#[test]
fn test_flush_returns_each_buffer_once() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 3)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    let fed: Vec<_> = fixture.inputs[..3].to_vec();
    for (index, buffer) in fed.iter().enumerate() {
        let frame = Frame::new(b"held", index as i64 * 100, BufferFlags::END_OF_FRAME);
        fixture.feed(buffer, &frame)?;
    }

    fixture.component.flush(0, false)?;
    fixture.component.flush(1, false)?;

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && (inputs.len() < 3 || outputs.len() < 4) {
        match fixture.next_notification(Duration::from_millis(20)) {
            Some(Notification::EmptyDone(buffer)) => inputs.push(buffer.id()),
            Some(Notification::FillDone(buffer)) => outputs.push(buffer.id()),
            _ => {}
        }
    }
    // Nothing else may trickle in afterwards
    while let Some(notification) = fixture.next_notification(Duration::from_millis(100)) {
        match notification {
            Notification::EmptyDone(buffer) => inputs.push(buffer.id()),
            Notification::FillDone(buffer) => outputs.push(buffer.id()),
            Notification::Event(_) => {}
        }
    }

    assert_eq!(inputs.len(), 3);
    assert_eq!(outputs.len(), 4);
    let expected: HashSet<_> = fed.iter().map(|b| b.id()).collect();
    assert_eq!(inputs.iter().copied().collect::<HashSet<_>>(), expected);
    assert_eq!(outputs.iter().copied().collect::<HashSet<_>>().len(), 4);

    // Every buffer is back with the client and can be handed over again
    fixture.submit_outputs()?;
    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_submit_racing_flush_comes_back_once() -> Result<()> {
    let mut fixture = TestFixture::loopback(ProcessType::Share, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;

    for round in 0..50usize {
        let buffer = fixture.inputs[round % fixture.inputs.len()].clone();
        let component = &fixture.component;
        let (flushed, submitted) = thread::scope(|scope| {
            let feeder = scope.spawn(|| {
                buffer.write(b"racing")?;
                buffer.set_timestamp(round as i64 * 1000);
                buffer.set_flags(BufferFlags::END_OF_FRAME);
                component.empty_this_buffer(&buffer)
            });
            let flushed = component.flush(0, false);
            (flushed, feeder.join())
        });
        flushed?;

        match submitted.expect("feeder thread panicked") {
            Ok(()) => {
                // Either the flush or the codec hands it back, never neither
                let deadline = Instant::now() + Duration::from_secs(3);
                let mut returned = false;
                while !returned && Instant::now() < deadline {
                    match fixture.next_notification(Duration::from_millis(20)) {
                        Some(Notification::EmptyDone(done)) => {
                            assert_eq!(done.id(), buffer.id(), "round {}", round);
                            returned = true;
                        }
                        Some(Notification::FillDone(output)) => fixture.component.fill_this_buffer(&output)?,
                        _ => {}
                    }
                }
                assert!(returned, "buffer {} stranded in round {}", buffer.id(), round);
            }
            Err(err) => assert!(matches!(err, CodecError::InvalidState(_)), "{:?}", err),
        }
    }

    while let Some(notification) = fixture.next_notification(Duration::from_millis(100)) {
        match notification {
            Notification::EmptyDone(buffer) => panic!("buffer {} returned twice", buffer.id()),
            Notification::FillDone(output) => fixture.component.fill_this_buffer(&output)?,
            Notification::Event(_) => {}
        }
    }

    // Freeing requires every input to be back with the client
    fixture.to_loaded()?;
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_submit_succeeds_once_per_buffer(order in proptest::collection::vec(0usize..4, 1..12)) {
        let mut fixture = stalled_fixture().unwrap();
        let mut submitted = HashSet::new();

        for index in &order {
            let buffer = fixture.inputs[*index].clone();
            let result = fixture.component.empty_this_buffer(&buffer);
            if submitted.insert(*index) {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(result, Err(CodecError::AlreadyOwned(_))));
            }
        }

        let rejections = fixture.component.stats().protocol_rejections;
        fixture.to_loaded().unwrap();
        prop_assert_eq!(rejections as usize, order.len() - submitted.len());
    }
}
