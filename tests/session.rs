//! Full session bring-up and polling against the scripted mock device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use payoutd::device::{Device, SessionPhase};
use payoutd::events::{self, FollowUp};
use payoutd::mock::{self, MockDevice};
use payoutd::ssp::commands::cmd;
use payoutd::ssp::poll::event;
use payoutd::ssp::SspLink;

mod common;

// Builds a mock device plus the host link talking to it.
fn harness() -> (SspLink<mock::MockPort>, MockDevice) {
    let (host, peer) = mock::pair();
    (SspLink::new(host), MockDevice::new(peer))
}

#[test]
fn validator_bring_up_negotiates_key_and_caches_channels() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let log = device.command_log();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut validator = Device::validator();
    validator.initialize(&mut link)?;

    assert_eq!(validator.phase, SessionPhase::Enabled);
    assert!(validator.available);
    assert!(validator.session.key.is_some());
    assert_eq!(validator.setup.as_ref().map(|s| s.channels.len()), Some(4));

    // the bring-up starts with SYNC and negotiates the key before anything
    // protocol-level
    let seen = log.lock().expect("log").clone();
    assert_eq!(seen[0], cmd::SYNC);
    assert_eq!(seen[1], cmd::SET_GENERATOR);
    assert_eq!(seen[2], cmd::SET_MODULUS);
    assert_eq!(seen[3], cmd::REQUEST_KEY_EXCHANGE);
    assert!(seen.contains(&cmd::ENABLE));
    assert!(seen.contains(&cmd::ENABLE_PAYOUT));

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn poll_returns_events_in_device_order() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let events_queue = device.event_queue();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut validator = Device::validator();
    validator.initialize(&mut link)?;

    // READ(channel 1) must precede CREDIT(channel 1) for the same note
    events_queue
        .lock()
        .expect("events")
        .push_back(vec![event::READ, 0x01, event::CREDIT, 0x01]);

    let (status, poll_events) = validator.poll(&mut link)?;
    assert!(status.is_ok());
    assert_eq!(poll_events.len(), 2);
    assert_eq!(poll_events[0].code, event::READ);
    assert_eq!(poll_events[1].code, event::CREDIT);

    // channel 1 has face value 5, so the validator credit document carries
    // 500 cents
    let (doc, follow_up) = events::translate(&validator, &poll_events[1]);
    assert_eq!(
        doc,
        serde_json::json!({"event": "credit", "amount": 500, "channel": 1})
    );
    assert_eq!(follow_up, FollowUp::None);

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn key_not_set_triggers_renegotiation_and_one_retry() -> payoutd::Result<()> {
    common::init();

    let (mut link, mut device) = harness();
    device.stage_response(cmd::POLL, payoutd::ssp::ResponseStatus::KeyNotSet, Vec::new());
    let log = device.command_log();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();
    hopper.initialize(&mut link)?;

    log.lock().expect("log").clear();
    let (status, poll_events) = hopper.poll(&mut link)?;

    // the stubborn device keeps answering KEY NOT SET; after renegotiating
    // and retrying once the status is surfaced
    assert_eq!(status, payoutd::ssp::ResponseStatus::KeyNotSet);
    assert!(poll_events.is_empty());

    let seen = log.lock().expect("log").clone();
    assert_eq!(
        seen,
        vec![
            cmd::POLL,
            cmd::SET_GENERATOR,
            cmd::SET_MODULUS,
            cmd::REQUEST_KEY_EXCHANGE,
            cmd::POLL,
        ]
    );

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn unit_reset_event_forces_host_protocol_renegotiation() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let events_queue = device.event_queue();
    let log = device.command_log();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();
    hopper.initialize(&mut link)?;

    events_queue
        .lock()
        .expect("events")
        .push_back(vec![event::RESET]);

    let (status, poll_events) = hopper.poll(&mut link)?;
    assert!(status.is_ok());

    let (doc, follow_up) = events::translate(&hopper, &poll_events[0]);
    assert_eq!(doc, serde_json::json!({"event": "unit reset"}));
    assert_eq!(follow_up, FollowUp::UnitReset);

    log.lock().expect("log").clear();
    hopper.on_unit_reset(&mut link)?;

    // the very next command on the wire is HOST PROTOCOL
    let seen = log.lock().expect("log").clone();
    assert_eq!(seen.first(), Some(&cmd::HOST_PROTOCOL));
    assert!(hopper.session.key.is_none());
    assert_eq!(hopper.phase, SessionPhase::Fresh);

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}
