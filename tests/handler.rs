//! Request handling scenarios against the scripted mock device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use payoutd::device::Device;
use payoutd::handler;
use payoutd::mock::{self, MockDevice};
use payoutd::ssp::commands::cmd;
use payoutd::ssp::{ResponseStatus, SspLink};
use serde_json::Value;

mod common;

fn harness() -> (SspLink<mock::MockPort>, MockDevice) {
    let (host, peer) = mock::pair();
    (SspLink::new(host), MockDevice::new(peer))
}

fn run_one(
    device: &mut Device,
    link: &mut SspLink<mock::MockPort>,
    request: &str,
) -> handler::Outcome {
    handler::process(device, link, true, request).expect("process")
}

#[test]
fn configure_bezel_happy_path() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();
    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"configure-bezel","msgId":"A","r":255,"g":0,"b":0,"type":1}"#,
    );

    let doc = outcome.response.expect("response");
    assert_eq!(doc["correlId"], "A");
    assert_eq!(doc["result"], "ok");
    assert!(doc["msgId"].is_string());

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn configure_bezel_missing_property_transmits_nothing() {
    common::init();

    // no serving thread: any transmitted frame would show up in the log
    let (mut link, device) = harness();
    let log = device.command_log();

    let mut hopper = Device::hopper();
    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"configure-bezel","msgId":"B","r":255,"g":0,"b":0}"#,
    );

    let doc = outcome.response.expect("response");
    assert_eq!(doc["correlId"], "B");
    assert_eq!(doc["error"], "Property 'type' missing or of wrong type");
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn configure_bezel_rejects_out_of_range_component() {
    common::init();

    let (mut link, device) = harness();
    let log = device.command_log();

    let mut hopper = Device::hopper();
    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"configure-bezel","msgId":"B2","r":256,"g":0,"b":0,"type":1}"#,
    );

    let doc = outcome.response.expect("response");
    assert_eq!(doc["error"], "Property 'r' missing or of wrong type");
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn do_payout_reports_cant_pay_exact_sub_error() -> payoutd::Result<()> {
    common::init();

    let (mut link, mut device) = harness();
    device.stage_response(
        cmd::PAYOUT_AMOUNT,
        ResponseStatus::CommandNotProcessed,
        vec![0x02],
    );
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut validator = Device::validator();
    let outcome = run_one(
        &mut validator,
        &mut link,
        r#"{"cmd":"do-payout","msgId":"C","amount":1234}"#,
    );

    let doc = outcome.response.expect("response");
    assert_eq!(doc["correlId"], "C");
    assert_eq!(doc["error"], "can't pay exact amount");

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn unknown_command_echoes_cmd() {
    common::init();

    let (mut link, device) = harness();
    let log = device.command_log();

    let mut hopper = Device::hopper();
    let outcome = run_one(&mut hopper, &mut link, r#"{"cmd":"nope","msgId":"D"}"#);

    let doc = outcome.response.expect("response");
    assert_eq!(doc["correlId"], "D");
    assert_eq!(doc["error"], "unknown command");
    assert_eq!(doc["cmd"], "nope");
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn get_all_levels_with_zero_counters_yields_empty_array() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();
    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"get-all-levels","msgId":"L1"}"#,
    );

    let doc = outcome.response.expect("response");
    assert_eq!(doc["correlId"], "L1");
    assert_eq!(doc["levels"], Value::Array(Vec::new()));

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn cashbox_operation_data_always_appends_unknown_coin_entry() -> payoutd::Result<()> {
    common::init();

    let (mut link, mut device) = harness();
    // zero counters, 7 unidentifiable coins
    device.stage_response(
        cmd::CASHBOX_PAYOUT_OPERATION_DATA,
        ResponseStatus::Ok,
        vec![0x00, 0x07, 0x00, 0x00],
    );
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();
    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"cashbox-payout-operation-data","msgId":"L2"}"#,
    );

    let doc = outcome.response.expect("response");
    let levels = doc["levels"].as_array().expect("levels");
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0], serde_json::json!({"value": 0, "level": 7}));

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn set_denomination_level_issues_clear_then_set() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let log = device.command_log();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();

    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"set-denomination-level","msgId":"S1","level":5,"amount":200}"#,
    );
    assert_eq!(outcome.response.expect("response")["result"], "ok");
    assert_eq!(
        log.lock().expect("log").as_slice(),
        &[cmd::SET_DENOMINATION_LEVEL, cmd::SET_DENOMINATION_LEVEL]
    );

    log.lock().expect("log").clear();
    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"set-denomination-level","msgId":"S2","level":0,"amount":200}"#,
    );
    assert_eq!(outcome.response.expect("response")["result"], "ok");
    assert_eq!(
        log.lock().expect("log").as_slice(),
        &[cmd::SET_DENOMINATION_LEVEL]
    );

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn last_reject_note_maps_reason_phrase() -> payoutd::Result<()> {
    common::init();

    let (mut link, mut device) = harness();
    device.stage_response(cmd::LAST_REJECT_NOTE, ResponseStatus::Ok, vec![0x06]);
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut validator = Device::validator();
    let outcome = run_one(
        &mut validator,
        &mut link,
        r#"{"cmd":"last-reject-note","msgId":"R1"}"#,
    );

    let doc = outcome.response.expect("response");
    assert_eq!(doc["reason"], "channel inhibited");
    assert_eq!(doc["code"], 6);

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn ssp_error_statuses_map_to_phrases() -> payoutd::Result<()> {
    common::init();

    let (mut link, mut device) = harness();
    device.stage_response(cmd::EMPTY_ALL, ResponseStatus::Failure, Vec::new());
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();
    let outcome = run_one(&mut hopper, &mut link, r#"{"cmd":"empty","msgId":"F1"}"#);

    let doc = outcome.response.expect("response");
    assert_eq!(doc["correlId"], "F1");
    assert_eq!(doc["sspError"], "failure");

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn channel_security_data_is_diagnostic_only() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut validator = Device::validator();
    let outcome = run_one(
        &mut validator,
        &mut link,
        r#"{"cmd":"channel-security-data","msgId":"X1"}"#,
    );
    assert!(outcome.response.is_none());

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}

#[test]
fn inhibit_channels_sends_identical_bytes_for_identical_requests() -> payoutd::Result<()> {
    common::init();

    let (mut link, device) = harness();
    let stop = Arc::new(AtomicBool::new(false));
    let serving = mock::spawn(device, Arc::clone(&stop));

    let mut hopper = Device::hopper();

    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"inhibit-channels","msgId":"I1","channels":"26"}"#,
    );
    assert_eq!(outcome.response.expect("response")["result"], "ok");
    let first = hopper.inhibit_low;

    let outcome = run_one(
        &mut hopper,
        &mut link,
        r#"{"cmd":"inhibit-channels","msgId":"I2","channels":"26"}"#,
    );
    assert_eq!(outcome.response.expect("response")["result"], "ok");

    assert_eq!(hopper.inhibit_low, first);
    assert_eq!(hopper.inhibit_low, 0b1101_1101);

    stop.store(true, Ordering::SeqCst);
    serving.join().expect("join")?;
    Ok(())
}
