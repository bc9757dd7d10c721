//! Translation of device poll events into bus event documents.
//!
//! Every poll event becomes exactly one JSON document on the device's event
//! topic, published in device order. A few events additionally require a
//! hardware follow-up, which the dispatcher performs after publishing.

use serde_json::{json, Value};

use crate::device::{Device, DeviceKind};
use crate::ssp::poll::{calibration, event, PollEvent};

/// Hardware action owed after an event document was published.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// A unit reset was observed: the protocol version must be renegotiated
    /// before the next command.
    UnitReset,
    /// The device asked to be recalibrated.
    RunCalibration,
}

/// Builds the JSON document (and follow-up) for one poll event.
pub fn translate(device: &Device, event: &PollEvent) -> (Value, FollowUp) {
    match device.kind {
        DeviceKind::Hopper => hopper(event),
        DeviceKind::Validator => validator(device, event),
    }
}

fn calibration_error(sub: u8) -> &'static str {
    match sub {
        calibration::NO_ERROR => "no error",
        calibration::SENSOR_FLAP => "sensor flap",
        calibration::SENSOR_EXIT => "sensor exit",
        calibration::SENSOR_COIL_1 => "sensor coil 1",
        calibration::SENSOR_COIL_2 => "sensor coil 2",
        calibration::NOT_INITIALIZED => "not initialized",
        calibration::CHECKSUM_ERROR => "checksum error",
        _ => "undefined",
    }
}

fn calibration_fail(evt: &PollEvent) -> (Value, FollowUp) {
    if evt.data1 == calibration::COMMAND_RECAL as u32 {
        (json!({"event": "recalibrating"}), FollowUp::RunCalibration)
    } else {
        (
            json!({"event": "calibration fail", "error": calibration_error(evt.data1 as u8)}),
            FollowUp::None,
        )
    }
}

fn unknown(evt: &PollEvent) -> (Value, FollowUp) {
    (
        json!({"event": "unknown", "id": format!("0x{:02X}", evt.code)}),
        FollowUp::None,
    )
}

fn bare(word: &str) -> (Value, FollowUp) {
    (json!({ "event": word }), FollowUp::None)
}

fn hopper(evt: &PollEvent) -> (Value, FollowUp) {
    match evt.code {
        event::RESET => (json!({"event": "unit reset"}), FollowUp::UnitReset),
        event::READ if evt.data1 > 0 => {
            (json!({"event": "read", "channel": evt.data1}), FollowUp::None)
        }
        event::READ => bare("reading"),
        event::CREDIT => (
            json!({"event": "credit", "channel": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::TIMEOUT => (
            json!({"event": "timeout", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::DISPENSING => (json!({"event": "dispensing", "amount": evt.data1}), FollowUp::None),
        event::DISPENSED => (json!({"event": "dispensed", "amount": evt.data1}), FollowUp::None),
        event::FLOATING => (
            json!({"event": "floating", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::FLOATED => (
            json!({"event": "floated", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::CASHBOX_PAID => (
            json!({"event": "cashbox paid", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::COIN_CREDIT => (
            json!({"event": "coin credit", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::JAMMED => bare("jammed"),
        event::FRAUD_ATTEMPT => bare("fraud attempt"),
        event::EMPTY => bare("empty"),
        event::EMPTYING => bare("emptying"),
        event::SMART_EMPTYING => (
            json!({"event": "smart emptying", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::SMART_EMPTIED => (
            json!({"event": "smart emptied", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::INCOMPLETE_PAYOUT => (
            json!({
                "event": "incomplete payout",
                "dispensed": evt.data1,
                "requested": evt.data2,
                "cc": evt.currency,
            }),
            FollowUp::None,
        ),
        event::INCOMPLETE_FLOAT => (
            json!({
                "event": "incomplete float",
                "dispensed": evt.data1,
                "requested": evt.data2,
                "cc": evt.currency,
            }),
            FollowUp::None,
        ),
        event::DISABLED => bare("disabled"),
        event::CALIBRATION_FAIL => calibration_fail(evt),
        _ => unknown(evt),
    }
}

fn validator(device: &Device, evt: &PollEvent) -> (Value, FollowUp) {
    // the validator reports channel numbers; euro-cent amounts come from the
    // cached channel table (face value x 100)
    let amount = || device.channel_value(evt.data1).unwrap_or_default() * 100;

    match evt.code {
        event::RESET => (json!({"event": "unit reset"}), FollowUp::UnitReset),
        event::READ if evt.data1 > 0 => (
            json!({"event": "read", "amount": amount(), "channel": evt.data1}),
            FollowUp::None,
        ),
        event::READ => bare("reading"),
        event::CREDIT => (
            json!({"event": "credit", "amount": amount(), "channel": evt.data1}),
            FollowUp::None,
        ),
        event::TIMEOUT => (
            json!({"event": "timeout", "amount": evt.data1, "cc": evt.currency}),
            FollowUp::None,
        ),
        event::EMPTY => bare("empty"),
        event::EMPTYING => bare("emptying"),
        event::JAMMED => bare("jammed"),
        event::SMART_EMPTYING => bare("smart emptying"),
        event::SMART_EMPTIED => bare("smart emptied"),
        event::INCOMPLETE_PAYOUT => (
            json!({
                "event": "incomplete payout",
                "dispensed": evt.data1,
                "requested": evt.data2,
                "cc": evt.currency,
            }),
            FollowUp::None,
        ),
        event::INCOMPLETE_FLOAT => (
            json!({
                "event": "incomplete float",
                "dispensed": evt.data1,
                "requested": evt.data2,
                "cc": evt.currency,
            }),
            FollowUp::None,
        ),
        event::REJECTING => bare("rejecting"),
        event::REJECTED => bare("rejected"),
        event::STACKING => bare("stacking"),
        event::STORED => bare("stored"),
        event::STACKED => bare("stacked"),
        event::SAFE_JAM => bare("safe jam"),
        event::UNSAFE_JAM => bare("unsafe jam"),
        event::DISABLED => bare("disabled"),
        event::FRAUD_ATTEMPT => (
            json!({"event": "fraud attempt", "dispensed": evt.data1}),
            FollowUp::None,
        ),
        event::STACKER_FULL => bare("stacker full"),
        event::CASH_BOX_REMOVED => bare("cashbox removed"),
        event::CASH_BOX_REPLACED => bare("cashbox replaced"),
        event::CLEARED_FROM_FRONT => bare("cleared from front"),
        event::CLEARED_INTO_CASHBOX => bare("cleared into cashbox"),
        event::CALIBRATION_FAIL => calibration_fail(evt),
        _ => unknown(evt),
    }
}
