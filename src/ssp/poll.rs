//! Parsing of POLL response bodies into ordered event lists.

use crate::error::Result;

/// Poll event opcodes (protocol version 6).
pub mod event {
    pub const CALIBRATION_FAIL: u8 = 0x83;
    pub const SMART_EMPTYING: u8 = 0xB3;
    pub const SMART_EMPTIED: u8 = 0xB4;
    pub const EMPTYING: u8 = 0xC2;
    pub const EMPTY: u8 = 0xC3;
    pub const STACKING: u8 = 0xCC;
    pub const DISPENSED: u8 = 0xD2;
    pub const JAMMED: u8 = 0xD5;
    pub const HALTED: u8 = 0xD6;
    pub const FLOATING: u8 = 0xD7;
    pub const FLOATED: u8 = 0xD8;
    pub const TIMEOUT: u8 = 0xD9;
    pub const DISPENSING: u8 = 0xDA;
    pub const STORED: u8 = 0xDB;
    pub const INCOMPLETE_PAYOUT: u8 = 0xDC;
    pub const INCOMPLETE_FLOAT: u8 = 0xDD;
    pub const CASHBOX_PAID: u8 = 0xDE;
    pub const COIN_CREDIT: u8 = 0xDF;
    pub const CLEARED_FROM_FRONT: u8 = 0xE1;
    pub const CLEARED_INTO_CASHBOX: u8 = 0xE2;
    pub const CASH_BOX_REMOVED: u8 = 0xE3;
    pub const CASH_BOX_REPLACED: u8 = 0xE4;
    pub const FRAUD_ATTEMPT: u8 = 0xE6;
    pub const STACKER_FULL: u8 = 0xE7;
    pub const DISABLED: u8 = 0xE8;
    pub const UNSAFE_JAM: u8 = 0xE9;
    pub const SAFE_JAM: u8 = 0xEA;
    pub const STACKED: u8 = 0xEB;
    pub const REJECTED: u8 = 0xEC;
    pub const REJECTING: u8 = 0xED;
    pub const CREDIT: u8 = 0xEE;
    pub const READ: u8 = 0xEF;
    pub const RESET: u8 = 0xF1;
}

/// Calibration failure sub-codes carried in `data1` of CALIBRATION_FAIL.
pub mod calibration {
    pub const NO_ERROR: u8 = 0x00;
    pub const SENSOR_FLAP: u8 = 0x01;
    pub const SENSOR_EXIT: u8 = 0x02;
    pub const SENSOR_COIL_1: u8 = 0x03;
    pub const SENSOR_COIL_2: u8 = 0x04;
    pub const NOT_INITIALIZED: u8 = 0x05;
    pub const CHECKSUM_ERROR: u8 = 0x06;
    pub const COMMAND_RECAL: u8 = 0x07;
}

/// One device-originated event from a poll response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollEvent {
    pub code: u8,
    pub data1: u32,
    pub data2: u32,
    pub currency: String,
}

impl PollEvent {
    fn bare(code: u8) -> Self {
        Self {
            code,
            data1: 0,
            data2: 0,
            currency: String::new(),
        }
    }
}

// Per-opcode payload shape following each event byte.
enum Shape {
    Bare,
    Channel,
    Sub,
    ValueCurrency,
    ValueValueCurrency,
}

fn shape(code: u8) -> Option<Shape> {
    use event::*;

    match code {
        RESET | REJECTING | REJECTED | STACKING | STACKED | SAFE_JAM | UNSAFE_JAM | DISABLED
        | STACKER_FULL | CASH_BOX_REMOVED | CASH_BOX_REPLACED | JAMMED | HALTED | EMPTY
        | EMPTYING | STORED => Some(Shape::Bare),
        READ | CREDIT | CLEARED_FROM_FRONT | CLEARED_INTO_CASHBOX => Some(Shape::Channel),
        CALIBRATION_FAIL => Some(Shape::Sub),
        DISPENSING | DISPENSED | FLOATING | FLOATED | TIMEOUT | CASHBOX_PAID | COIN_CREDIT
        | SMART_EMPTYING | SMART_EMPTIED | FRAUD_ATTEMPT => Some(Shape::ValueCurrency),
        INCOMPLETE_PAYOUT | INCOMPLETE_FLOAT => Some(Shape::ValueValueCurrency),
        _ => None,
    }
}

fn take_u32(data: &[u8], at: &mut usize) -> Option<u32> {
    let bytes = data.get(*at..*at + 4)?;
    *at += 4;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_currency(data: &[u8], at: &mut usize) -> Option<String> {
    let bytes = data.get(*at..*at + 3)?;
    *at += 3;
    Some(bytes.iter().map(|&b| b as char).collect())
}

/// Parses a poll response body into its ordered event list.
///
/// Events must be consumed in device order (READ precedes CREDIT for the
/// same note). An opcode with an unknown payload shape ends the parse, since
/// there is no way to resynchronize past it; the event itself is still
/// reported so it can be published as `unknown`.
pub fn parse_events(data: &[u8]) -> Result<Vec<PollEvent>> {
    let mut events = Vec::new();
    let mut at = 0;

    while at < data.len() {
        let code = data[at];
        at += 1;

        let Some(shape) = shape(code) else {
            log::warn!("unrecognized poll event 0x{code:02X}, skipping rest of response");
            events.push(PollEvent::bare(code));
            break;
        };

        let mut evt = PollEvent::bare(code);
        let complete = match shape {
            Shape::Bare => true,
            Shape::Channel | Shape::Sub => match data.get(at) {
                Some(&b) => {
                    at += 1;
                    evt.data1 = b as u32;
                    true
                }
                None => false,
            },
            Shape::ValueCurrency => (|| {
                evt.data1 = take_u32(data, &mut at)?;
                evt.currency = take_currency(data, &mut at)?;
                Some(())
            })()
            .is_some(),
            Shape::ValueValueCurrency => (|| {
                evt.data1 = take_u32(data, &mut at)?;
                evt.data2 = take_u32(data, &mut at)?;
                evt.currency = take_currency(data, &mut at)?;
                Some(())
            })()
            .is_some(),
        };

        if !complete {
            log::warn!("truncated poll event 0x{code:02X}, dropping it");
            break;
        }

        events.push(evt);
    }

    Ok(events)
}
