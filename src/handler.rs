//! Bus request handling: JSON validation, dispatch to the device catalog
//! and response document construction.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::device::Device;
use crate::error::Result;
use crate::ssp::commands::{self, LevelCounter};
use crate::ssp::{ResponseStatus, SspLink};
use crate::transport::Transport;

/// What became of one inbound request.
pub struct Outcome {
    /// Document to publish on the response topic, if any.
    pub response: Option<Value>,
    /// Whether a `quit` command asked the loop to terminate.
    pub quit: bool,
}

impl Outcome {
    fn respond(document: Value) -> Self {
        Self {
            response: Some(document),
            quit: false,
        }
    }

    fn silent() -> Self {
        Self {
            response: None,
            quit: false,
        }
    }
}

/// Parses a channel selection string: every digit 1..8 present selects that
/// channel, anything else is ignored.
pub fn channel_mask(channels: &str) -> u8 {
    let mut mask = 0u8;
    for c in channels.chars() {
        if let Some(digit) = c.to_digit(10) {
            if (1..=8).contains(&digit) {
                mask |= 1 << (digit - 1);
            }
        }
    }
    mask
}

fn property_error(msg_id: &str, correl_id: &str, name: &str) -> Value {
    json!({
        "msgId": msg_id,
        "correlId": correl_id,
        "error": format!("Property '{name}' missing or of wrong type"),
    })
}

fn ssp_response(msg_id: &str, correl_id: &str, status: ResponseStatus) -> Value {
    if status.is_ok() {
        json!({"msgId": msg_id, "correlId": correl_id, "result": "ok"})
    } else {
        json!({"msgId": msg_id, "correlId": correl_id, "sspError": status.phrase()})
    }
}

fn level_doc(counter: &LevelCounter) -> Value {
    json!({
        "value": counter.value,
        "level": counter.level,
        "cc": counter.currency,
    })
}

fn get_u64(message: &Value, name: &str) -> Option<u64> {
    message.get(name).and_then(Value::as_u64)
}

fn get_u8(message: &Value, name: &str) -> Option<u8> {
    get_u64(message, name).and_then(|value| u8::try_from(value).ok())
}

fn get_u16(message: &Value, name: &str) -> Option<u16> {
    get_u64(message, name).and_then(|value| u16::try_from(value).ok())
}

fn get_u32(message: &Value, name: &str) -> Option<u32> {
    get_u64(message, name).and_then(|value| u32::try_from(value).ok())
}

/// Handles one message from a request topic and builds the response.
///
/// Commands needing hardware are rejected while `ssp_available` is false;
/// no serial byte is written for them. Transport-level failures bubble up as
/// `Err` so the dispatcher can decide whether they are fatal.
pub fn process<P: Transport>(
    device: &mut Device,
    link: &mut SspLink<P>,
    ssp_available: bool,
    payload: &str,
) -> Result<Outcome> {
    let msg_id = Uuid::new_v4().to_string();

    let message: Value = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(err) => {
            log::warn!("unable to process message: could not parse json: {err}");
            return Ok(Outcome::respond(json!({
                "error": "could not parse json",
                "reason": err.to_string(),
                "line": err.line(),
            })));
        }
    };

    let Some(correl_id) = message.get("msgId").and_then(Value::as_str).map(str::to_owned) else {
        log::warn!("unable to process message: property 'msgId' missing or invalid");
        return Ok(Outcome::respond(property_error(&msg_id, "unknown", "msgId")));
    };

    let Some(command) = message.get("cmd").and_then(Value::as_str).map(str::to_owned) else {
        log::warn!("unable to process message: property 'cmd' missing or invalid");
        return Ok(Outcome::respond(property_error(&msg_id, &correl_id, "cmd")));
    };

    log::info!(
        "processing cmd='{command}' from msgId='{correl_id}' for device='{}'",
        device.label
    );

    match command.as_str() {
        "quit" => Ok(Outcome {
            response: Some(ssp_response(&msg_id, &correl_id, ResponseStatus::Ok)),
            quit: true,
        }),
        "test" => Ok(Outcome::respond(ssp_response(
            &msg_id,
            &correl_id,
            ResponseStatus::Ok,
        ))),
        _ if !ssp_available => {
            log::warn!("rejecting cmd='{command}' from msgId='{correl_id}', hardware unavailable");
            Ok(Outcome::respond(json!({
                "msgId": msg_id,
                "correlId": correl_id,
                "error": "hardware unavailable",
            })))
        }
        _ => dispatch(device, link, &msg_id, &correl_id, &command, &message),
    }
}

// Returns early with a property-error response when a field is absent or of
// the wrong type; nothing is transmitted in that case.
macro_rules! require {
    ($getter:ident, $message:expr, $name:literal, $msg_id:expr, $correl_id:expr) => {
        match $getter($message, $name) {
            Some(value) => value,
            None => {
                return Ok(Outcome::respond(property_error($msg_id, $correl_id, $name)))
            }
        }
    };
}

fn dispatch<P: Transport>(
    device: &mut Device,
    link: &mut SspLink<P>,
    msg_id: &str,
    correl_id: &str,
    command: &str,
    message: &Value,
) -> Result<Outcome> {
    let outcome = match command {
        "configure-bezel" => {
            let r = require!(get_u8, message, "r", msg_id, correl_id);
            let g = require!(get_u8, message, "g", msg_id, correl_id);
            let b = require!(get_u8, message, "b", msg_id, correl_id);
            let bezel_type = require!(get_u8, message, "type", msg_id, correl_id);

            let status = device.configure_bezel(
                link,
                r,
                g,
                b,
                commands::BEZEL_NON_VOLATILE,
                bezel_type,
            )?;
            Outcome::respond(ssp_response(msg_id, correl_id, status))
        }
        "empty" => Outcome::respond(ssp_response(msg_id, correl_id, device.empty(link)?)),
        "smart-empty" => {
            Outcome::respond(ssp_response(msg_id, correl_id, device.smart_empty(link)?))
        }
        "enable" => Outcome::respond(ssp_response(msg_id, correl_id, device.enable(link)?)),
        "disable" => Outcome::respond(ssp_response(msg_id, correl_id, device.disable(link)?)),
        "display-on" => {
            Outcome::respond(ssp_response(msg_id, correl_id, device.display_on(link)?))
        }
        "display-off" => {
            Outcome::respond(ssp_response(msg_id, correl_id, device.display_off(link)?))
        }
        "enable-channels" => {
            let channels = require!(get_str, message, "channels", msg_id, correl_id);
            let status = device.enable_channels(link, channel_mask(&channels))?;
            Outcome::respond(ssp_response(msg_id, correl_id, status))
        }
        "disable-channels" => {
            let channels = require!(get_str, message, "channels", msg_id, correl_id);
            let status = device.disable_channels(link, channel_mask(&channels))?;
            Outcome::respond(ssp_response(msg_id, correl_id, status))
        }
        "inhibit-channels" => {
            let channels = require!(get_str, message, "channels", msg_id, correl_id);
            let status = device.inhibit_channels(link, channel_mask(&channels))?;
            Outcome::respond(ssp_response(msg_id, correl_id, status))
        }
        "set-denomination-level" => {
            let level = require!(get_u16, message, "level", msg_id, correl_id);
            let amount = require!(get_u32, message, "amount", msg_id, correl_id);

            if level > 0 {
                // the command is additive except at level zero, so clear the
                // denomination first to make the requested level absolute
                let _ = device.set_denomination_level(link, 0, amount)?;
            }
            let status = device.set_denomination_level(link, level, amount)?;
            Outcome::respond(ssp_response(msg_id, correl_id, status))
        }
        "set-cashbox-payout-limit" => {
            let limit = require!(get_u16, message, "level", msg_id, correl_id);
            let denomination = require!(get_u32, message, "amount", msg_id, correl_id);

            let status = device.set_cashbox_payout_limit(link, limit, denomination)?;
            Outcome::respond(ssp_response(msg_id, correl_id, status))
        }
        "get-all-levels" => {
            let (status, counters) = device.get_all_levels(link)?;
            if status.is_ok() {
                let levels: Vec<Value> = counters.iter().map(level_doc).collect();
                Outcome::respond(json!({
                    "msgId": msg_id,
                    "correlId": correl_id,
                    "levels": levels,
                }))
            } else {
                Outcome::respond(ssp_response(msg_id, correl_id, status))
            }
        }
        "cashbox-payout-operation-data" => {
            let (status, data) = device.cashbox_payout_operation_data(link)?;
            match data {
                Some(data) if status.is_ok() => {
                    let mut levels: Vec<Value> = data.counters.iter().map(level_doc).collect();
                    levels.push(json!({"value": 0, "level": data.unknown_coins}));
                    Outcome::respond(json!({
                        "msgId": msg_id,
                        "correlId": correl_id,
                        "levels": levels,
                    }))
                }
                _ => Outcome::respond(ssp_response(msg_id, correl_id, status)),
            }
        }
        "get-firmware-version" => {
            let (status, version) = device.firmware_version(link)?;
            match version {
                Some(version) => Outcome::respond(json!({
                    "msgId": msg_id,
                    "correlId": correl_id,
                    "version": version,
                })),
                None => Outcome::respond(ssp_response(msg_id, correl_id, status)),
            }
        }
        "get-dataset-version" => {
            let (status, version) = device.dataset_version(link)?;
            match version {
                Some(version) => Outcome::respond(json!({
                    "msgId": msg_id,
                    "correlId": correl_id,
                    "version": version,
                })),
                None => Outcome::respond(ssp_response(msg_id, correl_id, status)),
            }
        }
        "last-reject-note" => {
            let (status, code) = device.last_reject_note(link)?;
            match code {
                Some(code) => Outcome::respond(json!({
                    "msgId": msg_id,
                    "correlId": correl_id,
                    "reason": commands::reject_reason(code),
                    "code": code,
                })),
                None => Outcome::respond(ssp_response(msg_id, correl_id, status)),
            }
        }
        "test-payout" | "do-payout" => {
            let amount = require!(get_u32, message, "amount", msg_id, correl_id);
            let option = if command == "do-payout" {
                commands::OPTION_DO
            } else {
                commands::OPTION_TEST
            };

            let (status, sub) = device.payout(link, amount, option)?;
            payout_outcome(msg_id, correl_id, status, sub)
        }
        "test-float" | "do-float" => {
            let amount = require!(get_u32, message, "amount", msg_id, correl_id);
            let option = if command == "do-float" {
                commands::OPTION_DO
            } else {
                commands::OPTION_TEST
            };

            let (status, sub) = device.float_amount(link, amount, option)?;
            payout_outcome(msg_id, correl_id, status, sub)
        }
        "channel-security-data" => {
            let (status, levels) = device.channel_security(link)?;
            if status.is_ok() {
                log::debug!("security status: numChannels={}", levels.len());
                log::debug!("0 = unused, 1 = low, 2 = std, 3 = high, 4 = inhibited");
                for (index, level) in levels.iter().enumerate() {
                    log::debug!("security status: channel {} -> {level}", index + 1);
                }
            }
            Outcome::silent()
        }
        _ => {
            log::warn!("unable to process message: no handler for cmd='{command}' found");
            Outcome::respond(json!({
                "msgId": msg_id,
                "correlId": correl_id,
                "error": "unknown command",
                "cmd": command,
            }))
        }
    };

    Ok(outcome)
}

fn payout_outcome(
    msg_id: &str,
    correl_id: &str,
    status: ResponseStatus,
    sub: Option<u8>,
) -> Outcome {
    if status == ResponseStatus::CommandNotProcessed {
        let sub = sub.unwrap_or(0xFF);
        Outcome::respond(json!({
            "msgId": msg_id,
            "correlId": correl_id,
            "error": commands::payout_error(sub),
        }))
    } else {
        Outcome::respond(ssp_response(msg_id, correl_id, status))
    }
}

fn get_str(message: &Value, name: &str) -> Option<String> {
    message.get(name).and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use crate::ssp::SspLink;

    fn idle_link() -> (Device, SspLink<mock::MockPort>) {
        let (host, _peer) = mock::pair();
        (Device::hopper(), SspLink::new(host))
    }

    #[test]
    fn channel_mask_selects_listed_digits() {
        assert_eq!(channel_mask("135"), 0b0001_0101);
        assert_eq!(channel_mask(""), 0);
        assert_eq!(channel_mask("9A8"), 0b1000_0000);
        assert_eq!(channel_mask("88"), 0b1000_0000);
    }

    #[test]
    fn malformed_json_reports_parse_failure_without_correl_id() {
        let (mut device, mut link) = idle_link();
        let outcome = process(&mut device, &mut link, false, "{ nope").expect("process");

        let doc = outcome.response.expect("response");
        assert_eq!(doc["error"], "could not parse json");
        assert!(doc.get("correlId").is_none());
        assert!(doc["reason"].is_string());
        assert!(doc["line"].is_number());
    }

    #[test]
    fn missing_msg_id_uses_unknown_correlation() {
        let (mut device, mut link) = idle_link();
        let outcome =
            process(&mut device, &mut link, false, r#"{"cmd":"test"}"#).expect("process");

        let doc = outcome.response.expect("response");
        assert_eq!(doc["correlId"], "unknown");
        assert_eq!(doc["error"], "Property 'msgId' missing or of wrong type");
    }

    #[test]
    fn test_command_works_without_hardware() {
        let (mut device, mut link) = idle_link();
        let outcome = process(
            &mut device,
            &mut link,
            false,
            r#"{"cmd":"test","msgId":"T1"}"#,
        )
        .expect("process");

        let doc = outcome.response.expect("response");
        assert_eq!(doc["correlId"], "T1");
        assert_eq!(doc["result"], "ok");
        assert!(!outcome.quit);
    }

    #[test]
    fn quit_requests_loop_termination() {
        let (mut device, mut link) = idle_link();
        let outcome = process(
            &mut device,
            &mut link,
            false,
            r#"{"cmd":"quit","msgId":"Q1"}"#,
        )
        .expect("process");

        assert!(outcome.quit);
        assert_eq!(outcome.response.expect("response")["result"], "ok");
    }

    #[test]
    fn hardware_commands_are_rejected_while_unavailable() {
        let (mut device, mut link) = idle_link();
        let outcome = process(
            &mut device,
            &mut link,
            false,
            r#"{"cmd":"empty","msgId":"E1"}"#,
        )
        .expect("process");

        let doc = outcome.response.expect("response");
        assert_eq!(doc["correlId"], "E1");
        assert_eq!(doc["error"], "hardware unavailable");
    }

    #[test]
    fn response_msg_id_is_a_fresh_lowercase_uuid() {
        let (mut device, mut link) = idle_link();
        let outcome = process(
            &mut device,
            &mut link,
            false,
            r#"{"cmd":"test","msgId":"T2"}"#,
        )
        .expect("process");

        let doc = outcome.response.expect("response");
        let msg_id = doc["msgId"].as_str().expect("msgId");
        assert_eq!(msg_id.len(), 36);
        assert_eq!(msg_id, msg_id.to_lowercase());
        assert_ne!(msg_id, "T2");
    }
}
