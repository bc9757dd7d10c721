//! The SSP command catalog: opcodes, payload encoders and structured
//! response decoders.
//!
//! Multi-byte integers are little-endian, currency codes are 3 ASCII bytes,
//! option bytes are vendor magic and must round-trip unchanged.

use crate::error::{Error, Result};

/// Command opcodes.
pub mod cmd {
    pub const RESET: u8 = 0x01;
    pub const SET_INHIBITS: u8 = 0x02;
    pub const DISPLAY_ON: u8 = 0x03;
    pub const DISPLAY_OFF: u8 = 0x04;
    pub const SETUP_REQUEST: u8 = 0x05;
    pub const HOST_PROTOCOL: u8 = 0x06;
    pub const POLL: u8 = 0x07;
    pub const DISABLE: u8 = 0x09;
    pub const ENABLE: u8 = 0x0A;
    pub const CHANNEL_SECURITY: u8 = 0x0E;
    pub const SYNC: u8 = 0x11;
    pub const LAST_REJECT_NOTE: u8 = 0x17;
    pub const GET_FIRMWARE_VERSION: u8 = 0x20;
    pub const GET_DATASET_VERSION: u8 = 0x21;
    pub const GET_ALL_LEVELS: u8 = 0x22;
    pub const SET_REFILL_MODE: u8 = 0x30;
    pub const PAYOUT_AMOUNT: u8 = 0x33;
    pub const SET_DENOMINATION_LEVEL: u8 = 0x34;
    pub const SET_ROUTING: u8 = 0x3B;
    pub const FLOAT_AMOUNT: u8 = 0x3D;
    pub const EMPTY_ALL: u8 = 0x3F;
    pub const SET_COIN_INHIBITS: u8 = 0x40;
    pub const RUN_CALIBRATION: u8 = 0x47;
    pub const SET_GENERATOR: u8 = 0x4A;
    pub const SET_MODULUS: u8 = 0x4B;
    pub const REQUEST_KEY_EXCHANGE: u8 = 0x4C;
    pub const SET_CASHBOX_PAYOUT_LIMIT: u8 = 0x4E;
    pub const SMART_EMPTY: u8 = 0x52;
    pub const CASHBOX_PAYOUT_OPERATION_DATA: u8 = 0x53;
    pub const CONFIGURE_BEZEL: u8 = 0x54;
    pub const ENABLE_PAYOUT: u8 = 0x5C;
}

/// Currency all amounts are labeled with.
pub const CURRENCY: &str = "EUR";

/// Payout/float option byte: dry-run the operation.
pub const OPTION_TEST: u8 = 0x19;
/// Payout/float option byte: actually move money.
pub const OPTION_DO: u8 = 0x58;

/// Note route: the non-payoutable cashbox.
pub const ROUTE_CASHBOX: u8 = 0x01;
/// Note route: the payoutable storage.
pub const ROUTE_STORAGE: u8 = 0x00;

/// Bezel color survives power cycles.
pub const BEZEL_NON_VOLATILE: u8 = 0x01;
/// Bezel color is lost on power cycles.
pub const BEZEL_VOLATILE: u8 = 0x00;
/// Bezel type: solid color.
pub const BEZEL_SOLID: u8 = 0x00;
/// Bezel type: flashing.
pub const BEZEL_FLASHING: u8 = 0x01;
/// Bezel type: off.
pub const BEZEL_OFF: u8 = 0x02;

/// Minimum value to float, fixed at one euro.
const FLOAT_MINIMUM: u16 = 100;

// Vendor magic; the protocol specifies the SET REFILL MODE payload bit-exact
// with no published structure.
const REFILL_MODE_MAGIC: [u8; 8] = [0x05, 0x81, 0x10, 0x11, 0x01, 0x01, 0x52, 0xF5];

fn push_currency(buf: &mut Vec<u8>, currency: &str) {
    let mut bytes = currency.bytes();
    for _ in 0..3 {
        buf.push(bytes.next().unwrap_or(b' '));
    }
}

pub fn sync() -> Vec<u8> {
    vec![cmd::SYNC]
}

pub fn poll() -> Vec<u8> {
    vec![cmd::POLL]
}

pub fn host_protocol(version: u8) -> Vec<u8> {
    vec![cmd::HOST_PROTOCOL, version]
}

pub fn setup_request() -> Vec<u8> {
    vec![cmd::SETUP_REQUEST]
}

pub fn enable() -> Vec<u8> {
    vec![cmd::ENABLE]
}

pub fn disable() -> Vec<u8> {
    vec![cmd::DISABLE]
}

pub fn enable_payout(unit_type: u8) -> Vec<u8> {
    vec![cmd::ENABLE_PAYOUT, unit_type]
}

pub fn display_on() -> Vec<u8> {
    vec![cmd::DISPLAY_ON]
}

pub fn display_off() -> Vec<u8> {
    vec![cmd::DISPLAY_OFF]
}

pub fn empty() -> Vec<u8> {
    vec![cmd::EMPTY_ALL]
}

pub fn smart_empty() -> Vec<u8> {
    vec![cmd::SMART_EMPTY]
}

pub fn run_calibration() -> Vec<u8> {
    vec![cmd::RUN_CALIBRATION]
}

pub fn channel_security() -> Vec<u8> {
    vec![cmd::CHANNEL_SECURITY]
}

pub fn last_reject_note() -> Vec<u8> {
    vec![cmd::LAST_REJECT_NOTE]
}

pub fn get_firmware_version() -> Vec<u8> {
    vec![cmd::GET_FIRMWARE_VERSION]
}

pub fn get_dataset_version() -> Vec<u8> {
    vec![cmd::GET_DATASET_VERSION]
}

pub fn get_all_levels() -> Vec<u8> {
    vec![cmd::GET_ALL_LEVELS]
}

pub fn cashbox_payout_operation_data() -> Vec<u8> {
    vec![cmd::CASHBOX_PAYOUT_OPERATION_DATA]
}

pub fn set_refill_mode() -> Vec<u8> {
    let mut buf = vec![cmd::SET_REFILL_MODE];
    buf.extend_from_slice(&REFILL_MODE_MAGIC);
    buf
}

pub fn set_inhibits(low: u8, high: u8) -> Vec<u8> {
    vec![cmd::SET_INHIBITS, low, high]
}

pub fn set_coin_inhibits(value: u16, currency: &str, enabled: bool) -> Vec<u8> {
    let mut buf = vec![cmd::SET_COIN_INHIBITS];
    buf.extend_from_slice(&value.to_le_bytes());
    push_currency(&mut buf, currency);
    buf.push(enabled as u8);
    buf
}

pub fn set_route(amount: u32, currency: &str, route: u8) -> Vec<u8> {
    let mut buf = vec![cmd::SET_ROUTING];
    buf.extend_from_slice(&amount.to_le_bytes());
    push_currency(&mut buf, currency);
    buf.push(route);
    buf
}

pub fn payout(amount: u32, currency: &str, option: u8) -> Vec<u8> {
    let mut buf = vec![cmd::PAYOUT_AMOUNT];
    buf.extend_from_slice(&amount.to_le_bytes());
    push_currency(&mut buf, currency);
    buf.push(option);
    buf
}

pub fn float_amount(keep: u32, currency: &str, option: u8) -> Vec<u8> {
    let mut buf = vec![cmd::FLOAT_AMOUNT];
    buf.extend_from_slice(&FLOAT_MINIMUM.to_le_bytes());
    buf.extend_from_slice(&keep.to_le_bytes());
    push_currency(&mut buf, currency);
    buf.push(option);
    buf
}

pub fn set_denomination_level(level: u16, amount: u32, currency: &str) -> Vec<u8> {
    let mut buf = vec![cmd::SET_DENOMINATION_LEVEL];
    buf.extend_from_slice(&level.to_le_bytes());
    buf.extend_from_slice(&amount.to_le_bytes());
    push_currency(&mut buf, currency);
    buf
}

/// Wire order is `{count=1, limit, denomination, currency}`; only one limit
/// can be set per command.
pub fn set_cashbox_payout_limit(limit: u16, denomination: u32, currency: &str) -> Vec<u8> {
    let mut buf = vec![cmd::SET_CASHBOX_PAYOUT_LIMIT, 0x01];
    buf.extend_from_slice(&limit.to_le_bytes());
    buf.extend_from_slice(&denomination.to_le_bytes());
    push_currency(&mut buf, currency);
    buf
}

pub fn configure_bezel(r: u8, g: u8, b: u8, volatility: u8, bezel_type: u8) -> Vec<u8> {
    vec![cmd::CONFIGURE_BEZEL, r, g, b, volatility, bezel_type]
}

pub fn set_generator(generator: u64) -> Vec<u8> {
    let mut buf = vec![cmd::SET_GENERATOR];
    buf.extend_from_slice(&generator.to_le_bytes());
    buf
}

pub fn set_modulus(modulus: u64) -> Vec<u8> {
    let mut buf = vec![cmd::SET_MODULUS];
    buf.extend_from_slice(&modulus.to_le_bytes());
    buf
}

pub fn request_key_exchange(host_intermediate: u64) -> Vec<u8> {
    let mut buf = vec![cmd::REQUEST_KEY_EXCHANGE];
    buf.extend_from_slice(&host_intermediate.to_le_bytes());
    buf
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.at + n > self.data.len() {
            return Err(Error::Truncated(what));
        }
        let slice = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16_le(&mut self, what: &'static str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u24_le(&mut self, what: &'static str) -> Result<u32> {
        let b = self.take(3, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn u32_le(&mut self, what: &'static str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self, what: &'static str) -> Result<u64> {
        let b = self.take(8, what)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_le_bytes(bytes))
    }

    fn ascii(&mut self, n: usize, what: &'static str) -> Result<String> {
        let bytes = self.take(n, what)?;
        Ok(bytes
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
            .collect())
    }
}

/// One channel slot from the setup snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelData {
    /// Face value in the device's native unit.
    pub value: u32,
    pub currency: String,
}

/// The decoded SETUP REQUEST response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupData {
    pub unit_type: u8,
    pub firmware: String,
    pub country: String,
    pub protocol_version: u8,
    /// Ordered channel table; index 0 is channel 1.
    pub channels: Vec<ChannelData>,
}

/// Decodes a SETUP REQUEST response body (protocol version 6 layout).
pub fn decode_setup(data: &[u8]) -> Result<SetupData> {
    let mut r = Reader::new(data);

    let unit_type = r.u8("setup unit type")?;
    let firmware = r.ascii(4, "setup firmware")?;
    let country = r.ascii(3, "setup country")?;
    r.take(3, "setup value multiplier")?;
    let count = r.u8("setup channel count")? as usize;
    r.take(count, "setup channel values")?;
    r.take(count, "setup channel security")?;
    r.take(3, "setup real value multiplier")?;
    let protocol_version = r.u8("setup protocol version")?;

    let mut currencies = Vec::with_capacity(count);
    for _ in 0..count {
        currencies.push(r.ascii(3, "setup channel currency")?);
    }

    let mut channels = Vec::with_capacity(count);
    for currency in currencies {
        channels.push(ChannelData {
            value: r.u32_le("setup channel full value")?,
            currency,
        });
    }

    Ok(SetupData {
        unit_type,
        firmware,
        country,
        protocol_version,
        channels,
    })
}

/// One denomination counter from GET ALL LEVELS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelCounter {
    pub level: u16,
    pub value: u32,
    pub currency: String,
}

fn decode_counters(r: &mut Reader<'_>) -> Result<Vec<LevelCounter>> {
    let count = r.u8("counter count")? as usize;

    let mut counters = Vec::with_capacity(count);
    for _ in 0..count {
        counters.push(LevelCounter {
            level: r.u16_le("counter level")?,
            value: r.u32_le("counter value")?,
            currency: r.ascii(3, "counter currency")?,
        });
    }

    Ok(counters)
}

/// Decodes a GET ALL LEVELS response body.
pub fn decode_levels(data: &[u8]) -> Result<Vec<LevelCounter>> {
    decode_counters(&mut Reader::new(data))
}

/// The decoded CASHBOX PAYOUT OPERATION DATA response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CashboxOperationData {
    pub counters: Vec<LevelCounter>,
    /// Coins moved that the device could not identify.
    pub unknown_coins: u32,
}

/// Decodes a CASHBOX PAYOUT OPERATION DATA response body: the GET ALL LEVELS
/// counter list plus a trailing 3-byte unknown-coin quantity.
pub fn decode_cashbox_operation(data: &[u8]) -> Result<CashboxOperationData> {
    let mut r = Reader::new(data);
    let counters = decode_counters(&mut r)?;
    let unknown_coins = r.u24_le("unknown coin quantity")?;

    Ok(CashboxOperationData {
        counters,
        unknown_coins,
    })
}

/// Decodes a fixed-width ASCII version string (16 bytes for firmware,
/// 8 for the dataset).
pub fn decode_version(data: &[u8], width: usize) -> Result<String> {
    Reader::new(data).ascii(width, "version string")
}

/// Decodes the per-channel security levels.
pub fn decode_channel_security(data: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(data);
    let count = r.u8("security channel count")? as usize;
    Ok(r.take(count, "security levels")?.to_vec())
}

/// Decodes the device intermediate key from REQUEST KEY EXCHANGE.
pub fn decode_intermediate_key(data: &[u8]) -> Result<u64> {
    Reader::new(data).u64_le("device intermediate key")
}

/// Sub-error phrases for a COMMAND NOT PROCESSED payout/float response.
pub fn payout_error(sub: u8) -> &'static str {
    match sub {
        0x01 => "not enough value in smart payout",
        0x02 => "can't pay exact amount",
        0x03 => "smart payout busy",
        0x04 => "smart payout disabled",
        _ => "unknown",
    }
}

/// Reject reason phrases for LAST REJECT NOTE codes 0x00..=0x1C.
pub fn reject_reason(code: u8) -> &'static str {
    match code {
        0x00 => "note accepted",
        0x01 => "note length incorrect",
        0x02 => "internal validation failure: average fail",
        0x03 => "internal validation failure: coastline fail",
        0x04 => "internal validation failure: graph fail",
        0x05 => "internal validation failure: buried fail",
        0x06 => "channel inhibited",
        0x07 => "second note inserted",
        0x08 => "reject by host",
        0x09 => "note recognised in more than one channel",
        0x0A => "rear sensor error",
        0x0B => "note too long",
        0x0C => "disabled by host",
        0x0D => "mechanism slow/stalled",
        0x0E => "strimming attempt detected",
        0x0F => "fraud channel reject",
        0x10 => "no notes inserted",
        0x11 => "peak detect fail",
        0x12 => "twisted note detected",
        0x13 => "escrow time-out",
        0x14 => "bar code scan fail",
        0x15 => "rear sensor 2 fail",
        0x16 => "slot fail 1",
        0x17 => "slot fail 2",
        0x18 => "lens over-sample",
        0x19 => "width detect fail",
        0x1A => "short note detected",
        0x1B => "note payout",
        0x1C => "unable to stack note",
        _ => "undefined in API",
    }
}
