//! Per-device session state and the typed command surface on top of the
//! SSP link.

use crate::error::{Error, Result};
use crate::ssp::commands::{self, CashboxOperationData, LevelCounter, SetupData};
use crate::ssp::crypto::{self, KeyNegotiation};
use crate::ssp::poll::{self, PollEvent};
use crate::ssp::{ExchangeOptions, ResponseStatus, SessionState, SspLink};
use crate::transport::Transport;

/// Bus address of the coin hopper.
pub const HOPPER_ADDRESS: u8 = 0x10;
/// Bus address of the note validator/payout.
pub const VALIDATOR_ADDRESS: u8 = 0x00;

/// Preshared fixed half of the encryption key.
pub const DEFAULT_KEY: u64 = 0x0123_4567_0123_4567;

/// The protocol version this daemon speaks.
pub const PROTOCOL_VERSION: u8 = 0x06;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Hopper,
    Validator,
}

/// Session bring-up progress.
///
/// `Fresh → Synced → Protocol6 → SetupKnown → Enabled`; a unit reset drops
/// the device back to `Fresh`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Fresh,
    Synced,
    Protocol6,
    SetupKnown,
    Enabled,
}

/// One physical peripheral on the SSP bus.
pub struct Device {
    pub kind: DeviceKind,
    /// Human readable label used in log output.
    pub label: &'static str,
    pub session: SessionState,
    pub phase: SessionPhase,
    /// Snapshot from the last successful SETUP REQUEST.
    pub setup: Option<SetupData>,
    /// Whether initialization completed and the poll tick should serve it.
    pub available: bool,
    /// Channel inhibit state as last acknowledged by the hardware;
    /// bit i of the low byte enables channel i+1.
    pub inhibit_low: u8,
    pub inhibit_high: u8,
    options: ExchangeOptions,
}

impl Device {
    fn new(kind: DeviceKind, label: &'static str, address: u8) -> Self {
        Self {
            kind,
            label,
            session: SessionState::new(address, DEFAULT_KEY),
            phase: SessionPhase::Fresh,
            setup: None,
            available: false,
            inhibit_low: 0,
            inhibit_high: 0,
            options: ExchangeOptions::default(),
        }
    }

    pub fn hopper() -> Self {
        Self::new(DeviceKind::Hopper, "Mr. Coin", HOPPER_ADDRESS)
    }

    pub fn validator() -> Self {
        Self::new(DeviceKind::Validator, "Ms. Note", VALIDATOR_ADDRESS)
    }

    /// Face value of `channel` (1-based) from the setup snapshot.
    pub fn channel_value(&self, channel: u32) -> Option<u32> {
        let setup = self.setup.as_ref()?;
        let index = usize::try_from(channel).ok()?.checked_sub(1)?;
        setup.channels.get(index).map(|chan| chan.value)
    }

    // One exchange with automatic key recovery: a KEY NOT SET response means
    // the device dropped the session key, so negotiate a fresh one and retry
    // the command exactly once.
    fn transact<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        command: &[u8],
    ) -> Result<(ResponseStatus, Vec<u8>)> {
        let (status, body) = link.exchange(&mut self.session, command, &self.options)?;
        if status != ResponseStatus::KeyNotSet {
            return Ok((status, body));
        }

        log::warn!("device '{}' lost its session key, negotiating a new one", self.label);
        self.negotiate_key(link)?;
        link.exchange(&mut self.session, command, &self.options)
    }

    fn simple<P: Transport>(&mut self, link: &mut SspLink<P>, command: &[u8]) -> Result<ResponseStatus> {
        Ok(self.transact(link, command)?.0)
    }

    /// Runs the key negotiation exchange and installs the session key.
    pub fn negotiate_key<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<()> {
        self.session.clear_key();

        let negotiation = KeyNegotiation::from_entropy();

        let (status, _) = link.exchange(
            &mut self.session,
            &commands::set_generator(negotiation.generator()),
            &self.options,
        )?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        let (status, _) = link.exchange(
            &mut self.session,
            &commands::set_modulus(negotiation.modulus()),
            &self.options,
        )?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        let (status, body) = link.exchange(
            &mut self.session,
            &commands::request_key_exchange(negotiation.host_intermediate()),
            &self.options,
        )?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        let device_intermediate = commands::decode_intermediate_key(&body)?;
        let negotiated = negotiation.negotiated(device_intermediate);
        self.session.key = Some(crypto::session_key(self.session.fixed_key, negotiated));
        self.session.count = 0;

        log::info!("device '{}' session key negotiated", self.label);
        Ok(())
    }

    /// SYNC: resets the sequence bit on both ends.
    pub fn sync<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        let (status, _) = link.exchange(&mut self.session, &commands::sync(), &self.options)?;
        if status.is_ok() {
            self.session.sequence = false;
            self.phase = SessionPhase::Synced;
        }
        Ok(status)
    }

    pub fn host_protocol<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        version: u8,
    ) -> Result<ResponseStatus> {
        let status = self.simple(link, &commands::host_protocol(version))?;
        if status.is_ok() && self.phase == SessionPhase::Synced {
            self.phase = SessionPhase::Protocol6;
        }
        Ok(status)
    }

    /// SETUP REQUEST: caches the channel table snapshot.
    pub fn setup_request<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        let (status, body) = self.transact(link, &commands::setup_request())?;
        if status.is_ok() {
            self.setup = Some(commands::decode_setup(&body)?);
            if self.phase == SessionPhase::Protocol6 {
                self.phase = SessionPhase::SetupKnown;
            }
        }
        Ok(status)
    }

    pub fn enable<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        let status = self.simple(link, &commands::enable())?;
        if status.is_ok() && self.phase == SessionPhase::SetupKnown && self.kind == DeviceKind::Hopper
        {
            self.phase = SessionPhase::Enabled;
        }
        Ok(status)
    }

    pub fn disable<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::disable())
    }

    /// ENABLE PAYOUT: required for payout-capable unit types after ENABLE.
    pub fn enable_payout<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        let unit_type = self.setup.as_ref().map(|setup| setup.unit_type).unwrap_or_default();
        let status = self.simple(link, &commands::enable_payout(unit_type))?;
        if status.is_ok() && self.phase == SessionPhase::SetupKnown {
            self.phase = SessionPhase::Enabled;
        }
        Ok(status)
    }

    /// POLL: returns the ordered device event list.
    pub fn poll<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Vec<PollEvent>)> {
        let (status, body) = self.transact(link, &commands::poll())?;
        if !status.is_ok() {
            return Ok((status, Vec::new()));
        }
        Ok((status, poll::parse_events(&body)?))
    }

    /// Handles an observed "unit reset" poll event: the device restarted with
    /// factory framing, so the session key is gone and the protocol version
    /// must be renegotiated before anything else is sent.
    pub fn on_unit_reset<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.session.clear_key();
        self.phase = SessionPhase::Fresh;
        self.simple(link, &commands::host_protocol(PROTOCOL_VERSION))
    }

    pub fn empty<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::empty())
    }

    pub fn smart_empty<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::smart_empty())
    }

    pub fn display_on<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::display_on())
    }

    pub fn display_off<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::display_off())
    }

    pub fn run_calibration<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::run_calibration())
    }

    pub fn set_refill_mode<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<ResponseStatus> {
        self.simple(link, &commands::set_refill_mode())
    }

    pub fn configure_bezel<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        r: u8,
        g: u8,
        b: u8,
        volatility: u8,
        bezel_type: u8,
    ) -> Result<ResponseStatus> {
        self.simple(link, &commands::configure_bezel(r, g, b, volatility, bezel_type))
    }

    pub fn set_route<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        amount: u32,
        route: u8,
    ) -> Result<ResponseStatus> {
        self.simple(link, &commands::set_route(amount, commands::CURRENCY, route))
    }

    pub fn set_coin_inhibits<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        value: u16,
        currency: &str,
        enabled: bool,
    ) -> Result<ResponseStatus> {
        self.simple(link, &commands::set_coin_inhibits(value, currency, enabled))
    }

    pub fn payout<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        amount: u32,
        option: u8,
    ) -> Result<(ResponseStatus, Option<u8>)> {
        let (status, body) =
            self.transact(link, &commands::payout(amount, commands::CURRENCY, option))?;
        Ok((status, sub_error(status, &body)))
    }

    pub fn float_amount<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        amount: u32,
        option: u8,
    ) -> Result<(ResponseStatus, Option<u8>)> {
        let (status, body) =
            self.transact(link, &commands::float_amount(amount, commands::CURRENCY, option))?;
        Ok((status, sub_error(status, &body)))
    }

    pub fn set_denomination_level<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        level: u16,
        amount: u32,
    ) -> Result<ResponseStatus> {
        self.simple(
            link,
            &commands::set_denomination_level(level, amount, commands::CURRENCY),
        )
    }

    pub fn set_cashbox_payout_limit<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        limit: u16,
        denomination: u32,
    ) -> Result<ResponseStatus> {
        self.simple(
            link,
            &commands::set_cashbox_payout_limit(limit, denomination, commands::CURRENCY),
        )
    }

    pub fn get_all_levels<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Vec<LevelCounter>)> {
        let (status, body) = self.transact(link, &commands::get_all_levels())?;
        if !status.is_ok() {
            return Ok((status, Vec::new()));
        }
        Ok((status, commands::decode_levels(&body)?))
    }

    pub fn cashbox_payout_operation_data<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Option<CashboxOperationData>)> {
        let (status, body) = self.transact(link, &commands::cashbox_payout_operation_data())?;
        if !status.is_ok() {
            return Ok((status, None));
        }
        Ok((status, Some(commands::decode_cashbox_operation(&body)?)))
    }

    pub fn last_reject_note<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Option<u8>)> {
        let (status, body) = self.transact(link, &commands::last_reject_note())?;
        Ok((status, body.first().copied().filter(|_| status.is_ok())))
    }

    pub fn firmware_version<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Option<String>)> {
        let (status, body) = self.transact(link, &commands::get_firmware_version())?;
        if !status.is_ok() {
            return Ok((status, None));
        }
        Ok((status, Some(commands::decode_version(&body, 16)?)))
    }

    pub fn dataset_version<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Option<String>)> {
        let (status, body) = self.transact(link, &commands::get_dataset_version())?;
        if !status.is_ok() {
            return Ok((status, None));
        }
        Ok((status, Some(commands::decode_version(&body, 8)?)))
    }

    pub fn channel_security<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
    ) -> Result<(ResponseStatus, Vec<u8>)> {
        let (status, body) = self.transact(link, &commands::channel_security())?;
        if !status.is_ok() {
            return Ok((status, Vec::new()));
        }
        Ok((status, commands::decode_channel_security(&body)?))
    }

    /// Sends SET INHIBITS and commits the bitmap on acknowledgement only.
    pub fn apply_inhibits<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        low: u8,
        high: u8,
    ) -> Result<ResponseStatus> {
        let status = self.simple(link, &commands::set_inhibits(low, high))?;
        if status.is_ok() {
            self.inhibit_low = low;
            self.inhibit_high = high;
        }
        Ok(status)
    }

    /// ORs the selected channels into the current enable bitmap.
    pub fn enable_channels<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        set: u8,
    ) -> Result<ResponseStatus> {
        let low = self.inhibit_low | set;
        self.apply_inhibits(link, low, 0xFF)
    }

    /// Clears the selected channels from the current enable bitmap.
    pub fn disable_channels<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        set: u8,
    ) -> Result<ResponseStatus> {
        let low = self.inhibit_low & !set;
        self.apply_inhibits(link, low, 0xFF)
    }

    /// Absolute inhibit: starts from all-enabled and clears the selection.
    pub fn inhibit_channels<P: Transport>(
        &mut self,
        link: &mut SspLink<P>,
        set: u8,
    ) -> Result<ResponseStatus> {
        self.apply_inhibits(link, 0xFF & !set, 0xFF)
    }

    /// Runs the full bring-up sequence: SYNC, key negotiation, host protocol,
    /// setup request, identity logging, ENABLE (and ENABLE PAYOUT for the
    /// validator). Marks the device available on success.
    pub fn initialize<P: Transport>(&mut self, link: &mut SspLink<P>) -> Result<()> {
        log::info!(
            "initializing device 0x{:02x} ('{}')",
            self.session.address,
            self.label
        );

        self.available = false;
        self.phase = SessionPhase::Fresh;
        self.session.clear_key();

        let status = self.sync(link)?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        self.negotiate_key(link)?;

        let status = self.host_protocol(link, PROTOCOL_VERSION)?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        let status = self.setup_request(link)?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        if let Some(setup) = self.setup.as_ref() {
            for (index, channel) in setup.channels.iter().enumerate() {
                log::info!("channel {}: {} {}", index + 1, channel.value, channel.currency);
            }
        }

        match self.firmware_version(link)? {
            (_, Some(version)) => log::info!("firmware version: {version}"),
            (status, None) => log::warn!("could not read firmware version: {status}"),
        }
        match self.dataset_version(link)? {
            (_, Some(version)) => log::info!("dataset version: {version}"),
            (status, None) => log::warn!("could not read dataset version: {status}"),
        }

        let status = self.enable(link)?;
        if !status.is_ok() {
            return Err(Error::Status(status));
        }

        if self.kind == DeviceKind::Validator {
            let status = self.enable_payout(link)?;
            if !status.is_ok() {
                return Err(Error::Status(status));
            }
        }

        self.available = true;
        log::info!(
            "device 0x{:02x} ('{}') has been successfully initialized",
            self.session.address,
            self.label
        );
        Ok(())
    }
}

fn sub_error(status: ResponseStatus, body: &[u8]) -> Option<u8> {
    if status == ResponseStatus::CommandNotProcessed {
        body.first().copied()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::mock::{self, MockDevice};
    use crate::ssp::commands::cmd;

    fn harness() -> (SspLink<mock::MockPort>, MockDevice) {
        let (host, peer) = mock::pair();
        (SspLink::new(host), MockDevice::new(peer))
    }

    #[test]
    fn bring_up_reaches_enabled_with_channel_table() {
        let (mut link, device) = harness();
        let stop = Arc::new(AtomicBool::new(false));
        let serving = mock::spawn(device, Arc::clone(&stop));

        let mut validator = Device::validator();
        validator.initialize(&mut link).expect("initialize");

        assert_eq!(validator.phase, SessionPhase::Enabled);
        assert!(validator.available);
        assert!(validator.session.key.is_some());

        let setup = validator.setup.as_ref().expect("setup snapshot");
        assert_eq!(setup.protocol_version, PROTOCOL_VERSION);
        assert_eq!(validator.channel_value(1), Some(5));
        assert_eq!(validator.channel_value(99), None);

        stop.store(true, Ordering::SeqCst);
        serving.join().expect("join").expect("serve");
    }

    #[test]
    fn channel_bitmap_commits_only_on_acknowledgement() {
        let (mut link, mut device) = harness();
        let stop = Arc::new(AtomicBool::new(false));

        device.stage_response(cmd::SET_INHIBITS, ResponseStatus::Ok, Vec::new());
        let serving = mock::spawn(device, Arc::clone(&stop));

        let mut hopper = Device::hopper();

        let status = hopper.enable_channels(&mut link, 0b0000_0101).expect("enable");
        assert!(status.is_ok());
        assert_eq!(hopper.inhibit_low, 0b0000_0101);

        let status = hopper.disable_channels(&mut link, 0b0000_0001).expect("disable");
        assert!(status.is_ok());
        assert_eq!(hopper.inhibit_low, 0b0000_0100);

        stop.store(true, Ordering::SeqCst);
        serving.join().expect("join").expect("serve");
    }

    #[test]
    fn rejected_inhibit_update_keeps_previous_bitmap() {
        let (mut link, mut device) = harness();
        let stop = Arc::new(AtomicBool::new(false));

        device.stage_response(cmd::SET_INHIBITS, ResponseStatus::CommandNotProcessed, Vec::new());
        let serving = mock::spawn(device, Arc::clone(&stop));

        let mut hopper = Device::hopper();
        hopper.inhibit_low = 0b1111_0000;

        let status = hopper.enable_channels(&mut link, 0b0000_1111).expect("enable");
        assert!(!status.is_ok());
        assert_eq!(hopper.inhibit_low, 0b1111_0000);

        stop.store(true, Ordering::SeqCst);
        serving.join().expect("join").expect("serve");
    }

    #[test]
    fn inhibit_channels_is_absolute_and_idempotent() {
        let (mut link, device) = harness();
        let stop = Arc::new(AtomicBool::new(false));
        let log = device.command_log();
        let serving = mock::spawn(device, Arc::clone(&stop));

        let mut hopper = Device::hopper();
        hopper.inhibit_channels(&mut link, 0b0000_0110).expect("inhibit");
        let first = hopper.inhibit_low;
        hopper.inhibit_channels(&mut link, 0b0000_0110).expect("inhibit");

        assert_eq!(hopper.inhibit_low, first);
        assert_eq!(hopper.inhibit_low, 0b1111_1001);
        assert_eq!(
            log.lock().expect("log").as_slice(),
            &[cmd::SET_INHIBITS, cmd::SET_INHIBITS]
        );

        stop.store(true, Ordering::SeqCst);
        serving.join().expect("join").expect("serve");
    }

    #[test]
    fn unit_reset_renegotiates_host_protocol_first() {
        let (mut link, device) = harness();
        let stop = Arc::new(AtomicBool::new(false));
        let log = device.command_log();
        let serving = mock::spawn(device, Arc::clone(&stop));

        let mut validator = Device::validator();
        validator.initialize(&mut link).expect("initialize");

        log.lock().expect("log").clear();
        validator.on_unit_reset(&mut link).expect("reset handling");

        assert_eq!(validator.phase, SessionPhase::Fresh);
        assert!(validator.session.key.is_none());
        assert_eq!(log.lock().expect("log").first(), Some(&cmd::HOST_PROTOCOL));

        stop.store(true, Ordering::SeqCst);
        serving.join().expect("join").expect("serve");
    }
}
