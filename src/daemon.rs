//! The daemon context and the cooperative event loop.
//!
//! Three logical sources drive the loop: the periodic poll tick, the
//! periodic shutdown check and the bus message channel. The loop owns every
//! piece of state and is the only hardware writer, so no two sources can
//! ever touch the serial line concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::bus::{self, BusMessage, BusPublisher};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::events::{self, FollowUp};
use crate::handler;
use crate::ssp::commands::{ROUTE_CASHBOX, ROUTE_STORAGE};
use crate::ssp::{ResponseStatus, SspLink};
use crate::transport::SerialTransport;

/// Period of the hardware poll tick.
const POLL_PERIOD: Duration = Duration::from_secs(1);

/// Period of the shutdown check tick.
const QUIT_PERIOD: Duration = Duration::from_millis(500);

/// Recovery gap the hardware needs before each operation.
const HARDWARE_WAIT: Duration = Duration::from_millis(300);

/// Startup note routing (amounts in cents): small notes to the cashbox,
/// large ones to the payoutable storage.
const VALIDATOR_ROUTES: [(u32, u8); 7] = [
    (500, ROUTE_CASHBOX),
    (1_000, ROUTE_CASHBOX),
    (2_000, ROUTE_CASHBOX),
    (5_000, ROUTE_STORAGE),
    (10_000, ROUTE_STORAGE),
    (20_000, ROUTE_STORAGE),
    (50_000, ROUTE_STORAGE),
];

/// Runtime configuration collected from the command line.
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    pub serial_device: String,
    pub accept_coins: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_host: "127.0.0.1".into(),
            redis_port: 6379,
            serial_device: "/dev/ttyACM0".into(),
            accept_coins: false,
        }
    }
}

fn hardware_wait() {
    thread::sleep(HARDWARE_WAIT);
}

/// Everything the event loop owns.
pub struct Daemon {
    publisher: BusPublisher,
    bus_rx: mpsc::Receiver<BusMessage>,
    subscriber: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    link: SspLink<SerialTransport>,
    hopper: Device,
    validator: Device,
    accept_coins: bool,
}

impl Daemon {
    /// Connects the bus, spawns the subscription feeder and opens the serial
    /// device. Any failure here is fatal; the daemon never starts degraded.
    pub fn new(config: &Config, shutdown: Arc<AtomicBool>) -> Result<Self> {
        log::info!(
            "using bus at {}:{} and hardware device {}",
            config.redis_host,
            config.redis_port,
            config.serial_device
        );

        let publisher = BusPublisher::connect(&config.redis_host, config.redis_port)?;
        let (bus_rx, subscriber) = bus::spawn_subscriber(
            &config.redis_host,
            config.redis_port,
            Arc::clone(&shutdown),
        )?;
        let transport = SerialTransport::open(&config.serial_device)?;

        Ok(Self {
            publisher,
            bus_rx,
            subscriber: Some(subscriber),
            shutdown,
            link: SspLink::new(transport),
            hopper: Device::hopper(),
            validator: Device::validator(),
            accept_coins: config.accept_coins,
        })
    }

    /// Configures the hardware, announces startup, runs the loop until
    /// shutdown and announces the exit.
    pub fn run(&mut self) -> Result<()> {
        self.setup_hardware();

        log::info!("open for business");
        self.publisher
            .publish(bus::TOPIC_PAYOUT_EVENT, &json!({"event": "started"}))?;

        let result = self.event_loop();

        self.publisher
            .publish(bus::TOPIC_PAYOUT_EVENT, &json!({"event": "exiting"}))?;
        log::info!("shutting down");

        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.subscriber.take() {
            let _ = handle.join();
        }

        result
    }

    fn setup_hardware(&mut self) {
        if let Err(err) = self.hopper.initialize(&mut self.link) {
            log::error!("could not initialize device '{}': {err}", self.hopper.label);
        }
        if self.hopper.available {
            self.configure_hopper();
        } else {
            log::warn!(
                "skipping setup of device '{}' as it is not available",
                self.hopper.label
            );
        }

        if let Err(err) = self.validator.initialize(&mut self.link) {
            log::error!("could not initialize device '{}': {err}", self.validator.label);
        }
        if self.validator.available {
            self.configure_validator();
        } else {
            log::warn!(
                "skipping setup of device '{}' as it is not available",
                self.validator.label
            );
        }
    }

    fn configure_hopper(&mut self) {
        log::info!("setup of device '{}' started", self.hopper.label);

        if self.accept_coins {
            log::warn!("coins will be accepted");
        } else {
            log::info!("coins will not be accepted");
        }

        let channels = self
            .hopper
            .setup
            .as_ref()
            .map(|setup| setup.channels.clone())
            .unwrap_or_default();

        for channel in &channels {
            let result = self.hopper.set_coin_inhibits(
                &mut self.link,
                channel.value as u16,
                &channel.currency,
                self.accept_coins,
            );
            match result {
                Ok(status) if status.is_ok() => {}
                Ok(status) => log::warn!(
                    "coin inhibit for {} {} rejected: {status}",
                    channel.value,
                    channel.currency
                ),
                Err(err) => log::warn!(
                    "coin inhibit for {} {} failed: {err}",
                    channel.value,
                    channel.currency
                ),
            }
        }

        log::info!("setup of device '{}' finished", self.hopper.label);
    }

    fn configure_validator(&mut self) {
        log::info!("setup of device '{}' started", self.validator.label);

        // reject notes unfit for storage; without this they are silently
        // routed to the cashbox, from which no payout can be done
        match self.validator.set_refill_mode(&mut self.link) {
            Ok(status) if status.is_ok() => {}
            Ok(status) => log::warn!("setting refill mode failed: {status}"),
            Err(err) => log::warn!("setting refill mode failed: {err}"),
        }

        for (amount, route) in VALIDATOR_ROUTES {
            match self.validator.set_route(&mut self.link, amount, route) {
                Ok(status) if status.is_ok() => {}
                Ok(status) => log::warn!("routing {amount} failed: {status}"),
                Err(err) => log::warn!("routing {amount} failed: {err}"),
            }
        }

        // start with every note channel inhibited; callers enable them later
        match self.validator.apply_inhibits(&mut self.link, 0x00, 0x00) {
            Ok(status) if status.is_ok() => {}
            Ok(status) => {
                log::error!("startup inhibits failed: {status}");
                return;
            }
            Err(err) => {
                log::error!("startup inhibits failed: {err}");
                return;
            }
        }

        log::info!("setup of device '{}' finished", self.validator.label);
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut next_poll = Instant::now() + POLL_PERIOD;
        let mut next_quit = Instant::now() + QUIT_PERIOD;

        loop {
            let now = Instant::now();

            if now >= next_quit {
                next_quit = now + QUIT_PERIOD;
                if self.shutdown.load(Ordering::Relaxed) {
                    log::info!("received signal or quit cmd, leaving event loop");
                    break;
                }
            }

            if now >= next_poll {
                self.poll_devices()?;
                next_poll = Instant::now() + POLL_PERIOD;
            }

            let wait = next_poll
                .min(next_quit)
                .saturating_duration_since(Instant::now());
            match self.bus_rx.recv_timeout(wait) {
                Ok(message) => self.on_bus_message(message)?,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::error!("bus subscription closed, leaving event loop");
                    break;
                }
            }
        }

        Ok(())
    }

    fn poll_devices(&mut self) -> Result<()> {
        if self.hopper.available {
            Self::poll_device(
                &mut self.link,
                &mut self.hopper,
                &mut self.publisher,
                bus::TOPIC_HOPPER_EVENT,
            )?;
        }
        if self.validator.available {
            Self::poll_device(
                &mut self.link,
                &mut self.validator,
                &mut self.publisher,
                bus::TOPIC_VALIDATOR_EVENT,
            )?;
        }
        Ok(())
    }

    fn poll_device(
        link: &mut SspLink<SerialTransport>,
        device: &mut Device,
        publisher: &mut BusPublisher,
        topic: &str,
    ) -> Result<()> {
        hardware_wait();

        let (status, poll_events) = match device.poll(link) {
            Ok(result) => result,
            // the serial line itself failed; that is fatal for the daemon
            Err(err @ (Error::Io(_) | Error::SerialPort(_))) => return Err(err),
            Err(err) => {
                log::warn!("poll of '{}' failed: {err}", device.label);
                return Ok(());
            }
        };

        if status == ResponseStatus::Timeout {
            log::warn!("SSP poll timeout for '{}'", device.label);
            return Ok(());
        }
        if !status.is_ok() {
            log::warn!("SSP poll error for '{}': {status}", device.label);
            return Ok(());
        }
        if poll_events.is_empty() {
            return Ok(());
        }

        log::info!(
            "parsing poll response from '{}' ({} events)",
            device.label,
            poll_events.len()
        );

        for event in &poll_events {
            let (document, follow_up) = events::translate(device, event);
            publisher.publish(topic, &document)?;

            match follow_up {
                FollowUp::None => {}
                FollowUp::UnitReset => match device.on_unit_reset(link) {
                    Ok(status) if status.is_ok() => {}
                    Ok(status) => {
                        log::error!(
                            "host protocol renegotiation failed for '{}': {status}",
                            device.label
                        );
                        device.available = false;
                    }
                    Err(err @ (Error::Io(_) | Error::SerialPort(_))) => return Err(err),
                    Err(err) => {
                        log::error!(
                            "host protocol renegotiation failed for '{}': {err}",
                            device.label
                        );
                        device.available = false;
                    }
                },
                FollowUp::RunCalibration => match device.run_calibration(link) {
                    Ok(status) if status.is_ok() => {}
                    Ok(status) => {
                        log::warn!("calibration run rejected by '{}': {status}", device.label)
                    }
                    Err(err) => log::warn!("calibration run failed for '{}': {err}", device.label),
                },
            }
        }

        Ok(())
    }

    fn on_bus_message(&mut self, message: BusMessage) -> Result<()> {
        let (device, response_topic) = match message.topic.as_str() {
            bus::TOPIC_HOPPER_REQUEST => (&mut self.hopper, bus::TOPIC_HOPPER_RESPONSE),
            bus::TOPIC_VALIDATOR_REQUEST => (&mut self.validator, bus::TOPIC_VALIDATOR_RESPONSE),
            // reserved: subscribed, but no behavior is defined
            bus::TOPIC_METACASH => return Ok(()),
            other => {
                log::warn!("message on unexpected topic '{other}'");
                return Ok(());
            }
        };

        hardware_wait();

        // a device that failed initialization only serves test/quit; the
        // handler rejects everything else before a single byte hits the wire
        let available = device.available;
        let outcome = match handler::process(device, &mut self.link, available, &message.payload) {
            Ok(outcome) => outcome,
            Err(err @ (Error::Io(_) | Error::SerialPort(_))) => return Err(err),
            Err(err) => {
                log::error!("request handling failed: {err}");
                return Ok(());
            }
        };

        if outcome.quit {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        if let Some(document) = outcome.response {
            self.publisher.publish(response_topic, &document)?;
        }

        Ok(())
    }
}
