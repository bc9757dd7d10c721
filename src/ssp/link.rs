//! The framed, optionally encrypted request/response exchange with retry.

use std::io::Write;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ssp::crypto::{self, AesKey};
use crate::ssp::frame;
use crate::ssp::ResponseStatus;
use crate::transport::Transport;

/// Default retry budget per exchange.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default per-attempt response timeout (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;

/// Tunables of a single command envelope.
#[derive(Clone, Copy, Debug)]
pub struct ExchangeOptions {
    pub retries: u32,
    pub timeout: Duration,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Per-device framing and encryption state.
///
/// The sequence bit flips exactly once per successful exchange and is reused
/// on retries so the device can idempotently resend its last response. The
/// counter advances once per successful encrypted exchange.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub address: u8,
    pub sequence: bool,
    pub count: u32,
    pub fixed_key: u64,
    pub key: Option<AesKey>,
}

impl SessionState {
    pub fn new(address: u8, fixed_key: u64) -> Self {
        Self {
            address,
            sequence: false,
            count: 0,
            fixed_key,
            key: None,
        }
    }

    /// Forgets the negotiated session key; the next negotiation starts the
    /// encrypted frame counter over.
    pub fn clear_key(&mut self) {
        self.key = None;
        self.count = 0;
    }
}

/// The host end of the SSP serial bus.
///
/// All hardware access funnels through [SspLink::exchange]; the event loop
/// is the only caller, which keeps the line single-writer.
pub struct SspLink<P> {
    port: P,
}

impl<P: Transport> SspLink<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Performs one command exchange with the device owning `session`.
    ///
    /// Returns the response status and the payload that follows it. Checksum
    /// failures and response timeouts are retried up to the budget with the
    /// same sequence bit; once exhausted the corresponding status is handed
    /// to the caller and the sequence bit stays put.
    pub fn exchange(
        &mut self,
        session: &mut SessionState,
        command: &[u8],
        options: &ExchangeOptions,
    ) -> Result<(ResponseStatus, Vec<u8>)> {
        self.port.set_read_timeout(options.timeout)?;

        let data = match session.key.as_ref() {
            Some(key) => crypto::encrypt(key, session.count, command),
            None => command.to_vec(),
        };
        let wire = frame::encode(frame::seq_addr(session.address, session.sequence), &data);

        let mut exhausted = ResponseStatus::Timeout;
        for attempt in 1..=options.retries {
            self.port.write_all(&wire)?;
            self.port.flush()?;

            let body = match frame::read(&mut self.port) {
                Ok((_, body)) => body,
                Err(Error::ReadTimeout) => {
                    log::warn!(
                        "no response from 0x{:02x} (attempt {attempt}/{})",
                        session.address,
                        options.retries
                    );
                    exhausted = ResponseStatus::Timeout;
                    continue;
                }
                Err(Error::Crc) | Err(Error::Frame(_)) => {
                    log::warn!(
                        "garbled response from 0x{:02x} (attempt {attempt}/{})",
                        session.address,
                        options.retries
                    );
                    exhausted = ResponseStatus::ChecksumError;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let plain = match session.key.as_ref() {
                Some(key) if body.first() == Some(&crypto::STEX) => {
                    match crypto::decrypt(key, session.count, &body) {
                        Ok(plain) => plain,
                        Err(err) => {
                            log::warn!(
                                "undecryptable response from 0x{:02x}: {err}",
                                session.address
                            );
                            exhausted = ResponseStatus::ChecksumError;
                            continue;
                        }
                    }
                }
                // a plaintext reply despite an active session key: the device
                // lost the key (a KEY_NOT_SET status follows) or restarted
                _ => body,
            };

            let Some(&status_byte) = plain.first() else {
                return Err(Error::Truncated("response status byte"));
            };
            let status = ResponseStatus::from(status_byte);

            if status == ResponseStatus::ChecksumError {
                // the device saw a corrupt frame from us; resend as-is
                log::warn!(
                    "device 0x{:02x} reported a checksum error (attempt {attempt}/{})",
                    session.address,
                    options.retries
                );
                exhausted = ResponseStatus::ChecksumError;
                continue;
            }

            session.sequence = !session.sequence;
            if session.key.is_some() {
                session.count = session.count.wrapping_add(1);
            }

            return Ok((status, plain[1..].to_vec()));
        }

        Ok((exhausted, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::mock::{self, MockDevice};
    use crate::ssp::commands;

    fn served_link() -> (SspLink<mock::MockPort>, MockDevice, Arc<AtomicBool>) {
        let (host, device) = mock::pair();
        (SspLink::new(host), MockDevice::new(device), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn sequence_bit_flips_on_success_only() {
        let (mut link, mut device, stop) = served_link();
        let serving = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || device.serve(stop))
        };

        let mut session = SessionState::new(0x10, 0x0123_4567_0123_4567);
        let options = ExchangeOptions::default();

        let (status, _) = link
            .exchange(&mut session, &commands::sync(), &options)
            .expect("exchange");
        assert!(status.is_ok());
        assert!(session.sequence);

        let (status, _) = link
            .exchange(&mut session, &commands::poll(), &options)
            .expect("exchange");
        assert!(status.is_ok());
        assert!(!session.sequence);

        stop.store(true, Ordering::SeqCst);
        serving.join().expect("join").expect("serve");
    }

    #[test]
    fn timeout_surfaces_after_budget_without_flipping_sequence() {
        // no device thread: every attempt times out
        let (mut link, _device, _stop) = served_link();

        let mut session = SessionState::new(0x10, 0);
        let options = ExchangeOptions {
            retries: 2,
            timeout: Duration::from_millis(50),
        };

        let (status, body) = link
            .exchange(&mut session, &commands::poll(), &options)
            .expect("exchange");

        assert_eq!(status, ResponseStatus::Timeout);
        assert!(body.is_empty());
        assert!(!session.sequence);
    }
}
