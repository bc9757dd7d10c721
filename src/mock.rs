//! Test support: an in-memory serial pair and a scripted SSP device.
//!
//! The mock device speaks real frames, negotiates real session keys and
//! encrypts once a key exchange completed, so the whole link stack can be
//! exercised without hardware.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ssp::commands::cmd;
use crate::ssp::crypto::{self, AesKey};
use crate::ssp::{frame, ResponseStatus};
use crate::transport::Transport;

/// One end of an in-memory duplex byte stream.
pub struct MockPort {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: VecDeque<u8>,
    read_timeout: Duration,
}

/// Creates a connected pair of ports; hand one to the code under test and
/// the other to a [MockDevice].
pub fn pair() -> (MockPort, MockPort) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();

    let make = |tx, rx| MockPort {
        tx,
        rx,
        buffer: VecDeque::new(),
        read_timeout: Duration::from_millis(500),
    };

    (make(a_tx, a_rx), make(b_tx, b_rx))
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.buffer.extend(chunk),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        while let Ok(chunk) = self.rx.try_recv() {
            self.buffer.extend(chunk);
        }

        let n = buf.len().min(self.buffer.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.buffer.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock peer gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockPort {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }
}

// The device's private key-exchange secret; any fixed odd value works.
const DEVICE_SECRET: u64 = 0x9E37_79B9_7F4A_7C15;

/// A scripted SSP peripheral served from a background thread.
pub struct MockDevice {
    port: MockPort,
    fixed_key: u64,
    key: Option<AesKey>,
    generator: u64,
    modulus: u64,
    unit_type: u8,
    channels: Vec<(u32, &'static str)>,
    overrides: HashMap<u8, (ResponseStatus, Vec<u8>)>,
    events: Arc<Mutex<VecDeque<Vec<u8>>>>,
    log: Arc<Mutex<Vec<u8>>>,
}

impl MockDevice {
    pub fn new(port: MockPort) -> Self {
        Self {
            port,
            fixed_key: crate::device::DEFAULT_KEY,
            key: None,
            generator: 0,
            modulus: 0,
            unit_type: 0x06,
            channels: vec![(5, "EUR"), (10, "EUR"), (20, "EUR"), (50, "EUR")],
            overrides: HashMap::new(),
            events: Arc::new(Mutex::new(VecDeque::new())),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_unit_type(&mut self, unit_type: u8) {
        self.unit_type = unit_type;
    }

    pub fn set_channels(&mut self, channels: Vec<(u32, &'static str)>) {
        self.channels = channels;
    }

    /// Replaces the response for `command` with a fixed status and body.
    pub fn stage_response(&mut self, command: u8, status: ResponseStatus, body: Vec<u8>) {
        self.overrides.insert(command, (status, body));
    }

    /// Queue of raw poll response bodies, served one per POLL.
    pub fn event_queue(&self) -> Arc<Mutex<VecDeque<Vec<u8>>>> {
        Arc::clone(&self.events)
    }

    /// Opcodes of every command the device decoded, in arrival order.
    pub fn command_log(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.log)
    }

    /// Serves exchanges until `stop` is raised.
    pub fn serve(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        self.port.set_read_timeout(Duration::from_millis(50))?;

        while !stop.load(Ordering::Relaxed) {
            let (seq_addr, data) = match frame::read(&mut self.port) {
                Ok(frame) => frame,
                Err(Error::ReadTimeout) => continue,
                Err(Error::Crc) | Err(Error::Frame(_)) | Err(Error::InvalidStx(_)) => continue,
                Err(_) => break,
            };

            let has_stex = data.first() == Some(&crypto::STEX);
            let mut encrypted = false;
            let (count, command) = match self.key.as_ref() {
                Some(key) if has_stex => {
                    encrypted = true;
                    match crypto::open(key, &data) {
                        Ok(opened) => opened,
                        Err(_) => continue,
                    }
                }
                _ => (0, data),
            };

            let Some(&opcode) = command.first() else {
                continue;
            };
            if let Ok(mut log) = self.log.lock() {
                log.push(opcode);
            }

            let (status, body, new_key) = self.respond(opcode, &command);

            let mut plain = vec![status.to_u8()];
            plain.extend_from_slice(&body);

            let wire_data = match (encrypted, self.key.as_ref()) {
                (true, Some(key)) => crypto::encrypt(key, count, &plain),
                _ => plain,
            };
            self.port.write_all(&frame::encode(seq_addr, &wire_data))?;

            // a key agreed during this exchange applies from the next one
            if let Some(key) = new_key {
                self.key = Some(key);
            }
        }

        Ok(())
    }

    fn respond(&mut self, opcode: u8, command: &[u8]) -> (ResponseStatus, Vec<u8>, Option<AesKey>) {
        if let Some((status, body)) = self.overrides.get(&opcode) {
            return (*status, body.clone(), None);
        }

        match opcode {
            cmd::SET_GENERATOR => {
                self.generator = read_u64(&command[1..]);
                (ResponseStatus::Ok, Vec::new(), None)
            }
            cmd::SET_MODULUS => {
                self.modulus = read_u64(&command[1..]);
                (ResponseStatus::Ok, Vec::new(), None)
            }
            cmd::REQUEST_KEY_EXCHANGE => {
                let host_intermediate = read_u64(&command[1..]);
                let device_intermediate =
                    crypto::modpow(self.generator, DEVICE_SECRET, self.modulus);
                let negotiated = crypto::modpow(host_intermediate, DEVICE_SECRET, self.modulus);
                let key = crypto::session_key(self.fixed_key, negotiated);

                (
                    ResponseStatus::Ok,
                    device_intermediate.to_le_bytes().to_vec(),
                    Some(key),
                )
            }
            cmd::SETUP_REQUEST => (ResponseStatus::Ok, self.setup_body(), None),
            cmd::POLL => {
                let body = self
                    .events
                    .lock()
                    .ok()
                    .and_then(|mut queue| queue.pop_front())
                    .unwrap_or_default();
                (ResponseStatus::Ok, body, None)
            }
            cmd::GET_ALL_LEVELS => (ResponseStatus::Ok, vec![0x00], None),
            cmd::CASHBOX_PAYOUT_OPERATION_DATA => {
                (ResponseStatus::Ok, vec![0x00, 0x00, 0x00, 0x00], None)
            }
            cmd::LAST_REJECT_NOTE => (ResponseStatus::Ok, vec![0x00], None),
            cmd::GET_FIRMWARE_VERSION => {
                (ResponseStatus::Ok, b"MOCKFW0000000001".to_vec(), None)
            }
            cmd::GET_DATASET_VERSION => (ResponseStatus::Ok, b"EUR00001".to_vec(), None),
            cmd::CHANNEL_SECURITY => {
                let mut body = vec![self.channels.len() as u8];
                body.resize(1 + self.channels.len(), 0x02);
                (ResponseStatus::Ok, body, None)
            }
            _ => (ResponseStatus::Ok, Vec::new(), None),
        }
    }

    fn setup_body(&self) -> Vec<u8> {
        let count = self.channels.len() as u8;

        let mut body = vec![self.unit_type];
        body.extend_from_slice(b"0333");
        body.extend_from_slice(b"EUR");
        body.extend_from_slice(&[0x00, 0x00, 0x01]);
        body.push(count);
        for &(value, _) in &self.channels {
            body.push(value.min(0xFF) as u8);
        }
        for _ in &self.channels {
            body.push(0x02);
        }
        body.extend_from_slice(&[0x00, 0x00, 0x64]);
        body.push(0x06);
        for &(_, currency) in &self.channels {
            body.extend_from_slice(currency.as_bytes());
        }
        for &(value, _) in &self.channels {
            body.extend_from_slice(&value.to_le_bytes());
        }
        body
    }
}

fn read_u64(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = data.len().min(8);
    bytes[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(bytes)
}

/// Serves `device` on a background thread until `stop` is raised.
pub fn spawn(mut device: MockDevice, stop: Arc<AtomicBool>) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || device.serve(stop))
}
