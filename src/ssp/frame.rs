//! SSP frame encoding and decoding.
//!
//! Wire layout: `STX, SEQ|ADDR, LEN, DATA.., CRC-lo, CRC-hi` where the CRC
//! covers everything after STX. Any STX byte occurring inside the frame body
//! is doubled on the wire and halved on receive.

use std::io::{self, Read};

use crate::error::{Error, Result};
use crate::ssp::crc::crc16;

/// Start-of-frame marker.
pub const STX: u8 = 0x7F;

/// Largest DATA section a single frame can carry.
pub const MAX_DATA: usize = 0xFF;

/// Packs the 7-bit device address and the sequence bit into the SEQ|ADDR byte.
pub fn seq_addr(address: u8, sequence: bool) -> u8 {
    (address & 0x7F) | ((sequence as u8) << 7)
}

/// Extracts `(address, sequence)` from a SEQ|ADDR byte.
pub fn split_seq_addr(byte: u8) -> (u8, bool) {
    (byte & 0x7F, byte & 0x80 != 0)
}

/// Encodes a frame ready for the wire, byte stuffing included.
pub fn encode(seq_addr: u8, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_DATA);

    let mut body = Vec::with_capacity(data.len() + 4);
    body.push(seq_addr);
    body.push(data.len() as u8);
    body.extend_from_slice(data);

    let crc = crc16(&body);
    body.push((crc & 0xFF) as u8);
    body.push((crc >> 8) as u8);

    let mut wire = Vec::with_capacity(body.len() + 1);
    wire.push(STX);
    for &byte in &body {
        wire.push(byte);
        if byte == STX {
            wire.push(STX);
        }
    }

    wire
}

fn map_io(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::ReadTimeout,
        _ => Error::Io(err),
    }
}

fn read_byte<P: Read>(port: &mut P) -> Result<u8> {
    let mut byte = [0u8; 1];
    port.read_exact(&mut byte).map_err(map_io)?;
    Ok(byte[0])
}

// Reads one unstuffed frame body byte. A doubled STX yields a literal STX; a
// bare STX inside the body means the peer restarted a frame mid-stream.
fn read_body_byte<P: Read>(port: &mut P) -> Result<u8> {
    let byte = read_byte(port)?;
    if byte != STX {
        return Ok(byte);
    }

    if read_byte(port)? == STX {
        Ok(STX)
    } else {
        Err(Error::Frame("bare STX inside frame body"))
    }
}

/// Reads one complete frame, returning `(seq_addr, data)`.
///
/// Fails with [Error::Crc] when the checksum does not match, and with
/// [Error::ReadTimeout] when the transport deadline expires mid-frame.
pub fn read<P: Read>(port: &mut P) -> Result<(u8, Vec<u8>)> {
    let stx = read_byte(port)?;
    if stx != STX {
        return Err(Error::InvalidStx(stx));
    }

    let seq_addr = read_body_byte(port)?;
    let len = read_body_byte(port)? as usize;

    let mut body = Vec::with_capacity(len + 2);
    body.push(seq_addr);
    body.push(len as u8);
    for _ in 0..len {
        body.push(read_body_byte(port)?);
    }

    let crc_lo = read_body_byte(port)?;
    let crc_hi = read_body_byte(port)?;
    let crc = ((crc_hi as u16) << 8) | crc_lo as u16;

    if crc16(&body) != crc {
        return Err(Error::Crc);
    }

    Ok((seq_addr, body[2..].to_vec()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn round_trips_plain_payload() {
        let wire = encode(seq_addr(0x10, true), &[0x07, 0x01, 0x02]);
        let (sa, data) = read(&mut Cursor::new(wire)).expect("decode");

        assert_eq!(split_seq_addr(sa), (0x10, true));
        assert_eq!(data, vec![0x07, 0x01, 0x02]);
    }

    #[test]
    fn stuffs_stx_bytes_in_body() {
        let wire = encode(seq_addr(0x00, false), &[STX, 0x33, STX]);

        // both payload STX bytes appear doubled on the wire
        let doubled = wire.windows(2).filter(|w| w[0] == STX && w[1] == STX).count();
        assert!(doubled >= 2);

        let (_, data) = read(&mut Cursor::new(wire)).expect("decode");
        assert_eq!(data, vec![STX, 0x33, STX]);
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut wire = encode(seq_addr(0x10, false), &[0x11]);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        assert!(matches!(read(&mut Cursor::new(wire)), Err(Error::Crc)));
    }

    #[test]
    fn rejects_missing_stx() {
        let err = read(&mut Cursor::new(vec![0x00, 0x01])).unwrap_err();
        assert!(matches!(err, Error::InvalidStx(0x00)));
    }

    #[test]
    fn short_stream_is_a_timeout_free_io_error() {
        // Cursor EOF surfaces as Io, not a hang.
        let wire = encode(seq_addr(0x10, false), &[0x11, 0x22]);
        let err = read(&mut Cursor::new(&wire[..3])).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
