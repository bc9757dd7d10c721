//! The eSSP encryption layer: session keys, the encrypted envelope and the
//! key negotiation arithmetic.
//!
//! The envelope replaces the frame DATA section with `STEX` followed by
//! AES-128 encrypted blocks whose plaintext is
//! `{ count u32-le, length u8, payload, random padding, CRC-16 }`,
//! padded so the whole plaintext is a multiple of the AES block size.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::Rng;

use crate::error::{Error, Result};
use crate::ssp::crc::crc16;

/// Marker byte prefixing encrypted frame data.
pub const STEX: u8 = 0x7E;

/// AES block size in bytes.
pub const BLOCK: usize = 16;

/// AES-128 session key: preshared fixed half plus the negotiated half.
pub type AesKey = [u8; BLOCK];

/// Builds the session key from the preshared 64-bit key and the negotiated
/// 64-bit key half, both little-endian.
pub fn session_key(fixed: u64, negotiated: u64) -> AesKey {
    let mut key = [0u8; BLOCK];
    key[..8].copy_from_slice(&fixed.to_le_bytes());
    key[8..].copy_from_slice(&negotiated.to_le_bytes());
    key
}

/// Wraps `payload` into an encrypted frame DATA section.
///
/// `count` is the per-session encrypted frame counter; it must be
/// incremented once per successful encrypted exchange, and reused verbatim
/// when a frame is retried.
pub fn encrypt(key: &AesKey, count: u32, payload: &[u8]) -> Vec<u8> {
    let base = 4 + 1 + payload.len() + 2;
    let padding = (BLOCK - base % BLOCK) % BLOCK;

    let mut plain = Vec::with_capacity(base + padding);
    plain.extend_from_slice(&count.to_le_bytes());
    plain.push(payload.len() as u8);
    plain.extend_from_slice(payload);

    let mut rng = rand::thread_rng();
    for _ in 0..padding {
        plain.push(rng.gen());
    }

    let crc = crc16(&plain);
    plain.push((crc & 0xFF) as u8);
    plain.push((crc >> 8) as u8);

    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in plain.chunks_exact_mut(BLOCK) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    let mut data = Vec::with_capacity(plain.len() + 1);
    data.push(STEX);
    data.extend_from_slice(&plain);
    data
}

/// Unwraps an encrypted frame DATA section, verifying the inner CRC and the
/// counter echo.
pub fn decrypt(key: &AesKey, count: u32, data: &[u8]) -> Result<Vec<u8>> {
    let (echoed, payload) = open(key, data)?;
    if echoed != count {
        return Err(Error::Encryption("counter mismatch"));
    }
    Ok(payload)
}

/// Unwraps an encrypted frame DATA section, returning the carried counter
/// alongside the payload. Used where the counter is not known up front.
pub fn open(key: &AesKey, data: &[u8]) -> Result<(u32, Vec<u8>)> {
    if data.first() != Some(&STEX) {
        return Err(Error::Encryption("missing STEX marker"));
    }

    let body = &data[1..];
    if body.is_empty() || body.len() % BLOCK != 0 {
        return Err(Error::Encryption("ciphertext is not block aligned"));
    }

    let mut plain = body.to_vec();
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in plain.chunks_exact_mut(BLOCK) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    let crc_at = plain.len() - 2;
    let crc = ((plain[crc_at + 1] as u16) << 8) | plain[crc_at] as u16;
    if crc16(&plain[..crc_at]) != crc {
        return Err(Error::Encryption("inner CRC mismatch"));
    }

    let echoed = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);

    let length = plain[4] as usize;
    if 5 + length > crc_at {
        return Err(Error::Encryption("payload length exceeds envelope"));
    }

    Ok((echoed, plain[5..5 + length].to_vec()))
}

/// Modular exponentiation over 64-bit operands.
pub fn modpow(base: u64, mut exponent: u64, modulus: u64) -> u64 {
    if modulus <= 1 {
        return 0;
    }

    let modulus = modulus as u128;
    let mut result: u128 = 1;
    let mut base = base as u128 % modulus;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }

    result as u64
}

fn mulmod(a: u64, b: u64, modulus: u64) -> u64 {
    (a as u128 * b as u128 % modulus as u128) as u64
}

// Deterministic Miller-Rabin for 64-bit candidates.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if n == p {
            return true;
        }
        if n % p == 0 {
            return false;
        }
    }

    let mut d = n - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    'witness: for a in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let mut x = modpow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 0..r - 1 {
            x = mulmod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }

    true
}

fn random_prime<R: Rng>(rng: &mut R) -> u64 {
    loop {
        let candidate = rng.gen::<u64>() | 1;
        if is_prime(candidate) {
            return candidate;
        }
    }
}

/// Host-side state for one key negotiation round.
///
/// The generator and modulus primes are drawn from entropy, ordered so the
/// generator is the larger of the two (the device rejects the reverse), and
/// the host random stays private to this structure.
pub struct KeyNegotiation {
    generator: u64,
    modulus: u64,
    random: u64,
}

impl KeyNegotiation {
    pub fn from_entropy() -> Self {
        let mut rng = rand::thread_rng();

        let mut generator = random_prime(&mut rng);
        let mut modulus = random_prime(&mut rng);
        if modulus > generator {
            std::mem::swap(&mut generator, &mut modulus);
        }

        Self {
            generator,
            modulus,
            random: rng.gen(),
        }
    }

    pub fn generator(&self) -> u64 {
        self.generator
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// The host intermediate key sent with REQUEST KEY EXCHANGE.
    pub fn host_intermediate(&self) -> u64 {
        modpow(self.generator, self.random, self.modulus)
    }

    /// Derives the negotiated key half from the device's intermediate key.
    pub fn negotiated(&self, device_intermediate: u64) -> u64 {
        modpow(device_intermediate, self.random, self.modulus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = [
        0x67, 0x45, 0x23, 0x01, 0x67, 0x45, 0x23, 0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x11, 0x22,
        0x33,
    ];

    #[test]
    fn envelope_round_trips() {
        let payload = [0x07u8, 0x33, 0x00, 0x01];
        let data = encrypt(&KEY, 7, &payload);

        assert_eq!(data[0], STEX);
        assert_eq!((data.len() - 1) % BLOCK, 0);
        assert_eq!(decrypt(&KEY, 7, &data).expect("decrypt"), payload);
    }

    #[test]
    fn envelope_rejects_tampering() {
        let mut data = encrypt(&KEY, 1, &[0x0A]);
        data[5] ^= 0x01;
        assert!(decrypt(&KEY, 1, &data).is_err());
    }

    #[test]
    fn envelope_rejects_stale_counter() {
        let data = encrypt(&KEY, 3, &[0x0A]);
        assert!(matches!(
            decrypt(&KEY, 4, &data),
            Err(Error::Encryption("counter mismatch"))
        ));
    }

    #[test]
    fn session_key_layout_is_little_endian() {
        let key = session_key(0x0123_4567_0123_4567, 0x1122_3344_5566_7788);
        assert_eq!(key[..8], [0x67, 0x45, 0x23, 0x01, 0x67, 0x45, 0x23, 0x01]);
        assert_eq!(key[8..], [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn negotiation_agrees_on_both_sides() {
        let host = KeyNegotiation::from_entropy();

        // simulate the device side with its own secret
        let device_secret = 0xDEAD_BEEF_CAFE_F00Du64;
        let device_intermediate = modpow(host.generator(), device_secret, host.modulus());
        let device_key = modpow(host.host_intermediate(), device_secret, host.modulus());

        assert_eq!(host.negotiated(device_intermediate), device_key);
    }

    #[test]
    fn modpow_matches_small_cases() {
        assert_eq!(modpow(2, 10, 1_000), 24);
        assert_eq!(modpow(3, 0, 7), 1);
        assert_eq!(modpow(10, 5, 1), 0);
    }

    #[test]
    fn primality_check_spot_checks() {
        assert!(is_prime(2));
        assert!(is_prime(0xFFFF_FFFF_FFFF_FFC5)); // largest 64-bit prime
        assert!(!is_prime(0xFFFF_FFFF_FFFF_FFC7));
        assert!(!is_prime(1));
    }
}
