//! Base58Check decoding, used to validate and version-tag recipient addresses.

use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// The 58-symbol alphabet: digits and letters minus `0`, `O`, `I`, `l`.
pub const ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn digit_of(c: u8) -> Option<u64> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u64)
}

/// Decodes a Base58 string (no checksum) and appends the result to `dst`.
///
/// Returns `None` if `src` contains a character outside the alphabet.
pub fn decode_append(dst: &mut Vec<u8>, src: &str) -> Option<()> {
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i] == b'1' {
        dst.push(0);
        i += 1;
    }
    let base = BigUint::from(ALPHABET.len() as u64);
    let mut v = BigUint::from(0u64);
    for &c in &bytes[i..] {
        let d = digit_of(c)?;
        v *= &base;
        v += d;
    }
    dst.extend_from_slice(&v.to_bytes_be());
    Some(())
}

/// Performs Base58Check decoding: decodes `src`, then strips and verifies the
/// trailing 4-byte double-SHA-256 checksum. Returns the payload (without the
/// checksum) appended to `dst`, or `None` if the format or checksum is invalid.
pub fn decode_append_check(dst: &mut Vec<u8>, src: &str) -> Option<()> {
    let mut decoded = Vec::new();
    decode_append(&mut decoded, src)?;
    if decoded.len() < 4 {
        return None;
    }
    let (payload, checksum) = decoded.split_at(decoded.len() - 4);
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    if &second[..4] != checksum {
        return None;
    }
    dst.extend_from_slice(payload);
    Some(())
}

/// Returns the version byte of a cryptocurrency address encoded in
/// Base58Check, or `-1` if the address is malformed.
pub fn address_version(addr: &str) -> i32 {
    if addr.len() < 27 || addr.len() > 35 {
        return -1;
    }
    let mut payload = Vec::with_capacity(26);
    if decode_append_check(&mut payload, addr).is_none() {
        return -1;
    }
    if payload.len() != 21 {
        return -1;
    }
    payload[0] as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_addresses() {
        assert_eq!(address_version("1111111111111111111114oLvT2"), 0);
        assert_eq!(
            address_version("Vanity28Chh8vK8p8p2qYtK3KgCDLoVdaJ"),
            71
        );
        assert_eq!(
            address_version("2n1XR4oJkmBdJMxhBGQGb96gQ88xUyGML1i"),
            255
        );
    }

    #[test]
    fn bad_checksum() {
        assert_eq!(address_version("CheckFaiL6vnwRczcqLGsb1gF6eMxQM7jm"), -1);
    }

    #[test]
    fn invalid_character() {
        assert_eq!(
            address_version("invaLidCharacter0vYm16DKXtJEp2WazB"),
            -1
        );
    }

    #[test]
    fn length_bounds() {
        assert_eq!(address_version("1"), -1);
        assert_eq!(address_version(&"1".repeat(40)), -1);
    }
}
