//! Token mint/verifier: binds a client IP to an hour-long time window via AES-128.
//!
//! A token is `E_k(time_bucket)` re-encrypted with the client IP folded in,
//! Base64-encoded and filtered down to alphanumeric characters. See
//! `gen_token_bytes` for the exact byte-for-byte construction this
//! preserves from the source implementation.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;

/// Validity window of a token, in seconds. A token for bucket `t` is also
/// accepted during bucket `t + 1`, granting a window of one to two hours.
pub const TOKEN_INTERVAL_SECS: i64 = 60 * 60;

const BLOCK_SIZE: usize = 16;

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

/// Encodes `t` as a block-size little-endian counter, encrypts it, XORs in
/// the client address (re-encrypting per chunk), Base64-encodes the block,
/// strips non-alphanumeric characters, and trims one trailing character
/// when the block size isn't a multiple of 3 (to avoid a partially-decoded
/// trailing Base64 group).
fn gen_token_bytes(client: &[u8], cipher: &Aes128, t: u64) -> String {
    let mut block = [0u8; BLOCK_SIZE];
    let mut t = t;
    for b in block.iter_mut() {
        *b = (t & 0xFF) as u8;
        t >>= 8;
    }
    let mut ga = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut ga);
    block.copy_from_slice(&ga);

    let mut rest = client;
    while !rest.is_empty() {
        let n = rest.len().min(BLOCK_SIZE);
        for i in 0..n {
            block[i] ^= rest[i];
        }
        rest = if rest.len() < BLOCK_SIZE {
            &[]
        } else {
            &rest[BLOCK_SIZE..]
        };
        let mut ga = GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut ga);
        block.copy_from_slice(&ga);
    }

    let encoded = STANDARD_NO_PAD.encode(block);
    let mut filtered: Vec<u8> = encoded.bytes().filter(|&b| is_token_char(b)).collect();
    if !filtered.is_empty() && BLOCK_SIZE % 3 != 0 {
        filtered.pop();
    }
    String::from_utf8(filtered).expect("base64 alphabet is ASCII")
}

/// Generates the current token for `client`.
pub fn gen_token(client: &[u8; 16], cipher: &Aes128, now_unix: i64) -> String {
    let bucket = (now_unix / TOKEN_INTERVAL_SECS) as u64;
    gen_token_bytes(client, cipher, bucket)
}

/// Checks whether `token` is valid for `client` in the current or previous
/// bucket. Rejects immediately if `token` contains a non-alphanumeric
/// character (no valid token ever does).
pub fn check_token(client: &[u8; 16], token: &str, cipher: &Aes128, now_unix: i64) -> bool {
    if !token.bytes().all(is_token_char) {
        return false;
    }
    let bucket = (now_unix / TOKEN_INTERVAL_SECS) as u64;
    for dt in 0..2u64 {
        let Some(t) = bucket.checked_sub(dt) else {
            continue;
        };
        let candidate = gen_token_bytes(client, cipher, t);
        if candidate == token {
            return true;
        }
    }
    false
}

/// Generates a fresh random 16-byte AES-128 key.
pub fn gen_token_key() -> [u8; 16] {
    use rand::RngCore;
    let mut key = [0u8; 16];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Builds an AES-128 cipher instance from a 16-byte key.
pub fn new_token_cipher(key: &[u8; 16]) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Aes128 {
        new_token_cipher(&[7u8; 16])
    }

    #[test]
    fn round_trip_same_bucket() {
        let cipher = test_cipher();
        let ip = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 1, 2, 3, 4];
        let now = 10 * TOKEN_INTERVAL_SECS + 100;
        let tok = gen_token(&ip, &cipher, now);
        assert!(check_token(&ip, &tok, &cipher, now));
    }

    #[test]
    fn different_ip_rejected() {
        let cipher = test_cipher();
        let ip_a = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 1, 2, 3, 4];
        let ip_b = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 1, 2, 3, 5];
        let now = 10 * TOKEN_INTERVAL_SECS;
        let tok = gen_token(&ip_a, &cipher, now);
        assert!(!check_token(&ip_b, &tok, &cipher, now));
    }

    #[test]
    fn accepted_for_current_and_previous_bucket_only() {
        let cipher = test_cipher();
        let ip = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 1, 2, 3, 4];
        let gen_at = 10 * TOKEN_INTERVAL_SECS;
        let tok = gen_token(&ip, &cipher, gen_at);
        assert!(check_token(&ip, &tok, &cipher, gen_at));
        assert!(check_token(&ip, &tok, &cipher, gen_at + TOKEN_INTERVAL_SECS));
        assert!(!check_token(
            &ip,
            &tok,
            &cipher,
            gen_at + 2 * TOKEN_INTERVAL_SECS
        ));
    }

    #[test]
    fn rejects_tokens_with_non_alphanumeric() {
        let cipher = test_cipher();
        let ip = [0u8; 16];
        assert!(!check_token(&ip, "abc+def", &cipher, 0));
        assert!(!check_token(&ip, "abc/def", &cipher, 0));
    }

    #[test]
    fn same_bucket_is_deterministic() {
        let cipher = test_cipher();
        let ip = [1u8; 16];
        let now = 42 * TOKEN_INTERVAL_SECS + 5;
        assert_eq!(
            gen_token(&ip, &cipher, now),
            gen_token(&ip, &cipher, now + 60)
        );
    }
}
