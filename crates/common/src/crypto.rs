//! Credential decryption for configuration passwords.
//!
//! Passwords may be stored AES-128-CBC encrypted and base64-encoded, with
//! the cipher key derived via PBKDF2-HMAC-SHA1 (128 iterations, 128-bit key)
//! from the configured `key` and `salt`, and an explicit `iv`. The KDF is
//! implemented over the `sha1` digest directly; no pbkdf2 crate is part of
//! the dependency set.

use aes::cipher::{
    block_padding::Pkcs7,
    BlockDecryptMut,
    KeyIvInit,
};
use anyhow::Context;
use sha1::{
    Digest,
    Sha1,
};

use crate::errors::ErrorMetadata;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128Dec>;

const PBKDF2_ITERATIONS: u32 = 128;
const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const SHA1_BLOCK_LEN: usize = 64;
const SHA1_OUT_LEN: usize = 20;

pub struct CredentialDecryptor {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl CredentialDecryptor {
    /// Derives the cipher key from `key` and `salt`; `iv` is hex-encoded
    /// (16 raw bytes are also accepted).
    pub fn new(key: &str, salt: &str, iv: &str) -> anyhow::Result<Self> {
        let mut derived = [0u8; KEY_LEN];
        pbkdf2_sha1(
            key.as_bytes(),
            salt.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut derived,
        );
        let iv_bytes = match hex::decode(iv) {
            Ok(bytes) if bytes.len() == IV_LEN => bytes,
            _ if iv.len() == IV_LEN => iv.as_bytes().to_vec(),
            _ => anyhow::bail!(ErrorMetadata::config_invalid(
                "BadIv",
                "iv must be 16 bytes, hex or raw",
            )),
        };
        let mut iv_arr = [0u8; IV_LEN];
        iv_arr.copy_from_slice(&iv_bytes);
        Ok(Self {
            key: derived,
            iv: iv_arr,
        })
    }

    pub fn decrypt(&self, encoded: &str) -> anyhow::Result<String> {
        let mut ciphertext = base64::decode(encoded.trim()).context(
            ErrorMetadata::config_invalid("BadCredential", "Credential is not valid base64"),
        )?;
        let cipher = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        let plaintext = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut ciphertext)
            .map_err(|_| {
                anyhow::anyhow!(ErrorMetadata::config_invalid(
                    "BadCredential",
                    "Credential does not decrypt with the configured key material",
                ))
            })?;
        String::from_utf8(plaintext.to_vec()).context(ErrorMetadata::config_invalid(
            "BadCredential",
            "Decrypted credential is not UTF-8",
        ))
    }
}

fn hmac_sha1(key: &[u8], message: &[u8]) -> [u8; SHA1_OUT_LEN] {
    let mut block_key = [0u8; SHA1_BLOCK_LEN];
    if key.len() > SHA1_BLOCK_LEN {
        let digest = Sha1::digest(key);
        block_key[..SHA1_OUT_LEN].copy_from_slice(&digest);
    } else {
        block_key[..key.len()].copy_from_slice(key);
    }
    let mut inner = Sha1::new();
    let ipad: Vec<u8> = block_key.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha1::new();
    let opad: Vec<u8> = block_key.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_digest);
    outer.finalize().into()
}

/// PBKDF2 (RFC 2898) with HMAC-SHA1 as the PRF. `out` must not exceed one
/// hash block; the 128-bit keys used here always fit.
fn pbkdf2_sha1(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    assert!(out.len() <= SHA1_OUT_LEN);
    let mut block_input = Vec::with_capacity(salt.len() + 4);
    block_input.extend_from_slice(salt);
    block_input.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha1(password, &block_input);
    let mut acc = u;
    for _ in 1..iterations {
        u = hmac_sha1(password, &u);
        for (a, b) in acc.iter_mut().zip(u.iter()) {
            *a ^= b;
        }
    }
    out.copy_from_slice(&acc[..out.len()]);
}
