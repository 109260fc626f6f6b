// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared cryptographic primitives.
//!
//! Everything here is a thin, named wrapper around RustCrypto crates so the
//! handshake and secure-channel modules read as the protocol description
//! rather than as crypto-library plumbing.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = ctr::Ctr64BE<Aes128>;

/// HMAC-SHA256, returning the full 32-byte tag.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA256 truncated to `N` bytes, used everywhere the protocol wants a
/// 16-byte MAC tag.
pub fn hmac_sha256_truncated<const N: usize>(key: &[u8], msg: &[u8]) -> [u8; N] {
    let full = hmac_sha256(key, msg);
    let mut out = [0u8; N];
    out.copy_from_slice(&full[..N]);
    out
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// PBKDF2-HMAC-SHA256, `dklen` output bytes.
pub fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32, dklen: usize) -> Vec<u8> {
    let mut out = vec![0u8; dklen];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// HKDF-SHA256 with the given salt, ikm, and context info, producing
/// exactly 32 bytes (the session key length this protocol always wants).
pub fn hkdf_sha256_32(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).expect("32 bytes is within HKDF-SHA256's output limit");
    out
}

/// AES-128-CTR encrypt/decrypt (symmetric) in place, using the first 16
/// bytes of the 32-byte key. `iv` must be exactly 16 bytes.
pub fn aes128_ctr_xor(key32: &[u8; 32], iv16: &[u8; 16], data: &mut [u8]) {
    let key: &[u8; 16] = key32[..16].try_into().expect("slice is 16 bytes");
    let mut cipher = Aes128Ctr::new(key.into(), iv16.into());
    cipher.apply_keystream(data);
}

/// MD5 digest, used only for the type-string integrity echo — never for
/// anything security-sensitive.
pub fn md5(data: &[u8]) -> [u8; 16] {
    use md5::Digest as _;
    let mut hasher = md5::Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// An ephemeral P-256 key pair for the MTLS exchange.
pub struct EphemeralKeyPair {
    secret: p256::ecdh::EphemeralSecret,
    public_uncompressed: [u8; 65],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let secret = p256::ecdh::EphemeralSecret::random(&mut rand_core::OsRng);
        let public = secret.public_key().to_encoded_point(false);
        let mut public_uncompressed = [0u8; 65];
        public_uncompressed.copy_from_slice(public.as_bytes());
        Self { secret, public_uncompressed }
    }

    /// Uncompressed SEC1 public key, 65 bytes (`0x04 || X(32) || Y(32)`).
    pub fn public_bytes(&self) -> [u8; 65] {
        self.public_uncompressed
    }

    /// Compute the raw ECDH shared secret (the x-coordinate) against a
    /// peer's uncompressed 65-byte public key.
    pub fn diffie_hellman(&self, peer_public_65: &[u8; 65]) -> crate::error::Result<[u8; 32]> {
        let peer_public = p256::PublicKey::from_sec1_bytes(peer_public_65)
            .map_err(|_| crate::error::BridgeError::Protocol("invalid peer public key encoding".into()))?;
        let shared = self.secret.diffie_hellman(&peer_public);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_truncation_matches_prefix_of_full_tag() {
        let full = hmac_sha256(b"key", b"msg");
        let trunc: [u8; 16] = hmac_sha256_truncated(b"key", b"msg");
        assert_eq!(&full[..16], &trunc);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let shared_a = a.diffie_hellman(&b.public_bytes()).unwrap();
        let shared_b = b.diffie_hellman(&a.public_bytes()).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn aes_ctr_round_trips() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let mut data = b"type a string please".to_vec();
        let original = data.clone();
        aes128_ctr_xor(&key, &iv, &mut data);
        assert_ne!(data, original);
        aes128_ctr_xor(&key, &iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn pbkdf2_is_deterministic() {
        let a = pbkdf2_hmac_sha256(b"pw", b"salt", 1000, 32);
        let b = pbkdf2_hmac_sha256(b"pw", b"salt", 1000, 32);
        assert_eq!(a, b);
        let c = pbkdf2_hmac_sha256(b"different", b"salt", 1000, 32);
        assert_ne!(a, c);
    }
}
