// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persists, retrieves, and wipes per-dongle APPKEYs under an
//! OS-provided hardware key.
//!
//! The hardware key itself is modelled as the [`HardwareKey`] trait: a
//! key that lives in secure hardware and is used only to wrap/unwrap
//! opaque ciphertext, never to sign or export. [`AesGcmHardwareKey`] is
//! the weakened fallback for when a non-exportable platform key isn't
//! available.

use crate::error::{BridgeError, Result};
use crate::types::AppKey;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand_core::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// A non-exportable (or, in the fallback case, user-authenticated)
/// asymmetric/symmetric wrapping key held by the platform.
pub trait HardwareKey: Send + Sync {
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Returns `None` on any decode/decrypt mismatch; never raises.
    fn unwrap(&self, ciphertext: &[u8]) -> Option<Vec<u8>>;
}

/// AES-256-GCM stand-in for a platform hardware key. A real port should
/// back this with e.g. Android Keystore / Secure Enclave; this
/// implementation is the documented weakening: the wrapping key itself is
/// held in process memory rather than non-exportable hardware.
pub struct AesGcmHardwareKey {
    cipher: Aes256Gcm,
}

impl AesGcmHardwareKey {
    pub fn new(key32: [u8; 32]) -> Self {
        Self { cipher: Aes256Gcm::new_from_slice(&key32).expect("32-byte key") }
    }

    /// Generate a fresh random wrapping key (first-use bootstrap).
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand_core::OsRng.fill_bytes(&mut key);
        Self::new(key)
    }
}

impl HardwareKey for AesGcmHardwareKey {
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; 12];
        rand_core::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| BridgeError::Config(format!("hardware key wrap failed: {e}")))?;
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unwrap(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() < 12 {
            return None;
        }
        let (nonce_bytes, body) = ciphertext.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher.decrypt(nonce, body).ok()
    }
}

/// Derive the stable slot id for a device: `SHA-256(lowercase(trim(deviceId)))[0..16]`.
pub fn slot_id(device_id: &str) -> [u8; 16] {
    let normalized = device_id.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

fn slot_id_hex(device_id: &str) -> String {
    hex::encode(slot_id(device_id))
}

/// Persistence contract for ciphertext storage, separated from the
/// encryption logic so tests can use an in-memory map and a real
/// application can back it with a file or OS keychain.
pub trait CiphertextStore: Send + Sync {
    fn load(&self, slot_hex: &str) -> Option<Vec<u8>>;
    fn save(&self, slot_hex: &str, ciphertext_b64: &str);
    fn remove(&self, slot_hex: &str);
}

/// In-memory ciphertext store, suitable for tests and as the default when
/// no persistence backend is wired in.
#[derive(Default)]
pub struct InMemoryCiphertextStore {
    entries: Mutex<HashMap<String, String>>,
}

impl CiphertextStore for InMemoryCiphertextStore {
    fn load(&self, slot_hex: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().expect("lock not poisoned");
        let b64 = entries.get(slot_hex)?;
        base64::engine::general_purpose::STANDARD.decode(b64).ok()
    }

    fn save(&self, slot_hex: &str, ciphertext_b64: &str) {
        let mut entries = self.entries.lock().expect("lock not poisoned");
        entries.insert(slot_hex.to_string(), ciphertext_b64.to_string());
    }

    fn remove(&self, slot_hex: &str) {
        let mut entries = self.entries.lock().expect("lock not poisoned");
        entries.remove(slot_hex);
    }
}

/// `put`/`get`/`clear` keyed by device id, backed by a hardware-wrapping
/// key and a ciphertext persistence layer. On first `put` for a slot a
/// hardware key pair is implicitly "ensured" by virtue of `HardwareKey`
/// already existing for the process; `clear` only removes ciphertext, so
/// re-provisioning stays fast.
pub struct KeyStore {
    hardware_key: Box<dyn HardwareKey>,
    store: Box<dyn CiphertextStore>,
}

impl KeyStore {
    pub fn new(hardware_key: Box<dyn HardwareKey>, store: Box<dyn CiphertextStore>) -> Self {
        Self { hardware_key, store }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(AesGcmHardwareKey::generate()), Box::new(InMemoryCiphertextStore::default()))
    }

    /// Encrypt and persist `key32` for `device_id`. Encryption failures
    /// propagate: the caller must refuse to proceed without a stored key.
    pub fn put(&self, device_id: &str, key: &AppKey) -> Result<()> {
        let ciphertext = self.hardware_key.wrap(key.as_bytes())?;
        let b64 = base64::engine::general_purpose::STANDARD.encode(ciphertext);
        self.store.save(&slot_id_hex(device_id), &b64);
        Ok(())
    }

    /// Decryption/decode/size-mismatch failures are silently treated as
    /// "no key"; never raises.
    pub fn get(&self, device_id: &str) -> Option<AppKey> {
        let ciphertext = self.store.load(&slot_id_hex(device_id))?;
        let plaintext = self.hardware_key.unwrap(&ciphertext)?;
        let bytes: [u8; consts::APPKEY_SIZE] = plaintext.try_into().ok()?;
        Some(AppKey::from_bytes(bytes))
    }

    pub fn clear(&self, device_id: &str) {
        self.store.remove(&slot_id_hex(device_id));
    }

    pub fn has_key(&self, device_id: &str) -> bool {
        self.store.load(&slot_id_hex(device_id)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = KeyStore::in_memory();
        let key = AppKey::from_bytes([42u8; 32]);
        store.put("AA:BB:CC:DD:EE:FF", &key).unwrap();
        let got = store.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(got.as_bytes(), key.as_bytes());
    }

    #[test]
    fn slot_id_normalizes_case_and_whitespace() {
        assert_eq!(slot_id(" AA:BB "), slot_id("aa:bb"));
    }

    #[test]
    fn get_on_unknown_device_is_none_not_error() {
        let store = KeyStore::in_memory();
        assert!(store.get("never-provisioned").is_none());
    }

    #[test]
    fn clear_removes_ciphertext_but_keeps_working() {
        let store = KeyStore::in_memory();
        let key = AppKey::from_bytes([7u8; 32]);
        store.put("dev", &key).unwrap();
        assert!(store.has_key("dev"));
        store.clear("dev");
        assert!(!store.has_key("dev"));
        // Re-provisioning the same device still works.
        store.put("dev", &key).unwrap();
        assert!(store.has_key("dev"));
    }

    #[test]
    fn corrupted_ciphertext_decodes_to_none_never_panics() {
        struct AlwaysCorrupt;
        impl CiphertextStore for AlwaysCorrupt {
            fn load(&self, _slot_hex: &str) -> Option<Vec<u8>> {
                Some(vec![1, 2, 3])
            }
            fn save(&self, _slot_hex: &str, _ciphertext_b64: &str) {}
            fn remove(&self, _slot_hex: &str) {}
        }
        let store = KeyStore::new(Box::new(AesGcmHardwareKey::generate()), Box::new(AlwaysCorrupt));
        assert!(store.get("dev").is_none());
    }
}
