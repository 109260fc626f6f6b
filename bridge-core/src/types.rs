// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Core data model shared across the crate.

use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A dongle as seen by scanning, independent of any one component's
/// ownership: updated on rescan/bond events, never exclusively owned.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DongleIdentity {
    /// Opaque transport address (e.g. a BLE MAC or platform-assigned id).
    pub address: String,
    pub name: Option<String>,
    pub bonded: bool,
    pub last_seen_rssi: Option<i16>,
}

impl DongleIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), name: None, bonded: false, last_seen_rssi: None }
    }
}

/// Long-term per-dongle shared secret. Plaintext only exists transiently
/// during handshake/provisioning; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AppKey(pub [u8; consts::APPKEY_SIZE]);

impl AppKey {
    pub fn from_bytes(bytes: [u8; consts::APPKEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; consts::APPKEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for AppKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AppKey(..)")
    }
}

/// Derived per-MTLS-session subkeys. Zeroized on drop; never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub k_enc: [u8; 32],
    pub k_mac: [u8; 32],
    pub k_iv: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Live secure-session state. `seq_out`/`seq_in` are monotonic; the session
/// is abandoned before either would wrap past `0xFFFF`.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub sid: u32,
    pub seq_out: u16,
    pub seq_in: u16,
    pub keys: SessionKeys,
}

impl SessionState {
    pub const MAX_SEQ: u16 = 0xFFFF;

    pub fn new(sid: u32, keys: SessionKeys) -> Self {
        Self { sid, seq_out: 0, seq_in: 0, keys }
    }
}

/// UI-observable connection status. Secure-up implies BLE-up; BLE-down
/// forces secure-down and clears `fast_keys_enabled`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub ble_up: bool,
    pub secure_up: bool,
    pub current_target: Option<String>,
    pub fast_keys_enabled: bool,
}

impl ConnectionState {
    /// Apply the "BLE-down implies secure-down" invariant in one place so
    /// callers can't forget it.
    pub fn set_ble_up(&mut self, up: bool) {
        self.ble_up = up;
        if !up {
            self.secure_up = false;
            self.fast_keys_enabled = false;
        }
    }
}

/// User-tunable behavior, owned by a preferences store; read by the
/// orchestrator, written by the embedding UI and by the orchestrator's
/// auto-disable path.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Preferences {
    pub selected_device: Option<String>,
    pub use_external: bool,
    pub disabled_by_error: bool,
    pub layout_code: Option<String>,
    pub volume_key_mappings: std::collections::BTreeMap<String, String>,
    pub share_input: bool,
}

/// Tunable timeouts and retry policy for the connection lifecycle.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub fast_connect_timeout: Duration,
    pub rssi_scan_duration: Duration,
    pub b0_wait_timeout: Duration,
    pub write_timeout: Duration,
    pub type_string_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_connect_retries: u32,
    pub auto_connect_suppress_window: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fast_connect_timeout: consts::timing::FAST_CONNECT_TIMEOUT,
            rssi_scan_duration: consts::timing::RSSI_SCAN_DURATION,
            b0_wait_timeout: consts::timing::B0_WAIT_TIMEOUT,
            write_timeout: consts::timing::WRITE_TIMEOUT,
            type_string_timeout: consts::timing::TYPE_STRING_TIMEOUT,
            ack_timeout: consts::timing::ACK_TIMEOUT,
            max_connect_retries: 2,
            auto_connect_suppress_window: Duration::from_secs(5),
        }
    }
}
