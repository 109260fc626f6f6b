// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Protocol and BLE constants shared between `bridge-core` and `bridge-cli`.
//!
//! Kept as its own crate (rather than inlined in `bridge-core`) because the
//! dongle's advertised name, service UUIDs, and wire limits are the one
//! piece of "firmware knowledge" the host and any future alternate
//! transport both need to agree on.

/// Target MTU requested during connection setup (bytes). The dongle is
/// expected to reject and fall back to its own maximum if unsupported.
pub const TARGET_ATT_MTU: usize = 185;

/// Full device name advertised over BLE.
pub const DEVICE_NAME: &str = "Passport Prime";

/// Short device name used in limited advertising data / name filtering.
pub const SHORT_NAME: &str = "Prime";

/// UUID for the Nordic UART Service (NUS) the dongle exposes.
pub const NUS_UUID: u128 = 0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E;

/// Write (host -> dongle) characteristic, "RX" from the dongle's perspective.
pub const WRITE_CHARACTERISTIC_UUID: u128 = 0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E;

/// Notify (dongle -> host) characteristic, "TX" from the dongle's perspective.
pub const NOTIFY_CHARACTERISTIC_UUID: u128 = 0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E;

/// Size in bytes of the per-dongle long-term shared secret (APPKEY).
pub const APPKEY_SIZE: usize = 32;

/// Maximum plausible frame payload length the Framer will accept before
/// treating a header as garbage and resyncing.
pub const MAX_FRAME_LEN: usize = 1024;

/// Size of a truncated HMAC-SHA256 MAC tag used throughout the protocol.
pub const MAC_LEN: usize = 16;

pub mod timing {
    use std::time::Duration;

    /// Fast-path connect timeout used for the persisted primary dongle.
    pub const FAST_CONNECT_TIMEOUT: Duration = Duration::from_millis(3_500);
    /// Duration of an RSSI-ranking scan over remaining bonded candidates.
    pub const RSSI_SCAN_DURATION: Duration = Duration::from_millis(800);
    /// Window in which an unsolicited B0 (server hello) must arrive.
    pub const B0_WAIT_TIMEOUT: Duration = Duration::from_millis(4_000);
    /// Per-write timeout for writes-with-response.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Timeout for a type-string round trip (D0 -> D1).
    pub const TYPE_STRING_TIMEOUT: Duration = Duration::from_secs(6);
    /// Generic ack-wait timeout for C0/C1/C4/C8 operations.
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Wire op-codes. Kept as plain `u8` constants (rather than solely the
/// `OpCode` enum in `bridge-core`) so both the Framer and any external
/// tooling inspecting raw captures can reference them without depending
/// on `bridge-core`.
pub mod op {
    pub const APPKEY_REQUEST: u8 = 0xA0;
    pub const APPKEY_CHALLENGE: u8 = 0xA2;
    pub const APPKEY_PROOF: u8 = 0xA3;
    pub const APPKEY_REPLY: u8 = 0xA1;
    pub const SERVER_HELLO: u8 = 0xB0;
    pub const CLIENT_HELLO: u8 = 0xB1;
    pub const SERVER_FINISH: u8 = 0xB2;
    pub const SECURE_ENVELOPE: u8 = 0xB3;
    pub const SET_LAYOUT: u8 = 0xC0;
    pub const GET_INFO: u8 = 0xC1;
    pub const INFO_TEXT: u8 = 0xC2;
    pub const FACTORY_RESET: u8 = 0xC4;
    pub const ENABLE_RAW_KEYS: u8 = 0xC8;
    pub const TYPE_STRING: u8 = 0xD0;
    pub const TYPE_RESULT: u8 = 0xD1;
    pub const RAW_KEY_TAP: u8 = 0xE0;
    pub const ACK: u8 = 0x00;
    pub const ERROR: u8 = 0xFF;
}
