// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Secure host bridge to the keyboard dongle.
//!
//! Owns one BLE session at a time, runs the MTLS handshake and APPKEY
//! provisioning, and layers a replay-protected encrypted frame protocol
//! for the operations a UI needs: type string with integrity check,
//! get/set layout, factory reset, enable raw-key mode, and raw key taps.
//!
//! `bridge-core` has no dependency on any concrete BLE stack — it talks
//! only to the [`transport::BleTransport`] trait. A `btleplug`-backed
//! implementation lives in the separate `bridge-cli` crate.

pub mod crypto;
pub mod error;
pub mod external;
pub mod framer;
pub mod handshake;
pub mod io;
pub mod keystore;
pub mod operations;
pub mod orchestrator;
pub mod preferences;
pub mod secure_channel;
pub mod transport;
pub mod types;
pub mod wire;

pub use error::{BridgeError, Result};
pub use orchestrator::{ConnectState, Orchestrator};
pub use types::{AppKey, BridgeConfig, ConnectionState, DongleIdentity, Preferences, SessionKeys, SessionState};
