// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error taxonomy for the secure bridge.
//!
//! Variants are grouped by kind rather than by call site; classification
//! from device-provided `0xFF` payloads collapses into [`ProvisioningError`]
//! and [`HandshakeError`]. User-visible text is produced by `Display`, and
//! never echoes raw device bytes except via the `other` fallback arm.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("security error: {0}")]
    Security(String),

    #[error("busy: a connect attempt is already in progress")]
    Busy,

    #[error("dongle sent an unsolicited server hello; session must be re-established")]
    ForcedRehandshake,
}

/// Classification of a device `0xFF` reply seen during APPKEY provisioning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("device requires a factory reset before re-provisioning")]
    LockedSingleNeedReset,
    #[error("APPKEY is already set on this device")]
    AlreadySet,
    #[error("device has no KDF parameters configured")]
    KdfMissing,
    #[error("device refused to hand out the APPKEY")]
    GetAppkeyBlocked,
    #[error("incorrect password")]
    BadProof,
    #[error("device HMAC verification failed")]
    HmacFail,
    #[error("no pending challenge on the device")]
    NoPendingChallenge,
    #[error("failed to send proof to device")]
    SendFail,
    #[error("device error: {0}")]
    Other(String),
}

impl ProvisioningError {
    /// Classify a UTF-8 reason string from an `0xFF` reply during the
    /// A-phase (provisioning) exchange.
    pub fn classify(reason: &str) -> Self {
        match reason {
            "LOCKED_SINGLE_NEED_RESET" => Self::LockedSingleNeedReset,
            "already set" => Self::AlreadySet,
            "KDF missing" => Self::KdfMissing,
            "GET_APPKEY blocked" => Self::GetAppkeyBlocked,
            "bad proof" => Self::BadProof,
            "HMAC fail" => Self::HmacFail,
            "no pending chal" => Self::NoPendingChallenge,
            "send fail" => Self::SendFail,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Classification of a device `0xFF` reply seen during MTLS session
/// establishment (B-phase).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no B0 (server hello) received within the handshake window")]
    NoB0,
    #[error("device rejected our client MAC (BADMAC): APPKEY likely invalid")]
    BadMac,
    #[error("device failed to derive the session key")]
    Derive,
    #[error("server finish (B2) MAC did not match")]
    SfinMismatch,
    #[error("no APPKEY stored for this device")]
    MissingAppkey,
    #[error("device error: {0}")]
    Other(String),
}

impl HandshakeError {
    pub fn classify(reason: &str) -> Self {
        match reason {
            "BADMAC" => Self::BadMac,
            "DERIVE" => Self::Derive,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this failure should trigger APPKEY wipe + re-provisioning.
    pub fn is_bad_mac(&self) -> bool {
        matches!(self, Self::BadMac)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("MAC verification failed on secure envelope")]
    MacMismatch,
    #[error("decrypted frame had an inconsistent length")]
    DecryptSizeMismatch,
    #[error("replayed or reordered sequence number")]
    SequenceReplay,
    #[error("session sequence counter would wrap")]
    SequenceWrap,
}
