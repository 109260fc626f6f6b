// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Owns the single live BLE session: candidate selection, the connect/
//! handshake state machine, auto-connect suppression, and BADMAC
//! recovery. This is the one place `SessionState` and the active
//! transport handle are mutated.

use crate::error::{BridgeError, HandshakeError, Result};
use crate::external::{ConnectionObserver, PasswordPrompt};
use crate::handshake::{establish_session, provision_appkey};
use crate::io::FrameReader;
use crate::keystore::KeyStore;
use crate::operations;
use crate::preferences::PreferencesStore;
use crate::transport::BleTransport;
use crate::types::{BridgeConfig, ConnectionState, DongleIdentity, SessionState};
use std::time::{Duration, Instant};

/// Phase of the connect/handshake state machine for the attempt currently
/// in flight (or the last one, once settled into `Secure`/`Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    Connecting,
    WaitingB0,
    Handshaking,
    Secure,
    Failed,
}

pub struct Orchestrator {
    transport: Box<dyn BleTransport>,
    reader: FrameReader,
    key_store: KeyStore,
    preferences: Box<dyn PreferencesStore>,
    observer: Box<dyn ConnectionObserver>,
    config: BridgeConfig,

    state: ConnectState,
    connect_in_progress: bool,
    session: Option<SessionState>,
    conn_state: ConnectionState,
    suppress_auto_connect_until: Option<Instant>,
}

impl Orchestrator {
    pub fn new(
        transport: Box<dyn BleTransport>,
        key_store: KeyStore,
        preferences: Box<dyn PreferencesStore>,
        observer: Box<dyn ConnectionObserver>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            transport,
            reader: FrameReader::new(),
            key_store,
            preferences,
            observer,
            config,
            state: ConnectState::Idle,
            connect_in_progress: false,
            session: None,
            conn_state: ConnectionState::default(),
            suppress_auto_connect_until: None,
        }
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.conn_state
    }

    pub fn connect_state(&self) -> ConnectState {
        self.state
    }

    pub fn transport_mut(&mut self) -> &mut dyn BleTransport {
        self.transport.as_mut()
    }

    pub fn reader_mut(&mut self) -> &mut FrameReader {
        &mut self.reader
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut SessionState> {
        self.session.as_mut()
    }

    /// Disjoint mutable access to the pieces the operation layer needs.
    /// Low-level escape hatch for tests; production callers should prefer
    /// the `type_string`/`get_layout`/`set_layout`/`factory_reset`/
    /// `enable_raw_keys` wrappers below, which abandon the session on a
    /// mid-session crypto failure instead of leaving a stale one installed.
    pub fn secure_io_parts(&mut self) -> Option<(&mut SessionState, &mut dyn BleTransport, &mut FrameReader)> {
        let session = self.session.as_mut()?;
        Some((session, self.transport.as_mut(), &mut self.reader))
    }

    /// Send a string and verify the dongle's MD5 echo (`operations::
    /// send_string_with_integrity`). See [`Self::finish_secure_op`] for the
    /// session-abandonment behavior shared by every verb below.
    pub async fn type_string(&mut self, text: &str, append_newline: bool, timeout: Duration) -> Result<()> {
        let Some((session, transport, reader)) = self.secure_io_parts() else {
            return Err(BridgeError::Config("no secure session".into()));
        };
        let result = operations::send_string_with_integrity(session, transport, reader, text, append_newline, timeout).await;
        self.finish_secure_op(result)
    }

    /// Read back the active keyboard layout code.
    pub async fn get_layout(&mut self, timeout: Duration) -> Result<String> {
        let Some((session, transport, reader)) = self.secure_io_parts() else {
            return Err(BridgeError::Config("no secure session".into()));
        };
        let result = operations::get_layout(session, transport, reader, timeout).await;
        self.finish_secure_op(result)
    }

    /// Set the keyboard layout code.
    pub async fn set_layout(&mut self, layout_code: &str, timeout: Duration) -> Result<()> {
        let Some((session, transport, reader)) = self.secure_io_parts() else {
            return Err(BridgeError::Config("no secure session".into()));
        };
        let result = operations::set_layout(session, transport, reader, layout_code, timeout).await;
        self.finish_secure_op(result)
    }

    /// Factory reset the dongle.
    pub async fn factory_reset(&mut self, timeout: Duration) -> Result<()> {
        let Some((session, transport, reader)) = self.secure_io_parts() else {
            return Err(BridgeError::Config("no secure session".into()));
        };
        let result = operations::factory_reset(session, transport, reader, timeout).await;
        self.finish_secure_op(result)
    }

    /// Enable raw-fast key mode. On success, sets `fast_keys_enabled=true`
    /// on the observed [`ConnectionState`] so [`Self::send_raw_key_tap`]
    /// can gate on it.
    pub async fn enable_raw_keys(&mut self, timeout: Duration) -> Result<()> {
        let Some((session, transport, reader)) = self.secure_io_parts() else {
            return Err(BridgeError::Config("no secure session".into()));
        };
        let result = operations::enable_raw_keys(session, transport, reader, timeout).await;
        self.finish_secure_op(result)?;
        self.conn_state.fast_keys_enabled = true;
        self.observer.on_state_changed(&self.conn_state);
        Ok(())
    }

    /// Single (or repeated) HID key tap, gated on the orchestrator's own
    /// `fast_keys_enabled` flag rather than a caller-supplied one.
    pub async fn send_raw_key_tap(&mut self, modifiers: u8, usage: u8, repeat: Option<u8>) -> Result<()> {
        operations::raw_key_tap(self.transport.as_mut(), self.conn_state.fast_keys_enabled, modifiers, usage, repeat).await
    }

    /// Inspect the result of an `operations::*` call made against the live
    /// session: a mid-session `CryptoError` (MAC mismatch, sequence wrap)
    /// or an unsolicited forced-rehandshake `0xB0` both abandon the
    /// session (drop `SessionState`, clear `secure_up`/`fast_keys_enabled`,
    /// fall back to `Idle` so the next `connect` redoes the handshake). A
    /// replayed frame is not an error here at all (`operations::*` simply
    /// keeps waiting for the expected reply), so it never reaches this path.
    fn finish_secure_op<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(BridgeError::Crypto(_)) | Err(BridgeError::ForcedRehandshake)) {
            tracing::warn!("mid-session failure, abandoning secure session");
            self.session = None;
            self.set_secure_up(false);
            self.set_state(ConnectState::Idle);
        }
        result
    }

    fn set_state(&mut self, state: ConnectState) {
        self.state = state;
        tracing::debug!(?state, "orchestrator state transition");
    }

    fn set_ble_up(&mut self, up: bool) {
        self.conn_state.set_ble_up(up);
        self.observer.on_state_changed(&self.conn_state);
    }

    fn set_secure_up(&mut self, up: bool) {
        self.conn_state.secure_up = up;
        if !up {
            self.conn_state.fast_keys_enabled = false;
        }
        self.observer.on_state_changed(&self.conn_state);
    }

    /// Suppress auto-connect for `window`, used by deliberate-disconnect
    /// flows (e.g. a credential injection) that want to release the radio
    /// without an immediate reconnect race.
    pub fn suppress_auto_connect_for(&mut self, window: std::time::Duration) {
        self.suppress_auto_connect_until = Some(Instant::now() + window);
    }

    fn auto_connect_suppressed(&self) -> bool {
        self.suppress_auto_connect_until.map(|deadline| Instant::now() < deadline).unwrap_or(false)
    }

    /// Disconnect deliberately; optionally suppress auto-connect afterward.
    pub async fn disconnect(&mut self, suppress_for: Option<std::time::Duration>) -> Result<()> {
        self.transport.disconnect().await?;
        self.session = None;
        self.set_state(ConnectState::Idle);
        self.set_ble_up(false);
        if let Some(window) = suppress_for {
            self.suppress_auto_connect_for(window);
        }
        Ok(())
    }

    /// One explicit connect attempt against `address`. `allow_prompt`
    /// governs whether a missing/invalid APPKEY may trigger a password
    /// prompt and re-provisioning; startup/auto-connect entry points pass
    /// `false`.
    pub async fn connect(
        &mut self,
        address: &str,
        allow_prompt: bool,
        password_prompt: &dyn PasswordPrompt,
    ) -> Result<()> {
        if self.connect_in_progress {
            return Err(BridgeError::Busy);
        }
        self.connect_in_progress = true;
        let result = self.connect_inner(address, allow_prompt, password_prompt).await;
        self.connect_in_progress = false;
        if result.is_err() {
            self.set_state(ConnectState::Failed);
        }
        result
    }

    async fn connect_inner(
        &mut self,
        address: &str,
        allow_prompt: bool,
        password_prompt: &dyn PasswordPrompt,
    ) -> Result<()> {
        self.set_state(ConnectState::Connecting);
        let mut retries_left = self.config.max_connect_retries;
        loop {
            match self.transport.connect(address, Some(self.config.fast_connect_timeout)).await {
                Ok(()) => break,
                Err(err) if retries_left > 0 => {
                    tracing::warn!(%err, retries_left, "connect attempt failed, retrying");
                    retries_left -= 1;
                }
                Err(err) => return Err(err),
            }
        }
        self.set_ble_up(true);

        if !self.key_store.has_key(address) {
            if !allow_prompt {
                return Err(BridgeError::Config("no stored APPKEY and prompting is not allowed here".into()));
            }
            provision_appkey(self.transport.as_mut(), &mut self.reader, password_prompt, address, &self.key_store, &self.config)
                .await?;
        }

        self.set_state(ConnectState::WaitingB0);
        self.set_state(ConnectState::Handshaking);
        let appkey = self
            .key_store
            .get(address)
            .ok_or_else(|| BridgeError::Handshake(HandshakeError::MissingAppkey))?;

        match establish_session(self.transport.as_mut(), &mut self.reader, &appkey, &self.config).await {
            Ok(session) => {
                self.session = Some(session);
                self.set_state(ConnectState::Secure);
                self.set_secure_up(true);
                self.conn_state.current_target = Some(address.to_string());
                let mut prefs = self.preferences.load();
                prefs.selected_device = Some(address.to_string());
                prefs.disabled_by_error = false;
                self.preferences.save(&prefs)?;
                Ok(())
            }
            Err(BridgeError::Handshake(e)) if e.is_bad_mac() && allow_prompt => {
                tracing::warn!("BADMAC: clearing APPKEY and re-provisioning");
                self.key_store.clear(address);
                provision_appkey(self.transport.as_mut(), &mut self.reader, password_prompt, address, &self.key_store, &self.config)
                    .await?;
                let appkey = self
                    .key_store
                    .get(address)
                    .ok_or_else(|| BridgeError::Handshake(HandshakeError::MissingAppkey))?;
                self.transport.disconnect().await?;
                self.transport.await_disconnected(self.config.write_timeout).await;
                self.transport.connect(address, Some(self.config.fast_connect_timeout)).await?;
                let session = establish_session(self.transport.as_mut(), &mut self.reader, &appkey, &self.config).await?;
                self.session = Some(session);
                self.set_state(ConnectState::Secure);
                self.set_secure_up(true);
                self.conn_state.current_target = Some(address.to_string());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Rank candidates by strongest RSSI first, input order as tiebreak.
    fn rank_candidates(candidates: &[DongleIdentity], rssi: &std::collections::HashMap<String, i16>) -> Vec<DongleIdentity> {
        let mut ranked: Vec<(usize, &DongleIdentity)> = candidates.iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            let ra = rssi.get(&a.address).copied().unwrap_or(i16::MIN);
            let rb = rssi.get(&b.address).copied().unwrap_or(i16::MIN);
            rb.cmp(&ra).then_with(|| ia.cmp(ib))
        });
        ranked.into_iter().map(|(_, d)| d.clone()).collect()
    }

    /// Attempt to come up against the persisted primary, falling back to
    /// an RSSI-ranked scan over the remaining bonded-and-provisioned
    /// candidates. Never prompts for a password. Returns the address that
    /// became the new primary on success.
    pub async fn auto_connect(&mut self, bonded_candidates: &[DongleIdentity]) -> Result<String> {
        let prefs = self.preferences.load();
        if prefs.disabled_by_error {
            return Err(BridgeError::Config("auto-connect is disabled after a prior unrecoverable failure".into()));
        }
        if self.auto_connect_suppressed() {
            return Err(BridgeError::Config("auto-connect is suppressed following a deliberate disconnect".into()));
        }

        let provisioned: Vec<DongleIdentity> =
            bonded_candidates.iter().filter(|d| self.key_store.has_key(&d.address)).cloned().collect();

        let no_prompt = crate::external::NoPrompt;

        if let Some(primary) = prefs.selected_device.as_ref() {
            if provisioned.iter().any(|d| &d.address == primary) {
                match self.connect(primary, false, &no_prompt).await {
                    Ok(()) => return Ok(primary.clone()),
                    Err(err) => tracing::warn!(%err, primary, "fast-path connect to primary failed, falling back to scan"),
                }
            }
        }

        let remaining: Vec<DongleIdentity> =
            provisioned.into_iter().filter(|d| Some(&d.address) != prefs.selected_device.as_ref()).collect();
        if remaining.is_empty() {
            self.mark_disabled_by_error("no remaining candidates responded")?;
            return Err(BridgeError::Config("no candidates available for auto-connect".into()));
        }

        let addresses: Vec<String> = remaining.iter().map(|d| d.address.clone()).collect();
        let rssi = self.transport.scan_for_rssi(&addresses, self.config.rssi_scan_duration).await?;
        let ranked = Self::rank_candidates(&remaining, &rssi);

        for candidate in &ranked {
            match self.connect(&candidate.address, false, &no_prompt).await {
                Ok(()) => return Ok(candidate.address.clone()),
                Err(err) => tracing::warn!(%err, address = %candidate.address, "candidate failed, trying next"),
            }
        }

        self.mark_disabled_by_error("all ranked candidates failed to connect")?;
        Err(BridgeError::Config("auto-connect exhausted all candidates".into()))
    }

    fn mark_disabled_by_error(&mut self, message: &str) -> Result<()> {
        let mut prefs = self.preferences.load();
        prefs.disabled_by_error = true;
        self.preferences.save(&prefs)?;
        self.observer.on_message(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::TracingObserver;
    use crate::keystore::KeyStore;
    use crate::preferences::InMemoryPreferences;
    use crate::transport::mock::{MockDongle, MockTransport};
    use crate::types::AppKey;

    fn orchestrator_with(dongle: MockDongle) -> Orchestrator {
        Orchestrator::new(
            Box::new(MockTransport::new(dongle)),
            KeyStore::in_memory(),
            Box::new(InMemoryPreferences::default()),
            Box::new(TracingObserver),
            BridgeConfig::default(),
        )
    }

    #[test]
    fn rank_candidates_orders_by_rssi_desc_then_input_order() {
        let a = DongleIdentity::new("A");
        let b = DongleIdentity::new("B");
        let c = DongleIdentity::new("C");
        let mut rssi = std::collections::HashMap::new();
        rssi.insert("A".to_string(), -85);
        rssi.insert("B".to_string(), -60);

        let ranked = Orchestrator::rank_candidates(&[a, b, c], &rssi);
        assert_eq!(ranked.iter().map(|d| d.address.clone()).collect::<Vec<_>>(), vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn connect_fails_busy_when_already_in_progress() {
        let dongle = MockDongle::default();
        let mut orch = orchestrator_with(dongle);
        orch.connect_in_progress = true;
        let result = orch.connect("addr", false, &crate::external::NoPrompt).await;
        assert!(matches!(result, Err(BridgeError::Busy)));
    }

    #[tokio::test]
    async fn connect_without_stored_key_requires_prompt_permission() {
        let dongle = MockDongle::default();
        let mut orch = orchestrator_with(dongle);
        let result = orch.connect("unprovisioned-addr", false, &crate::external::NoPrompt).await;
        assert!(result.is_err());
        assert_eq!(orch.connect_state(), ConnectState::Failed);
    }

    #[tokio::test]
    async fn ble_down_clears_secure_and_fast_keys() {
        let dongle = MockDongle::default();
        let mut orch = orchestrator_with(dongle);
        orch.key_store.put("addr", &AppKey::from_bytes([1u8; 32])).unwrap();
        orch.conn_state.secure_up = true;
        orch.conn_state.fast_keys_enabled = true;
        orch.set_ble_up(false);
        assert!(!orch.conn_state.secure_up);
        assert!(!orch.conn_state.fast_keys_enabled);
    }
}
