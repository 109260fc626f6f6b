// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! BLE transport contract.
//!
//! `bridge-core` depends only on the [`BleTransport`] trait; the concrete
//! `btleplug`-backed implementation lives in `bridge-cli` (see
//! `bridge-cli/src/btleplug_transport.rs`, generalized from
//! `host-ble/src/main.rs`). This keeps the crate that owns the protocol
//! state machine free of any particular BLE stack: the transport never
//! calls back into session logic, it only emits notifications the
//! orchestrator pulls from a channel.

use crate::error::Result;
use crate::types::DongleIdentity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Single-owner GATT session contract. One active connection at a time.
#[async_trait]
pub trait BleTransport: Send {
    /// Start scanning, returning a channel of discovered/updated dongles.
    /// Pauses regular scanning first if a scan is already active.
    async fn start_scan(&mut self) -> Result<mpsc::Receiver<DongleIdentity>>;
    async fn stop_scan(&mut self) -> Result<()>;

    /// Scan for a bounded duration, returning the best RSSI seen per
    /// target address.
    async fn scan_for_rssi(&mut self, targets: &[String], duration: Duration) -> Result<HashMap<String, i16>>;

    /// Connect to `address`, completing only once services are discovered
    /// and the notification descriptor (CCCD) has been enabled. A connect
    /// to a new address while already connected elsewhere first
    /// disconnects and awaits disconnection.
    async fn connect(&mut self, address: &str, connect_timeout: Option<Duration>) -> Result<()>;

    async fn write(&mut self, payload: &[u8], write_type: WriteType) -> Result<()>;

    /// Marks `intentionalDisconnect` and tears down GATT.
    async fn disconnect(&mut self) -> Result<()>;
    async fn await_disconnected(&mut self, timeout: Duration) -> bool;

    /// Await a single raw notification chunk, or `None` on timeout.
    /// There is exactly one logical consumer (the orchestrator's own read
    /// loop); this method and a continuous drain both pull from the same
    /// underlying queue, so buffered notifications are never duplicated.
    async fn await_next_notification(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    async fn pair(&mut self, address: &str) -> Result<()>;
    async fn await_bonded(&mut self, address: &str, timeout: Duration) -> bool;

    fn ble_up(&self) -> bool;
}

/// In-memory mock transport driven by test code, standing in for the real
/// `btleplug` stack. Lives outside `#[cfg(test)]` so `bridge-core/tests/`
/// integration tests can use it too.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Shared handle a test uses to script device-side behavior: push raw
    /// notification bytes, inspect writes, or flip connectivity.
    #[derive(Clone, Default)]
    pub struct MockDongle {
        inner: Arc<Mutex<MockDongleState>>,
    }

    #[derive(Default)]
    struct MockDongleState {
        pending_notifications: VecDeque<Vec<u8>>,
        writes: Vec<Vec<u8>>,
        ble_up: bool,
        rssi: HashMap<String, i16>,
    }

    impl MockDongle {
        pub fn push_notification(&self, bytes: Vec<u8>) {
            self.inner.lock().unwrap().pending_notifications.push_back(bytes);
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.inner.lock().unwrap().writes.clone()
        }

        pub fn set_rssi(&self, address: &str, rssi: i16) {
            self.inner.lock().unwrap().rssi.insert(address.to_string(), rssi);
        }
    }

    pub struct MockTransport {
        dongle: MockDongle,
        /// Additional dongles keyed by address, for scenarios that need a
        /// single transport to stand in for scanning/connecting across
        /// several candidates. `connect` switches the active dongle to
        /// whichever entry matches; addresses absent from the registry
        /// keep using the transport's default dongle.
        registry: HashMap<String, MockDongle>,
        connected_address: Option<String>,
    }

    impl MockTransport {
        pub fn new(dongle: MockDongle) -> Self {
            Self { dongle, registry: HashMap::new(), connected_address: None }
        }

        pub fn with_candidates(default: MockDongle, registry: HashMap<String, MockDongle>) -> Self {
            Self { dongle: default, registry, connected_address: None }
        }

        fn dongle_for(&self, address: &str) -> MockDongle {
            self.registry.get(address).cloned().unwrap_or_else(|| self.dongle.clone())
        }
    }

    #[async_trait]
    impl BleTransport for MockTransport {
        async fn start_scan(&mut self) -> Result<mpsc::Receiver<DongleIdentity>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn stop_scan(&mut self) -> Result<()> {
            Ok(())
        }

        async fn scan_for_rssi(&mut self, targets: &[String], _duration: Duration) -> Result<HashMap<String, i16>> {
            let mut out = HashMap::new();
            for target in targets {
                let dongle = self.dongle_for(target);
                let state = dongle.inner.lock().unwrap();
                if let Some(rssi) = state.rssi.get(target) {
                    out.insert(target.clone(), *rssi);
                }
            }
            Ok(out)
        }

        async fn connect(&mut self, address: &str, _connect_timeout: Option<Duration>) -> Result<()> {
            self.dongle = self.dongle_for(address);
            self.connected_address = Some(address.to_string());
            self.dongle.inner.lock().unwrap().ble_up = true;
            Ok(())
        }

        async fn write(&mut self, payload: &[u8], _write_type: WriteType) -> Result<()> {
            self.dongle.inner.lock().unwrap().writes.push(payload.to_vec());
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected_address = None;
            self.dongle.inner.lock().unwrap().ble_up = false;
            Ok(())
        }

        async fn await_disconnected(&mut self, _timeout: Duration) -> bool {
            self.connected_address.is_none()
        }

        async fn await_next_notification(&mut self, timeout: Duration) -> Option<Vec<u8>> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(bytes) = self.dongle.inner.lock().unwrap().pending_notifications.pop_front() {
                    return Some(bytes);
                }
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn pair(&mut self, _address: &str) -> Result<()> {
            Ok(())
        }

        async fn await_bonded(&mut self, _address: &str, _timeout: Duration) -> bool {
            true
        }

        fn ble_up(&self) -> bool {
            self.dongle.inner.lock().unwrap().ble_up
        }
    }
}
