// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! `btleplug`-backed [`BleTransport`], generalizing the scan/connect/
//! discover/write flow of a single-adapter host binary into the trait
//! contract `bridge-core` depends on. One adapter, one live peripheral at
//! a time, matching the "single-owner GATT session" rule the trait
//! documents.

use bridge_core::error::{BridgeError, Result};
use bridge_core::transport::{BleTransport, WriteType};
use bridge_core::types::DongleIdentity;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const NUS_UUID: Uuid = Uuid::from_u128(consts::NUS_UUID);
const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(consts::WRITE_CHARACTERISTIC_UUID);
const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(consts::NOTIFY_CHARACTERISTIC_UUID);

fn bt_err(err: impl std::fmt::Display) -> BridgeError {
    BridgeError::Transport(err.to_string())
}

pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    write_characteristic: Option<Characteristic>,
    notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
    notify_task: Option<tokio::task::JoinHandle<()>>,
    ble_up: bool,
}

impl BtleplugTransport {
    /// Pick the adapter whose info contains `adapter_hint` (e.g. `"hci0"`),
    /// or the first available adapter if no hint matches.
    pub async fn new(adapter_hint: Option<&str>) -> Result<Self> {
        let manager = Manager::new().await.map_err(bt_err)?;
        let adapters = manager.adapters().await.map_err(bt_err)?;
        if adapters.is_empty() {
            return Err(BridgeError::Transport("no Bluetooth adapters found".into()));
        }

        let mut chosen = None;
        if let Some(hint) = adapter_hint {
            for adapter in &adapters {
                if let Ok(info) = adapter.adapter_info().await {
                    if info.contains(hint) {
                        chosen = Some(adapter.clone());
                        break;
                    }
                }
            }
        }
        let adapter = chosen.unwrap_or_else(|| adapters[0].clone());

        Ok(Self { adapter, peripheral: None, write_characteristic: None, notify_rx: None, notify_task: None, ble_up: false })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await.map_err(bt_err)? {
            if peripheral.address().to_string() == address {
                return Ok(peripheral);
            }
        }
        Err(BridgeError::Transport(format!("no peripheral discovered with address {address}")))
    }
}

#[async_trait::async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&mut self) -> Result<mpsc::Receiver<DongleIdentity>> {
        self.adapter.start_scan(ScanFilter { services: vec![NUS_UUID] }).await.map_err(bt_err)?;

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        let mut events = adapter.events().await.map_err(bt_err)?;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (id, rssi) = match event {
                    CentralEvent::DeviceDiscovered(id) => (id, None),
                    CentralEvent::DeviceUpdated(id) => (id, None),
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else { continue };
                let Ok(Some(props)) = peripheral.properties().await else { continue };
                let name = props.local_name.unwrap_or_default();
                if !name.contains(consts::SHORT_NAME) {
                    continue;
                }
                let identity = DongleIdentity {
                    address: peripheral.address().to_string(),
                    name: Some(name),
                    bonded: false,
                    last_seen_rssi: rssi.or(props.rssi),
                };
                if tx.send(identity).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(bt_err)
    }

    async fn scan_for_rssi(&mut self, targets: &[String], duration: Duration) -> Result<HashMap<String, i16>> {
        self.adapter.start_scan(ScanFilter { services: vec![NUS_UUID] }).await.map_err(bt_err)?;
        tokio::time::sleep(duration).await;
        self.adapter.stop_scan().await.map_err(bt_err)?;

        let mut out = HashMap::new();
        for peripheral in self.adapter.peripherals().await.map_err(bt_err)? {
            let address = peripheral.address().to_string();
            if !targets.iter().any(|t| t == &address) {
                continue;
            }
            if let Ok(Some(props)) = peripheral.properties().await {
                if let Some(rssi) = props.rssi {
                    out.insert(address, rssi);
                }
            }
        }
        Ok(out)
    }

    async fn connect(&mut self, address: &str, connect_timeout: Option<Duration>) -> Result<()> {
        if self.peripheral.is_some() {
            self.disconnect().await?;
            self.await_disconnected(connect_timeout.unwrap_or(Duration::from_secs(5))).await;
        }

        let peripheral = self.find_peripheral(address).await?;
        let connect_fut = peripheral.connect();
        match connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect_fut)
                .await
                .map_err(|_| BridgeError::Timeout("BLE connect"))?
                .map_err(bt_err)?,
            None => connect_fut.await.map_err(bt_err)?,
        }

        peripheral.discover_services().await.map_err(bt_err)?;
        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == WRITE_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or_else(|| BridgeError::Transport("dongle did not expose the write characteristic".into()))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == NOTIFY_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or_else(|| BridgeError::Transport("dongle did not expose the notify characteristic".into()))?;

        peripheral.subscribe(&notify_char).await.map_err(bt_err)?;
        let mut notifications = peripheral.notifications().await.map_err(bt_err)?;
        let (tx, rx) = mpsc::channel(32);
        let notify_uuid = notify_char.uuid;
        let notify_task = tokio::spawn(async move {
            while let Some(event) = notifications.next().await {
                if event.uuid != notify_uuid {
                    continue;
                }
                if tx.send(event.value).await.is_err() {
                    break;
                }
            }
        });

        self.peripheral = Some(peripheral);
        self.write_characteristic = Some(write_char);
        self.notify_rx = Some(rx);
        self.notify_task = Some(notify_task);
        self.ble_up = true;
        Ok(())
    }

    async fn write(&mut self, payload: &[u8], write_type: WriteType) -> Result<()> {
        let peripheral = self.peripheral.as_ref().ok_or_else(|| BridgeError::Transport("not connected".into()))?;
        let characteristic =
            self.write_characteristic.as_ref().ok_or_else(|| BridgeError::Transport("not connected".into()))?;
        let bt_write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };
        peripheral.write(characteristic, payload, bt_write_type).await.map_err(bt_err)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.notify_rx = None;
        self.write_characteristic = None;
        self.ble_up = false;
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await.map_err(bt_err)?;
        }
        Ok(())
    }

    async fn await_disconnected(&mut self, timeout: Duration) -> bool {
        let Some(peripheral) = self.peripheral.clone() else { return true };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match peripheral.is_connected().await {
                Ok(false) | Err(_) => return true,
                Ok(true) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn await_next_notification(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let rx = self.notify_rx.as_mut()?;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    async fn pair(&mut self, _address: &str) -> Result<()> {
        // btleplug does not expose OS-level bonding on every backend; a
        // discovered+connected peripheral is treated as already paired.
        Ok(())
    }

    async fn await_bonded(&mut self, _address: &str, _timeout: Duration) -> bool {
        true
    }

    fn ble_up(&self) -> bool {
        self.ble_up
    }
}
