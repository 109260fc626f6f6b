// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Demo binary wiring [`btleplug_transport::BtleplugTransport`] into the
//! `bridge-core` orchestrator, for manual smoke testing against real
//! hardware. Not meant as a production UI: the key store is in-memory
//! only, so every run re-provisions the APPKEY.

mod btleplug_transport;

use bridge_core::external::{PasswordPrompt, SecretBytes, TracingObserver};
use bridge_core::keystore::KeyStore;
use bridge_core::preferences::InMemoryPreferences;
use bridge_core::{BridgeConfig, Orchestrator};
use btleplug_transport::BtleplugTransport;
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::time::Duration;

#[derive(Debug, Parser)]
struct Args {
    /// Substring to match against adapter info; the first adapter is used
    /// if no match is found.
    #[arg(short, long, default_value_t = String::from("hci0"))]
    adapter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan for dongles advertising the keyboard's NUS service.
    Scan {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Connect (provisioning on first use) and leave the session up, idle.
    Connect { address: String },
    /// Connect and type a string, verifying the device's MD5 echo.
    TypeString { address: String, text: String },
    /// Read back the active keyboard layout code.
    GetLayout { address: String },
    /// Set the keyboard layout code.
    SetLayout { address: String, layout: String },
    /// Factory reset the dongle.
    FactoryReset { address: String },
}

/// Reads a password from stdin. Not hardened against terminal echo; this
/// is a development tool, not the production credential surface.
struct StdinPrompt;

#[async_trait::async_trait]
impl PasswordPrompt for StdinPrompt {
    async fn prompt(&self, device_address: &str) -> Option<SecretBytes> {
        print!("APPKEY password for {device_address}: ");
        std::io::stdout().flush().ok()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok()?;
        Some(SecretBytes::new(line.into_bytes()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match args.command {
        Command::Scan { seconds } => {
            let mut transport = BtleplugTransport::new(Some(&args.adapter)).await?;
            let mut discovered = transport.start_scan().await?;
            let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, discovered.recv()).await {
                    Ok(Some(dongle)) => println!("{} {:?} rssi={:?}", dongle.address, dongle.name, dongle.last_seen_rssi),
                    Ok(None) | Err(_) => break,
                }
            }
            transport.stop_scan().await?;
        }
        other => {
            let address = match &other {
                Command::Connect { address }
                | Command::TypeString { address, .. }
                | Command::GetLayout { address }
                | Command::SetLayout { address, .. }
                | Command::FactoryReset { address } => address.clone(),
                Command::Scan { .. } => unreachable!(),
            };

            let transport = BtleplugTransport::new(Some(&args.adapter)).await?;
            let mut orch = Orchestrator::new(
                Box::new(transport),
                KeyStore::in_memory(),
                Box::new(InMemoryPreferences::default()),
                Box::new(TracingObserver),
                BridgeConfig::default(),
            );

            orch.connect(&address, true, &StdinPrompt).await?;
            println!("secure session established with {address}");

            match other {
                Command::TypeString { text, .. } => {
                    orch.type_string(&text, false, Duration::from_secs(6)).await?;
                    println!("typed {text:?}, integrity check passed");
                }
                Command::GetLayout { .. } => {
                    let layout = orch.get_layout(Duration::from_secs(5)).await?;
                    println!("layout: {layout}");
                }
                Command::SetLayout { layout, .. } => {
                    orch.set_layout(&layout, Duration::from_secs(5)).await?;
                    println!("layout set to {layout}");
                }
                Command::FactoryReset { .. } => {
                    orch.factory_reset(Duration::from_secs(5)).await?;
                    println!("factory reset acknowledged");
                }
                Command::Connect { .. } => {}
                Command::Scan { .. } => unreachable!(),
            }
        }
    }

    Ok(())
}
