//! Wireless transport seam.
//!
//! The toy stack talks to the physical link through the [`Transport`] trait;
//! [`BleTransport`] is the production implementation on top of `btleplug`.
//! Tests substitute their own implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Receives the raw bytes of one notification.
pub type NotifyCallback = Box<dyn FnMut(Vec<u8>) + Send + 'static>;

/// Asynchronous operations of the physical link.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn write(&mut self, characteristic: Uuid, data: &[u8], with_response: bool)
        -> Result<()>;
    async fn subscribe(&mut self, characteristic: Uuid, callback: NotifyCallback) -> Result<()>;
    async fn is_connected(&self) -> bool;
}

/// GATT identifiers of the toy protocol.
pub mod uuids {
    use uuid::Uuid;

    /// Primary API service.
    pub const API_SERVICE: Uuid = Uuid::from_u128(0x00010001_574f_4f20_5370_6865726f2121);
    /// Command/notification characteristic inside the API service.
    pub const API_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00010002_574f_4f20_5370_6865726f2121);
    /// Anti-denial-of-service characteristic; must be unlocked before the
    /// device accepts API traffic.
    pub const ANTIDOS_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0x00020005_574f_4f20_5370_6865726f2121);
}

/// Unlock phrase written to the anti-DoS characteristic after connecting.
pub const ANTIDOS_HANDSHAKE: &[u8] = b"usetheforce...band";

const SCAN_POLL: Duration = Duration::from_millis(200);

/// `btleplug`-backed transport addressing one peripheral by BLE address.
pub struct BleTransport {
    address: String,
    scan_timeout: Duration,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<Uuid, Characteristic>,
    callbacks: Arc<Mutex<HashMap<Uuid, NotifyCallback>>>,
    forwarder: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(address: impl Into<String>, scan_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            scan_timeout,
            peripheral: None,
            characteristics: HashMap::new(),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            forwarder: None,
        }
    }

    fn peripheral(&self) -> Result<&Peripheral> {
        self.peripheral
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| Error::Transport(format!("characteristic {uuid} not available")))
    }

    async fn find_peripheral(&self) -> Result<Peripheral> {
        let manager = Manager::new().await.map_err(connect_err)?;
        let adapters = manager.adapters().await.map_err(connect_err)?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::Connection("no Bluetooth adapter found".into()))?;

        central
            .start_scan(ScanFilter::default())
            .await
            .map_err(connect_err)?;
        let mut waited = Duration::ZERO;
        let found = 'scan: loop {
            for peripheral in central.peripherals().await.map_err(connect_err)? {
                if peripheral
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(&self.address)
                {
                    break 'scan Some(peripheral);
                }
            }
            if waited >= self.scan_timeout {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
            waited += SCAN_POLL;
        };
        let _ = central.stop_scan().await;

        found.ok_or_else(|| Error::Connection(format!("device {} not found", self.address)))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<()> {
        let peripheral = self.find_peripheral().await?;
        peripheral.connect().await.map_err(connect_err)?;
        peripheral.discover_services().await.map_err(connect_err)?;

        self.characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        info!(address = %self.address, "connected, {} characteristics", self.characteristics.len());

        // Unlock the API before anything else is written.
        if let Some(antidos) = self.characteristics.get(&uuids::ANTIDOS_CHARACTERISTIC) {
            peripheral
                .write(antidos, ANTIDOS_HANDSHAKE, WriteType::WithResponse)
                .await
                .map_err(connect_err)?;
        } else {
            debug!("no anti-DoS characteristic advertised, skipping handshake");
        }

        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(peripheral) = self.peripheral.take() {
            peripheral
                .disconnect()
                .await
                .map_err(|e| Error::Connection(format!("disconnect failed: {e}")))?;
        }
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let characteristic = self.characteristic(characteristic)?.clone();
        self.peripheral()?
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| Error::Transport(format!("write failed: {e}")))
    }

    async fn subscribe(&mut self, characteristic: Uuid, callback: NotifyCallback) -> Result<()> {
        let target = self.characteristic(characteristic)?.clone();
        let peripheral = self.peripheral()?.clone();
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| Error::Transport(format!("subscribe failed: {e}")))?;

        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(characteristic, callback);

        // One forwarding task serves every subscribed characteristic.
        if self.forwarder.is_none() {
            let mut stream = peripheral
                .notifications()
                .await
                .map_err(|e| Error::Transport(format!("notification stream failed: {e}")))?;
            let callbacks = Arc::clone(&self.callbacks);
            self.forwarder = Some(tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    let mut callbacks = callbacks.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(callback) = callbacks.get_mut(&notification.uuid) {
                        callback(notification.value);
                    } else {
                        warn!(uuid = %notification.uuid, "notification without subscriber");
                    }
                }
            }));
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match &self.peripheral {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }
}

fn connect_err(e: btleplug::Error) -> Error {
    Error::Connection(e.to_string())
}
