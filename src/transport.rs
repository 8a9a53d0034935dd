//! The seam between the protocol core and a concrete BLE stack.
//!
//! A [`Transport`] takes fire-and-forget commands and reports everything that
//! happens on the link as [`TransportEvent`]s over a tokio channel handed out
//! by the implementation's constructor. Implementations in this crate:
//!
//! * [`crate::ble::BleTransport`]: btleplug (feature `ble`)
//! * [`crate::sim::SimulatedTransport`]: an in-process fake sensor

use std::fmt;

use crate::error::TransportError;

/// Platform BLE identifier of a peripheral.
///
/// * macOS / Windows: a UUID string
/// * Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Everything the link layer can report.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A matching peripheral was seen (or seen again with a new RSSI).
    Discovered {
        id: DeviceId,
        name: String,
        rssi: Option<i16>,
    },
    /// The link is up and the receive characteristic is subscribed.
    Connected(DeviceId),
    /// A `connect` request failed; no link exists.
    ConnectFailed(TransportError),
    /// The link dropped or was closed.
    Disconnected,
    /// One notification's worth of bytes. Not pre-framed.
    DataReceived(Vec<u8>),
    /// No adapter, or the adapter is powered off / unsupported.
    BleUnavailable(String),
}

/// Commands accepted by a BLE link.
///
/// Every method returns immediately; results arrive later as
/// [`TransportEvent`]s. An `Err` only means the command could not even be
/// queued.
pub trait Transport: Send + 'static {
    fn start_scan(&mut self) -> Result<(), TransportError>;
    fn stop_scan(&mut self) -> Result<(), TransportError>;
    fn connect(&mut self, id: &DeviceId) -> Result<(), TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
    /// Write one encoded message to the device's send characteristic.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}
