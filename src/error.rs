//! Error types shared across the crate.
//!
//! | Type | Raised by |
//! |---|---|
//! | [`DecodeError`] | [`crate::protocol::decode`] on a malformed inbound frame |
//! | [`TransportError`] | [`crate::transport::Transport`] implementations |
//! | [`Error`] | the session state machine and the device manager |
//! | [`StoreError`] | [`crate::profile::ProfileStore`] implementations |

use thiserror::Error;

use crate::transport::DeviceId;
use crate::types::ConnectionState;

/// A single frame could not be decoded.
///
/// Neither variant is fatal for the session: the framing layer in
/// [`crate::parse::FrameAccumulator`] either waits for more bytes
/// (`Truncated`) or drops the offending tag byte (`UnknownTag`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The leading byte does not name any known message.
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    /// Fewer bytes are present than the tag (plus its payload) needs.
    /// An empty cursor reports `needed: 1`.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Failure reported by the BLE link layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No adapter, adapter powered off, or BLE not supported on this host.
    #[error("Bluetooth LE unavailable: {0}")]
    Unavailable(String),
    /// `connect` was called with an id the transport has not discovered.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("write failed: {0}")]
    Write(String),
    /// The background transport task has gone away.
    #[error("transport task closed")]
    Closed,
}

/// Errors returned by the session state machine and the device manager.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The operation is not valid in the current connection state.
    /// `state` is `None` when there is no session at all.
    #[error("{operation} is not valid in state {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: Option<ConnectionState>,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The manager task has shut down and can no longer take commands.
    #[error("device manager stopped")]
    ManagerStopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure loading or saving profiles.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
