//! # eyedrops-rs
//!
//! Async Rust core for the **eyeDrops** blink sensor, an RFduino-based
//! wearable that detects eye blinks and reports them over Bluetooth Low
//! Energy. The host keeps a watchdog on the blink stream: when no blink
//! arrives within the configured interval it asks the UI to blur the screen
//! until the next blink.
//!
//! ## Architecture
//!
//! ```text
//!  Transport ──TransportEvent──▶ DeviceManager ──Notification──▶ UI
//!  (ble / sim)                   │   ├─ FrameAccumulator + decode
//!       ▲                        │   ├─ Session (state machine)
//!       └──────encode◀───────────┘   └─ BlinkMonitor (timeout)
//! ```
//!
//! [`handle::spawn`] runs the manager on a single tokio task and hands back a
//! cloneable [`handle::DeviceHandle`] plus the notification receiver.
//!
//! ## Quick start
//!
//! ```no_run
//! use eyedrops_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (transport, events) = SimulatedTransport::new(SimConfig::default());
//!     let (device, mut notes) = spawn(transport, events, ManagerConfig::default());
//!     device
//!         .set_profile(UserProfile::new(1, "me", CalibrationParameterSet::default()))
//!         .await?;
//!     device.scan().await?;
//!
//!     while let Some(note) = notes.recv().await {
//!         match note {
//!             Notification::DeviceFound(d) => device.connect(d.id).await?,
//!             Notification::BlurStart => println!("blink!"),
//!             Notification::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`protocol`] | GATT UUIDs, message tags, and the byte-level codec |
//! | [`parse`] | Reassembly of notification chunks into messages |
//! | [`session`] | Per-connection state machine |
//! | [`monitor`] | Blink timeout watchdog |
//! | [`manager`] | Facade over transport, session, and monitor |
//! | [`handle`] | Actor task and cloneable handle around the manager |
//! | [`transport`] | The [`transport::Transport`] seam and its events |
//! | `ble` | btleplug transport (feature `ble`) |
//! | [`sim`] | Simulated sensor for running without hardware |
//! | [`profile`] | Calibration profile persistence |
//! | [`types`] | States, profiles, and outward notifications |
//! | [`error`] | Error types |

#[cfg(feature = "ble")]
pub mod ble;
pub mod error;
pub mod handle;
pub mod manager;
pub mod monitor;
pub mod parse;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Manager ───────────────────────────────────────────────────────────────
    pub use crate::handle::{spawn, DeviceHandle};
    pub use crate::manager::{DeviceStatus, ManagerConfig};

    // ── Transports ────────────────────────────────────────────────────────────
    #[cfg(feature = "ble")]
    pub use crate::ble::{BleConfig, BleTransport};
    pub use crate::sim::{SimConfig, SimulatedTransport};
    pub use crate::transport::{DeviceId, Transport, TransportEvent};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::Error;
    pub use crate::profile::{JsonProfileStore, MemoryProfileStore, ProfileStore};
    pub use crate::types::{
        CalibrationParameterSet, ConnectionState, DiscoveredDevice, Notification, ParameterSlot,
        UserProfile,
    };
}
