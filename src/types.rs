use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::transport::DeviceId;

/// Connection state of an active session.
///
/// A value of this type only exists while the transport is connected; the
/// manager reports `None` when there is no session at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Freshly connected, no profile on the device yet.
    BootingUp,
    /// Parameters sent, waiting for [`crate::protocol::IncomingMessage::ParametersAck`].
    SendingProfile,
    /// Blink detection running, blink monitor armed.
    Normal,
    /// The blink monitor expired; the screen should be blurred.
    Blurring,
    /// `StartCalibration` sent, no sample received yet.
    CalibrationAwaitingData,
    /// Calibration samples are streaming in.
    Calibrating,
}

impl ConnectionState {
    pub fn is_calibrating(self) -> bool {
        matches!(
            self,
            ConnectionState::CalibrationAwaitingData | ConnectionState::Calibrating
        )
    }
}

/// One of the ten calibration parameters, in wire order.
///
/// The discriminant is the slot index; the wire tag is `0x10 + index`
/// (see [`crate::protocol::parameter_tag`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterSlot {
    NegativeThreshold = 0,
    PositiveThreshold = 1,
    Hysteresis = 2,
    MinValue = 3,
    MaxValue = 4,
    MinFallTime = 5,
    MaxFallTime = 6,
    MinRiseTime = 7,
    MaxRiseTime = 8,
    /// Allowed zero-sample count, bounding the total blink duration.
    AllowedZeros = 9,
}

impl ParameterSlot {
    /// Every slot in the fixed order the device expects them.
    pub const ALL: [ParameterSlot; PARAMETER_COUNT] = [
        ParameterSlot::NegativeThreshold,
        ParameterSlot::PositiveThreshold,
        ParameterSlot::Hysteresis,
        ParameterSlot::MinValue,
        ParameterSlot::MaxValue,
        ParameterSlot::MinFallTime,
        ParameterSlot::MaxFallTime,
        ParameterSlot::MinRiseTime,
        ParameterSlot::MaxRiseTime,
        ParameterSlot::AllowedZeros,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Number of calibration parameters in a profile.
pub const PARAMETER_COUNT: usize = 10;

/// The ten calibration parameters of a profile, in wire/storage order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationParameterSet {
    values: [f32; PARAMETER_COUNT],
}

impl CalibrationParameterSet {
    pub fn new(values: [f32; PARAMETER_COUNT]) -> Self {
        Self { values }
    }

    pub fn get(&self, slot: ParameterSlot) -> f32 {
        self.values[slot.index()]
    }

    pub fn set(&mut self, slot: ParameterSlot, value: f32) {
        self.values[slot.index()] = value;
    }

    pub fn as_array(&self) -> &[f32; PARAMETER_COUNT] {
        &self.values
    }

    /// `(slot, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterSlot, f32)> + '_ {
        ParameterSlot::ALL.iter().map(|&slot| (slot, self.get(slot)))
    }
}

/// A named, persisted set of calibration parameters for one person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u32,
    pub name: String,
    /// Creation time in seconds since the Unix epoch.
    pub created_at: u64,
    pub parameters: CalibrationParameterSet,
}

impl UserProfile {
    /// Create a profile stamped with the current wall-clock time.
    pub fn new(id: u32, name: impl Into<String>, parameters: CalibrationParameterSet) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id,
            name: name.into(),
            created_at,
            parameters,
        }
    }
}

/// A sensor seen during the current scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    /// Advertised local name, or `"Unknown"`.
    pub name: String,
    /// Signal strength in dBm, when the platform reports it.
    pub rssi: Option<i16>,
}

/// Outward notifications for the UI layer.
///
/// Delivered on the `mpsc::UnboundedReceiver` returned by
/// [`crate::manager::DeviceManager::new`] and [`crate::handle::spawn`].
/// Calibration samples double as the plot sink: a finite run of
/// `CalibrationSample` values per session, closed by `CalibrationDone`.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    DeviceFound(DiscoveredDevice),
    /// Outcome of a `connect` request. `success == false` means the session
    /// was never established and the manager is back to no-session.
    Connected { id: DeviceId, success: bool },
    Disconnected,
    /// The device acknowledged the active profile's parameters.
    ProfileSet { profile_id: u32 },
    CalibrationSample(f32),
    CalibrationDone,
    /// No usable BLE adapter on this host.
    BleUnsupported,
    BlurStart,
    BlurStop,
    /// Battery charge in percent.
    BatteryLevel(f32),
    /// The sensor reported an error/exception. Not fatal; no retry is made.
    DeviceError,
    /// Raw debug payload streamed while debug mode is on.
    Debug(Vec<u8>),
}
