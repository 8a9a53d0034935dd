//! Connection lifecycle and calibration sub-protocol for one BLE session.
//!
//! [`Session`] is a plain synchronous state machine. It never touches the
//! transport, the clock or the UI; each entry point returns the ordered list
//! of [`Action`]s the owner must carry out. The owner
//! ([`crate::manager::DeviceManager`]) performs them in order, which keeps
//! every side effect on the single serialized manager task.
//!
//! # Transitions
//!
//! | State | Event | Next | Actions |
//! |---|---|---|---|
//! | (connect) | transport connected | `SendingProfile`* | 10 × `CalibrationParameter`, `SetParameters` |
//! | `SendingProfile` | `ParametersAck` | `Normal` | `NormalMode`, `ProfileSet`, arm monitor |
//! | `Normal` | `BlinkDetected` | `Normal` | reset monitor |
//! | `Normal` | blink timeout | `Blurring` | `BlurStart`, enforced blinks + 1 |
//! | `Blurring` | `BlinkDetected` | `Normal` | `BlurStop`, reset monitor |
//! | `Normal`/`Blurring` | calibration start | `CalibrationAwaitingData` | (`BlurStop`), disarm, `StartCalibration` |
//! | `CalibrationAwaitingData` | `CalibrationData` | `Calibrating` | sample |
//! | `Calibrating` | `CalibrationData` | `Calibrating` | sample |
//! | calibrating | calibration stop | `Normal` | `StopCalibration`, `CalibrationDone`, arm monitor |
//! | any | `ErrorException` | unchanged | `DeviceError` |
//! | any | `ResetNotice` | `SendingProfile`* | (`CalibrationDone`), `Reset`, profile again |
//! | any | transport disconnected | (no session) | disarm monitor |
//!
//! \* `BootingUp` when no profile is active.

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{IncomingMessage, OutgoingMessage};
use crate::types::{CalibrationParameterSet, ConnectionState, UserProfile};

/// What the blink monitor should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Start the countdown with the configured interval.
    Arm,
    Disarm,
    /// Restart the countdown without changing the interval.
    Reset,
}

/// Session-level notifications, mapped 1:1 onto [`crate::types::Notification`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ProfileSet { profile_id: u32 },
    BlurStart,
    BlurStop,
    CalibrationSample(f32),
    CalibrationDone,
    BatteryLevel(f32),
    DeviceError,
    Debug(Vec<u8>),
}

/// A side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(OutgoingMessage),
    Notify(SessionEvent),
    Monitor(MonitorCommand),
}

/// The profile currently loaded (or being loaded) on the device.
#[derive(Debug, Clone)]
struct LoadedProfile {
    id: u32,
    parameters: CalibrationParameterSet,
}

#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    enforced_blinks: u32,
    profile: Option<LoadedProfile>,
    /// A battery request that arrived mid profile transfer, where `0x10`
    /// would be read as a parameter.
    battery_request_pending: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session that has not seen its transport connect yet.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::BootingUp,
            enforced_blinks: 0,
            profile: None,
            battery_request_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Timeouts that pushed the session into `Blurring` since it started.
    pub fn enforced_blinks(&self) -> u32 {
        self.enforced_blinks
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidTransition {
            operation,
            state: Some(self.state),
        }
    }

    // ── Transport lifecycle ──────────────────────────────────────────────────

    /// The link is up. Sends `profile` right away when there is one.
    pub fn on_transport_connected(&mut self, profile: Option<&UserProfile>) -> Vec<Action> {
        self.state = ConnectionState::BootingUp;
        self.enforced_blinks = 0;
        self.battery_request_pending = false;
        self.profile = profile.map(|p| LoadedProfile {
            id: p.id,
            parameters: p.parameters,
        });

        match self.profile.clone() {
            Some(loaded) => self.transfer_profile(loaded),
            None => {
                info!("session started without a profile; waiting for one");
                Vec::new()
            }
        }
    }

    /// The link is gone. The owner drops the session afterwards.
    pub fn on_transport_disconnected(&mut self) -> Vec<Action> {
        if self.state.is_calibrating() {
            info!("disconnected mid-calibration; samples discarded");
        }
        vec![Action::Monitor(MonitorCommand::Disarm)]
    }

    // ── Inbound messages ─────────────────────────────────────────────────────

    /// Single entry point for decoded device messages.
    pub fn on_message(&mut self, msg: IncomingMessage) -> Vec<Action> {
        use ConnectionState::*;

        match msg {
            IncomingMessage::Alive => {
                debug!("device alive");
                Vec::new()
            }
            IncomingMessage::BlinkDetected => match self.state {
                Normal => vec![Action::Monitor(MonitorCommand::Reset)],
                Blurring => {
                    self.state = Normal;
                    vec![
                        Action::Notify(SessionEvent::BlurStop),
                        Action::Monitor(MonitorCommand::Reset),
                    ]
                }
                state => {
                    debug!("blink ignored in {state:?}");
                    Vec::new()
                }
            },
            IncomingMessage::CalibrationData(sample) => match self.state {
                CalibrationAwaitingData | Calibrating => {
                    self.state = Calibrating;
                    vec![Action::Notify(SessionEvent::CalibrationSample(sample))]
                }
                state => {
                    warn!("calibration sample {sample} outside calibration ({state:?}), dropped");
                    Vec::new()
                }
            },
            IncomingMessage::ParametersAck => {
                if self.state != SendingProfile {
                    debug!("unexpected ParametersAck in {:?}", self.state);
                    return Vec::new();
                }
                self.state = Normal;
                let profile_id = self.profile.as_ref().map(|p| p.id).unwrap_or_default();
                info!("profile {profile_id} acknowledged by device");
                let mut actions = vec![
                    Action::Send(OutgoingMessage::NormalMode),
                    Action::Notify(SessionEvent::ProfileSet { profile_id }),
                    Action::Monitor(MonitorCommand::Arm),
                ];
                if std::mem::take(&mut self.battery_request_pending) {
                    actions.push(Action::Send(OutgoingMessage::RequestBatteryLevel));
                }
                actions
            }
            IncomingMessage::BatteryLevel(percent) => {
                vec![Action::Notify(SessionEvent::BatteryLevel(percent))]
            }
            IncomingMessage::Debug(data) => vec![Action::Notify(SessionEvent::Debug(data))],
            IncomingMessage::ErrorException => {
                warn!("device reported an error in {:?}", self.state);
                vec![Action::Notify(SessionEvent::DeviceError)]
            }
            IncomingMessage::ResetNotice => {
                info!("device reset in {:?}; reloading profile", self.state);
                let mut actions = Vec::new();
                if matches!(self.state, CalibrationAwaitingData | Calibrating) {
                    // The device dropped the calibration; close the sample stream.
                    actions.push(Action::Notify(SessionEvent::CalibrationDone));
                }
                actions.extend(self.leave_detection());
                actions.push(Action::Send(OutgoingMessage::Reset));
                self.state = BootingUp;
                if let Some(loaded) = self.profile.clone() {
                    actions.extend(self.transfer_profile(loaded));
                }
                actions
            }
        }
    }

    /// The blink monitor expired.
    pub fn on_blink_timeout(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Normal {
            debug!("stale blink timeout in {:?}", self.state);
            return Vec::new();
        }
        self.state = ConnectionState::Blurring;
        self.enforced_blinks += 1;
        info!("no blink in time; enforced blink #{}", self.enforced_blinks);
        vec![Action::Notify(SessionEvent::BlurStart)]
    }

    /// Leave `Blurring` without waiting for a blink (blurring switched off).
    pub fn cancel_blur(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Blurring {
            return Vec::new();
        }
        self.state = ConnectionState::Normal;
        vec![Action::Notify(SessionEvent::BlurStop)]
    }

    // ── Caller requests ──────────────────────────────────────────────────────

    pub fn request_calibration_start(&mut self) -> Result<Vec<Action>> {
        match self.state {
            ConnectionState::Normal | ConnectionState::Blurring => {
                let mut actions = self.leave_detection();
                actions.push(Action::Send(OutgoingMessage::StartCalibration));
                self.state = ConnectionState::CalibrationAwaitingData;
                Ok(actions)
            }
            _ => Err(self.invalid("start_calibration")),
        }
    }

    pub fn request_calibration_stop(&mut self) -> Result<Vec<Action>> {
        if !self.state.is_calibrating() {
            return Err(self.invalid("stop_calibration"));
        }
        self.state = ConnectionState::Normal;
        Ok(vec![
            Action::Send(OutgoingMessage::StopCalibration),
            Action::Notify(SessionEvent::CalibrationDone),
            Action::Monitor(MonitorCommand::Arm),
        ])
    }

    /// Load a new profile onto the device. Not allowed mid-calibration.
    pub fn set_profile(&mut self, profile: &UserProfile) -> Result<Vec<Action>> {
        if self.state.is_calibrating() {
            return Err(self.invalid("set_profile"));
        }
        let loaded = LoadedProfile {
            id: profile.id,
            parameters: profile.parameters,
        };
        self.profile = Some(loaded.clone());
        Ok(self.transfer_profile(loaded))
    }

    /// Ask for the battery level. While a profile is in flight the request
    /// is held back until `ParametersAck`.
    pub fn request_battery_level(&mut self) -> Result<Vec<Action>> {
        if self.state == ConnectionState::SendingProfile {
            debug!("battery request deferred until the profile is acknowledged");
            self.battery_request_pending = true;
            return Ok(Vec::new());
        }
        Ok(vec![Action::Send(OutgoingMessage::RequestBatteryLevel)])
    }

    pub fn set_debug(&mut self, enabled: bool) -> Result<Vec<Action>> {
        let msg = if enabled {
            OutgoingMessage::StartDebug
        } else {
            OutgoingMessage::StopDebug
        };
        Ok(vec![Action::Send(msg)])
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Stop blink supervision, un-blurring first if needed.
    fn leave_detection(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Blurring {
            actions.push(Action::Notify(SessionEvent::BlurStop));
        }
        actions.push(Action::Monitor(MonitorCommand::Disarm));
        actions
    }

    fn transfer_profile(&mut self, loaded: LoadedProfile) -> Vec<Action> {
        let mut actions = self.leave_detection();
        actions.extend(loaded.parameters.iter().map(|(slot, value)| {
            Action::Send(OutgoingMessage::CalibrationParameter(slot, value))
        }));
        actions.push(Action::Send(OutgoingMessage::SetParameters));
        self.state = ConnectionState::SendingProfile;
        debug!("sending profile {} to device", loaded.id);
        actions
    }
}
