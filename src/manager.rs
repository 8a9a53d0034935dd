//! The device manager: single owner of the session, the blink monitor and
//! everything the UI reads.
//!
//! [`DeviceManager`] turns [`TransportEvent`]s and caller requests into
//! [`Session`] calls, carries out the returned actions against the transport
//! and the monitor, and forwards the results as [`Notification`]s. It is
//! synchronous apart from [`DeviceManager::blink_timeout`]; see
//! [`crate::handle`] for the task that drives it.

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::error::{Error, Result};
use crate::monitor::BlinkMonitor;
use crate::parse::FrameAccumulator;
use crate::protocol::encode;
use crate::session::{Action, MonitorCommand, Session, SessionEvent};
use crate::transport::{DeviceId, Transport, TransportEvent};
use crate::types::{ConnectionState, DiscoveredDevice, Notification, UserProfile};

// ── ManagerConfig ─────────────────────────────────────────────────────────────

/// Configuration for [`DeviceManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Longest allowed gap between blinks before blurring starts.
    /// Default: 30 s.
    pub blink_timeout: Duration,
    /// How often to ask the sensor for its battery level while connected.
    /// `None` disables polling. Default: 60 s.
    pub battery_poll_interval: Option<Duration>,
    /// When `false` the blink monitor is never armed and no blur is ever
    /// requested. Default: `true`.
    pub blurring_enabled: bool,
    /// Connect automatically when this device shows up in a scan
    /// (typically the last device used). Default: `None`.
    pub auto_connect: Option<DeviceId>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            blink_timeout: Duration::from_secs(30),
            battery_poll_interval: Some(Duration::from_secs(60)),
            blurring_enabled: true,
            auto_connect: None,
        }
    }
}

// ── DeviceStatus ──────────────────────────────────────────────────────────────

/// Point-in-time snapshot of everything the manager exposes for reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStatus {
    /// `None` when there is no session.
    pub state: Option<ConnectionState>,
    pub connected_device: Option<DeviceId>,
    pub enforced_blinks: u32,
    pub battery_level: Option<f32>,
    pub scanning: bool,
    pub discovered: Vec<DiscoveredDevice>,
    pub active_profile: Option<UserProfile>,
}

// ── DeviceManager ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Idle,
    Connecting(DeviceId),
    Connected(DeviceId),
}

/// Facade over transport, session state machine and blink monitor.
///
/// The manager is the sole owner of all mutable session state: the current
/// [`Session`], the active profile, the discovered-device list and the
/// counters. Methods never block; transport commands are fire-and-forget and
/// their outcome comes back through [`DeviceManager::handle_transport_event`].
///
/// Outside of tests the manager is driven by [`crate::handle::spawn`], which
/// serializes transport events, caller commands and timers onto one task.
pub struct DeviceManager<T: Transport> {
    transport: T,
    config: ManagerConfig,
    notifications: mpsc::UnboundedSender<Notification>,
    link: Link,
    session: Option<Session>,
    frames: FrameAccumulator,
    monitor: BlinkMonitor,
    scanning: bool,
    discovered: Vec<DiscoveredDevice>,
    profile: Option<UserProfile>,
    battery_level: Option<f32>,
    /// Counter of the last finished session, reported while disconnected.
    last_enforced_blinks: u32,
}

impl<T: Transport> DeviceManager<T> {
    pub fn new(
        transport: T,
        config: ManagerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            config,
            notifications: tx,
            link: Link::Idle,
            session: None,
            frames: FrameAccumulator::new(),
            monitor: BlinkMonitor::new(),
            scanning: false,
            discovered: Vec::new(),
            profile: None,
            battery_level: None,
            last_enforced_blinks: 0,
        };
        (manager, rx)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Current session state; `None` when no device is connected.
    pub fn state(&self) -> Option<ConnectionState> {
        self.session.as_ref().map(Session::state)
    }

    pub fn enforced_blinks(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.last_enforced_blinks, Session::enforced_blinks)
    }

    /// Last battery level reported by the connected sensor, in percent.
    /// `None` until the first report and after the session ends.
    pub fn battery_level(&self) -> Option<f32> {
        self.battery_level
    }

    pub fn discovered_devices(&self) -> &[DiscoveredDevice] {
        &self.discovered
    }

    pub fn active_profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn connected_device(&self) -> Option<&DeviceId> {
        match &self.link {
            Link::Connected(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            state: self.state(),
            connected_device: self.connected_device().cloned(),
            enforced_blinks: self.enforced_blinks(),
            battery_level: self.battery_level,
            scanning: self.scanning,
            discovered: self.discovered.clone(),
            active_profile: self.profile.clone(),
        }
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Start a fresh scan. The discovered-device list is cleared first.
    pub fn scan(&mut self) -> Result<()> {
        self.discovered.clear();
        self.transport.start_scan()?;
        self.scanning = true;
        info!("scanning for sensors");
        Ok(())
    }

    pub fn abort_scan(&mut self) -> Result<()> {
        if self.scanning {
            self.scanning = false;
            self.transport.stop_scan()?;
            info!("scan aborted");
        }
        Ok(())
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Ask the transport to connect. The outcome arrives later as a
    /// [`Notification::Connected`].
    pub fn connect(&mut self, id: &DeviceId) -> Result<()> {
        if self.link != Link::Idle {
            return Err(Error::InvalidTransition {
                operation: "connect",
                state: self.state(),
            });
        }
        if let Err(e) = self.abort_scan() {
            debug!("stopping scan before connect failed: {e}");
        }
        info!("connecting to {id}");
        self.link = Link::Connecting(id.clone());
        if let Err(e) = self.transport.connect(id) {
            warn!("connect to {id} could not be issued: {e}");
            self.link = Link::Idle;
            self.notify(Notification::Connected {
                id: id.clone(),
                success: false,
            });
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop the link. The manager is back to no-session immediately.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.link == Link::Idle {
            return Err(Error::InvalidTransition {
                operation: "disconnect",
                state: None,
            });
        }
        if let Err(e) = self.transport.disconnect() {
            warn!("transport disconnect failed: {e}");
        }
        let was_connected = matches!(self.link, Link::Connected(_));
        self.end_session();
        if was_connected {
            self.notify(Notification::Disconnected);
        }
        Ok(())
    }

    // ── Session requests ─────────────────────────────────────────────────────

    /// Make `profile` the active profile and, when connected, load it onto
    /// the device. Rejected mid-calibration; the previous profile then stays
    /// active.
    pub fn set_profile(&mut self, profile: UserProfile) -> Result<()> {
        if let Some(session) = self.session.as_mut() {
            let actions = session.set_profile(&profile)?;
            info!("activating profile {} ({})", profile.id, profile.name);
            self.profile = Some(profile);
            self.apply(actions);
        } else {
            info!("profile {} ({}) will be sent on connect", profile.id, profile.name);
            self.profile = Some(profile);
        }
        Ok(())
    }

    pub fn start_calibration(&mut self) -> Result<()> {
        let actions = self.session_mut("start_calibration")?.request_calibration_start()?;
        self.apply(actions);
        Ok(())
    }

    pub fn stop_calibration(&mut self) -> Result<()> {
        let actions = self.session_mut("stop_calibration")?.request_calibration_stop()?;
        self.apply(actions);
        Ok(())
    }

    pub fn request_battery_level(&mut self) -> Result<()> {
        let actions = self.session_mut("request_battery_level")?.request_battery_level()?;
        self.apply(actions);
        Ok(())
    }

    pub fn set_debug(&mut self, enabled: bool) -> Result<()> {
        let actions = self.session_mut("set_debug")?.set_debug(enabled)?;
        self.apply(actions);
        Ok(())
    }

    /// Turn screen blurring on or off. Switching it off while blurred
    /// un-blurs immediately.
    pub fn set_blurring_enabled(&mut self, enabled: bool) {
        self.config.blurring_enabled = enabled;
        if !enabled {
            self.monitor.disarm();
            if let Some(session) = self.session.as_mut() {
                let actions = session.cancel_blur();
                self.apply(actions);
            }
        } else if self.state() == Some(ConnectionState::Normal) && !self.monitor.is_armed() {
            self.monitor.arm(self.config.blink_timeout);
        }
        info!("blurring {}", if enabled { "enabled" } else { "disabled" });
    }

    // ── Event intake ─────────────────────────────────────────────────────────

    /// Translate one transport event into session events and notifications.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered { id, name, rssi } => self.on_discovered(id, name, rssi),
            TransportEvent::Connected(id) => self.on_connected(id),
            TransportEvent::ConnectFailed(err) => match self.take_pending_connect() {
                Some(id) => {
                    warn!("connect to {id} failed: {err}");
                    self.notify(Notification::Connected { id, success: false });
                }
                None => debug!("stale connect failure: {err}"),
            },
            TransportEvent::Disconnected => {
                if matches!(self.link, Link::Connected(_)) {
                    info!("device disconnected");
                    self.end_session();
                    self.notify(Notification::Disconnected);
                }
            }
            TransportEvent::DataReceived(bytes) => self.on_data(&bytes),
            TransportEvent::BleUnavailable(reason) => {
                warn!("Bluetooth LE unavailable: {reason}");
                self.scanning = false;
                if let Some(id) = self.take_pending_connect() {
                    self.notify(Notification::Connected { id, success: false });
                } else if matches!(self.link, Link::Connected(_)) {
                    self.end_session();
                    self.notify(Notification::Disconnected);
                }
                self.notify(Notification::BleUnsupported);
            }
        }
    }

    /// The blink monitor expired. Must be called on the same task as
    /// [`DeviceManager::handle_transport_event`].
    pub fn handle_blink_timeout(&mut self) {
        if let Some(session) = self.session.as_mut() {
            let actions = session.on_blink_timeout();
            self.apply(actions);
        }
    }

    /// Resolves when the blink monitor fires. Cancel safe.
    pub async fn blink_timeout(&mut self) {
        self.monitor.expired().await
    }

    /// Periodic battery poll; silently skipped without a session.
    pub fn poll_battery(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.request_battery_level() {
                debug!("battery poll skipped: {e}");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn session_mut(&mut self, operation: &'static str) -> Result<&mut Session> {
        self.session.as_mut().ok_or(Error::InvalidTransition {
            operation,
            state: None,
        })
    }

    /// Back to `Idle` if a connect was in flight, yielding its target.
    fn take_pending_connect(&mut self) -> Option<DeviceId> {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Connecting(id) => Some(id),
            other => {
                self.link = other;
                None
            }
        }
    }

    fn on_discovered(&mut self, id: DeviceId, name: String, rssi: Option<i16>) {
        if let Some(known) = self.discovered.iter_mut().find(|d| d.id == id) {
            known.rssi = rssi;
            return;
        }
        let device = DiscoveredDevice { id, name, rssi };
        info!("found {} ({}) rssi={:?}", device.name, device.id, device.rssi);
        self.discovered.push(device.clone());
        self.notify(Notification::DeviceFound(device.clone()));

        if self.link == Link::Idle && self.config.auto_connect.as_ref() == Some(&device.id) {
            info!("auto-connecting to last known device {}", device.id);
            if let Err(e) = self.connect(&device.id) {
                warn!("auto-connect failed: {e}");
            }
        }
    }

    fn on_connected(&mut self, id: DeviceId) {
        if !matches!(self.link, Link::Connecting(_)) {
            // Disconnect was requested while the link was coming up.
            debug!("late connect of {id} after disconnect; dropping link");
            if let Err(e) = self.transport.disconnect() {
                warn!("transport disconnect failed: {e}");
            }
            return;
        }
        info!("connected to {id}");
        self.link = Link::Connected(id.clone());
        self.frames.clear();
        self.battery_level = None;

        let mut session = Session::new();
        let actions = session.on_transport_connected(self.profile.as_ref());
        self.session = Some(session);
        self.notify(Notification::Connected { id, success: true });
        self.apply(actions);
    }

    fn on_data(&mut self, bytes: &[u8]) {
        if self.session.is_none() {
            debug!("dropping {} bytes received without a session", bytes.len());
            return;
        }
        self.frames.push(bytes);
        while let Some(frame) = self.frames.next_message() {
            match frame {
                Ok(msg) => {
                    debug!("<- {msg:?}");
                    let Some(session) = self.session.as_mut() else {
                        break;
                    };
                    let actions = session.on_message(msg);
                    self.apply(actions);
                }
                Err(e) => warn!(
                    "skipping malformed input: {e} ({} bytes skipped so far)",
                    self.frames.skipped_bytes()
                ),
            }
        }
    }

    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.last_enforced_blinks = session.enforced_blinks();
            let actions = session.on_transport_disconnected();
            self.apply(actions);
        }
        self.monitor.disarm();
        self.frames.clear();
        self.battery_level = None;
        self.link = Link::Idle;
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(msg) => {
                    debug!("-> {msg:?}");
                    // Unconfirmed sends are dropped; the protocol has no retry.
                    if let Err(e) = self.transport.write(&encode(&msg)) {
                        warn!("dropping {msg:?}: {e}");
                    }
                }
                Action::Monitor(MonitorCommand::Arm) => {
                    if self.config.blurring_enabled {
                        self.monitor.arm(self.config.blink_timeout);
                    }
                }
                Action::Monitor(MonitorCommand::Disarm) => self.monitor.disarm(),
                Action::Monitor(MonitorCommand::Reset) => self.monitor.reset(),
                Action::Notify(event) => {
                    let note = match event {
                        SessionEvent::ProfileSet { profile_id } => {
                            Notification::ProfileSet { profile_id }
                        }
                        SessionEvent::BlurStart => Notification::BlurStart,
                        SessionEvent::BlurStop => Notification::BlurStop,
                        SessionEvent::CalibrationSample(v) => Notification::CalibrationSample(v),
                        SessionEvent::CalibrationDone => Notification::CalibrationDone,
                        SessionEvent::BatteryLevel(v) => {
                            self.battery_level = Some(v);
                            Notification::BatteryLevel(v)
                        }
                        SessionEvent::DeviceError => Notification::DeviceError,
                        SessionEvent::Debug(data) => Notification::Debug(data),
                    };
                    self.notify(note);
                }
            }
        }
    }

    fn notify(&self, note: Notification) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.notifications.send(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IncomingMessage, OutgoingMessage};
    use crate::transport::mock::{Call, MockTransport};
    use crate::types::{CalibrationParameterSet, PARAMETER_COUNT};

    fn manager(config: ManagerConfig) -> (
        DeviceManager<MockTransport>,
        MockTransport,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let transport = MockTransport::default();
        let (m, rx) = DeviceManager::new(transport.clone(), config);
        (m, transport, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn zero_profile() -> UserProfile {
        UserProfile::new(5, "zero", CalibrationParameterSet::default())
    }

    fn dev() -> DeviceId {
        DeviceId::from("sensor-1")
    }

    /// Connected, profile acknowledged, notifications drained.
    fn normal() -> (
        DeviceManager<MockTransport>,
        MockTransport,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (mut m, t, mut rx) = manager(ManagerConfig::default());
        m.set_profile(zero_profile()).unwrap();
        m.connect(&dev()).unwrap();
        m.handle_transport_event(TransportEvent::Connected(dev()));
        m.handle_transport_event(TransportEvent::DataReceived(
            IncomingMessage::ParametersAck.encode(),
        ));
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        drain(&mut rx);
        t.clear();
        (m, t, rx)
    }

    #[test]
    fn scan_collects_and_clears_devices() {
        let (mut m, t, mut rx) = manager(ManagerConfig::default());
        m.scan().unwrap();
        assert!(m.is_scanning());
        for (id, rssi) in [("a", -40), ("b", -70), ("a", -45)] {
            m.handle_transport_event(TransportEvent::Discovered {
                id: id.into(),
                name: "eyeDrops".into(),
                rssi: Some(rssi),
            });
        }
        assert_eq!(m.discovered_devices().len(), 2);
        assert_eq!(m.discovered_devices()[0].rssi, Some(-45));
        assert_eq!(drain(&mut rx).len(), 2);

        m.scan().unwrap();
        assert!(m.discovered_devices().is_empty());
        m.abort_scan().unwrap();
        assert!(!m.is_scanning());
        assert_eq!(
            t.calls(),
            vec![Call::StartScan, Call::StartScan, Call::StopScan]
        );
    }

    #[test]
    fn connect_sends_profile_and_ack_reaches_normal() {
        let (mut m, t, mut rx) = manager(ManagerConfig::default());
        m.set_profile(zero_profile()).unwrap();
        assert!(t.writes().is_empty(), "nothing is sent before connecting");

        m.connect(&dev()).unwrap();
        assert_eq!(m.state(), None);
        m.handle_transport_event(TransportEvent::Connected(dev()));
        assert_eq!(m.state(), Some(ConnectionState::SendingProfile));

        let writes = t.writes();
        assert_eq!(writes.len(), PARAMETER_COUNT + 1);
        for (i, w) in writes[..PARAMETER_COUNT].iter().enumerate() {
            let mut expected = vec![0x10 + i as u8];
            expected.extend_from_slice(&0.0f32.to_le_bytes());
            assert_eq!(w, &expected);
        }
        assert_eq!(writes[PARAMETER_COUNT], vec![0x03]);

        m.handle_transport_event(TransportEvent::DataReceived(vec![0x03]));
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        assert_eq!(m.enforced_blinks(), 0);
        assert_eq!(m.connected_device(), Some(&dev()));
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::Connected {
                    id: dev(),
                    success: true
                },
                Notification::ProfileSet { profile_id: 5 },
            ]
        );
    }

    #[test]
    fn timeout_and_blink_drive_blur() {
        let (mut m, _t, mut rx) = normal();
        m.handle_blink_timeout();
        assert_eq!(m.state(), Some(ConnectionState::Blurring));
        assert_eq!(m.enforced_blinks(), 1);

        m.handle_transport_event(TransportEvent::DataReceived(vec![0x01]));
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        assert_eq!(
            drain(&mut rx),
            vec![Notification::BlurStart, Notification::BlurStop]
        );
    }

    #[test]
    fn calibration_round_trip_through_facade() {
        let (mut m, t, mut rx) = normal();
        m.start_calibration().unwrap();
        assert_eq!(t.writes(), vec![encode(&OutgoingMessage::StartCalibration)]);

        let mut chunk = IncomingMessage::CalibrationData(10.0).encode();
        chunk.extend(IncomingMessage::CalibrationData(-10.0).encode());
        m.handle_transport_event(TransportEvent::DataReceived(chunk));
        assert_eq!(m.state(), Some(ConnectionState::Calibrating));

        m.stop_calibration().unwrap();
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::CalibrationSample(10.0),
                Notification::CalibrationSample(-10.0),
                Notification::CalibrationDone,
            ]
        );
    }

    #[test]
    fn disconnect_mid_calibration_then_fresh_reconnect() {
        let (mut m, _t, mut rx) = normal();
        m.handle_blink_timeout();
        m.handle_transport_event(TransportEvent::DataReceived(vec![0x01]));
        m.start_calibration().unwrap();
        m.handle_transport_event(TransportEvent::DataReceived(
            IncomingMessage::CalibrationData(1.0).encode(),
        ));
        drain(&mut rx);

        m.handle_transport_event(TransportEvent::Disconnected);
        assert_eq!(m.state(), None);
        assert_eq!(m.connected_device(), None);
        assert_eq!(drain(&mut rx), vec![Notification::Disconnected]);
        assert!(m.stop_calibration().is_err());

        m.connect(&dev()).unwrap();
        m.handle_transport_event(TransportEvent::Connected(dev()));
        assert_eq!(m.state(), Some(ConnectionState::SendingProfile));
        assert_eq!(m.enforced_blinks(), 0);
    }

    #[test]
    fn requests_without_session_are_invalid() {
        let (mut m, t, _rx) = manager(ManagerConfig::default());
        let invalid = |operation| Error::InvalidTransition {
            operation,
            state: None,
        };
        assert_eq!(m.start_calibration(), Err(invalid("start_calibration")));
        assert_eq!(m.stop_calibration(), Err(invalid("stop_calibration")));
        assert_eq!(
            m.request_battery_level(),
            Err(invalid("request_battery_level"))
        );
        assert_eq!(m.disconnect(), Err(invalid("disconnect")));
        assert!(t.calls().is_empty());
    }

    #[test]
    fn second_connect_is_rejected() {
        let (mut m, _t, _rx) = normal();
        assert_eq!(
            m.connect(&DeviceId::from("other")),
            Err(Error::InvalidTransition {
                operation: "connect",
                state: Some(ConnectionState::Normal)
            })
        );
    }

    #[test]
    fn connect_failure_reports_and_returns_to_idle() {
        let (mut m, _t, mut rx) = manager(ManagerConfig::default());
        m.connect(&dev()).unwrap();
        m.handle_transport_event(TransportEvent::ConnectFailed(
            crate::error::TransportError::Connect("timed out".into()),
        ));
        assert_eq!(m.state(), None);
        assert_eq!(
            drain(&mut rx),
            vec![Notification::Connected {
                id: dev(),
                success: false
            }]
        );
        // A fresh attempt is allowed.
        assert!(m.connect(&dev()).is_ok());
    }

    #[test]
    fn garbage_does_not_end_the_session() {
        let (mut m, _t, mut rx) = normal();
        m.handle_transport_event(TransportEvent::DataReceived(vec![0x77, 0x42, 0x10]));
        m.handle_transport_event(TransportEvent::DataReceived(
            80.0f32.to_le_bytes().to_vec(),
        ));
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        assert_eq!(drain(&mut rx), vec![Notification::BatteryLevel(80.0)]);
        assert_eq!(m.battery_level(), Some(80.0));
    }

    #[test]
    fn battery_level_is_forgotten_when_the_link_drops() {
        let (mut m, _t, mut rx) = normal();
        m.handle_transport_event(TransportEvent::DataReceived(
            IncomingMessage::BatteryLevel(64.5).encode(),
        ));
        assert_eq!(m.status().battery_level, Some(64.5));

        m.handle_transport_event(TransportEvent::Disconnected);
        assert_eq!(m.battery_level(), None);
        assert_eq!(m.status().battery_level, None);
        assert_eq!(
            drain(&mut rx),
            vec![Notification::BatteryLevel(64.5), Notification::Disconnected]
        );
    }

    #[test]
    fn device_error_is_reported_without_state_change() {
        let (mut m, _t, mut rx) = normal();
        m.handle_transport_event(TransportEvent::DataReceived(vec![0xEE]));
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        assert_eq!(drain(&mut rx), vec![Notification::DeviceError]);
    }

    #[test]
    fn set_profile_mid_calibration_keeps_old_profile() {
        let (mut m, _t, _rx) = normal();
        m.start_calibration().unwrap();
        let other = UserProfile::new(9, "other", CalibrationParameterSet::default());
        assert!(m.set_profile(other).is_err());
        assert_eq!(m.active_profile().map(|p| p.id), Some(5));
    }

    #[test]
    fn disabling_blur_while_blurred_unblurs() {
        let (mut m, _t, mut rx) = normal();
        m.handle_blink_timeout();
        m.set_blurring_enabled(false);
        assert_eq!(m.state(), Some(ConnectionState::Normal));
        assert_eq!(
            drain(&mut rx),
            vec![Notification::BlurStart, Notification::BlurStop]
        );
    }

    #[test]
    fn auto_connect_to_known_device() {
        let (mut m, t, _rx) = manager(ManagerConfig {
            auto_connect: Some(dev()),
            ..Default::default()
        });
        m.scan().unwrap();
        m.handle_transport_event(TransportEvent::Discovered {
            id: DeviceId::from("stranger"),
            name: "eyeDrops".into(),
            rssi: None,
        });
        m.handle_transport_event(TransportEvent::Discovered {
            id: dev(),
            name: "eyeDrops".into(),
            rssi: None,
        });
        assert_eq!(
            t.calls(),
            vec![Call::StartScan, Call::StopScan, Call::Connect(dev())]
        );
    }

    #[test]
    fn ble_unavailable_is_surfaced() {
        let (mut m, _t, mut rx) = manager(ManagerConfig::default());
        m.scan().unwrap();
        m.handle_transport_event(TransportEvent::BleUnavailable("powered off".into()));
        assert!(!m.is_scanning());
        assert_eq!(drain(&mut rx), vec![Notification::BleUnsupported]);
    }

    #[test]
    fn failed_writes_are_dropped() {
        let transport = MockTransport {
            fail_writes: true,
            ..Default::default()
        };
        let (mut m, _rx) = DeviceManager::new(transport, ManagerConfig::default());
        m.set_profile(zero_profile()).unwrap();
        m.connect(&dev()).unwrap();
        m.handle_transport_event(TransportEvent::Connected(dev()));
        assert_eq!(m.state(), Some(ConnectionState::SendingProfile));
    }

    #[test]
    fn user_disconnect_resets_to_no_session() {
        let (mut m, t, mut rx) = normal();
        m.disconnect().unwrap();
        assert_eq!(m.state(), None);
        assert_eq!(t.calls(), vec![Call::Disconnect]);
        assert_eq!(drain(&mut rx), vec![Notification::Disconnected]);

        // The transport's own late Disconnected event is a no-op now.
        m.handle_transport_event(TransportEvent::Disconnected);
        assert!(drain(&mut rx).is_empty());
    }
}
