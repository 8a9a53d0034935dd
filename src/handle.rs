//! Background task that owns a [`DeviceManager`] and a cloneable handle to it.
//!
//! [`spawn`] moves the manager onto one tokio task. That task is the only
//! place where transport events, caller commands, the blink timer and the
//! battery poll are processed, so every state change happens in a single
//! total order.
//!
//! ```no_run
//! # use eyedrops_rs::prelude::*;
//! # use tokio::sync::mpsc::Receiver;
//! # async fn demo(
//! #     transport: SimulatedTransport,
//! #     events: Receiver<TransportEvent>,
//! # ) -> eyedrops_rs::error::Result<()> {
//! let (device, mut notes) = spawn(transport, events, ManagerConfig::default());
//! device.scan().await?;
//! while let Some(note) = notes.recv().await {
//!     if let Notification::DeviceFound(d) = note {
//!         device.connect(d.id).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::manager::{DeviceManager, DeviceStatus, ManagerConfig};
use crate::transport::{DeviceId, Transport, TransportEvent};
use crate::types::{ConnectionState, DiscoveredDevice, Notification, UserProfile};

#[derive(Debug)]
enum Op {
    Scan,
    AbortScan,
    Connect(DeviceId),
    Disconnect,
    SetProfile(UserProfile),
    StartCalibration,
    StopCalibration,
    RequestBatteryLevel,
    SetBlurringEnabled(bool),
    SetDebug(bool),
}

struct Command {
    op: Op,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable front end to a running device manager.
///
/// Every request method resolves once the manager has applied it; the
/// accessors read the snapshot published after the most recent step.
#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<DeviceStatus>,
}

impl DeviceHandle {
    async fn request(&self, op: Op) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { op, reply })
            .await
            .map_err(|_| Error::ManagerStopped)?;
        rx.await.map_err(|_| Error::ManagerStopped)?
    }

    pub async fn scan(&self) -> Result<()> {
        self.request(Op::Scan).await
    }

    pub async fn abort_scan(&self) -> Result<()> {
        self.request(Op::AbortScan).await
    }

    /// Resolves when the connect request was issued, not when the link is
    /// up; watch for [`Notification::Connected`].
    pub async fn connect(&self, id: DeviceId) -> Result<()> {
        self.request(Op::Connect(id)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Op::Disconnect).await
    }

    pub async fn set_profile(&self, profile: UserProfile) -> Result<()> {
        self.request(Op::SetProfile(profile)).await
    }

    pub async fn start_calibration(&self) -> Result<()> {
        self.request(Op::StartCalibration).await
    }

    pub async fn stop_calibration(&self) -> Result<()> {
        self.request(Op::StopCalibration).await
    }

    pub async fn request_battery_level(&self) -> Result<()> {
        self.request(Op::RequestBatteryLevel).await
    }

    pub async fn set_blurring_enabled(&self, enabled: bool) -> Result<()> {
        self.request(Op::SetBlurringEnabled(enabled)).await
    }

    pub async fn set_debug(&self, enabled: bool) -> Result<()> {
        self.request(Op::SetDebug(enabled)).await
    }

    // ── Snapshot accessors ───────────────────────────────────────────────────

    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.status.borrow().state
    }

    pub fn enforced_blinks(&self) -> u32 {
        self.status.borrow().enforced_blinks
    }

    pub fn battery_level(&self) -> Option<f32> {
        self.status.borrow().battery_level
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.status.borrow().discovered.clone()
    }

    pub fn active_profile(&self) -> Option<UserProfile> {
        self.status.borrow().active_profile.clone()
    }

    pub fn connected_device(&self) -> Option<DeviceId> {
        self.status.borrow().connected_device.clone()
    }

    /// A fresh receiver that is notified whenever the snapshot changes.
    pub fn watch_status(&self) -> watch::Receiver<DeviceStatus> {
        self.status.clone()
    }

    /// `false` once the manager task has exited.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Start a manager for `transport` on the current tokio runtime.
///
/// `events` is the receiver handed out by the transport's constructor. The
/// task runs until the transport closes its event channel or every
/// [`DeviceHandle`] has been dropped.
pub fn spawn<T: Transport>(
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    config: ManagerConfig,
) -> (DeviceHandle, mpsc::UnboundedReceiver<Notification>) {
    let (manager, notifications) = DeviceManager::new(transport, config);
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = watch::channel(manager.status());

    tokio::spawn(run(manager, events, cmd_rx, status_tx));

    let handle = DeviceHandle {
        commands: cmd_tx,
        status: status_rx,
    };
    (handle, notifications)
}

async fn run<T: Transport>(
    mut manager: DeviceManager<T>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<Command>,
    status: watch::Sender<DeviceStatus>,
) {
    let mut battery_poll = manager.config().battery_poll_interval.map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    info!("device manager started");
    loop {
        let mut reply = None;
        tokio::select! {
            // Link events take priority over commands.
            biased;

            event = events.recv() => match event {
                Some(event) => manager.handle_transport_event(event),
                None => {
                    info!("transport closed; stopping device manager");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command { op, reply: tx }) => {
                    debug!("command {op:?}");
                    reply = Some((tx, execute(&mut manager, op)));
                }
                None => {
                    info!("all handles dropped; stopping device manager");
                    break;
                }
            },
            _ = manager.blink_timeout() => manager.handle_blink_timeout(),
            _ = tick(&mut battery_poll), if manager.is_connected() => manager.poll_battery(),
        }

        // Publish before replying so a caller sees its own effect.
        status.send_replace(manager.status());
        if let Some((tx, result)) = reply {
            let _ = tx.send(result);
        }
    }
    if let Err(e) = manager.disconnect() {
        debug!("shutdown disconnect: {e}");
    }
    status.send_replace(manager.status());
}

fn execute<T: Transport>(manager: &mut DeviceManager<T>, op: Op) -> Result<()> {
    match op {
        Op::Scan => manager.scan(),
        Op::AbortScan => manager.abort_scan(),
        Op::Connect(id) => manager.connect(&id),
        Op::Disconnect => manager.disconnect(),
        Op::SetProfile(profile) => manager.set_profile(profile),
        Op::StartCalibration => manager.start_calibration(),
        Op::StopCalibration => manager.stop_calibration(),
        Op::RequestBatteryLevel => manager.request_battery_level(),
        Op::SetBlurringEnabled(enabled) => {
            manager.set_blurring_enabled(enabled);
            Ok(())
        }
        Op::SetDebug(enabled) => manager.set_debug(enabled),
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::types::CalibrationParameterSet;
    use tokio::time::{sleep, timeout, Duration};

    fn quiet_config() -> ManagerConfig {
        ManagerConfig {
            battery_poll_interval: None,
            ..Default::default()
        }
    }

    /// Spawn, connect, and acknowledge the profile.
    async fn connected(
        config: ManagerConfig,
    ) -> (
        DeviceHandle,
        mpsc::UnboundedReceiver<Notification>,
        mpsc::Sender<TransportEvent>,
        MockTransport,
    ) {
        let transport = MockTransport::default();
        let (tx, events) = mpsc::channel(16);
        let (handle, mut notes) = spawn(transport.clone(), events, config);
        let id = DeviceId::from("sensor");

        let profile = UserProfile::new(1, "me", CalibrationParameterSet::default());
        handle.set_profile(profile).await.unwrap();
        handle.connect(id.clone()).await.unwrap();
        tx.send(TransportEvent::Connected(id.clone())).await.unwrap();
        tx.send(TransportEvent::DataReceived(vec![0x03])).await.unwrap();

        assert_eq!(
            notes.recv().await,
            Some(Notification::Connected { id, success: true })
        );
        assert_eq!(
            notes.recv().await,
            Some(Notification::ProfileSet { profile_id: 1 })
        );
        (handle, notes, tx, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn blur_cycle_with_real_timer() {
        let (handle, mut notes, tx, _t) = connected(quiet_config()).await;
        let start = Instant::now();

        assert_eq!(notes.recv().await, Some(Notification::BlurStart));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(handle.enforced_blinks(), 1);

        tx.send(TransportEvent::DataReceived(vec![0x01])).await.unwrap();
        assert_eq!(notes.recv().await, Some(Notification::BlurStop));

        // A blink 20 s in pushes the next blur to 50 s after the BlurStop.
        sleep(Duration::from_secs(20)).await;
        tx.send(TransportEvent::DataReceived(vec![0x01])).await.unwrap();
        assert!(timeout(Duration::from_secs(25), notes.recv()).await.is_err());
        assert_eq!(notes.recv().await, Some(Notification::BlurStart));
        assert_eq!(handle.enforced_blinks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_silences_the_timer() {
        let (handle, mut notes, _tx, _t) = connected(quiet_config()).await;
        handle.start_calibration().await.unwrap();
        assert_eq!(handle.state(), Some(ConnectionState::CalibrationAwaitingData));
        assert!(timeout(Duration::from_secs(120), notes.recv()).await.is_err());

        handle.stop_calibration().await.unwrap();
        assert_eq!(handle.state(), Some(ConnectionState::Normal));
        assert_eq!(notes.recv().await, Some(Notification::CalibrationDone));
        assert_eq!(notes.recv().await, Some(Notification::BlurStart));
    }

    #[tokio::test(start_paused = true)]
    async fn battery_is_polled_while_connected() {
        let config = ManagerConfig {
            battery_poll_interval: Some(Duration::from_secs(60)),
            blurring_enabled: false,
            ..Default::default()
        };
        let (_handle, _notes, _tx, transport) = connected(config).await;
        transport.clear();

        sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.writes(), vec![vec![0x10]]);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_without_session_fail() {
        let (tx, events) = mpsc::channel(4);
        let (handle, _notes) = spawn(MockTransport::default(), events, quiet_config());
        assert_eq!(
            handle.start_calibration().await,
            Err(Error::InvalidTransition {
                operation: "start_calibration",
                state: None
            })
        );
        assert_eq!(handle.state(), None);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_stops_the_manager() {
        let (tx, events) = mpsc::channel(4);
        let (handle, _notes) = spawn(MockTransport::default(), events, quiet_config());
        drop(tx);
        assert_eq!(handle.scan().await, Err(Error::ManagerStopped));
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_clears_status() {
        let (handle, mut notes, _tx, _t) = connected(quiet_config()).await;
        assert_eq!(handle.connected_device(), Some(DeviceId::from("sensor")));
        handle.disconnect().await.unwrap();
        assert_eq!(handle.state(), None);
        assert_eq!(handle.connected_device(), None);
        assert_eq!(notes.recv().await, Some(Notification::Disconnected));
    }
}
