//! In-process fake sensor for running without Bluetooth hardware.
//!
//! [`SimulatedTransport`] implements [`Transport`] on top of a small firmware
//! model running on its own tokio task. It speaks the real wire format in
//! both directions, so everything above the transport (framing, session,
//! blink monitor) runs exactly as it would against an RFduino.
//!
//! The model:
//!
//! * a scan reports one device after `discovery_delay`
//! * every link-up is followed by a `ResetNotice`, as after a firmware boot
//! * parameters are stored, `SetParameters` is answered with `ParametersAck`
//! * `NormalMode` is answered with `Alive` and starts blink generation
//! * every `stare_every`-th blink is followed by a `stare_duration` gap,
//!   long enough to trip the default blink timeout
//! * calibration streams a sine wave with blink-shaped dips
//! * battery requests report a slowly draining charge
//! * with debug on, each blink is followed by a `Debug` frame

use std::f64::consts::PI;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::error::TransportError;
use crate::protocol::{decode_outgoing, IncomingMessage, OutgoingMessage, TagContext};
use crate::transport::{DeviceId, Transport, TransportEvent};
use crate::types::{CalibrationParameterSet, PARAMETER_COUNT};

// ── SimConfig ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Advertised name. Default: `"eyeDrops-Sim"`.
    pub name: String,
    /// Default: `"SIM-0001"`.
    pub device_id: DeviceId,
    pub rssi: i16,
    /// Delay between `start_scan` and the device being reported.
    pub discovery_delay: Duration,
    /// Delay between `connect` and the link coming up.
    pub connect_delay: Duration,
    /// Regular gap between blinks. Default: 4 s.
    pub blink_interval: Duration,
    /// Every n-th blink is followed by a stare. `0` disables stares.
    pub stare_every: u32,
    /// Length of a stare. Default: 40 s.
    pub stare_duration: Duration,
    /// Gap between calibration samples. Default: 100 ms.
    pub sample_interval: Duration,
    /// Charge reported by the first battery request, in percent.
    pub battery_level: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "eyeDrops-Sim".into(),
            device_id: DeviceId::from("SIM-0001"),
            rssi: -58,
            discovery_delay: Duration::from_millis(300),
            connect_delay: Duration::from_millis(500),
            blink_interval: Duration::from_secs(4),
            stare_every: 5,
            stare_duration: Duration::from_secs(40),
            sample_interval: Duration::from_millis(100),
            battery_level: 87.0,
        }
    }
}

// ── SimulatedTransport ────────────────────────────────────────────────────────

#[derive(Debug)]
enum SimCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect,
    Write(Vec<u8>),
}

/// A [`Transport`] backed by a simulated sensor.
pub struct SimulatedTransport {
    commands: mpsc::UnboundedSender<SimCommand>,
}

impl SimulatedTransport {
    /// Spawn the firmware task on the current runtime.
    pub fn new(config: SimConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(run(Firmware::new(config, event_tx), cmd_rx));
        (Self { commands: cmd_tx }, event_rx)
    }

    fn send(&self, cmd: SimCommand) -> Result<(), TransportError> {
        self.commands.send(cmd).map_err(|_| TransportError::Closed)
    }
}

impl Transport for SimulatedTransport {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.send(SimCommand::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.send(SimCommand::StopScan)
    }

    fn connect(&mut self, id: &DeviceId) -> Result<(), TransportError> {
        self.send(SimCommand::Connect(id.clone()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.send(SimCommand::Disconnect)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(SimCommand::Write(bytes.to_vec()))
    }
}

// ── Firmware model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Disconnected,
    /// Linked, waiting for parameters or `NormalMode`.
    Idle,
    Detecting,
    Calibrating,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Announce,
    LinkUp,
    Blink,
    Sample,
}

struct Firmware {
    config: SimConfig,
    events: mpsc::Sender<TransportEvent>,
    mode: Mode,
    parameters: CalibrationParameterSet,
    params_received: usize,
    debug: bool,
    battery: f32,
    blinks: u32,
    /// Seconds of simulated calibration signal.
    phase: f64,
    announce_at: Option<Instant>,
    link_up_at: Option<Instant>,
    blink_at: Option<Instant>,
    sample_at: Option<Instant>,
}

impl Firmware {
    fn new(config: SimConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            battery: config.battery_level,
            config,
            events,
            mode: Mode::Disconnected,
            parameters: CalibrationParameterSet::default(),
            params_received: 0,
            debug: false,
            blinks: 0,
            phase: 0.0,
            announce_at: None,
            link_up_at: None,
            blink_at: None,
            sample_at: None,
        }
    }

    fn next_timer(&self) -> Option<(Instant, Timer)> {
        [
            (self.announce_at, Timer::Announce),
            (self.link_up_at, Timer::LinkUp),
            (self.blink_at, Timer::Blink),
            (self.sample_at, Timer::Sample),
        ]
        .into_iter()
        .filter_map(|(at, timer)| at.map(|at| (at, timer)))
        .min_by_key(|(at, _)| *at)
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    async fn reply(&self, msg: IncomingMessage) {
        debug!("sim <- {msg:?}");
        self.emit(TransportEvent::DataReceived(msg.encode())).await;
    }

    async fn handle(&mut self, cmd: SimCommand) {
        match cmd {
            SimCommand::StartScan => {
                self.announce_at = Some(Instant::now() + self.config.discovery_delay);
            }
            SimCommand::StopScan => self.announce_at = None,
            SimCommand::Connect(id) => {
                if id != self.config.device_id {
                    self.emit(TransportEvent::ConnectFailed(TransportError::UnknownDevice(id)))
                        .await;
                } else if self.mode == Mode::Disconnected {
                    self.link_up_at = Some(Instant::now() + self.config.connect_delay);
                }
            }
            SimCommand::Disconnect => {
                let was_linked = self.mode != Mode::Disconnected;
                self.drop_link();
                if was_linked {
                    self.emit(TransportEvent::Disconnected).await;
                }
            }
            SimCommand::Write(bytes) => self.on_write(&bytes).await,
        }
    }

    async fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::Announce => {
                self.announce_at = None;
                info!("sim: advertising as {}", self.config.name);
                self.emit(TransportEvent::Discovered {
                    id: self.config.device_id.clone(),
                    name: self.config.name.clone(),
                    rssi: Some(self.config.rssi),
                })
                .await;
            }
            Timer::LinkUp => {
                self.link_up_at = None;
                self.mode = Mode::Idle;
                self.params_received = 0;
                self.emit(TransportEvent::Connected(self.config.device_id.clone()))
                    .await;
                // The firmware restarts on every connection.
                self.reply(IncomingMessage::ResetNotice).await;
            }
            Timer::Blink => {
                self.blinks += 1;
                self.reply(IncomingMessage::BlinkDetected).await;
                if self.debug {
                    let line = format!("blink {}", self.blinks).into_bytes();
                    self.reply(IncomingMessage::Debug(line)).await;
                }
                let every = self.config.stare_every;
                let stare = every > 0 && self.blinks % every == 0;
                let gap = if stare {
                    self.config.stare_duration
                } else {
                    self.config.blink_interval
                };
                self.blink_at = Some(Instant::now() + gap);
            }
            Timer::Sample => {
                let dt = self.config.sample_interval.as_secs_f64();
                self.phase += dt;
                self.reply(IncomingMessage::CalibrationData(calibration_signal(self.phase)))
                    .await;
                self.sample_at = Some(Instant::now() + self.config.sample_interval);
            }
        }
    }

    async fn on_write(&mut self, bytes: &[u8]) {
        if self.mode == Mode::Disconnected {
            warn!("sim: write of {} bytes without a link, ignored", bytes.len());
            return;
        }
        // One GATT write is one frame. A tag with a payload can only be a
        // parameter, a lone byte is a command.
        let context = if bytes.len() > 1 {
            TagContext::ProfileTransfer
        } else {
            TagContext::Command
        };
        let mut cursor = bytes;
        let msg = match decode_outgoing(&mut cursor, context) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("sim: rejecting write {bytes:02x?}: {e}");
                self.reply(IncomingMessage::ErrorException).await;
                return;
            }
        };
        debug!("sim -> {msg:?}");

        match msg {
            OutgoingMessage::CalibrationParameter(slot, value) => {
                self.parameters.set(slot, value);
                self.params_received += 1;
            }
            OutgoingMessage::SetParameters => {
                if self.params_received < PARAMETER_COUNT {
                    warn!(
                        "sim: SetParameters after only {} of {PARAMETER_COUNT} parameters",
                        self.params_received
                    );
                }
                debug!("sim: stored parameters {:?}", self.parameters.as_array());
                self.params_received = 0;
                self.stop_activity();
                self.mode = Mode::Idle;
                self.reply(IncomingMessage::ParametersAck).await;
            }
            OutgoingMessage::NormalMode => {
                self.reply(IncomingMessage::Alive).await;
                if self.mode != Mode::Detecting {
                    self.stop_activity();
                    self.mode = Mode::Detecting;
                    self.blink_at = Some(Instant::now() + self.config.blink_interval);
                }
            }
            OutgoingMessage::StartCalibration => {
                self.stop_activity();
                self.mode = Mode::Calibrating;
                self.phase = 0.0;
                self.sample_at = Some(Instant::now() + self.config.sample_interval);
            }
            OutgoingMessage::StopCalibration => {
                self.stop_activity();
                self.mode = Mode::Detecting;
                self.blink_at = Some(Instant::now() + self.config.blink_interval);
            }
            OutgoingMessage::RequestBatteryLevel => {
                let level = self.battery;
                self.battery = (self.battery - 0.5).max(0.0);
                self.reply(IncomingMessage::BatteryLevel(level)).await;
            }
            OutgoingMessage::StartDebug => self.debug = true,
            OutgoingMessage::StopDebug => self.debug = false,
            OutgoingMessage::Reset => debug!("sim: reset acknowledged"),
        }
    }

    fn stop_activity(&mut self) {
        self.blink_at = None;
        self.sample_at = None;
    }

    fn drop_link(&mut self) {
        self.stop_activity();
        self.link_up_at = None;
        self.mode = Mode::Disconnected;
        self.debug = false;
    }
}

/// Baseline sine with a sharp dip every 3 s, loosely shaped like an
/// eyelid sensor trace.
fn calibration_signal(t: f64) -> f32 {
    let baseline = 20.0 * (2.0 * PI * 0.25 * t).sin();
    let since_blink = t % 3.0;
    let dip = if since_blink < 0.3 {
        -120.0 * (PI * since_blink / 0.3).sin()
    } else {
        0.0
    };
    (baseline + dip) as f32
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run(mut fw: Firmware, mut commands: mpsc::UnboundedReceiver<SimCommand>) {
    loop {
        let next = fw.next_timer();
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => fw.handle(cmd).await,
                None => break,
            },
            _ = wait_until(next.map(|(at, _)| at)) => {
                if let Some((_, timer)) = next {
                    fw.fire(timer).await;
                }
            }
        }
        if fw.events.is_closed() {
            break;
        }
    }
    debug!("sim: firmware task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::spawn;
    use crate::manager::ManagerConfig;
    use crate::protocol::encode;
    use crate::types::{ConnectionState, Notification, UserProfile};

    async fn data(events: &mut mpsc::Receiver<TransportEvent>) -> IncomingMessage {
        match events.recv().await {
            Some(TransportEvent::DataReceived(bytes)) => {
                let mut cursor = bytes.as_slice();
                crate::protocol::decode(&mut cursor).unwrap()
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_handshake() {
        let config = SimConfig::default();
        let (mut sim, mut events) = SimulatedTransport::new(config.clone());

        sim.start_scan().unwrap();
        let Some(TransportEvent::Discovered { id, name, .. }) = events.recv().await else {
            panic!("expected discovery");
        };
        assert_eq!(name, "eyeDrops-Sim");

        sim.connect(&id).unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected(id)));
        assert_eq!(data(&mut events).await, IncomingMessage::ResetNotice);
        sim.write(&encode(&OutgoingMessage::Reset)).unwrap();

        for (slot, value) in CalibrationParameterSet::default().iter() {
            sim.write(&encode(&OutgoingMessage::CalibrationParameter(slot, value)))
                .unwrap();
        }
        sim.write(&encode(&OutgoingMessage::SetParameters)).unwrap();
        assert_eq!(data(&mut events).await, IncomingMessage::ParametersAck);

        sim.write(&encode(&OutgoingMessage::NormalMode)).unwrap();
        assert_eq!(data(&mut events).await, IncomingMessage::Alive);

        let start = Instant::now();
        assert_eq!(data(&mut events).await, IncomingMessage::BlinkDetected);
        assert_eq!(start.elapsed(), config.blink_interval);

        sim.write(&[0x10]).unwrap();
        assert_eq!(data(&mut events).await, IncomingMessage::BatteryLevel(87.0));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_fails_to_connect() {
        let (mut sim, mut events) = SimulatedTransport::new(SimConfig::default());
        let stranger = DeviceId::from("nope");
        sim.connect(&stranger).unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ConnectFailed(TransportError::UnknownDevice(
                stranger
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_stack_against_simulator() {
        let (sim, events) = SimulatedTransport::new(SimConfig::default());
        let config = ManagerConfig {
            battery_poll_interval: None,
            ..Default::default()
        };
        let (device, mut notes) = spawn(sim, events, config);
        device
            .set_profile(UserProfile::new(3, "sim", CalibrationParameterSet::default()))
            .await
            .unwrap();
        device.scan().await.unwrap();

        let Some(Notification::DeviceFound(found)) = notes.recv().await else {
            panic!("expected a device");
        };
        device.connect(found.id.clone()).await.unwrap();
        assert_eq!(
            notes.recv().await,
            Some(Notification::Connected {
                id: found.id,
                success: true
            })
        );
        // The boot-time reset makes the host send the profile twice; only the
        // first acknowledgement completes the transfer.
        assert_eq!(
            notes.recv().await,
            Some(Notification::ProfileSet { profile_id: 3 })
        );
        assert_eq!(device.state(), Some(ConnectionState::Normal));

        device.start_calibration().await.unwrap();
        for _ in 0..5 {
            assert!(matches!(
                notes.recv().await,
                Some(Notification::CalibrationSample(_))
            ));
        }
        assert_eq!(device.state(), Some(ConnectionState::Calibrating));
        device.stop_calibration().await.unwrap();

        // Five regular blinks, then a 40 s stare trips the 30 s timeout.
        loop {
            match notes.recv().await {
                Some(Notification::CalibrationSample(_)) | Some(Notification::CalibrationDone) => {}
                Some(Notification::BlurStart) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(device.enforced_blinks(), 1);
        assert_eq!(notes.recv().await, Some(Notification::BlurStop));
    }
}
