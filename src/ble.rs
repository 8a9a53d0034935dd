//! btleplug-backed [`Transport`] for real RFduino sensors.
//!
//! [`BleTransport::start`] spawns one task that owns the btleplug `Manager`
//! and `Adapter`. The [`Transport`] methods only enqueue commands; everything
//! that happens on the radio comes back as [`TransportEvent`]s.
//!
//! Connecting runs on a separate task (BlueZ can take seconds to resolve
//! services), so scanning results, a `disconnect` request or incoming data
//! are never held up by a slow connect.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{
    DISCONNECT_CHARACTERISTIC, RECEIVE_CHARACTERISTIC, SEND_CHARACTERISTIC, SERVICE_UUID,
};
use crate::transport::{DeviceId, Transport, TransportEvent};

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

// ── BleConfig ─────────────────────────────────────────────────────────────────

/// Configuration for [`BleTransport`].
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Peripherals advertising [`SERVICE_UUID`] always match. Others match
    /// when their advertised name starts with this string.
    /// Default: `"RFduino"`.
    pub name_prefix: String,
    /// Hard limit on `Peripheral::connect`. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Hard limit on GATT service discovery after connecting. Default: `15`.
    pub discovery_timeout_secs: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name_prefix: "RFduino".into(),
            connect_timeout_secs: 10,
            discovery_timeout_secs: 15,
        }
    }
}

// ── BleTransport ──────────────────────────────────────────────────────────────

#[derive(Debug)]
enum BleCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect,
    Write(Vec<u8>),
}

/// Bluetooth LE link to an eyeDrops sensor.
pub struct BleTransport {
    commands: mpsc::UnboundedSender<BleCommand>,
}

impl BleTransport {
    /// Spawn the BLE task. A missing or powered-off adapter is reported as
    /// [`TransportEvent::BleUnavailable`] on the returned channel.
    pub fn start(config: BleConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(run(config, cmd_rx, event_tx));
        (Self { commands: cmd_tx }, event_rx)
    }

    fn send(&self, cmd: BleCommand) -> Result<(), TransportError> {
        self.commands.send(cmd).map_err(|_| TransportError::Closed)
    }
}

impl Transport for BleTransport {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.send(BleCommand::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.send(BleCommand::StopScan)
    }

    fn connect(&mut self, id: &DeviceId) -> Result<(), TransportError> {
        self.send(BleCommand::Connect(id.clone()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.send(BleCommand::Disconnect)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(BleCommand::Write(bytes.to_vec()))
    }
}

// ── Adapter setup ─────────────────────────────────────────────────────────────

async fn open_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

    // CBCentralManager starts out in an "unknown" state; scanning before it
    // reports PoweredOn is a silent no-op.
    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => {
                    info!("macOS: adapter is PoweredOn");
                    break;
                }
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    return Err(anyhow!("adapter still {state:?} after 3 s"));
                }
                Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(adapter)
}

// ── Connection ────────────────────────────────────────────────────────────────

struct Link {
    id: DeviceId,
    peripheral: Peripheral,
    send_char: Characteristic,
    disconnect_char: Option<Characteristic>,
}

type ConnectTask = JoinHandle<Result<(Link, NotificationStream)>>;

async fn open_link(
    peripheral: Peripheral,
    id: DeviceId,
    config: BleConfig,
) -> Result<(Link, NotificationStream)> {
    // BlueZ's Device1.Connect can block forever when the device is out of
    // range.
    tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), peripheral.connect())
        .await
        .map_err(|_| anyhow!("BLE connect() timed out after {} s", config.connect_timeout_secs))??;

    // BlueZ signals the connection before the GATT cache is populated.
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    tokio::time::timeout(
        Duration::from_secs(config.discovery_timeout_secs),
        peripheral.discover_services(),
    )
    .await
    .map_err(|_| {
        anyhow!(
            "discover_services() timed out after {} s",
            config.discovery_timeout_secs
        )
    })??;

    let chars = peripheral.characteristics();
    let find_char = |uuid: Uuid| -> Result<Characteristic> {
        chars
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
    };
    let receive_char = find_char(RECEIVE_CHARACTERISTIC)?;
    let send_char = find_char(SEND_CHARACTERISTIC)?;
    let disconnect_char = find_char(DISCONNECT_CHARACTERISTIC).ok();

    peripheral.subscribe(&receive_char).await?;
    let notifications = peripheral.notifications().await?;
    info!("{id}: connected, receive characteristic subscribed");

    let link = Link {
        id,
        peripheral,
        send_char,
        disconnect_char,
    };
    Ok((link, notifications))
}

async fn close_link(link: Link) {
    // Any write here makes the RFduino drop the link from its side.
    if let Some(c) = &link.disconnect_char {
        if let Err(e) = link.peripheral.write(c, &[0], WriteType::WithoutResponse).await {
            debug!("{}: disconnect characteristic write failed: {e}", link.id);
        }
    }
    if let Err(e) = link.peripheral.disconnect().await {
        warn!("{}: disconnect failed: {e}", link.id);
    }
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<ValueNotification> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn connect_result(
    task: &mut Option<(DeviceId, ConnectTask)>,
) -> (DeviceId, Result<(Link, NotificationStream)>) {
    match task {
        Some((id, handle)) => {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow!("connect task failed: {e}")),
            };
            (id.clone(), result)
        }
        None => std::future::pending().await,
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct BleTask {
    config: BleConfig,
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    scanning: bool,
    known: HashMap<DeviceId, Peripheral>,
    link: Option<Link>,
    notifications: Option<NotificationStream>,
    connecting: Option<(DeviceId, ConnectTask)>,
}

impl BleTask {
    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    async fn handle(&mut self, cmd: BleCommand) {
        match cmd {
            BleCommand::StartScan => {
                self.known.clear();
                match self.adapter.start_scan(ScanFilter::default()).await {
                    Ok(()) => {
                        self.scanning = true;
                        info!("scanning for sensors");
                    }
                    Err(e) => self.emit(TransportEvent::BleUnavailable(e.to_string())).await,
                }
            }
            BleCommand::StopScan => {
                self.scanning = false;
                if let Err(e) = self.adapter.stop_scan().await {
                    debug!("stop_scan: {e}");
                }
            }
            BleCommand::Connect(id) => {
                if self.link.is_some() || self.connecting.is_some() {
                    let err = TransportError::Connect("a connection already exists".into());
                    self.emit(TransportEvent::ConnectFailed(err)).await;
                    return;
                }
                let Some(peripheral) = self.known.get(&id).cloned() else {
                    self.emit(TransportEvent::ConnectFailed(TransportError::UnknownDevice(id)))
                        .await;
                    return;
                };
                info!("{id}: connecting…");
                let task = tokio::spawn(open_link(peripheral, id.clone(), self.config.clone()));
                self.connecting = Some((id, task));
            }
            BleCommand::Disconnect => {
                if let Some((id, task)) = self.connecting.take() {
                    info!("{id}: connect cancelled");
                    task.abort();
                    if let Some(p) = self.known.get(&id).cloned() {
                        tokio::spawn(async move {
                            let _ = p.disconnect().await;
                        });
                    }
                }
                self.notifications = None;
                if let Some(link) = self.link.take() {
                    info!("{}: disconnecting", link.id);
                    close_link(link).await;
                    self.emit(TransportEvent::Disconnected).await;
                }
            }
            BleCommand::Write(bytes) => match &self.link {
                Some(link) => {
                    if let Err(e) = link
                        .peripheral
                        .write(&link.send_char, &bytes, WriteType::WithoutResponse)
                        .await
                    {
                        warn!("{}: write {bytes:02x?} failed: {e}", link.id);
                    }
                }
                None => debug!("write of {} bytes without a link, dropped", bytes.len()),
            },
        }
    }

    async fn on_central(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                if !self.scanning {
                    return;
                }
                let Ok(peripheral) = self.adapter.peripheral(&pid).await else {
                    return;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    return;
                };
                let name = props.local_name.unwrap_or_else(|| "Unknown".into());
                let matches = props.services.contains(&SERVICE_UUID)
                    || name.starts_with(&self.config.name_prefix);
                if !matches {
                    return;
                }
                let id = DeviceId::new(pid.to_string());
                debug!("discovered {name} id={id} rssi={:?}", props.rssi);
                self.known.insert(id.clone(), peripheral);
                self.emit(TransportEvent::Discovered {
                    id,
                    name,
                    rssi: props.rssi,
                })
                .await;
            }
            CentralEvent::DeviceDisconnected(pid) => {
                let ours = self
                    .link
                    .as_ref()
                    .is_some_and(|l| l.peripheral.id() == pid);
                if ours {
                    info!("device {pid:?} disconnected");
                    self.link = None;
                    self.notifications = None;
                    self.emit(TransportEvent::Disconnected).await;
                }
            }
            _ => {}
        }
    }

    async fn on_connect_result(
        &mut self,
        id: DeviceId,
        result: Result<(Link, NotificationStream)>,
    ) {
        match result {
            Ok((link, notifications)) => {
                self.link = Some(link);
                self.notifications = Some(notifications);
                self.emit(TransportEvent::Connected(id)).await;
            }
            Err(e) => {
                warn!("{id}: connect failed: {e:#}");
                self.emit(TransportEvent::ConnectFailed(TransportError::Connect(format!("{e:#}"))))
                    .await;
            }
        }
    }
}

async fn run(
    config: BleConfig,
    mut commands: mpsc::UnboundedReceiver<BleCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let setup = async {
        let adapter = open_adapter().await?;
        let central = adapter.events().await?;
        Ok::<_, anyhow::Error>((adapter, central))
    };
    let (adapter, mut central) = match setup.await {
        Ok(ok) => ok,
        Err(e) => {
            warn!("Bluetooth LE unavailable: {e:#}");
            let reason = format!("{e:#}");
            let _ = events.send(TransportEvent::BleUnavailable(reason.clone())).await;
            unavailable(commands, events, reason).await;
            return;
        }
    };

    let mut task = BleTask {
        config,
        adapter,
        events,
        scanning: false,
        known: HashMap::new(),
        link: None,
        notifications: None,
        connecting: None,
    };

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => task.handle(cmd).await,
                None => break,
            },
            Some(event) = central.next() => task.on_central(event).await,
            (id, result) = connect_result(&mut task.connecting) => {
                task.connecting = None;
                task.on_connect_result(id, result).await;
            }
            notification = next_notification(&mut task.notifications) => match notification {
                Some(n) if n.uuid == RECEIVE_CHARACTERISTIC => {
                    task.emit(TransportEvent::DataReceived(n.value)).await;
                }
                Some(n) => debug!("notification from unexpected characteristic {}", n.uuid),
                None => {
                    task.notifications = None;
                    if let Some(link) = task.link.take() {
                        info!("{}: notification stream ended", link.id);
                        task.emit(TransportEvent::Disconnected).await;
                    }
                }
            },
        }
    }

    if let Some(link) = task.link.take() {
        close_link(link).await;
    }
    debug!("BLE task stopped");
}

/// Keep answering commands after adapter setup failed.
async fn unavailable(
    mut commands: mpsc::UnboundedReceiver<BleCommand>,
    events: mpsc::Sender<TransportEvent>,
    reason: String,
) {
    while let Some(cmd) = commands.recv().await {
        let event = match cmd {
            BleCommand::StartScan => TransportEvent::BleUnavailable(reason.clone()),
            BleCommand::Connect(_) => {
                TransportEvent::ConnectFailed(TransportError::Unavailable(reason.clone()))
            }
            _ => continue,
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
