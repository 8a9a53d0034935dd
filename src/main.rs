use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use eyedrops_rs::ble::{BleConfig, BleTransport};
use eyedrops_rs::handle::{spawn, DeviceHandle};
use eyedrops_rs::manager::ManagerConfig;
use eyedrops_rs::profile::{
    create_profile, delete_profile, JsonProfileStore, MemoryProfileStore, ProfileStore,
};
use eyedrops_rs::sim::{SimConfig, SimulatedTransport};
use eyedrops_rs::transport::DeviceId;
use eyedrops_rs::types::{CalibrationParameterSet, Notification};

struct Args {
    simulate: bool,
    profiles: Option<PathBuf>,
    blink_timeout: Option<u64>,
    device: Option<DeviceId>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        simulate: false,
        profiles: None,
        blink_timeout: None,
        device: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--profiles" => {
                let path = it.next().ok_or_else(|| anyhow!("--profiles needs a path"))?;
                args.profiles = Some(path.into());
            }
            "--blink-timeout" => {
                let secs = it
                    .next()
                    .ok_or_else(|| anyhow!("--blink-timeout needs a value"))?;
                let secs = secs
                    .parse()
                    .with_context(|| format!("invalid --blink-timeout '{secs}'"))?;
                args.blink_timeout = Some(secs);
            }
            "--device" => {
                let id = it.next().ok_or_else(|| anyhow!("--device needs an id"))?;
                args.device = Some(DeviceId::new(id));
            }
            other => return Err(anyhow!("unknown argument '{other}'")),
        }
    }
    Ok(args)
}

fn print_help() {
    info!("Commands (type + Enter):");
    info!("  s        – scan for sensors");
    info!("  a        – abort scan");
    info!("  l        – list discovered sensors and profiles");
    info!("  c <n>    – connect to sensor #n from the list");
    info!("  d        – disconnect");
    info!("  p <id>   – activate profile <id>");
    info!("  n <name> – save the active parameters as a new profile");
    info!("  r <id>   – delete profile <id>");
    info!("  k / x    – start / stop calibration");
    info!("  b        – request battery level");
    info!("  u on|off – enable / disable blurring");
    info!("  g on|off – device debug output");
    info!("  i        – status");
    info!("  q        – quit\n");
}

type Store = Box<dyn ProfileStore + Send>;

async fn run_command(device: &DeviceHandle, store: &mut Store, line: &str) -> Result<()> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let arg = rest.split_whitespace().next();
    let on_off = |arg: Option<&str>| match arg {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err(anyhow!("expected 'on' or 'off'")),
    };

    match cmd {
        "s" => device.scan().await?,
        "a" => device.abort_scan().await?,
        "l" => {
            for (i, d) in device.discovered_devices().iter().enumerate() {
                println!("  #{i}  {}  {}  rssi={:?}", d.name, d.id, d.rssi);
            }
            for p in store.load()? {
                println!("  profile {}  {}", p.id, p.name);
            }
        }
        "c" => {
            let index: usize = arg
                .ok_or_else(|| anyhow!("usage: c <n>"))?
                .parse()
                .context("sensor number")?;
            let found = device.discovered_devices();
            let target = found
                .get(index)
                .ok_or_else(|| anyhow!("no sensor #{index}; run 's' then 'l'"))?;
            device.connect(target.id.clone()).await?;
        }
        "d" => device.disconnect().await?,
        "p" => {
            let id: u32 = arg
                .ok_or_else(|| anyhow!("usage: p <id>"))?
                .parse()
                .context("profile id")?;
            let profile = store
                .load()?
                .into_iter()
                .find(|p| p.id == id)
                .ok_or_else(|| anyhow!("no profile {id}"))?;
            device.set_profile(profile).await?;
        }
        "n" => {
            if rest.is_empty() {
                return Err(anyhow!("usage: n <name>"));
            }
            let parameters = device
                .active_profile()
                .map(|p| p.parameters)
                .unwrap_or_default();
            let profile = create_profile(store.as_mut(), rest, parameters)?;
            println!("  profile {}  {}  saved", profile.id, profile.name);
        }
        "r" => {
            let id: u32 = arg
                .ok_or_else(|| anyhow!("usage: r <id>"))?
                .parse()
                .context("profile id")?;
            if !delete_profile(store.as_mut(), id)? {
                return Err(anyhow!("no profile {id}"));
            }
            println!("  profile {id} deleted");
        }
        "k" => device.start_calibration().await?,
        "x" => device.stop_calibration().await?,
        "b" => device.request_battery_level().await?,
        "u" => device.set_blurring_enabled(on_off(arg)?).await?,
        "g" => device.set_debug(on_off(arg)?).await?,
        "i" => {
            let s = device.status();
            println!(
                "[STATUS] device={:?} state={:?} enforced_blinks={} battery={:?} profile={:?}",
                s.connected_device.map(|d| d.to_string()),
                s.state,
                s.enforced_blinks,
                s.battery_level,
                s.active_profile.map(|p| p.name),
            );
        }
        "h" | "?" => print_help(),
        other => return Err(anyhow!("unknown command '{other}'")),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=eyedrops_rs=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;

    // ── Profiles ──────────────────────────────────────────────────────────────
    // The simulator only touches the profile file when it already exists.
    let path = args.profiles.or_else(JsonProfileStore::default_path);
    let mut store: Store = match path {
        Some(path) if !args.simulate || path.exists() => {
            info!("Profiles: {}", path.display());
            Box::new(JsonProfileStore::new(path))
        }
        _ => Box::new(MemoryProfileStore::default()),
    };
    let profiles = store.load().context("loading profiles")?;
    let initial = match profiles.into_iter().next() {
        Some(profile) => profile,
        None => create_profile(store.as_mut(), "default", CalibrationParameterSet::default())?,
    };

    // ── Device manager ────────────────────────────────────────────────────────
    let mut config = ManagerConfig {
        auto_connect: args.device,
        ..Default::default()
    };
    if let Some(secs) = args.blink_timeout {
        config.blink_timeout = Duration::from_secs(secs);
    }

    let (device, mut notes) = if args.simulate {
        info!("Using the simulated sensor.");
        let (transport, events) = SimulatedTransport::new(SimConfig::default());
        spawn(transport, events, config)
    } else {
        let (transport, events) = BleTransport::start(BleConfig::default());
        spawn(transport, events, config)
    };

    device.set_profile(initial).await?;
    device.scan().await?;
    print_help();

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread and relayed to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let device_cmd = device.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            if line == "q" {
                info!("Quit requested.");
                device_cmd.disconnect().await.ok();
                std::process::exit(0);
            }
            if let Err(e) = run_command(&device_cmd, &mut store, &line).await {
                error!("{e:#}");
            }
        }
    });

    // ── Notification loop ─────────────────────────────────────────────────────
    let mut samples: Vec<f32> = Vec::new();
    while let Some(note) = notes.recv().await {
        match note {
            Notification::DeviceFound(d) => {
                println!(
                    "[FOUND] {} ({}) rssi={:?}  – 'l' lists, 'c <n>' connects",
                    d.name, d.id, d.rssi
                );
            }
            Notification::Connected { id, success: true } => info!("✅  Connected to: {id}"),
            Notification::Connected { id, success: false } => warn!("Could not connect to {id}"),
            Notification::Disconnected => info!("❌  Disconnected from device."),
            Notification::ProfileSet { profile_id } => info!("Profile {profile_id} active"),
            Notification::CalibrationSample(v) => {
                samples.push(v);
                println!("[CAL] {v:+9.3}");
            }
            Notification::CalibrationDone => {
                let min = samples.iter().copied().fold(f32::INFINITY, f32::min);
                let max = samples.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                info!("Calibration done: {} samples, min={min:.3} max={max:.3}", samples.len());
                samples.clear();
            }
            Notification::BleUnsupported => {
                error!("Bluetooth LE is not available on this host (try --simulate).");
            }
            Notification::BlurStart => println!("[BLUR]   ░░░ blink! ░░░"),
            Notification::BlurStop => println!("[UNBLUR] thanks"),
            Notification::BatteryLevel(level) => println!("[BATTERY] {level:.1}%"),
            Notification::DeviceError => warn!("The sensor reported an error."),
            Notification::Debug(data) => {
                println!("[DEBUG] {}", String::from_utf8_lossy(&data));
            }
        }
    }

    info!("Notification stream closed – exiting.");
    Ok(())
}
