//! [`PowerSupplyBackend`] – batteries and AC adapters from the Linux
//! `power_supply` class directory.
//!
//! Every entry under the root (normally `/sys/class/power_supply`) is a
//! directory of one-value attribute files.  The backend reads the whole tree
//! on a blocking thread, bounded by an I/O timeout, and diffs successive
//! snapshots into canonical change events from a polling task.
//!
//! | `type` file | Capability | Notes |
//! |---|---|---|
//! | `Battery` | Battery | `scope = Device` marks a peripheral battery |
//! | `UPS` | Battery | `type` = `Ups` |
//! | `Mains` | GenericInterface | `onBattery` = not `online` |
//!
//! Other supply types (USB, wireless) are ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hwhub_registry::{BackendAdapter, EventSink};
use hwhub_types::{
    BatteryType, Capability, CapabilitySet, ChargeState, DeviceId, HubError,
    PropertyMap, PropertyValue, Technology, charge_percent,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::snapshot::{Entry, Snapshot, changes_between};

/// Identifier root of every power-supply device.
pub const POWER_SUPPLY_UDI_ROOT: &str = "/org/hwhub/power_supply";

/// Consecutive failed scans after which the backend reports itself failed.
const MAX_FAILED_SCANS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PowerSupplyConfig {
    pub root: PathBuf,
    pub poll_interval: Duration,
    /// Upper bound on one full read of the tree.
    pub io_timeout: Duration,
}

impl Default for PowerSupplyConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/class/power_supply"),
            poll_interval: Duration::from_secs(5),
            io_timeout: Duration::from_secs(1),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Native vocabulary
// ────────────────────────────────────────────────────────────────────────────

fn map_status(status: &str) -> ChargeState {
    match status {
        "Charging" => ChargeState::Charging,
        "Discharging" => ChargeState::Discharging,
        "Full" => ChargeState::FullyCharged,
        _ => ChargeState::NoCharge,
    }
}

fn map_technology(technology: &str) -> Technology {
    match technology {
        "Li-ion" => Technology::LithiumIon,
        "Li-poly" => Technology::LithiumPolymer,
        "LiFe" => Technology::LithiumIronPhosphate,
        "NiCd" => Technology::NickelCadmium,
        "NiMH" => Technology::NickelMetalHydride,
        _ => Technology::Unknown,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tree reading (blocking)
// ────────────────────────────────────────────────────────────────────────────

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name))
        .ok()
        .map(|text| text.trim().to_string())
}

fn read_int(dir: &Path, name: &str) -> Option<i64> {
    read_attr(dir, name)?.parse().ok()
}

/// Micro-units (µWh, µW, µV) to base units.
fn read_micro(dir: &Path, name: &str) -> Option<f64> {
    read_int(dir, name).map(|value| value as f64 / 1_000_000.0)
}

fn battery_properties(dir: &Path, ups: bool) -> PropertyMap {
    let mut props = PropertyMap::new();
    let state = map_status(read_attr(dir, "status").as_deref().unwrap_or_default());
    let peripheral = read_attr(dir, "scope").is_some_and(|scope| scope == "Device");
    let kind = match (ups, peripheral) {
        (true, _) => BatteryType::Ups,
        (false, true) => BatteryType::Unknown,
        (false, false) => BatteryType::Primary,
    };

    props.insert("isPresent".into(), (read_int(dir, "present").unwrap_or(1) == 1).into());
    props.insert("type".into(), kind.as_str().into());
    props.insert("chargeState".into(), state.as_str().into());
    props.insert("isRechargeable".into(), true.into());
    props.insert("isPowerSupply".into(), (!peripheral).into());
    props.insert("isRecalled".into(), false.into());

    let technology = map_technology(read_attr(dir, "technology").as_deref().unwrap_or_default());
    props.insert("technology".into(), technology.as_str().into());

    let energy_now = read_int(dir, "energy_now");
    let energy_full = read_int(dir, "energy_full");
    let energy_full_design = read_int(dir, "energy_full_design");
    let percent = match (energy_now, energy_full) {
        (Some(now), Some(full)) => charge_percent(now, full),
        _ => match (read_int(dir, "charge_now"), read_int(dir, "charge_full")) {
            (Some(now), Some(full)) => charge_percent(now, full),
            _ => read_int(dir, "capacity").map(|c| c.clamp(0, 100) as u8),
        },
    };
    if let Some(percent) = percent {
        props.insert("chargePercent".into(), PropertyValue::Int(percent.into()));
    }
    if let (Some(full), Some(design)) = (energy_full, energy_full_design) {
        if let Some(health) = charge_percent(full, design) {
            props.insert("capacity".into(), PropertyValue::Int(health.into()));
        }
    }

    for (file, key) in [
        ("energy_now", "energy"),
        ("energy_full", "energyFull"),
        ("energy_full_design", "energyFullDesign"),
        ("power_now", "energyRate"),
        ("voltage_now", "voltage"),
    ] {
        if let Some(value) = read_micro(dir, file) {
            props.insert(key.into(), value.into());
        }
    }
    // Tenths of a degree Celsius.
    if let Some(temp) = read_int(dir, "temp") {
        props.insert("temperature".into(), (temp as f64 / 10.0).into());
    }

    let to_empty = read_int(dir, "time_to_empty_now").unwrap_or(0);
    let to_full = read_int(dir, "time_to_full_now").unwrap_or(0);
    props.insert("timeToEmpty".into(), to_empty.into());
    props.insert("timeToFull".into(), to_full.into());
    let remaining = match state {
        ChargeState::Discharging => to_empty,
        ChargeState::Charging => to_full,
        _ => 0,
    };
    props.insert("remainingTime".into(), remaining.into());

    props.insert(
        "serial".into(),
        read_attr(dir, "serial_number").unwrap_or_default().into(),
    );
    props
}

fn scan(root: &Path) -> Result<Snapshot, HubError> {
    let mut snapshot = Snapshot::new();
    for entry in std::fs::read_dir(root)? {
        let dir = entry?.path();
        let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let id = DeviceId::new(format!("{POWER_SUPPLY_UDI_ROOT}/{name}"));
        let entry = match read_attr(&dir, "type").as_deref() {
            Some(kind @ ("Battery" | "UPS")) => Entry {
                capabilities: [Capability::Battery].into_iter().collect(),
                properties: battery_properties(&dir, kind == "UPS"),
            },
            Some("Mains") => {
                let online = read_int(&dir, "online").unwrap_or(0) == 1;
                let mut properties = PropertyMap::new();
                properties.insert("onBattery".into(), (!online).into());
                Entry {
                    capabilities: [Capability::GenericInterface].into_iter().collect(),
                    properties,
                }
            }
            _ => continue,
        };
        snapshot.insert(id, entry);
    }
    Ok(snapshot)
}

async fn scan_bounded(root: PathBuf, io_timeout: Duration) -> Result<Snapshot, HubError> {
    let operation = format!("reading {}", root.display());
    match tokio::time::timeout(io_timeout, tokio::task::spawn_blocking(move || scan(&root))).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(HubError::Backend {
            backend: "power_supply".to_string(),
            details: join.to_string(),
        }),
        Err(_) => Err(HubError::Timeout {
            operation,
            after_ms: io_timeout.as_millis() as u64,
        }),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PowerSupplyBackend
// ────────────────────────────────────────────────────────────────────────────

pub struct PowerSupplyBackend {
    config: PowerSupplyConfig,
    snapshot: Arc<Mutex<Snapshot>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl PowerSupplyBackend {
    pub fn new(config: PowerSupplyConfig) -> Self {
        Self {
            config,
            snapshot: Arc::new(Mutex::new(Snapshot::new())),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PowerSupplyConfig {
        &self.config
    }

    fn entry<R>(&self, id: &DeviceId, f: impl FnOnce(&Entry) -> R) -> Result<R, HubError> {
        self.snapshot
            .lock()
            .get(id)
            .map(f)
            .ok_or_else(|| HubError::DeviceNotFound(id.clone()))
    }
}

async fn poll(config: PowerSupplyConfig, snapshot: Arc<Mutex<Snapshot>>, sink: EventSink) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.tick().await;
    let mut failures = 0;
    loop {
        ticker.tick().await;
        let fresh = match scan_bounded(config.root.clone(), config.io_timeout).await {
            Ok(fresh) => {
                failures = 0;
                fresh
            }
            Err(err) => {
                failures += 1;
                warn!(backend = "power_supply", error = %err, failures, "scan failed");
                if failures >= MAX_FAILED_SCANS {
                    let _ = sink.report_failure(err.to_string());
                    return;
                }
                continue;
            }
        };

        let events = {
            let mut current = snapshot.lock();
            let events = changes_between(&current, &fresh);
            // The registry reads the new state while applying these events.
            *current = fresh;
            events
        };
        for event in events {
            debug!(backend = "power_supply", device = %event.id(), "power supply change");
            if sink.emit(event).is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for PowerSupplyBackend {
    fn name(&self) -> &str {
        "power_supply"
    }

    async fn start(&self, sink: EventSink) -> Result<(), HubError> {
        let initial = scan_bounded(self.config.root.clone(), self.config.io_timeout).await?;
        info!(
            backend = "power_supply",
            root = %self.config.root.display(),
            devices = initial.len(),
            "power supply backend started"
        );
        *self.snapshot.lock() = initial;
        let task = tokio::spawn(poll(self.config.clone(), Arc::clone(&self.snapshot), sink));
        *self.poller.lock() = Some(task);
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.poller.lock().take() {
            task.abort();
            debug!(backend = "power_supply", "poller stopped");
        }
    }

    fn list_devices(&self) -> Result<Vec<DeviceId>, HubError> {
        Ok(self.snapshot.lock().keys().cloned().collect())
    }

    fn resolve_interfaces(&self, id: &DeviceId) -> Result<CapabilitySet, HubError> {
        self.entry(id, |entry| entry.capabilities.clone())
    }

    fn properties(&self, id: &DeviceId) -> Result<PropertyMap, HubError> {
        self.entry(id, |entry| entry.properties.clone())
    }
}

impl Drop for PowerSupplyBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
