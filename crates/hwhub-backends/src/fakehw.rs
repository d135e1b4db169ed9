//! [`FakeBackend`] – in-memory conformance fixture.
//!
//! Devices carry *native* properties, spelled the way a real power daemon
//! would report them, and the backend normalizes them on every read.  This
//! keeps the normalization rule under test alongside the registry.
//!
//! # Native vocabulary
//!
//! | Native key | Canonical key | Mapping |
//! |---|---|---|
//! | `batteryType` | `type` | `pda`, `ups`, `primary`, `mouse`, `keyboard`, `keyboard_mouse`, `camera`, else `Unknown` |
//! | `chargeState` | `chargeState` | `charging`, `discharging`, `fullyCharged`, else `NoCharge` |
//! | `technology` | `technology` | integer code (see [`Technology::from_code`]) |
//! | `currentLevel` + `lastFullLevel` | `chargePercent` | [`charge_percent`]; omitted when not available |
//!
//! Every other key passes through unchanged.
//!
//! # Fixture format
//!
//! ```toml
//! [[device]]
//! udi = "acpi_BAT0"
//! interfaces = ["Battery"]
//!
//! [device.properties]
//! isPresent = true
//! chargeState = "discharging"
//! currentLevel = 50
//! lastFullLevel = 100
//! ```

use std::path::Path;

use async_trait::async_trait;
use hwhub_registry::{BackendAdapter, EventSink};
use hwhub_types::{
    BatteryType, Capability, CapabilitySet, ChangeEvent, ChargeState, DeviceId, HubError,
    PropertyMap, PropertyValue, Technology, charge_percent,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::snapshot::property_diff;

/// Identifier root of every fake device.
pub const FAKEHW_UDI_ROOT: &str = "/org/hwhub/fakehw";

// ────────────────────────────────────────────────────────────────────────────
// FakeDevice
// ────────────────────────────────────────────────────────────────────────────

/// One fake device: identifier, capability set and native properties.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeDevice {
    id: DeviceId,
    capabilities: CapabilitySet,
    native: PropertyMap,
}

impl FakeDevice {
    /// `udi` is taken verbatim when absolute, otherwise placed under
    /// [`FAKEHW_UDI_ROOT`].
    pub fn new(udi: &str) -> Self {
        let id = if udi.starts_with('/') {
            DeviceId::new(udi)
        } else {
            DeviceId::new(format!("{FAKEHW_UDI_ROOT}/{udi}"))
        };
        Self {
            id,
            capabilities: CapabilitySet::new(),
            native: PropertyMap::new(),
        }
    }

    pub fn with_interface(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.native.insert(key.to_string(), value.into());
        self
    }

    /// A laptop battery half way through discharging.
    pub fn laptop_battery(udi: &str) -> Self {
        Self::new(udi)
            .with_interface(Capability::Battery)
            .with_property("isPresent", true)
            .with_property("batteryType", "primary")
            .with_property("chargeState", "discharging")
            .with_property("currentLevel", 50)
            .with_property("lastFullLevel", 100)
            .with_property("technology", 1)
            .with_property("isRechargeable", true)
            .with_property("isPowerSupply", true)
    }

    /// An AC adapter exposing `onBattery` through the generic interface.
    pub fn ac_adapter(udi: &str) -> Self {
        Self::new(udi)
            .with_interface(Capability::GenericInterface)
            .with_property("onBattery", false)
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Canonical view of the native properties.
    pub fn normalized(&self) -> PropertyMap {
        normalize(&self.native)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Normalization
// ────────────────────────────────────────────────────────────────────────────

fn native_battery_type(name: &str) -> BatteryType {
    match name {
        "pda" => BatteryType::Pda,
        "ups" => BatteryType::Ups,
        "primary" => BatteryType::Primary,
        "mouse" => BatteryType::Mouse,
        "keyboard" => BatteryType::Keyboard,
        "keyboard_mouse" => BatteryType::KeyboardMouse,
        "camera" => BatteryType::Camera,
        other => other.parse().unwrap_or(BatteryType::Unknown),
    }
}

fn native_charge_state(name: &str) -> ChargeState {
    match name {
        "charging" => ChargeState::Charging,
        "discharging" => ChargeState::Discharging,
        "fullyCharged" => ChargeState::FullyCharged,
        other => other.parse().unwrap_or(ChargeState::NoCharge),
    }
}

fn native_charge_state_name(state: ChargeState) -> &'static str {
    match state {
        ChargeState::Charging => "charging",
        ChargeState::Discharging => "discharging",
        ChargeState::FullyCharged => "fullyCharged",
        ChargeState::NoCharge => "noCharge",
    }
}

fn normalize(native: &PropertyMap) -> PropertyMap {
    let mut canonical = PropertyMap::new();
    for (key, value) in native {
        match key.as_str() {
            "batteryType" => {
                let kind = native_battery_type(value.as_text().unwrap_or_default());
                canonical.insert("type".to_string(), kind.as_str().into());
            }
            "chargeState" => {
                let state = native_charge_state(value.as_text().unwrap_or_default());
                canonical.insert(key.clone(), state.as_str().into());
            }
            "technology" => {
                let technology = match value {
                    PropertyValue::Int(code) => Technology::from_code(*code),
                    PropertyValue::Text(name) => name.parse().unwrap_or(Technology::Unknown),
                    _ => Technology::Unknown,
                };
                canonical.insert(key.clone(), technology.as_str().into());
            }
            "currentLevel" | "lastFullLevel" => {}
            _ => {
                canonical.insert(key.clone(), value.clone());
            }
        }
    }

    let level = |key: &str| native.get(key).and_then(PropertyValue::as_int);
    if let (Some(current), Some(last_full)) = (level("currentLevel"), level("lastFullLevel")) {
        if let Some(percent) = charge_percent(current, last_full) {
            canonical.insert("chargePercent".to_string(), PropertyValue::Int(percent.into()));
        }
    }
    canonical
}

// ────────────────────────────────────────────────────────────────────────────
// Fixture
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default, rename = "device")]
    devices: Vec<FixtureDevice>,
}

#[derive(Debug, Deserialize)]
struct FixtureDevice {
    udi: String,
    #[serde(default)]
    interfaces: Vec<String>,
    #[serde(default)]
    properties: PropertyMap,
}

impl TryFrom<FixtureDevice> for FakeDevice {
    type Error = HubError;

    fn try_from(entry: FixtureDevice) -> Result<Self, Self::Error> {
        let mut device = FakeDevice::new(&entry.udi);
        for name in &entry.interfaces {
            let capability = name
                .parse::<Capability>()
                .map_err(|e| HubError::Config(format!("device '{}': {e}", entry.udi)))?;
            device.capabilities.insert(capability);
        }
        device.native = entry.properties;
        Ok(device)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FakeBackend
// ────────────────────────────────────────────────────────────────────────────

/// In-memory backend with synthetic event injection.
///
/// Injection methods mutate the device table and, once the backend has been
/// started by a registry, emit the matching canonical events.  Before start
/// they only mutate state; registration picks the devices up.
pub struct FakeBackend {
    name: String,
    devices: Mutex<Vec<FakeDevice>>,
    sink: Mutex<Option<EventSink>>,
    start_failure: Option<String>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::named("fakehw")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            devices: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            start_failure: None,
        }
    }

    pub fn with_device(self, device: FakeDevice) -> Self {
        self.devices.lock().push(device);
        self
    }

    /// Make [`BackendAdapter::start`] fail with `reason`.
    pub fn failing_start(mut self, reason: impl Into<String>) -> Self {
        self.start_failure = Some(reason.into());
        self
    }

    /// Build a backend from a TOML fixture string.
    pub fn from_toml_str(text: &str) -> Result<Self, HubError> {
        let fixture: Fixture =
            toml::from_str(text).map_err(|e| HubError::Config(format!("fake fixture: {e}")))?;
        let backend = Self::new();
        for entry in fixture.devices {
            backend.devices.lock().push(FakeDevice::try_from(entry)?);
        }
        Ok(backend)
    }

    /// Build a backend from a TOML fixture file.
    pub fn from_fixture(path: &Path) -> Result<Self, HubError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn is_started(&self) -> bool {
        self.sink.lock().is_some()
    }

    // -----------------------------------------------------------------------
    // Injection
    // -----------------------------------------------------------------------

    /// Plug a device in.
    pub fn add_device(&self, device: FakeDevice) -> Result<(), HubError> {
        let id = device.id.clone();
        {
            let mut devices = self.devices.lock();
            if devices.iter().any(|known| known.id == id) {
                return Err(HubError::Backend {
                    backend: self.name.clone(),
                    details: format!("device '{id}' already exists"),
                });
            }
            devices.push(device);
        }
        self.emit(ChangeEvent::DeviceAdded { id })
    }

    /// Unplug a device.
    pub fn remove_device(&self, id: &DeviceId) -> Result<(), HubError> {
        {
            let mut devices = self.devices.lock();
            let before = devices.len();
            devices.retain(|known| &known.id != id);
            if devices.len() == before {
                return Err(HubError::DeviceNotFound(id.clone()));
            }
        }
        self.emit(ChangeEvent::DeviceRemoved { id: id.clone() })
    }

    /// Set a native property and emit one `PropertyChanged` carrying every
    /// canonical key whose value changed or disappeared.  Nothing is emitted
    /// when the canonical view is unaffected.
    pub fn set_native_property(
        &self,
        id: &DeviceId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), HubError> {
        let diff = {
            let mut devices = self.devices.lock();
            let device = devices
                .iter_mut()
                .find(|known| &known.id == id)
                .ok_or_else(|| HubError::DeviceNotFound(id.clone()))?;
            let before = device.normalized();
            device.native.insert(key.to_string(), value);
            property_diff(id, &before, &device.normalized())
        };
        let Some(event) = diff else {
            return Ok(());
        };
        debug!(backend = %self.name, device = %id, "fake property change");
        self.emit(event)
    }

    /// Flip the `onBattery` flag of the first AC adapter.
    pub fn set_on_battery(&self, on_battery: bool) -> Result<(), HubError> {
        let adapter = self
            .devices
            .lock()
            .iter()
            .find(|device| device.native.contains_key("onBattery"))
            .map(|device| device.id.clone())
            .ok_or_else(|| HubError::Backend {
                backend: self.name.clone(),
                details: "no AC adapter device".to_string(),
            })?;
        self.set_native_property(&adapter, "onBattery", on_battery.into())
    }

    pub fn set_charge_state(&self, id: &DeviceId, state: ChargeState) -> Result<(), HubError> {
        self.set_native_property(id, "chargeState", native_charge_state_name(state).into())
    }

    /// Set `currentLevel`; `chargePercent` follows.
    pub fn set_charge_level(&self, id: &DeviceId, level: i64) -> Result<(), HubError> {
        self.set_native_property(id, "currentLevel", level.into())
    }

    /// Simulate the data source going away.
    pub fn fail(&self, reason: &str) -> Result<(), HubError> {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.report_failure(reason),
            None => Ok(()),
        }
    }

    fn emit(&self, event: ChangeEvent) -> Result<(), HubError> {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.emit(event),
            None => Ok(()),
        }
    }

    fn with_device_ref<R>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&FakeDevice) -> R,
    ) -> Result<R, HubError> {
        self.devices
            .lock()
            .iter()
            .find(|known| &known.id == id)
            .map(f)
            .ok_or_else(|| HubError::DeviceNotFound(id.clone()))
    }
}

#[async_trait]
impl BackendAdapter for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, sink: EventSink) -> Result<(), HubError> {
        if let Some(reason) = &self.start_failure {
            return Err(HubError::Backend {
                backend: self.name.clone(),
                details: reason.clone(),
            });
        }
        *self.sink.lock() = Some(sink);
        info!(backend = %self.name, devices = self.devices.lock().len(), "fake backend started");
        Ok(())
    }

    fn stop(&self) {
        if self.sink.lock().take().is_some() {
            debug!(backend = %self.name, "fake backend stopped");
        }
    }

    fn list_devices(&self) -> Result<Vec<DeviceId>, HubError> {
        Ok(self.devices.lock().iter().map(|d| d.id.clone()).collect())
    }

    fn resolve_interfaces(&self, id: &DeviceId) -> Result<CapabilitySet, HubError> {
        self.with_device_ref(id, |device| device.capabilities.clone())
    }

    fn properties(&self, id: &DeviceId) -> Result<PropertyMap, HubError> {
        self.with_device_ref(id, FakeDevice::normalized)
    }

    /// Canonical writes.  `chargePercent` is derived and cannot be written;
    /// a battery's `type` is stored under its native key.
    fn set_property(&self, id: &DeviceId, key: &str, value: PropertyValue) -> Result<(), HubError> {
        if key == "chargePercent" {
            return Err(HubError::Unsupported(
                "chargePercent is derived from the charge levels".to_string(),
            ));
        }
        let is_battery = self.with_device_ref(id, |d| d.capabilities.contains(&Capability::Battery))?;
        let native_key = if is_battery && key == "type" { "batteryType" } else { key };
        self.set_native_property(id, native_key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwhub_registry::{BackendStatus, DeviceRegistry};
    use std::sync::Arc;

    fn battery_id() -> DeviceId {
        DeviceId::new(format!("{FAKEHW_UDI_ROOT}/acpi_BAT0"))
    }

    fn ac_id() -> DeviceId {
        DeviceId::new(format!("{FAKEHW_UDI_ROOT}/acpi_AC"))
    }

    async fn registry_with(backend: Arc<FakeBackend>) -> Arc<DeviceRegistry> {
        let registry = DeviceRegistry::new();
        registry.register_backend(backend).await;
        registry
    }

    fn record(registry: &DeviceRegistry) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.subscribe(Arc::new(move |_: &DeviceRegistry, e: &ChangeEvent| {
            sink.lock().push(e.clone());
        }));
        seen
    }

    #[test]
    fn native_battery_vocabulary_is_normalized() {
        let device = FakeDevice::new("acpi_BAT0")
            .with_interface(Capability::Battery)
            .with_property("batteryType", "keyboard_mouse")
            .with_property("chargeState", "fullyCharged")
            .with_property("technology", 2)
            .with_property("currentLevel", 50)
            .with_property("lastFullLevel", 100);
        let props = device.normalized();

        assert_eq!(props["type"], PropertyValue::Text("KeyboardMouse".into()));
        assert_eq!(props["chargeState"], PropertyValue::Text("FullyCharged".into()));
        assert_eq!(props["technology"], PropertyValue::Text("LithiumPolymer".into()));
        assert_eq!(props["chargePercent"], PropertyValue::Int(50));
        assert!(!props.contains_key("currentLevel"));
        assert!(!props.contains_key("batteryType"));
    }

    #[test]
    fn unknown_native_names_collapse() {
        let device = FakeDevice::new("x")
            .with_property("batteryType", "toaster")
            .with_property("chargeState", "trickle");
        let props = device.normalized();
        assert_eq!(props["type"], PropertyValue::Text("Unknown".into()));
        assert_eq!(props["chargeState"], PropertyValue::Text("NoCharge".into()));
    }

    #[test]
    fn zero_last_full_level_omits_charge_percent() {
        let device = FakeDevice::new("x")
            .with_property("currentLevel", 50)
            .with_property("lastFullLevel", 0);
        assert!(!device.normalized().contains_key("chargePercent"));
    }

    #[test]
    fn relative_udi_is_rooted() {
        assert_eq!(FakeDevice::new("acpi_BAT0").id(), &battery_id());
        assert_eq!(FakeDevice::new("/custom/dev").id().as_str(), "/custom/dev");
    }

    #[test]
    fn toml_fixture_loads_devices() {
        let backend = FakeBackend::from_toml_str(
            r#"
            [[device]]
            udi = "acpi_BAT0"
            interfaces = ["battery"]

            [device.properties]
            isPresent = true
            chargeState = "charging"
            currentLevel = 30
            lastFullLevel = 60
            voltage = 12.1

            [[device]]
            udi = "acpi_AC"
            interfaces = ["GenericInterface"]

            [device.properties]
            onBattery = false
            "#,
        )
        .unwrap();

        assert_eq!(backend.list_devices().unwrap(), vec![battery_id(), ac_id()]);
        let props = backend.properties(&battery_id()).unwrap();
        assert_eq!(props["chargePercent"], PropertyValue::Int(50));
        assert_eq!(props["voltage"], PropertyValue::Double(12.1));
        assert!(
            backend
                .resolve_interfaces(&battery_id())
                .unwrap()
                .contains(&Capability::Battery)
        );
    }

    #[test]
    fn fixture_with_unknown_interface_is_a_config_error() {
        let result = FakeBackend::from_toml_str(
            r#"
            [[device]]
            udi = "x"
            interfaces = ["Toaster"]
            "#,
        );
        assert!(matches!(result, Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn on_battery_flip_fires_exactly_one_change_for_every_subscriber() {
        let backend = Arc::new(FakeBackend::new().with_device(FakeDevice::ac_adapter("acpi_AC")));
        let registry = registry_with(backend.clone()).await;
        let first = record(&registry);
        let second = record(&registry);

        backend.set_on_battery(true).unwrap();
        registry.process_pending();

        let expected = vec![ChangeEvent::property_changed(
            ac_id(),
            "onBattery",
            PropertyValue::Bool(true),
        )];
        assert_eq!(*first.lock(), expected);
        assert_eq!(*second.lock(), expected);
        assert_eq!(
            registry.property(&ac_id(), "onBattery").unwrap(),
            PropertyValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn unchanged_value_emits_nothing() {
        let backend = Arc::new(FakeBackend::new().with_device(FakeDevice::ac_adapter("acpi_AC")));
        let registry = registry_with(backend.clone()).await;
        let seen = record(&registry);

        backend.set_on_battery(false).unwrap();
        assert_eq!(registry.process_pending(), 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn charge_level_change_updates_percent() {
        let backend =
            Arc::new(FakeBackend::new().with_device(FakeDevice::laptop_battery("acpi_BAT0")));
        let registry = registry_with(backend.clone()).await;
        let seen = record(&registry);

        backend.set_charge_level(&battery_id(), 75).unwrap();
        backend
            .set_charge_state(&battery_id(), ChargeState::Charging)
            .unwrap();
        registry.process_pending();

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(
            registry.property(&battery_id(), "chargePercent").unwrap(),
            PropertyValue::Int(75)
        );
        assert_eq!(
            registry.property(&battery_id(), "chargeState").unwrap(),
            PropertyValue::Text("Charging".into())
        );
    }

    #[tokio::test]
    async fn zero_last_full_level_retracts_charge_percent() {
        let backend =
            Arc::new(FakeBackend::new().with_device(FakeDevice::laptop_battery("acpi_BAT0")));
        let registry = registry_with(backend.clone()).await;
        let seen = record(&registry);

        backend
            .set_native_property(&battery_id(), "lastFullLevel", PropertyValue::Int(0))
            .unwrap();
        registry.process_pending();

        assert_eq!(
            *seen.lock(),
            vec![ChangeEvent::property_removed(battery_id(), "chargePercent")]
        );
        assert!(matches!(
            registry.property(&battery_id(), "chargePercent"),
            Err(HubError::PropertyNotFound { .. })
        ));
        assert!(backend.property(&battery_id(), "chargePercent").is_err());

        backend
            .set_native_property(&battery_id(), "lastFullLevel", PropertyValue::Int(100))
            .unwrap();
        registry.process_pending();
        assert_eq!(
            registry.property(&battery_id(), "chargePercent").unwrap(),
            PropertyValue::Int(50)
        );
    }

    #[tokio::test]
    async fn hotplug_injection_reaches_the_registry() {
        let backend = Arc::new(FakeBackend::new());
        let registry = registry_with(backend.clone()).await;

        backend
            .add_device(FakeDevice::laptop_battery("acpi_BAT1"))
            .unwrap();
        registry.process_pending();
        let id = DeviceId::new(format!("{FAKEHW_UDI_ROOT}/acpi_BAT1"));
        assert!(registry.contains(&id));

        backend.remove_device(&id).unwrap();
        registry.process_pending();
        assert!(!registry.contains(&id));
        assert!(backend.remove_device(&id).is_err());
    }

    #[tokio::test]
    async fn writes_round_trip_through_the_registry() {
        let backend =
            Arc::new(FakeBackend::new().with_device(FakeDevice::laptop_battery("acpi_BAT0")));
        let registry = registry_with(backend.clone()).await;

        registry
            .set_property(&battery_id(), "isPresent", PropertyValue::Bool(false))
            .unwrap();
        registry.process_pending();
        assert_eq!(
            registry.property(&battery_id(), "isPresent").unwrap(),
            PropertyValue::Bool(false)
        );

        let derived = registry.set_property(&battery_id(), "chargePercent", PropertyValue::Int(10));
        assert!(matches!(derived, Err(HubError::Unsupported(_))));
    }

    #[tokio::test]
    async fn failure_degrades_and_removes_devices() {
        let backend =
            Arc::new(FakeBackend::new().with_device(FakeDevice::laptop_battery("acpi_BAT0")));
        let registry = DeviceRegistry::new();
        let id = registry.register_backend(backend.clone()).await;

        backend.fail("power daemon vanished").unwrap();
        registry.process_pending();

        assert!(registry.is_empty());
        assert!(matches!(registry.backend_status(id), Some(BackendStatus::Degraded(_))));
        assert!(!backend.is_started());
    }

    #[tokio::test]
    async fn failing_start_contributes_no_devices() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_device(FakeDevice::laptop_battery("acpi_BAT0"))
                .failing_start("cannot connect"),
        );
        let registry = registry_with(backend).await;
        assert!(registry.is_empty());
        assert_eq!(registry.diagnostics().len(), 1);
    }
}
