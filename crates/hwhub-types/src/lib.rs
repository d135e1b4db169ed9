//! `hwhub-types` – shared vocabulary of the device hub.
//!
//! Everything that crosses a crate boundary lives here: device identifiers,
//! the [`Capability`] tags a device may expose, normalized
//! [`PropertyValue`]s, the canonical [`ChangeEvent`] every backend emits and
//! the global [`HubError`] type.
//!
//! # Modules
//!
//! - [`battery`] – canonical battery enumerations and the charge-percent
//!   normalization helper.

pub mod battery;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use battery::{BatteryType, ChargeState, Technology, charge_percent};

/// Opaque, stable device identifier ("UDI").
///
/// Unique within its backend's address space for the lifetime of the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(udi: impl Into<String>) -> Self {
        Self(udi.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Typed capability interface a device may expose.
///
/// Variants are declared in resolution-priority order: when a consumer asks
/// for "the" interface of a device, the first capability in this order that
/// the device implements wins.  The derived `Ord` follows the same order, so
/// a [`CapabilitySet`] iterates by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    Processor,
    Block,
    StorageAccess,
    StorageDrive,
    OpticalDrive,
    StorageVolume,
    OpticalDisc,
    Camera,
    PortableMediaPlayer,
    Battery,
    NetworkShare,
    GenericInterface,
}

impl Capability {
    /// Every capability, in resolution-priority order.
    pub const ALL: [Capability; 12] = [
        Capability::Processor,
        Capability::Block,
        Capability::StorageAccess,
        Capability::StorageDrive,
        Capability::OpticalDrive,
        Capability::StorageVolume,
        Capability::OpticalDisc,
        Capability::Camera,
        Capability::PortableMediaPlayer,
        Capability::Battery,
        Capability::NetworkShare,
        Capability::GenericInterface,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Processor => "Processor",
            Capability::Block => "Block",
            Capability::StorageAccess => "StorageAccess",
            Capability::StorageDrive => "StorageDrive",
            Capability::OpticalDrive => "OpticalDrive",
            Capability::StorageVolume => "StorageVolume",
            Capability::OpticalDisc => "OpticalDisc",
            Capability::Camera => "Camera",
            Capability::PortableMediaPlayer => "PortableMediaPlayer",
            Capability::Battery => "Battery",
            Capability::NetworkShare => "NetworkShare",
            Capability::GenericInterface => "GenericInterface",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = HubError;

    /// Capability names are matched case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|cap| cap.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| HubError::UnknownCapability(s.to_string()))
    }
}

/// Set of capabilities a device implements, iterated in priority order.
pub type CapabilitySet = BTreeSet<Capability>;

/// A normalized property value.
///
/// Enumerations (charge state, technology, …) travel as their canonical text
/// form inside [`PropertyValue::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    TextList(Vec<String>),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view.  Doubles with no fractional part are accepted.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            PropertyValue::Double(d) if d.fract() == 0.0 => Some(*d as i64),
            _ => None,
        }
    }

    /// Floating-point view.  Integers widen.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(d) => Some(*d),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            PropertyValue::TextList(list) => Some(list),
            _ => None,
        }
    }

    /// Equality with numeric widening: `Int(50)` equals `Double(50.0)`.
    /// A text list equals a text value when it contains it.
    pub fn loosely_equals(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::Int(_) | PropertyValue::Double(_), PropertyValue::Int(_) | PropertyValue::Double(_)) => {
                match (self.as_double(), other.as_double()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (PropertyValue::TextList(list), PropertyValue::Text(s))
            | (PropertyValue::Text(s), PropertyValue::TextList(list)) => list.iter().any(|v| v == s),
            _ => self == other,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Double(d) => write!(f, "{d}"),
            PropertyValue::Text(s) => write!(f, "{s}"),
            PropertyValue::TextList(list) => write!(f, "[{}]", list.join(", ")),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// Normalized property name → value mapping.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// The canonical change event shared by every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChangeEvent {
    DeviceAdded { id: DeviceId },
    DeviceRemoved { id: DeviceId },
    /// `changes` holds new or updated values; `removed` names keys the
    /// backend no longer reports.
    PropertyChanged {
        id: DeviceId,
        changes: PropertyMap,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed: Vec<String>,
    },
}

impl ChangeEvent {
    pub fn id(&self) -> &DeviceId {
        match self {
            ChangeEvent::DeviceAdded { id }
            | ChangeEvent::DeviceRemoved { id }
            | ChangeEvent::PropertyChanged { id, .. } => id,
        }
    }

    /// Convenience constructor for a single-key property change.
    pub fn property_changed(id: DeviceId, key: impl Into<String>, value: PropertyValue) -> Self {
        let mut changes = PropertyMap::new();
        changes.insert(key.into(), value);
        ChangeEvent::PropertyChanged {
            id,
            changes,
            removed: Vec::new(),
        }
    }

    /// Convenience constructor for a single retracted key.
    pub fn property_removed(id: DeviceId, key: impl Into<String>) -> Self {
        ChangeEvent::PropertyChanged {
            id,
            changes: PropertyMap::new(),
            removed: vec![key.into()],
        }
    }
}

/// Global error type spanning lookups, backend failures and writes.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HubError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Property '{key}' not found on {device}")]
    PropertyNotFound { device: DeviceId, key: String },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Operation unsupported: {0}")]
    Unsupported(String),

    #[error("Backend '{backend}' failed: {details}")]
    Backend { backend: String, details: String },

    #[error("Timed out after {after_ms} ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_parse_is_case_insensitive() {
        assert_eq!("battery".parse::<Capability>().unwrap(), Capability::Battery);
        assert_eq!(
            "StorageVolume".parse::<Capability>().unwrap(),
            Capability::StorageVolume
        );
        assert!(matches!(
            "Toaster".parse::<Capability>(),
            Err(HubError::UnknownCapability(_))
        ));
    }

    #[test]
    fn capability_set_iterates_in_priority_order() {
        let set: CapabilitySet = [
            Capability::GenericInterface,
            Capability::Battery,
            Capability::Processor,
        ]
        .into_iter()
        .collect();
        let order: Vec<_> = set.into_iter().collect();
        assert_eq!(
            order,
            vec![
                Capability::Processor,
                Capability::Battery,
                Capability::GenericInterface
            ]
        );
    }

    #[test]
    fn numeric_values_compare_loosely() {
        assert!(PropertyValue::Int(50).loosely_equals(&PropertyValue::Double(50.0)));
        assert!(!PropertyValue::Int(50).loosely_equals(&PropertyValue::Double(50.5)));
        assert!(!PropertyValue::Int(1).loosely_equals(&PropertyValue::Bool(true)));
    }

    #[test]
    fn text_list_contains_text() {
        let media = PropertyValue::TextList(vec!["Cdr".into(), "Dvd".into()]);
        assert!(media.loosely_equals(&PropertyValue::Text("Dvd".into())));
        assert!(!media.loosely_equals(&PropertyValue::Text("Bd".into())));
    }

    #[test]
    fn property_value_deserializes_untagged_from_toml() {
        #[derive(Deserialize)]
        struct Fixture {
            props: PropertyMap,
        }
        let fixture: Fixture = toml::from_str(
            r#"
            [props]
            isPresent = true
            currentLevel = 50
            voltage = 11.4
            serial = "BAT0-123"
            supportedMedia = ["Cdr", "Dvd"]
            "#,
        )
        .unwrap();
        assert_eq!(fixture.props["isPresent"], PropertyValue::Bool(true));
        assert_eq!(fixture.props["currentLevel"], PropertyValue::Int(50));
        assert_eq!(fixture.props["voltage"], PropertyValue::Double(11.4));
        assert_eq!(fixture.props["serial"], PropertyValue::Text("BAT0-123".into()));
        assert_eq!(
            fixture.props["supportedMedia"],
            PropertyValue::TextList(vec!["Cdr".into(), "Dvd".into()])
        );
    }

    #[test]
    fn change_event_json_shape() {
        let event = ChangeEvent::property_changed(
            DeviceId::new("/org/hwhub/fakehw/acpi_AC"),
            "onBattery",
            PropertyValue::Bool(true),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "PropertyChanged");
        assert_eq!(json["id"], "/org/hwhub/fakehw/acpi_AC");
        assert_eq!(json["changes"]["onBattery"], true);
        assert!(json.get("removed").is_none());

        let removal = ChangeEvent::property_removed(DeviceId::new("/x"), "chargePercent");
        let json = serde_json::to_value(&removal).unwrap();
        assert_eq!(json["removed"][0], "chargePercent");
        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, removal);
    }

    #[test]
    fn hub_error_display() {
        let err = HubError::Backend {
            backend: "power_supply".into(),
            details: "no such directory".into(),
        };
        assert!(err.to_string().contains("power_supply"));

        let err = HubError::PropertyNotFound {
            device: DeviceId::new("/dev/x"),
            key: "voltage".into(),
        };
        assert!(err.to_string().contains("voltage"));
    }
}
