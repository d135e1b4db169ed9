//! Typed capability views.
//!
//! [`InterfaceHandle`] is a tagged variant with one arm per
//! [`Capability`].  Every view wraps a [`DeviceHandle`] and reads normalized
//! properties from the registry; missing or mistyped values read as the
//! domain's neutral value (`false`, `0`, empty) rather than failing.

use hwhub_types::{BatteryType, Capability, ChargeState, PropertyMap, PropertyValue, Technology};

use crate::handle::DeviceHandle;

macro_rules! interface_views {
    ($($variant:ident => $view:ident),+ $(,)?) => {
        $(
            #[derive(Debug, Clone, PartialEq)]
            pub struct $view {
                device: DeviceHandle,
            }

            impl $view {
                pub fn device(&self) -> &DeviceHandle {
                    &self.device
                }
            }
        )+

        /// A resolved capability interface of one device.
        #[derive(Debug, Clone, PartialEq)]
        pub enum InterfaceHandle {
            $($variant($view)),+
        }

        impl InterfaceHandle {
            pub(crate) fn new(capability: Capability, device: DeviceHandle) -> Self {
                match capability {
                    $(Capability::$variant => InterfaceHandle::$variant($view { device })),+
                }
            }

            pub fn capability(&self) -> Capability {
                match self {
                    $(InterfaceHandle::$variant(_) => Capability::$variant),+
                }
            }

            pub fn device(&self) -> &DeviceHandle {
                match self {
                    $(InterfaceHandle::$variant(view) => &view.device),+
                }
            }
        }
    };
}

interface_views! {
    Processor => ProcessorInterface,
    Block => BlockInterface,
    StorageAccess => StorageAccessInterface,
    StorageDrive => StorageDriveInterface,
    OpticalDrive => OpticalDriveInterface,
    StorageVolume => StorageVolumeInterface,
    OpticalDisc => OpticalDiscInterface,
    Camera => CameraInterface,
    PortableMediaPlayer => PortableMediaPlayerInterface,
    Battery => BatteryInterface,
    NetworkShare => NetworkShareInterface,
    GenericInterface => GenericInterface,
}

impl InterfaceHandle {
    pub fn as_battery(&self) -> Option<&BatteryInterface> {
        match self {
            InterfaceHandle::Battery(battery) => Some(battery),
            _ => None,
        }
    }

    pub fn as_generic(&self) -> Option<&GenericInterface> {
        match self {
            InterfaceHandle::GenericInterface(generic) => Some(generic),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Battery
// ────────────────────────────────────────────────────────────────────────────

impl BatteryInterface {
    pub fn is_present(&self) -> bool {
        self.device.bool_property("isPresent")
    }

    pub fn battery_type(&self) -> BatteryType {
        self.device
            .text_property("type")
            .parse()
            .unwrap_or(BatteryType::Unknown)
    }

    /// `None` when the backend could not compute a percentage (for example
    /// a zero last-full level).
    pub fn charge_percent(&self) -> Option<u8> {
        self.device
            .property("chargePercent")
            .and_then(|v| v.as_int())
            .map(|percent| percent.clamp(0, 100) as u8)
    }

    pub fn capacity(&self) -> Option<u8> {
        self.device
            .property("capacity")
            .and_then(|v| v.as_int())
            .map(|percent| percent.clamp(0, 100) as u8)
    }

    pub fn charge_state(&self) -> ChargeState {
        self.device
            .text_property("chargeState")
            .parse()
            .unwrap_or(ChargeState::NoCharge)
    }

    pub fn technology(&self) -> Technology {
        self.device
            .text_property("technology")
            .parse()
            .unwrap_or(Technology::Unknown)
    }

    pub fn is_rechargeable(&self) -> bool {
        self.device.bool_property("isRechargeable")
    }

    pub fn is_power_supply(&self) -> bool {
        self.device.bool_property("isPowerSupply")
    }

    pub fn is_recalled(&self) -> bool {
        self.device.bool_property("isRecalled")
    }

    pub fn energy(&self) -> f64 {
        self.device.double_property("energy")
    }

    pub fn energy_full(&self) -> f64 {
        self.device.double_property("energyFull")
    }

    pub fn energy_full_design(&self) -> f64 {
        self.device.double_property("energyFullDesign")
    }

    pub fn energy_rate(&self) -> f64 {
        self.device.double_property("energyRate")
    }

    pub fn voltage(&self) -> f64 {
        self.device.double_property("voltage")
    }

    pub fn temperature(&self) -> f64 {
        self.device.double_property("temperature")
    }

    /// Seconds.
    pub fn remaining_time(&self) -> i64 {
        self.device.int_property("remainingTime")
    }

    /// Seconds.
    pub fn time_to_empty(&self) -> i64 {
        self.device.int_property("timeToEmpty")
    }

    /// Seconds.
    pub fn time_to_full(&self) -> i64 {
        self.device.int_property("timeToFull")
    }

    pub fn serial(&self) -> String {
        self.device.text_property("serial")
    }

    pub fn recall_vendor(&self) -> String {
        self.device.text_property("recallVendor")
    }

    pub fn recall_url(&self) -> String {
        self.device.text_property("recallUrl")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Processor / block / storage
// ────────────────────────────────────────────────────────────────────────────

impl ProcessorInterface {
    pub fn number(&self) -> i64 {
        self.device.int_property("number")
    }

    /// MHz.
    pub fn max_speed(&self) -> i64 {
        self.device.int_property("maxSpeed")
    }

    pub fn can_change_frequency(&self) -> bool {
        self.device.bool_property("canChangeFrequency")
    }
}

impl BlockInterface {
    pub fn major(&self) -> i64 {
        self.device.int_property("major")
    }

    pub fn minor(&self) -> i64 {
        self.device.int_property("minor")
    }

    pub fn device_path(&self) -> String {
        self.device.text_property("device")
    }
}

impl StorageAccessInterface {
    pub fn is_accessible(&self) -> bool {
        self.device.bool_property("accessible")
    }

    pub fn file_path(&self) -> String {
        self.device.text_property("filePath")
    }

    pub fn is_ignored(&self) -> bool {
        self.device.bool_property("ignored")
    }
}

impl StorageDriveInterface {
    pub fn bus(&self) -> String {
        self.device.text_property("bus")
    }

    pub fn drive_type(&self) -> String {
        self.device.text_property("driveType")
    }

    pub fn is_removable(&self) -> bool {
        self.device.bool_property("removable")
    }

    pub fn is_hotpluggable(&self) -> bool {
        self.device.bool_property("hotpluggable")
    }

    /// Bytes.
    pub fn size(&self) -> i64 {
        self.device.int_property("size")
    }
}

impl StorageVolumeInterface {
    pub fn is_ignored(&self) -> bool {
        self.device.bool_property("ignored")
    }

    pub fn usage(&self) -> String {
        self.device.text_property("usage")
    }

    pub fn fs_type(&self) -> String {
        self.device.text_property("fsType")
    }

    pub fn label(&self) -> String {
        self.device.text_property("label")
    }

    pub fn uuid(&self) -> String {
        self.device.text_property("uuid")
    }

    /// Bytes.
    pub fn size(&self) -> i64 {
        self.device.int_property("size")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Optical media
// ────────────────────────────────────────────────────────────────────────────

impl OpticalDriveInterface {
    pub fn supported_media(&self) -> Vec<String> {
        self.device.list_property("supportedMedia")
    }

    pub fn read_speed(&self) -> i64 {
        self.device.int_property("readSpeed")
    }

    pub fn write_speed(&self) -> i64 {
        self.device.int_property("writeSpeed")
    }
}

impl OpticalDiscInterface {
    pub fn disc_type(&self) -> String {
        self.device.text_property("discType")
    }

    pub fn is_appendable(&self) -> bool {
        self.device.bool_property("appendable")
    }

    pub fn is_blank(&self) -> bool {
        self.device.bool_property("blank")
    }

    pub fn is_rewritable(&self) -> bool {
        self.device.bool_property("rewritable")
    }

    /// Bytes.
    pub fn capacity(&self) -> i64 {
        self.device.int_property("capacity")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Media devices and shares
// ────────────────────────────────────────────────────────────────────────────

impl CameraInterface {
    pub fn supported_protocols(&self) -> Vec<String> {
        self.device.list_property("supportedProtocols")
    }

    pub fn supported_drivers(&self) -> Vec<String> {
        self.device.list_property("supportedDrivers")
    }
}

impl PortableMediaPlayerInterface {
    pub fn supported_protocols(&self) -> Vec<String> {
        self.device.list_property("supportedProtocols")
    }

    pub fn supported_drivers(&self) -> Vec<String> {
        self.device.list_property("supportedDrivers")
    }
}

impl NetworkShareInterface {
    /// `"nfs"`, `"cifs"`, … or empty when unknown.
    pub fn share_type(&self) -> String {
        self.device.text_property("type")
    }

    pub fn url(&self) -> String {
        self.device.text_property("url")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Generic
// ────────────────────────────────────────────────────────────────────────────

impl GenericInterface {
    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.device.property(key)
    }

    pub fn all_properties(&self) -> PropertyMap {
        self.device.properties()
    }

    pub fn property_exists(&self, key: &str) -> bool {
        self.device.property(key).is_some()
    }
}
