//! [`DeviceHandle`] – a cheap, cloneable reference to a registry device.
//!
//! A handle records the device id and the capability set resolved when it
//! was created.  Property reads always go to the registry's canonical state,
//! so a handle observes every applied change and nothing half-applied.  Once
//! the device is removed the handle stays usable but [`DeviceHandle::is_valid`]
//! turns `false` and reads return nothing.

use std::fmt;
use std::sync::Weak;

use hwhub_types::{Capability, CapabilitySet, DeviceId, HubError, PropertyMap, PropertyValue};

use crate::interfaces::InterfaceHandle;
use crate::registry::DeviceRegistry;

#[derive(Clone)]
pub struct DeviceHandle {
    id: DeviceId,
    capabilities: CapabilitySet,
    registry: Weak<DeviceRegistry>,
}

impl DeviceHandle {
    pub(crate) fn new(id: DeviceId, capabilities: CapabilitySet, registry: Weak<DeviceRegistry>) -> Self {
        Self {
            id,
            capabilities,
            registry,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn is_device_interface(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// The typed view for `capability`, or `None` if the device does not
    /// implement it.  Asking twice yields equal handles.
    pub fn query_interface(&self, capability: Capability) -> Option<InterfaceHandle> {
        self.is_device_interface(capability)
            .then(|| InterfaceHandle::new(capability, self.clone()))
    }

    /// The highest-priority interface the device implements (see
    /// [`Capability`] for the order).
    pub fn primary_interface(&self) -> Option<InterfaceHandle> {
        self.capabilities
            .iter()
            .next()
            .map(|capability| InterfaceHandle::new(*capability, self.clone()))
    }

    /// Every implemented interface, in priority order.
    pub fn interfaces(&self) -> Vec<InterfaceHandle> {
        self.capabilities
            .iter()
            .map(|capability| InterfaceHandle::new(*capability, self.clone()))
            .collect()
    }

    /// `true` while the registry is alive and still knows the device.
    pub fn is_valid(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(&self.id))
    }

    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.registry.upgrade()?.property(&self.id, key).ok()
    }

    pub fn properties(&self) -> PropertyMap {
        self.registry
            .upgrade()
            .and_then(|registry| registry.inspect(&self.id, |record| record.properties().clone()))
            .unwrap_or_default()
    }

    /// Forward a write to the owning backend.
    pub fn set_property(&self, key: &str, value: PropertyValue) -> Result<(), HubError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| HubError::DeviceNotFound(self.id.clone()))?;
        registry.set_property(&self.id, key, value)
    }

    pub(crate) fn bool_property(&self, key: &str) -> bool {
        self.property(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub(crate) fn int_property(&self, key: &str) -> i64 {
        self.property(key).and_then(|v| v.as_int()).unwrap_or(0)
    }

    pub(crate) fn double_property(&self, key: &str) -> f64 {
        self.property(key).and_then(|v| v.as_double()).unwrap_or(0.0)
    }

    pub(crate) fn text_property(&self, key: &str) -> String {
        self.property(key)
            .and_then(|v| v.as_text().map(str::to_string))
            .unwrap_or_default()
    }

    pub(crate) fn list_property(&self, key: &str) -> Vec<String> {
        match self.property(key) {
            Some(PropertyValue::TextList(list)) => list,
            Some(PropertyValue::Text(single)) => vec![single],
            _ => Vec::new(),
        }
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.registry, &other.registry)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
