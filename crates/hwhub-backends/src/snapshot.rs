//! Point-in-time device tables shared by the file-backed backends, and the
//! diff that turns two of them into canonical events.

use std::collections::BTreeMap;

use hwhub_types::{CapabilitySet, ChangeEvent, DeviceId, PropertyMap};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Entry {
    pub(crate) capabilities: CapabilitySet,
    pub(crate) properties: PropertyMap,
}

pub(crate) type Snapshot = BTreeMap<DeviceId, Entry>;

/// Keys of `after` whose value differs from `before`.
pub(crate) fn changed_properties(before: &PropertyMap, after: &PropertyMap) -> PropertyMap {
    after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Keys of `before` missing from `after`.
pub(crate) fn removed_properties(before: &PropertyMap, after: &PropertyMap) -> Vec<String> {
    before
        .keys()
        .filter(|key| !after.contains_key(*key))
        .cloned()
        .collect()
}

/// The `PropertyChanged` turning `before` into `after`, or `None` when they
/// are equal.
pub(crate) fn property_diff(
    id: &DeviceId,
    before: &PropertyMap,
    after: &PropertyMap,
) -> Option<ChangeEvent> {
    let changes = changed_properties(before, after);
    let removed = removed_properties(before, after);
    if changes.is_empty() && removed.is_empty() {
        return None;
    }
    Some(ChangeEvent::PropertyChanged {
        id: id.clone(),
        changes,
        removed,
    })
}

/// Canonical events turning `old` into `new`.  Removals come first so an id
/// that moves between entries never appears twice.  An entry whose
/// capability set changed is re-announced as a removal plus an addition,
/// since capabilities are resolved once per `DeviceAdded`.
pub(crate) fn changes_between(old: &Snapshot, new: &Snapshot) -> Vec<ChangeEvent> {
    let mut events: Vec<ChangeEvent> = old
        .keys()
        .filter(|id| !new.contains_key(*id))
        .map(|id| ChangeEvent::DeviceRemoved { id: id.clone() })
        .collect();
    for (id, entry) in new {
        match old.get(id) {
            None => events.push(ChangeEvent::DeviceAdded { id: id.clone() }),
            Some(previous) if previous.capabilities != entry.capabilities => {
                events.push(ChangeEvent::DeviceRemoved { id: id.clone() });
                events.push(ChangeEvent::DeviceAdded { id: id.clone() });
            }
            Some(previous) => {
                events.extend(property_diff(id, &previous.properties, &entry.properties));
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwhub_types::{Capability, PropertyValue};

    fn entry(props: &[(&str, PropertyValue)]) -> Entry {
        Entry {
            capabilities: CapabilitySet::new(),
            properties: props.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn unchanged_tables_produce_no_events() {
        let mut table = Snapshot::new();
        table.insert(DeviceId::new("/a"), entry(&[("x", PropertyValue::Int(1))]));
        assert!(changes_between(&table, &table.clone()).is_empty());
    }

    #[test]
    fn only_changed_keys_are_reported() {
        let mut old = Snapshot::new();
        old.insert(
            DeviceId::new("/a"),
            entry(&[("x", PropertyValue::Int(1)), ("y", PropertyValue::Bool(true))]),
        );
        let mut new = old.clone();
        new.insert(
            DeviceId::new("/a"),
            entry(&[("x", PropertyValue::Int(2)), ("y", PropertyValue::Bool(true))]),
        );
        assert_eq!(
            changes_between(&old, &new),
            vec![ChangeEvent::property_changed(DeviceId::new("/a"), "x", PropertyValue::Int(2))]
        );
    }

    #[test]
    fn removals_precede_additions() {
        let mut old = Snapshot::new();
        old.insert(DeviceId::new("/b"), entry(&[]));
        let mut new = Snapshot::new();
        new.insert(DeviceId::new("/a"), entry(&[]));
        assert_eq!(
            changes_between(&old, &new),
            vec![
                ChangeEvent::DeviceRemoved { id: DeviceId::new("/b") },
                ChangeEvent::DeviceAdded { id: DeviceId::new("/a") },
            ]
        );
    }

    #[test]
    fn vanished_keys_are_reported_as_removed() {
        let mut old = Snapshot::new();
        old.insert(
            DeviceId::new("/a"),
            entry(&[("x", PropertyValue::Int(1)), ("y", PropertyValue::Bool(true))]),
        );
        let mut new = Snapshot::new();
        new.insert(DeviceId::new("/a"), entry(&[("y", PropertyValue::Bool(true))]));
        assert_eq!(
            changes_between(&old, &new),
            vec![ChangeEvent::property_removed(DeviceId::new("/a"), "x")]
        );
    }

    #[test]
    fn capability_change_reannounces_the_device() {
        let mut old = Snapshot::new();
        old.insert(DeviceId::new("/a"), entry(&[]));
        let mut new = Snapshot::new();
        let mut gained = entry(&[]);
        gained.capabilities.insert(Capability::NetworkShare);
        new.insert(DeviceId::new("/a"), gained);
        assert_eq!(
            changes_between(&old, &new),
            vec![
                ChangeEvent::DeviceRemoved { id: DeviceId::new("/a") },
                ChangeEvent::DeviceAdded { id: DeviceId::new("/a") },
            ]
        );
    }
}
