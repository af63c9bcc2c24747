//! Property Cache
//!
//! Typed, named-value store attached to each tracked remote object. Only the
//! names declared for the owning role are accepted.

use crate::domain::error::ClientError;
use crate::domain::models::{PropValue, Role};

/// A cached property value plus the generation at which it was last written
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    pub value: PropValue,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct PropertySlot {
    name: &'static str,
    entry: Option<PropertyEntry>,
}

/// Whitelisted property store, kept in declaration order.
#[derive(Debug, Clone)]
pub struct PropertyCache {
    role: Role,
    slots: Vec<PropertySlot>,
    generation: u64,
}

impl PropertyCache {
    pub fn new(role: Role) -> Self {
        let slots = role
            .declared_properties()
            .iter()
            .map(|name| PropertySlot { name, entry: None })
            .collect();

        Self {
            role,
            slots,
            generation: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot.name == name)
    }

    /// Store `value` under `name`, replacing any prior value.
    pub fn set(&mut self, name: &str, value: PropValue) -> Result<(), ClientError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| ClientError::UnknownProperty {
                role: self.role,
                name: name.to_string(),
            })?;

        self.generation += 1;
        slot.entry = Some(PropertyEntry {
            value,
            generation: self.generation,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&PropValue, ClientError> {
        self.entry(name).map(|entry| &entry.value)
    }

    pub fn entry(&self, name: &str) -> Result<&PropertyEntry, ClientError> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| ClientError::PropertyNotFound {
                role: self.role,
                name: name.to_string(),
            })
    }

    /// Typed boolean read. Absent and non-boolean entries are both errors,
    /// never a default `false`.
    pub fn get_bool(&self, name: &str) -> Result<bool, ClientError> {
        let value = self.get(name)?;
        value
            .as_bool()
            .ok_or_else(|| ClientError::PropertyTypeMismatch {
                role: self.role,
                name: name.to_string(),
                expected: "b",
                found: value.type_tag().to_string(),
            })
    }

    /// Forget one value (e.g. after the remote side invalidated it).
    pub fn remove(&mut self, name: &str) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.name == name) {
            slot.entry = None;
        }
    }

    /// Drop every cached value; declared names stay.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.entry = None;
        }
    }

    /// Cached (name, value) pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropValue)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|entry| (slot.name, &entry.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_names_are_rejected() {
        let mut cache = PropertyCache::new(Role::Controller);
        let err = cache
            .set("Alias", PropValue::Str("hci0".into()))
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownProperty { .. }));
        assert_eq!(cache.iter().count(), 0);
    }

    #[test]
    fn test_set_replaces_and_bumps_generation() {
        let mut cache = PropertyCache::new(Role::Controller);
        cache.set("Powered", PropValue::Bool(false)).unwrap();
        let first = cache.entry("Powered").unwrap().generation;

        cache.set("Powered", PropValue::Bool(true)).unwrap();
        let entry = cache.entry("Powered").unwrap();
        assert_eq!(entry.value, PropValue::Bool(true));
        assert!(entry.generation > first);
    }

    #[test]
    fn test_get_bool_fails_when_absent() {
        let cache = PropertyCache::new(Role::Peripheral);
        let err = cache.get_bool("Connected").unwrap_err();
        assert!(matches!(err, ClientError::PropertyNotFound { .. }));
        assert!(err.is_unknown_value());
    }

    #[test]
    fn test_get_bool_fails_on_type_mismatch() {
        let mut cache = PropertyCache::new(Role::Peripheral);
        cache.set("RSSI", PropValue::Int16(-48)).unwrap();
        let err = cache.get_bool("RSSI").unwrap_err();
        assert_eq!(
            err,
            ClientError::PropertyTypeMismatch {
                role: Role::Peripheral,
                name: "RSSI".into(),
                expected: "b",
                found: "n".into(),
            }
        );
    }

    #[test]
    fn test_iteration_follows_declaration_order() {
        let mut cache = PropertyCache::new(Role::Peripheral);
        cache.set("Connected", PropValue::Bool(true)).unwrap();
        cache.set("RSSI", PropValue::Int16(-70)).unwrap();

        let names: Vec<&str> = cache.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["RSSI", "Connected"]);

        cache.clear();
        assert!(cache.get("RSSI").is_err());
        assert!(cache.is_declared("RSSI"));
    }
}
