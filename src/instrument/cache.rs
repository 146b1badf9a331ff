//! Property caching for instrument drivers.
//!
//! Querying hardware is slow, so drivers may cache the last known value of a
//! property and serve reads from the cache. Caching is opt-in per property
//! name: only names in the permitted set are ever cached, everything else is
//! a plain passthrough. Writes short-circuit when the new value equals the
//! cached one, so a sweep that re-sends the same setting costs nothing.
//!
//! The cache can be cleared wholesale or per name when its content becomes
//! suspect (typically after a user touched the front panel).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{InstrResult, InstrumentError};

/// A cached property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> InstrResult<f64> {
        match self {
            PropertyValue::Float(v) => Ok(*v),
            PropertyValue::Int(v) => Ok(*v as f64),
            other => Err(InstrumentError::InvalidValue {
                property: "<cached>".to_string(),
                reason: format!("expected a number, got {other:?}"),
            }),
        }
    }

    pub fn as_bool(&self) -> InstrResult<bool> {
        match self {
            PropertyValue::Bool(v) => Ok(*v),
            other => Err(InstrumentError::InvalidValue {
                property: "<cached>".to_string(),
                reason: format!("expected a boolean, got {other:?}"),
            }),
        }
    }

    pub fn as_text(&self) -> InstrResult<&str> {
        match self {
            PropertyValue::Text(v) => Ok(v),
            other => Err(InstrumentError::InvalidValue {
                property: "<cached>".to_string(),
                reason: format!("expected text, got {other:?}"),
            }),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

/// Cache of instrument property values, keyed by property name.
pub struct PropertyCache {
    permitted: HashSet<String>,
    values: Mutex<HashMap<String, PropertyValue>>,
}

impl PropertyCache {
    /// Cache permitting the given property names.
    pub fn new<I, S>(permitted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permitted: permitted.into_iter().map(Into::into).collect(),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Cache with caching disabled for every property.
    pub fn disabled() -> Self {
        Self::new(Vec::<String>::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PropertyValue>> {
        match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether caching is permitted for this property name.
    pub fn permits(&self, name: &str) -> bool {
        self.permitted.contains(name)
    }

    /// The cached value for a name, if any.
    pub fn lookup(&self, name: &str) -> Option<PropertyValue> {
        self.lock().get(name).cloned()
    }

    /// Store a value for a name. Only call for permitted names.
    pub fn store(&self, name: &str, value: PropertyValue) {
        self.lock().insert(name.to_string(), value);
    }

    /// Clear the cache of the given property names, or all of them when
    /// `names` is `None`.
    pub fn invalidate(&self, names: Option<&[&str]>) {
        let mut values = self.lock();
        match names {
            Some(names) => {
                for name in names {
                    values.remove(*name);
                }
            }
            None => values.clear(),
        }
    }

    /// Snapshot of the current cache content.
    pub fn snapshot(&self) -> HashMap<String, PropertyValue> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permitted_names_only() {
        let cache = PropertyCache::new(["heater_state", "target_field"]);
        assert!(cache.permits("heater_state"));
        assert!(!cache.permits("output_field"));
        assert!(!PropertyCache::disabled().permits("heater_state"));
    }

    #[test]
    fn store_lookup_invalidate() {
        let cache = PropertyCache::new(["a", "b"]);
        cache.store("a", 1.5.into());
        cache.store("b", "On".into());

        assert_eq!(cache.lookup("a"), Some(PropertyValue::Float(1.5)));
        cache.invalidate(Some(&["a"]));
        assert_eq!(cache.lookup("a"), None);
        assert_eq!(cache.lookup("b"), Some(PropertyValue::Text("On".into())));

        cache.store("a", 2.0.into());
        cache.invalidate(None);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn value_conversions() {
        assert_eq!(PropertyValue::from(3.0).as_f64().unwrap(), 3.0);
        assert_eq!(PropertyValue::from(7i64).as_f64().unwrap(), 7.0);
        assert!(PropertyValue::from("VOLT").as_f64().is_err());
        assert!(PropertyValue::from(true).as_bool().unwrap());
        assert_eq!(PropertyValue::from("CURR").as_text().unwrap(), "CURR");
    }
}
