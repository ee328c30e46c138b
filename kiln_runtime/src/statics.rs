//! Static field storage.

use crate::definition::StaticFieldDef;
use kiln_core::{Symbol, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Static values of one type, keyed by field name.
///
/// Lives exactly as long as its type descriptor. Values read as `Null`
/// until [`assign_initial`](Self::assign_initial) runs at the start of
/// initialization.
#[derive(Debug, Default)]
pub struct StaticStorage {
    values: RwLock<FxHashMap<Symbol, Value>>,
}

impl StaticStorage {
    /// Storage with one `Null` slot per declared field.
    pub fn new(fields: &[StaticFieldDef]) -> Self {
        let values = fields
            .iter()
            .map(|field| (field.name.clone(), Value::Null))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }

    /// Whether `name` is declared here.
    pub fn declares(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }

    /// Write the explicit initial values.
    pub fn assign_initial(&self, fields: &[StaticFieldDef]) {
        let mut values = self.values.write();
        for field in fields {
            values.insert(field.name.clone(), field.initial);
        }
    }

    /// Read `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).copied()
    }

    /// Write `name`. Returns `false` if the field is not declared here.
    pub fn set(&self, name: &str, value: Value) -> bool {
        match self.values.write().get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Copy of every value, for root tracing.
    pub fn values(&self) -> Vec<Value> {
        self.values.read().values().copied().collect()
    }

    /// Declared field names.
    pub fn names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self.values.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<StaticFieldDef> {
        vec![
            StaticFieldDef {
                name: "a".into(),
                initial: Value::int(1),
            },
            StaticFieldDef {
                name: "b".into(),
                initial: Value::int(2),
            },
        ]
    }

    #[test]
    fn test_null_until_initial_values() {
        let storage = StaticStorage::new(&fields());
        assert_eq!(storage.get("a"), Some(Value::Null));
        storage.assign_initial(&fields());
        assert_eq!(storage.get("a"), Some(Value::int(1)));
        assert_eq!(storage.get("missing"), None);
    }

    #[test]
    fn test_set_only_declared() {
        let storage = StaticStorage::new(&fields());
        assert!(storage.set("b", Value::int(9)));
        assert!(!storage.set("c", Value::int(9)));
        assert_eq!(storage.get("b"), Some(Value::int(9)));
        assert!(storage.declares("a"));
        assert_eq!(storage.names().len(), 2);
        assert_eq!(storage.values().len(), 2);
    }
}
