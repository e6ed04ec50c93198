use fxhash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Storage is the per-query state store handed to stateful operators.
/// It is scoped to one pipeline and never shared across queries; keys are
/// assigned by the builder so each operator owns a disjoint namespace.
#[derive(Debug, Clone, Default)]
pub struct Storage(Rc<RefCell<FxHashMap<String, serde_json::Value>>>);

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .borrow()
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set<T: serde::Serialize>(&self, key: &str, value: &T) {
        self.0.borrow_mut().insert(
            key.to_string(),
            serde_json::to_value(value).expect("operator state serializes"),
        );
    }

    pub fn remove(&self, key: &str) {
        self.0.borrow_mut().remove(key);
    }

    /// Drop every entry under `prefix`. Used by operator teardown.
    pub fn clear_prefix(&self, prefix: &str) {
        self.0
            .borrow_mut()
            .retain(|key, _| !key.starts_with(prefix));
    }
}
