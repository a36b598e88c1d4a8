//! Server-side session storage for the wizard's idle timeout.

use std::collections::HashMap;

/// Session key for the last granted access (unix seconds).
pub const LAST_ACTIVITY_KEY: &str = "install_last_activity";

/// Minimal key/value session the gate reads and refreshes.
pub trait SessionStore: Send {
    fn get(&self, key: &str) -> Option<i64>;
    fn set(&mut self, key: &str, value: i64);
    fn clear(&mut self);
}

/// In-process session; one per browser session cookie.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    values: HashMap<String, i64>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SessionStore for MemorySession {
    fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), value);
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}
