#![allow(dead_code)] // not every test binary uses every helper

use std::collections::HashMap;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    /// Clear every variable the service reads so tests start deterministic.
    pub fn clear_service_env(&mut self) {
        for key in [
            "OPENAI_API_KEY",
            "PAGEFILL_MODEL",
            "PAGEFILL_API_BASE",
            "PAGEFILL_UPSTREAM_TIMEOUT_MS",
            "ALLOWED_ORIGINS",
            "PAGEFILL_FACTS_FILE",
            "PAGEFILL_FALLBACK_POLICY",
            "PAGEFILL_MAX_REQUEST_BYTES",
            "LOG_FILE",
            "LOG_MAX_BYTES",
            "LOG_ROTATE_KEEP",
        ] {
            self.remove(key);
        }
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}
