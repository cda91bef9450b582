use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::SharedClock;

pub const DEFAULT_CAPABILITY_TTL: Duration = Duration::from_secs(600);

/// Strongest `response_format` a server has accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormatSupport {
    Schema,
    JsonObject,
    None,
}

impl ResponseFormatSupport {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormatSupport::Schema => "schema",
            ResponseFormatSupport::JsonObject => "json_object",
            ResponseFormatSupport::None => "none",
        }
    }

    /// Next weaker mode after a rejection.
    pub fn downgrade(self) -> Self {
        match self {
            ResponseFormatSupport::Schema => ResponseFormatSupport::JsonObject,
            ResponseFormatSupport::JsonObject | ResponseFormatSupport::None => {
                ResponseFormatSupport::None
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Observed {
    response_format: Option<(ResponseFormatSupport, Instant)>,
    sampling_params: Option<(bool, Instant)>,
}

/// What each runtime (base URL + model) was seen to reject, remembered for a TTL.
#[derive(Debug)]
pub struct CapabilityCache {
    ttl: Duration,
    clock: SharedClock,
    entries: Mutex<HashMap<String, Observed>>,
}

impl CapabilityCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime_key(base_url: &str, model: &str) -> String {
        format!("{}|{}", base_url.trim_end_matches('/'), model)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Observed>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh<T: Copy>(&self, observed: Option<(T, Instant)>) -> Option<T> {
        let (value, at) = observed?;
        (self.clock.now().saturating_duration_since(at) < self.ttl).then_some(value)
    }

    pub fn response_format(&self, key: &str) -> ResponseFormatSupport {
        let observed = self.entries().get(key).and_then(|entry| entry.response_format);
        self.fresh(observed).unwrap_or(ResponseFormatSupport::Schema)
    }

    pub fn record_response_format(&self, key: &str, support: ResponseFormatSupport) {
        let now = self.clock.now();
        self.entries().entry(key.to_string()).or_default().response_format = Some((support, now));
    }

    pub fn sampling_params_supported(&self, key: &str) -> bool {
        let observed = self.entries().get(key).and_then(|entry| entry.sampling_params);
        self.fresh(observed).unwrap_or(true)
    }

    pub fn record_sampling_params(&self, key: &str, supported: bool) {
        let now = self.clock.now();
        self.entries().entry(key.to_string()).or_default().sampling_params = Some((supported, now));
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
