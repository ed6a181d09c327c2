//! Engine tuning knobs.

use std::time::Duration;

/// Default candidate search radius around a pickup point.
const DEFAULT_RADIUS_KM: f64 = 10.0;

/// Default time a driver may sit on an offer before it counts as a
/// rejection.
const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on offer rounds per dispatch. Exclusion already bounds the
/// loop by pool size; the cap guards against churn where freshly onlined
/// drivers keep producing one more candidate.
const DEFAULT_MAX_OFFER_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_radius_km: f64,
    pub offer_timeout: Duration,
    pub max_offer_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_radius_km: DEFAULT_RADIUS_KM,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            max_offer_attempts: DEFAULT_MAX_OFFER_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    pub fn with_radius_km(mut self, radius_km: f64) -> Self {
        self.default_radius_km = radius_km;
        self
    }

    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    pub fn with_max_offer_attempts(mut self, attempts: usize) -> Self {
        self.max_offer_attempts = attempts;
        self
    }
}
