//! Registry configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ServiceDefaults;

/// Event distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Failed attempts after which an ack is skipped
    pub max_retries: u32,

    /// Backoff after the first failed attempt
    pub retry_base_delay: Duration,

    /// Backoff ceiling
    pub retry_max_delay: Duration,

    /// Interval between reaper sweeps
    pub reap_interval: Duration,

    /// Deadline of one delivery attempt
    pub delivery_timeout: Duration,

    /// Lifetime of an event before undelivered acks are skipped
    pub event_ttl: Option<Duration>,

    /// Events buffered between the manager and the distributor
    pub intake_capacity: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(5),
            event_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            intake_capacity: 1024,
        }
    }
}

impl DistributorConfig {
    /// Backoff before the attempt following failure number `retry_count`.
    ///
    /// Doubles per failure from `retry_base_delay`, adds up to 10% jitter
    /// and never exceeds `retry_max_delay`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let delay = self.retry_base_delay.saturating_mul(1 << exponent);

        delay
            .mul_f64(fastrand::f64().mul_add(0.1, 1.0))
            .min(self.retry_max_delay)
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Distributor configuration
    pub distributor: DistributorConfig,

    /// Page size when a caller asks for none
    pub default_page_size: usize,

    /// Largest page a caller may request
    pub max_page_size: usize,

    /// Gateway-wide fallbacks for group templates
    pub service_defaults: ServiceDefaults,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            distributor: DistributorConfig::default(),
            default_page_size: 20,
            max_page_size: 500,
            service_defaults: ServiceDefaults::default(),
        }
    }
}
