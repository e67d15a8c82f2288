//! Service configuration.

use chrono::Duration;
use rust_decimal::Decimal;

use crate::pipeline::RetryPolicy;

/// Alias matching thresholds
#[derive(Debug, Clone)]
pub struct AliasConfig {
    /// Minimum bigram similarity for a FUZZY match
    pub fuzzy_threshold: f64,
    /// Minimum confidence for AUTO alias learning
    pub auto_learn_confidence: f64,
}

impl Default for AliasConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            auto_learn_confidence: 0.90,
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a triggerExtraction response is replayed for
    pub extraction_idempotency_ttl: Duration,
    /// How long revision and document mutations are replayed for
    pub revision_idempotency_ttl: Duration,
    /// Allowed drift between subtotal + tax and total, and between line sums and subtotal
    pub total_tolerance: Decimal,
    /// A supplied home value further than this from the computed one is an override
    pub home_override_tolerance: Decimal,
    /// Upper bound for uploads and appended files
    pub max_upload_bytes: u64,
    pub retry: RetryPolicy,
    pub default_home_currency: String,
    pub extraction_seconds_per_page: i64,
    pub extraction_min_eta_seconds: i64,
    pub alias: AliasConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            extraction_idempotency_ttl: Duration::hours(1),
            revision_idempotency_ttl: Duration::hours(24),
            total_tolerance: Decimal::new(1, 2),
            home_override_tolerance: Decimal::new(9, 3),
            max_upload_bytes: 50 * 1024 * 1024,
            retry: RetryPolicy::default(),
            default_home_currency: "USD".to_string(),
            extraction_seconds_per_page: 20,
            extraction_min_eta_seconds: 30,
            alias: AliasConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_home_currency(mut self, currency: &str) -> Self {
        self.default_home_currency = currency.to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_upload_bytes(mut self, limit: u64) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub fn with_alias_config(mut self, alias: AliasConfig) -> Self {
        self.alias = alias;
        self
    }
}
