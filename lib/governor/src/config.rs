//! Governor configuration.

use serde::Deserialize;
use std::collections::HashMap;
use thinkone_core::OperationKind;

/// Slowest refill rate accepted, in tokens per second.
const MIN_REFILL_RATE: f64 = 0.001;

/// Token bucket parameters applied to every account.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GovernorConfig {
    /// Bucket capacity in tokens.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u32,
    /// Tokens added per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// Per-kind weight overrides. Kinds not listed use their default weight.
    #[serde(default)]
    pub weights: HashMap<OperationKind, u32>,
}

fn default_bucket_size() -> u32 {
    20
}

fn default_refill_rate() -> f64 {
    1.0
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::new(default_bucket_size(), default_refill_rate())
    }
}

impl GovernorConfig {
    /// Creates a configuration with default weights.
    ///
    /// The bucket holds at least one token and refills at a positive rate.
    #[must_use]
    pub fn new(bucket_size: u32, refill_rate: f64) -> Self {
        let refill_rate = if refill_rate.is_finite() {
            refill_rate.max(MIN_REFILL_RATE)
        } else {
            default_refill_rate()
        };
        Self {
            bucket_size: bucket_size.max(1),
            refill_rate,
            weights: HashMap::new(),
        }
    }

    /// Overrides the weight of one operation kind.
    #[must_use]
    pub fn with_weight(mut self, kind: OperationKind, weight: u32) -> Self {
        self.weights.insert(kind, weight);
        self
    }

    /// Returns the token cost of `kind`.
    #[must_use]
    pub fn weight(&self, kind: OperationKind) -> u32 {
        self.weights
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_weight())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_apply_without_overrides() {
        let config = GovernorConfig::default();
        assert_eq!(config.bucket_size, 20);
        assert_eq!(config.weight(OperationKind::FetchHistory), 5);
        assert_eq!(config.weight(OperationKind::SendMessage), 1);
    }

    #[test]
    fn overrides_replace_defaults() {
        let config = GovernorConfig::default().with_weight(OperationKind::SendMessage, 4);
        assert_eq!(config.weight(OperationKind::SendMessage), 4);
        assert_eq!(config.weight(OperationKind::GetMe), 1);
    }

    #[test]
    fn degenerate_values_are_clamped() {
        let config = GovernorConfig::new(0, 0.0);
        assert_eq!(config.bucket_size, 1);
        assert!(config.refill_rate > 0.0);

        let config = GovernorConfig::new(5, f64::NAN);
        assert_eq!(config.refill_rate, 1.0);
    }
}
