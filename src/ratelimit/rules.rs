//! Bucket parameters and their validation.
//!
//! A [`RateLimitConfig`] describes one token bucket: how many tokens it holds,
//! how fast it refills and what an unweighted request costs. Values are
//! checked when the config is built, including when it is deserialized.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Cost of a request when the caller does not supply a weight.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Immutable parameters for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig", into = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    capacity: f64,
    refill_rate: f64,
    default_weight: f64,
}

/// Unvalidated form used for (de)serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawRateLimitConfig {
    /// Maximum tokens the bucket can hold
    capacity: f64,
    /// Tokens restored per second
    refill_rate: f64,
    /// Cost of an unweighted request
    #[serde(default = "default_weight")]
    default_weight: f64,
}

fn default_weight() -> f64 {
    DEFAULT_WEIGHT
}

impl RateLimitConfig {
    /// Create a config with the default request weight.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        Self::with_default_weight(capacity, refill_rate, DEFAULT_WEIGHT)
    }

    /// Create a config with an explicit default request weight.
    pub fn with_default_weight(capacity: f64, refill_rate: f64, default_weight: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(TollgateError::InvalidConfig(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(TollgateError::InvalidConfig(format!(
                "refill_rate must be zero or positive, got {}",
                refill_rate
            )));
        }
        validate_weight(default_weight)?;

        Ok(Self {
            capacity,
            refill_rate,
            default_weight,
        })
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens restored per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Cost of an unweighted request.
    pub fn default_weight(&self) -> f64 {
        self.default_weight
    }
}

/// Reject weights that would let a request through for free.
pub fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(TollgateError::InvalidConfig(format!(
            "weight must be a positive number, got {}",
            weight
        )));
    }
    Ok(())
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = TollgateError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        Self::with_default_weight(raw.capacity, raw.refill_rate, raw.default_weight)
    }
}

impl From<RateLimitConfig> for RawRateLimitConfig {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            default_weight: config.default_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = RateLimitConfig::new(5.0, 1.0).unwrap();
        assert_eq!(config.capacity(), 5.0);
        assert_eq!(config.refill_rate(), 1.0);
        assert_eq!(config.default_weight(), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_zero_refill_rate_is_allowed() {
        let config = RateLimitConfig::new(10.0, 0.0).unwrap();
        assert_eq!(config.refill_rate(), 0.0);
    }

    #[test]
    fn test_rejects_non_positive_capacity() {
        for capacity in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = RateLimitConfig::new(capacity, 1.0).unwrap_err();
            assert!(
                matches!(err, TollgateError::InvalidConfig(_)),
                "capacity {} should be rejected",
                capacity
            );
        }
    }

    #[test]
    fn test_rejects_negative_refill_rate() {
        let err = RateLimitConfig::new(5.0, -0.5).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_non_positive_default_weight() {
        assert!(RateLimitConfig::with_default_weight(5.0, 1.0, 0.0).is_err());
        assert!(RateLimitConfig::with_default_weight(5.0, 1.0, -2.0).is_err());
        assert!(RateLimitConfig::with_default_weight(5.0, 1.0, 2.5).is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
capacity: 5
refill_rate: 1.0
"#;
        let config: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.capacity(), 5.0);
        assert_eq!(config.default_weight(), 1.0);
    }

    #[test]
    fn test_parse_yaml_rejects_invalid_values() {
        let yaml = r#"
capacity: 0
refill_rate: 1.0
"#;
        let result: std::result::Result<RateLimitConfig, _> = serde_yaml::from_str(yaml);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("capacity must be a positive number"));
    }
}
