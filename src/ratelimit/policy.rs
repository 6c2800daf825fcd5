//! What a caller does with an admission check that could not reach its store.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TollgateError};

/// Operator-chosen handling of store failures during traffic.
///
/// The limiter itself always reports failures; callers opt into one of these
/// explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Hand the error to the caller
    #[default]
    Propagate,
    /// Admit the request
    Open,
    /// Deny the request
    Closed,
}

impl FailurePolicy {
    /// Turn an admission result into a verdict according to this policy.
    ///
    /// Configuration errors are never masked.
    pub fn resolve(self, result: Result<bool>) -> Result<bool> {
        match result {
            Err(e) if e.is_transient() => match self {
                FailurePolicy::Propagate => Err(e),
                FailurePolicy::Open => {
                    warn!(error = %e, "Store failure, admitting request");
                    Ok(true)
                }
                FailurePolicy::Closed => {
                    warn!(error = %e, "Store failure, denying request");
                    Ok(false)
                }
            },
            other => other,
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "propagate" => Ok(FailurePolicy::Propagate),
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            _ => Err(TollgateError::Config(format!(
                "Invalid failure policy: {}. Valid options are: propagate, open, closed",
                s
            ))),
        }
    }
}
