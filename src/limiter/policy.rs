//! Named limiter policies.
//!
//! Callers choose a limiter by name only. Thresholds come from the deployment
//! (built-in defaults, optionally overridden per name from a YAML table), so a
//! caller can never pick a looser policy than the one it was assigned.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Behaviour when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit the request and flag the decision as degraded.
    FailOpen,
    /// Refuse with [`Error::SharedStoreUnavailable`].
    FailClosed,
}

/// Store-failure policy applied on every limiter code path.
///
/// Fail-open: a store outage degrades protection, not availability. Decisions
/// taken without the store carry `degraded = true` and are logged at `warn`.
///
/// A deployment may replace this constant once, at wiring time, through
/// `CoordinatorBuilder::failure_policy` or `AdmissionLimiter::with_failure_policy`.
/// The replacement then governs `check`, `enforce` and `status` alike for that
/// limiter; callers never choose a policy per request.
pub const STORE_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimiterName {
    CatalogRead,
    CartMutation,
    Checkout,
    Validation,
    UpstreamCatalog,
}

impl LimiterName {
    pub const ALL: [LimiterName; 5] = [
        LimiterName::CatalogRead,
        LimiterName::CartMutation,
        LimiterName::Checkout,
        LimiterName::Validation,
        LimiterName::UpstreamCatalog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterName::CatalogRead => "catalog-read",
            LimiterName::CartMutation => "cart-mutation",
            LimiterName::Checkout => "checkout",
            LimiterName::Validation => "validation",
            LimiterName::UpstreamCatalog => "upstream-catalog",
        }
    }

    pub fn default_policy(&self) -> LimitPolicy {
        match self {
            LimiterName::CatalogRead => LimitPolicy::new(100, Duration::from_secs(60)),
            LimiterName::CartMutation => LimitPolicy::new(30, Duration::from_secs(60)),
            LimiterName::Checkout => LimitPolicy::new(5, Duration::from_secs(15 * 60)),
            LimiterName::Validation => LimitPolicy::new(20, Duration::from_secs(15 * 60)),
            LimiterName::UpstreamCatalog => LimitPolicy::new(60, Duration::from_secs(60)),
        }
    }
}

impl std::fmt::Display for LimiterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LimiterName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("unknown limiter '{}'", s),
                    ErrorContext::new().with_source("limiter_policy"),
                )
            })
    }
}

/// `max_requests` per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl LimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyOverride {
    max_requests: u32,
    window_secs: u64,
}

/// Thresholds for every [`LimiterName`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterTable {
    policies: HashMap<LimiterName, LimitPolicy>,
}

impl Default for LimiterTable {
    fn default() -> Self {
        Self {
            policies: LimiterName::ALL
                .into_iter()
                .map(|name| (name, name.default_policy()))
                .collect(),
        }
    }
}

impl LimiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the named entries of `yaml` replacing their thresholds.
    ///
    /// ```yaml
    /// checkout:
    ///   max_requests: 10
    ///   window_secs: 900
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let overrides: HashMap<LimiterName, PolicyOverride> = serde_yaml::from_str(yaml)?;
        let mut table = Self::default();
        for (name, o) in overrides {
            if o.max_requests == 0 || o.window_secs == 0 {
                return Err(Error::configuration_with_context(
                    "limiter thresholds must be positive",
                    ErrorContext::new()
                        .with_field_path(format!("limits.{}", name))
                        .with_details(format!(
                            "max_requests={} window_secs={}",
                            o.max_requests, o.window_secs
                        )),
                ));
            }
            table.policies.insert(
                name,
                LimitPolicy::new(o.max_requests, Duration::from_secs(o.window_secs)),
            );
        }
        Ok(table)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn with_policy(mut self, name: LimiterName, policy: LimitPolicy) -> Self {
        self.policies.insert(name, policy);
        self
    }

    pub fn policy(&self, name: LimiterName) -> LimitPolicy {
        self.policies
            .get(&name)
            .copied()
            .unwrap_or_else(|| name.default_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let table = LimiterTable::default();
        assert_eq!(
            table.policy(LimiterName::CatalogRead),
            LimitPolicy::new(100, Duration::from_secs(60))
        );
        assert_eq!(
            table.policy(LimiterName::Checkout),
            LimitPolicy::new(5, Duration::from_secs(900))
        );
        assert_eq!(table.policy(LimiterName::Validation).max_requests, 20);
    }

    #[test]
    fn test_yaml_overrides_only_named_entries() {
        let table = LimiterTable::from_yaml_str(
            "checkout:\n  max_requests: 10\n  window_secs: 600\n",
        )
        .unwrap();
        assert_eq!(
            table.policy(LimiterName::Checkout),
            LimitPolicy::new(10, Duration::from_secs(600))
        );
        assert_eq!(table.policy(LimiterName::CatalogRead).max_requests, 100);
    }

    #[test]
    fn test_yaml_rejects_unknown_names_and_zero() {
        assert!(LimiterTable::from_yaml_str("free-for-all:\n  max_requests: 1\n  window_secs: 1\n").is_err());
        let err = LimiterTable::from_yaml_str("checkout:\n  max_requests: 0\n  window_secs: 60\n")
            .unwrap_err();
        assert!(err.to_string().contains("limits.checkout"));
    }

    #[test]
    fn test_name_round_trip() {
        for name in LimiterName::ALL {
            assert_eq!(name.as_str().parse::<LimiterName>().unwrap(), name);
        }
        assert!("unlimited".parse::<LimiterName>().is_err());
    }
}
