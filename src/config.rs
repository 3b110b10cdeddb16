//! Configuration loading.
//!
//! A YAML file (every field optional) plus `GATEKEEPER_*` environment
//! overrides:
//!
//! - `GATEKEEPER_BUDGET_LIMIT_CENTS`
//! - `GATEKEEPER_BUDGET_PERIOD_DAYS`
//! - `GATEKEEPER_BUDGET_ROLLOVER` (`1`, `true`, `yes`, `on`)
//! - `GATEKEEPER_DISPATCH_TIMEOUT_SECS`
//! - `GATEKEEPER_RECONCILE_INTERVAL_SECS`
//! - `GATEKEEPER_COST_TOLERANCE`
//! - `GATEKEEPER_DB_PATH`

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accountant::AccountantConfig;
use crate::breaker::BreakerConfig;
use crate::budget::{Budget, ModelPricing, RoutingPolicy};
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub limit_cents: u64,
    pub period_days: u32,
    /// Carry the closing remaining figure into the next period.
    pub rollover: bool,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            limit_cents: 10_000,
            period_days: 30,
            rollover: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub dispatch_timeout_secs: u64,
    /// How often deferred settlements are retried and orphans reaped.
    pub reconcile_interval_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: 120,
            reconcile_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub budget: BudgetSection,
    pub breaker: BreakerConfig,
    pub supervisor: SupervisorSection,
    pub routing: RoutingPolicy,
    pub pricing: ModelPricing,
    pub cost_tolerance: f64,
    /// SQLite ledger file; in-memory when absent.
    pub db_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            budget: BudgetSection::default(),
            breaker: BreakerConfig::default(),
            supervisor: SupervisorSection::default(),
            routing: RoutingPolicy::default(),
            pricing: ModelPricing::default(),
            cost_tolerance: 0.25,
            db_path: None,
        }
    }
}

impl Config {
    /// Load from `path` (defaults when `None`), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `GATEKEEPER_*` overrides looked up through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("GATEKEEPER_BUDGET_LIMIT_CENTS") {
            self.budget.limit_cents = parse_var("GATEKEEPER_BUDGET_LIMIT_CENTS", &v)?;
        }
        if let Some(v) = lookup("GATEKEEPER_BUDGET_PERIOD_DAYS") {
            self.budget.period_days = parse_var("GATEKEEPER_BUDGET_PERIOD_DAYS", &v)?;
        }
        if let Some(v) = lookup("GATEKEEPER_BUDGET_ROLLOVER") {
            self.budget.rollover = matches!(
                v.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            );
        }
        if let Some(v) = lookup("GATEKEEPER_DISPATCH_TIMEOUT_SECS") {
            self.supervisor.dispatch_timeout_secs =
                parse_var("GATEKEEPER_DISPATCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("GATEKEEPER_RECONCILE_INTERVAL_SECS") {
            self.supervisor.reconcile_interval_secs =
                parse_var("GATEKEEPER_RECONCILE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("GATEKEEPER_COST_TOLERANCE") {
            self.cost_tolerance = parse_var("GATEKEEPER_COST_TOLERANCE", &v)?;
        }
        if let Some(v) = lookup("GATEKEEPER_DB_PATH") {
            let v = v.trim();
            self.db_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.period_days == 0 {
            return Err(ConfigError::Invalid("budget.period_days must be at least 1".to_string()));
        }
        if self.supervisor.dispatch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.dispatch_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.supervisor.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        if !self.cost_tolerance.is_finite() || self.cost_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cost_tolerance must be a non-negative number, got {}",
                self.cost_tolerance
            )));
        }
        if !(0.0..=1.0).contains(&self.routing.frontier_complexity) {
            return Err(ConfigError::Invalid(format!(
                "routing.frontier_complexity must be within [0, 1], got {}",
                self.routing.frontier_complexity
            )));
        }
        for (class, price) in [("local", self.pricing.local), ("frontier", self.pricing.frontier)] {
            if !price.cents_per_1k_tokens.is_finite() || price.cents_per_1k_tokens < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "pricing.{}.cents_per_1k_tokens must be non-negative",
                    class
                )));
            }
        }
        self.breaker
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("breaker: {}", e)))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.dispatch_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.reconcile_interval_secs)
    }

    /// The budget period starting at `start`.
    pub fn budget_starting(&self, start: DateTime<Utc>) -> Result<Budget, ConfigError> {
        Budget::for_period(
            self.budget.limit_cents,
            start,
            chrono::Duration::days(i64::from(self.budget.period_days)),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Stale reservations are those older than the dispatch timeout.
    pub fn accountant(&self) -> AccountantConfig {
        AccountantConfig {
            breaker: self.breaker,
            cost_tolerance: self.cost_tolerance,
            stale_after: self.dispatch_timeout(),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            dispatch_timeout: self.dispatch_timeout(),
            routing: self.routing,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}={:?}: {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_is_default() {
        let config = Config::from_yaml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let config = Config::from_yaml_str(
            "budget:\n  limit_cents: 2500\n  rollover: true\nbreaker:\n  consecutive_failures: 3\ncost_tolerance: 0.1\n",
        )
        .unwrap();
        assert_eq!(config.budget.limit_cents, 2_500);
        assert_eq!(config.budget.period_days, 30);
        assert!(config.budget.rollover);
        assert_eq!(config.breaker.consecutive_failures, 3);
        assert_eq!(config.breaker.trial_admissions, 3);
        assert_eq!(config.cost_tolerance, 0.1);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GATEKEEPER_BUDGET_LIMIT_CENTS", "900"),
            ("GATEKEEPER_BUDGET_ROLLOVER", "yes"),
            ("GATEKEEPER_DISPATCH_TIMEOUT_SECS", "15"),
            ("GATEKEEPER_RECONCILE_INTERVAL_SECS", "5"),
            ("GATEKEEPER_DB_PATH", "/var/lib/gatekeeper/ledger.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.budget.limit_cents, 900);
        assert!(config.budget.rollover);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(15));
        assert_eq!(config.accountant().stale_after, Duration::from_secs(15));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(
            config.db_path.as_deref(),
            Some(Path::new("/var/lib/gatekeeper/ledger.db"))
        );
    }

    #[test]
    fn test_bad_override() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == "GATEKEEPER_BUDGET_LIMIT_CENTS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.cost_tolerance = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.reconcile_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.breaker.trial_admissions = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatekeeper.yaml");
        std::fs::write(&path, "budget:\n  limit_cents: 1234\n").unwrap();
        let config = Config::from_yaml_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.budget.limit_cents, 1_234);

        let missing = Config::load(Some(&dir.path().join("absent.yaml")));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
