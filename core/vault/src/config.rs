//! Session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use passvault_common::{Error, Result};
use passvault_crypto::KdfParams;

/// Environment variable overriding the auto-lock timeout, in minutes.
pub const ENV_AUTO_LOCK_MINUTES: &str = "PASSVAULT_AUTO_LOCK_MINUTES";
/// Environment variable overriding the failed unlock threshold.
pub const ENV_MAX_UNLOCK_ATTEMPTS: &str = "PASSVAULT_MAX_UNLOCK_ATTEMPTS";
/// Environment variable overriding the base lockout, in seconds.
pub const ENV_LOCKOUT_SECONDS: &str = "PASSVAULT_LOCKOUT_SECONDS";

/// Unlock throttling policy.
///
/// After `max_attempts` consecutive failures the vault is locked out for
/// `lockout_secs`, doubling with every further failure up to
/// `max_lockout_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub lockout_secs: u64,
    pub max_lockout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_secs: 30,
            max_lockout_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    /// Lockout length after `failures` consecutive failures, or `None`
    /// while still under the threshold.
    pub fn lockout_for(&self, failures: u32) -> Option<Duration> {
        if failures < self.max_attempts {
            return None;
        }
        let excess = (failures - self.max_attempts).min(31);
        let secs = self
            .lockout_secs
            .saturating_mul(1u64 << excess)
            .min(self.max_lockout_secs)
            .max(1);
        Some(Duration::from_secs(secs))
    }
}

/// Configuration for a `SessionManager`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity window before the session locks.
    pub auto_lock_timeout_secs: u64,
    /// Poll interval while an expired lock is deferred in the foreground.
    pub foreground_poll_interval_secs: u64,
    pub rate_limit: RateLimitConfig,
    /// Age after which a biometric key should be rotated.
    pub biometric_rotation_days: i64,
    /// KDF parameters for newly written headers and exports.
    pub kdf: KdfParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_lock_timeout_secs: 300,
            foreground_poll_interval_secs: 5,
            rate_limit: RateLimitConfig::default(),
            biometric_rotation_days: 90,
            kdf: KdfParams::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("Invalid value for {}", name)))
}

impl SessionConfig {
    pub fn auto_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_lock_timeout_secs)
    }

    pub fn foreground_poll_interval(&self) -> Duration {
        Duration::from_secs(self.foreground_poll_interval_secs.max(1))
    }

    pub fn biometric_rotation_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.biometric_rotation_days)
    }

    /// Defaults overlaid with the `PASSVAULT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values looked up by environment variable name.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_AUTO_LOCK_MINUTES) {
            let minutes: u64 = parse_var(ENV_AUTO_LOCK_MINUTES, &value)?;
            self.auto_lock_timeout_secs = minutes.saturating_mul(60);
        }
        if let Some(value) = lookup(ENV_MAX_UNLOCK_ATTEMPTS) {
            self.rate_limit.max_attempts = parse_var(ENV_MAX_UNLOCK_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCKOUT_SECONDS) {
            self.rate_limit.lockout_secs = parse_var(ENV_LOCKOUT_SECONDS, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values that would disable a protection outright.
    pub fn validate(&self) -> Result<()> {
        if self.auto_lock_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "Auto-lock timeout must be positive".to_string(),
            ));
        }
        if self.rate_limit.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "Unlock attempt threshold must be positive".to_string(),
            ));
        }
        if self.rate_limit.lockout_secs == 0 {
            return Err(Error::InvalidInput(
                "Lockout duration must be positive".to_string(),
            ));
        }
        if self.rate_limit.max_lockout_secs < self.rate_limit.lockout_secs {
            return Err(Error::InvalidInput(
                "Maximum lockout is shorter than the base lockout".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.auto_lock_timeout(), Duration::from_secs(300));
        assert_eq!(config.rate_limit.max_attempts, 5);
        assert_eq!(config.biometric_rotation_days, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = SessionConfig::default()
            .with_overrides(lookup(&[
                (ENV_AUTO_LOCK_MINUTES, "2"),
                (ENV_MAX_UNLOCK_ATTEMPTS, "3"),
                (ENV_LOCKOUT_SECONDS, " 10 "),
            ]))
            .unwrap();

        assert_eq!(config.auto_lock_timeout_secs, 120);
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.lockout_secs, 10);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = SessionConfig::default().with_overrides(lookup(&[(ENV_AUTO_LOCK_MINUTES, "soon")]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let result = SessionConfig::default().with_overrides(lookup(&[(ENV_MAX_UNLOCK_ATTEMPTS, "0")]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let result = SessionConfig::default().with_overrides(lookup(&[(ENV_LOCKOUT_SECONDS, "0")]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_zero_lockout_rejected() {
        let mut config = SessionConfig::default();
        config.rate_limit.lockout_secs = 0;
        config.rate_limit.max_lockout_secs = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));

        let json = r#"{"rate_limit": {"lockout_secs": 0, "max_lockout_secs": 0}}"#;
        assert!(matches!(
            SessionConfig::from_json(json),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_and_partial() {
        let mut config = SessionConfig::default();
        config.auto_lock_timeout_secs = 60;
        let restored = SessionConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);

        let partial = SessionConfig::from_json(r#"{"auto_lock_timeout_secs": 42}"#).unwrap();
        assert_eq!(partial.auto_lock_timeout_secs, 42);
        assert_eq!(partial.rate_limit, RateLimitConfig::default());
    }

    #[test]
    fn test_lockout_schedule() {
        let policy = RateLimitConfig {
            max_attempts: 3,
            lockout_secs: 30,
            max_lockout_secs: 100,
        };

        assert_eq!(policy.lockout_for(2), None);
        assert_eq!(policy.lockout_for(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.lockout_for(4), Some(Duration::from_secs(60)));
        assert_eq!(policy.lockout_for(5), Some(Duration::from_secs(100)));
        assert_eq!(policy.lockout_for(500), Some(Duration::from_secs(100)));
    }
}
