//! Ticket and registry configuration.
//!
//! Both configurations deserialize with `humantime` durations, reject
//! unknown fields, and fall back to defaults for missing ones:
//!
//! ```
//! use sso_tickets::{RegistryConfig, TicketConfig};
//!
//! let tickets: TicketConfig = serde_json::from_str(r#"{ "tgt_idle_timeout": "30m" }"#).unwrap();
//! assert!(tickets.validate().unwrap().is_empty());
//!
//! let registry: RegistryConfig = serde_json::from_str(r#"{ "sweep_interval": "5m" }"#).unwrap();
//! assert!(registry.validate().is_ok());
//! ```
//!
//! Validation returns warnings instead of logging them, so the embedding
//! application decides how to surface them to the operator.
//! [`TicketService::warnings`](crate::TicketService::warnings) collects
//! them, together with [`ConfigWarning::VolatileStorage`] when the
//! registry it runs on keeps tickets in process memory.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{TicketError, TicketResult},
    expiration::ExpirationPolicy,
};

/// Default absolute TGT and PGT lifetime (8 hours).
pub const DEFAULT_TGT_MAX_LIFETIME: Duration = Duration::from_secs(8 * 60 * 60);

/// Default TGT and PGT idle timeout (2 hours).
pub const DEFAULT_TGT_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Default lifetime of remember-me sessions (14 days).
pub const DEFAULT_REMEMBER_ME_LIFETIME: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Default ST and PT time-to-live (10 seconds).
pub const DEFAULT_ONE_TIME_TTL: Duration = Duration::from_secs(10);

/// Default number of uses of an ST or PT.
pub const DEFAULT_ONE_TIME_USES: u32 = 1;

/// Default retention of consumed-ticket tombstones (24 hours).
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default maximum number of tombstones held in memory.
pub const DEFAULT_TOMBSTONE_CAPACITY: u64 = 100_000;

/// Default bound on a single backend call (5 seconds).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between expiration sweeps (2 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Lifetime of remember-me sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RememberMeLifetime {
    /// Hard lifetime; activity does not extend it.
    Expires(#[serde(with = "humantime_serde")] Duration),
    /// Only explicit logout ends the session.
    Never,
}

impl Default for RememberMeLifetime {
    fn default() -> Self {
        Self::Expires(DEFAULT_REMEMBER_ME_LIFETIME)
    }
}

/// Lifetimes and use limits per ticket kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct TicketConfig {
    /// Absolute TGT lifetime.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_TGT_MAX_LIFETIME)]
    pub tgt_max_lifetime: Duration,

    /// TGT inactivity limit.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_TGT_IDLE_TIMEOUT)]
    pub tgt_idle_timeout: Duration,

    /// Lifetime of TGTs granted with remember-me.
    #[builder(default)]
    pub remember_me: RememberMeLifetime,

    /// ST time-to-live.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_ONE_TIME_TTL)]
    pub st_time_to_live: Duration,

    /// Uses allowed per ST.
    #[builder(default = DEFAULT_ONE_TIME_USES)]
    pub st_max_uses: u32,

    /// Absolute PGT lifetime.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_TGT_MAX_LIFETIME)]
    pub pgt_max_lifetime: Duration,

    /// PGT inactivity limit.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_TGT_IDLE_TIMEOUT)]
    pub pgt_idle_timeout: Duration,

    /// PT time-to-live.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_ONE_TIME_TTL)]
    pub pt_time_to_live: Duration,

    /// Uses allowed per PT.
    #[builder(default = DEFAULT_ONE_TIME_USES)]
    pub pt_max_uses: u32,

    /// Appended to every generated id, typically the node name.
    #[builder(into)]
    pub id_suffix: Option<String>,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TicketConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`] for zero durations or zero use limits.
    pub fn validate(&self) -> TicketResult<Vec<ConfigWarning>> {
        let durations = [
            ("tgt_max_lifetime", self.tgt_max_lifetime),
            ("tgt_idle_timeout", self.tgt_idle_timeout),
            ("st_time_to_live", self.st_time_to_live),
            ("pgt_max_lifetime", self.pgt_max_lifetime),
            ("pgt_idle_timeout", self.pgt_idle_timeout),
            ("pt_time_to_live", self.pt_time_to_live),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(TicketError::config(format!("{name} must be greater than zero")));
            }
        }
        if self.remember_me == RememberMeLifetime::Expires(Duration::ZERO) {
            return Err(TicketError::config("remember_me lifetime must be greater than zero"));
        }
        if self.st_max_uses == 0 {
            return Err(TicketError::config("st_max_uses must be at least 1"));
        }
        if self.pt_max_uses == 0 {
            return Err(TicketError::config("pt_max_uses must be at least 1"));
        }

        let mut warnings = Vec::new();
        if self.tgt_idle_timeout >= self.tgt_max_lifetime {
            warnings.push(ConfigWarning::IdleExceedsHardTimeout { kind: "tgt" });
        }
        if self.pgt_idle_timeout >= self.pgt_max_lifetime {
            warnings.push(ConfigWarning::IdleExceedsHardTimeout { kind: "pgt" });
        }
        Ok(warnings)
    }

    /// Builds the shared expiration policies.
    #[must_use]
    pub fn policies(&self) -> TicketPolicies {
        let remember_me = match self.remember_me {
            RememberMeLifetime::Expires(lifetime) => ExpirationPolicy::hard_timeout(lifetime),
            RememberMeLifetime::Never => ExpirationPolicy::NeverExpires,
        };
        TicketPolicies {
            ticket_granting: Arc::new(ExpirationPolicy::ticket_granting(
                self.tgt_max_lifetime,
                self.tgt_idle_timeout,
            )),
            remember_me: Arc::new(remember_me),
            service: Arc::new(ExpirationPolicy::multi_use(self.st_max_uses, self.st_time_to_live)),
            proxy_granting: Arc::new(ExpirationPolicy::ticket_granting(
                self.pgt_max_lifetime,
                self.pgt_idle_timeout,
            )),
            proxy: Arc::new(ExpirationPolicy::multi_use(self.pt_max_uses, self.pt_time_to_live)),
        }
    }
}

/// One shared policy instance per ticket kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPolicies {
    /// Regular TGTs.
    pub ticket_granting: Arc<ExpirationPolicy>,
    /// TGTs granted with remember-me.
    pub remember_me: Arc<ExpirationPolicy>,
    /// STs.
    pub service: Arc<ExpirationPolicy>,
    /// PGTs.
    pub proxy_granting: Arc<ExpirationPolicy>,
    /// PTs.
    pub proxy: Arc<ExpirationPolicy>,
}

/// Retry policy for idempotent registry reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[builder(default = 3)]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_millis(50))]
    pub initial_backoff: Duration,

    /// Upper bound on the delay between retries.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(2))]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Registry storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// How long consumed one-time tickets are remembered.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_TOMBSTONE_TTL)]
    pub tombstone_ttl: Duration,

    /// Maximum tombstones kept by the in-memory registry.
    #[builder(default = DEFAULT_TOMBSTONE_CAPACITY)]
    pub tombstone_capacity: u64,

    /// Bound on a single backend call.
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    pub operation_timeout: Duration,

    /// Retry policy for idempotent reads.
    #[builder(default)]
    pub retry: RetryConfig,

    /// Interval between expiration sweeps of a
    /// [`RegistryCleaner`](crate::RegistryCleaner).
    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_SWEEP_INTERVAL)]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RegistryConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`] for zero durations, a zero tombstone
    /// capacity, or an initial backoff above the maximum backoff.
    pub fn validate(&self) -> TicketResult<()> {
        let durations = [
            ("tombstone_ttl", self.tombstone_ttl),
            ("operation_timeout", self.operation_timeout),
            ("sweep_interval", self.sweep_interval),
            ("retry.max_backoff", self.retry.max_backoff),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(TicketError::config(format!("{name} must be greater than zero")));
            }
        }
        if self.tombstone_capacity == 0 {
            return Err(TicketError::config("tombstone_capacity must be at least 1"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(TicketError::config(format!(
                "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.retry.initial_backoff, self.retry.max_backoff
            )));
        }
        Ok(())
    }
}

/// Non-fatal configuration findings for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Tickets live in process memory; a restart logs every user out and
    /// nodes do not share sessions.
    VolatileStorage,
    /// The idle timeout of `kind` is not shorter than its hard lifetime, so
    /// it can never trigger.
    IdleExceedsHardTimeout {
        /// `"tgt"` or `"pgt"`.
        kind: &'static str,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VolatileStorage => write!(
                f,
                "tickets are kept in process memory: sessions are lost on restart and not shared between nodes"
            ),
            Self::IdleExceedsHardTimeout { kind } => {
                write!(f, "{kind} idle timeout is not shorter than its hard lifetime and never applies")
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_ticket_defaults() {
        let config = TicketConfig::default();
        assert_eq!(config.tgt_max_lifetime, DEFAULT_TGT_MAX_LIFETIME);
        assert_eq!(config.tgt_idle_timeout, DEFAULT_TGT_IDLE_TIMEOUT);
        assert_eq!(config.remember_me, RememberMeLifetime::Expires(DEFAULT_REMEMBER_ME_LIFETIME));
        assert_eq!(config.st_time_to_live, Duration::from_secs(10));
        assert_eq!(config.st_max_uses, 1);
        assert_eq!(config.pgt_max_lifetime, config.tgt_max_lifetime);
        assert_eq!(config.pt_max_uses, 1);
        assert_eq!(config.id_suffix, None);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_ticket_config_deserializes_humantime() {
        let config: TicketConfig = serde_json::from_str(
            r#"{ "tgt_max_lifetime": "1h", "st_time_to_live": "30s", "remember_me": "never", "id_suffix": "node1" }"#,
        )
        .unwrap();
        assert_eq!(config.tgt_max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.st_time_to_live, Duration::from_secs(30));
        assert_eq!(config.remember_me, RememberMeLifetime::Never);
        assert_eq!(config.id_suffix.as_deref(), Some("node1"));
        assert_eq!(config.tgt_idle_timeout, DEFAULT_TGT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = serde_json::from_str::<TicketConfig>(r#"{ "tgt_lifetime": "1h" }"#);
        assert!(result.is_err());
        let result = serde_json::from_str::<RegistryConfig>(r#"{ "ttl": "1h" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_values_are_errors() {
        let config = TicketConfig::builder().st_time_to_live(Duration::ZERO).build();
        assert!(matches!(config.validate(), Err(TicketError::Config { .. })));

        let config = TicketConfig::builder().pt_max_uses(0).build();
        assert!(config.validate().is_err());

        let config =
            TicketConfig::builder().remember_me(RememberMeLifetime::Expires(Duration::ZERO)).build();
        assert!(config.validate().is_err());

        let config = RegistryConfig::builder().tombstone_capacity(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_exceeding_hard_timeout_warns() {
        let config = TicketConfig::builder()
            .tgt_max_lifetime(Duration::from_secs(60))
            .tgt_idle_timeout(Duration::from_secs(120))
            .build();
        assert_eq!(
            config.validate().unwrap(),
            vec![ConfigWarning::IdleExceedsHardTimeout { kind: "tgt" }]
        );
    }

    #[rstest]
    #[case::tombstone_ttl(RegistryConfig::builder().tombstone_ttl(Duration::ZERO).build())]
    #[case::operation_timeout(RegistryConfig::builder().operation_timeout(Duration::ZERO).build())]
    #[case::sweep_interval(RegistryConfig::builder().sweep_interval(Duration::ZERO).build())]
    fn test_zero_registry_durations_are_errors(#[case] config: RegistryConfig) {
        assert!(matches!(config.validate(), Err(TicketError::Config { .. })));
    }

    #[test]
    fn test_registry_defaults_validate() {
        assert!(RegistryConfig::default().validate().is_ok());

        let result = serde_json::from_str::<RegistryConfig>(r#"{ "backend": "memory" }"#);
        assert!(result.is_err(), "the registry is chosen by construction, not by config");
    }

    #[test]
    fn test_backoff_order_checked() {
        let config = RegistryConfig::builder()
            .retry(
                RetryConfig::builder()
                    .initial_backoff(Duration::from_secs(5))
                    .max_backoff(Duration::from_secs(1))
                    .build(),
            )
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policies_follow_config() {
        let policies = TicketConfig::builder()
            .st_max_uses(3)
            .remember_me(RememberMeLifetime::Never)
            .build()
            .policies();
        assert_eq!(*policies.service, ExpirationPolicy::multi_use(3, DEFAULT_ONE_TIME_TTL));
        assert_eq!(*policies.remember_me, ExpirationPolicy::NeverExpires);
        assert!(policies.proxy.limits_uses());
        assert!(!policies.ticket_granting.limits_uses());
    }
}
