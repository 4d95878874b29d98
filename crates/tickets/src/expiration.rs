//! Expiration policy engine.
//!
//! An [`ExpirationPolicy`] is a pure predicate over a ticket's
//! [`UsageStamps`] and the current time. Policies hold no per-ticket state;
//! one instance is shared (behind an [`Arc`](std::sync::Arc)) by every ticket
//! of a kind.
//!
//! Policies are plain data rather than trait objects so that they travel
//! with a ticket record through serializing registries.
//!
//! # Boundaries
//!
//! Every time limit is strict: a ticket with a hard lifetime of `H` is still
//! valid at exactly `created_at + H` and expired one nanosecond later.
//!
//! # Composition
//!
//! Whenever several sub-policies are combined, the ticket is expired if
//! *any* of them says so.
//!
//! ```
//! use std::time::Duration;
//!
//! use chrono::{TimeDelta, Utc};
//! use sso_tickets::{ExpirationPolicy, UsageStamps};
//!
//! let policy = ExpirationPolicy::ticket_granting(
//!     Duration::from_secs(8 * 3600),
//!     Duration::from_secs(2 * 3600),
//! );
//! let created = Utc::now();
//! let stamps = UsageStamps { created_at: created, last_used_at: created, usage_count: 0 };
//!
//! assert!(!policy.is_expired(&stamps, created + TimeDelta::hours(2)));
//! assert!(policy.is_expired(&stamps, created + TimeDelta::hours(3)));
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// The inputs an expiration policy may look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStamps {
    /// When the ticket was created.
    pub created_at: DateTime<Utc>,
    /// When the ticket was last used (equal to `created_at` before first use).
    pub last_used_at: DateTime<Utc>,
    /// How many times the ticket has been used.
    pub usage_count: u32,
}

/// Composable, stateless expiration predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// Expired once `now - created_at > max_lifetime`, regardless of activity.
    HardTimeout {
        /// Absolute lifetime.
        #[serde(with = "humantime_serde")]
        max_lifetime: Duration,
    },

    /// Expired once `now - last_used_at > idle_timeout`.
    IdleTimeout {
        /// Allowed inactivity.
        #[serde(with = "humantime_serde")]
        idle_timeout: Duration,
    },

    /// Session policy: expired when either the hard or the idle limit is hit.
    TicketGranting {
        /// Absolute session lifetime.
        #[serde(with = "humantime_serde")]
        max_lifetime: Duration,
        /// Allowed inactivity.
        #[serde(with = "humantime_serde")]
        idle_timeout: Duration,
    },

    /// Expired once `usage_count >= max_uses`, or when `within` expires.
    MultiUse {
        /// Number of uses before the ticket is exhausted.
        max_uses: u32,
        /// Time-based sub-policy.
        within: Box<ExpirationPolicy>,
    },

    /// Never expires with time; only explicit revocation ends the ticket.
    NeverExpires,

    /// Expired when any of the policies is expired. An empty list never expires.
    AnyOf {
        /// The combined policies.
        policies: Vec<ExpirationPolicy>,
    },
}

impl ExpirationPolicy {
    /// Hard timeout policy.
    #[must_use]
    pub fn hard_timeout(max_lifetime: Duration) -> Self {
        Self::HardTimeout { max_lifetime }
    }

    /// Sliding idle timeout policy.
    #[must_use]
    pub fn idle_timeout(idle_timeout: Duration) -> Self {
        Self::IdleTimeout { idle_timeout }
    }

    /// Combined hard and idle policy for granting tickets.
    #[must_use]
    pub fn ticket_granting(max_lifetime: Duration, idle_timeout: Duration) -> Self {
        Self::TicketGranting { max_lifetime, idle_timeout }
    }

    /// Use-count policy bounded by a hard time-to-live, as used for one-time tickets.
    #[must_use]
    pub fn multi_use(max_uses: u32, time_to_live: Duration) -> Self {
        Self::MultiUse { max_uses, within: Box::new(Self::hard_timeout(time_to_live)) }
    }

    /// Evaluates the policy.
    #[must_use]
    pub fn is_expired(&self, stamps: &UsageStamps, now: DateTime<Utc>) -> bool {
        match self {
            Self::HardTimeout { max_lifetime } => exceeds(stamps.created_at, now, *max_lifetime),
            Self::IdleTimeout { idle_timeout } => exceeds(stamps.last_used_at, now, *idle_timeout),
            Self::TicketGranting { max_lifetime, idle_timeout } => {
                exceeds(stamps.created_at, now, *max_lifetime)
                    || exceeds(stamps.last_used_at, now, *idle_timeout)
            },
            Self::MultiUse { max_uses, within } => {
                stamps.usage_count >= *max_uses || within.is_expired(stamps, now)
            },
            Self::NeverExpires => false,
            Self::AnyOf { policies } => policies.iter().any(|policy| policy.is_expired(stamps, now)),
        }
    }

    /// Returns `true` if a use-count limit is part of this policy.
    #[must_use]
    pub fn limits_uses(&self) -> bool {
        match self {
            Self::MultiUse { .. } => true,
            Self::AnyOf { policies } => policies.iter().any(Self::limits_uses),
            _ => false,
        }
    }
}

/// `now - since > limit`, saturating: limits too large to represent never trigger.
fn exceeds(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    match TimeDelta::from_std(limit) {
        Ok(limit) => now.signed_duration_since(since) > limit,
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn stamps_at(created: DateTime<Utc>) -> UsageStamps {
        UsageStamps { created_at: created, last_used_at: created, usage_count: 0 }
    }

    #[test]
    fn test_hard_timeout_boundary_is_strict() {
        let created = Utc::now();
        let policy = ExpirationPolicy::hard_timeout(Duration::from_secs(600));
        let stamps = stamps_at(created);

        assert!(!policy.is_expired(&stamps, created + TimeDelta::seconds(600)));
        assert!(policy.is_expired(&stamps, created + TimeDelta::seconds(600) + TimeDelta::nanoseconds(1)));
    }

    #[test]
    fn test_hard_timeout_ignores_activity() {
        let created = Utc::now();
        let policy = ExpirationPolicy::hard_timeout(Duration::from_secs(60));
        let stamps = UsageStamps {
            created_at: created,
            last_used_at: created + TimeDelta::seconds(59),
            usage_count: 12,
        };
        assert!(policy.is_expired(&stamps, created + TimeDelta::seconds(61)));
    }

    #[test]
    fn test_idle_timeout_slides_with_use() {
        let created = Utc::now();
        let policy = ExpirationPolicy::idle_timeout(Duration::from_secs(60));
        let mut stamps = stamps_at(created);

        assert!(policy.is_expired(&stamps, created + TimeDelta::seconds(61)));
        stamps.last_used_at = created + TimeDelta::seconds(30);
        assert!(!policy.is_expired(&stamps, created + TimeDelta::seconds(61)));
    }

    #[test]
    fn test_ticket_granting_tighter_limit_wins() {
        let created = Utc::now();
        let policy =
            ExpirationPolicy::ticket_granting(Duration::from_secs(600), Duration::from_secs(60));
        let mut stamps = stamps_at(created);

        // Idle limit fires first.
        assert!(policy.is_expired(&stamps, created + TimeDelta::seconds(61)));

        // Kept active, the hard limit still fires.
        stamps.last_used_at = created + TimeDelta::seconds(590);
        assert!(!policy.is_expired(&stamps, created + TimeDelta::seconds(600)));
        assert!(policy.is_expired(&stamps, created + TimeDelta::seconds(601)));
    }

    #[rstest]
    #[case::unused(0, 0, false)]
    #[case::one_use_left(1, 0, false)]
    #[case::uses_exhausted(2, 0, true)]
    #[case::at_time_limit(0, 10, false)]
    #[case::past_time_limit(0, 11, true)]
    fn test_multi_use_counts_and_time(
        #[case] usage_count: u32,
        #[case] elapsed_secs: i64,
        #[case] expired: bool,
    ) {
        let created = Utc::now();
        let policy = ExpirationPolicy::multi_use(2, Duration::from_secs(10));
        let stamps = UsageStamps { created_at: created, last_used_at: created, usage_count };

        let now = created + TimeDelta::seconds(elapsed_secs);
        assert_eq!(policy.is_expired(&stamps, now), expired);
        assert!(policy.limits_uses());
    }

    #[test]
    fn test_never_expires() {
        let created = Utc::now();
        let stamps = stamps_at(created);
        assert!(!ExpirationPolicy::NeverExpires.is_expired(&stamps, created + TimeDelta::days(3650)));
        assert!(!ExpirationPolicy::NeverExpires.limits_uses());
    }

    #[test]
    fn test_any_of_fails_toward_expiry() {
        let created = Utc::now();
        let policy = ExpirationPolicy::AnyOf {
            policies: vec![
                ExpirationPolicy::NeverExpires,
                ExpirationPolicy::hard_timeout(Duration::from_secs(5)),
            ],
        };
        assert!(policy.is_expired(&stamps_at(created), created + TimeDelta::seconds(6)));

        let empty = ExpirationPolicy::AnyOf { policies: Vec::new() };
        assert!(!empty.is_expired(&stamps_at(created), created + TimeDelta::days(1)));
    }

    #[test]
    fn test_unrepresentable_limit_never_triggers() {
        let created = Utc::now();
        let policy = ExpirationPolicy::hard_timeout(Duration::MAX);
        assert!(!policy.is_expired(&stamps_at(created), created + TimeDelta::days(365 * 100)));
    }

    #[test]
    fn test_policy_serde_uses_humantime() {
        let policy = ExpirationPolicy::multi_use(1, Duration::from_secs(10));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["type"], "multi_use");
        assert_eq!(json["within"]["max_lifetime"], "10s");

        let back: ExpirationPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// The session policy is exactly the disjunction of its hard and idle limits.
            #[test]
            fn ticket_granting_is_hard_or_idle(
                hard in 1u64..100_000,
                idle in 1u64..100_000,
                used_after in 0i64..100_000,
                elapsed in 0i64..200_000,
            ) {
                let created = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_000);
                let stamps = UsageStamps {
                    created_at: created,
                    last_used_at: created + TimeDelta::seconds(used_after.min(elapsed)),
                    usage_count: 0,
                };
                let now = created + TimeDelta::seconds(elapsed);

                let combined = ExpirationPolicy::ticket_granting(
                    Duration::from_secs(hard),
                    Duration::from_secs(idle),
                );
                let expected = (now - stamps.created_at) > TimeDelta::seconds(hard as i64)
                    || (now - stamps.last_used_at) > TimeDelta::seconds(idle as i64);

                prop_assert_eq!(combined.is_expired(&stamps, now), expected);
            }

            /// Adding a policy to an `AnyOf` can only make tickets expire sooner.
            #[test]
            fn any_of_is_monotonic(
                a in 1u64..1_000,
                b in 1u64..1_000,
                elapsed in 0i64..2_000,
            ) {
                let created = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_000);
                let stamps = UsageStamps { created_at: created, last_used_at: created, usage_count: 0 };
                let now = created + TimeDelta::seconds(elapsed);

                let single = ExpirationPolicy::AnyOf {
                    policies: vec![ExpirationPolicy::hard_timeout(Duration::from_secs(a))],
                };
                let both = ExpirationPolicy::AnyOf {
                    policies: vec![
                        ExpirationPolicy::hard_timeout(Duration::from_secs(a)),
                        ExpirationPolicy::idle_timeout(Duration::from_secs(b)),
                    ],
                };

                prop_assert!(!single.is_expired(&stamps, now) || both.is_expired(&stamps, now));
            }
        }
    }
}
