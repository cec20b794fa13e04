//! Ban check for authenticated requests.
//!
//! Resolves the caller through the [`UserCache`] under a short deadline and
//! reports whether the account is banned. Any failure to resolve the user
//! (loader error, missing row, timeout) lets the request through: a flaky
//! database must not lock every user out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::cache::UserCache;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::profile::{BanInfo, Bannable};

/// Default deadline for resolving a user during a ban check.
pub const DEFAULT_BAN_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Error code reported to banned callers.
pub const USER_BANNED_CODE: &str = "USER_BANNED";

/// Result of a ban check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanDecision {
    /// Not banned, or the ban state could not be determined.
    Allowed,
    /// The account is banned.
    Banned(BanInfo),
}

impl BanDecision {
    #[must_use]
    pub fn is_banned(&self) -> bool {
        matches!(self, Self::Banned(_))
    }

    /// Response body for a banned caller, or `None` when allowed.
    #[must_use]
    pub fn rejection(&self) -> Option<BanRejection> {
        match self {
            Self::Allowed => None,
            Self::Banned(ban) => Some(BanRejection {
                success: false,
                error_code: USER_BANNED_CODE,
                ban_reason: ban.reason.clone(),
                banned_at: ban.banned_at,
                unban_at: ban.unban_at,
                permanent: ban.is_permanent().then_some(true),
            }),
        }
    }
}

/// JSON body returned to a banned caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRejection {
    pub success: bool,
    pub error_code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unban_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permanent: Option<bool>,
}

/// Checks callers against their cached ban state.
pub struct BanCheck<P> {
    cache: Arc<UserCache<P>>,
    timeout: Duration,
    metrics: Option<Metrics>,
}

impl<P: Bannable + Clone + Send + Sync + 'static> BanCheck<P> {
    /// Creates a check that gives up on resolving a user after `timeout`.
    pub fn new(cache: Arc<UserCache<P>>, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "ban check timeout must be positive".to_string(),
            ));
        }

        Ok(Self {
            cache,
            timeout,
            metrics: None,
        })
    }

    /// Configured deadline for resolving a user.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolves `user_id` (loading on a miss) and decides whether it is
    /// banned. Never fails: unresolvable users are allowed.
    ///
    /// `cancel` is the request's token; the check also gives up after the
    /// configured timeout.
    pub async fn check<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        loader: F,
    ) -> BanDecision
    where
        F: FnOnce(CancellationToken, i64) -> Fut,
        Fut: Future<Output = std::result::Result<Option<P>, E>>,
        E: std::fmt::Display,
    {
        let deadline = cancel.child_token();
        let lookup = self.cache.get_or_load(&deadline, user_id, loader);

        let profile = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                error!(user_id, error = %e, "Failed to resolve user for ban check, allowing");
                self.record("error");
                return BanDecision::Allowed;
            }
            Err(_) => {
                deadline.cancel();
                error!(
                    user_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Ban check timed out, allowing"
                );
                self.record("timeout");
                return BanDecision::Allowed;
            }
        };

        if !profile.is_banned() {
            self.record("clear");
            return BanDecision::Allowed;
        }

        let ban = profile.ban().cloned().unwrap_or(BanInfo {
            reason: None,
            banned_at: None,
            unban_at: None,
        });
        warn!(
            user_id,
            reason = ban.reason.as_deref().unwrap_or(""),
            "Banned user attempted access"
        );
        self.record("banned");
        BanDecision::Banned(ban)
    }

    fn record(&self, outcome: &str) {
        if let Some(ref m) = self.metrics {
            m.record_ban_check(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::UserProfile;
    use chrono::{TimeDelta, Utc};
    use std::convert::Infallible;

    fn cache() -> Arc<UserCache<UserProfile>> {
        Arc::new(UserCache::new(10, Duration::from_secs(60)).unwrap())
    }

    fn banned(id: i64, unban_at: Option<chrono::DateTime<Utc>>) -> UserProfile {
        UserProfile::new(id, "mallory", "m@example.com").with_ban(BanInfo {
            reason: Some("abuse".to_string()),
            banned_at: Some(Utc::now()),
            unban_at,
        })
    }

    #[tokio::test]
    async fn test_clear_user_is_allowed() {
        let check = BanCheck::new(cache(), DEFAULT_BAN_CHECK_TIMEOUT).unwrap();
        let cancel = CancellationToken::new();

        let decision = check
            .check(&cancel, 1, |_, id| async move {
                Ok::<_, Infallible>(Some(UserProfile::new(id, "ada", "ada@example.com")))
            })
            .await;
        assert_eq!(decision, BanDecision::Allowed);
        assert!(decision.rejection().is_none());
    }

    #[tokio::test]
    async fn test_banned_user_is_rejected() {
        let cache = cache();
        cache.set(2, banned(2, None)).await;
        let check = BanCheck::new(cache, DEFAULT_BAN_CHECK_TIMEOUT).unwrap();

        let decision = check
            .check(&CancellationToken::new(), 2, |_, _| async {
                Err::<Option<UserProfile>, _>("loader must not run")
            })
            .await;
        assert!(decision.is_banned());

        let body = serde_json::to_value(decision.rejection().unwrap()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], USER_BANNED_CODE);
        assert_eq!(body["banReason"], "abuse");
        assert_eq!(body["permanent"], true);
        assert!(body.get("unbanAt").is_none());
    }

    #[tokio::test]
    async fn test_lapsed_ban_is_allowed() {
        let cache = cache();
        cache
            .set(3, banned(3, Some(Utc::now() - TimeDelta::minutes(1))))
            .await;
        let check = BanCheck::new(cache, DEFAULT_BAN_CHECK_TIMEOUT).unwrap();

        let decision = check
            .check(&CancellationToken::new(), 3, |_, _| async {
                Ok::<Option<UserProfile>, Infallible>(None)
            })
            .await;
        assert_eq!(decision, BanDecision::Allowed);
    }

    #[tokio::test]
    async fn test_loader_error_fails_open() {
        let metrics = Metrics::new().unwrap();
        let check = BanCheck::new(cache(), DEFAULT_BAN_CHECK_TIMEOUT)
            .unwrap()
            .with_metrics(metrics.clone());

        let decision = check
            .check(&CancellationToken::new(), 4, |_, _| async {
                Err::<Option<UserProfile>, _>("connection refused")
            })
            .await;
        assert_eq!(decision, BanDecision::Allowed);
        assert_eq!(metrics.ban_checks_total.with_label_values(&["error"]).get(), 1);
    }

    #[tokio::test]
    async fn test_invalid_user_fails_open() {
        let check = BanCheck::new(cache(), DEFAULT_BAN_CHECK_TIMEOUT).unwrap();
        let decision = check
            .check(&CancellationToken::new(), 0, |_, _| async {
                Ok::<Option<UserProfile>, Infallible>(None)
            })
            .await;
        assert_eq!(decision, BanDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_open() {
        let metrics = Metrics::new().unwrap();
        let check = BanCheck::new(cache(), DEFAULT_BAN_CHECK_TIMEOUT)
            .unwrap()
            .with_metrics(metrics.clone());

        let decision = check
            .check(&CancellationToken::new(), 5, |cancel, _| async move {
                cancel.cancelled().await;
                Ok::<Option<UserProfile>, Infallible>(None)
            })
            .await;
        assert_eq!(decision, BanDecision::Allowed);
        assert_eq!(metrics.ban_checks_total.with_label_values(&["timeout"]).get(), 1);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(BanCheck::<UserProfile>::new(cache(), Duration::ZERO).is_err());

        let check = BanCheck::<UserProfile>::new(cache(), Duration::from_millis(250)).unwrap();
        assert_eq!(check.timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_banned_user_loaded_within_deadline_is_rejected() {
        let check = BanCheck::new(cache(), Duration::from_millis(500)).unwrap();

        let decision = check
            .check(&CancellationToken::new(), 6, |_, id| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok::<_, Infallible>(Some(banned(id, None)))
            })
            .await;
        assert!(decision.is_banned());
    }
}
