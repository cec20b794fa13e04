//! Cached user profile and ban state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anything that carries account ban state.
pub trait Bannable {
    /// Whether the account is banned at `now`.
    fn is_banned_at(&self, now: DateTime<Utc>) -> bool;

    /// Ban details, if the account carries any.
    fn ban(&self) -> Option<&BanInfo>;

    /// Whether the account is banned right now.
    fn is_banned(&self) -> bool {
        self.is_banned_at(Utc::now())
    }
}

/// Why and until when an account is banned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_at: Option<DateTime<Utc>>,
    /// `None` means the ban is permanent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unban_at: Option<DateTime<Utc>>,
}

impl BanInfo {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.unban_at.is_none()
    }

    /// A ban is in force until `unban_at` has passed.
    #[must_use]
    pub fn in_force_at(&self, now: DateTime<Utc>) -> bool {
        self.unban_at.is_none_or(|unban_at| now <= unban_at)
    }
}

/// The slice of a user record the request path needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban: Option<BanInfo>,
}

impl UserProfile {
    #[must_use]
    pub fn new(id: i64, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: email.into(),
            ban: None,
        }
    }

    #[must_use]
    pub fn with_ban(mut self, ban: BanInfo) -> Self {
        self.ban = Some(ban);
        self
    }
}

impl Bannable for UserProfile {
    fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.ban.as_ref().is_some_and(|ban| ban.in_force_at(now))
    }

    fn ban(&self) -> Option<&BanInfo> {
        self.ban.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn ban(unban_at: Option<DateTime<Utc>>) -> BanInfo {
        BanInfo {
            reason: Some("spam".to_string()),
            banned_at: Some(Utc::now()),
            unban_at,
        }
    }

    #[test]
    fn test_unbanned_profile() {
        let profile = UserProfile::new(1, "ada", "ada@example.com");
        assert!(!profile.is_banned());
        assert!(profile.ban().is_none());
    }

    #[test]
    fn test_permanent_ban() {
        let profile = UserProfile::new(1, "ada", "ada@example.com").with_ban(ban(None));
        assert!(profile.is_banned());
        assert!(profile.ban().unwrap().is_permanent());
        assert!(profile.is_banned_at(Utc::now() + TimeDelta::days(3650)));
    }

    #[test]
    fn test_temporary_ban_lapses() {
        let now = Utc::now();
        let profile = UserProfile::new(2, "bob", "bob@example.com")
            .with_ban(ban(Some(now + TimeDelta::hours(1))));

        assert!(profile.is_banned_at(now));
        assert!(!profile.is_banned_at(now + TimeDelta::hours(2)));
        assert!(!profile.ban().unwrap().is_permanent());
    }

    #[test]
    fn test_serialization_is_camel_case() {
        let profile = UserProfile::new(3, "cy", "cy@example.com").with_ban(BanInfo {
            reason: None,
            banned_at: None,
            unban_at: None,
        });
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["id"], 3);
        assert!(json["ban"].is_object());
        assert!(json["ban"].get("unbanAt").is_none());

        let back: UserProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }
}
