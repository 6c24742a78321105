//! Freshness guard
//!
//! Rejects requests whose claimed timestamp is too far from server time.
//! Runs before any signature check or store access.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default allowed clock skew (5 minutes)
pub const DEFAULT_ALLOWED_SKEW_MS: u64 = 5 * 60 * 1000;

/// A request timestamp in Unix milliseconds, kept exactly as the caller
/// sent it because the original text is part of the signed message.
///
/// Accepts a JSON string or a JSON integer; integers are normalised to
/// their decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Current server time
    pub fn now() -> Self {
        Self(now_millis().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed milliseconds, if the text is an integer
    pub fn millis(&self) -> Option<i64> {
        self.0.trim().parse().ok()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Timestamp(s),
            Raw::Signed(n) => Timestamp(n.to_string()),
            Raw::Unsigned(n) => Timestamp(n.to_string()),
        })
    }
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stateless freshness check with a configurable skew window
#[derive(Debug, Clone, Copy)]
pub struct FreshnessGuard {
    allowed_skew_ms: i64,
}

impl Default for FreshnessGuard {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_ALLOWED_SKEW_MS))
    }
}

impl FreshnessGuard {
    pub fn new(allowed_skew: Duration) -> Self {
        Self {
            allowed_skew_ms: i64::try_from(allowed_skew.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn allowed_skew(&self) -> Duration {
        Duration::from_millis(self.allowed_skew_ms as u64)
    }

    /// True iff the timestamp is within the window around server time
    pub fn check(&self, claimed: &Timestamp) -> bool {
        self.check_at(claimed, now_millis())
    }

    /// Same as [`check`](Self::check) against an explicit "now"
    pub fn check_at(&self, claimed: &Timestamp, now_ms: i64) -> bool {
        match claimed.millis() {
            Some(claimed_ms) => now_ms.abs_diff(claimed_ms) <= self.allowed_skew_ms as u64,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_window() {
        let guard = FreshnessGuard::new(Duration::from_secs(60));
        let now = 1_700_000_000_000;

        assert!(guard.check_at(&Timestamp::new(now.to_string()), now));
        assert!(guard.check_at(&Timestamp::new((now - 60_000).to_string()), now));
        assert!(guard.check_at(&Timestamp::new((now + 60_000).to_string()), now));
    }

    #[test]
    fn test_outside_window() {
        let guard = FreshnessGuard::new(Duration::from_secs(60));
        let now = 1_700_000_000_000;

        assert!(!guard.check_at(&Timestamp::new((now - 60_001).to_string()), now));
        assert!(!guard.check_at(&Timestamp::new((now + 60_001).to_string()), now));
    }

    #[test]
    fn test_unparseable_timestamp_is_stale() {
        let guard = FreshnessGuard::default();
        assert!(!guard.check(&Timestamp::new("yesterday")));
        assert!(!guard.check(&Timestamp::new("")));
    }

    #[test]
    fn test_now_is_fresh() {
        assert!(FreshnessGuard::default().check(&Timestamp::now()));
    }

    #[test]
    fn test_timestamp_accepts_numbers_and_strings() {
        let from_str: Timestamp = serde_json::from_str(r#""1700000000000""#).unwrap();
        let from_num: Timestamp = serde_json::from_str("1700000000000").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(from_num.as_str(), "1700000000000");
    }
}
