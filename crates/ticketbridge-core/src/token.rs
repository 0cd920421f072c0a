use chrono::{DateTime, TimeDelta, Utc};

use crate::error::TokenRecordError;
use crate::sensitive::Sensitive;

/// Lower bound between scheduling and firing a refresh, so a backend that
/// hands out already-expiring tokens cannot spin the refresh loop.
pub const MIN_REFRESH_DELAY_SECS: i64 = 30;

/// A backend bearer token with its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    token: Sensitive<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, TokenRecordError> {
        let token = token.into();
        if token.is_empty() {
            return Err(TokenRecordError::Empty);
        }
        if expires_at <= issued_at {
            return Err(TokenRecordError::NotAfterIssue {
                issued_at,
                expires_at,
            });
        }
        Ok(Self {
            token: Sensitive(token),
            issued_at,
            expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token.0
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// When the next refresh attempt fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    pub refresh_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl RefreshSchedule {
    /// `buffer` ahead of expiry, but never sooner than [`MIN_REFRESH_DELAY_SECS`].
    pub fn after_success(token: &TokenRecord, buffer: TimeDelta, now: DateTime<Utc>) -> Self {
        let preferred = token
            .expires_at
            .checked_sub_signed(buffer)
            .unwrap_or(token.issued_at);
        let floor = now + TimeDelta::seconds(MIN_REFRESH_DELAY_SECS);
        Self {
            refresh_at: preferred.max(floor),
            retry_count: 0,
        }
    }

    pub fn after_failure(
        previous: Option<&RefreshSchedule>,
        backoff: TimeDelta,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            refresh_at: now.checked_add_signed(backoff).unwrap_or(now),
            retry_count: previous.map_or(0, |s| s.retry_count).saturating_add(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-08-19T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn rejects_non_positive_lifetime() {
        let err = TokenRecord::new("tok", t0(), t0()).expect_err("same instant");
        assert!(matches!(err, TokenRecordError::NotAfterIssue { .. }));
        assert!(TokenRecord::new("tok", t0(), t0() - TimeDelta::seconds(1)).is_err());
        assert_eq!(
            TokenRecord::new("", t0(), t0() + TimeDelta::hours(1)),
            Err(TokenRecordError::Empty)
        );
    }

    #[test]
    fn debug_does_not_leak_token() {
        let rec = TokenRecord::new("secret-value", t0(), t0() + TimeDelta::hours(1)).expect("rec");
        assert!(!format!("{rec:?}").contains("secret-value"));
        assert_eq!(rec.token(), "secret-value");
    }

    #[test]
    fn schedule_refreshes_buffer_before_expiry() {
        let rec = TokenRecord::new("tok", t0(), t0() + TimeDelta::hours(1)).expect("rec");
        let s = RefreshSchedule::after_success(&rec, TimeDelta::minutes(5), t0());
        assert_eq!(s.refresh_at, t0() + TimeDelta::minutes(55));
        assert_eq!(s.retry_count, 0);
    }

    #[test]
    fn schedule_never_fires_immediately() {
        let rec = TokenRecord::new("tok", t0(), t0() + TimeDelta::minutes(2)).expect("rec");
        let s = RefreshSchedule::after_success(&rec, TimeDelta::minutes(5), t0());
        assert_eq!(s.refresh_at, t0() + TimeDelta::seconds(MIN_REFRESH_DELAY_SECS));
    }

    #[test]
    fn failures_back_off_and_count() {
        let first = RefreshSchedule::after_failure(None, TimeDelta::minutes(5), t0());
        assert_eq!(first.refresh_at, t0() + TimeDelta::minutes(5));
        assert_eq!(first.retry_count, 1);

        let later = t0() + TimeDelta::minutes(5);
        let second = RefreshSchedule::after_failure(Some(&first), TimeDelta::minutes(5), later);
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.refresh_at, later + TimeDelta::minutes(5));
    }
}
