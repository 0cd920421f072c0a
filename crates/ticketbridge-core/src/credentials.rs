//! Keeps a backend token warm so request handlers never pay for authentication.
//!
//! The manager owns exactly one [`TokenRecord`] and a single refresh timer. The
//! timer is a spawned task that sleeps until the scheduled refresh instant; it
//! holds only a `Weak` reference to the manager and a generation number, so a
//! dropped manager or a superseded schedule makes it exit without effect.
//!
//! Lock order: `auth_lock` (held across the slow backend call) before `inner`
//! (held only for short state updates, never across an await on the backend).

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AuthError, CredentialError};
use crate::token::{RefreshSchedule, TokenRecord};
use crate::Authenticator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Uninitialized,
    Authenticating,
    Warm,
    Refreshing,
    FailedRetryPending,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialState::Uninitialized => "uninitialized",
            CredentialState::Authenticating => "authenticating",
            CredentialState::Warm => "warm",
            CredentialState::Refreshing => "refreshing",
            CredentialState::FailedRetryPending => "failed_retry_pending",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialConfig {
    /// How long before expiry the scheduled refresh fires.
    pub refresh_buffer: Duration,
    /// Delay before retrying after a failed attempt.
    pub retry_backoff: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(5 * 60),
            retry_backoff: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub has_token: bool,
    pub is_expired: bool,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub refresh_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Only reported while the timer is armed.
    pub next_refresh_in_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub state: CredentialState,
    pub running: bool,
    pub refresh_buffer_minutes: u64,
    pub retry_backoff_minutes: u64,
    pub token: TokenInfo,
    pub schedule: Option<ScheduleInfo>,
    pub last_error: Option<String>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    Scheduled,
    Forced,
    Rejected,
    Request,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Scheduled => "scheduled",
            Trigger::Forced => "forced",
            Trigger::Rejected => "rejected",
            Trigger::Request => "request",
        }
    }
}

struct TimerHandle {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    state: CredentialState,
    token: Option<TokenRecord>,
    schedule: Option<RefreshSchedule>,
    running: bool,
    last_error: Option<String>,
    last_refresh_at: Option<DateTime<Utc>>,
    timer: Option<TimerHandle>,
    generation: u64,
    /// Bumped on every completed authentication attempt.
    attempts: u64,
    last_failure: Option<AuthError>,
}

impl Inner {
    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.cancel.cancel();
            debug!(generation = t.generation, "cancelled scheduled token refresh");
        }
    }
}

struct Shared {
    authenticator: Arc<dyn Authenticator>,
    clock: Arc<dyn Clock>,
    cfg: CredentialConfig,
    refresh_buffer: TimeDelta,
    retry_backoff: TimeDelta,
    inner: Mutex<Inner>,
    auth_lock: Mutex<()>,
}

/// Credential session manager. Cheap to clone; clones share one token.
#[derive(Clone)]
pub struct CredentialManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("cfg", &self.shared.cfg)
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        cfg: CredentialConfig,
    ) -> Result<Self, CredentialError> {
        Self::with_clock(authenticator, cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(
        authenticator: Arc<dyn Authenticator>,
        cfg: CredentialConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CredentialError> {
        if cfg.retry_backoff.is_zero() {
            return Err(CredentialError::InvalidConfig(
                "retry backoff must be positive".to_string(),
            ));
        }
        let refresh_buffer = TimeDelta::from_std(cfg.refresh_buffer)
            .map_err(|e| CredentialError::InvalidConfig(format!("refresh buffer: {e}")))?;
        let retry_backoff = TimeDelta::from_std(cfg.retry_backoff)
            .map_err(|e| CredentialError::InvalidConfig(format!("retry backoff: {e}")))?;

        Ok(Self {
            shared: Arc::new(Shared {
                authenticator,
                clock,
                cfg,
                refresh_buffer,
                retry_backoff,
                inner: Mutex::new(Inner {
                    state: CredentialState::Uninitialized,
                    token: None,
                    schedule: None,
                    running: false,
                    last_error: None,
                    last_refresh_at: None,
                    timer: None,
                    generation: 0,
                    attempts: 0,
                    last_failure: None,
                }),
                auth_lock: Mutex::new(()),
            }),
        })
    }

    /// Begin keeping the token warm. Idempotent.
    ///
    /// Authenticates synchronously when no valid token is held. On failure a
    /// retry is armed and the error is returned.
    pub async fn start(&self) -> Result<(), CredentialError> {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.running = true;
            if self.rearm_if_warm(&mut inner) {
                return Ok(());
            }
        }

        let _auth = self.shared.auth_lock.lock().await;
        {
            // Another caller may have authenticated while we waited.
            let mut inner = self.shared.inner.lock().await;
            if !inner.running {
                return Ok(());
            }
            if self.rearm_if_warm(&mut inner) {
                return Ok(());
            }
        }
        info!("starting token prewarming; authenticating");
        self.attempt_locked(Trigger::Startup).await?;
        Ok(())
    }

    /// Cancel the refresh timer. The held token stays usable.
    pub async fn stop(&self) {
        let mut inner = self.shared.inner.lock().await;
        if !inner.running && inner.timer.is_none() {
            return;
        }
        inner.running = false;
        inner.cancel_timer();
        info!("token prewarming stopped");
    }

    /// Cancel any pending timer and authenticate now.
    pub async fn force_refresh(&self) -> Result<TokenRecord, CredentialError> {
        self.shared.inner.lock().await.cancel_timer();
        let _auth = self.shared.auth_lock.lock().await;
        info!("manual token refresh triggered");
        Ok(self.attempt_locked(Trigger::Forced).await?)
    }

    /// Refresh after the backend rejected `rejected`. Concurrent callers that
    /// saw the same rejected token share one authentication.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<TokenRecord, CredentialError> {
        let _auth = self.shared.auth_lock.lock().await;
        {
            let mut inner = self.shared.inner.lock().await;
            if let Some(t) = &inner.token
                && t.token() != rejected
            {
                return Ok(t.clone());
            }
            inner.cancel_timer();
        }
        warn!("backend rejected token; re-authenticating");
        Ok(self.attempt_locked(Trigger::Rejected).await?)
    }

    /// Snapshot of the held token, regardless of state or expiry.
    pub async fn current_token(&self) -> Option<TokenRecord> {
        self.shared.inner.lock().await.token.clone()
    }

    /// Token for a backend call. Returns the held token while it is unexpired;
    /// otherwise authenticates inline, with concurrent cold callers sharing a
    /// single authentication.
    ///
    /// A caller that waited behind a failed attempt gets that attempt's error
    /// instead of starting another one.
    pub async fn token_for_request(&self) -> Result<TokenRecord, CredentialError> {
        let seen = {
            let inner = self.shared.inner.lock().await;
            if let Some(t) = self.valid_token_of(&inner) {
                return Ok(t);
            }
            inner.attempts
        };

        let _auth = self.shared.auth_lock.lock().await;
        {
            let inner = self.shared.inner.lock().await;
            if let Some(t) = self.valid_token_of(&inner) {
                return Ok(t);
            }
            if inner.attempts != seen
                && let Some(e) = &inner.last_failure
            {
                debug!(error = %e, "sharing outcome of concurrent failed authentication");
                return Err(e.clone().into());
            }
        }
        info!("no valid token on request path; authenticating inline");
        Ok(self.attempt_locked(Trigger::Request).await?)
    }

    pub async fn token_info(&self) -> TokenInfo {
        let inner = self.shared.inner.lock().await;
        self.token_info_of(&inner)
    }

    pub async fn status(&self) -> CredentialStatus {
        let inner = self.shared.inner.lock().await;
        let now = self.shared.clock.now();
        let armed = inner.timer.is_some();
        CredentialStatus {
            state: inner.state,
            running: inner.running,
            refresh_buffer_minutes: self.shared.cfg.refresh_buffer.as_secs() / 60,
            retry_backoff_minutes: self.shared.cfg.retry_backoff.as_secs() / 60,
            token: self.token_info_of(&inner),
            schedule: inner.schedule.map(|s| ScheduleInfo {
                refresh_at: s.refresh_at,
                retry_count: s.retry_count,
                next_refresh_in_seconds: armed
                    .then(|| (s.refresh_at - now).num_seconds().max(0)),
            }),
            last_error: inner.last_error.clone(),
            last_refresh_at: inner.last_refresh_at,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.shared.inner.lock().await.running
    }

    fn valid_token_of(&self, inner: &Inner) -> Option<TokenRecord> {
        let now = self.shared.clock.now();
        inner.token.as_ref().filter(|t| t.is_valid_at(now)).cloned()
    }

    fn token_info_of(&self, inner: &Inner) -> TokenInfo {
        let now = self.shared.clock.now();
        TokenInfo {
            has_token: inner.token.is_some(),
            is_expired: inner.token.as_ref().is_none_or(|t| !t.is_valid_at(now)),
            issued_at: inner.token.as_ref().map(TokenRecord::issued_at),
            expires_at: inner.token.as_ref().map(TokenRecord::expires_at),
        }
    }

    /// With a valid token: make sure a timer is armed. A pending retry is left alone.
    fn rearm_if_warm(&self, inner: &mut Inner) -> bool {
        let now = self.shared.clock.now();
        let Some(token) = inner.token.as_ref().filter(|t| t.is_valid_at(now)) else {
            return false;
        };
        if inner.timer.is_none() {
            let schedule = inner
                .schedule
                .filter(|s| s.retry_count == 0)
                .unwrap_or_else(|| {
                    RefreshSchedule::after_success(token, self.shared.refresh_buffer, now)
                });
            inner.schedule = Some(schedule);
            inner.state = CredentialState::Warm;
            self.arm_timer(inner, schedule.refresh_at);
        }
        true
    }

    /// One authentication attempt. Caller must hold `auth_lock`.
    async fn attempt_locked(&self, trigger: Trigger) -> Result<TokenRecord, AuthError> {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.state = if inner.token.is_some() {
                CredentialState::Refreshing
            } else {
                CredentialState::Authenticating
            };
        }

        let started = tokio::time::Instant::now();
        let outcome = self.shared.authenticator.authenticate().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut inner = self.shared.inner.lock().await;
        let now = self.shared.clock.now();
        inner.attempts += 1;
        match outcome {
            Ok(token) => {
                inner.last_failure = None;
                let schedule =
                    RefreshSchedule::after_success(&token, self.shared.refresh_buffer, now);
                inner.token = Some(token.clone());
                inner.schedule = Some(schedule);
                inner.last_error = None;
                inner.last_refresh_at = Some(now);
                inner.state = CredentialState::Warm;
                if inner.running {
                    self.arm_timer(&mut inner, schedule.refresh_at);
                }
                ticketbridge_otel::metrics().record_token_refresh(trigger.as_str(), "success");
                info!(
                    trigger = trigger.as_str(),
                    elapsed_ms,
                    expires_at = %token.expires_at(),
                    refresh_at = %schedule.refresh_at,
                    "backend token refreshed"
                );
                Ok(token)
            }
            Err(e) => {
                let schedule = RefreshSchedule::after_failure(
                    inner.schedule.as_ref(),
                    self.shared.retry_backoff,
                    now,
                );
                inner.schedule = Some(schedule);
                inner.last_error = Some(e.to_string());
                inner.last_failure = Some(e.clone());
                inner.state = CredentialState::FailedRetryPending;
                if inner.running {
                    self.arm_timer(&mut inner, schedule.refresh_at);
                }
                ticketbridge_otel::metrics().record_token_refresh(trigger.as_str(), "failure");
                warn!(
                    trigger = trigger.as_str(),
                    elapsed_ms,
                    error = %e,
                    retry_count = schedule.retry_count,
                    retry_at = %schedule.refresh_at,
                    keeping_previous_token = inner.token.is_some(),
                    "backend token refresh failed"
                );
                Err(e)
            }
        }
    }

    fn arm_timer(&self, inner: &mut Inner, at: DateTime<Utc>) {
        inner.cancel_timer();
        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();

        let delay = (at - self.shared.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let fired = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = fired.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(shared) = weak.upgrade() else {
                return;
            };
            CredentialManager { shared }.on_timer(generation).await;
        });

        inner.timer = Some(TimerHandle { generation, cancel });
        debug!(generation, delay_secs = delay.as_secs(), "token refresh scheduled");
    }

    async fn on_timer(&self, generation: u64) {
        {
            let mut inner = self.shared.inner.lock().await;
            if !inner.running || inner.generation != generation {
                return;
            }
            inner.timer = None;
        }

        let _auth = self.shared.auth_lock.lock().await;
        {
            let inner = self.shared.inner.lock().await;
            // A forced refresh or stop() may have won the race for the lock.
            if !inner.running || inner.generation != generation || inner.timer.is_some() {
                return;
            }
        }
        // Failure is logged and rescheduled inside; the held token stays in use.
        let _ = self.attempt_locked(Trigger::Scheduled).await;
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(t) = self.inner.get_mut().timer.take() {
            t.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    struct ScriptedAuth {
        calls: AtomicUsize,
        script: std::sync::Mutex<VecDeque<Result<TimeDelta, AuthError>>>,
        latency: Duration,
        called: Notify,
    }

    impl ScriptedAuth {
        fn new(script: Vec<Result<TimeDelta, AuthError>>) -> Arc<Self> {
            Self::with_latency(script, Duration::ZERO)
        }

        fn with_latency(script: Vec<Result<TimeDelta, AuthError>>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: std::sync::Mutex::new(script.into()),
                latency,
                called: Notify::new(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for ScriptedAuth {
        async fn authenticate(&self) -> Result<TokenRecord, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let next = self
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(Ok(TimeDelta::hours(1)));
            self.called.notify_one();
            let lifetime = next?;
            let now = Utc::now();
            Ok(TokenRecord::new(format!("token-{n}"), now, now + lifetime).expect("token"))
        }
    }

    fn cfg() -> CredentialConfig {
        CredentialConfig {
            refresh_buffer: Duration::from_secs(5 * 60),
            retry_backoff: Duration::from_secs(5 * 60),
        }
    }

    fn rejected() -> AuthError {
        AuthError::Rejected("bad password".to_string())
    }

    #[tokio::test]
    async fn start_authenticates_and_is_idempotent() {
        let auth = ScriptedAuth::new(vec![]);
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");

        mgr.start().await.expect("start");
        mgr.start().await.expect("start again");

        assert_eq!(auth.calls(), 1);
        let status = mgr.status().await;
        assert_eq!(status.state, CredentialState::Warm);
        assert!(status.running);
        assert!(status.token.has_token);
        let schedule = status.schedule.expect("schedule");
        assert_eq!(schedule.retry_count, 0);
        assert!(schedule.next_refresh_in_seconds.expect("armed") > 50 * 60);
    }

    #[tokio::test]
    async fn start_failure_reports_error_and_arms_retry() {
        let auth = ScriptedAuth::new(vec![Err(rejected())]);
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");

        let err = mgr.start().await.expect_err("auth fails");
        assert!(matches!(err, CredentialError::Auth(AuthError::Rejected(_))));

        let status = mgr.status().await;
        assert_eq!(status.state, CredentialState::FailedRetryPending);
        assert!(!status.token.has_token);
        assert_eq!(status.schedule.expect("schedule").retry_count, 1);
        assert!(status.last_error.expect("error").contains("bad password"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scheduled_refresh_keeps_previous_token() {
        // Short-lived first token so the scheduled refresh fires at the floor delay.
        let auth = ScriptedAuth::new(vec![Ok(TimeDelta::minutes(2)), Err(rejected())]);
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");
        mgr.start().await.expect("start");
        let first = mgr.current_token().await.expect("token");

        // Paused clock auto-advances to the timer deadline.
        while auth.calls() < 2 {
            auth.called.notified().await;
        }
        while mgr.status().await.state != CredentialState::FailedRetryPending {
            tokio::task::yield_now().await;
        }

        assert_eq!(auth.calls(), 2);
        assert_eq!(mgr.current_token().await.expect("still held"), first);

        let status = mgr.status().await;
        let schedule = status.schedule.expect("schedule");
        assert_eq!(schedule.retry_count, 1);
        let wait = schedule.next_refresh_in_seconds.expect("retry armed");
        assert!(wait <= 5 * 60 && wait > 4 * 60, "retry in {wait}s");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_failure_recovers() {
        let auth = ScriptedAuth::new(vec![Err(rejected()), Ok(TimeDelta::hours(1))]);
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");
        assert!(mgr.start().await.is_err());

        while auth.calls() < 2 {
            auth.called.notified().await;
        }
        while mgr.status().await.state != CredentialState::Warm {
            tokio::task::yield_now().await;
        }
        assert_eq!(auth.calls(), 2);
        assert_eq!(mgr.current_token().await.expect("token").token(), "token-2");
        assert_eq!(mgr.status().await.schedule.expect("schedule").retry_count, 0);
    }

    #[tokio::test]
    async fn stop_keeps_token_and_disarms_timer() {
        let auth = ScriptedAuth::new(vec![]);
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");
        mgr.start().await.expect("start");
        mgr.stop().await;

        let status = mgr.status().await;
        assert!(!status.running);
        assert!(status.token.has_token);
        assert_eq!(status.schedule.expect("schedule").next_refresh_in_seconds, None);

        // Stopped: a forced refresh still works but arms nothing.
        let t = mgr.force_refresh().await.expect("refresh");
        assert_eq!(t.token(), "token-2");
        assert_eq!(mgr.status().await.schedule.expect("schedule").next_refresh_in_seconds, None);

        mgr.start().await.expect("restart");
        assert_eq!(auth.calls(), 2);
        assert!(mgr.status().await.schedule.expect("schedule").next_refresh_in_seconds.is_some());
    }

    #[tokio::test]
    async fn cold_request_callers_share_one_authentication() {
        let auth = ScriptedAuth::with_latency(vec![], Duration::from_millis(50));
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");

        let (a, b, c) = tokio::join!(
            mgr.token_for_request(),
            mgr.token_for_request(),
            mgr.token_for_request()
        );
        let a = a.expect("a");
        assert_eq!(a, b.expect("b"));
        assert_eq!(a, c.expect("c"));
        assert_eq!(auth.calls(), 1);

        // Warm path does not re-authenticate.
        mgr.token_for_request().await.expect("warm");
        assert_eq!(auth.calls(), 1);
        // Not started: no timer.
        assert!(!mgr.status().await.running);
    }

    #[tokio::test]
    async fn cold_request_callers_share_one_failed_authentication() {
        let auth = ScriptedAuth::with_latency(
            vec![Err(rejected()), Err(rejected()), Err(rejected())],
            Duration::from_millis(50),
        );
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");

        let (a, b, c) = tokio::join!(
            mgr.token_for_request(),
            mgr.token_for_request(),
            mgr.token_for_request()
        );
        for r in [a, b, c] {
            assert!(matches!(r, Err(CredentialError::Auth(AuthError::Rejected(_)))));
        }
        assert_eq!(auth.calls(), 1);

        // A later caller that did not wait behind the failure tries again.
        assert!(mgr.token_for_request().await.is_err());
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn rejected_token_refresh_is_coalesced() {
        let auth = ScriptedAuth::new(vec![]);
        let mgr = CredentialManager::new(auth.clone(), cfg()).expect("manager");
        let stale = mgr.token_for_request().await.expect("token");

        let (x, y) = tokio::join!(
            mgr.refresh_rejected(stale.token()),
            mgr.refresh_rejected(stale.token())
        );
        assert_eq!(x.expect("x").token(), "token-2");
        assert_eq!(y.expect("y").token(), "token-2");
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn zero_backoff_is_rejected() {
        let auth = ScriptedAuth::new(vec![]);
        let err = CredentialManager::new(
            auth,
            CredentialConfig {
                retry_backoff: Duration::ZERO,
                ..cfg()
            },
        )
        .expect_err("invalid");
        assert!(matches!(err, CredentialError::InvalidConfig(_)));
    }
}
