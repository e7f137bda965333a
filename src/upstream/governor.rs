//! Upstream rate governor
//!
//! Tracks the call budget reported by upstream rate headers and throttles
//! callers before they spend a call that is almost certain to be rejected.
//! Retry and backoff for rate and transient failures live here and nowhere
//! else.

use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{RateSnapshot, UpstreamError, UpstreamReply};

/// Upper bound on how far ahead a window reset is tracked.
const MAX_TRACKED_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Proceed,
    Wait(Duration),
    /// The window resets further out than the caller is willing to wait.
    Reject(Duration),
}

/// Remaining calls and window reset. `None` means upstream has not told us
/// yet, or the last known window has already reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateBudget {
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct GovernorPolicy {
    pub reserve_threshold: u32,
    pub max_wait: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub transient_retries: u32,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            reserve_threshold: 1,
            max_wait: Duration::from_secs(120),
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            transient_retries: 1,
        }
    }
}

#[derive(Debug)]
pub struct RateGovernor {
    budget: Mutex<RateBudget>,
    policy: GovernorPolicy,
}

impl RateGovernor {
    pub fn new(policy: GovernorPolicy) -> Self {
        Self {
            budget: Mutex::new(RateBudget::default()),
            policy,
        }
    }

    pub fn budget(&self) -> RateBudget {
        *self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims one call from the budget, or says how long to wait for it.
    pub fn reserve(&self) -> Reservation {
        let now = Instant::now();
        let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);

        if budget.reset_at.is_some_and(|reset_at| now >= reset_at) {
            *budget = RateBudget::default();
        }

        match (budget.remaining, budget.reset_at) {
            (Some(remaining), Some(reset_at)) if remaining <= self.policy.reserve_threshold => {
                let wait = reset_at.saturating_duration_since(now);
                if wait > self.policy.max_wait {
                    Reservation::Reject(wait)
                } else {
                    Reservation::Wait(wait)
                }
            }
            (Some(remaining), _) => {
                budget.remaining = Some(remaining.saturating_sub(1));
                Reservation::Proceed
            }
            (None, _) => Reservation::Proceed,
        }
    }

    /// Records the budget reported by an upstream response.
    pub fn observe(&self, snapshot: RateSnapshot) {
        let reset_at = deadline(Instant::now(), snapshot.resets_in);
        let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);

        // Responses from the same window can arrive out of order; the lowest
        // count reported for a window wins.
        let same_window = budget
            .reset_at
            .is_some_and(|existing| abs_diff(existing, reset_at) <= Duration::from_secs(1));
        budget.remaining = match budget.remaining {
            Some(current) if same_window => Some(current.min(snapshot.remaining)),
            _ => Some(snapshot.remaining),
        };
        if !same_window {
            budget.reset_at = Some(reset_at);
        }
    }

    /// Marks the budget empty for `delay`, after upstream rejected a call.
    pub fn observe_exhausted(&self, delay: Duration) {
        let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);
        let reset_at = deadline(Instant::now(), delay);
        budget.remaining = Some(0);
        budget.reset_at = Some(match budget.reset_at {
            Some(existing) if existing > reset_at => existing,
            _ => reset_at,
        });
    }

    /// Waits until a call may be issued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), UpstreamError> {
        loop {
            match self.reserve() {
                Reservation::Proceed => return Ok(()),
                Reservation::Wait(wait) => {
                    info!(
                        wait_ms = wait.as_millis() as u64,
                        "rate budget low, waiting for window reset"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Reservation::Reject(resets_in) => {
                    warn!(
                        resets_in_ms = resets_in.as_millis() as u64,
                        "rate budget exhausted beyond maximum wait"
                    );
                    return Err(UpstreamError::BudgetExhausted { resets_in });
                }
            }
        }
    }

    /// Runs one upstream call under the budget, retrying rate rejections with
    /// doubling backoff and transient failures once.
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<UpstreamReply, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<UpstreamReply, UpstreamError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.base_backoff;
        let mut transient_retries = 0;

        for attempt in 1..=max_attempts {
            self.acquire(cancel).await?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                outcome = operation() => outcome,
            };

            match outcome {
                Ok(reply) => {
                    if let Some(snapshot) = reply.rate {
                        self.observe(snapshot);
                    }
                    return Ok(reply);
                }
                Err(UpstreamError::RateLimited { retry_after }) if attempt < max_attempts => {
                    let delay = retry_after.map_or(backoff, |after| after.max(backoff));
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "upstream rate limited, backing off"
                    );
                    self.observe_exhausted(delay);
                }
                Err(err)
                    if err.is_transient()
                        && transient_retries < self.policy.transient_retries
                        && attempt < max_attempts =>
                {
                    transient_retries += 1;
                    warn!(attempt, error = %err, "transient upstream failure, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => return Err(err),
            }

            backoff = (backoff * 2).min(self.policy.max_backoff);
        }

        Err(UpstreamError::RateLimited { retry_after: None })
    }
}

fn deadline(now: Instant, delay: Duration) -> Instant {
    let delay = delay.min(MAX_TRACKED_DELAY);
    now.checked_add(delay).unwrap_or(now + Duration::from_secs(1))
}

fn abs_diff(left: Instant, right: Instant) -> Duration {
    if left > right {
        left - right
    } else {
        right - left
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;

    use super::*;

    fn governor() -> RateGovernor {
        RateGovernor::new(GovernorPolicy {
            reserve_threshold: 1,
            max_wait: Duration::from_secs(120),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            transient_retries: 1,
        })
    }

    fn snapshot(remaining: u32, resets_in_secs: u64) -> RateSnapshot {
        RateSnapshot {
            remaining,
            resets_in: Duration::from_secs(resets_in_secs),
        }
    }

    fn ok_reply() -> UpstreamReply {
        UpstreamReply {
            body: json!({ "ok": true }),
            rate: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_budget_proceeds() {
        assert_eq!(governor().reserve(), Reservation::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn low_budget_waits_for_reset() {
        let governor = governor();
        governor.observe(snapshot(1, 20));

        assert_eq!(governor.reserve(), Reservation::Wait(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_never_proceeds_before_reset() {
        let governor = governor();
        governor.observe(snapshot(0, 10));
        let started = Instant::now();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(governor.reserve(), Reservation::Wait(_)));

        governor
            .acquire(&CancellationToken::new())
            .await
            .expect("acquired after reset");
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reservations_share_the_budget() {
        let governor = governor();
        governor.observe(snapshot(2, 30));

        assert_eq!(governor.reserve(), Reservation::Proceed);
        assert!(matches!(governor.reserve(), Reservation::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_higher_count_does_not_refill_window() {
        let governor = governor();
        governor.observe(snapshot(3, 30));
        governor.observe(snapshot(9, 30));

        assert_eq!(governor.budget().remaining, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_beyond_maximum_are_rejected() {
        let governor = governor();
        governor.observe(snapshot(0, 3_600));

        assert!(matches!(governor.reserve(), Reservation::Reject(_)));
        let err = governor
            .acquire(&CancellationToken::new())
            .await
            .expect_err("rejected");
        assert!(matches!(err, UpstreamError::BudgetExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_resets_are_capped_and_rejected() {
        let governor = governor();
        governor.observe(RateSnapshot {
            remaining: 0,
            resets_in: Duration::MAX,
        });

        let reset_at = governor.budget().reset_at.expect("window tracked");
        assert!(reset_at <= Instant::now() + MAX_TRACKED_DELAY);
        assert_eq!(governor.reserve(), Reservation::Reject(MAX_TRACKED_DELAY));

        let exhausted = self::governor();
        exhausted.observe_exhausted(Duration::MAX);
        assert_eq!(exhausted.budget().remaining, Some(0));
        assert!(matches!(exhausted.reserve(), Reservation::Reject(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_ends_in_budget_exhausted() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = governor
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::RateLimited {
                        retry_after: Some(Duration::MAX),
                    })
                }
            })
            .await
            .expect_err("window too far out");

        assert!(matches!(err, UpstreamError::BudgetExhausted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_calls_are_retried_with_backoff() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let reply = governor
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(UpstreamError::RateLimited { retry_after: None })
                    } else {
                        Ok(ok_reply())
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(reply.body["ok"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_surfaces_after_three_attempts() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = governor
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::RateLimited { retry_after: None })
                }
            })
            .await
            .expect_err("retries exhausted");

        assert!(matches!(err, UpstreamError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_once() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = governor
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::Unavailable {
                        status: Some(502),
                        message: "bad gateway".to_string(),
                    })
                }
            })
            .await
            .expect_err("still unavailable");

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = governor
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::InvalidInput {
                        status: 400,
                        message: "bad filter".to_string(),
                    })
                }
            })
            .await
            .expect_err("invalid input");

        assert!(matches!(err, UpstreamError::InvalidInput { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reply_updates_budget() {
        let governor = governor();
        governor
            .execute(&CancellationToken::new(), || async {
                Ok(UpstreamReply {
                    body: json!({}),
                    rate: Some(snapshot(1, 60)),
                })
            })
            .await
            .expect("call succeeds");

        assert_eq!(governor.budget().remaining, Some(1));
        assert!(matches!(governor.reserve(), Reservation::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_waiting() {
        let governor = governor();
        governor.observe(snapshot(0, 60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = governor.acquire(&cancel).await.expect_err("cancelled");
        assert_eq!(err, UpstreamError::Cancelled);
    }
}
