//! Bounded retry engine
//!
//! Runs one prepared call under an attempt budget. Each failure is classified
//! (see [`classify`]) and the engine decides whether to wait, retry or stop.
//! Waits requested by the local rate limiter do not consume attempts unless
//! the budget is a single shot.

pub mod classify;

pub use classify::{classify, classify_provider_message, ErrorClass};

use crate::client::UsageMetadata;
use crate::config::RetryConfig;
use crate::error::{LLMError, Result};
use crate::task::FailureReason;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Validated output of one successful attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResponse {
    /// Response text
    pub text: String,
    /// Token usage reported for this attempt
    pub usage: Option<UsageMetadata>,
}

impl AttemptResponse {
    /// Non-empty text or usage metadata present
    pub fn is_success(&self) -> bool {
        !self.text.trim().is_empty() || self.usage.is_some()
    }
}

/// One retryable unit of work
///
/// The engine calls [`CallAttempt::attempt`] with the 1-based attempt number
/// and never builds requests itself.
#[async_trait]
pub trait CallAttempt: Send + Sync {
    /// Run one attempt
    async fn attempt(&self, attempt: u32) -> Result<AttemptResponse>;

    /// Drop any cached context this call refers to
    async fn invalidate_cache(&self) {}
}

/// Terminal result of a retry loop
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Success {
        response: AttemptResponse,
        /// Attempts used, including the successful one
        attempts: u32,
        /// Whether at least one attempt failed before success
        first_attempt_failed: bool,
    },
    Failed {
        reason: FailureReason,
        /// Class of the last failure
        class: ErrorClass,
        attempts: u32,
        /// Last error message
        detail: String,
    },
}

impl RetryOutcome {
    /// Returns true for [`RetryOutcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    /// Attempts consumed
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Exponential backoff with additive jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    jitter_ms: u64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter_ms: u64) -> Self {
        Self {
            current: initial.min(max),
            max,
            jitter_ms,
        }
    }

    /// Delay before the next attempt; doubles the base delay up to the ceiling
    pub fn next_delay(&mut self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        let delay = self.current + Duration::from_millis(jitter);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Attempt budget and backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Full budget from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ms: config.jitter_ms,
        }
    }

    /// Same backoff, one strict attempt
    pub fn single_shot(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_delay, self.max_delay, self.jitter_ms)
    }
}

/// Run `call` until it succeeds, fails for good, or exhausts the budget
pub async fn execute(call: &dyn CallAttempt, policy: &RetryPolicy) -> RetryOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt: u32 = 1;

    loop {
        let error = match call.attempt(attempt).await {
            Ok(response) if response.is_success() => {
                if attempt > 1 {
                    info!(attempt, "Call succeeded after retry");
                }
                return RetryOutcome::Success {
                    response,
                    attempts: attempt,
                    first_attempt_failed: attempt > 1,
                };
            }
            Ok(_) => LLMError::InvalidResponse("Empty response without usage metadata".to_string()),
            Err(e) => e,
        };

        let class = classify(&error);
        let detail = error.to_string();

        if let LLMError::RateLimited { wait } = &error {
            if max_attempts == 1 {
                warn!(attempt, "Rate limited on single-shot call, giving up");
                return RetryOutcome::Failed {
                    reason: FailureReason::FailedFirstAttempt,
                    class,
                    attempts: attempt,
                    detail,
                };
            }
            debug!(attempt, wait_ms = wait.as_millis() as u64, "Waiting for rate limiter");
            tokio::time::sleep(*wait).await;
            continue;
        }

        if !class.is_retryable() {
            warn!(attempt, class = %class, error = %detail, "Non-retryable failure");
            let reason = match class {
                ErrorClass::SafetyBlocked => FailureReason::SafetyBlocked,
                _ => FailureReason::PreparationFailed,
            };
            return RetryOutcome::Failed {
                reason,
                class,
                attempts: attempt,
                detail,
            };
        }

        if class == ErrorClass::StaleCache {
            info!(attempt, "Stale cached context, invalidating before retry");
            call.invalidate_cache().await;
        }

        if max_attempts == 1 {
            warn!(class = %class, error = %detail, "Single-shot call failed");
            return RetryOutcome::Failed {
                reason: FailureReason::FailedFirstAttempt,
                class,
                attempts: attempt,
                detail,
            };
        }

        if attempt >= max_attempts {
            warn!(attempts = attempt, class = %class, error = %detail, "Retries exhausted");
            return RetryOutcome::Failed {
                reason: FailureReason::ExhaustedRetries,
                class,
                attempts: attempt,
                detail,
            };
        }

        let delay = backoff.next_delay();
        warn!(
            attempt,
            max_attempts,
            class = %class,
            delay_ms = delay.as_millis() as u64,
            error = %detail,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted results and records when each attempt started
    struct Scripted {
        results: Mutex<VecDeque<Result<AttemptResponse>>>,
        started: Mutex<Vec<(u32, Instant)>>,
        invalidations: AtomicU32,
    }

    impl Scripted {
        fn new(results: Vec<Result<AttemptResponse>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                started: Mutex::new(Vec::new()),
                invalidations: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.started.lock().unwrap().len()
        }

        fn gaps(&self) -> Vec<Duration> {
            let started = self.started.lock().unwrap();
            started.windows(2).map(|w| w[1].1 - w[0].1).collect()
        }
    }

    #[async_trait]
    impl CallAttempt for Scripted {
        async fn attempt(&self, attempt: u32) -> Result<AttemptResponse> {
            self.started.lock().unwrap().push((attempt, Instant::now()));
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LLMError::provider(Some(500), "INTERNAL")))
        }

        async fn invalidate_cache(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ok(text: &str) -> Result<AttemptResponse> {
        Ok(AttemptResponse {
            text: text.to_string(),
            usage: None,
        })
    }

    fn policy(max_attempts: u32, jitter_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(4000),
            jitter_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let call = Scripted::new(vec![ok("{}")]);
        let outcome = execute(&call, &policy(3, 0)).await;

        assert_eq!(
            outcome,
            RetryOutcome::Success {
                response: AttemptResponse {
                    text: "{}".to_string(),
                    usage: None
                },
                attempts: 1,
                first_attempt_failed: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_fails_without_waiting() {
        let call = Scripted::new(vec![Err(LLMError::provider(Some(500), "INTERNAL"))]);
        let start = Instant::now();

        let outcome = execute(&call, &policy(1, 500)).await;

        assert_eq!(Instant::now(), start);
        assert_eq!(call.calls(), 1);
        match outcome {
            RetryOutcome::Failed { reason, class, attempts, .. } => {
                assert_eq!(reason, FailureReason::FailedFirstAttempt);
                assert_eq!(class, ErrorClass::TransientServer);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_rate_limited_exits_immediately() {
        let call = Scripted::new(vec![Err(LLMError::RateLimited {
            wait: Duration::from_secs(30),
        })]);
        let start = Instant::now();

        let outcome = execute(&call, &policy(1, 0)).await;

        assert_eq!(Instant::now(), start);
        assert!(matches!(
            outcome,
            RetryOutcome::Failed {
                reason: FailureReason::FailedFirstAttempt,
                class: ErrorClass::InternalRateLimit,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_wait_does_not_consume_attempts() {
        let limited = || {
            Err(LLMError::RateLimited {
                wait: Duration::from_secs(10),
            })
        };
        let call = Scripted::new(vec![limited(), limited(), limited(), ok("{\"a\": 1}")]);
        let start = Instant::now();

        let outcome = execute(&call, &policy(2, 0)).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(call.calls(), 4);
        assert!(Instant::now() - start >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_budget_exhausted() {
        let call = Scripted::new(vec![]);
        let outcome = execute(&call, &policy(3, 0)).await;

        assert_eq!(call.calls(), 3);
        match outcome {
            RetryOutcome::Failed { reason, attempts, detail, .. } => {
                assert_eq!(reason, FailureReason::ExhaustedRetries);
                assert_eq!(attempts, 3);
                assert!(detail.contains("INTERNAL"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_non_decreasing_and_capped() {
        let call = Scripted::new(vec![]);
        execute(&call, &policy(6, 0)).await;

        let gaps = call.gaps();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(4000),
                Duration::from_millis(4000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_reports_first_attempt_failed() {
        let call = Scripted::new(vec![Err(LLMError::InvalidResponse("truncated".into())), ok("{}")]);
        let outcome = execute(&call, &policy(3, 500)).await;

        match outcome {
            RetryOutcome::Success {
                attempts,
                first_attempt_failed,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(first_attempt_failed);
            }
            other => panic!("expected success, got {:?}", other),
        }
        let gap = call.gaps()[0];
        assert!(gap >= Duration::from_millis(1000) && gap <= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_block_never_retried() {
        let call = Scripted::new(vec![Err(LLMError::SafetyBlocked("SAFETY".into())), ok("{}")]);
        let outcome = execute(&call, &policy(5, 0)).await;

        assert_eq!(call.calls(), 1);
        assert!(matches!(
            outcome,
            RetryOutcome::Failed {
                reason: FailureReason::SafetyBlocked,
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_invalidates_then_retries() {
        let call = Scripted::new(vec![
            Err(LLMError::provider(Some(404), "NOT_FOUND: CachedContent not found")),
            ok("{}"),
        ]);
        let outcome = execute(&call, &policy(3, 0)).await;

        assert!(outcome.is_success());
        assert_eq!(call.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_response_is_retried() {
        let call = Scripted::new(vec![ok("  "), ok("{}")]);
        let outcome = execute(&call, &policy(2, 0)).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 2);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 500);
        let bases = [100u64, 200, 300, 300];
        for base in bases {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(base));
            assert!(delay <= Duration::from_millis(base + 500));
        }
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.single_shot().max_attempts, 1);
        assert_eq!(policy.single_shot().max_delay, Duration::from_secs(30));
    }
}
