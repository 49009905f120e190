//! Timing policy for connection establishment.
//!
//! - `Timeouts`: the design constants for every bounded step
//! - `Deadline`: an absolute deadline threaded through each state transition
//!   so the overall connect timeout bounds the sum of the inner steps
//! - `RetryPolicy`: max attempts, per-attempt timeout and backoff, consumed
//!   by the handshake step

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Overall budget for launch + handshake + discovery.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-attempt budget for the `initialize` handshake.
const HANDSHAKE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake attempts before the connection is declared failed.
const HANDSHAKE_MAX_ATTEMPTS: u32 = 3;

/// Pause between handshake attempts.
const HANDSHAKE_BACKOFF: Duration = Duration::from_secs(1);

/// Budget for `tools/list`.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(8);

/// Default timeout for tool call execution.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settling delay between sequential connection attempts.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Every time bound the connection layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub handshake: RetryPolicy,
    pub discovery: Duration,
    pub call: Duration,
    pub shutdown: Duration,
    pub settle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: CONNECT_TIMEOUT,
            handshake: RetryPolicy::default(),
            discovery: DISCOVERY_TIMEOUT,
            call: CALL_TIMEOUT,
            shutdown: SHUTDOWN_TIMEOUT,
            settle: SETTLE_DELAY,
        }
    }
}

// ─── Deadline ────────────────────────────────────────────────────────────────

/// An absolute point in time after which no further step may start.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
            budget,
        }
    }

    /// The total budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The effective bound for a step: its own limit, clipped to what is left.
    pub fn bound(&self, step: Duration) -> Duration {
        step.min(self.remaining())
    }

    /// Run `fut` under `min(step, remaining)`.
    ///
    /// On expiry returns `McpError::Timeout` naming `operation`. The reported
    /// limit is the overall budget when the deadline, not the step, was binding.
    pub async fn run<T, F>(
        &self,
        server: &str,
        operation: &str,
        step: Duration,
        fut: F,
    ) -> Result<T, McpError>
    where
        F: Future<Output = Result<T, McpError>>,
    {
        let bound = self.bound(step);
        match tokio::time::timeout(bound, fut).await {
            Ok(result) => result,
            Err(_) => {
                let (operation, limit) = if bound < step {
                    ("connect".to_string(), self.budget)
                } else {
                    (operation.to_string(), step)
                };
                Err(McpError::Timeout {
                    server: server.to_string(),
                    operation,
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

// ─── RetryPolicy ─────────────────────────────────────────────────────────────

/// Bounded retry with a fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: HANDSHAKE_MAX_ATTEMPTS,
            attempt_timeout: HANDSHAKE_ATTEMPT_TIMEOUT,
            backoff: HANDSHAKE_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, attempts are exhausted, or `deadline` expires.
    ///
    /// Each attempt is bounded by `attempt_timeout` (clipped to the deadline).
    /// The error of the last attempt is returned.
    pub async fn run<T, F, Fut>(
        &self,
        deadline: &Deadline,
        server: &str,
        operation: &str,
        mut op: F,
    ) -> Result<T, McpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, McpError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = deadline
                .run(server, operation, self.attempt_timeout, op(attempt))
                .await;

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(server, attempt, "{operation} succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts || deadline.is_expired() {
                return Err(err);
            }

            tracing::warn!(
                server,
                attempt,
                max_attempts,
                error = %err,
                "{operation} failed, retrying"
            );

            tokio::time::sleep(deadline.bound(self.backoff)).await;
            attempt += 1;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_default_timeouts_match_design_constants() {
        let t = Timeouts::default();
        assert_eq!(t.connect, Duration::from_secs(15));
        assert_eq!(t.handshake.max_attempts, 3);
        assert_eq!(t.handshake.attempt_timeout, Duration::from_secs(10));
        assert_eq!(t.handshake.backoff, Duration::from_secs(1));
        assert_eq!(t.discovery, Duration::from_secs(8));
        assert_eq!(t.settle, Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_bound_clips_to_remaining() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert!(deadline.bound(Duration::from_secs(10)) <= Duration::from_millis(100));
        assert_eq!(
            deadline.bound(Duration::from_millis(1)),
            Duration::from_millis(1)
        );
        assert_eq!(deadline.budget(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_deadline_run_reports_step_timeout() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let err = deadline
            .run("math", "tools/list", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, McpError>(())
            })
            .await
            .unwrap_err();
        match err {
            McpError::Timeout {
                operation,
                timeout_ms,
                ..
            } => {
                assert_eq!(operation, "tools/list");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_run_reports_overall_connect_timeout() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let err = deadline
            .run("math", "initialize", Duration::from_secs(10), async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, McpError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::Timeout { ref operation, timeout_ms: 20, .. } if operation == "connect"
        ));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let value = quick_policy(3)
            .run(&deadline, "math", "initialize", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(McpError::HandshakeFailed {
                            name: "math".into(),
                            reason: "cold start".into(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_and_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let err = quick_policy(3)
            .run(&deadline, "math", "initialize", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(McpError::HandshakeFailed {
                        name: "math".into(),
                        reason: format!("attempt {attempt}"),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_retry_times_out_each_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_secs(5));

        let err = quick_policy(2)
            .run(&deadline, "slow", "initialize", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, McpError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, McpError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_retry_stops_when_deadline_expires() {
        let calls = Arc::new(AtomicU32::new(0));
        let deadline = Deadline::after(Duration::from_millis(30));
        let policy = RetryPolicy {
            max_attempts: 10,
            attempt_timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(1),
        };

        let err = policy
            .run(&deadline, "slow", "initialize", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, McpError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            McpError::Timeout { ref operation, .. } if operation == "connect"
        ));
    }
}
