// retry executor for client requests
// exponential backoff with jitter, a server advised wait overrides the computed
// delay for that one retry. sleeping is interruptible through a cancellation
// token, in which case the last failure is returned immediately
use std::{future::Future, time::Duration};

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    // total tries, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_retry_after_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 1600,
            jitter_ms: 100,
            max_retry_after_ms: 10_000,
        }
    }
}

#[derive(Debug)]
pub enum Failure {
    Transient {
        error: anyhow::Error,
        retry_after: Option<Duration>,
    },
    Fatal(anyhow::Error),
}

impl Failure {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient {
            error: error.into(),
            retry_after: None,
        }
    }

    pub fn into_error(self) -> anyhow::Error {
        match self {
            Self::Transient { error, .. } | Self::Fatal(error) => error,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (starting from 2) without jitter,
    /// `min(base * 2^(attempt - 2), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(63);
        let delay = self.base_delay_ms.saturating_mul(1 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after.min(Duration::from_millis(self.max_retry_after_ms));
        }
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        self.backoff(attempt) + Duration::from_millis(jitter)
    }

    /// Calls `op` with the 1-based attempt number until it succeeds, fails
    /// fatally, runs out of attempts or `cancel` fires during a backoff sleep.
    pub async fn execute<T, F, Fut>(&self, mut op: F, cancel: &CancellationToken) -> anyhow::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let (error, retry_after) = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(Failure::Fatal(error)) => return Err(error),
                Err(Failure::Transient { error, retry_after }) => (error, retry_after),
            };
            if attempt >= max_attempts {
                return Err(error.context(format!("giving up after {attempt} attempts")));
            }
            attempt += 1;
            let delay = self.delay(attempt, retry_after);
            warn!(attempt, ?delay, "retry on transient failure: {error:#}");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(error.context("retry interrupted")),
                () = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

    use tokio::time::Instant;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_from_empty_config() -> anyhow::Result<()> {
        let policy = serde_json::from_str::<RetryPolicy>("{}")?;
        anyhow::ensure!(policy == RetryPolicy::default());
        let policy = serde_json::from_str::<RetryPolicy>(r#"{"max_attempts":2}"#)?;
        anyhow::ensure!(policy.max_attempts == 2 && policy.base_delay_ms == 200);
        Ok(())
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let policy = RetryPolicy::default();
        let delays = (2..=7)
            .map(|attempt| policy.backoff(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, [200, 400, 800, 1600, 1600, 1600]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(1600));
        for _ in 0..100 {
            let delay = policy.delay(3, None);
            assert!(delay >= Duration::from_millis(400) && delay <= Duration::from_millis(500))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() -> anyhow::Result<()> {
        for failures in 0..4 {
            let calls = AtomicU32::new(0);
            let start = Instant::now();
            let value = no_jitter()
                .execute(
                    |attempt| {
                        calls.fetch_add(1, SeqCst);
                        async move {
                            if attempt <= failures {
                                Err(Failure::transient(anyhow::anyhow!("unavailable")))
                            } else {
                                Ok(attempt)
                            }
                        }
                    },
                    &CancellationToken::new(),
                )
                .await?;
            anyhow::ensure!(value == failures + 1);
            anyhow::ensure!(calls.load(SeqCst) == failures + 1);
            let expected = (2..=failures + 1).map(|attempt| no_jitter().backoff(attempt)).sum::<Duration>();
            anyhow::ensure!(start.elapsed() >= expected);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_runs_max_attempts() -> anyhow::Result<()> {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .execute(
                |_| {
                    calls.fetch_add(1, SeqCst);
                    async { Err::<(), _>(Failure::transient(anyhow::anyhow!("status 503"))) }
                },
                &CancellationToken::new(),
            )
            .await;
        let err = result.err().ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        anyhow::ensure!(calls.load(SeqCst) == 4);
        // the last failure is surfaced, not swallowed
        anyhow::ensure!(format!("{err:#}").contains("status 503"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_stops_immediately() -> anyhow::Result<()> {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .execute(
                |_| {
                    calls.fetch_add(1, SeqCst);
                    async { Err::<(), _>(Failure::Fatal(anyhow::anyhow!("status 400"))) }
                },
                &CancellationToken::new(),
            )
            .await;
        anyhow::ensure!(result.is_err());
        anyhow::ensure!(calls.load(SeqCst) == 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() -> anyhow::Result<()> {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        let result = RetryPolicy::default()
            .execute(
                |_| {
                    calls.fetch_add(1, SeqCst);
                    async { Err::<(), _>(Failure::transient(anyhow::anyhow!("connection refused"))) }
                },
                &cancel,
            )
            .await;
        let err = result.err().ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        anyhow::ensure!(calls.load(SeqCst) == 1);
        anyhow::ensure!(start.elapsed() < Duration::from_millis(200));
        anyhow::ensure!(format!("{err:#}").contains("connection refused"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff_with_cap() -> anyhow::Result<()> {
        for (hint, expected) in [(3, 3), (60, 10)] {
            let start = Instant::now();
            RetryPolicy::default()
                .execute(
                    |attempt| async move {
                        if attempt == 1 {
                            Err(Failure::Transient {
                                error: anyhow::anyhow!("status 429"),
                                retry_after: Some(Duration::from_secs(hint)),
                            })
                        } else {
                            Ok(())
                        }
                    },
                    &CancellationToken::new(),
                )
                .await?;
            let elapsed = start.elapsed();
            anyhow::ensure!(elapsed >= Duration::from_secs(expected));
            anyhow::ensure!(elapsed < Duration::from_secs(expected) + Duration::from_millis(50));
        }
        Ok(())
    }
}
