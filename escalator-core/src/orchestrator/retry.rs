use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetrySection;
use crate::tier::{TierKind, TierResult};

use super::metrics::OrchestratorMetrics;
use super::telemetry::{AttemptTelemetry, FailureRecord, TierAction};

/// Bounded in-tier retry. Only transient categories are retried; every other
/// result is handed straight back for the escalation decision.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    jitter_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl RetryPolicy {
    pub fn new(config: RetrySection) -> Self {
        let mut schedule = config
            .schedule_ms
            .into_iter()
            .map(Duration::from_millis)
            .collect::<Vec<_>>();
        if schedule.is_empty() {
            schedule.push(Duration::from_millis(500));
        }
        Self {
            max_attempts: config.max_attempts.max(1),
            schedule,
            jitter_ms: config.jitter_ms,
        }
    }

    /// A policy that invokes the operation exactly once.
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            schedule: vec![Duration::ZERO],
            jitter_ms: 0,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.schedule
            .get(attempt - 1)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or_default()
    }

    pub async fn run<F, Fut>(
        &self,
        url: &str,
        tier: TierKind,
        telemetry: Option<Arc<AttemptTelemetry>>,
        metrics: Arc<Mutex<OrchestratorMetrics>>,
        mut operation: F,
    ) -> RetryOutcome<TierResult>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = TierResult>,
    {
        let mut attempt = 0usize;
        loop {
            let result = operation(attempt).await;
            let category = match result.category {
                Some(category) if category.is_transient() => category,
                _ => {
                    return RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    }
                }
            };
            attempt += 1;
            if attempt >= self.max_attempts {
                return RetryOutcome {
                    result,
                    attempts: attempt,
                };
            }

            let mut delay = self.delay_for_attempt(attempt);
            if self.jitter_ms > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms));
            }
            if let Ok(mut guard) = metrics.lock() {
                guard.record_retry(tier);
            }
            if let Some(telemetry) = telemetry.as_ref() {
                let record = FailureRecord {
                    timestamp: Utc::now(),
                    url: url.to_string(),
                    tier,
                    category,
                    status: result.status,
                    attempt,
                    action: TierAction::Retry {
                        delay_ms: delay.as_millis() as u64,
                    },
                };
                if let Err(err) = telemetry.record_failure(&record) {
                    warn!(error = %err, "failed to record tier failure");
                }
            }
            debug!(url, tier = %tier, category = %category, attempt, delay_ms = delay.as_millis() as u64, "retrying tier");
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }
}
