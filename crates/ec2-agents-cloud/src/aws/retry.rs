//! Retry policy for EC2 calls
//!
//! Throttled and transient failures are retried with exponential back-off
//! (base 1 s, factor 2, cap 30 s, 6 attempts in total). Every delay is
//! perturbed by a symmetric jitter (plus or minus 20 % by default) so that
//! concurrent callers spread out. Each attempt is bounded by the call
//! deadline; an attempt that overruns it counts as a transient failure.

use super::error::{IaasError, IaasResult};
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use ec2_agents_common::defaults::{
    DEFAULT_IAAS_CALL_TIMEOUT_SECS, DEFAULT_RETRY_BASE_MILLIS, DEFAULT_RETRY_CAP_SECS,
    DEFAULT_RETRY_JITTER, DEFAULT_RETRY_MAX_ATTEMPTS,
};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Back-off parameters for retried EC2 calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// First back-off delay
    pub base: Duration,
    /// Growth factor between delays
    pub factor: f32,
    /// Upper bound for a single delay (before jitter)
    pub cap: Duration,
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Symmetric jitter fraction, 0.0 - 1.0
    pub jitter: f64,
    /// Deadline for a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_RETRY_BASE_MILLIS),
            factor: 2.0,
            cap: Duration::from_secs(DEFAULT_RETRY_CAP_SECS),
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            jitter: DEFAULT_RETRY_JITTER,
            call_timeout: Duration::from_secs(DEFAULT_IAAS_CALL_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries, for callers that handle failures themselves.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays before the 2nd, 3rd, ... attempt, without jitter.
    pub fn base_delays(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBuilder::default()
            .with_min_delay(self.base)
            .with_max_delay(self.cap)
            .with_factor(self.factor)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }

    /// Delays before the 2nd, 3rd, ... attempt, jittered.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + Sync + Unpin + use<> {
        let jitter = self.jitter.clamp(0.0, 1.0);
        self.base_delays().map(move |delay| {
            if jitter == 0.0 {
                delay
            } else {
                delay.mul_f64(rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter)))
            }
        })
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only the final failure is returned.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> IaasResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IaasResult<T>>,
    {
        let call_timeout = self.call_timeout;
        (|| {
            let attempt = call();
            async move {
                tokio::time::timeout(call_timeout, attempt)
                    .await
                    .unwrap_or_else(|_| {
                        Err(IaasError::transient(format!(
                            "{operation} exceeded the {call_timeout:?} call deadline"
                        )))
                    })
            }
        })
        .retry(self.delays())
        .sleep(tokio::time::sleep)
        .when(IaasError::is_retryable)
        .notify(|e, delay| {
            warn!(
                operation,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "EC2 call failed, backing off"
            );
        })
        .await
    }
}
