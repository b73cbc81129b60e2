//! Polling with back-off, a deadline and cancellation
//!
//! Used wherever the engine waits on EC2 or on a host: instances reaching
//! `running`, spot requests being fulfilled, SSH answering, Windows password
//! data appearing.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polling schedule
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    /// Delay after the first unsuccessful check
    pub initial_delay: Duration,
    /// Cap on the delay between checks
    pub max_delay: Duration,
    /// Growth factor per check (1.0 polls at a fixed interval)
    pub factor: f32,
    /// Total time allowed
    pub timeout: Duration,
    /// Add random jitter to delays
    pub jitter: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            timeout: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl WaitConfig {
    /// Check every `interval` until `timeout`.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            factor: 1.0,
            timeout,
            jitter: false,
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .without_max_times();
        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error("timed out waiting for {resource} after {elapsed:?} ({attempts} checks)")]
    Timeout {
        resource: String,
        elapsed: Duration,
        attempts: u32,
    },

    #[error("wait for {0} cancelled")]
    Cancelled(String),

    #[error("check for {resource} failed")]
    Check {
        resource: String,
        #[source]
        source: E,
    },
}

/// Poll `check` until it yields a value.
///
/// `check` returns `Ok(Some(v))` when the resource is ready, `Ok(None)` to
/// poll again and `Err` to stop immediately. The deadline is checked before
/// each poll, so a slow check may overrun it by one call.
pub async fn wait_for_resource<T, E, F, Fut>(
    config: &WaitConfig,
    cancel: Option<&CancellationToken>,
    mut check: F,
    resource: &str,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut delays = config.delays();

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(WaitError::Cancelled(resource.to_string()));
        }
        if start.elapsed() >= config.timeout {
            return Err(WaitError::Timeout {
                resource: resource.to_string(),
                elapsed: start.elapsed(),
                attempts,
            });
        }

        attempts += 1;
        match check().await {
            Ok(Some(value)) => {
                debug!(resource, attempts, "Resource ready");
                return Ok(value);
            }
            Ok(None) => {
                let remaining = config.timeout.saturating_sub(start.elapsed());
                let delay = delays.next().unwrap_or(config.max_delay).min(remaining);
                debug!(
                    resource,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Resource not ready, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = async {
                        match cancel {
                            Some(token) => token.cancelled().await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        return Err(WaitError::Cancelled(resource.to_string()));
                    }
                }
            }
            Err(e) => {
                warn!(resource, error = %e, "Resource check failed");
                return Err(WaitError::Check {
                    resource: resource.to_string(),
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = WaitConfig::fixed(Duration::from_secs(15), Duration::from_secs(180));

        let value = wait_for_resource::<_, String, _, _>(
            &config,
            None,
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n == 3).then_some(n))
                }
            },
            "ssh",
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let config = WaitConfig::fixed(Duration::from_secs(15), Duration::from_secs(60));
        let result =
            wait_for_resource::<(), String, _, _>(&config, None, || async { Ok(None) }, "ssh")
                .await;

        match result {
            Err(WaitError::Timeout { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            trigger.cancel();
        });

        let config = WaitConfig::fixed(Duration::from_secs(15), Duration::from_secs(600));
        let result = wait_for_resource::<(), String, _, _>(
            &config,
            Some(&cancel),
            || async { Ok(None) },
            "instance",
        )
        .await;
        assert!(matches!(result, Err(WaitError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_stops_polling() {
        let config = WaitConfig::default();
        let result = wait_for_resource::<(), _, _, _>(
            &config,
            None,
            || async { Err("access denied".to_string()) },
            "instance",
        )
        .await;
        assert!(matches!(result, Err(WaitError::Check { source, .. }) if source == "access denied"));
    }
}
