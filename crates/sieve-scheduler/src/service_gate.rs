//! Health gating for auxiliary services.

use sieve_core::pipeline::ServiceRequirement;
use sieve_core::ports::HealthProbe;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The service answered a probe successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub attempts: u32,
    pub waited: Duration,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("not healthy after {attempts} probes in {waited:?}")]
    TimedOut {
        attempts: u32,
        waited: Duration,
        last_error: Option<String>,
    },
    #[error("wait cancelled after {attempts} probes")]
    Cancelled { attempts: u32 },
}

/// Floor for the polling interval; a zero interval would spin the probe.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Polls a health probe at a fixed interval until it succeeds or the
/// budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceGate {
    pub interval: Duration,
    pub timeout: Duration,
}

impl ServiceGate {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            timeout,
        }
    }

    pub fn for_requirement(requirement: &ServiceRequirement) -> Self {
        Self::new(
            Duration::from_secs(requirement.interval_secs),
            Duration::from_secs(requirement.timeout_secs),
        )
    }

    /// Probe immediately, then every `interval`, while the budget lasts.
    ///
    /// Each probe is bounded by the remaining budget. Attempts fall at
    /// `0, interval, 2 * interval, ...` strictly before `timeout`.
    pub async fn await_healthy(
        &self,
        probe: &dyn HealthProbe,
        cancel: &CancellationToken,
    ) -> Result<Ready, GateError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts = 0u32;
        let mut last_error: Option<String>;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GateError::Cancelled { attempts }),
                outcome = tokio::time::timeout(remaining, probe.check()) => outcome,
            };

            match outcome {
                Ok(Ok(())) => {
                    return Ok(Ready {
                        attempts,
                        waited: start.elapsed(),
                    });
                }
                Ok(Err(e)) => {
                    debug!(probe = %probe.describe(), attempt = attempts, error = %e, "Probe failed");
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    debug!(probe = %probe.describe(), attempt = attempts, "Probe timed out");
                    last_error = Some("probe exceeded the remaining budget".to_string());
                }
            }

            let next = (start + self.interval * attempts).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GateError::Cancelled { attempts }),
                _ = tokio::time::sleep_until(next) => {}
            }

            if Instant::now() >= deadline {
                return Err(GateError::TimedOut {
                    attempts,
                    waited: start.elapsed(),
                    last_error,
                });
            }
        }
    }
}

/// Convenience wrapper around [`ServiceGate::await_healthy`].
pub async fn await_healthy(
    probe: &dyn HealthProbe,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Ready, GateError> {
    ServiceGate::new(interval, timeout)
        .await_healthy(probe, cancel)
        .await
}
