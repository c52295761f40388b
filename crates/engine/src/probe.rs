//! Bounded retry around a status client.

use crate::{StatusClient, TransportError};
use ceremony_core::{Observation, ServiceStatus, StatusKind, Token};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for one poll attempt.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Total time spent sleeping when every attempt fails.
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|n| self.backoff(n)).sum()
    }
}

/// Produces exactly one observation per call, retrying the client a bounded
/// number of times. Never fails outward.
pub struct RetryingProbe {
    client: Arc<dyn StatusClient>,
    config: RetryConfig,
}

impl RetryingProbe {
    pub fn new(client: Arc<dyn StatusClient>, config: RetryConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Observe a token with no last-known position.
    pub async fn observe(&self, token: &Token) -> Observation {
        self.observe_from(token, None).await
    }

    /// Observe a token. `last_position` is carried into a service-reported
    /// temporary issue so the user keeps seeing where they were.
    pub async fn observe_from(&self, token: &Token, last_position: Option<u64>) -> Observation {
        let max_attempts = self.config.max_attempts.max(1);
        let mut unreachable = 0u32;

        for attempt in 1..=max_attempts {
            match self.client.probe(token).await {
                Ok(raw) => match (raw.kind, raw.position) {
                    (ServiceStatus::Active, Some(position)) => {
                        debug!(token = %token, attempt, position, "Probe succeeded");
                        return Observation::active(token.clone(), position);
                    }
                    (ServiceStatus::Temporary, _) => {
                        debug!(token = %token, attempt, code = %raw.code, "Service reported temporary issue");
                        return Observation::now(
                            token.clone(),
                            StatusKind::TemporaryIssue,
                            last_position,
                        );
                    }
                    (ServiceStatus::Active, None) => {
                        debug!(token = %token, attempt, "Active status without position");
                    }
                    (ServiceStatus::Unknown, _) => {
                        debug!(token = %token, attempt, code = %raw.code, "Unrecognized status code");
                    }
                },
                Err(TransportError::Unreachable(reason)) => {
                    unreachable += 1;
                    debug!(token = %token, attempt, reason = %reason, "Service unreachable");
                }
                Err(TransportError::Malformed(reason)) => {
                    debug!(token = %token, attempt, reason = %reason, "Malformed response");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        if unreachable == max_attempts {
            warn!(token = %token, attempts = max_attempts, "Service down after all attempts");
            Observation::service_down(token.clone())
        } else {
            warn!(token = %token, attempts = max_attempts, "No usable status after all attempts");
            Observation::unknown(token.clone())
        }
    }
}
