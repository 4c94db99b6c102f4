//! Reconnect policy: capped exponential backoff with a bounded attempt count.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{AgentDescriptor, DialError};
use crate::session::{AgentSession, SessionPool};

/// Bounds for reopening agent sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total `open` attempts before an agent is marked unhealthy
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds)
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// How often the maintenance loop retries unhealthy agents (milliseconds)
    pub recovery_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            recovery_interval_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

/// Every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: DialError,
}

/// Open a session, retrying unreachable agents per `policy`.
///
/// A rejected handshake is not retried.
pub async fn open_with_backoff(
    pool: &SessionPool,
    descriptor: &AgentDescriptor,
    policy: &RetryPolicy,
) -> Result<Arc<AgentSession>, RetryExhausted> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match pool.open(descriptor).await {
            Ok(session) => return Ok(session),
            Err(err @ DialError::Rejected { .. }) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                })
            }
            Err(err) if attempt >= max_attempts => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                })
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    agent_id = %descriptor.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "open failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{DialBehavior, ScriptedConnector};

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 350,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_dial(&"a".into(), DialBehavior::FailTimes(2));
        let pool = SessionPool::new(connector.clone());

        let session = open_with_backoff(&pool, &AgentDescriptor::new("a", "img"), &RetryPolicy::default())
            .await
            .unwrap();
        assert!(session.is_ready());
        assert_eq!(connector.dial_attempts(&"a".into()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_dial(&"a".into(), DialBehavior::Unreachable);
        let pool = SessionPool::new(connector.clone());

        let err = open_with_backoff(&pool, &AgentDescriptor::new("a", "img"), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(connector.dial_attempts(&"a".into()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_dial(&"a".into(), DialBehavior::Reject);
        let pool = SessionPool::new(connector.clone());

        let err = open_with_backoff(&pool, &AgentDescriptor::new("a", "img"), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.last_error, DialError::Rejected { .. }));
    }
}
