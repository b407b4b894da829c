use std::time::Duration;

use crate::error::ClientError;

/// Delay growth between reconnect attempts. Attempts are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed(Duration),
    Linear {
        initial: Duration,
        step: Duration,
        max: Duration,
    },
    Exponential {
        initial: Duration,
        factor: u32,
        max: Duration,
    },
}

impl BackoffStrategy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_sub(1);
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { initial, step, max } => initial
                .saturating_add(step.saturating_mul(n))
                .min(*max),
            BackoffStrategy::Exponential {
                initial,
                factor,
                max,
            } => {
                let multiplier = (*factor).max(1).checked_pow(n).unwrap_or(u32::MAX);
                initial.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial: Duration::from_millis(250),
            factor: 2,
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attempts after a transport drop before giving up. Zero disables reconnect.
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Bound on the initial connect, up to and including the WELCOME frame.
    pub handshake_timeout: Duration,
    /// Bound on each reconnect attempt.
    pub reconnect_timeout: Duration,
    /// How long a call waits for its completion.
    pub invoke_timeout: Duration,
    /// Undelivered peer events (messages, candidates) buffered before new
    /// ones are dropped and reported as `ClientEvent::EventsDropped`.
    /// Lifecycle events are never dropped.
    pub event_capacity: usize,
    /// Requested lifetime of registered E2EE sessions; zero uses the server default.
    pub session_ttl_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff: BackoffStrategy::default(),
            handshake_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(10),
            event_capacity: 256,
            session_ttl_secs: 0,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.event_capacity == 0 {
            return Err(ClientError::Config("event_capacity must be at least 1".into()));
        }
        if self.handshake_timeout.is_zero()
            || self.reconnect_timeout.is_zero()
            || self.invoke_timeout.is_zero()
        {
            return Err(ClientError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
