use std::{net::SocketAddr, time::Duration};

/// How calls are retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts per call, including the first.
    pub max_attempts: u32,

    /// Budget for a single attempt (resolve plus request).
    pub timeout: Duration,

    /// Delay before the second attempt; doubles per retry up to [Self::max_backoff].
    pub backoff: Duration,

    /// Ceiling for the doubled backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Configuration for [super::Client].
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the shard manager.
    pub manager: SocketAddr,

    /// Retry behavior for [super::Client::call].
    pub retry: RetryPolicy,
}

impl Config {
    pub fn new(manager: SocketAddr) -> Self {
        Self {
            manager,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
