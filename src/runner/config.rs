use std::{net::SocketAddr, time::Duration};

/// Configuration for [super::Runner].
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the shard manager.
    pub manager: SocketAddr,

    /// Address to listen on for entity requests.
    pub listen: SocketAddr,

    /// Interval between heartbeats to the manager.
    pub heartbeat_interval: Duration,

    /// How long an entity instance may sit idle before it is torn down.
    pub idle_timeout: Duration,

    /// Backoff between attempts to (re)connect to the manager.
    pub reconnect_backoff: Duration,
}

impl Config {
    pub fn new(manager: SocketAddr, listen: SocketAddr) -> Self {
        Self {
            manager,
            listen,
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}
