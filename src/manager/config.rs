use std::{net::SocketAddr, time::Duration};

/// Configuration for [super::Actor].
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to listen on for runner and client connections.
    pub listen: SocketAddr,

    /// Number of shards the entity id-space is split into.
    ///
    /// Must match across restarts of the same partition.
    pub shard_count: u32,

    /// Expected interval between runner heartbeats. Liveness is swept on the
    /// same cadence.
    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before a runner is considered
    /// unresponsive and its shards are reassigned.
    pub miss_threshold: u32,

    /// How long an unresponsive runner is remembered before its record is
    /// dropped.
    pub removal_grace: Duration,

    /// Storage partition for durable state.
    pub partition: String,

    /// Mailbox buffer size.
    pub mailbox_size: usize,
}

impl Config {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            shard_count: 64,
            heartbeat_interval: Duration::from_secs(1),
            miss_threshold: 3,
            removal_grace: Duration::from_secs(5),
            partition: "herd-manager".to_string(),
            mailbox_size: 64,
        }
    }

    /// Time without a heartbeat after which a runner is demoted.
    pub fn unresponsive_after(&self) -> Duration {
        self.heartbeat_interval * self.miss_threshold
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_miss_threshold(mut self, misses: u32) -> Self {
        self.miss_threshold = misses;
        self
    }

    pub fn with_removal_grace(mut self, grace: Duration) -> Self {
        self.removal_grace = grace;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }
}
