//! Host addressable entities on a fleet of runners.
//!
//! A cluster is composed of a single shard [manager], any number of entity-hosting
//! [runner] processes, and [client]s that route typed requests to an entity by id
//! without knowing which runner currently owns it. The entity id-space is split
//! into a fixed number of shards; the manager assigns shards to live runners and
//! rebalances when runners join, leave, or die. Runners dispatch requests to
//! per-id entity instances (created lazily, one in-flight request per id) and
//! answer `NotOwner` for shards they no longer hold, prompting the caller to
//! re-resolve.
//!
//! # Components
//!
//! - [manager::Actor]: tracks runner liveness via heartbeats, owns the
//!   [shard::ShardTable], and answers locate queries. Assignments survive
//!   restarts through an atomic metadata store.
//! - [runner::Runner]: registers with the manager, heartbeats on a fixed
//!   interval, and serves entity RPCs for the shards it holds.
//! - [client::Client]: resolves an entity's owner (with caching), applies a
//!   per-attempt timeout, and retries retryable failures with backoff.
//! - [mathematician]: the demo entity protocol, including the "double-checker"
//!   verification mode that cross-checks a computation against an independent
//!   assistant entity.
//! - [runner::crasher]: optional chaos task that kills a runner after a delay
//!   to exercise reassignment and retry paths.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Metrics, Runner as _};
//! use herd::{client, manager, mathematician, runner, EntityId};
//! use std::net::SocketAddr;
//!
//! let executor = deterministic::Runner::seeded(42);
//! executor.start(|context| async move {
//!     let manager_addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
//!     let manager = manager::Actor::init(
//!         context.with_label("manager"),
//!         manager::Config::new(manager_addr),
//!     )
//!     .await
//!     .unwrap();
//!     let (_, mailbox) = manager.start();
//!
//!     let client = client::Client::new(
//!         context.with_label("client"),
//!         client::Config::new(manager_addr),
//!     );
//!     let entity = mathematician::Mathematician::new(
//!         context.with_label("math"),
//!         client.clone(),
//!         mathematician::Config::default(),
//!     );
//!     let runner = runner::Runner::new(
//!         context.with_label("runner"),
//!         runner::Config::new(manager_addr, "127.0.0.1:4100".parse().unwrap()),
//!         entity,
//!     );
//!     let _running = runner.start();
//!
//!     let math = mathematician::Caller::new(client);
//!     let answer = math
//!         .calculate_fibonacci(&EntityId::new("node", "1"), 10)
//!         .await
//!         .unwrap();
//!     assert_eq!(answer.result, 55);
//!     drop(mailbox);
//! });
//! ```

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, Write};
use std::{fmt, future::Future};

mod error;
pub use error::Error;
pub mod client;
pub mod manager;
pub mod mathematician;
pub mod runner;
pub mod shard;
pub mod wire;

#[cfg(test)]
mod tests;

/// Opaque identifier assigned to a runner by the manager.
///
/// Identity lasts for a single process lifetime: a restarted runner registers
/// again and receives a fresh id.
pub type RunnerId = u64;

/// Maximum length of an encoded [EntityId], in bytes.
pub const MAX_ENTITY_ID: usize = 256;

/// Address of a logical entity: a kind prefix and a unique suffix joined by `-`
/// (e.g. `mathematician-double-checker-123`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    /// Build an id from a kind and suffix.
    ///
    /// Panics if `kind` is empty or contains `-`, or if `suffix` is empty.
    pub fn new(kind: &str, suffix: &str) -> Self {
        assert!(!kind.is_empty() && !kind.contains('-'), "invalid kind");
        assert!(!suffix.is_empty(), "invalid suffix");
        Self(format!("{kind}-{suffix}"))
    }

    /// Parse an id, requiring a non-empty kind and suffix within [MAX_ENTITY_ID] bytes.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() > MAX_ENTITY_ID {
            return None;
        }
        let (kind, suffix) = raw.split_once('-')?;
        if kind.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// The kind prefix (text before the first `-`).
    pub fn kind(&self) -> &str {
        self.0.split_once('-').map(|(kind, _)| kind).unwrap_or(&self.0)
    }

    /// The full id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl Write for EntityId {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.as_bytes().to_vec().write(buf);
    }
}

impl EncodeSize for EntityId {
    fn encode_size(&self) -> usize {
        self.0.as_bytes().to_vec().encode_size()
    }
}

impl Read for EntityId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        use commonware_codec::ReadRangeExt;
        let raw = Vec::<u8>::read_range(buf, 0..=MAX_ENTITY_ID)?;
        let raw = String::from_utf8(raw)
            .map_err(|_| CodecError::Invalid("EntityId", "invalid UTF-8"))?;
        Self::parse(&raw).ok_or(CodecError::Invalid("EntityId", "missing kind prefix"))
    }
}

/// Factory for entity instances of a single type.
///
/// A runner holds one factory and uses it to materialize per-id state the first
/// time a request is routed to an id it owns.
pub trait Entity<E>: Clone + Send + Sync + 'static {
    /// Per-id state created by this factory.
    type Instance: Instance;

    /// Instantiate state for `id`.
    fn create(&self, context: E, id: EntityId) -> Self::Instance;
}

/// Per-id request handler.
///
/// The hosting runner guarantees invocations for one id are serialized: a new
/// request is not handed to the instance until the previous one completes.
pub trait Instance: Send + 'static {
    /// Handle a single request, returning an encoded response or a typed fault.
    fn handle(
        &mut self,
        method: String,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, wire::Fault>> + Send;
}
