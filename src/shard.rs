//! Shard derivation and the versioned shard-ownership table.
//!
//! The entity id-space is partitioned into a fixed number of shards; an
//! entity's shard is derived from a digest of its id, so any process computes
//! the same placement without coordination. The [ShardTable] records, at a
//! monotonically increasing version, which runner owns each shard. Ownership
//! is decided by rendezvous (highest-random-weight) hashing over the eligible
//! runner set: each shard independently prefers the runner with the highest
//! digest weight, so a membership change moves only the shards whose
//! preferred runner changed.

use crate::{EntityId, RunnerId};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{sha256::Sha256, Hasher};

/// Index of a shard in `[0, shard_count)`.
pub type ShardId = u32;

/// Upper bound on shard counts accepted when decoding a table.
pub(crate) const MAX_SHARDS: usize = 1 << 16;

/// Derive the shard for an entity id.
///
/// Stable for the life of the cluster: the digest depends only on the id
/// bytes and `shard_count` is fixed at cluster creation.
pub fn shard_of(entity: &EntityId, shard_count: u32) -> ShardId {
    assert!(shard_count > 0, "shard_count must be non-zero");
    let mut hasher = Sha256::new();
    hasher.update(entity.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_ref()[..8]);
    (u64::from_be_bytes(prefix) % shard_count as u64) as u32
}

/// Rendezvous weight of a (shard, runner) pair.
fn weight(shard: ShardId, runner: RunnerId) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(&shard.to_be_bytes());
    hasher.update(&runner.to_be_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_ref()[..8]);
    u64::from_be_bytes(prefix)
}

/// Versioned mapping of shard to owning runner.
///
/// Invariants: every shard has at most one owner at any version, and every
/// mutation strictly increases the version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardTable {
    version: u64,
    owners: Vec<Option<RunnerId>>,
}

impl ShardTable {
    /// Create an empty table with `shard_count` unassigned shards.
    pub fn new(shard_count: u32) -> Self {
        assert!(shard_count > 0, "shard_count must be non-zero");
        Self {
            version: 0,
            owners: vec![None; shard_count as usize],
        }
    }

    /// Current table version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of shards (fixed at creation).
    pub fn shard_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Owner of `shard`, if assigned.
    pub fn owner(&self, shard: ShardId) -> Option<RunnerId> {
        self.owners.get(shard as usize).copied().flatten()
    }

    /// Shards currently owned by `runner`, in ascending order.
    pub fn owned_by(&self, runner: RunnerId) -> Vec<ShardId> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(runner))
            .map(|(shard, _)| shard as ShardId)
            .collect()
    }

    /// Recompute ownership against the eligible runner set, returning the
    /// number of shards that changed hands (including newly assigned or
    /// orphaned shards). The version is bumped only when something moved.
    pub fn rebalance(&mut self, eligible: &[RunnerId]) -> usize {
        let mut moved = 0;
        for shard in 0..self.owners.len() {
            let preferred = eligible
                .iter()
                .copied()
                .max_by_key(|runner| (weight(shard as ShardId, *runner), *runner));
            if self.owners[shard] != preferred {
                self.owners[shard] = preferred;
                moved += 1;
            }
        }
        if moved > 0 {
            self.version += 1;
        }
        moved
    }
}

impl Write for ShardTable {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        (self.owners.len() as u32).write(buf);
        for owner in &self.owners {
            owner.write(buf);
        }
    }
}

impl EncodeSize for ShardTable {
    fn encode_size(&self) -> usize {
        self.version.encode_size()
            + (self.owners.len() as u32).encode_size()
            + self
                .owners
                .iter()
                .map(|owner| owner.encode_size())
                .sum::<usize>()
    }
}

impl Read for ShardTable {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let version = u64::read(buf)?;
        let shard_count = u32::read(buf)? as usize;
        if shard_count == 0 || shard_count > MAX_SHARDS {
            return Err(CodecError::Invalid("ShardTable", "invalid shard count"));
        }
        let mut owners = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            owners.push(Option::<RunnerId>::read_cfg(buf, &())?);
        }
        Ok(Self { version, owners })
    }
}
