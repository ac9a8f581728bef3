//! Durable manager state.
//!
//! The registry and shard table are committed together as a single value so a
//! restart never observes an assignment without the runners it references.

use super::registry::Registry;
use crate::shard::ShardTable;
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, Write};
use commonware_runtime::{Clock, Metrics, Storage};
use commonware_storage::metadata::{self, Metadata};
use commonware_utils::sequence::U64;

const STATE_KEY: u64 = 0;

/// Everything the manager persists.
#[derive(Debug, Clone)]
pub(super) struct State {
    pub registry: Registry,
    pub table: ShardTable,
}

impl Write for State {
    fn write(&self, buf: &mut impl BufMut) {
        self.registry.write(buf);
        self.table.write(buf);
    }
}

impl EncodeSize for State {
    fn encode_size(&self) -> usize {
        self.registry.encode_size() + self.table.encode_size()
    }
}

impl Read for State {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let registry = Registry::read_cfg(buf, &())?;
        let table = ShardTable::read_cfg(buf, &())?;
        Ok(Self { registry, table })
    }
}

/// Atomic store for manager state, backed by [Metadata].
pub(super) struct Store<E: Storage + Metrics + Clock> {
    metadata: Metadata<E, U64, State>,
}

impl<E: Storage + Metrics + Clock> Store<E> {
    /// Open the store and return any previously persisted state.
    pub async fn init(
        context: E,
        partition: String,
    ) -> Result<(Self, Option<State>), metadata::Error> {
        let metadata = Metadata::init(
            context,
            metadata::Config {
                partition,
                codec_config: (),
            },
        )
        .await?;
        let state = metadata.get(&U64::new(STATE_KEY)).cloned();
        Ok((Self { metadata }, state))
    }

    /// Commit the given state, replacing whatever was stored before.
    pub async fn persist(&mut self, state: State) -> Result<(), metadata::Error> {
        self.metadata.put_sync(U64::new(STATE_KEY), state).await
    }

    pub async fn close(self) -> Result<(), metadata::Error> {
        self.metadata.close().await
    }
}
