use crate::{shard::ShardId, EntityId, RunnerId};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::net::SocketAddr;

/// Message types that can be sent to the [Mailbox].
pub enum Message {
    /// Admit a new runner serving entities at `addr`.
    Register {
        addr: SocketAddr,
        responder: oneshot::Sender<Registration>,
    },

    /// Record a heartbeat and return the runner's current lease.
    Heartbeat {
        runner: RunnerId,
        responder: oneshot::Sender<Heartbeat>,
    },

    /// Resolve the owner of the entity's shard.
    Locate {
        entity: EntityId,
        responder: oneshot::Sender<Option<Location>>,
    },

    /// Gracefully remove a runner and reassign its shards.
    Deregister {
        runner: RunnerId,
        responder: oneshot::Sender<()>,
    },
}

/// A granted runner identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub runner: RunnerId,
    pub shard_count: u32,
}

/// Heartbeat acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heartbeat {
    /// The shards the runner currently owns, at the given table version.
    Lease { version: u64, shards: Vec<ShardId> },

    /// The runner is not in the registry and must register again.
    Unknown,
}

/// A resolved shard owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub version: u64,
    pub runner: RunnerId,
    pub addr: SocketAddr,
}

/// Ingress mailbox for [super::Actor].
///
/// Every method returns None once the actor has shut down.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    pub async fn register(&mut self, addr: SocketAddr) -> Option<Registration> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Register { addr, responder })
            .await
            .ok()?;
        receiver.await.ok()
    }

    pub async fn heartbeat(&mut self, runner: RunnerId) -> Option<Heartbeat> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Heartbeat { runner, responder })
            .await
            .ok()?;
        receiver.await.ok()
    }

    /// Resolve the owner of the entity's shard.
    ///
    /// The inner Option is None while the shard is unassigned (no active
    /// runners).
    pub async fn locate(&mut self, entity: EntityId) -> Option<Option<Location>> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Locate { entity, responder })
            .await
            .ok()?;
        receiver.await.ok()
    }

    pub async fn deregister(&mut self, runner: RunnerId) -> Option<()> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Deregister { runner, responder })
            .await
            .ok()?;
        receiver.await.ok()
    }
}
