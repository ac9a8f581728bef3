//! Shard manager: tracks runner liveness and assigns shards.
//!
//! The manager is the single authority for which runner owns which shard. It
//! accepts framed connections from runners (register, heartbeat, deregister)
//! and clients (locate), sweeps liveness on the heartbeat cadence, and commits
//! the registry and shard table to durable storage whenever either changes.
//!
//! Assignment uses rendezvous hashing over the active runners, so runners
//! joining or leaving move only the shards they gain or lose.

mod config;
pub use config::Config;
mod ingress;
pub use ingress::{Heartbeat, Location, Mailbox, Message, Registration};
mod registry;
pub use registry::{Record, Registry, Status, Sweep};
mod store;
use store::{State, Store};

use crate::{
    shard::{shard_of, ShardTable},
    wire::{ManagerMessage, MAX_MESSAGE_SIZE},
};
use commonware_codec::{DecodeExt, Encode};
use commonware_macros::select;
use commonware_runtime::{
    Clock, Handle, Listener, Metrics, Network, Sink, Spawner, Storage, Stream,
};
use commonware_storage::metadata;
use commonware_stream::utils::codec::{recv_frame, send_frame};
use futures::{channel::mpsc, StreamExt};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur when initializing or running the manager.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] metadata::Error),
    #[error("persisted shard count {persisted} does not match configured {configured}")]
    ShardCountMismatch { persisted: u32, configured: u32 },
}

struct Telemetry {
    runners: Gauge,
    rebalances: Counter,
    shard_moves: Counter,
    heartbeats: Counter,
    locates: Counter,
    removals: Counter,
}

impl Telemetry {
    fn init(context: &impl Metrics) -> Self {
        let telemetry = Self {
            runners: Gauge::default(),
            rebalances: Counter::default(),
            shard_moves: Counter::default(),
            heartbeats: Counter::default(),
            locates: Counter::default(),
            removals: Counter::default(),
        };
        context.register(
            "runners",
            "registered runners (any status)",
            telemetry.runners.clone(),
        );
        context.register(
            "rebalances",
            "shard table rebalances that moved at least one shard",
            telemetry.rebalances.clone(),
        );
        context.register(
            "shard_moves",
            "shards that changed owner across all rebalances",
            telemetry.shard_moves.clone(),
        );
        context.register(
            "heartbeats",
            "heartbeats received",
            telemetry.heartbeats.clone(),
        );
        context.register("locates", "locate queries served", telemetry.locates.clone());
        context.register(
            "removals",
            "runner records dropped after the removal grace",
            telemetry.removals.clone(),
        );
        telemetry
    }
}

/// The shard manager actor.
pub struct Actor<E: Clock + Spawner + Storage + Network + Metrics> {
    context: E,
    cfg: Config,

    registry: Registry,
    table: ShardTable,
    store: Store<E>,

    mailbox_sender: mpsc::Sender<Message>,
    mailbox_receiver: mpsc::Receiver<Message>,

    telemetry: Telemetry,
}

impl<E: Clock + Spawner + Storage + Network + Metrics> Actor<E> {
    /// Open durable state and prepare the actor.
    ///
    /// Previously persisted assignments are restored as-is; restored runners
    /// get a fresh liveness window and are swept normally if they never
    /// resume heartbeating.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let (store, state) = Store::init(context.with_label("store"), cfg.partition.clone()).await?;
        let (registry, table) = match state {
            Some(State { registry, table }) => {
                if table.shard_count() != cfg.shard_count {
                    return Err(Error::ShardCountMismatch {
                        persisted: table.shard_count(),
                        configured: cfg.shard_count,
                    });
                }
                let mut registry = registry;
                registry.reset_liveness(context.current());
                info!(
                    runners = registry.len(),
                    version = table.version(),
                    "restored persisted state"
                );
                (registry, table)
            }
            None => (Registry::default(), ShardTable::new(cfg.shard_count)),
        };

        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let telemetry = Telemetry::init(&context);
        telemetry.runners.set(registry.len() as i64);

        Ok(Self {
            context,
            cfg,
            registry,
            table,
            store,
            mailbox_sender,
            mailbox_receiver,
            telemetry,
        })
    }

    /// Start the actor, returning its handle and a mailbox for in-process
    /// callers. Remote callers connect to the configured listen address.
    pub fn start(mut self) -> (Handle<()>, Mailbox) {
        let mailbox = Mailbox::new(self.mailbox_sender.clone());
        let handle = self.context.spawn_ref()(self.run());
        (handle, mailbox)
    }

    async fn run(mut self) {
        let mut listener = match self
            .context
            .with_label("listener")
            .bind(self.cfg.listen)
            .await
        {
            Ok(listener) => listener,
            Err(err) => {
                error!(addr = %self.cfg.listen, ?err, "failed to bind");
                return;
            }
        };
        info!(addr = %self.cfg.listen, shards = self.cfg.shard_count, "listening");

        let mut shutdown = self.context.stopped();
        let mut sweep = Box::pin(self.context.sleep(self.cfg.heartbeat_interval));
        loop {
            select! {
                _ = &mut shutdown => {
                    debug!("shutdown");
                    break;
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((peer, sink, stream)) => {
                            let mailbox = Mailbox::new(self.mailbox_sender.clone());
                            self.context.with_label("connection").spawn(move |_| {
                                connection(mailbox, sink, stream)
                            });
                            debug!(%peer, "accepted connection");
                        }
                        Err(err) => {
                            warn!(?err, "failed to accept connection");
                        }
                    }
                },
                message = self.mailbox_receiver.next() => {
                    let Some(message) = message else {
                        error!("mailbox receiver failed");
                        break;
                    };
                    self.handle(message).await;
                },
                _ = &mut sweep => {
                    self.sweep().await;
                    sweep = Box::pin(self.context.sleep(self.cfg.heartbeat_interval));
                },
            }
        }

        if let Err(err) = self.store.close().await {
            error!(?err, "failed to close store");
        }
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Register { addr, responder } => {
                let runner = self.registry.register(addr, self.context.current());
                self.telemetry.runners.set(self.registry.len() as i64);
                info!(runner, %addr, "registered runner");
                self.persist().await;
                let _ = responder.send(Registration {
                    runner,
                    shard_count: self.table.shard_count(),
                });
            }
            Message::Heartbeat { runner, responder } => {
                self.telemetry.heartbeats.inc();
                let response = match self.registry.heartbeat(runner, self.context.current()) {
                    None => {
                        warn!(runner, "heartbeat from unknown runner");
                        Heartbeat::Unknown
                    }
                    Some(previous) => {
                        // A first or recovering heartbeat changes eligibility.
                        if previous != Status::Active {
                            debug!(runner, ?previous, "runner became active");
                            self.rebalance();
                            self.persist().await;
                        }
                        Heartbeat::Lease {
                            version: self.table.version(),
                            shards: self.table.owned_by(runner),
                        }
                    }
                };
                let _ = responder.send(response);
            }
            Message::Locate { entity, responder } => {
                self.telemetry.locates.inc();
                let shard = shard_of(&entity, self.table.shard_count());
                let location = self.table.owner(shard).and_then(|runner| {
                    self.registry.get(runner).map(|record| Location {
                        version: self.table.version(),
                        runner,
                        addr: record.addr,
                    })
                });
                debug!(%entity, shard, ?location, "located");
                let _ = responder.send(location);
            }
            Message::Deregister { runner, responder } => {
                if self.registry.deregister(runner).is_some() {
                    info!(runner, "deregistered runner");
                    self.telemetry.runners.set(self.registry.len() as i64);
                    self.rebalance();
                    self.persist().await;
                }
                let _ = responder.send(());
            }
        }
    }

    /// Demote and drop runners that stopped heartbeating.
    async fn sweep(&mut self) {
        let sweep = self.registry.sweep(
            self.context.current(),
            self.cfg.unresponsive_after(),
            self.cfg.removal_grace,
        );
        if sweep.is_empty() {
            return;
        }
        for runner in &sweep.demoted {
            warn!(runner, "runner unresponsive, reassigning its shards");
        }
        for runner in &sweep.removed {
            warn!(runner, "dropping unresponsive runner");
            self.telemetry.removals.inc();
        }
        self.telemetry.runners.set(self.registry.len() as i64);
        self.rebalance();
        self.persist().await;
    }

    fn rebalance(&mut self) {
        let moved = self.table.rebalance(&self.registry.eligible());
        if moved > 0 {
            self.telemetry.rebalances.inc();
            self.telemetry.shard_moves.inc_by(moved as u64);
            info!(
                moved,
                version = self.table.version(),
                active = self.registry.eligible().len(),
                "rebalanced shards"
            );
        }
    }

    async fn persist(&mut self) {
        let state = State {
            registry: self.registry.clone(),
            table: self.table.clone(),
        };
        if let Err(err) = self.store.persist(state).await {
            // Keep serving from memory; assignments will be stale after a
            // restart but runners re-register and heal the table.
            error!(?err, "failed to persist state");
        }
    }
}

/// Serve one framed connection, translating wire messages into mailbox calls.
async fn connection<Si: Sink, St: Stream>(mut mailbox: Mailbox, mut sink: Si, mut stream: St) {
    loop {
        let data = match recv_frame(&mut stream, MAX_MESSAGE_SIZE).await {
            Ok(data) => data,
            Err(_) => return,
        };
        let message = match ManagerMessage::decode(&data[..]) {
            Ok(message) => message,
            Err(err) => {
                warn!(?err, "failed to decode message");
                return;
            }
        };
        let response = match message {
            ManagerMessage::Register { request_id, addr } => {
                match mailbox.register(addr).await {
                    Some(registration) => ManagerMessage::Registered {
                        request_id,
                        runner: registration.runner,
                        shard_count: registration.shard_count,
                    },
                    None => return,
                }
            }
            ManagerMessage::Heartbeat { request_id, runner } => {
                match mailbox.heartbeat(runner).await {
                    Some(Heartbeat::Lease { version, shards }) => ManagerMessage::Lease {
                        request_id,
                        version,
                        shards,
                    },
                    Some(Heartbeat::Unknown) => ManagerMessage::UnknownRunner { request_id },
                    None => return,
                }
            }
            ManagerMessage::Locate { request_id, entity } => {
                match mailbox.locate(entity).await {
                    Some(Some(location)) => ManagerMessage::Located {
                        request_id,
                        version: location.version,
                        runner: location.runner,
                        addr: location.addr,
                    },
                    Some(None) => ManagerMessage::Unassigned { request_id },
                    None => return,
                }
            }
            ManagerMessage::Deregister { request_id, runner } => {
                match mailbox.deregister(runner).await {
                    Some(()) => ManagerMessage::Deregistered { request_id },
                    None => return,
                }
            }
            // Response variants are never valid requests.
            other => {
                warn!(request_id = other.request_id(), "unexpected message");
                return;
            }
        };
        let data = response.encode().to_vec();
        if send_frame(&mut sink, &data, MAX_MESSAGE_SIZE).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityId;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics as _, Runner as _};
    use std::time::Duration;

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test_traced]
    fn test_register_heartbeat_locate() {
        let executor = deterministic::Runner::seeded(1);
        executor.start(|context| async move {
            let actor = Actor::init(
                context.with_label("manager"),
                Config::new(addr(4000)).with_shard_count(8),
            )
            .await
            .unwrap();
            let (_handle, mut mailbox) = actor.start();

            let runner = mailbox.register(addr(4100)).await.unwrap().runner;

            // No heartbeat yet: still joining, nothing assigned.
            let entity = EntityId::new("node", "1");
            assert_eq!(mailbox.locate(entity.clone()).await.unwrap(), None);

            // First heartbeat activates the runner and assigns every shard.
            let lease = mailbox.heartbeat(runner).await.unwrap();
            let Heartbeat::Lease { version, shards } = lease else {
                panic!("expected lease");
            };
            assert_eq!(shards.len(), 8);
            let location = mailbox.locate(entity).await.unwrap().unwrap();
            assert_eq!(location.runner, runner);
            assert_eq!(location.addr, addr(4100));
            assert_eq!(location.version, version);

            let buffer = context.encode();
            assert!(buffer.contains("runners 1"));
            assert!(buffer.contains("rebalances_total 1"));
        });
    }

    #[test_traced]
    fn test_unknown_heartbeat() {
        let executor = deterministic::Runner::seeded(1);
        executor.start(|context| async move {
            let actor = Actor::init(context.with_label("manager"), Config::new(addr(4000)))
                .await
                .unwrap();
            let (_handle, mut mailbox) = actor.start();
            assert_eq!(mailbox.heartbeat(99).await.unwrap(), Heartbeat::Unknown);
        });
    }

    #[test_traced]
    fn test_silent_runner_swept_and_removed() {
        let executor = deterministic::Runner::seeded(1);
        executor.start(|context| async move {
            let cfg = Config::new(addr(4000))
                .with_shard_count(4)
                .with_heartbeat_interval(Duration::from_millis(100))
                .with_miss_threshold(3)
                .with_removal_grace(Duration::from_millis(500));
            let unresponsive_after = cfg.unresponsive_after();
            let removal_grace = cfg.removal_grace;
            let actor = Actor::init(context.with_label("manager"), cfg).await.unwrap();
            let (_handle, mut mailbox) = actor.start();

            let runner = mailbox.register(addr(4100)).await.unwrap().runner;
            mailbox.heartbeat(runner).await.unwrap();
            let entity = EntityId::new("node", "1");
            assert!(mailbox.locate(entity.clone()).await.unwrap().is_some());

            // Stop heartbeating: shards are reclaimed after the miss window.
            context.sleep(unresponsive_after * 2).await;
            assert_eq!(mailbox.locate(entity.clone()).await.unwrap(), None);

            // And the record itself is dropped after the grace.
            context.sleep(unresponsive_after + removal_grace * 2).await;
            assert_eq!(mailbox.heartbeat(runner).await.unwrap(), Heartbeat::Unknown);

            let buffer = context.encode();
            assert!(buffer.contains("removals_total 1"));
        });
    }

    #[test_traced]
    fn test_deregister_reassigns() {
        let executor = deterministic::Runner::seeded(1);
        executor.start(|context| async move {
            let actor = Actor::init(
                context.with_label("manager"),
                Config::new(addr(4000)).with_shard_count(16),
            )
            .await
            .unwrap();
            let (_handle, mut mailbox) = actor.start();

            let a = mailbox.register(addr(4100)).await.unwrap().runner;
            let b = mailbox.register(addr(4101)).await.unwrap().runner;
            mailbox.heartbeat(a).await.unwrap();
            mailbox.heartbeat(b).await.unwrap();

            mailbox.deregister(a).await.unwrap();
            let Heartbeat::Lease { shards, .. } = mailbox.heartbeat(b).await.unwrap() else {
                panic!("expected lease");
            };
            assert_eq!(shards.len(), 16);

            let location = mailbox
                .locate(EntityId::new("node", "7"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(location.runner, b);
        });
    }

    #[test_traced]
    fn test_restart_restores_assignments() {
        let executor = deterministic::Runner::seeded(1);
        executor.start(|context| async move {
            let cfg = Config::new(addr(4000)).with_shard_count(8);
            let actor = Actor::init(context.with_label("manager"), cfg.clone())
                .await
                .unwrap();
            let (handle, mut mailbox) = actor.start();
            let runner = mailbox.register(addr(4100)).await.unwrap().runner;
            mailbox.heartbeat(runner).await.unwrap();
            let entity = EntityId::new("node", "1");
            let before = mailbox.locate(entity.clone()).await.unwrap().unwrap();
            handle.abort();

            // A restarted manager serves the same assignment without any
            // runner re-registering. The aborted actor may still hold its
            // listener, so the replacement binds elsewhere.
            let mut cfg = cfg;
            cfg.listen = addr(4001);
            let actor = Actor::init(context.with_label("manager2"), cfg).await.unwrap();
            let (_handle, mut mailbox) = actor.start();
            let after = mailbox.locate(entity).await.unwrap().unwrap();
            assert_eq!(after.runner, before.runner);
            assert_eq!(after.addr, before.addr);
            assert_eq!(after.version, before.version);
        });
    }

    #[test_traced]
    fn test_shard_count_mismatch_rejected() {
        let executor = deterministic::Runner::seeded(1);
        executor.start(|context| async move {
            let cfg = Config::new(addr(4000)).with_shard_count(8);
            let actor = Actor::init(context.with_label("manager"), cfg.clone())
                .await
                .unwrap();
            let (handle, mut mailbox) = actor.start();
            let runner = mailbox.register(addr(4100)).await.unwrap().runner;
            mailbox.heartbeat(runner).await.unwrap();
            handle.abort();

            let result =
                Actor::init(context.with_label("manager2"), cfg.with_shard_count(16)).await;
            assert!(matches!(result, Err(Error::ShardCountMismatch { .. })));
        });
    }
}
