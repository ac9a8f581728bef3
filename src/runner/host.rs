//! Per-id entity instances and request dispatch.
//!
//! Each entity id gets its own instance task with a bounded work queue, so
//! requests for one id are handled strictly one at a time (in arrival order)
//! while different ids proceed concurrently. Instances are created on first
//! use and torn down after sitting idle or when their shard is lost.

use crate::{
    shard::{shard_of, ShardId},
    wire::Fault,
    Entity, EntityId, Instance,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::poll_fn,
    StreamExt,
};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Work queue depth per entity instance.
const INSTANCE_BUFFER: usize = 64;

/// One queued request for an entity instance.
pub(super) struct Work {
    method: String,
    payload: Vec<u8>,
    responder: oneshot::Sender<Result<Vec<u8>, Fault>>,
}

/// Lazily creates entity instances and routes requests to them.
pub(super) struct Host<E: Clock + Spawner + Metrics, T: Entity<E>> {
    context: E,
    entity: T,
    idle_timeout: Duration,
    instances: HashMap<EntityId, mpsc::Sender<Work>>,
}

impl<E: Clock + Spawner + Metrics, T: Entity<E>> Host<E, T> {
    pub fn new(context: E, entity: T, idle_timeout: Duration) -> Self {
        Self {
            context,
            entity,
            idle_timeout,
            instances: HashMap::new(),
        }
    }

    /// Hand out the entity's work queue, creating its instance if needed.
    ///
    /// Callers submit on the clone without holding the host, so a full queue
    /// never blocks anyone else's access to the map.
    pub fn sender(&mut self, id: &EntityId) -> mpsc::Sender<Work> {
        match self.instances.get(id) {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let sender =
                    spawn_instance(&self.context, &self.entity, id.clone(), self.idle_timeout);
                self.instances.insert(id.clone(), sender.clone());
                sender
            }
        }
    }

    /// Drop the entity's map entry if its instance has exited.
    pub fn prune(&mut self, id: &EntityId) {
        if self
            .instances
            .get(id)
            .is_some_and(|sender| sender.is_closed())
        {
            self.instances.remove(id);
        }
    }

    /// Tear down instances whose shard is no longer in `owned`, dropping
    /// idle-retired entries along the way.
    ///
    /// In-flight and queued requests drain before each instance exits.
    pub fn retain_shards(&mut self, owned: impl Fn(ShardId) -> bool, shard_count: u32) -> usize {
        let mut evicted = 0;
        self.instances.retain(|id, sender| {
            if sender.is_closed() {
                return false;
            }
            let keep = owned(shard_of(id, shard_count));
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            debug!(evicted, "dropped instances for lost shards");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }
}

/// Queue a request on an instance's channel, waiting for a slot.
///
/// The returned receiver resolves once the instance has handled the request;
/// dropping it does not cancel the work. Hands the request back if the
/// instance exited before accepting it.
pub(super) async fn submit(
    mut sender: mpsc::Sender<Work>,
    method: String,
    payload: Vec<u8>,
) -> Result<oneshot::Receiver<Result<Vec<u8>, Fault>>, (String, Vec<u8>)> {
    if poll_fn(|cx| sender.poll_ready(cx)).await.is_err() {
        return Err((method, payload));
    }
    let (responder, receiver) = oneshot::channel();
    match sender.try_send(Work {
        method,
        payload,
        responder,
    }) {
        Ok(()) => Ok(receiver),
        // The instance idled out between poll and send.
        Err(err) => {
            let Work {
                method, payload, ..
            } = err.into_inner();
            Err((method, payload))
        }
    }
}

fn spawn_instance<E: Clock + Spawner + Metrics, T: Entity<E>>(
    context: &E,
    entity: &T,
    id: EntityId,
    idle_timeout: Duration,
) -> mpsc::Sender<Work> {
    let (sender, mut receiver) = mpsc::channel::<Work>(INSTANCE_BUFFER);
    let context = context.with_label("instance");
    let mut instance = entity.create(context.clone(), id.clone());
    context.spawn(move |context| async move {
        debug!(%id, "instance started");
        loop {
            select! {
                work = receiver.next() => {
                    let Some(work) = work else {
                        debug!(%id, "instance evicted");
                        return;
                    };
                    let result = instance.handle(work.method, work.payload).await;
                    let _ = work.responder.send(result);
                },
                _ = context.sleep(idle_timeout) => {
                    debug!(%id, "instance idle");
                    return;
                },
            }
        }
    });
    sender
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics as _, Runner as _, RwLock};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    /// Test entity that records how many instances were created and counts
    /// calls per instance.
    #[derive(Clone)]
    struct Counting {
        created: Arc<AtomicU32>,
    }

    struct CountingInstance {
        id: EntityId,
        calls: u32,
    }

    impl<E: Clock + Send + Sync + 'static> Entity<E> for Counting {
        type Instance = CountingInstance;

        fn create(&self, _: E, id: EntityId) -> Self::Instance {
            self.created.fetch_add(1, Ordering::Relaxed);
            CountingInstance { id, calls: 0 }
        }
    }

    impl Instance for CountingInstance {
        async fn handle(&mut self, _: String, _: Vec<u8>) -> Result<Vec<u8>, Fault> {
            self.calls += 1;
            Ok(format!("{}:{}", self.id, self.calls).into_bytes())
        }
    }

    async fn call<E: Clock + Spawner + Metrics, T: Entity<E>>(
        host: &mut Host<E, T>,
        id: &EntityId,
    ) -> Vec<u8> {
        let mut method = "call".to_string();
        let mut payload = Vec::new();
        loop {
            let sender = host.sender(id);
            match submit(sender, method, payload).await {
                Ok(receiver) => return receiver.await.unwrap().unwrap(),
                Err((m, p)) => {
                    host.prune(id);
                    method = m;
                    payload = p;
                }
            }
        }
    }

    #[test_traced]
    fn test_instance_reused_per_id() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let created = Arc::new(AtomicU32::new(0));
            let entity = Counting {
                created: created.clone(),
            };
            let mut host = Host::new(context, entity, Duration::from_secs(60));

            let id = EntityId::new("node", "1");
            let first = call(&mut host, &id).await;
            let second = call(&mut host, &id).await;
            assert_eq!(first, b"node-1:1");
            assert_eq!(second, b"node-1:2");
            assert_eq!(created.load(Ordering::Relaxed), 1);

            // A different id gets its own instance.
            call(&mut host, &EntityId::new("node", "2")).await;
            assert_eq!(created.load(Ordering::Relaxed), 2);
            assert_eq!(host.len(), 2);
        });
    }

    #[test_traced]
    fn test_idle_instance_recreated() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let created = Arc::new(AtomicU32::new(0));
            let entity = Counting {
                created: created.clone(),
            };
            let mut host = Host::new(context.clone(), entity, Duration::from_millis(100));

            let id = EntityId::new("node", "1");
            call(&mut host, &id).await;

            // Let the instance idle out, then dispatch again: a fresh
            // instance is created transparently.
            context.sleep(Duration::from_secs(1)).await;
            let result = call(&mut host, &id).await;
            assert_eq!(result, b"node-1:1");
            assert_eq!(created.load(Ordering::Relaxed), 2);
        });
    }

    #[test_traced]
    fn test_retain_shards_evicts_lost_ids() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let entity = Counting {
                created: Arc::new(AtomicU32::new(0)),
            };
            let mut host = Host::new(context, entity, Duration::from_secs(60));

            let shard_count = 8;
            let a = EntityId::new("node", "1");
            let b = EntityId::new("node", "2");
            call(&mut host, &a).await;
            call(&mut host, &b).await;

            // Keep only a's shard.
            let kept = shard_of(&a, shard_count);
            let evicted = host.retain_shards(|shard| shard == kept, shard_count);
            let expected = if shard_of(&b, shard_count) == kept { 0 } else { 1 };
            assert_eq!(evicted, expected);
        });
    }

    /// Never finishes a request within the test window.
    #[derive(Clone)]
    struct Stall;

    struct StallInstance<E: Clock> {
        context: E,
    }

    impl<E: Clock + Send + Sync + 'static> Entity<E> for Stall {
        type Instance = StallInstance<E>;

        fn create(&self, context: E, _: EntityId) -> Self::Instance {
            StallInstance { context }
        }
    }

    impl<E: Clock> Instance for StallInstance<E> {
        async fn handle(&mut self, _: String, _: Vec<u8>) -> Result<Vec<u8>, Fault> {
            self.context.sleep(Duration::from_secs(10)).await;
            Ok(vec![])
        }
    }

    #[test_traced]
    fn test_full_queue_does_not_hold_host() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let host = Arc::new(RwLock::new(Host::new(
                context.clone(),
                Stall,
                Duration::from_secs(60),
            )));

            // One request in flight, a full queue behind it, and one more
            // caller parked waiting for a slot.
            let id = EntityId::new("node", "1");
            for _ in 0..(INSTANCE_BUFFER + 2) {
                let host = host.clone();
                let id = id.clone();
                context.with_label("caller").spawn(move |_| async move {
                    let sender = host.write().await.sender(&id);
                    let _ = submit(sender, "call".into(), vec![]).await;
                });
            }
            context.sleep(Duration::from_millis(100)).await;

            // The host lock is still immediately available for a lease
            // change despite the parked caller.
            let evicted = host.write().await.retain_shards(|_| false, 8);
            assert_eq!(evicted, 1);
        });
    }

    #[test_traced]
    fn test_retain_shards_prunes_retired_instances() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let entity = Counting {
                created: Arc::new(AtomicU32::new(0)),
            };
            let mut host = Host::new(context.clone(), entity, Duration::from_millis(100));

            let id = EntityId::new("node", "1");
            call(&mut host, &id).await;
            assert_eq!(host.len(), 1);

            // The retired instance's entry is dropped on the next lease
            // pass without counting as an eviction.
            context.sleep(Duration::from_secs(1)).await;
            let evicted = host.retain_shards(|_| true, 8);
            assert_eq!(evicted, 0);
            assert_eq!(host.len(), 0);
        });
    }
}
