//! Routed entity RPC.
//!
//! A [Client] turns `(entity id, method, payload)` into a framed request to
//! whichever runner currently owns the entity's shard. Owners are resolved
//! through the manager and cached per entity id; a NotOwner answer or a
//! transport failure drops the cached entry so the next attempt re-resolves.
//! Every attempt runs under a timeout, and retryable failures are retried
//! with doubling backoff up to the configured attempt budget.

mod config;
pub use config::{Config, RetryPolicy};
mod io;

use crate::{
    manager::Location,
    wire::{ManagerMessage, Outcome, Requester, RunnerMessage},
    EntityId, Error,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics, Network, RwLock, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use prometheus_client::metrics::counter::Counter;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

struct Telemetry {
    attempts: Counter,
    retries: Counter,
    resolves: Counter,
    timeouts: Counter,
}

impl Telemetry {
    fn init(context: &impl Metrics) -> Self {
        let telemetry = Self {
            attempts: Counter::default(),
            retries: Counter::default(),
            resolves: Counter::default(),
            timeouts: Counter::default(),
        };
        context.register("attempts", "call attempts", telemetry.attempts.clone());
        context.register(
            "retries",
            "attempts beyond the first",
            telemetry.retries.clone(),
        );
        context.register(
            "resolves",
            "locate queries sent to the manager",
            telemetry.resolves.clone(),
        );
        context.register(
            "timeouts",
            "attempts that exceeded the per-attempt budget",
            telemetry.timeouts.clone(),
        );
        telemetry
    }
}

/// A handle for calling entities by id.
///
/// Cheap to clone; clones share the owner cache and connection pool.
pub struct Client<E: Clock + Spawner + Metrics + Network> {
    context: E,
    cfg: Config,
    requester: Arc<Requester>,
    cache: Arc<RwLock<HashMap<EntityId, Location>>>,
    manager: Arc<RwLock<Option<mpsc::Sender<io::Request<ManagerMessage>>>>>,
    runners: Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<io::Request<RunnerMessage>>>>>,
    telemetry: Arc<Telemetry>,
}

impl<E: Clock + Spawner + Metrics + Network> Clone for Client<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cfg: self.cfg.clone(),
            requester: self.requester.clone(),
            cache: self.cache.clone(),
            manager: self.manager.clone(),
            runners: self.runners.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<E: Clock + Spawner + Metrics + Network> Client<E> {
    pub fn new(context: E, cfg: Config) -> Self {
        let telemetry = Arc::new(Telemetry::init(&context));
        Self {
            context,
            cfg,
            requester: Arc::new(Requester::new()),
            cache: Arc::new(RwLock::new(HashMap::new())),
            manager: Arc::new(RwLock::new(None)),
            runners: Arc::new(RwLock::new(HashMap::new())),
            telemetry,
        }
    }

    /// Invoke `method` on the entity, retrying per the configured policy.
    ///
    /// Non-retryable faults ([Error::InputTooLarge],
    /// [Error::VerificationMismatch]) surface immediately; everything else is
    /// retried until the attempt budget runs out, and the terminal error keeps
    /// the kind of the last failure.
    pub async fn call(
        &self,
        entity: &EntityId,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let policy = self.cfg.retry;
        let mut backoff = policy.backoff;
        let mut last = Error::Unavailable("no attempts made".to_string());
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                self.telemetry.retries.inc();
                self.context.sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            self.telemetry.attempts.inc();

            // Race the attempt against the per-attempt budget; a late
            // response lands on an abandoned responder and is discarded.
            let this = self.clone();
            let id = entity.clone();
            let method = method.to_string();
            let payload = payload.clone();
            let result = select! {
                result = this.attempt(id, method, payload) => {
                    Some(result)
                },
                _ = self.context.sleep(policy.timeout) => {
                    None
                },
            };
            let err = match result {
                Some(Ok(response)) => return Ok(response),
                Some(Err(err)) => err,
                None => {
                    self.telemetry.timeouts.inc();
                    Error::Timeout
                }
            };
            if !err.retryable() {
                return Err(err);
            }
            debug!(%entity, attempt, %err, "attempt failed");
            last = err;
        }
        warn!(%entity, attempts = policy.max_attempts, %last, "call exhausted retries");
        Err(last)
    }

    /// One resolve-and-request cycle.
    async fn attempt(
        self,
        entity: EntityId,
        method: String,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let location = self.resolve(&entity).await?;
        let message = RunnerMessage::Request {
            request_id: self.requester.next(),
            entity: entity.clone(),
            method,
            payload,
        };
        let response = match self.runner_request(location.addr, message).await {
            Ok(response) => response,
            Err(err) => {
                // The owner may be gone entirely; re-resolve next attempt.
                self.invalidate(&entity).await;
                return Err(err);
            }
        };
        let RunnerMessage::Response { outcome, .. } = response else {
            return Err(Error::Unavailable("unexpected response".to_string()));
        };
        match outcome {
            Outcome::Ok(payload) => Ok(payload),
            Outcome::Fault(fault) => Err(fault.into()),
            Outcome::NotOwner => {
                debug!(%entity, "stale owner");
                self.invalidate(&entity).await;
                Err(Error::NotOwner)
            }
        }
    }

    /// Resolve the entity's current owner, consulting the cache first.
    async fn resolve(&self, entity: &EntityId) -> Result<Location, Error> {
        if let Some(location) = self.cache.read().await.get(entity) {
            return Ok(*location);
        }
        self.telemetry.resolves.inc();
        let message = ManagerMessage::Locate {
            request_id: self.requester.next(),
            entity: entity.clone(),
        };
        match self.manager_request(message).await? {
            ManagerMessage::Located {
                version,
                runner,
                addr,
                ..
            } => {
                let location = Location {
                    version,
                    runner,
                    addr,
                };
                self.cache.write().await.insert(entity.clone(), location);
                debug!(%entity, runner, %addr, "resolved owner");
                Ok(location)
            }
            ManagerMessage::Unassigned { .. } => Err(Error::Unassigned),
            _ => Err(Error::Unavailable("unexpected locate response".to_string())),
        }
    }

    async fn invalidate(&self, entity: &EntityId) {
        self.cache.write().await.remove(entity);
    }

    async fn manager_request(&self, message: ManagerMessage) -> Result<ManagerMessage, Error> {
        let sender = {
            let guard = self.manager.read().await;
            guard.as_ref().filter(|sender| !sender.is_closed()).cloned()
        };
        let mut sender = match sender {
            Some(sender) => sender,
            None => {
                // Dial before taking the lock so a slow dial never stalls
                // requests to other connections.
                let (sink, stream) = self
                    .context
                    .dial(self.cfg.manager)
                    .await
                    .map_err(|err| Error::Unavailable(format!("manager unreachable: {err}")))?;
                let mut guard = self.manager.write().await;
                // Another caller may have reconnected first; prefer theirs
                // and let our connection drop.
                if let Some(sender) = guard.as_ref().filter(|sender| !sender.is_closed()) {
                    sender.clone()
                } else {
                    let (sender, _task) =
                        io::start(self.context.with_label("manager_io"), sink, stream);
                    *guard = Some(sender.clone());
                    sender
                }
            }
        };
        let (responder, receiver) = oneshot::channel();
        sender
            .send(io::Request { message, responder })
            .await
            .map_err(|_| Error::Unavailable("manager connection lost".to_string()))?;
        receiver
            .await
            .map_err(|_| Error::Unavailable("manager connection lost".to_string()))
    }

    async fn runner_request(
        &self,
        addr: SocketAddr,
        message: RunnerMessage,
    ) -> Result<RunnerMessage, Error> {
        let sender = {
            let guard = self.runners.read().await;
            guard
                .get(&addr)
                .filter(|sender| !sender.is_closed())
                .cloned()
        };
        let mut sender = match sender {
            Some(sender) => sender,
            None => {
                // Dial before taking the lock so one unreachable runner
                // never stalls requests to the others.
                let (sink, stream) = self.context.dial(addr).await.map_err(|err| {
                    Error::Unavailable(format!("runner {addr} unreachable: {err}"))
                })?;
                let mut guard = self.runners.write().await;
                if let Some(sender) = guard.get(&addr).filter(|sender| !sender.is_closed()) {
                    sender.clone()
                } else {
                    let (sender, _task) =
                        io::start(self.context.with_label("runner_io"), sink, stream);
                    guard.insert(addr, sender.clone());
                    sender
                }
            }
        };
        let (responder, receiver) = oneshot::channel();
        let failed = || Error::Unavailable(format!("runner {addr} connection lost"));
        sender
            .send(io::Request { message, responder })
            .await
            .map_err(|_| failed())?;
        receiver.await.map_err(|_| failed())
    }
}
