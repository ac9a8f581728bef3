//! Entity-hosting runner.
//!
//! A runner registers with the manager, heartbeats on a fixed interval, and
//! serves entity requests for the shards its lease grants. Requests for shards
//! outside the lease answer [Outcome::NotOwner] so callers re-resolve. Losing
//! a shard tears down that shard's entity instances before the new lease is
//! served; gaining one needs no work since instances materialize on first use.
//!
//! Shutdown comes in two flavors: a graceful stop (runtime shutdown signal)
//! deregisters from the manager so shards move immediately, while an abort of
//! the runner's handle behaves like a process crash and leaves the manager to
//! notice via missed heartbeats.

mod config;
pub use config::Config;
mod host;
use host::Host;
pub mod crasher;
pub use crasher::Crasher;

use crate::{
    manager::Heartbeat,
    shard::{shard_of, ShardId},
    wire::{Fault, ManagerMessage, Outcome, Requester, RunnerMessage, MAX_MESSAGE_SIZE},
    Entity, EntityId, RunnerId,
};
use commonware_codec::{DecodeExt, Encode};
use commonware_macros::select;
use commonware_runtime::{
    Clock, Handle, Listener, Metrics, Network, RwLock, Sink, SinkOf, Spawner, StreamOf,
};
use commonware_stream::utils::codec::{recv_frame, send_frame};
use futures::{channel::mpsc, future, SinkExt, StreamExt};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::{
    collections::HashSet,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Buffered responses per client connection.
const CONNECTION_BUFFER: usize = 64;

struct Telemetry {
    requests: Counter,
    not_owner: Counter,
    evictions: Counter,
    instances: Gauge,
}

impl Telemetry {
    fn init(context: &impl Metrics) -> Self {
        let telemetry = Self {
            requests: Counter::default(),
            not_owner: Counter::default(),
            evictions: Counter::default(),
            instances: Gauge::default(),
        };
        context.register(
            "requests",
            "entity requests received",
            telemetry.requests.clone(),
        );
        context.register(
            "not_owner",
            "requests refused for shards outside the lease",
            telemetry.not_owner.clone(),
        );
        context.register(
            "evictions",
            "entity instances dropped for lost shards",
            telemetry.evictions.clone(),
        );
        context.register(
            "instances",
            "live entity instances",
            telemetry.instances.clone(),
        );
        telemetry
    }
}

/// Routing state shared between the heartbeat loop and the request path.
struct Route {
    version: u64,
    shard_count: u32,
    owned: HashSet<ShardId>,
}

impl Route {
    /// Whether requests for `entity` should be served.
    fn owns(&self, entity: &EntityId) -> bool {
        // Zero until registration completes; nothing is owned yet.
        if self.shard_count == 0 {
            return false;
        }
        self.owned.contains(&shard_of(entity, self.shard_count))
    }
}

/// An entity-hosting runner.
pub struct Runner<E: Clock + Spawner + Metrics + Network, T: Entity<E>> {
    context: E,
    cfg: Config,
    entity: T,
}

impl<E: Clock + Spawner + Metrics + Network, T: Entity<E>> Runner<E, T> {
    pub fn new(context: E, cfg: Config, entity: T) -> Self {
        Self {
            context,
            cfg,
            entity,
        }
    }

    pub fn start(mut self) -> Handle<()> {
        self.context.spawn_ref()(self.run())
    }

    async fn run(self) {
        let telemetry = Arc::new(Telemetry::init(&self.context));
        let route = Arc::new(RwLock::new(Route {
            version: 0,
            shard_count: 0,
            owned: HashSet::new(),
        }));
        let host = Arc::new(RwLock::new(Host::new(
            self.context.with_label("host"),
            self.entity.clone(),
            self.cfg.idle_timeout,
        )));

        // Serve before registering so the advertised address is dialable the
        // moment the manager hands out shards.
        let listener = match self
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
        let accept = {
            let route = route.clone();
            let host = host.clone();
            let telemetry = telemetry.clone();
            self.context
                .with_label("listener")
                .spawn(move |context| listen(context, listener, route, host, telemetry))
        };

        let mut shutdown = self.context.stopped();
        let mut link = Link::new(
            self.context.with_label("manager"),
            self.cfg.manager,
            self.cfg.reconnect_backoff,
        );
        let registration = select! {
            _ = &mut shutdown => {
                accept.abort();
                return;
            },
            registration = link.register(self.cfg.listen) => {
                registration
            },
        };
        let (mut runner_id, shard_count) = registration;
        route.write().await.shard_count = shard_count;
        info!(runner = runner_id, addr = %self.cfg.listen, "registered");

        // First heartbeat immediately: it is what activates the runner.
        let mut beat: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(future::ready(()));
        loop {
            select! {
                _ = &mut shutdown => {
                    // Graceful: stop serving, then give the shards back.
                    accept.abort();
                    link.deregister(runner_id).await;
                    info!(runner = runner_id, "deregistered");
                    return;
                },
                _ = &mut beat => {
                    match link.heartbeat(runner_id).await {
                        Heartbeat::Lease { version, shards } => {
                            apply_lease(&route, &host, &telemetry, version, shards).await;
                        }
                        Heartbeat::Unknown => {
                            // Our record expired; rejoin under a fresh id.
                            warn!(runner = runner_id, "unknown to manager, re-registering");
                            {
                                let mut route = route.write().await;
                                route.owned.clear();
                            }
                            let evicted = host.write().await.retain_shards(|_| false, shard_count);
                            telemetry.evictions.inc_by(evicted as u64);
                            let (id, _) = link.register(self.cfg.listen).await;
                            runner_id = id;
                            info!(runner = runner_id, "re-registered");
                        }
                    }
                    let interval = self.cfg.heartbeat_interval;
                    let context = self.context.clone();
                    beat = Box::pin(async move { context.sleep(interval).await });
                },
            }
        }
    }
}

/// Install a new lease, evicting instances for any shard no longer held.
///
/// The route is updated before instances are torn down so requests for a lost
/// shard start answering NotOwner immediately.
async fn apply_lease<E: Clock + Spawner + Metrics, T: Entity<E>>(
    route: &Arc<RwLock<Route>>,
    host: &Arc<RwLock<Host<E, T>>>,
    telemetry: &Telemetry,
    version: u64,
    shards: Vec<ShardId>,
) {
    let owned: HashSet<ShardId> = shards.into_iter().collect();
    let shard_count = {
        let mut route = route.write().await;
        if version < route.version || (version == route.version && owned == route.owned) {
            return;
        }
        info!(version, shards = owned.len(), "lease updated");
        route.version = version;
        route.owned = owned.clone();
        route.shard_count
    };
    let mut host = host.write().await;
    let evicted = host.retain_shards(|shard| owned.contains(&shard), shard_count);
    telemetry.evictions.inc_by(evicted as u64);
    telemetry.instances.set(host.len() as i64);
}

/// Accept connections and fan each out to its own task.
async fn listen<E: Clock + Spawner + Metrics + Network, T: Entity<E>>(
    context: E,
    mut listener: E::Listener,
    route: Arc<RwLock<Route>>,
    host: Arc<RwLock<Host<E, T>>>,
    telemetry: Arc<Telemetry>,
) {
    loop {
        match listener.accept().await {
            Ok((peer, sink, stream)) => {
                debug!(%peer, "accepted connection");
                let route = route.clone();
                let host = host.clone();
                let telemetry = telemetry.clone();
                context
                    .with_label("connection")
                    .spawn(move |context| serve(context, sink, stream, route, host, telemetry));
            }
            Err(err) => {
                warn!(?err, "failed to accept connection");
            }
        }
    }
}

/// Serve one client connection.
///
/// Requests are handled concurrently (per-id ordering is enforced by the
/// host), so responses may interleave; the request id ties them back.
async fn serve<E: Clock + Spawner + Metrics, T: Entity<E>>(
    context: E,
    sink: SinkOf<E>,
    mut stream: StreamOf<E>,
    route: Arc<RwLock<Route>>,
    host: Arc<RwLock<Host<E, T>>>,
    telemetry: Arc<Telemetry>,
) where
    E: Network,
{
    // Writing lives on its own task so a frame read is never abandoned
    // mid-wait while a response goes out.
    let (response_sender, responses) = mpsc::channel::<RunnerMessage>(CONNECTION_BUFFER);
    context
        .with_label("writer")
        .spawn(move |_| write_loop(sink, responses));
    loop {
        let Ok(data) = recv_frame(&mut stream, MAX_MESSAGE_SIZE).await else { return };
        let message = match RunnerMessage::decode(&data[..]) {
            Ok(message) => message,
            Err(err) => {
                warn!(?err, "failed to decode message");
                return;
            }
        };
        let RunnerMessage::Request {
            request_id,
            entity,
            method,
            payload,
        } = message
        else {
            warn!("unexpected message");
            return;
        };
        telemetry.requests.inc();
        let route = route.clone();
        let host = host.clone();
        let telemetry = telemetry.clone();
        let mut responder = response_sender.clone();
        context.with_label("request").spawn(move |_| async move {
            let outcome = handle_request(route, host, &telemetry, entity, method, payload).await;
            let _ = responder
                .send(RunnerMessage::Response { request_id, outcome })
                .await;
        });
    }
}

/// Drain responses onto the connection until it fails or all senders drop.
async fn write_loop<Si: Sink>(mut sink: Si, mut responses: mpsc::Receiver<RunnerMessage>) {
    while let Some(response) = responses.next().await {
        let data = response.encode().to_vec();
        if send_frame(&mut sink, &data, MAX_MESSAGE_SIZE).await.is_err() {
            return;
        }
    }
}

async fn handle_request<E: Clock + Spawner + Metrics, T: Entity<E>>(
    route: Arc<RwLock<Route>>,
    host: Arc<RwLock<Host<E, T>>>,
    telemetry: &Telemetry,
    entity: EntityId,
    mut method: String,
    mut payload: Vec<u8>,
) -> Outcome {
    let receiver = loop {
        // The ownership check happens under the host lock so a lease change
        // either sees our instance (and evicts it) or made us refuse the
        // request. The lock covers only the map lookup; waiting for a queue
        // slot happens on a clone so a full instance queue never blocks
        // lease application.
        let sender = {
            let mut host = host.write().await;
            if !route.read().await.owns(&entity) {
                telemetry.not_owner.inc();
                debug!(%entity, "not owner");
                return Outcome::NotOwner;
            }
            let sender = host.sender(&entity);
            telemetry.instances.set(host.len() as i64);
            sender
        };
        match host::submit(sender, method, payload).await {
            Ok(receiver) => break receiver,
            // The instance retired before accepting; replace it and retry.
            Err((m, p)) => {
                method = m;
                payload = p;
                host.write().await.prune(&entity);
            }
        }
    };
    match receiver.await {
        Ok(Ok(payload)) => Outcome::Ok(payload),
        Ok(Err(fault)) => Outcome::Fault(fault),
        // The instance was torn down before it could answer.
        Err(_) => Outcome::Fault(Fault::Internal("entity instance dropped".to_string())),
    }
}

/// Persistent request/response connection to the manager.
///
/// One request is outstanding at a time; any transport failure tears the
/// connection down and the next request redials with backoff.
struct Link<E: Clock + Spawner + Metrics + Network> {
    context: E,
    addr: SocketAddr,
    backoff: Duration,
    conn: Option<(SinkOf<E>, StreamOf<E>)>,
    requester: Requester,
}

impl<E: Clock + Spawner + Metrics + Network> Link<E> {
    fn new(context: E, addr: SocketAddr, backoff: Duration) -> Self {
        Self {
            context,
            addr,
            backoff,
            conn: None,
            requester: Requester::new(),
        }
    }

    /// Issue one request, redialing and retrying until a response arrives.
    async fn request(&mut self, build: impl Fn(u64) -> ManagerMessage) -> ManagerMessage {
        loop {
            match self.try_request(&build).await {
                Some(response) => return response,
                None => self.context.sleep(self.backoff).await,
            }
        }
    }

    /// Issue one request over the current connection, if possible.
    async fn try_request(&mut self, build: &impl Fn(u64) -> ManagerMessage) -> Option<ManagerMessage> {
        if self.conn.is_none() {
            match self.context.dial(self.addr).await {
                Ok(conn) => self.conn = Some(conn),
                Err(err) => {
                    warn!(addr = %self.addr, ?err, "failed to dial manager");
                    return None;
                }
            }
        }
        let Some((sink, stream)) = self.conn.as_mut() else {
            return None;
        };
        let request = build(self.requester.next());
        let request_id = request.request_id();
        let data = request.encode().to_vec();
        if let Err(err) = send_frame(sink, &data, MAX_MESSAGE_SIZE).await {
            warn!(?err, "failed to send to manager");
            self.conn = None;
            return None;
        }
        let data = match recv_frame(stream, MAX_MESSAGE_SIZE).await {
            Ok(data) => data,
            Err(err) => {
                warn!(?err, "failed to receive from manager");
                self.conn = None;
                return None;
            }
        };
        match ManagerMessage::decode(&data[..]) {
            Ok(response) if response.request_id() == request_id => Some(response),
            Ok(_) | Err(_) => {
                warn!("unexpected response from manager");
                self.conn = None;
                None
            }
        }
    }

    /// Register, retrying until admitted. Returns the id and shard count.
    async fn register(&mut self, listen: SocketAddr) -> (RunnerId, u32) {
        loop {
            match self
                .request(|request_id| ManagerMessage::Register {
                    request_id,
                    addr: listen,
                })
                .await
            {
                ManagerMessage::Registered {
                    runner,
                    shard_count,
                    ..
                } => return (runner, shard_count),
                other => {
                    warn!(request_id = other.request_id(), "unexpected registration response");
                    self.conn = None;
                    self.context.sleep(self.backoff).await;
                }
            }
        }
    }

    /// Heartbeat, retrying transport failures until the manager answers.
    async fn heartbeat(&mut self, runner: RunnerId) -> Heartbeat {
        loop {
            match self
                .request(|request_id| ManagerMessage::Heartbeat { request_id, runner })
                .await
            {
                ManagerMessage::Lease {
                    version, shards, ..
                } => return Heartbeat::Lease { version, shards },
                ManagerMessage::UnknownRunner { .. } => return Heartbeat::Unknown,
                other => {
                    warn!(request_id = other.request_id(), "unexpected heartbeat response");
                    self.conn = None;
                    self.context.sleep(self.backoff).await;
                }
            }
        }
    }

    /// Best-effort deregistration; a dead manager cannot block shutdown.
    async fn deregister(&mut self, runner: RunnerId) {
        let _ = self
            .try_request(&|request_id| ManagerMessage::Deregister { request_id, runner })
            .await;
    }
}
