//! Whole-cluster tests over the deterministic runtime.

use crate::{
    client::{Client, Config as ClientConfig, RetryPolicy},
    manager,
    mathematician::{self, Caller, Mode},
    runner,
    wire::Fault,
    Entity, EntityId, Error, Instance,
};
use commonware_macros::test_traced;
use commonware_runtime::{deterministic, Clock, Handle, Metrics, Runner as _, Spawner as _};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Start a manager and a fleet of runners hosting `entity`, then wait for the
/// first leases to land.
async fn launch<T: Entity<deterministic::Context>>(
    context: &deterministic::Context,
    manager_cfg: manager::Config,
    runner_cfgs: &[runner::Config],
    entity: T,
) -> Vec<Handle<()>> {
    let actor = manager::Actor::init(context.with_label("manager"), manager_cfg)
        .await
        .unwrap();
    let (handle, _mailbox) = actor.start();
    let mut handles = vec![handle];
    for (i, cfg) in runner_cfgs.iter().enumerate() {
        let runner = runner::Runner::new(
            context.with_label(&format!("runner{i}")),
            cfg.clone(),
            entity.clone(),
        );
        handles.push(runner.start());
    }
    context.sleep(Duration::from_millis(500)).await;
    handles
}

fn math_caller(
    context: &deterministic::Context,
    manager_addr: SocketAddr,
    retry: RetryPolicy,
) -> Caller<deterministic::Context> {
    Caller::new(Client::new(
        context.with_label("client"),
        ClientConfig::new(manager_addr).with_retry(retry),
    ))
}

#[test_traced]
fn test_double_checker_end_to_end() {
    let executor = deterministic::Runner::seeded(42);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let nested = Client::new(
            context.with_label("nested"),
            ClientConfig::new(manager_addr),
        );
        let entity = mathematician::Mathematician::new(
            context.with_label("math"),
            nested,
            mathematician::Config::default()
                .with_unlucky_probability(0.0)
                .with_mode_override(Mode::DoubleChecker),
        );
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let math = math_caller(&context, manager_addr, RetryPolicy::default());
        let answer = math
            .calculate_fibonacci(&EntityId::new("node", "1"), 10)
            .await
            .unwrap();
        assert_eq!(answer.result, 55);
        let (primary, assistant) = answer.mathematician.split_once(" and ").unwrap();
        assert!(primary.starts_with("mathematician-double-checker-"));
        assert!(assistant.starts_with("assistant-double-checker-"));
    });
}

#[test_traced]
fn test_input_too_large_not_retried() {
    let executor = deterministic::Runner::seeded(43);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let nested = Client::new(
            context.with_label("nested"),
            ClientConfig::new(manager_addr),
        );
        let entity = mathematician::Mathematician::new(
            context.with_label("math"),
            nested,
            mathematician::Config::default()
                .with_unlucky_probability(0.0)
                .with_mode_override(Mode::DoubleChecker),
        );
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let math = math_caller(&context, manager_addr, RetryPolicy::default());
        let result = math
            .calculate_fibonacci(&EntityId::new("node", "big"), 20)
            .await;
        assert!(matches!(result, Err(Error::InputTooLarge)));

        // One attempt, no nested verification.
        let buffer = context.encode();
        assert!(buffer.contains("client_attempts_total 1"));
        assert!(buffer.contains("math_assistant_calls_total 0"));
    });
}

#[test_traced]
fn test_sabotaged_assistant_fails_verification() {
    let executor = deterministic::Runner::seeded(44);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let nested = Client::new(
            context.with_label("nested"),
            ClientConfig::new(manager_addr),
        );
        let entity = mathematician::Mathematician::new(
            context.with_label("math"),
            nested,
            mathematician::Config::default()
                .with_unlucky_probability(0.0)
                .with_mode_override(Mode::DoubleChecker)
                .with_sabotage(),
        );
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let math = math_caller(&context, manager_addr, RetryPolicy::default());
        let result = math
            .calculate_fibonacci(&EntityId::new("node", "1"), 10)
            .await;
        assert!(matches!(result, Err(Error::VerificationMismatch)));

        let buffer = context.encode();
        assert!(buffer.contains("math_mismatches_total 1"));
        assert!(buffer.contains("client_attempts_total 1"));
    });
}

#[test_traced]
fn test_procrastinator_times_out() {
    let executor = deterministic::Runner::seeded(45);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let nested = Client::new(
            context.with_label("nested"),
            ClientConfig::new(manager_addr),
        );
        let entity = mathematician::Mathematician::new(
            context.with_label("math"),
            nested,
            mathematician::Config::default()
                .with_unlucky_probability(0.0)
                .with_mode_override(Mode::Procrastinator)
                .with_procrastination(Duration::from_secs(2)),
        );
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let math = math_caller(
            &context,
            manager_addr,
            RetryPolicy {
                max_attempts: 2,
                timeout: Duration::from_millis(500),
                backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(50),
            },
        );
        let result = math
            .calculate_fibonacci(&EntityId::new("node", "1"), 10)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        let buffer = context.encode();
        assert!(buffer.contains("client_timeouts_total 2"));
    });
}

/// Fails with a transient fault a fixed number of times, then echoes.
#[derive(Clone)]
struct Flaky {
    failures: Arc<AtomicU32>,
}

struct FlakyInstance {
    failures: Arc<AtomicU32>,
}

impl<E> Entity<E> for Flaky {
    type Instance = FlakyInstance;

    fn create(&self, _: E, _: EntityId) -> Self::Instance {
        FlakyInstance {
            failures: self.failures.clone(),
        }
    }
}

impl Instance for FlakyInstance {
    async fn handle(&mut self, _: String, payload: Vec<u8>) -> Result<Vec<u8>, Fault> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Fault::Transient);
        }
        Ok(payload)
    }
}

#[test_traced]
fn test_transient_fault_retried_to_success() {
    let executor = deterministic::Runner::seeded(46);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let entity = Flaky {
            failures: Arc::new(AtomicU32::new(1)),
        };
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let client = Client::new(
            context.with_label("client"),
            ClientConfig::new(manager_addr),
        );
        let response = client
            .call(&EntityId::new("node", "1"), "echo", vec![7])
            .await
            .unwrap();
        assert_eq!(response, vec![7]);

        let buffer = context.encode();
        assert!(buffer.contains("client_retries_total 1"));
    });
}

/// Sleeps through its first invocation, then answers immediately.
#[derive(Clone)]
struct SlowOnce {
    delay: Duration,
    slept: Arc<AtomicBool>,
}

struct SlowOnceInstance<E: Clock> {
    context: E,
    delay: Duration,
    slept: Arc<AtomicBool>,
}

impl<E: Clock> Entity<E> for SlowOnce {
    type Instance = SlowOnceInstance<E>;

    fn create(&self, context: E, _: EntityId) -> Self::Instance {
        SlowOnceInstance {
            context,
            delay: self.delay,
            slept: self.slept.clone(),
        }
    }
}

impl<E: Clock> Instance for SlowOnceInstance<E> {
    async fn handle(&mut self, _: String, payload: Vec<u8>) -> Result<Vec<u8>, Fault> {
        if !self.slept.swap(true, Ordering::SeqCst) {
            self.context.sleep(self.delay).await;
        }
        Ok(payload)
    }
}

#[test_traced]
fn test_slow_first_attempt_retried_to_success() {
    let executor = deterministic::Runner::seeded(49);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let entity = SlowOnce {
            delay: Duration::from_secs(2),
            slept: Arc::new(AtomicBool::new(false)),
        };
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let client = Client::new(
            context.with_label("client"),
            ClientConfig::new(manager_addr).with_retry(RetryPolicy {
                max_attempts: 3,
                timeout: Duration::from_millis(1500),
                backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(100),
            }),
        );

        // The first attempt times out while the entity dawdles; the retry
        // queues behind it and succeeds once the backlog drains.
        let response = client
            .call(&EntityId::new("node", "1"), "echo", vec![9])
            .await
            .unwrap();
        assert_eq!(response, vec![9]);

        let buffer = context.encode();
        assert!(buffer.contains("client_timeouts_total 1"));
        assert!(buffer.contains("client_retries_total 1"));
        assert!(buffer.contains("client_attempts_total 2"));
    });
}

/// Flags any overlapping invocations for the same entity id.
#[derive(Clone)]
struct Overlap {
    active: Arc<AtomicU32>,
    overlapped: Arc<AtomicBool>,
}

struct OverlapInstance<E: Clock> {
    context: E,
    active: Arc<AtomicU32>,
    overlapped: Arc<AtomicBool>,
}

impl<E: Clock> Entity<E> for Overlap {
    type Instance = OverlapInstance<E>;

    fn create(&self, context: E, _: EntityId) -> Self::Instance {
        OverlapInstance {
            context,
            active: self.active.clone(),
            overlapped: self.overlapped.clone(),
        }
    }
}

impl<E: Clock> Instance for OverlapInstance<E> {
    async fn handle(&mut self, _: String, payload: Vec<u8>) -> Result<Vec<u8>, Fault> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.context.sleep(Duration::from_millis(100)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(payload)
    }
}

#[test_traced]
fn test_requests_serialized_per_entity() {
    let executor = deterministic::Runner::seeded(47);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let overlapped = Arc::new(AtomicBool::new(false));
        let entity = Overlap {
            active: Arc::new(AtomicU32::new(0)),
            overlapped: overlapped.clone(),
        };
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let client = Client::new(
            context.with_label("client"),
            ClientConfig::new(manager_addr),
        );
        let id = EntityId::new("node", "1");
        let first = {
            let client = client.clone();
            let id = id.clone();
            context
                .with_label("first")
                .spawn(move |_| async move { client.call(&id, "echo", vec![1]).await })
        };
        let second = {
            let client = client.clone();
            let id = id.clone();
            context
                .with_label("second")
                .spawn(move |_| async move { client.call(&id, "echo", vec![2]).await })
        };
        assert_eq!(first.await.unwrap().unwrap(), vec![1]);
        assert_eq!(second.await.unwrap().unwrap(), vec![2]);
        assert!(!overlapped.load(Ordering::SeqCst));
    });
}

#[test_traced]
fn test_crashed_runner_shards_reassigned() {
    let executor = deterministic::Runner::seeded(48);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let entity = Flaky {
            failures: Arc::new(AtomicU32::new(0)),
        };
        let manager_cfg = manager::Config::new(manager_addr)
            .with_shard_count(8)
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_miss_threshold(2)
            .with_removal_grace(Duration::from_millis(500));
        let runner_cfgs = [
            runner::Config::new(manager_addr, addr(4100))
                .with_heartbeat_interval(Duration::from_millis(100)),
            runner::Config::new(manager_addr, addr(4101))
                .with_heartbeat_interval(Duration::from_millis(100)),
        ];
        let handles = launch(&context, manager_cfg, &runner_cfgs, entity).await;

        let client = Client::new(
            context.with_label("client"),
            ClientConfig::new(manager_addr),
        );
        for i in 1..=10u32 {
            let id = EntityId::new("node", &i.to_string());
            assert!(client.call(&id, "echo", vec![0]).await.is_ok());
        }

        // Kill the second runner; its shards move to the survivor once the
        // manager's sweep notices the missing heartbeats.
        handles[2].abort();
        context.sleep(Duration::from_secs(1)).await;
        for i in 1..=10u32 {
            let id = EntityId::new("node", &i.to_string());
            assert!(client.call(&id, "echo", vec![0]).await.is_ok());
        }

        let buffer = context.encode();
        assert!(buffer.contains("manager_removals_total 1"));
    });
}

fn fibonacci_scenario(seed: u64) -> String {
    let executor = deterministic::Runner::seeded(seed);
    executor.start(|context| async move {
        let manager_addr = addr(4000);
        let nested = Client::new(
            context.with_label("nested"),
            ClientConfig::new(manager_addr),
        );
        let entity = mathematician::Mathematician::new(
            context.with_label("math"),
            nested,
            mathematician::Config::default().with_unlucky_probability(0.0),
        );
        let _cluster = launch(
            &context,
            manager::Config::new(manager_addr),
            &[runner::Config::new(manager_addr, addr(4100))],
            entity,
        )
        .await;

        let math = math_caller(&context, manager_addr, RetryPolicy::default());
        let answer = math
            .calculate_fibonacci(&EntityId::new("node", "1"), 10)
            .await
            .unwrap();
        assert_eq!(answer.result, 55);
        answer.mathematician
    })
}

#[test_traced]
fn test_identical_seeds_identical_personas() {
    assert_eq!(fibonacci_scenario(9), fibonacci_scenario(9));
}
