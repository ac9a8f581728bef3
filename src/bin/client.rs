//! Fires a batch of concurrent Fibonacci requests at the cluster and tallies
//! the outcomes.

use clap::{Arg, ArgMatches, Command};
use commonware_runtime::{tokio as tokio_runtime, Metrics as _, Runner, Spawner as _};
use herd::{client, mathematician, EntityId};
use rand::Rng;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

fn arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> T
where
    T::Err: std::fmt::Display,
{
    matches
        .get_one::<String>(name)
        .unwrap()
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("invalid {name}: {e}");
            std::process::exit(1);
        })
}

fn main() {
    let matches = Command::new("client")
        .about("Requests Fibonacci numbers from mathematician entities")
        .arg(
            Arg::new("manager")
                .long("manager")
                .help("Address of the shard manager")
                .default_value("127.0.0.1:3000"),
        )
        .arg(
            Arg::new("requests")
                .long("requests")
                .help("Number of concurrent requests to issue")
                .default_value("10"),
        )
        .arg(
            Arg::new("max-target")
                .long("max-target")
                .help("Targets are drawn uniformly from 1..=max-target")
                .default_value("14"),
        )
        .arg(
            Arg::new("attempts")
                .long("attempts")
                .help("Attempts per request before giving up")
                .default_value("8"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .help("Per-attempt timeout in milliseconds")
                .default_value("5000"),
        )
        .get_matches();

    let manager: SocketAddr = arg(&matches, "manager");
    let requests: usize = arg(&matches, "requests");
    let max_target: u64 = arg(&matches, "max-target");
    let retry = client::RetryPolicy {
        max_attempts: arg(&matches, "attempts"),
        timeout: Duration::from_millis(arg(&matches, "timeout-ms")),
        ..client::RetryPolicy::default()
    };

    let executor = tokio_runtime::Runner::new(tokio_runtime::Config::default());
    executor.start(|mut context| async move {
        tokio_runtime::telemetry::init(
            context.with_label("telemetry"),
            tokio_runtime::telemetry::Logging {
                level: tracing::Level::INFO,
                json: false,
            },
            None,
            None,
        );

        let client = client::Client::new(
            context.with_label("client"),
            client::Config::new(manager).with_retry(retry),
        );
        let math = Arc::new(mathematician::Caller::new(client));

        let mut calls = Vec::with_capacity(requests);
        for _ in 0..requests {
            let math = math.clone();
            let target = context.gen_range(1..=max_target);
            let id = EntityId::new("mathematician", &context.gen_range(0..1000u32).to_string());
            calls.push(context.with_label("call").spawn(move |_| async move {
                (id.clone(), target, math.calculate_fibonacci(&id, target).await)
            }));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for call in calls {
            match call.await {
                Ok((id, target, Ok(answer))) => {
                    succeeded += 1;
                    info!(
                        %id,
                        target,
                        result = answer.result,
                        mathematician = %answer.mathematician,
                        "answer"
                    );
                }
                Ok((id, target, Err(err))) => {
                    failed += 1;
                    warn!(%id, target, %err, "request failed");
                }
                Err(err) => {
                    failed += 1;
                    warn!(%err, "request task failed");
                }
            }
        }
        info!(succeeded, failed, "done");
        if failed > 0 {
            std::process::exit(1);
        }
    });
}
