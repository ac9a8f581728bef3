//! Shard manager process.

use clap::{Arg, ArgMatches, Command};
use commonware_runtime::{tokio as tokio_runtime, Metrics as _, Runner};
use herd::manager;
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tracing::{error, info};

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
    let matches = Command::new("manager")
        .about("Assigns entity shards to live runners")
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Address to listen on for runners and clients")
                .default_value("127.0.0.1:3000"),
        )
        .arg(
            Arg::new("shard-count")
                .long("shard-count")
                .help("Number of shards the entity id-space is split into")
                .default_value("64"),
        )
        .arg(
            Arg::new("heartbeat-ms")
                .long("heartbeat-ms")
                .help("Expected runner heartbeat interval in milliseconds")
                .default_value("1000"),
        )
        .arg(
            Arg::new("miss-threshold")
                .long("miss-threshold")
                .help("Missed heartbeats before a runner's shards are reassigned")
                .default_value("3"),
        )
        .arg(
            Arg::new("removal-grace-ms")
                .long("removal-grace-ms")
                .help("How long an unresponsive runner is remembered, in milliseconds")
                .default_value("5000"),
        )
        .arg(
            Arg::new("storage-dir")
                .long("storage-dir")
                .help("Directory for durable state")
                .default_value("/tmp/herd/manager"),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .help("Port on which metrics are exposed")
                .default_value("9090"),
        )
        .get_matches();

    let listen: SocketAddr = arg(&matches, "listen");
    let metrics_port: u16 = arg(&matches, "metrics-port");
    let storage_dir: String = arg(&matches, "storage-dir");
    let cfg = manager::Config::new(listen)
        .with_shard_count(arg(&matches, "shard-count"))
        .with_heartbeat_interval(Duration::from_millis(arg(&matches, "heartbeat-ms")))
        .with_miss_threshold(arg(&matches, "miss-threshold"))
        .with_removal_grace(Duration::from_millis(arg(&matches, "removal-grace-ms")));

    let executor_cfg = tokio_runtime::Config::default().with_storage_directory(storage_dir);
    let executor = tokio_runtime::Runner::new(executor_cfg);
    executor.start(|context| async move {
        tokio_runtime::telemetry::init(
            context.with_label("telemetry"),
            tokio_runtime::telemetry::Logging {
                level: tracing::Level::INFO,
                json: false,
            },
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, metrics_port))),
            None,
        );

        let actor = match manager::Actor::init(context.with_label("manager"), cfg).await {
            Ok(actor) => actor,
            Err(err) => {
                error!(%err, "failed to initialize manager");
                std::process::exit(1);
            }
        };
        let (handle, _mailbox) = actor.start();
        info!(%listen, "manager started");
        let _ = handle.await;
        info!("manager stopped");
    });
}
