//! Entity-hosting runner process.
//!
//! Hosts mathematician entities, exposes a liveness endpoint, and can be armed
//! to crash itself after a delay to exercise shard reassignment.

use axum::{routing::get, Router};
use clap::{Arg, ArgAction, ArgMatches, Command};
use commonware_runtime::{tokio as tokio_runtime, Metrics as _, Runner, Spawner as _};
use herd::{
    client, mathematician,
    runner::{self, crasher, Crasher},
};
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
    let matches = Command::new("runner")
        .about("Hosts mathematician entities for the shards it is assigned")
        .arg(
            Arg::new("manager")
                .long("manager")
                .help("Address of the shard manager")
                .default_value("127.0.0.1:3000"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Address to listen on for entity requests")
                .default_value("127.0.0.1:3100"),
        )
        .arg(
            Arg::new("heartbeat-ms")
                .long("heartbeat-ms")
                .help("Heartbeat interval in milliseconds")
                .default_value("1000"),
        )
        .arg(
            Arg::new("health-port")
                .long("health-port")
                .help("Port for the /healthz endpoint")
                .default_value("8080"),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .help("Port on which metrics are exposed")
                .default_value("9091"),
        )
        .arg(
            Arg::new("crash-after-ms")
                .long("crash-after-ms")
                .help("Crash the runner this many milliseconds after startup"),
        )
        .arg(
            Arg::new("sabotage")
                .long("sabotage")
                .help("Make hosted assistants return wrong results")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let manager: SocketAddr = arg(&matches, "manager");
    let listen: SocketAddr = arg(&matches, "listen");
    let metrics_port: u16 = arg(&matches, "metrics-port");
    let health_port: u16 = arg(&matches, "health-port");
    let heartbeat = Duration::from_millis(arg(&matches, "heartbeat-ms"));
    let crash_after = matches
        .get_one::<String>("crash-after-ms")
        .map(|raw| match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(e) => {
                eprintln!("invalid crash-after-ms: {e}");
                std::process::exit(1);
            }
        });
    let mut math_cfg = mathematician::Config::default();
    if matches.get_flag("sabotage") {
        math_cfg = math_cfg.with_sabotage();
    }

    let executor = tokio_runtime::Runner::new(tokio_runtime::Config::default());
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

        let health_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, health_port));
        context.with_label("health").spawn(move |_| async move {
            let app = Router::new().route("/healthz", get(|| async { "ok" }));
            let listener = match tokio::net::TcpListener::bind(health_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(%err, "failed to bind health endpoint");
                    return;
                }
            };
            if let Err(err) = axum::serve(listener, app).await {
                error!(%err, "health endpoint failed");
            }
        });

        let nested = client::Client::new(
            context.with_label("client"),
            client::Config::new(manager),
        );
        let entity =
            mathematician::Mathematician::new(context.with_label("mathematician"), nested, math_cfg);
        let runner = runner::Runner::new(
            context.with_label("runner"),
            runner::Config::new(manager, listen).with_heartbeat_interval(heartbeat),
            entity,
        );
        let handle = runner.start();
        info!(%listen, %manager, "runner started");

        if let Some(delay) = crash_after {
            let crasher = Crasher::new(
                context.with_label("crasher"),
                crasher::Config {
                    enabled: true,
                    delay,
                    ..crasher::Config::default()
                },
            );
            if let Some(armed) = crasher.start(handle) {
                let _ = armed.await;
                error!("runner crashed");
                std::process::exit(1);
            }
        } else {
            let _ = handle.await;
            info!("runner stopped");
        }
    });
}
