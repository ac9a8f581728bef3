//! Chaos task that kills a runner after a configured delay.
//!
//! Aborting the runner's handle takes down its listener, connections, and
//! entity instances without any cleanup, exactly like a process crash: the
//! runner never deregisters, so the manager only notices once heartbeats stop
//! arriving.

use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for [Crasher].
#[derive(Clone, Debug)]
pub struct Config {
    /// Whether to crash at all.
    pub enabled: bool,

    /// How long to let the victim live.
    pub delay: Duration,

    /// Cadence of "still alive" log lines before the crash.
    pub probe_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_secs(30),
            probe_interval: Duration::from_secs(5),
        }
    }
}

/// Kills a task after a delay.
pub struct Crasher<E: Clock + Spawner + Metrics> {
    context: E,
    cfg: Config,
}

impl<E: Clock + Spawner + Metrics> Crasher<E> {
    pub fn new(context: E, cfg: Config) -> Self {
        Self { context, cfg }
    }

    /// Arm the crasher against `victim`.
    ///
    /// Returns None when disabled; the victim is then never touched.
    pub fn start(self, victim: Handle<()>) -> Option<Handle<()>> {
        if !self.cfg.enabled {
            return None;
        }
        let mut context = self.context;
        let cfg = self.cfg;
        Some(context.spawn_ref()(async move {
            let deadline = context.current() + cfg.delay;
            loop {
                select! {
                    _ = context.sleep_until(deadline) => {
                        warn!("crashing runner");
                        victim.abort();
                        return;
                    },
                    _ = context.sleep(cfg.probe_interval) => {
                        info!("still alive");
                    },
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics as _, Runner as _, Spawner as _};

    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test_traced]
    fn test_crashes_after_delay() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let finished = Arc::new(AtomicBool::new(false));
            let flag = finished.clone();
            let victim = context.with_label("victim").spawn(move |context| async move {
                context.sleep(Duration::from_secs(1)).await;
                flag.store(true, Ordering::Relaxed);
            });
            let crasher = Crasher::new(
                context.with_label("crasher"),
                Config {
                    enabled: true,
                    delay: Duration::from_millis(100),
                    probe_interval: Duration::from_millis(25),
                },
            );
            let armed = crasher.start(victim).unwrap();
            armed.await.unwrap();

            // Well past the victim's finish line: it never got there.
            context.sleep(Duration::from_secs(5)).await;
            assert!(!finished.load(Ordering::Relaxed));
        });
    }

    #[test_traced]
    fn test_disabled_never_crashes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let victim = context.with_label("victim").spawn(|context| async move {
                context.sleep(Duration::from_millis(200)).await;
            });
            let crasher = Crasher::new(context.with_label("crasher"), Config::default());
            assert!(crasher.start(victim).is_none());
        });
    }
}
