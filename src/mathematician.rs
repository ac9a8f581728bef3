//! Fibonacci entities with double-checker verification.
//!
//! Two entity kinds share one handler. An `assistant` computes the requested
//! value directly. Any other kind acts as a full mathematician: it may refuse
//! an unlucky input, rejects inputs above a ceiling, and then adopts one of two
//! personas drawn from the context's seeded randomness. A double-checker
//! computes locally and cross-checks against a nested call to a fresh assistant
//! entity, failing with a verification mismatch if the two results disagree. A
//! procrastinator stalls before computing, exercising caller timeouts.

use crate::{
    client::Client,
    wire::{read_string, string_encode_size, write_string, Fault},
    Entity, EntityId, Error, Instance,
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    DecodeExt, Encode, EncodeSize, Error as CodecError, Read as CodecRead, Write as CodecWrite,
};
use commonware_runtime::{Clock, Metrics, Network, Spawner};
use prometheus_client::metrics::counter::Counter;
use rand::{Rng, RngCore};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info};

/// Method name understood by every mathematician entity.
pub const METHOD: &str = "calculate_fibonacci";

/// Entity kind that computes directly instead of adopting a persona.
pub const ASSISTANT_KIND: &str = "assistant";

/// Maximum length of the contributor annotation, in bytes.
const MAX_CONTRIBUTORS: usize = 1024;

/// A finished computation and the entities that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Computation {
    pub result: u64,
    /// Contributor annotation, e.g. `mathematician-double-checker-12 and
    /// assistant-double-checker-12`.
    pub mathematician: String,
}

impl CodecWrite for Computation {
    fn write(&self, buf: &mut impl BufMut) {
        self.result.write(buf);
        write_string(&self.mathematician, buf);
    }
}

impl EncodeSize for Computation {
    fn encode_size(&self) -> usize {
        self.result.encode_size() + string_encode_size(&self.mathematician)
    }
}

impl CodecRead for Computation {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let result = u64::read_cfg(buf, &())?;
        let mathematician = read_string(buf, MAX_CONTRIBUTORS, "Computation")?;
        Ok(Self {
            result,
            mathematician,
        })
    }
}

/// Behavior a mathematician adopts for a single request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Compute locally and cross-check against an assistant entity.
    DoubleChecker,
    /// Stall before computing.
    Procrastinator,
}

impl Mode {
    fn label(&self) -> &'static str {
        match self {
            Self::DoubleChecker => "double-checker",
            Self::Procrastinator => "procrastinator",
        }
    }
}

/// Tuning knobs for mathematician behavior.
#[derive(Clone, Debug)]
pub struct Config {
    /// Inputs above this fail with [Fault::InputTooLarge].
    pub ceiling: u64,
    /// Input that may trigger a superstitious refusal.
    pub unlucky_target: u64,
    /// Probability of refusing the unlucky input with [Fault::Transient].
    pub unlucky_probability: f64,
    /// How long a procrastinator stalls before computing.
    pub procrastination: Duration,
    /// Force a specific persona instead of drawing one at random.
    pub mode_override: Option<Mode>,
    /// Make assistants return off-by-one results, forcing mismatches.
    pub sabotage_assistants: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ceiling: 15,
            unlucky_target: 13,
            unlucky_probability: 0.5,
            procrastination: Duration::from_secs(2),
            mode_override: None,
            sabotage_assistants: false,
        }
    }
}

impl Config {
    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_unlucky_probability(mut self, probability: f64) -> Self {
        self.unlucky_probability = probability;
        self
    }

    pub fn with_procrastination(mut self, procrastination: Duration) -> Self {
        self.procrastination = procrastination;
        self
    }

    pub fn with_mode_override(mut self, mode: Mode) -> Self {
        self.mode_override = Some(mode);
        self
    }

    pub fn with_sabotage(mut self) -> Self {
        self.sabotage_assistants = true;
        self
    }
}

struct Telemetry {
    assistant_calls: Counter,
    mismatches: Counter,
}

impl Telemetry {
    fn init(context: &impl Metrics) -> Self {
        let telemetry = Self {
            assistant_calls: Counter::default(),
            mismatches: Counter::default(),
        };
        context.register(
            "assistant_calls",
            "nested verification calls to assistants",
            telemetry.assistant_calls.clone(),
        );
        context.register(
            "mismatches",
            "double-checker verification failures",
            telemetry.mismatches.clone(),
        );
        telemetry
    }
}

/// Factory for mathematician instances.
pub struct Mathematician<E: Clock + Spawner + Metrics + Network + RngCore> {
    client: Client<E>,
    cfg: Config,
    telemetry: Arc<Telemetry>,
}

impl<E: Clock + Spawner + Metrics + Network + RngCore> Mathematician<E> {
    pub fn new(context: E, client: Client<E>, cfg: Config) -> Self {
        let telemetry = Arc::new(Telemetry::init(&context));
        Self {
            client,
            cfg,
            telemetry,
        }
    }
}

impl<E: Clock + Spawner + Metrics + Network + RngCore> Clone for Mathematician<E> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<E: Clock + Spawner + Metrics + Network + RngCore> Entity<E> for Mathematician<E> {
    type Instance = MathInstance<E>;

    fn create(&self, context: E, id: EntityId) -> Self::Instance {
        MathInstance {
            context,
            id,
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Per-id handler state.
pub struct MathInstance<E: Clock + Spawner + Metrics + Network + RngCore> {
    context: E,
    id: EntityId,
    client: Client<E>,
    cfg: Config,
    telemetry: Arc<Telemetry>,
}

impl<E: Clock + Spawner + Metrics + Network + RngCore> MathInstance<E> {
    /// Cross-check against a fresh assistant, preserving fault kinds the caller
    /// cares about and folding everything else into an internal fault.
    async fn verify(&self, assistant: &EntityId, target: u64) -> Result<Computation, Fault> {
        self.telemetry.assistant_calls.inc();
        let response = self
            .client
            .call(assistant, METHOD, target.encode().to_vec())
            .await
            .map_err(|err| match err {
                Error::InputTooLarge => Fault::InputTooLarge,
                Error::Transient => Fault::Transient,
                err => Fault::Internal(format!("assistant call failed: {err}")),
            })?;
        Computation::decode(response.as_slice())
            .map_err(|_| Fault::Internal("malformed assistant response".to_string()))
    }

    async fn calculate(&mut self, target: u64) -> Result<Computation, Fault> {
        if self.id.kind() == ASSISTANT_KIND {
            debug!(id = %self.id, target, "assistant computing");
            let mut result = fib(target);
            if self.cfg.sabotage_assistants {
                result += 1;
            }
            return Ok(Computation {
                result,
                mathematician: self.id.to_string(),
            });
        }

        // Superstition comes before the ceiling so unlucky inputs stay flaky
        // even when the ceiling is lowered beneath them.
        if target == self.cfg.unlucky_target
            && self.context.gen_bool(self.cfg.unlucky_probability)
        {
            debug!(id = %self.id, target, "feeling superstitious");
            return Err(Fault::Transient);
        }
        if target > self.cfg.ceiling {
            return Err(Fault::InputTooLarge);
        }

        let mode = match self.cfg.mode_override {
            Some(mode) => mode,
            None => {
                if self.context.gen_bool(0.5) {
                    Mode::DoubleChecker
                } else {
                    Mode::Procrastinator
                }
            }
        };
        let suffix = format!("{}-{}", mode.label(), self.context.gen_range(0..1000u32));
        let persona = format!("mathematician-{suffix}");

        match mode {
            Mode::DoubleChecker => {
                let assistant = EntityId::new(ASSISTANT_KIND, &suffix);
                let verification = self.verify(&assistant, target).await?;
                let result = fib(target);
                if verification.result != result {
                    self.telemetry.mismatches.inc();
                    error!(
                        id = %self.id,
                        %assistant,
                        ours = result,
                        theirs = verification.result,
                        "verification mismatch"
                    );
                    return Err(Fault::VerificationMismatch);
                }
                debug!(id = %self.id, result, "match checks out");
                Ok(Computation {
                    result,
                    mathematician: format!("{persona} and {}", verification.mathematician),
                })
            }
            Mode::Procrastinator => {
                info!(id = %self.id, "procrastinating");
                self.context.sleep(self.cfg.procrastination).await;
                Ok(Computation {
                    result: fib(target),
                    mathematician: persona,
                })
            }
        }
    }
}

impl<E: Clock + Spawner + Metrics + Network + RngCore> Instance for MathInstance<E> {
    async fn handle(&mut self, method: String, payload: Vec<u8>) -> Result<Vec<u8>, Fault> {
        if method != METHOD {
            return Err(Fault::Internal(format!("unknown method: {method}")));
        }
        let target = u64::decode(payload.as_slice())
            .map_err(|_| Fault::Internal("malformed request".to_string()))?;
        let computation = self.calculate(target).await?;
        Ok(computation.encode().to_vec())
    }
}

/// Typed wrapper over [Client] for the mathematician protocol.
pub struct Caller<E: Clock + Spawner + Metrics + Network> {
    client: Client<E>,
}

impl<E: Clock + Spawner + Metrics + Network> Caller<E> {
    pub fn new(client: Client<E>) -> Self {
        Self { client }
    }

    /// Ask `entity` for the `target`-th Fibonacci number.
    pub async fn calculate_fibonacci(
        &self,
        entity: &EntityId,
        target: u64,
    ) -> Result<Computation, Error> {
        let response = self
            .client
            .call(entity, METHOD, target.encode().to_vec())
            .await?;
        Computation::decode(response.as_slice())
            .map_err(|err| Error::Unavailable(format!("malformed response: {err}")))
    }
}

/// Classic doubling recursion. Deterministic for a given input, which the
/// double-checker comparison depends on.
fn fib(n: u64) -> u64 {
    if n <= 1 {
        return n;
    }
    fib(n - 1) + fib(n - 2)
}
