//! Request generator
//!
//! Produces service requests at an interarrival schedule derived from a
//! [`WorkloadSpec`]. The generator is pausable (no workload set), closeable,
//! and restartable: a finite workload emits its requests, then exactly one
//! [`Generated::Done`] marker, then the generator parks until the next
//! workload arrives.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::distr::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Exp, Gamma, LogNormal, Normal, Pareto, Triangular, Weibull};
use tracing::debug;

use crate::error::{GalileoError, Result};
use crate::routing::ServiceRequest;
use crate::worker::api::WorkloadSpec;

/// What the client consumes from its generator.
#[derive(Debug)]
pub enum Generated {
    Request(ServiceRequest),
    /// A finite workload ran to completion.
    Done,
}

/// Builds the next request once its interarrival time has elapsed.
pub trait RequestFactory: Send {
    fn create(&mut self) -> ServiceRequest;
}

impl<F: FnMut() -> ServiceRequest + Send> RequestFactory for F {
    fn create(&mut self) -> ServiceRequest {
        self()
    }
}

enum Sampler {
    Constant(f64),
    Uniform(Uniform<f64>),
    Exponential(Exp<f64>),
    Normal(Normal<f64>),
    LogNormal(LogNormal<f64>),
    Triangular(Triangular<f64>),
    VonMises { mu: f64, kappa: f64 },
    Gamma(Gamma<f64>),
    Beta(Beta<f64>),
    Pareto(Pareto<f64>),
    Weibull(Weibull<f64>),
}

fn invalid(distribution: &str, detail: impl std::fmt::Display) -> GalileoError {
    GalileoError::InvalidArgument(format!("invalid distribution '{distribution}': {detail}"))
}

fn args<const N: usize>(distribution: &str, parameters: &[f64]) -> Result<[f64; N]> {
    parameters
        .try_into()
        .map_err(|_| invalid(distribution, format_args!("expected {N} parameters, got {}", parameters.len())))
}

impl Sampler {
    fn new(distribution: &str, parameters: &[f64]) -> Result<Self> {
        let sampler = match distribution {
            "constant" => {
                let [value] = args(distribution, parameters)?;
                Sampler::Constant(value)
            }
            "uniform" => {
                let [low, high] = args(distribution, parameters)?;
                Sampler::Uniform(
                    Uniform::new(low, high).map_err(|e| invalid(distribution, e))?,
                )
            }
            "expovariate" => {
                let [lambda] = args(distribution, parameters)?;
                Sampler::Exponential(Exp::new(lambda).map_err(|e| invalid(distribution, e))?)
            }
            "normalvariate" | "gauss" => {
                let [mu, sigma] = args(distribution, parameters)?;
                Sampler::Normal(Normal::new(mu, sigma).map_err(|e| invalid(distribution, e))?)
            }
            "lognormvariate" => {
                let [mu, sigma] = args(distribution, parameters)?;
                Sampler::LogNormal(
                    LogNormal::new(mu, sigma).map_err(|e| invalid(distribution, e))?,
                )
            }
            "triangular" => {
                let [low, high, mode] = args(distribution, parameters)?;
                Sampler::Triangular(
                    Triangular::new(low, high, mode).map_err(|e| invalid(distribution, e))?,
                )
            }
            "vonmisesvariate" => {
                let [mu, kappa] = args(distribution, parameters)?;
                if kappa < 0.0 {
                    return Err(invalid(distribution, "kappa must be non-negative"));
                }
                Sampler::VonMises { mu, kappa }
            }
            "gammavariate" => {
                let [alpha, beta] = args(distribution, parameters)?;
                Sampler::Gamma(Gamma::new(alpha, beta).map_err(|e| invalid(distribution, e))?)
            }
            "betavariate" => {
                let [alpha, beta] = args(distribution, parameters)?;
                Sampler::Beta(Beta::new(alpha, beta).map_err(|e| invalid(distribution, e))?)
            }
            "paretovariate" => {
                let [alpha] = args(distribution, parameters)?;
                Sampler::Pareto(Pareto::new(1.0, alpha).map_err(|e| invalid(distribution, e))?)
            }
            "weibullvariate" => {
                let [alpha, beta] = args(distribution, parameters)?;
                Sampler::Weibull(
                    Weibull::new(alpha, beta).map_err(|e| invalid(distribution, e))?,
                )
            }
            other => {
                return Err(GalileoError::InvalidArgument(format!(
                    "unknown distribution '{other}'"
                )));
            }
        };
        Ok(sampler)
    }

    fn sample(&self, rng: &mut SmallRng) -> f64 {
        match self {
            Sampler::Constant(value) => *value,
            Sampler::Uniform(d) => d.sample(rng),
            Sampler::Exponential(d) => d.sample(rng),
            Sampler::Normal(d) => d.sample(rng),
            Sampler::LogNormal(d) => d.sample(rng),
            Sampler::Triangular(d) => d.sample(rng),
            Sampler::VonMises { mu, kappa } => vonmises(rng, *mu, *kappa),
            Sampler::Gamma(d) => d.sample(rng),
            Sampler::Beta(d) => d.sample(rng),
            Sampler::Pareto(d) => d.sample(rng),
            Sampler::Weibull(d) => d.sample(rng),
        }
    }
}

/// Von Mises sampling after Best & Fisher, as used for circular interarrival
/// patterns; degenerates to a uniform angle for tiny kappa.
fn vonmises(rng: &mut SmallRng, mu: f64, kappa: f64) -> f64 {
    use std::f64::consts::{PI, TAU};

    if kappa <= 1e-6 {
        return TAU * rng.random::<f64>();
    }

    let s = 0.5 / kappa;
    let r = s + (1.0 + s * s).sqrt();

    let z = loop {
        let u1: f64 = rng.random();
        let z = (PI * u1).cos();
        let d = z / (r + z);
        let u2: f64 = rng.random();
        if u2 < 1.0 - d * d || u2 <= (1.0 - d) * d.exp() {
            break z;
        }
    };

    let q = 1.0 / r;
    let f = (q + z) / (1.0 + q * z);
    let u3: f64 = rng.random();
    let theta = if u3 > 0.5 { mu + f.acos() } else { mu - f.acos() };
    theta.rem_euclid(TAU)
}

struct Interarrival {
    sampler: Sampler,
    remaining: Option<u64>,
    rng: SmallRng,
}

impl Interarrival {
    fn new(spec: &WorkloadSpec) -> Result<Self> {
        Ok(Self {
            sampler: Sampler::new(&spec.distribution, &spec.parameters)?,
            remaining: spec.num,
            rng: SmallRng::from_os_rng(),
        })
    }

    /// `None` marks the end of a finite workload.
    fn next(&mut self) -> Option<f64> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        Some(self.sampler.sample(&mut self.rng))
    }
}

struct GeneratorState {
    iter: Option<Interarrival>,
    closed: bool,
}

enum Step {
    Sleep(f64),
    Done,
    Park,
}

/// Produces requests on the schedule of the current workload.
///
/// `next()` blocks while no workload is set; `set_workload` wakes it. One
/// instance is owned by exactly one client.
pub struct RequestGenerator {
    factory: Mutex<Box<dyn RequestFactory>>,
    state: Mutex<GeneratorState>,
    wakeup: tokio::sync::Notify,
    counter: AtomicU64,
}

impl RequestGenerator {
    pub fn new(factory: Box<dyn RequestFactory>) -> Self {
        Self {
            factory: Mutex::new(factory),
            state: Mutex::new(GeneratorState {
                iter: None,
                closed: false,
            }),
            wakeup: tokio::sync::Notify::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Installs a new workload, replacing any current one.
    pub fn set_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let iter = Interarrival::new(spec)?;
        let mut state = self.state.lock().expect("generator lock poisoned");
        if state.closed {
            return Ok(());
        }
        debug!(distribution = %spec.distribution, num = ?spec.num, "workload set");
        state.iter = Some(iter);
        drop(state);
        self.wakeup.notify_waiters();
        Ok(())
    }

    /// Clears the current workload; `next()` parks until a new one is set.
    pub fn pause(&self) {
        let mut state = self.state.lock().expect("generator lock poisoned");
        state.iter = None;
        drop(state);
        self.wakeup.notify_waiters();
    }

    /// Closes the generator for good; parked and future `next()` calls
    /// return `None`.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("generator lock poisoned");
        state.closed = true;
        drop(state);
        self.wakeup.notify_waiters();
    }

    /// Total number of requests generated.
    pub fn total(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// The next generated item, or `None` once closed.
    pub async fn next(&self) -> Option<Generated> {
        loop {
            let mut parked = std::pin::pin!(self.wakeup.notified());
            parked.as_mut().enable();

            let step = {
                let mut state = self.state.lock().expect("generator lock poisoned");
                if state.closed {
                    return None;
                }
                match &mut state.iter {
                    Some(iter) => match iter.next() {
                        Some(interarrival) => Step::Sleep(interarrival),
                        None => {
                            state.iter = None;
                            Step::Done
                        }
                    },
                    None => Step::Park,
                }
            };

            match step {
                Step::Sleep(interarrival) => {
                    if interarrival > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(interarrival)).await;
                    }
                    if self.state.lock().expect("generator lock poisoned").closed {
                        return None;
                    }
                    let request = self
                        .factory
                        .lock()
                        .expect("factory lock poisoned")
                        .create();
                    self.counter.fetch_add(1, Ordering::Relaxed);
                    return Some(Generated::Request(request));
                }
                Step::Done => return Some(Generated::Done),
                Step::Park => parked.await,
            }
        }
    }
}
