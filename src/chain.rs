use std::{
    cell::{Cell, RefCell},
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use log::info;

use crate::{
    aggregation::{Aggregator, Histogram, Marginal, MaxAPosteriori},
    context::{Context, HandlerKind},
    error::InferenceError,
    kernel::{repeat, sequence, tap, Kernel, KernelConfig},
    program::{check_factor, Program, Step},
    trace::{AcceptanceInfo, Trace},
    value::{Address, Store, Value},
};

/// Settings for an MCMC run.
#[derive(Debug, Clone, PartialEq)]
pub struct McmcSettings {
    /// The number of values collected after burn-in.
    pub samples: usize,
    /// The number of transitions discarded before collecting.
    pub burn: usize,
    /// Extra transitions between two collected values.
    pub lag: usize,
    /// Stop collecting once this much time has passed.
    pub max_time: Option<Duration>,
    pub kernel: KernelConfig,
    /// Kernel for the burn-in phase. Defaults to `kernel`.
    pub burn_kernel: Option<KernelConfig>,
    /// Only report the highest scoring value.
    pub only_map: bool,
    /// Keep every collected value instead of a histogram.
    pub just_sample: bool,
    /// Report progress through the `log` facade.
    pub verbose: bool,
    pub max_init_attempts: usize,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            samples: 100,
            burn: 0,
            lag: 0,
            max_time: None,
            kernel: KernelConfig::default(),
            burn_kernel: None,
            only_map: false,
            just_sample: false,
            verbose: false,
            max_init_attempts: 10_000,
        }
    }
}

impl McmcSettings {
    /// Total number of kernel transitions of a full run.
    pub fn num_iters(&self) -> usize {
        self.burn + (self.lag + 1) * self.samples
    }
}

/// Observes a chain as it runs.
pub trait ChainCallback {
    fn setup(&mut self, _num_iters: usize) {}

    /// Called after every transition, burn-in included.
    fn iteration(&mut self, _trace: &Trace, _iteration: usize) {}

    fn finish(&mut self, _trace: &Trace, _last_iteration: usize) {}
}

/// Logs the acceptance ratio every `every` iterations.
#[derive(Debug, Clone)]
pub struct ProgressLogger {
    pub every: usize,
    num_iters: usize,
}

impl Default for ProgressLogger {
    fn default() -> Self {
        ProgressLogger {
            every: 100,
            num_iters: 0,
        }
    }
}

fn acceptance_ratio(trace: &Trace) -> f64 {
    trace.info.map_or(0., |info| info.ratio())
}

impl ChainCallback for ProgressLogger {
    fn setup(&mut self, num_iters: usize) {
        self.num_iters = num_iters;
    }

    fn iteration(&mut self, trace: &Trace, iteration: usize) {
        if iteration % self.every.max(1) == 0 {
            info!(
                "Iteration: {iteration}/{} | Acceptance ratio: {:.4}",
                self.num_iters,
                acceptance_ratio(trace)
            );
        }
    }

    fn finish(&mut self, trace: &Trace, last_iteration: usize) {
        info!(
            "Finished after iteration {last_iteration} | Acceptance ratio: {:.4}",
            acceptance_ratio(trace)
        );
    }
}

/// Run the program forward from its prior until it produces a complete
/// trace with non-zero probability.
pub fn initialize(
    ctx: &mut Context,
    program: &Program,
    store: Store,
    address: Address,
    max_attempts: usize,
) -> crate::error::Result<Trace> {
    ctx.with_handler(HandlerKind::Initialize, |ctx, handler| {
        'attempt: for _ in 0..max_attempts {
            let mut trace = Trace::new(program.clone(), store.clone(), address.clone());
            let mut step = trace.continue_()?;
            loop {
                ctx.handlers().ensure_active(handler)?;
                step = match step {
                    Step::Sample {
                        store,
                        k,
                        address,
                        dist,
                        params,
                    } => {
                        let value = dist.sample(ctx.rng(), &params);
                        trace.add_choice(dist, params, value.clone(), address, store.clone(), k.clone());
                        if trace.score == f64::NEG_INFINITY {
                            continue 'attempt;
                        }
                        k(store, value)
                    }
                    Step::Factor {
                        store,
                        k,
                        address,
                        score,
                    } => {
                        check_factor(&address, score)?;
                        trace.add_factor(score);
                        if trace.score == f64::NEG_INFINITY {
                            continue 'attempt;
                        }
                        k(store, Value::Unit)
                    }
                    Step::Exit { value, .. } => {
                        trace.complete(value)?;
                        return Ok(trace);
                    }
                };
            }
        }
        Err(InferenceError::InitializationFailed(max_attempts))
    })
}

fn past_time_limit(elapsed: Duration, max_time: Option<Duration>) -> bool {
    max_time.is_some_and(|max_time| elapsed > max_time)
}

#[derive(Debug, Clone)]
pub struct McmcOutput {
    pub marginal: Marginal,
    pub acceptance: Option<AcceptanceInfo>,
    pub final_trace: Trace,
}

/// Run an MCMC chain and aggregate the values it visits.
///
/// The chain is `burn` burn-in transitions followed by `samples` rounds of
/// `lag + 1` transitions, each round ending with one collected value.
pub fn mcmc(
    ctx: &mut Context,
    program: &Program,
    store: Store,
    address: Address,
    settings: &McmcSettings,
    callbacks: &mut [&mut dyn ChainCallback],
) -> Result<McmcOutput> {
    let kernel = settings.kernel.build().context("Invalid MCMC kernel")?;
    let burn_kernel = settings
        .burn_kernel
        .as_ref()
        .unwrap_or(&settings.kernel)
        .build()
        .context("Invalid burn-in kernel")?;

    let mut logger = ProgressLogger::default();
    let mut observers: Vec<&mut dyn ChainCallback> = Vec::with_capacity(callbacks.len() + 1);
    if settings.verbose {
        observers.push(&mut logger);
    }
    for callback in callbacks.iter_mut() {
        observers.push(&mut **callback);
    }
    for observer in observers.iter_mut() {
        observer.setup(settings.num_iters());
    }

    let mut aggregator: Box<dyn Aggregator> = if settings.only_map || settings.just_sample {
        Box::new(MaxAPosteriori::new(settings.just_sample))
    } else {
        Box::new(Histogram::default())
    };

    let start = Instant::now();
    let mut initial = initialize(ctx, program, store, address, settings.max_init_attempts)
        .context("Failed to initialize the chain")?;
    initial.info = Some(AcceptanceInfo::default());

    let observers = RefCell::new(observers);
    let iteration = Cell::new(0usize);
    let final_trace = {
        let (observers, iteration) = (&observers, &iteration);
        let notify = || {
            tap(move |_, trace: &Trace| {
                let i = iteration.get();
                iteration.set(i + 1);
                for observer in observers.borrow_mut().iter_mut() {
                    observer.iteration(trace, i);
                }
                Ok(())
            })
        };
        let max_time = settings.max_time;
        let collect = tap(|ctx: &mut Context, trace: &Trace| {
            let elapsed = start.elapsed();
            let value = trace.value().ok_or(InferenceError::IncompleteTrace)?;
            aggregator.add(value, trace.score, elapsed);
            if past_time_limit(elapsed, max_time) {
                ctx.halt();
            }
            Ok(())
        });

        let mut chain = sequence(
            repeat(settings.burn, sequence(burn_kernel, notify())),
            repeat(
                settings.samples,
                sequence(repeat(settings.lag + 1, sequence(kernel, notify())), collect),
            ),
        );
        chain.transition(ctx, initial)
    };
    if ctx.take_halt() {
        info!("MCMC stopped after reaching the time limit");
    }
    let final_trace = final_trace.context("MCMC chain failed")?;

    let last = iteration.get().saturating_sub(1);
    for observer in observers.borrow_mut().iter_mut() {
        observer.finish(&final_trace, last);
    }

    Ok(McmcOutput {
        marginal: aggregator.to_marginal(),
        acceptance: final_trace.info,
        final_trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mh::MhOptions, program::test_programs::*};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        num_iters: usize,
        iterations: usize,
        last: Option<usize>,
    }

    impl ChainCallback for Recorder {
        fn setup(&mut self, num_iters: usize) {
            self.num_iters = num_iters;
        }

        fn iteration(&mut self, _trace: &Trace, iteration: usize) {
            assert_eq!(iteration, self.iterations);
            self.iterations += 1;
        }

        fn finish(&mut self, _trace: &Trace, last_iteration: usize) {
            self.last = Some(last_iteration);
        }
    }

    fn run(settings: &McmcSettings, callbacks: &mut [&mut dyn ChainCallback]) -> Result<McmcOutput> {
        let mut ctx = Context::seed_from_u64(123);
        mcmc(
            &mut ctx,
            &weighted_coin(),
            Store::new(),
            Address::root(),
            settings,
            callbacks,
        )
    }

    #[test]
    fn initialize_rejects_impossible_traces() {
        let program = Program::new(|store, address| {
            Step::factor(store, address, f64::NEG_INFINITY, |store| Step::exit(store, Value::Unit))
        });
        let mut ctx = Context::seed_from_u64(0);
        let result = initialize(&mut ctx, &program, Store::new(), Address::root(), 5);
        assert!(matches!(result, Err(InferenceError::InitializationFailed(5))));
        assert_eq!(ctx.handlers().depth(), 0);
    }

    #[test]
    fn initialize_completes_trace() -> crate::error::Result<()> {
        let mut ctx = Context::seed_from_u64(0);
        let trace = initialize(&mut ctx, &switching_mean(), Store::new(), Address::root(), 5)?;
        assert!(trace.is_complete());
        assert!(trace.score.is_finite());
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.num_factors, 1);
        trace.check_consistency()
    }

    #[test]
    fn chain_counts_iterations() -> Result<()> {
        let settings = McmcSettings {
            samples: 50,
            burn: 10,
            lag: 2,
            verbose: true,
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        let output = run(&settings, &mut [&mut recorder])?;

        assert_eq!(recorder.num_iters, 160);
        assert_eq!(recorder.iterations, 160);
        assert_eq!(recorder.last, Some(159));
        assert_eq!(output.acceptance.map(|info| info.total), Some(160));
        let total: f64 = output
            .marginal
            .support()
            .iter()
            .map(|v| output.marginal.probability(v))
            .sum();
        assert_abs_diff_eq!(total, 1., epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn weighted_coin_posterior() -> Result<()> {
        let settings = McmcSettings {
            samples: 5000,
            burn: 100,
            ..Default::default()
        };
        let output = run(&settings, &mut [])?;
        assert_abs_diff_eq!(output.marginal.probability(&Value::Bool(true)), 0.9, epsilon = 0.03);
        Ok(())
    }

    #[test]
    fn map_and_samples() -> Result<()> {
        let settings = McmcSettings {
            samples: 200,
            just_sample: true,
            ..Default::default()
        };
        let output = run(&settings, &mut [])?;
        assert_eq!(output.marginal.probability(&Value::Bool(true)), 1.);
        assert_eq!(output.marginal.samples().len(), 200);
        Ok(())
    }

    #[test]
    fn time_limit_halts_collection() -> Result<()> {
        let settings = McmcSettings {
            samples: 1000,
            max_time: Some(Duration::ZERO),
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        let output = run(&settings, &mut [&mut recorder])?;
        assert_eq!(recorder.iterations, 1);
        assert_eq!(output.marginal.len(), 1);
        Ok(())
    }

    #[test]
    fn time_limit_is_exclusive() {
        let limit = Duration::from_millis(20);
        assert!(!past_time_limit(limit, Some(limit)));
        assert!(past_time_limit(limit + Duration::from_nanos(1), Some(limit)));
        assert!(!past_time_limit(Duration::MAX, None));
    }

    #[test]
    fn separate_burn_kernel() -> Result<()> {
        let settings = McmcSettings {
            samples: 10,
            burn: 10,
            burn_kernel: Some(KernelConfig::Mh(MhOptions {
                proposal_boundary: 1,
                ..Default::default()
            })),
            ..Default::default()
        };
        let output = run(&settings, &mut [])?;
        assert_eq!(output.acceptance.map(|info| info.total), Some(20));
        Ok(())
    }

    #[test]
    fn invalid_kernel_fails_before_running() {
        let settings = McmcSettings {
            kernel: KernelConfig::Larj(crate::larj::LarjOptions {
                annealing_steps: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        assert!(run(&settings, &mut [&mut recorder]).is_err());
        assert_eq!(recorder.num_iters, 0);
    }
}
