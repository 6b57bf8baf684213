//! Sequential importance resampling.
//!
//! Particles run one at a time. Every factor statement is a
//! synchronization point: a particle that reaches one hands control to the
//! next active particle, and once all active particles have advanced the
//! population is resampled.

use std::{fmt, rc::Rc};

use log::{debug, warn};
use rand::Rng;

use crate::{
    aggregation::Marginal,
    context::{Context, HandlerKind},
    dist::Distribution,
    error::{InferenceError, Result},
    math::{logsumexp, multinomial_sample},
    program::{check_factor, Continuation, Program, Step},
    value::{Address, Store, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleFilterSettings {
    pub num_particles: usize,
    /// Fail when every particle has weight -inf instead of carrying on
    /// without resampling.
    pub strict: bool,
    /// Keep the population before and after every resampling step.
    pub save_history: bool,
}

impl Default for ParticleFilterSettings {
    fn default() -> Self {
        Self {
            num_particles: 100,
            strict: true,
            save_history: false,
        }
    }
}

#[derive(Clone)]
enum Resume {
    Start,
    At(Continuation),
}

/// One independent execution of the program.
#[derive(Clone)]
pub struct Particle {
    /// Fresh for every choice the particle makes.
    pub id: u64,
    resume: Resume,
    store: Store,
    pub weight: f64,
    pub log_prior: f64,
    pub log_likelihood: f64,
    pub log_posterior: f64,
    pub active: bool,
    pub value: Option<Value>,
    /// Every value this particle sampled, in order.
    pub trace: Vec<Value>,
}

impl Particle {
    fn new(id: u64, store: Store) -> Self {
        Particle {
            id,
            resume: Resume::Start,
            store,
            weight: 0.,
            log_prior: 0.,
            log_likelihood: 0.,
            log_posterior: 0.,
            active: true,
            value: None,
            trace: Vec::new(),
        }
    }
}

impl fmt::Debug for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("log_posterior", &self.log_posterior)
            .field("active", &self.active)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// Where the highest log posterior was seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestParticle {
    pub log_posterior: f64,
    pub generation: Option<usize>,
    pub index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FilterOutput {
    /// Unweighted counts of the final particles' return values, with the
    /// final average weight as log normalization constant.
    pub marginal: Marginal,
    /// Sampled values of a uniformly chosen final particle.
    pub trace: Vec<Value>,
    /// Populations around every resampling step, or just the final one.
    pub history: Vec<Vec<Particle>>,
    pub best: BestParticle,
    pub generations: usize,
}

struct Filter {
    particles: Vec<Particle>,
    index: usize,
    next_id: u64,
    strict: bool,
    history: Option<Vec<Vec<Particle>>>,
    best: BestParticle,
    generations: usize,
}

impl Filter {
    fn new(settings: &ParticleFilterSettings, store: &Store) -> Self {
        let particles = (0..settings.num_particles as u64)
            .map(|id| Particle::new(id, store.clone()))
            .collect();
        Filter {
            particles,
            index: 0,
            next_id: settings.num_particles as u64,
            strict: settings.strict,
            history: settings.save_history.then(Vec::new),
            best: BestParticle {
                log_posterior: f64::NEG_INFINITY,
                generation: None,
                index: None,
            },
            generations: 0,
        }
    }

    fn current(&mut self) -> &mut Particle {
        &mut self.particles[self.index]
    }

    fn resume(&self, program: &Program, address: &Address) -> Step {
        let particle = &self.particles[self.index];
        match &particle.resume {
            Resume::Start => program.start(particle.store.clone(), address.clone()),
            Resume::At(k) => k(particle.store.clone(), Value::Unit),
        }
    }

    fn first_active(&self) -> Option<usize> {
        self.particles.iter().position(|p| p.active)
    }

    fn last_active(&self) -> Option<usize> {
        self.particles.iter().rposition(|p| p.active)
    }

    /// The next active particle after the current one, wrapping around.
    fn next_active(&self) -> Option<usize> {
        self.particles[self.index + 1..]
            .iter()
            .position(|p| p.active)
            .map(|i| i + self.index + 1)
            .or_else(|| self.first_active())
    }

    fn sample(&mut self, ctx: &mut Context, dist: &Rc<dyn Distribution>, params: &[Value]) -> Value {
        let proposal = dist.importance().unwrap_or_else(|| dist.clone());
        let value = proposal.sample(ctx.rng(), params);
        let importance_score = proposal.score(params, &value);
        let choice_score = dist.score(params, &value);

        let id = self.next_id;
        self.next_id += 1;
        let particle = self.current();
        particle.weight += choice_score - importance_score;
        particle.log_prior += choice_score;
        particle.log_posterior += choice_score;
        particle.trace.push(value.clone());
        particle.id = id;
        value
    }

    /// Returns whether any particle is left to run.
    fn factor(&mut self, ctx: &mut Context, store: Store, k: Continuation, score: f64) -> Result<bool> {
        let particle = self.current();
        particle.weight += score;
        particle.log_likelihood += score;
        particle.log_posterior += score;
        particle.resume = Resume::At(k);
        particle.store = store;

        if Some(self.index) == self.last_active() {
            self.resample(ctx)?;
            return Ok(self.move_to(self.first_active()));
        }
        Ok(self.move_to(self.next_active()))
    }

    fn exit(&mut self, ctx: &mut Context, value: Value) -> Result<bool> {
        let particle = self.current();
        particle.value = Some(value);
        particle.active = false;

        match self.next_active() {
            None => Ok(false),
            Some(next) if next < self.index => {
                self.resample(ctx)?;
                Ok(self.move_to(self.first_active()))
            }
            next => Ok(self.move_to(next)),
        }
    }

    fn move_to(&mut self, index: Option<usize>) -> bool {
        match index {
            Some(index) => {
                self.index = index;
                true
            }
            None => false,
        }
    }

    /// Residual resampling: keep `floor(w)` copies of every particle, where
    /// `w` is its weight relative to the average, and draw the remaining
    /// slots in proportion to the fractional parts.
    fn resample(&mut self, ctx: &mut Context) -> Result<()> {
        let m = self.particles.len();
        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let avg_w = logsumexp(&weights) - (m as f64).ln();

        if avg_w == f64::NEG_INFINITY {
            if self.strict {
                return Err(InferenceError::AllParticlesImpossible);
            }
            warn!("All particles have weight -inf, skipping resampling");
        } else {
            let mut retained = Vec::with_capacity(m);
            let mut remainders = Vec::with_capacity(m);
            for particle in &self.particles {
                let w = (particle.weight - avg_w).exp();
                let copies = w.floor();
                remainders.push(w - copies);
                retained.extend(std::iter::repeat_n(particle, copies as usize).cloned());
            }
            retained.truncate(m);

            let mut resampled: Vec<Particle> = (retained.len()..m)
                .map(|_| self.particles[multinomial_sample(ctx.rng(), &remainders)].clone())
                .collect();
            debug!(
                "Resampled {m} particles: {} retained, {} drawn",
                retained.len(),
                resampled.len()
            );
            resampled.extend(retained);

            let previous = std::mem::replace(&mut self.particles, resampled);
            if let Some(history) = &mut self.history {
                history.push(previous);
                history.push(self.particles.clone());
            }
        }

        for particle in &mut self.particles {
            particle.weight = avg_w;
        }

        for (i, particle) in self.particles.iter().enumerate() {
            if particle.log_posterior > self.best.log_posterior {
                self.best = BestParticle {
                    log_posterior: particle.log_posterior,
                    generation: Some(self.generations),
                    index: Some(i),
                };
            }
        }
        self.generations += 1;
        Ok(())
    }

    fn finish(self, ctx: &mut Context) -> FilterOutput {
        let marginal = Marginal::from_weights(
            self.particles
                .iter()
                .map(|p| (p.value.clone().unwrap_or(Value::Unit), 1.)),
        )
        .with_normalization_constant(self.particles[0].weight);

        let pick = ctx.rng().random_range(0..self.particles.len());
        let trace = self.particles[pick].trace.clone();
        debug!(
            "Best particle is in generation {:?} of {}, log posterior {}",
            self.best.generation, self.generations, self.best.log_posterior
        );
        let history = match self.history {
            Some(history) => history,
            None => vec![self.particles],
        };
        FilterOutput {
            marginal,
            trace,
            history,
            best: self.best,
            generations: self.generations,
        }
    }
}

/// Run the particle filter over `program` until every particle has exited.
pub fn particle_filter(
    ctx: &mut Context,
    program: &Program,
    store: Store,
    address: Address,
    settings: &ParticleFilterSettings,
) -> Result<FilterOutput> {
    if settings.num_particles == 0 {
        return Err(InferenceError::Configuration(
            "particle filter needs at least one particle".into(),
        ));
    }
    ctx.with_handler(HandlerKind::ParticleFilter, |ctx, handler| {
        let mut filter = Filter::new(settings, &store);
        let mut step = filter.resume(program, &address);
        loop {
            ctx.handlers().ensure_active(handler)?;
            let running = match step {
                Step::Sample {
                    store,
                    k,
                    dist,
                    params,
                    ..
                } => {
                    let value = filter.sample(ctx, &dist, &params);
                    step = k(store, value);
                    continue;
                }
                Step::Factor {
                    store,
                    k,
                    address,
                    score,
                } => {
                    check_factor(&address, score)?;
                    filter.factor(ctx, store, k, score)?
                }
                Step::Exit { value, .. } => filter.exit(ctx, value)?,
            };
            if !running {
                return Ok(filter.finish(ctx));
            }
            step = filter.resume(program, &address);
        }
    })
}
