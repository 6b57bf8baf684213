//! Trace-based inference for probabilistic programs written in
//! suspend/resume form.
//!
//! A [`Program`] hands every random choice and factor statement to the
//! active inference handler as a [`Step`]. On top of that contract the
//! crate provides single-site Metropolis-Hastings ([`MhKernel`]), locally
//! annealed reversible jump ([`LarjKernel`]), a particle filter
//! ([`particle_filter`]) and the combinators that turn kernels into MCMC
//! chains ([`mcmc`]).

pub(crate) mod aggregation;
pub(crate) mod chain;
pub(crate) mod context;
pub mod dist;
pub(crate) mod error;
pub(crate) mod interpolation;
pub mod kernel;
pub(crate) mod larj;
pub(crate) mod math;
pub(crate) mod mh;
pub(crate) mod particle_filter;
pub(crate) mod program;
pub(crate) mod trace;
pub(crate) mod value;

pub use aggregation::{Aggregator, Histogram, Marginal, MaxAPosteriori, Sample};
pub use chain::{initialize, mcmc, ChainCallback, McmcOutput, McmcSettings, ProgressLogger};
pub use context::{Context, HandlerId, HandlerKind, HandlerStack};
pub use dist::{Distribution, Params};
pub use error::{InferenceError, Result};
pub use interpolation::InterpolationTrace;
pub use kernel::{repeat, sequence, tap, Kernel, KernelConfig, Repeat, Sequence, Tap};
pub use larj::{JumpOutcome, LarjKernel, LarjOptions};
pub use math::logsumexp;
pub use mh::{MhKernel, MhOptions, Proposal, ProposalTarget, Proposed, Regenerated, SiteFilter};
pub use particle_filter::{
    particle_filter, BestParticle, FilterOutput, Particle, ParticleFilterSettings,
};
pub use program::{sample_prior, Continuation, Program, Step};
pub use trace::{AcceptanceInfo, Choice, Trace};
pub use value::{Address, Store, Value};
