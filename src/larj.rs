//! Locally annealed reversible jump MCMC.
//!
//! A jump move changes a discrete choice (and with it possibly the model
//! structure). Before the move is accepted or rejected, the continuous
//! choices are annealed from the old structure's posterior to the new one's
//! by running a diffusion kernel over an [`InterpolationTrace`].

use log::debug;

use crate::{
    context::{Context, HandlerId, HandlerKind},
    error::{InferenceError, Result},
    interpolation::InterpolationTrace,
    kernel::Kernel,
    mh::{accept_with, MhKernel, MhOptions, Proposal, SiteFilter},
    trace::{Choice, Trace},
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LarjOptions {
    /// Number of diffusion passes during a jump. Zero disables annealing.
    pub annealing_steps: usize,
    /// Probability of attempting a jump instead of a diffusion move. By
    /// default the share of discrete choices among all eligible choices.
    pub jump_probability: Option<f64>,
    pub proposal_boundary: usize,
}

impl LarjOptions {
    fn validate(&self) -> Result<()> {
        if self.annealing_steps == 1 {
            return Err(InferenceError::Configuration(
                "LARJ needs at least two annealing steps (or zero to disable annealing)".into(),
            ));
        }
        if let Some(p) = self.jump_probability {
            if !(0. ..=1.).contains(&p) {
                return Err(InferenceError::Configuration(format!(
                    "LARJ jump probability must be in [0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }
}

/// What a jump proposal came to before the accept/reject draw.
#[derive(Debug)]
pub enum JumpOutcome {
    Bail { accept: bool },
    Proposed { trace: Trace, log_accept_ratio: f64 },
}

#[derive(Debug, Clone)]
pub struct LarjKernel<D> {
    jump: MhKernel,
    diffusion: D,
    options: LarjOptions,
}

impl<D> LarjKernel<D> {
    pub fn new(options: LarjOptions, diffusion: D) -> Result<Self> {
        options.validate()?;
        let jump = MhKernel::new(MhOptions {
            proposal_boundary: options.proposal_boundary,
            filter: SiteFilter::DiscreteOnly,
            ..Default::default()
        });
        Ok(LarjKernel {
            jump,
            diffusion,
            options,
        })
    }

    pub fn options(&self) -> &LarjOptions {
        &self.options
    }

    pub fn jump_kernel(&self) -> &MhKernel {
        &self.jump
    }

    fn jump_probability(&self, trace: &Trace) -> f64 {
        if let Some(p) = self.options.jump_probability {
            return p;
        }
        let total = trace.len().saturating_sub(self.options.proposal_boundary);
        if total == 0 {
            return 0.;
        }
        self.jump.num_regen_choices(trace) as f64 / total as f64
    }

    /// `log(p_jump(new) / p_jump(old))`. The default jump probability
    /// depends on the structure, so the reverse move is chosen with a
    /// different probability whenever a jump changes the number of choices.
    fn jump_choice_log_ratio(&self, old: &Trace, new: &Trace) -> f64 {
        match self.options.jump_probability {
            Some(_) => 0.,
            None => self.jump_probability(new).ln() - self.jump_probability(old).ln(),
        }
    }

    fn has_continuous(&self, trace: &Trace) -> bool {
        trace
            .choices()
            .skip(self.options.proposal_boundary)
            .any(Choice::is_continuous)
    }
}

impl LarjKernel<MhKernel> {
    /// LARJ with continuous-only MH as the diffusion kernel.
    pub fn with_mh_diffusion(options: LarjOptions) -> Result<Self> {
        let diffusion = MhKernel::new(MhOptions {
            proposal_boundary: options.proposal_boundary,
            permissive: true,
            filter: SiteFilter::ContinuousOnly,
            ..Default::default()
        });
        LarjKernel::new(options, diffusion)
    }
}

impl<D> LarjKernel<D>
where
    D: Kernel<Trace> + Kernel<InterpolationTrace>,
{
    /// Propose a jump from `old`, anneal if configured, and compute the log
    /// acceptance ratio of the whole move.
    pub fn jump_proposal(&mut self, ctx: &mut Context, old: &Trace) -> Result<JumpOutcome> {
        ctx.with_handler(HandlerKind::Larj, |ctx, larj| {
            let proposal = self.jump.propose(ctx, old)?;
            ctx.handlers().ensure_active(larj)?;
            let proposed = match proposal {
                Proposal::Bail { accept } => return Ok(JumpOutcome::Bail { accept }),
                Proposal::Proposed(proposed) => proposed,
            };
            if proposed.target.score == f64::NEG_INFINITY {
                return Ok(JumpOutcome::Bail { accept: false });
            }

            let regen_from = proposed.regen_from;
            let reused = &proposed.reused;
            let forward = self
                .jump
                .transition_log_prob(old, &proposed.target, regen_from, reused)?;

            let anneal = self.options.annealing_steps >= 2
                && (self.has_continuous(old) || self.has_continuous(&proposed.target));
            // The reverse jump starts from the annealed new trace and lands on
            // the old structure as annealing left it.
            let (reverse_target, new, correction) = if anneal {
                self.anneal(ctx, larj, old.clone(), proposed.target)?
            } else {
                (old.clone(), proposed.target, 0.)
            };
            let backward = self
                .jump
                .transition_log_prob(&new, &reverse_target, regen_from, reused)?;

            let log_accept_ratio = new.score - old.score + backward - forward
                + correction
                + self.jump_choice_log_ratio(old, &new);
            if log_accept_ratio.is_nan() {
                return Err(InferenceError::NanAcceptance);
            }
            Ok(JumpOutcome::Proposed {
                trace: new,
                log_accept_ratio,
            })
        })
    }

    /// Run the diffusion kernel while the interpolation slides from the old
    /// structure to the new one. Returns both annealed traces, old structure
    /// first, and the accumulated log weight correction.
    fn anneal(
        &mut self,
        ctx: &mut Context,
        larj: HandlerId,
        old: Trace,
        new: Trace,
    ) -> Result<(Trace, Trace, f64)> {
        let steps = self.options.annealing_steps;
        let mut interp = InterpolationTrace::new(old, new, 0.);
        let structure = interp.addresses();
        let mut correction = 0.;
        for step in 0..steps {
            interp.set_alpha(step as f64 / (steps - 1) as f64);
            let before = interp.score();
            interp = <D as Kernel<InterpolationTrace>>::transition(&mut self.diffusion, ctx, interp)?;
            ctx.handlers().ensure_active(larj)?;

            let addresses = interp.addresses();
            if addresses != structure {
                return Err(InferenceError::StructureChanged {
                    step,
                    before: structure.len(),
                    after: addresses.len(),
                });
            }
            correction += before - interp.score();
        }
        debug!("LARJ annealed over {steps} steps, log weight correction {correction:.4}");
        let (old, new) = interp.into_parts();
        Ok((old, new, correction))
    }
}

impl<D> Kernel<Trace> for LarjKernel<D>
where
    D: Kernel<Trace> + Kernel<InterpolationTrace>,
{
    fn transition(&mut self, ctx: &mut Context, old: Trace) -> Result<Trace> {
        if ctx.uniform() >= self.jump_probability(&old) {
            return ctx.with_handler(HandlerKind::Larj, |ctx, larj| {
                let next = <D as Kernel<Trace>>::transition(&mut self.diffusion, ctx, old)?;
                ctx.handlers().ensure_active(larj)?;
                Ok(next)
            });
        }

        let info = old.info;
        let (mut next, accepted) = match self.jump_proposal(ctx, &old)? {
            JumpOutcome::Bail { accept } => (old, accept),
            JumpOutcome::Proposed {
                trace,
                log_accept_ratio,
            } => {
                let accepted = accept_with(ctx, log_accept_ratio);
                debug!("LARJ jump (log ratio {log_accept_ratio:.4}) accepted = {accepted}");
                if accepted {
                    (trace, true)
                } else {
                    (old, false)
                }
            }
        };
        next.info = info.map(|info| info.record(accepted));
        Ok(next)
    }
}
