//! Single-site Metropolis-Hastings over execution traces.
//!
//! A transition picks one recorded choice, proposes a new value for it,
//! replays the program from that point (reusing every downstream value the
//! old trace already had) and accepts or rejects the result.

use std::{collections::HashSet, rc::Rc};

use itertools::Itertools;
use log::debug;

use crate::{
    context::{Context, HandlerId, HandlerKind},
    dist::{Distribution, Params},
    error::{InferenceError, Result},
    kernel::Kernel,
    program::{check_factor, Step},
    trace::{AcceptanceInfo, Choice, Trace},
    value::{Address, Value},
};

/// Which choices a kernel may propose to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteFilter {
    #[default]
    Any,
    DiscreteOnly,
    ContinuousOnly,
}

impl SiteFilter {
    pub fn admits(&self, choice: &Choice) -> bool {
        match self {
            SiteFilter::Any => true,
            SiteFilter::DiscreteOnly => !choice.is_continuous(),
            SiteFilter::ContinuousOnly => choice.is_continuous(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MhOptions {
    /// Choices before this index are never proposed to.
    pub proposal_boundary: usize,
    /// Stop replaying successfully once this many factors have been seen.
    pub exit_factor: Option<usize>,
    /// Allow starting from a trace with score -inf.
    pub permissive: bool,
    pub filter: SiteFilter,
}

/// Result of replaying a program after changing one choice.
pub enum Regenerated<T> {
    /// The score dropped to -inf somewhere along the way.
    Impossible,
    Replayed {
        target: T,
        reused: HashSet<Address>,
        early_exit: bool,
    },
}

/// Anything MH can propose on: a plain trace, or a blend of two traces
/// while LARJ anneals between model structures.
pub trait ProposalTarget: Sized {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn choice_at(&self, index: usize) -> Option<&Choice>;

    fn find_choice(&self, address: &Address) -> Option<&Choice>;

    fn score(&self) -> f64;

    fn info(&self) -> Option<AcceptanceInfo>;

    fn set_info(&mut self, info: Option<AcceptanceInfo>);

    /// Set the choice at `index` to `value` and replay everything after it.
    fn regenerate(
        &self,
        ctx: &mut Context,
        handler: HandlerId,
        index: usize,
        value: Value,
        exit_factor: Option<usize>,
    ) -> Result<Regenerated<Self>>;
}

/// Truncate `old` after choice `index`, install `value` there, and run the
/// program forward under `handler`, reusing values `old` already holds.
pub(crate) fn replay(
    ctx: &mut Context,
    handler: HandlerId,
    old: &Trace,
    index: usize,
    value: Value,
    exit_factor: Option<usize>,
) -> Result<Regenerated<Trace>> {
    let mut trace = old.upto_and_including(index);
    let address = trace.choice_at(index).map(|c| c.address.clone());
    let address = address.ok_or(InferenceError::InconsistentTrace("regeneration index"))?;
    trace.set_choice_value(&address, value)?;
    if trace.score == f64::NEG_INFINITY {
        return Ok(Regenerated::Impossible);
    }

    trace.resume_after_last_choice();
    let mut reused = HashSet::new();
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
                let value = match old.find_choice(&address) {
                    Some(previous) => {
                        reused.insert(address.clone());
                        previous.value.clone()
                    }
                    None => dist.sample(ctx.rng(), &params),
                };
                trace.add_choice(dist, params, value.clone(), address, store.clone(), k.clone());
                if trace.score == f64::NEG_INFINITY {
                    return Ok(Regenerated::Impossible);
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
                    return Ok(Regenerated::Impossible);
                }
                if exit_factor == Some(trace.num_factors) {
                    trace.save_continuation(store, k);
                    return Ok(Regenerated::Replayed {
                        target: trace,
                        reused,
                        early_exit: true,
                    });
                }
                k(store, Value::Unit)
            }
            Step::Exit { value, .. } => {
                trace.complete(value)?;
                return Ok(Regenerated::Replayed {
                    target: trace,
                    reused,
                    early_exit: false,
                });
            }
        };
    }
}

impl ProposalTarget for Trace {
    fn len(&self) -> usize {
        Trace::len(self)
    }

    fn choice_at(&self, index: usize) -> Option<&Choice> {
        Trace::choice_at(self, index)
    }

    fn find_choice(&self, address: &Address) -> Option<&Choice> {
        Trace::find_choice(self, address)
    }

    fn score(&self) -> f64 {
        self.score
    }

    fn info(&self) -> Option<AcceptanceInfo> {
        self.info
    }

    fn set_info(&mut self, info: Option<AcceptanceInfo>) {
        self.info = info;
    }

    fn regenerate(
        &self,
        ctx: &mut Context,
        handler: HandlerId,
        index: usize,
        value: Value,
        exit_factor: Option<usize>,
    ) -> Result<Regenerated<Self>> {
        replay(ctx, handler, self, index, value, exit_factor)
    }
}

/// The outcome of the select/propose/replay part of a transition.
pub enum Proposal<T> {
    /// Finished without a new trace, either accepting (a no-op move) or
    /// rejecting (the proposal had probability zero).
    Bail { accept: bool },
    Proposed(Proposed<T>),
}

pub struct Proposed<T> {
    pub target: T,
    pub regen_from: usize,
    pub reused: HashSet<Address>,
    pub early_exit: bool,
}

fn proposal_for(choice: &Choice, previous: &Value) -> (Rc<dyn Distribution>, Params) {
    match choice.dist.proposer() {
        Some(proposer) => (
            proposer,
            Rc::from([Value::List(choice.params.to_vec()), previous.clone()]),
        ),
        None => (choice.dist.clone(), choice.params.clone()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MhKernel {
    options: MhOptions,
}

impl MhKernel {
    pub fn new(options: MhOptions) -> Self {
        MhKernel { options }
    }

    pub fn options(&self) -> &MhOptions {
        &self.options
    }

    /// Indices this kernel may propose to.
    pub fn eligible_indices<T: ProposalTarget>(&self, target: &T) -> Vec<usize> {
        (self.options.proposal_boundary..target.len())
            .filter(|&i| {
                target
                    .choice_at(i)
                    .is_some_and(|choice| self.options.filter.admits(choice))
            })
            .collect_vec()
    }

    pub fn num_regen_choices<T: ProposalTarget>(&self, target: &T) -> usize {
        self.eligible_indices(target).len()
    }

    fn sample_regen_choice<T: ProposalTarget>(&self, ctx: &mut Context, target: &T) -> Option<usize> {
        let indices = self.eligible_indices(target);
        if indices.is_empty() {
            return None;
        }
        let pick = (ctx.uniform() * indices.len() as f64) as usize;
        Some(indices[pick.min(indices.len() - 1)])
    }

    /// Select a site, propose a value and replay the program, without
    /// deciding whether to accept.
    pub fn propose<T: ProposalTarget>(&self, ctx: &mut Context, old: &T) -> Result<Proposal<T>> {
        ctx.with_handler(HandlerKind::Mh, |ctx, handler| {
            let Some(regen_from) = self.sample_regen_choice(ctx, old) else {
                return Ok(Proposal::Bail { accept: true });
            };
            let regen = old
                .choice_at(regen_from)
                .ok_or(InferenceError::InconsistentTrace("regeneration index"))?;
            let (proposal_dist, proposal_params) = proposal_for(regen, &regen.value);
            let value = proposal_dist.sample(ctx.rng(), &proposal_params);

            // Resampling the same discrete value is a guaranteed accept.
            if !proposal_dist.is_continuous() && value == regen.value {
                return Ok(Proposal::Bail { accept: true });
            }

            let regenerated =
                old.regenerate(ctx, handler, regen_from, value, self.options.exit_factor)?;
            Ok(match regenerated {
                Regenerated::Impossible => Proposal::Bail { accept: false },
                Regenerated::Replayed {
                    target,
                    reused,
                    early_exit,
                } => Proposal::Proposed(Proposed {
                    target,
                    regen_from,
                    reused,
                    early_exit,
                }),
            })
        })
    }

    /// Log probability of proposing `to` starting from `from`.
    pub fn transition_log_prob<T: ProposalTarget>(
        &self,
        from: &T,
        to: &T,
        regen_from: usize,
        reused: &HashSet<Address>,
    ) -> Result<f64> {
        let regen = to
            .choice_at(regen_from)
            .ok_or(InferenceError::InconsistentTrace("regeneration index"))?;
        let previous = from
            .choice_at(regen_from)
            .map(|c| &c.value)
            .ok_or(InferenceError::InconsistentTrace("regeneration index"))?;
        let (proposal_dist, proposal_params) = proposal_for(regen, previous);
        let mut score = proposal_dist.score(&proposal_params, &regen.value);

        score += ((regen_from + 1)..to.len())
            .filter_map(|i| to.choice_at(i))
            .filter(|choice| !reused.contains(&choice.address))
            .map(Choice::log_prob)
            .sum::<f64>();

        score -= (self.num_regen_choices(from) as f64).ln();
        if score.is_nan() {
            return Err(InferenceError::NanAcceptance);
        }
        Ok(score)
    }

    /// `log(p(new) / p(old) * q(old | new) / q(new | old))`
    pub fn log_accept_ratio<T: ProposalTarget>(&self, old: &T, proposed: &Proposed<T>) -> Result<f64> {
        let new = &proposed.target;
        let forward = self.transition_log_prob(old, new, proposed.regen_from, &proposed.reused)?;
        let backward = self.transition_log_prob(new, old, proposed.regen_from, &proposed.reused)?;
        let ratio = new.score() - old.score() + backward - forward;
        if ratio.is_nan() {
            return Err(InferenceError::NanAcceptance);
        }
        Ok(ratio)
    }
}

/// Accept with probability `min(1, exp(log_ratio))`.
pub(crate) fn accept_with(ctx: &mut Context, log_ratio: f64) -> bool {
    ctx.uniform() < log_ratio.exp().min(1.)
}

impl<T: ProposalTarget> Kernel<T> for MhKernel {
    fn transition(&mut self, ctx: &mut Context, old: T) -> Result<T> {
        if !self.options.permissive && old.score() == f64::NEG_INFINITY {
            return Err(InferenceError::ImpossibleTrace);
        }
        let info = old.info();
        let (mut next, accepted) = match self.propose(ctx, &old)? {
            Proposal::Bail { accept } => {
                debug!("MH finished early, accept = {accept}");
                (old, accept)
            }
            Proposal::Proposed(proposed) => {
                let log_ratio = self.log_accept_ratio(&old, &proposed)?;
                let accepted = accept_with(ctx, log_ratio);
                debug!(
                    "MH proposal at site {} (log ratio {log_ratio:.4}) accepted = {accepted}",
                    proposed.regen_from
                );
                if accepted {
                    (proposed.target, true)
                } else {
                    (old, false)
                }
            }
        };
        next.set_info(info.map(|info| info.record(accepted)));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::initialize,
        dist,
        program::{test_programs::*, Program},
        value::Store,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn start(ctx: &mut Context, program: &Program) -> Result<Trace> {
        let mut trace = initialize(ctx, program, Store::new(), Address::root(), 100)?;
        trace.info = Some(AcceptanceInfo::default());
        Ok(trace)
    }

    #[test]
    fn self_loop_always_accepts() -> Result<()> {
        let mut ctx = Context::seed_from_u64(4);
        let trace = start(&mut ctx, &certain_coin())?;
        let mut kernel = MhKernel::default();
        let mut current = trace.clone();
        for _ in 0..50 {
            current = kernel.transition(&mut ctx, current)?;
        }
        assert!(current.same_choices(&trace));
        assert_eq!(current.info, Some(AcceptanceInfo { accepted: 50, total: 50 }));
        assert_eq!(ctx.handlers().depth(), 0);
        Ok(())
    }

    #[test]
    fn no_eligible_site_is_a_no_op() -> Result<()> {
        let mut ctx = Context::seed_from_u64(4);
        let trace = start(&mut ctx, &weighted_coin())?;
        let mut kernel = MhKernel::new(MhOptions {
            filter: SiteFilter::ContinuousOnly,
            ..Default::default()
        });
        let next = kernel.transition(&mut ctx, trace.clone())?;
        assert!(next.same_choices(&trace));
        assert_eq!(next.info, Some(AcceptanceInfo { accepted: 1, total: 1 }));
        Ok(())
    }

    #[test]
    fn impossible_proposals_are_rejected() -> Result<()> {
        // x ~ Bernoulli(0.5); factor(x ? 0 : -inf)
        let program = Program::new(|store, address| {
            let a = address.clone();
            Step::sample(
                store,
                address.child("x"),
                dist::bernoulli(),
                [Value::Real(0.5)],
                move |store, x| {
                    let score = if x.is_true() { 0. } else { f64::NEG_INFINITY };
                    Step::factor(store, a.child("f"), score, move |store| {
                        Step::exit(store, x.clone())
                    })
                },
            )
        });
        let mut ctx = Context::seed_from_u64(9);
        let mut trace = start(&mut ctx, &program)?;
        let mut kernel = MhKernel::default();
        for _ in 0..100 {
            trace = kernel.transition(&mut ctx, trace)?;
            assert_eq!(trace.value(), Some(&Value::Bool(true)));
        }
        let info = trace.info.unwrap();
        assert_eq!(info.total, 100);
        assert!(info.accepted < 100);
        Ok(())
    }

    #[test]
    fn impossible_start_is_fatal_unless_permissive() {
        let mut trace = Trace::new(certain_coin(), Store::new(), Address::root());
        trace.score = f64::NEG_INFINITY;
        let mut ctx = Context::seed_from_u64(0);
        let result = MhKernel::default().transition(&mut ctx, trace);
        assert!(matches!(result, Err(InferenceError::ImpossibleTrace)));
    }

    #[test]
    fn downstream_choices_are_reused() -> Result<()> {
        let mut ctx = Context::seed_from_u64(21);
        let trace = start(&mut ctx, &switching_mean())?;
        let kernel = MhKernel::new(MhOptions {
            filter: SiteFilter::DiscreteOnly,
            ..Default::default()
        });
        loop {
            let Proposal::Proposed(proposed) = kernel.propose(&mut ctx, &trace)? else {
                continue;
            };
            let x = Address::root().child("x");
            assert!(proposed.reused.contains(&x));
            assert_eq!(
                proposed.target.find_choice(&x).unwrap().value,
                trace.find_choice(&x).unwrap().value
            );
            assert_ne!(proposed.target.value(), trace.value());
            // Only the flipped coin is new: forward and backward are both
            // log(1/2) at the coin minus log(1) eligible site.
            let forward =
                kernel.transition_log_prob(&trace, &proposed.target, 0, &proposed.reused)?;
            assert_abs_diff_eq!(forward, 0.5f64.ln(), epsilon = 1e-12);
            return Ok(());
        }
    }

    #[test]
    fn early_exit_stops_at_factor() -> Result<()> {
        let mut ctx = Context::seed_from_u64(2);
        let trace = start(&mut ctx, &switching_mean())?;
        let kernel = MhKernel::new(MhOptions {
            exit_factor: Some(1),
            filter: SiteFilter::ContinuousOnly,
            ..Default::default()
        });
        match kernel.propose(&mut ctx, &trace)? {
            Proposal::Proposed(proposed) => {
                assert!(proposed.early_exit);
                assert!(!proposed.target.is_complete());
                assert_eq!(proposed.target.num_factors, 1);
            }
            Proposal::Bail { .. } => panic!("a continuous proposal cannot bail"),
        }
        Ok(())
    }
}
