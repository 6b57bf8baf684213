//! A virtual trace blending two traces of different model structure.

use std::{collections::HashMap, fmt, rc::Rc};

use itertools::Itertools;

use crate::{
    context::{Context, HandlerId},
    error::{InferenceError, Result},
    mh::{replay, ProposalTarget, Regenerated},
    trace::{AcceptanceInfo, Choice, Trace},
    value::{Address, Value},
};

/// Overlays two traces so that a diffusion kernel can move the choices they
/// share while the score slides from the first trace's to the second's.
#[derive(Clone)]
pub struct InterpolationTrace {
    first: Rc<Trace>,
    second: Rc<Trace>,
    alpha: f64,
    choices: Vec<Rc<Choice>>,
    address_map: HashMap<Address, usize>,
    info: Option<AcceptanceInfo>,
}

/// Order-preserving merge of two choice lists.
///
/// Choices only in `second` are placed right before the next choice both
/// lists share. A shared choice appears once, as recorded in `first`.
fn merge(first: &Trace, second: &Trace) -> Vec<Rc<Choice>> {
    let others = second.choice_records();
    let mut merged = Vec::with_capacity(first.len() + others.len());
    let mut cursor = 0;
    let only_second = |c: &Rc<Choice>| first.find_choice(&c.address).is_none();
    for choice in first.choice_records() {
        if let Some(anchor) = second.find_choice(&choice.address) {
            if anchor.index >= cursor {
                merged.extend(others[cursor..anchor.index].iter().filter(|c| only_second(c)).cloned());
                cursor = anchor.index + 1;
            }
        }
        merged.push(choice.clone());
    }
    merged.extend(others[cursor.min(others.len())..].iter().filter(|c| only_second(c)).cloned());
    merged
}

impl InterpolationTrace {
    pub fn new(first: Trace, second: Trace, alpha: f64) -> Self {
        Self::from_parts(Rc::new(first), Rc::new(second), alpha, None)
    }

    fn from_parts(
        first: Rc<Trace>,
        second: Rc<Trace>,
        alpha: f64,
        info: Option<AcceptanceInfo>,
    ) -> Self {
        let choices = merge(&first, &second);
        let address_map = choices
            .iter()
            .enumerate()
            .map(|(i, c)| (c.address.clone(), i))
            .collect();
        InterpolationTrace {
            first,
            second,
            alpha,
            choices,
            address_map,
            info,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }

    pub fn first(&self) -> &Trace {
        &self.first
    }

    pub fn second(&self) -> &Trace {
        &self.second
    }

    pub fn into_parts(self) -> (Trace, Trace) {
        (Rc::unwrap_or_clone(self.first), Rc::unwrap_or_clone(self.second))
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.choices.iter().map(|c| c.address.clone()).collect_vec()
    }

    /// `(1 - alpha) * first.score + alpha * second.score`
    pub fn score(&self) -> f64 {
        if self.alpha == 0. {
            return self.first.score;
        }
        if self.alpha == 1. {
            return self.second.score;
        }
        (1. - self.alpha) * self.first.score + self.alpha * self.second.score
    }

    /// Change the value at `address` in every underlying trace holding it.
    pub fn set_choice_value(&mut self, address: &Address, value: Value) -> Result<()> {
        let mut found = false;
        for side in [&mut self.first, &mut self.second] {
            if side.find_choice(address).is_some() {
                Rc::make_mut(side).set_choice_value(address, value.clone())?;
                found = true;
            }
        }
        if !found {
            return Err(InferenceError::MissingChoice(address.clone()));
        }
        self.choices = merge(&self.first, &self.second);
        Ok(())
    }
}

fn replay_side(
    ctx: &mut Context,
    handler: HandlerId,
    side: &Rc<Trace>,
    address: &Address,
    value: &Value,
    exit_factor: Option<usize>,
) -> Result<Option<Regenerated<Trace>>> {
    let Some(choice) = side.find_choice(address) else {
        return Ok(None);
    };
    let index = choice.index;
    replay(ctx, handler, side, index, value.clone(), exit_factor).map(Some)
}

impl ProposalTarget for InterpolationTrace {
    fn len(&self) -> usize {
        self.choices.len()
    }

    fn choice_at(&self, index: usize) -> Option<&Choice> {
        self.choices.get(index).map(|c| c.as_ref())
    }

    fn find_choice(&self, address: &Address) -> Option<&Choice> {
        self.address_map
            .get(address)
            .map(|&index| self.choices[index].as_ref())
    }

    fn score(&self) -> f64 {
        InterpolationTrace::score(self)
    }

    fn info(&self) -> Option<AcceptanceInfo> {
        self.info
    }

    fn set_info(&mut self, info: Option<AcceptanceInfo>) {
        self.info = info;
    }

    /// Replays each underlying trace that holds the changed choice. The
    /// result is impossible as soon as either side is.
    fn regenerate(
        &self,
        ctx: &mut Context,
        handler: HandlerId,
        index: usize,
        value: Value,
        exit_factor: Option<usize>,
    ) -> Result<Regenerated<Self>> {
        let address = self
            .choices
            .get(index)
            .map(|c| c.address.clone())
            .ok_or(InferenceError::InconsistentTrace("regeneration index"))?;

        let mut reused = std::collections::HashSet::new();
        let mut early_exit = false;
        let mut sides = [self.first.clone(), self.second.clone()];
        for side in sides.iter_mut() {
            match replay_side(ctx, handler, side, &address, &value, exit_factor)? {
                None => {}
                Some(Regenerated::Impossible) => return Ok(Regenerated::Impossible),
                Some(Regenerated::Replayed {
                    target,
                    reused: side_reused,
                    early_exit: side_exit,
                }) => {
                    *side = Rc::new(target);
                    reused.extend(side_reused);
                    early_exit |= side_exit;
                }
            }
        }
        let [first, second] = sides;
        Ok(Regenerated::Replayed {
            target: InterpolationTrace::from_parts(first, second, self.alpha, self.info),
            reused,
            early_exit,
        })
    }
}

impl fmt::Debug for InterpolationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpolationTrace")
            .field("alpha", &self.alpha)
            .field("addresses", &self.addresses())
            .field("score", &self.score())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::initialize,
        context::HandlerKind,
        dist,
        kernel::Kernel,
        mh::{MhKernel, MhOptions, SiteFilter},
        program::{test_programs::switching_mean, Continuation, Program, Step},
        value::Store,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn trace_with(names: &[&str], x: f64) -> Trace {
        let program = Program::new(|store, _| Step::exit(store, Value::Unit));
        let mut trace = Trace::new(program, Store::new(), Address::root());
        let k: Continuation = Rc::new(|store, value| Step::exit(store, value));
        for name in names {
            trace.add_choice(
                dist::gaussian(),
                Rc::from([Value::Real(0.), Value::Real(1.)]),
                Value::Real(x),
                Address::new(name),
                Store::new(),
                k.clone(),
            );
        }
        trace
    }

    fn names(addresses: Vec<Address>) -> Vec<String> {
        addresses.iter().map(|a| a.as_str().to_string()).collect()
    }

    #[test]
    fn merge_keeps_source_order() {
        let first = trace_with(&["a", "b", "c"], 0.);
        let second = trace_with(&["a", "d", "c", "e"], 0.);
        let interp = InterpolationTrace::new(first, second, 0.);
        assert_eq!(names(interp.addresses()), ["a", "b", "d", "c", "e"]);
        assert_eq!(ProposalTarget::len(&interp), 5);
    }

    #[test]
    fn score_is_convex_combination() {
        let first = trace_with(&["a"], 0.);
        let second = trace_with(&["a", "b"], 1.);
        let (s1, s2) = (first.score, second.score);
        let mut interp = InterpolationTrace::new(first, second, 0.);
        assert_eq!(interp.score(), s1);
        interp.set_alpha(0.25);
        assert_abs_diff_eq!(interp.score(), 0.75 * s1 + 0.25 * s2, epsilon = 1e-12);
        interp.set_alpha(1.);
        assert_eq!(interp.score(), s2);
    }

    #[test]
    fn values_propagate_to_both_sides() -> Result<()> {
        let mut interp =
            InterpolationTrace::new(trace_with(&["a", "b"], 0.), trace_with(&["b", "c"], 0.), 0.5);
        let b = Address::new("b");
        interp.set_choice_value(&b, Value::Real(2.))?;
        assert_eq!(interp.first().find_choice(&b).unwrap().value, Value::Real(2.));
        assert_eq!(interp.second().find_choice(&b).unwrap().value, Value::Real(2.));
        assert!(matches!(
            interp.set_choice_value(&Address::new("z"), Value::Unit),
            Err(InferenceError::MissingChoice(_))
        ));
        Ok(())
    }

    #[test]
    fn diffusion_moves_shared_choices_together() -> Result<()> {
        let mut ctx = Context::seed_from_u64(11);
        let old = initialize(&mut ctx, &switching_mean(), Store::new(), Address::root(), 10)?;
        let flipped = Value::Bool(!old.value().is_some_and(Value::is_true));
        let new = ctx.with_handler(HandlerKind::Mh, |ctx, handler| {
            match replay(ctx, handler, &old, 0, flipped, None)? {
                Regenerated::Replayed { target, .. } => Ok(target),
                Regenerated::Impossible => panic!("a Gaussian choice cannot be impossible"),
            }
        })?;

        let mut interp = InterpolationTrace::new(old, new, 0.5);
        let before = interp.addresses();
        let mut diffusion = MhKernel::new(MhOptions {
            filter: SiteFilter::ContinuousOnly,
            permissive: true,
            ..Default::default()
        });
        for _ in 0..20 {
            interp = diffusion.transition(&mut ctx, interp)?;
        }
        assert_eq!(interp.addresses(), before);
        let x = Address::root().child("x");
        assert_eq!(
            interp.first().find_choice(&x).unwrap().value,
            interp.second().find_choice(&x).unwrap().value
        );
        let (first, second) = interp.into_parts();
        assert_ne!(first.value(), second.value());
        Ok(())
    }
}
