//! Execution traces: the record of every random choice a program made,
//! enough to replay the program from any of them.

use std::{collections::HashMap, fmt, rc::Rc};

use itertools::Itertools;

use crate::{
    dist::{Distribution, Params},
    error::{InferenceError, Result},
    program::{Continuation, Program, Step},
    value::{Address, Store, Value},
};

/// One recorded random choice.
///
/// Choices are never modified once recorded. Changing the value of a
/// choice replaces the record at the same index.
#[derive(Clone)]
pub struct Choice {
    pub address: Address,
    pub dist: Rc<dyn Distribution>,
    pub params: Params,
    pub value: Value,
    /// The program store as it was when the choice was made.
    pub store: Store,
    pub k: Continuation,
    /// Trace score before this choice was scored.
    pub score: f64,
    /// Number of factors seen before this choice.
    pub num_factors: usize,
    pub index: usize,
}

impl Choice {
    /// The score this choice contributes to its trace.
    pub fn log_prob(&self) -> f64 {
        self.dist.score(&self.params, &self.value)
    }

    pub fn is_continuous(&self) -> bool {
        self.dist.is_continuous()
    }

    /// Continue the program right after this choice.
    pub fn resume(&self) -> Step {
        (self.k)(self.store.clone(), self.value.clone())
    }
}

impl fmt::Debug for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Choice")
            .field("address", &self.address)
            .field("dist", &self.dist)
            .field("params", &self.params)
            .field("value", &self.value)
            .field("score", &self.score)
            .field("num_factors", &self.num_factors)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum ResumePoint {
    /// Run the program from its initial store.
    Start,
    /// Continue after the last recorded choice.
    LastChoice,
    Saved { store: Store, k: Continuation },
}

#[derive(Clone)]
enum TraceState {
    Suspended(ResumePoint),
    Complete(Value),
}

/// Running tally of MH decisions carried along a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptanceInfo {
    pub accepted: u64,
    pub total: u64,
}

impl AcceptanceInfo {
    pub fn record(self, accepted: bool) -> Self {
        AcceptanceInfo {
            accepted: self.accepted + accepted as u64,
            total: self.total + 1,
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.;
        }
        self.accepted as f64 / self.total as f64
    }
}

/// An ordered record of the choices of one (partial) program execution.
#[derive(Clone)]
pub struct Trace {
    program: Program,
    initial_store: Store,
    base_address: Address,
    choices: Vec<Rc<Choice>>,
    address_map: HashMap<Address, usize>,
    pub score: f64,
    pub num_factors: usize,
    state: TraceState,
    pub info: Option<AcceptanceInfo>,
}

impl Trace {
    pub fn new(program: Program, initial_store: Store, base_address: Address) -> Self {
        Trace {
            program,
            initial_store,
            base_address,
            choices: Vec::new(),
            address_map: HashMap::new(),
            score: 0.,
            num_factors: 0,
            state: TraceState::Suspended(ResumePoint::Start),
            info: None,
        }
    }

    /// An empty trace of the same program.
    pub fn fresh(&self) -> Self {
        Trace::new(
            self.program.clone(),
            self.initial_store.clone(),
            self.base_address.clone(),
        )
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    pub fn choices(&self) -> impl Iterator<Item = &Choice> + '_ {
        self.choices.iter().map(|c| c.as_ref())
    }

    pub fn choice_at(&self, index: usize) -> Option<&Choice> {
        self.choices.get(index).map(|c| c.as_ref())
    }

    pub fn find_choice(&self, address: &Address) -> Option<&Choice> {
        self.address_map
            .get(address)
            .map(|&index| self.choices[index].as_ref())
    }

    pub(crate) fn choice_records(&self) -> &[Rc<Choice>] {
        &self.choices
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.choices.iter().map(|c| c.address.clone()).collect()
    }

    /// Record a choice and add its score.
    ///
    /// The address must not already be part of the trace.
    pub fn add_choice(
        &mut self,
        dist: Rc<dyn Distribution>,
        params: Params,
        value: Value,
        address: Address,
        store: Store,
        k: Continuation,
    ) {
        debug_assert!(!self.address_map.contains_key(&address));
        let choice = Choice {
            address,
            dist,
            params,
            value,
            store,
            k,
            score: self.score,
            num_factors: self.num_factors,
            index: self.choices.len(),
        };
        self.score += choice.log_prob();
        self.address_map.insert(choice.address.clone(), choice.index);
        self.choices.push(Rc::new(choice));
    }

    pub fn add_factor(&mut self, score: f64) {
        self.num_factors += 1;
        self.score += score;
    }

    /// Replace the value of the choice at `address`.
    ///
    /// The score becomes the score before that choice plus the new value's
    /// score. Later choices are left untouched and only rescored when the
    /// program is replayed past them.
    pub fn set_choice_value(&mut self, address: &Address, value: Value) -> Result<()> {
        let &index = self
            .address_map
            .get(address)
            .ok_or_else(|| InferenceError::MissingChoice(address.clone()))?;
        let old = &self.choices[index];
        let choice = Choice {
            value,
            ..Choice::clone(old)
        };
        self.score = choice.score + choice.log_prob();
        self.choices[index] = Rc::new(choice);
        Ok(())
    }

    /// A new trace holding the choices before `index`, with score and
    /// factor count as they were right before that choice.
    pub fn upto(&self, index: usize) -> Trace {
        assert!(index < self.len());
        let mut trace = self.fresh();
        trace.choices = self.choices[..index].to_vec();
        trace.address_map = trace
            .choices
            .iter()
            .map(|c| (c.address.clone(), c.index))
            .collect();
        trace.score = self.choices[index].score;
        trace.num_factors = self.choices[index].num_factors;
        trace
    }

    pub fn upto_and_including(&self, index: usize) -> Trace {
        let mut trace = self.upto(index);
        let c = &self.choices[index];
        trace.add_choice(
            c.dist.clone(),
            c.params.clone(),
            c.value.clone(),
            c.address.clone(),
            c.store.clone(),
            c.k.clone(),
        );
        trace
    }

    pub fn save_continuation(&mut self, store: Store, k: Continuation) {
        self.state = TraceState::Suspended(ResumePoint::Saved { store, k });
    }

    /// Resume from the last recorded choice, using its current value.
    pub fn resume_after_last_choice(&mut self) {
        self.state = TraceState::Suspended(ResumePoint::LastChoice);
    }

    /// Continue the suspended program.
    ///
    /// Without a saved continuation the program runs from its beginning.
    pub fn continue_(&self) -> Result<Step> {
        let resume = match &self.state {
            TraceState::Complete(_) => return Err(InferenceError::TraceAlreadyComplete),
            TraceState::Suspended(resume) => resume,
        };
        let step = match (resume, self.choices.last()) {
            (ResumePoint::Saved { store, k }, _) => k(store.clone(), Value::Unit),
            (ResumePoint::LastChoice, Some(last)) => last.resume(),
            (ResumePoint::LastChoice, None) | (ResumePoint::Start, _) => self
                .program
                .start(self.initial_store.clone(), self.base_address.clone()),
        };
        Ok(step)
    }

    pub fn complete(&mut self, value: Value) -> Result<()> {
        if self.is_complete() {
            return Err(InferenceError::TraceAlreadyComplete);
        }
        self.state = TraceState::Complete(value);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, TraceState::Complete(_))
    }

    /// The return value of a completed trace.
    pub fn value(&self) -> Option<&Value> {
        match &self.state {
            TraceState::Complete(value) => Some(value),
            TraceState::Suspended(_) => None,
        }
    }

    /// Whether both traces hold the very same choice records.
    pub fn same_choices(&self, other: &Trace) -> bool {
        self.choices.len() == other.choices.len()
            && self
                .choices
                .iter()
                .zip(&other.choices)
                .all(|(a, b)| Rc::ptr_eq(a, b))
    }

    pub fn check_consistency(&self) -> Result<()> {
        let broken = |what| Err(InferenceError::InconsistentTrace(what));
        if self.address_map.len() != self.choices.len() {
            return broken("address index and choice list differ in length");
        }
        for (i, choice) in self.choices.iter().enumerate() {
            if choice.index != i {
                return broken("choice index out of place");
            }
            if self.address_map.get(&choice.address) != Some(&i) {
                return broken("address index does not point at its choice");
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let choices = self
            .choices
            .iter()
            .map(|c| format!("{}={}", c.address, c.value))
            .join(", ");
        f.debug_struct("Trace")
            .field("choices", &choices)
            .field("score", &self.score)
            .field("num_factors", &self.num_factors)
            .field("value", &self.value())
            .field("info", &self.info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn exit_k() -> Continuation {
        Rc::new(|store, value| Step::exit(store, value))
    }

    fn empty_trace() -> Trace {
        let program = Program::new(|store, _| Step::exit(store, Value::Unit));
        Trace::new(program, Store::new(), Address::root())
    }

    fn coin_value(heads: bool) -> (Rc<dyn Distribution>, Params, Value) {
        (dist::bernoulli(), Rc::from([Value::Real(0.3)]), Value::Bool(heads))
    }

    fn gaussian_value(x: f64) -> (Rc<dyn Distribution>, Params, Value) {
        (
            dist::gaussian(),
            Rc::from([Value::Real(0.), Value::Real(2.)]),
            Value::Real(x),
        )
    }

    /// Interleave choices and factors, returning the trace and the factor total.
    fn build(entries: &[(bool, f64, Option<f64>)]) -> (Trace, f64) {
        let mut trace = empty_trace();
        let mut factors = 0.;
        for (i, &(is_coin, x, factor)) in entries.iter().enumerate() {
            let (d, p, v) = if is_coin {
                coin_value(x > 0.)
            } else {
                gaussian_value(x)
            };
            trace.add_choice(d, p, v, Address::root().child(i), Store::new(), exit_k());
            if let Some(score) = factor {
                trace.add_factor(score);
                factors += score;
            }
        }
        (trace, factors)
    }

    proptest! {
        #[test]
        fn score_is_sum_of_contributions(
            entries in prop::collection::vec(
                (any::<bool>(), -3f64..3f64, prop::option::of(-2f64..0f64)),
                1..12,
            )
        ) {
            let (trace, factors) = build(&entries);
            let choices: f64 = trace.choices().map(Choice::log_prob).sum();
            prop_assert!((trace.score - (choices + factors)).abs() < 1e-9);
            prop_assert!(trace.check_consistency().is_ok());
        }

        #[test]
        fn upto_then_add_reproduces_upto_and_including(
            entries in prop::collection::vec(
                (any::<bool>(), -3f64..3f64, prop::option::of(-2f64..0f64)),
                1..12,
            ),
            pick in any::<prop::sample::Index>(),
        ) {
            let (trace, _) = build(&entries);
            let i = pick.index(trace.len());
            let c = trace.choice_at(i).unwrap();
            let mut rebuilt = trace.upto(i);
            rebuilt.add_choice(
                c.dist.clone(),
                c.params.clone(),
                c.value.clone(),
                c.address.clone(),
                c.store.clone(),
                c.k.clone(),
            );
            let including = trace.upto_and_including(i);
            prop_assert_eq!(rebuilt.addresses(), including.addresses());
            prop_assert_eq!(rebuilt.score, including.score);
            prop_assert_eq!(rebuilt.num_factors, including.num_factors);
            prop_assert!(rebuilt.check_consistency().is_ok());
        }
    }

    #[test]
    fn upto_shares_prefix_records() {
        let (trace, _) = build(&[(true, 1., Some(-0.5)), (false, 0.2, None), (true, -1., None)]);
        let prefix = trace.upto(2);
        assert_eq!(prefix.len(), 2);
        assert!(prefix
            .choice_records()
            .iter()
            .zip(trace.choice_records())
            .all(|(a, b)| Rc::ptr_eq(a, b)));
        assert_eq!(prefix.score, trace.choice_at(2).unwrap().score);
        assert_eq!(prefix.num_factors, 1);
    }

    #[test]
    fn set_choice_value_rescores_from_prefix() -> Result<()> {
        let (mut trace, _) = build(&[(true, 1., Some(-0.5)), (false, 0.2, None)]);
        let address = Address::root().child(1);
        let before = trace.choice_at(1).unwrap().score;
        let original = trace.clone();
        trace.set_choice_value(&address, Value::Real(1.5))?;

        let params = [Value::Real(0.), Value::Real(2.)];
        let expected = before + dist::gaussian().score(&params, &Value::Real(1.5));
        assert_abs_diff_eq!(trace.score, expected, epsilon = 1e-12);
        assert_eq!(trace.find_choice(&address).unwrap().value, Value::Real(1.5));
        // The original trace still sees the old record.
        assert_eq!(original.find_choice(&address).unwrap().value, Value::Real(0.2));
        assert!(matches!(
            trace.set_choice_value(&Address::new("missing"), Value::Unit),
            Err(InferenceError::MissingChoice(_))
        ));
        Ok(())
    }

    #[test]
    fn completes_exactly_once() -> Result<()> {
        let mut trace = empty_trace();
        assert!(!trace.is_complete());
        let Step::Exit { value, .. } = trace.continue_()? else {
            panic!("program should exit immediately");
        };
        trace.complete(value)?;
        assert!(trace.is_complete());
        assert_eq!(trace.value(), Some(&Value::Unit));
        assert!(matches!(
            trace.complete(Value::Unit),
            Err(InferenceError::TraceAlreadyComplete)
        ));
        assert!(matches!(
            trace.continue_(),
            Err(InferenceError::TraceAlreadyComplete)
        ));
        Ok(())
    }

    #[test]
    fn continue_from_saved_continuation() -> Result<()> {
        let mut trace = empty_trace();
        let k: Continuation = Rc::new(|store, _| Step::exit(store, Value::Int(7)));
        trace.save_continuation(Store::new(), k);
        match trace.continue_()? {
            Step::Exit { value, .. } => assert_eq!(value, Value::Int(7)),
            step => panic!("unexpected {step:?}"),
        }
        Ok(())
    }

    #[test]
    fn acceptance_info() {
        let info = AcceptanceInfo::default().record(true).record(false);
        assert_eq!(info, AcceptanceInfo { accepted: 1, total: 2 });
        assert_abs_diff_eq!(info.ratio(), 0.5);
    }
}
