//! The suspend/resume executor contract.
//!
//! A program never calls into an inference algorithm. Instead every random
//! choice, factor statement and the final return hands a [`Step`] back to
//! whichever handler is driving it, together with a continuation that can
//! be invoked any number of times.

use std::{fmt, rc::Rc};

use crate::{
    context::{Context, HandlerKind},
    dist::{Distribution, Params},
    error::{InferenceError, Result},
    value::{Address, Store, Value},
};

/// A resumable rest-of-program.
pub type Continuation = Rc<dyn Fn(Store, Value) -> Step>;

/// What a program asks of the active handler.
pub enum Step {
    Sample {
        store: Store,
        k: Continuation,
        address: Address,
        dist: Rc<dyn Distribution>,
        params: Params,
    },
    Factor {
        store: Store,
        k: Continuation,
        address: Address,
        score: f64,
    },
    Exit {
        store: Store,
        value: Value,
    },
}

impl Step {
    pub fn sample(
        store: Store,
        address: Address,
        dist: Rc<dyn Distribution>,
        params: impl Into<Params>,
        k: impl Fn(Store, Value) -> Step + 'static,
    ) -> Step {
        Step::Sample {
            store,
            k: Rc::new(k),
            address,
            dist,
            params: params.into(),
        }
    }

    pub fn factor(
        store: Store,
        address: Address,
        score: f64,
        k: impl Fn(Store) -> Step + 'static,
    ) -> Step {
        Step::Factor {
            store,
            k: Rc::new(move |store, _| k(store)),
            address,
            score,
        }
    }

    pub fn exit(store: Store, value: impl Into<Value>) -> Step {
        Step::Exit {
            store,
            value: value.into(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Sample {
                address, params, ..
            } => f
                .debug_struct("Sample")
                .field("address", address)
                .field("params", params)
                .finish_non_exhaustive(),
            Step::Factor { address, score, .. } => f
                .debug_struct("Factor")
                .field("address", address)
                .field("score", score)
                .finish_non_exhaustive(),
            Step::Exit { value, .. } => f.debug_struct("Exit").field("value", value).finish(),
        }
    }
}

/// A program in suspend/resume form.
#[derive(Clone)]
pub struct Program(Rc<dyn Fn(Store, Address) -> Step>);

impl Program {
    pub fn new(f: impl Fn(Store, Address) -> Step + 'static) -> Self {
        Program(Rc::new(f))
    }

    /// Run the program from its beginning up to its first suspension.
    pub fn start(&self, store: Store, address: Address) -> Step {
        (self.0)(store, address)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Program")
    }
}

pub(crate) fn check_factor(address: &Address, score: f64) -> Result<()> {
    if score.is_nan() {
        return Err(InferenceError::NanFactor(address.clone()));
    }
    Ok(())
}

/// Run a program outside of inference, drawing every choice from its prior.
///
/// Factor statements are not allowed here.
pub fn sample_prior(
    ctx: &mut Context,
    program: &Program,
    store: Store,
    address: Address,
) -> Result<Value> {
    ctx.with_handler(HandlerKind::Prior, |ctx, handler| {
        let mut step = program.start(store, address);
        loop {
            ctx.handlers().ensure_active(handler)?;
            step = match step {
                Step::Sample {
                    store,
                    k,
                    dist,
                    params,
                    ..
                } => {
                    let value = dist.sample(ctx.rng(), &params);
                    k(store, value)
                }
                Step::Factor { address, score, .. } => {
                    check_factor(&address, score)?;
                    return Err(InferenceError::FactorOutsideInference(address));
                }
                Step::Exit { value, .. } => return Ok(value),
            };
        }
    })
}
