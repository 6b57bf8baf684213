use thiserror::Error;

use crate::{context::HandlerId, value::Address};

/// Fatal and configuration errors of the inference engine.
///
/// Statistical rejections never show up here: a proposal that reaches a
/// score of negative infinity is rejected locally by the kernel.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Trace was resumed after it had already completed")]
    TraceAlreadyComplete,
    #[error("Trace has not run to completion")]
    IncompleteTrace,
    #[error("Inconsistent trace: {0}")]
    InconsistentTrace(&'static str),
    #[error("No choice recorded at address {0:?}")]
    MissingChoice(Address),
    #[error("Choice addresses changed during annealing step {step} ({before} choices before, {after} after)")]
    StructureChanged {
        step: usize,
        before: usize,
        after: usize,
    },
    #[error("Handler {expected} should be active but {} is", display_handler(.found))]
    HandlerOwnership {
        expected: HandlerId,
        found: Option<HandlerId>,
    },
    #[error("Factor statement at {0:?} reached outside of inference")]
    FactorOutsideInference(Address),
    #[error("Factor score at {0:?} was NaN")]
    NanFactor(Address),
    #[error("Acceptance probability was NaN")]
    NanAcceptance,
    #[error("MH kernel started from a trace with score -inf")]
    ImpossibleTrace,
    #[error("All particles have weight -inf")]
    AllParticlesImpossible,
    #[error("No initial trace with non-zero probability found after {0} attempts")]
    InitializationFailed(usize),
    #[error("Unknown kernel {0:?}")]
    UnknownKernel(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

fn display_handler(handler: &Option<HandlerId>) -> String {
    match handler {
        Some(handler) => handler.to_string(),
        None => "no handler".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
