//! The explicit inference context: randomness and the active-handler stack.
//!
//! Exactly one handler interprets the steps of a running program at any
//! time. Kernels that delegate to other kernels nest their handlers, and
//! the stack makes sure they unwind in reverse order.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{InferenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Prior,
    Initialize,
    Mh,
    Larj,
    ParticleFilter,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::Prior => "prior",
            HandlerKind::Initialize => "initialize",
            HandlerKind::Mh => "MH",
            HandlerKind::Larj => "LARJ",
            HandlerKind::ParticleFilter => "particle filter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    id: u64,
    kind: HandlerKind,
}

impl HandlerId {
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[derive(Debug, Default)]
pub struct HandlerStack {
    active: Vec<HandlerId>,
    next_id: u64,
}

impl HandlerStack {
    pub fn current(&self) -> Option<HandlerId> {
        self.active.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.active.len()
    }

    fn push(&mut self, kind: HandlerKind) -> HandlerId {
        let handler = HandlerId {
            id: self.next_id,
            kind,
        };
        self.next_id += 1;
        self.active.push(handler);
        handler
    }

    fn pop(&mut self, handler: HandlerId) -> Result<()> {
        match self.active.last() {
            Some(&top) if top == handler => {
                self.active.pop();
                Ok(())
            }
            found => {
                let found = found.copied();
                // Unwind past the handler anyway so outer handlers can recover.
                if let Some(pos) = self.active.iter().rposition(|&h| h == handler) {
                    self.active.truncate(pos);
                }
                Err(InferenceError::HandlerOwnership {
                    expected: handler,
                    found,
                })
            }
        }
    }

    /// Fails unless `handler` is the one currently in control.
    pub fn ensure_active(&self, handler: HandlerId) -> Result<()> {
        match self.current() {
            Some(top) if top == handler => Ok(()),
            found => Err(InferenceError::HandlerOwnership {
                expected: handler,
                found,
            }),
        }
    }
}

/// Everything an inference run threads through its kernels.
#[derive(Debug)]
pub struct Context {
    rng: ChaCha8Rng,
    handlers: HandlerStack,
    halted: bool,
}

impl Context {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self::from_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn from_rng(rng: ChaCha8Rng) -> Self {
        Context {
            rng,
            handlers: HandlerStack::default(),
            halted: false,
        }
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// A uniform draw from `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    pub fn handlers(&self) -> &HandlerStack {
        &self.handlers
    }

    /// Run `f` with a new handler of the given kind installed.
    ///
    /// The handler is removed again on every exit path of `f`, including
    /// errors. If `f` leaves another handler on top of the stack the
    /// ownership error takes precedence over a successful result.
    pub fn with_handler<T>(
        &mut self,
        kind: HandlerKind,
        f: impl FnOnce(&mut Self, HandlerId) -> Result<T>,
    ) -> Result<T> {
        let handler = self.handlers.push(kind);
        let result = f(self, handler);
        let restored = self.handlers.pop(handler);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    /// Ask the surrounding combinators to stop early.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Clear a pending halt request, returning whether one was set.
    pub fn take_halt(&mut self) -> bool {
        std::mem::replace(&mut self.halted, false)
    }
}
