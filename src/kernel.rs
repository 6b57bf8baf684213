//! The kernel abstraction and the combinators that assemble kernels into
//! chains.

use std::{marker::PhantomData, str::FromStr};

use crate::{
    context::Context,
    error::{InferenceError, Result},
    larj::{LarjKernel, LarjOptions},
    mh::{MhKernel, MhOptions},
    trace::Trace,
};

/// A transition from one state of a chain to the next.
pub trait Kernel<T> {
    fn transition(&mut self, ctx: &mut Context, state: T) -> Result<T>;
}

impl<T, K: Kernel<T> + ?Sized> Kernel<T> for Box<K> {
    fn transition(&mut self, ctx: &mut Context, state: T) -> Result<T> {
        (**self).transition(ctx, state)
    }
}

impl<T, K: Kernel<T> + ?Sized> Kernel<T> for &mut K {
    fn transition(&mut self, ctx: &mut Context, state: T) -> Result<T> {
        (**self).transition(ctx, state)
    }
}

/// Runs a callback on the state and passes it through unchanged.
pub struct Tap<F, T> {
    f: F,
    _state: PhantomData<fn(&T)>,
}

pub fn tap<F, T>(f: F) -> Tap<F, T>
where
    F: FnMut(&mut Context, &T) -> Result<()>,
{
    Tap {
        f,
        _state: PhantomData,
    }
}

impl<F, T> Kernel<T> for Tap<F, T>
where
    F: FnMut(&mut Context, &T) -> Result<()>,
{
    fn transition(&mut self, ctx: &mut Context, state: T) -> Result<T> {
        (self.f)(ctx, &state)?;
        Ok(state)
    }
}

/// Feeds the output of the first kernel into the second.
///
/// The second kernel is skipped once the context has been halted.
#[derive(Debug, Clone)]
pub struct Sequence<A, B> {
    first: A,
    second: B,
}

pub fn sequence<A, B>(first: A, second: B) -> Sequence<A, B> {
    Sequence { first, second }
}

impl<T, A: Kernel<T>, B: Kernel<T>> Kernel<T> for Sequence<A, B> {
    fn transition(&mut self, ctx: &mut Context, state: T) -> Result<T> {
        let state = self.first.transition(ctx, state)?;
        if ctx.is_halted() {
            return Ok(state);
        }
        self.second.transition(ctx, state)
    }
}

/// Right-associative [`sequence`] of any number of kernels.
#[macro_export]
macro_rules! sequence {
    ($kernel:expr $(,)?) => {
        $kernel
    };
    ($kernel:expr, $($rest:expr),+ $(,)?) => {
        $crate::kernel::sequence($kernel, $crate::sequence!($($rest),+))
    };
}

/// Applies a kernel `n` times to its own output.
#[derive(Debug, Clone)]
pub struct Repeat<K> {
    times: usize,
    kernel: K,
}

pub fn repeat<K>(times: usize, kernel: K) -> Repeat<K> {
    Repeat { times, kernel }
}

impl<T, K: Kernel<T>> Kernel<T> for Repeat<K> {
    fn transition(&mut self, ctx: &mut Context, mut state: T) -> Result<T> {
        for _ in 0..self.times {
            if ctx.is_halted() {
                break;
            }
            state = self.kernel.transition(ctx, state)?;
        }
        Ok(state)
    }
}

/// A kernel chosen by name, with its options.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelConfig {
    Mh(MhOptions),
    Larj(LarjOptions),
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::Mh(MhOptions::default())
    }
}

impl FromStr for KernelConfig {
    type Err = InferenceError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MH" => Ok(KernelConfig::Mh(MhOptions::default())),
            "LARJ" => Ok(KernelConfig::Larj(LarjOptions::default())),
            _ => Err(InferenceError::UnknownKernel(name.to_string())),
        }
    }
}

impl KernelConfig {
    /// Validate the options and build the kernel.
    pub fn build(&self) -> Result<Box<dyn Kernel<Trace>>> {
        let kernel: Box<dyn Kernel<Trace>> = match self {
            KernelConfig::Mh(options) => Box::new(MhKernel::new(*options)),
            KernelConfig::Larj(options) => Box::new(LarjKernel::with_mh_diffusion(*options)?),
        };
        Ok(kernel)
    }
}
