//! Distributions over random choices.
//!
//! The engine only depends on the [`Distribution`] trait. The concrete
//! distributions below cover what tests and simple models need.

use std::{f64::consts::PI, fmt::Debug, rc::Rc};

use rand::{Rng, RngCore};
use rand_distr::{Distribution as _, Normal};

use crate::value::Value;

/// Positional distribution parameters.
pub type Params = Rc<[Value]>;

/// A distribution a program can sample from.
pub trait Distribution: Debug {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value;

    /// Log density (or log mass) of `value`.
    fn score(&self, params: &[Value], value: &Value) -> f64;

    fn is_continuous(&self) -> bool;

    /// A data-driven proposal used by MH instead of the prior.
    ///
    /// The proposer receives `[List(params), previous_value]` as parameters.
    fn proposer(&self) -> Option<Rc<dyn Distribution>> {
        None
    }

    /// Importance distribution used by the particle filter.
    fn importance(&self) -> Option<Rc<dyn Distribution>> {
        None
    }
}

fn real_param(params: &[Value], i: usize) -> f64 {
    params.get(i).and_then(Value::as_real).unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bernoulli;

impl Distribution for Bernoulli {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        let p = real_param(params, 0);
        Value::Bool(rng.random::<f64>() < p)
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        let p = real_param(params, 0);
        match value.as_bool() {
            Some(true) => p.ln(),
            Some(false) => (1. - p).ln(),
            None => f64::NEG_INFINITY,
        }
    }

    fn is_continuous(&self) -> bool {
        false
    }
}

/// Categorical over the indices of a list of (unnormalized) probabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct Categorical;

impl Categorical {
    fn probs(params: &[Value]) -> Vec<f64> {
        params
            .first()
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_real().unwrap_or(f64::NAN))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Distribution for Categorical {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        let probs = Self::probs(params);
        if probs.is_empty() {
            return Value::Int(0);
        }
        Value::Int(crate::math::multinomial_sample(rng, &probs) as i64)
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        let probs = Self::probs(params);
        let total: f64 = probs.iter().sum();
        match value.as_int() {
            Some(i) if i >= 0 && (i as usize) < probs.len() => (probs[i as usize] / total).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn is_continuous(&self) -> bool {
        false
    }
}

/// Uniform over `0..n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomInteger;

impl Distribution for RandomInteger {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        let n = params.first().and_then(Value::as_int).unwrap_or(0);
        if n <= 0 {
            return Value::Int(0);
        }
        Value::Int(rng.random_range(0..n))
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        let n = params.first().and_then(Value::as_int).unwrap_or(0);
        match value.as_int() {
            Some(i) if i >= 0 && i < n => -(n as f64).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn is_continuous(&self) -> bool {
        false
    }
}

/// Continuous uniform on `[a, b)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl Distribution for Uniform {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        let a = real_param(params, 0);
        let b = real_param(params, 1);
        Value::Real(a + (b - a) * rng.random::<f64>())
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        let a = real_param(params, 0);
        let b = real_param(params, 1);
        match value.as_real() {
            Some(x) if x >= a && x < b => -(b - a).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn is_continuous(&self) -> bool {
        true
    }
}

fn gaussian_log_density(mu: f64, sigma: f64, x: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * (2. * PI).ln()
}

fn gaussian_sample(rng: &mut dyn RngCore, mu: f64, sigma: f64) -> f64 {
    match Normal::new(mu, sigma) {
        Ok(normal) => normal.sample(rng),
        Err(_) => f64::NAN,
    }
}

/// Normal distribution with parameters `[mu, sigma]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gaussian {
    drift_width: Option<f64>,
}

impl Gaussian {
    /// Propose new values by a Gaussian random walk of the given width
    /// instead of resampling from the prior.
    pub fn with_drift(width: f64) -> Self {
        Gaussian {
            drift_width: Some(width),
        }
    }
}

impl Distribution for Gaussian {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        Value::Real(gaussian_sample(
            rng,
            real_param(params, 0),
            real_param(params, 1),
        ))
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        match value.as_real() {
            Some(x) => gaussian_log_density(real_param(params, 0), real_param(params, 1), x),
            None => f64::NEG_INFINITY,
        }
    }

    fn is_continuous(&self) -> bool {
        true
    }

    fn proposer(&self) -> Option<Rc<dyn Distribution>> {
        self.drift_width
            .map(|width| Rc::new(GaussianDrift { width }) as Rc<dyn Distribution>)
    }
}

/// Random walk proposal centered on the previous value.
#[derive(Debug, Clone, Copy)]
pub struct GaussianDrift {
    width: f64,
}

impl Distribution for GaussianDrift {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        let previous = real_param(params, 1);
        Value::Real(gaussian_sample(rng, previous, self.width))
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        let previous = real_param(params, 1);
        match value.as_real() {
            Some(x) => gaussian_log_density(previous, self.width, x),
            None => f64::NEG_INFINITY,
        }
    }

    fn is_continuous(&self) -> bool {
        true
    }
}

/// A distribution that the particle filter samples through an
/// importance distribution.
#[derive(Debug, Clone)]
pub struct WithImportance {
    target: Rc<dyn Distribution>,
    importance: Rc<dyn Distribution>,
}

impl Distribution for WithImportance {
    fn sample(&self, rng: &mut dyn RngCore, params: &[Value]) -> Value {
        self.target.sample(rng, params)
    }

    fn score(&self, params: &[Value], value: &Value) -> f64 {
        self.target.score(params, value)
    }

    fn is_continuous(&self) -> bool {
        self.target.is_continuous()
    }

    fn proposer(&self) -> Option<Rc<dyn Distribution>> {
        self.target.proposer()
    }

    fn importance(&self) -> Option<Rc<dyn Distribution>> {
        Some(self.importance.clone())
    }
}

pub fn bernoulli() -> Rc<dyn Distribution> {
    Rc::new(Bernoulli)
}

pub fn categorical() -> Rc<dyn Distribution> {
    Rc::new(Categorical)
}

pub fn random_integer() -> Rc<dyn Distribution> {
    Rc::new(RandomInteger)
}

pub fn uniform() -> Rc<dyn Distribution> {
    Rc::new(Uniform)
}

pub fn gaussian() -> Rc<dyn Distribution> {
    Rc::new(Gaussian::default())
}

pub fn with_importance(
    target: Rc<dyn Distribution>,
    importance: Rc<dyn Distribution>,
) -> Rc<dyn Distribution> {
    Rc::new(WithImportance { target, importance })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn bernoulli_scores() {
        let params = [Value::Real(0.25)];
        assert_abs_diff_eq!(Bernoulli.score(&params, &Value::Bool(true)), 0.25f64.ln());
        assert_abs_diff_eq!(Bernoulli.score(&params, &Value::Bool(false)), 0.75f64.ln());
        assert_eq!(Bernoulli.score(&params, &Value::Int(1)), f64::NEG_INFINITY);
    }

    #[test]
    fn categorical_normalizes() {
        let params = [Value::List(vec![Value::Real(1.), Value::Real(3.)])];
        assert_abs_diff_eq!(Categorical.score(&params, &Value::Int(1)), 0.75f64.ln());
        assert_eq!(Categorical.score(&params, &Value::Int(2)), f64::NEG_INFINITY);
    }

    #[test]
    fn gaussian_density() {
        let params = [Value::Real(0.), Value::Real(1.)];
        assert_abs_diff_eq!(
            Gaussian::default().score(&params, &Value::Real(0.)),
            -0.5 * (2. * PI).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn drift_proposer_is_symmetric() {
        let gaussian = Gaussian::with_drift(0.5);
        let proposer = gaussian.proposer().expect("drift proposer");
        let params = [Value::Real(0.), Value::Real(1.)];
        let forward = [Value::List(params.to_vec()), Value::Real(1.)];
        let backward = [Value::List(params.to_vec()), Value::Real(1.3)];
        assert_abs_diff_eq!(
            proposer.score(&forward, &Value::Real(1.3)),
            proposer.score(&backward, &Value::Real(1.)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn samples_stay_in_support() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..100 {
            let v = RandomInteger.sample(&mut rng, &[Value::Int(4)]);
            assert!(RandomInteger.score(&[Value::Int(4)], &v).is_finite());
            let u = Uniform.sample(&mut rng, &[Value::Real(-1.), Value::Real(2.)]);
            assert!(Uniform.score(&[Value::Real(-1.), Value::Real(2.)], &u).is_finite());
        }
    }
}
