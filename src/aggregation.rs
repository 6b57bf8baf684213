//! Turning the values a chain or filter produces into a distribution.

use std::{collections::HashMap, time::Duration};

use rand::Rng;

use crate::{math::multinomial_sample, value::Value};

/// One value collected by a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: Value,
    pub score: f64,
    pub elapsed: Duration,
}

/// A normalized empirical distribution over return values.
#[derive(Debug, Clone, Default)]
pub struct Marginal {
    support: Vec<Value>,
    probs: Vec<f64>,
    index: HashMap<Value, usize>,
    normalization_constant: Option<f64>,
    samples: Vec<Sample>,
}

impl Marginal {
    /// Build from unnormalized masses. Repeated values are merged and the
    /// support keeps the order in which values first appear.
    pub fn from_weights(entries: impl IntoIterator<Item = (Value, f64)>) -> Self {
        let mut marginal = Marginal::default();
        for (value, weight) in entries {
            match marginal.index.get(&value) {
                Some(&i) => marginal.probs[i] += weight,
                None => {
                    marginal.index.insert(value.clone(), marginal.support.len());
                    marginal.support.push(value);
                    marginal.probs.push(weight);
                }
            }
        }
        let total: f64 = marginal.probs.iter().sum();
        if total > 0. {
            marginal.probs.iter_mut().for_each(|p| *p /= total);
        }
        marginal
    }

    pub fn with_normalization_constant(mut self, log_z: f64) -> Self {
        self.normalization_constant = Some(log_z);
        self
    }

    pub fn with_samples(mut self, samples: Vec<Sample>) -> Self {
        self.samples = samples;
        self
    }

    pub fn len(&self) -> usize {
        self.support.len()
    }

    pub fn is_empty(&self) -> bool {
        self.support.is_empty()
    }

    pub fn support(&self) -> &[Value] {
        &self.support
    }

    pub fn probability(&self, value: &Value) -> f64 {
        self.index.get(value).map_or(0., |&i| self.probs[i])
    }

    pub fn log_probability(&self, value: &Value) -> f64 {
        self.probability(value).ln()
    }

    pub fn expectation(&self, f: impl Fn(&Value) -> f64) -> f64 {
        self.support
            .iter()
            .zip(&self.probs)
            .map(|(value, p)| p * f(value))
            .sum()
    }

    /// Draw a value. `None` for an empty distribution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Value> {
        if self.is_empty() {
            return None;
        }
        Some(&self.support[multinomial_sample(rng, &self.probs)])
    }

    /// Estimated log normalization constant, if the producer computed one.
    pub fn normalization_constant(&self) -> Option<f64> {
        self.normalization_constant
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Collects values as a chain produces them.
pub trait Aggregator {
    fn add(&mut self, value: &Value, score: f64, elapsed: Duration);

    fn to_marginal(&self) -> Marginal;
}

/// Counts every collected value.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    counts: Vec<(Value, u64)>,
    index: HashMap<Value, usize>,
}

impl Histogram {
    pub fn count(&self, value: &Value) -> u64 {
        self.index.get(value).map_or(0, |&i| self.counts[i].1)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, c)| c).sum()
    }
}

impl Aggregator for Histogram {
    fn add(&mut self, value: &Value, _score: f64, _elapsed: Duration) {
        match self.index.get(value) {
            Some(&i) => self.counts[i].1 += 1,
            None => {
                self.index.insert(value.clone(), self.counts.len());
                self.counts.push((value.clone(), 1));
            }
        }
    }

    fn to_marginal(&self) -> Marginal {
        Marginal::from_weights(self.counts.iter().map(|(v, c)| (v.clone(), *c as f64)))
    }
}

/// Keeps the highest scoring value seen.
#[derive(Debug, Clone, Default)]
pub struct MaxAPosteriori {
    retain: bool,
    best: Option<(Value, f64)>,
    samples: Vec<Sample>,
}

impl MaxAPosteriori {
    /// With `retain`, every collected sample is kept as well.
    pub fn new(retain: bool) -> Self {
        MaxAPosteriori {
            retain,
            ..Default::default()
        }
    }

    pub fn best(&self) -> Option<(&Value, f64)> {
        self.best.as_ref().map(|(v, s)| (v, *s))
    }
}

impl Aggregator for MaxAPosteriori {
    fn add(&mut self, value: &Value, score: f64, elapsed: Duration) {
        if self.best.as_ref().is_none_or(|(_, best)| score > *best) {
            self.best = Some((value.clone(), score));
        }
        if self.retain {
            self.samples.push(Sample {
                value: value.clone(),
                score,
                elapsed,
            });
        }
    }

    fn to_marginal(&self) -> Marginal {
        let marginal = Marginal::from_weights(self.best.iter().map(|(v, _)| (v.clone(), 1.)));
        marginal.with_samples(self.samples.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn histogram_normalizes_counts() {
        let mut hist = Histogram::default();
        for v in [1, 2, 1, 1] {
            hist.add(&Value::Int(v), 0., Duration::ZERO);
        }
        assert_eq!(hist.count(&Value::Int(1)), 3);
        assert_eq!(hist.total(), 4);
        let marginal = hist.to_marginal();
        assert_eq!(marginal.support(), &[Value::Int(1), Value::Int(2)]);
        assert_abs_diff_eq!(marginal.probability(&Value::Int(1)), 0.75);
        assert_eq!(marginal.log_probability(&Value::Int(3)), f64::NEG_INFINITY);
        assert_abs_diff_eq!(
            marginal.expectation(|v| v.as_real().unwrap_or(0.)),
            1.25,
            epsilon = 1e-12
        );
    }

    #[test]
    fn map_keeps_highest_score() {
        let mut map = MaxAPosteriori::new(true);
        map.add(&Value::Bool(false), -2., Duration::ZERO);
        map.add(&Value::Bool(true), -0.5, Duration::ZERO);
        map.add(&Value::Bool(false), -1., Duration::ZERO);
        assert_eq!(map.best(), Some((&Value::Bool(true), -0.5)));
        let marginal = map.to_marginal();
        assert_eq!(marginal.probability(&Value::Bool(true)), 1.);
        assert_eq!(marginal.samples().len(), 3);
    }

    #[test]
    fn sampling_follows_probabilities() {
        let marginal = Marginal::from_weights([(Value::Int(0), 1.), (Value::Int(1), 0.)]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..20 {
            assert_eq!(marginal.sample(&mut rng), Some(&Value::Int(0)));
        }
        assert_eq!(Marginal::default().sample(&mut rng), None);
    }
}
