//! Declared probability distributions and the draws made from them.
//!
//! Aleatory fields are sampled randomly from their distribution. Epistemic
//! fields are swept: their interval is cut into evenly spaced points and each
//! epistemic index gets exactly one of them (see [`stratified_points`]).

use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Anything that can produce one scalar draw from a random source.
pub trait ScalarSampler {
    fn sample(&self, rng: &mut dyn RngCore) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "lowercase", deny_unknown_fields)]
pub enum Distribution {
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, stdev: f64 },
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Uniform { .. } => "uniform",
            Distribution::Normal { .. } => "normal",
        }
    }

    /// Returns a description of the broken invariant, if any.
    pub fn check(&self) -> Option<String> {
        match *self {
            Distribution::Uniform { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    Some(format!("uniform bounds must be finite (min={}, max={})", min, max))
                } else if min > max {
                    Some(format!("uniform min {} is greater than max {}", min, max))
                } else {
                    None
                }
            }
            Distribution::Normal { mean, stdev } => {
                if !mean.is_finite() || !stdev.is_finite() {
                    Some(format!(
                        "normal parameters must be finite (mean={}, stdev={})",
                        mean, stdev
                    ))
                } else if stdev < 0.0 {
                    Some(format!("normal stdev {} is negative", stdev))
                } else {
                    None
                }
            }
        }
    }
}

impl ScalarSampler for Distribution {
    fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        match *self {
            Distribution::Uniform { min, max } => {
                if min >= max {
                    min
                } else {
                    rng.random_range(min..=max)
                }
            }
            // No clipping: physically implausible draws are passed on as-is.
            Distribution::Normal { mean, stdev } => {
                let z: f64 = rng.sample(StandardNormal);
                mean + stdev * z
            }
        }
    }
}

/// A scalar configuration field: either a fixed value or a declared
/// distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Literal(f64),
    Distributed(Distribution),
}

impl Param {
    pub fn literal(&self) -> Option<f64> {
        match self {
            Param::Literal(v) => Some(*v),
            Param::Distributed(_) => None,
        }
    }

    pub fn distribution(&self) -> Option<&Distribution> {
        match self {
            Param::Literal(_) => None,
            Param::Distributed(d) => Some(d),
        }
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Literal(value)
    }
}

impl From<Distribution> for Param {
    fn from(value: Distribution) -> Self {
        Param::Distributed(value)
    }
}

/// `count` evenly spaced points spanning `[min, max]`. A single point sits
/// at `min`; for more than one point the ends are exactly `min` and `max`.
pub fn stratified_points(min: f64, max: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let last = count - 1;
            let step = (max - min) / last as f64;
            (0..count)
                .map(|i| if i == last { max } else { min + step * i as f64 })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn stratified_points_cover_the_interval() {
        for count in 1..=12 {
            let points = stratified_points(300.0, 350.0, count);
            assert_eq!(points.len(), count);
            assert_eq!(points[0], 300.0);
            if count > 1 {
                assert_eq!(*points.last().unwrap(), 350.0);
            }
            for pair in points.windows(2) {
                assert!(pair[0] < pair[1], "not strictly increasing: {:?}", points);
            }
        }
    }

    #[test]
    fn stratified_points_are_evenly_spaced() {
        let points = stratified_points(0.0, 1.0, 5);
        assert_eq!(points, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn uniform_draws_stay_in_bounds() {
        let dist = Distribution::Uniform { min: 2.0, max: 3.0 };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let v = dist.sample(&mut rng);
            assert!((2.0..=3.0).contains(&v), "out of bounds: {}", v);
        }
    }

    #[test]
    fn degenerate_distributions_return_their_center() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(Distribution::Uniform { min: 5.0, max: 5.0 }.sample(&mut rng), 5.0);
        assert_eq!(Distribution::Normal { mean: 345.15, stdev: 0.0 }.sample(&mut rng), 345.15);
    }

    #[test]
    fn normal_draws_match_declared_moments() {
        let dist = Distribution::Normal { mean: 345.15, stdev: 2.0 };
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let draws: Vec<f64> = (0..n).map(|_| dist.sample(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert!((mean - 345.15).abs() < 0.1, "mean {}", mean);
        assert!((var.sqrt() - 2.0).abs() < 0.1, "stdev {}", var.sqrt());
    }

    #[test]
    fn same_seed_reproduces_the_same_stream() {
        let dist = Distribution::Normal { mean: 0.0, stdev: 1.0 };
        let mut a = StdRng::seed_from_u64(99);
        let mut b = StdRng::seed_from_u64(99);
        let xs: Vec<f64> = (0..10).map(|_| dist.sample(&mut a)).collect();
        let ys: Vec<f64> = (0..10).map(|_| dist.sample(&mut b)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn check_reports_broken_invariants() {
        assert!(Distribution::Uniform { min: 2.0, max: 1.0 }.check().is_some());
        assert!(Distribution::Normal { mean: 0.0, stdev: -1.0 }.check().is_some());
        assert!(Distribution::Normal { mean: f64::NAN, stdev: 1.0 }.check().is_some());
        assert!(Distribution::Uniform { min: 1.0, max: 1.0 }.check().is_none());
    }

    #[test]
    fn params_deserialize_from_literals_and_tagged_maps() {
        let lit: Param = serde_yaml::from_str("300").expect("literal");
        assert_eq!(lit, Param::Literal(300.0));
        let uni: Param =
            serde_yaml::from_str("{distribution: uniform, min: 300, max: 350}").expect("uniform");
        assert_eq!(uni, Param::Distributed(Distribution::Uniform { min: 300.0, max: 350.0 }));
        let norm: Param =
            serde_yaml::from_str("{distribution: normal, mean: 345.15, stdev: 2}").expect("normal");
        assert_eq!(
            norm.distribution(),
            Some(&Distribution::Normal { mean: 345.15, stdev: 2.0 })
        );
        assert!(serde_yaml::from_str::<Param>("{distribution: beta, a: 1}").is_err());
    }

    #[test]
    fn stray_distribution_keys_are_rejected() {
        assert!(serde_yaml::from_str::<Param>("{distribution: normal, mean: 1, stdev: 2, min: 0}")
            .is_err());
        assert!(
            serde_yaml::from_str::<Distribution>("{distribution: uniform, min: 0, max: 1, mean: 0.5}")
                .is_err()
        );
    }
}
