//! Count processors: Laplace-perturbed row count and the exponential
//! mechanism variant with user-tunable asymmetric utility.

use std::collections::HashMap;

use dpq_contracts::meta::DatasetMeta;
use rand::Rng;
use serde_json::Value as Json;

use crate::distributions::sample_laplace;
use crate::{
    check_eps, require_param, ComputationError, ParameterMeta, Processor, ProcessorMeta, ResultMap,
    Row,
};

/// `round(c + Laplace(2/eps))` for a true count `c`.
pub fn noisy_count<R: Rng + ?Sized>(rng: &mut R, eps: f64, count: u64) -> i64 {
    sample_laplace(rng, 2.0 / eps, count as f64).round() as i64
}

pub struct SimpleCount {
    meta: ProcessorMeta,
}

impl SimpleCount {
    pub fn new() -> Self {
        SimpleCount {
            meta: ProcessorMeta {
                name: "simple_count",
                description: "Noisy count of matching rows: a Laplace(2/eps) \
                              deviate is added to the true count and the result \
                              rounded to the nearest integer.",
                parameters: Vec::new(),
            },
        }
    }
}

impl Default for SimpleCount {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for SimpleCount {
    fn meta(&self) -> &ProcessorMeta {
        &self.meta
    }

    fn compute(
        &self,
        eps: f64,
        _params: &HashMap<String, f64>,
        rows: &mut dyn Iterator<Item = Row>,
        _columns: &[String],
        _dataset: &DatasetMeta,
    ) -> Result<ResultMap, ComputationError> {
        check_eps(eps)?;
        let count = rows.count() as u64;
        let mut out = ResultMap::new();
        out.insert(
            "count".to_string(),
            Json::from(noisy_count(&mut rand::thread_rng(), eps, count)),
        );
        Ok(out)
    }
}

/// Shape of the asymmetric utility around the true count.
#[derive(Debug, Clone, Copy)]
pub struct UtilityPrefs {
    pub beta_plus: f64,
    pub beta_minus: f64,
    pub alpha_plus: f64,
    pub alpha_minus: f64,
}

/// Exponential mechanism over candidate counts `r` in `[0, size]`: weights
/// `exp(eta * U(r))` with `U(r) = -beta_plus * (r - c)^alpha_plus` above the
/// true count and `-beta_minus * (c - r)^alpha_minus` below it. `eta` is
/// derived from `eps` and the utility's sensitivity bound.
pub fn preference_count<R: Rng + ?Sized>(
    rng: &mut R,
    eps: f64,
    count: u64,
    size: u64,
    prefs: &UtilityPrefs,
) -> u64 {
    let c = count as f64;
    let n = size as f64;
    let util = |r: f64| -> f64 {
        if r >= c {
            -prefs.beta_plus * (r - c).powf(prefs.alpha_plus)
        } else {
            -prefs.beta_minus * (c - r).powf(prefs.alpha_minus)
        }
    };

    let mut delta = prefs.beta_plus.max(prefs.beta_minus);
    if prefs.alpha_minus > 1.0 {
        delta = delta.max(prefs.alpha_minus * prefs.beta_minus * n.powf(prefs.alpha_minus - 1.0));
    }
    if prefs.alpha_plus > 1.0 {
        delta = delta.max(prefs.alpha_plus * prefs.beta_plus * n.powf(prefs.alpha_plus - 1.0));
    }
    // Zero slopes make the utility identically zero; sample uniformly.
    let eta = if delta > 0.0 { eps / (2.0 * delta) } else { 0.0 };

    let weights: Vec<f64> = (0..=size).map(|r| (eta * util(r as f64)).exp()).collect();
    let total: f64 = weights.iter().sum();
    let threshold = rng.gen::<f64>() * total;

    let mut cumulative = 0.0;
    for (r, w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative >= threshold {
            return r as u64;
        }
    }
    size
}

pub struct UserPrefCount {
    meta: ProcessorMeta,
}

impl UserPrefCount {
    pub fn new() -> Self {
        UserPrefCount {
            meta: ProcessorMeta {
                name: "user_pref_count",
                description: "Perturbed count of matching rows sampled from a \
                              probability mass derived from a utility centered \
                              on the real count. The utility can be asymmetric \
                              around the real count, controlled by the \
                              parameters.",
                parameters: vec![
                    ParameterMeta {
                        name: "beta_plus",
                        default: 1.0,
                        lower: 0.0,
                        upper: 10.0,
                        description: "slope of the utility above the real count",
                    },
                    ParameterMeta {
                        name: "beta_minus",
                        default: 1.0,
                        lower: 0.0,
                        upper: 10.0,
                        description: "slope of the utility below the real count",
                    },
                    ParameterMeta {
                        name: "alpha_plus",
                        default: 1.0,
                        lower: 0.0,
                        upper: 3.0,
                        description: "exponent applied to increases from the real count",
                    },
                    ParameterMeta {
                        name: "alpha_minus",
                        default: 1.0,
                        lower: 0.0,
                        upper: 3.0,
                        description: "exponent applied to decreases from the real count",
                    },
                ],
            },
        }
    }
}

impl Default for UserPrefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for UserPrefCount {
    fn meta(&self) -> &ProcessorMeta {
        &self.meta
    }

    fn compute(
        &self,
        eps: f64,
        params: &HashMap<String, f64>,
        rows: &mut dyn Iterator<Item = Row>,
        _columns: &[String],
        dataset: &DatasetMeta,
    ) -> Result<ResultMap, ComputationError> {
        check_eps(eps)?;
        let prefs = UtilityPrefs {
            beta_plus: require_param(params, "beta_plus")?,
            beta_minus: require_param(params, "beta_minus")?,
            alpha_plus: require_param(params, "alpha_plus")?,
            alpha_minus: require_param(params, "alpha_minus")?,
        };
        let count = rows.count() as u64;
        let sampled = preference_count(&mut rand::thread_rng(), eps, count, dataset.size, &prefs);

        let mut out = ResultMap::new();
        out.insert("count".to_string(), Json::from(sampled));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn default_prefs() -> UtilityPrefs {
        UtilityPrefs {
            beta_plus: 1.0,
            beta_minus: 1.0,
            alpha_plus: 1.0,
            alpha_minus: 1.0,
        }
    }

    #[test]
    fn noisy_count_concentrates_on_the_true_count() {
        let mut rng = StdRng::seed_from_u64(17);
        let trials = 1000;
        let sum: i64 = (0..trials).map(|_| noisy_count(&mut rng, 1.0, 50)).sum();
        let mean = sum as f64 / trials as f64;
        assert!((mean - 50.0).abs() < 1.0, "mean {}", mean);
    }

    #[test]
    fn noisy_count_spread_shrinks_with_larger_eps() {
        let mut rng = StdRng::seed_from_u64(23);
        let spread = |eps: f64, rng: &mut StdRng| -> f64 {
            (0..2000)
                .map(|_| (noisy_count(rng, eps, 100) - 100).abs() as f64)
                .sum::<f64>()
                / 2000.0
        };
        let loose = spread(0.1, &mut rng);
        let tight = spread(10.0, &mut rng);
        assert!(tight < loose, "tight={} loose={}", tight, loose);
    }

    #[test]
    fn preference_count_stays_in_range_and_tracks_the_count() {
        let mut rng = StdRng::seed_from_u64(31);
        let prefs = default_prefs();
        let trials = 500;
        let sum: u64 = (0..trials)
            .map(|_| {
                let r = preference_count(&mut rng, 2.0, 40, 100, &prefs);
                assert!(r <= 100);
                r
            })
            .sum();
        let mean = sum as f64 / trials as f64;
        assert!((mean - 40.0).abs() < 5.0, "mean {}", mean);
    }

    #[test]
    fn asymmetric_slopes_bias_the_sampled_count() {
        let mut rng = StdRng::seed_from_u64(37);
        // Heavy penalty for overshooting pushes the mass below the count.
        let prefs = UtilityPrefs {
            beta_plus: 10.0,
            beta_minus: 0.1,
            alpha_plus: 1.0,
            alpha_minus: 1.0,
        };
        let trials = 500;
        let below = (0..trials)
            .filter(|_| preference_count(&mut rng, 1.0, 50, 100, &prefs) < 50)
            .count();
        assert!(below > trials / 2, "below={}", below);
    }

    #[test]
    fn compute_rejects_an_unresolved_parameter_map() {
        let processor = UserPrefCount::new();
        let dataset = DatasetMeta {
            name: "demo".to_string(),
            size: 100,
            description: String::new(),
            attributes: Vec::new(),
            processors: Vec::new(),
        };
        let err = processor
            .compute(1.0, &HashMap::new(), &mut Vec::new().into_iter(), &[], &dataset)
            .unwrap_err();
        assert!(matches!(err, ComputationError::BadParameter(_)));
    }

    #[test]
    fn zero_slopes_sample_uniformly_without_dividing_by_zero() {
        let mut rng = StdRng::seed_from_u64(41);
        let prefs = UtilityPrefs {
            beta_plus: 0.0,
            beta_minus: 0.0,
            alpha_plus: 1.0,
            alpha_minus: 1.0,
        };
        for _ in 0..100 {
            let r = preference_count(&mut rng, 1.0, 5, 10, &prefs);
            assert!(r <= 10);
        }
    }
}
