//! Truncated noisy histogram. Observed bin combinations get Laplace noise
//! and are suppressed below the truncation threshold; the survivors among
//! the (possibly enormous) unobserved remainder are drawn by a binomial
//! count plus without-replacement sampling over the mixed-radix cell
//! domain, so the full domain is never materialized.

use std::collections::HashMap;

use dpq_contracts::meta::{AttributeType, DatasetMeta};
use rand::Rng;
use serde_json::Value as Json;

use crate::distributions::{laplace_cdf, sample_binomial, sample_laplace, sample_laplace_above};
use crate::sampler::{mixed_radix_from_int, mixed_radix_to_int, WorSampler};
use crate::{
    check_eps, require_param, ComputationError, ParameterMeta, Processor, ProcessorMeta, ResultMap,
    Row,
};

pub const DEFAULT_MAX_CELLS: u64 = 500_000;
const MIN_BINS: u64 = 2;

/// Per-column bin labels plus exact counts of observed bin combinations,
/// keyed by bin index tuples.
#[derive(Debug)]
pub struct Discretized {
    pub labels: Vec<Vec<Json>>,
    pub counts: HashMap<Vec<u64>, u64>,
    pub rows: u64,
}

impl Discretized {
    pub fn bases(&self) -> Vec<u64> {
        self.labels.iter().map(|l| l.len() as u64).collect()
    }
}

/// Bin the projected columns. Categorical columns use their declared value
/// set; numeric columns get `nbin` equal-width bins over their declared
/// bounds with out-of-range values clamped to the bound first. `nbin` is
/// `max(2, floor((size / ln size)^(1/(dim+1))))` for the declared dataset
/// size, so it does not leak the selection's row count.
pub fn discretize(
    rows: &mut dyn Iterator<Item = Row>,
    columns: &[String],
    dataset: &DatasetMeta,
) -> Result<Discretized, ComputationError> {
    if columns.is_empty() {
        return Err(ComputationError::BadColumn(
            "histogram needs at least one column".to_string(),
        ));
    }

    let attrs: Vec<_> = columns
        .iter()
        .map(|name| {
            dataset
                .attribute(name)
                .ok_or_else(|| ComputationError::BadColumn(format!("unknown column `{}`", name)))
        })
        .collect::<Result<_, _>>()?;
    if let Some(attr) = attrs.iter().find(|a| !a.atype.binnable()) {
        return Err(ComputationError::BadColumn(format!(
            "column `{}` is neither categorical nor numeric",
            attr.name
        )));
    }

    let data: Vec<Row> = rows.collect();
    let n = data.len() as u64;
    let dim = columns.len();

    // Bin resolution follows the declared dataset size bound, not the
    // matched row count, so the grid is stable across selections.
    let nbin = if dataset.size >= 2 {
        let size = dataset.size as f64;
        ((size / size.ln()).powf(1.0 / (dim as f64 + 1.0)).floor() as u64).max(MIN_BINS)
    } else {
        MIN_BINS
    };

    enum Binner {
        Categorical(HashMap<String, u64>),
        Numeric { lower: f64, upper: f64, width: f64 },
    }

    let mut labels: Vec<Vec<Json>> = Vec::with_capacity(dim);
    let mut binners: Vec<Binner> = Vec::with_capacity(dim);
    for attr in &attrs {
        match attr.atype {
            AttributeType::Categorical => {
                if attr.values.is_empty() {
                    return Err(ComputationError::Metadata(format!(
                        "categorical column `{}` declares no values",
                        attr.name
                    )));
                }
                let index: HashMap<String, u64> = attr
                    .values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.name.clone(), i as u64))
                    .collect();
                labels.push(
                    attr.values
                        .iter()
                        .map(|v| Json::String(v.name.clone()))
                        .collect(),
                );
                binners.push(Binner::Categorical(index));
            }
            _ => {
                let bounds = attr.bounds.ok_or_else(|| {
                    ComputationError::Metadata(format!(
                        "numeric column `{}` declares no bounds",
                        attr.name
                    ))
                })?;
                let (a, b) = (bounds.lower, bounds.upper);
                // Pad the upper bound slightly so values exactly on it do
                // not index past the last bin.
                let extra = (b - a) / 1000.0;
                let width = ((b + extra) - a) / nbin as f64;
                labels.push(
                    (0..nbin)
                        .map(|i| Json::from(a + i as f64 * width + width / 2.0))
                        .collect(),
                );
                binners.push(Binner::Numeric {
                    lower: a,
                    upper: b,
                    width,
                });
            }
        }
    }

    let mut counts: HashMap<Vec<u64>, u64> = HashMap::new();
    for row in &data {
        if row.len() != dim {
            return Err(ComputationError::Metadata(format!(
                "row has {} values, expected {}",
                row.len(),
                dim
            )));
        }
        let mut cell = Vec::with_capacity(dim);
        for (value, binner) in row.iter().zip(&binners) {
            let idx = match binner {
                Binner::Categorical(index) => {
                    let name = value.as_str().ok_or_else(|| {
                        ComputationError::Metadata("categorical value is not text".to_string())
                    })?;
                    *index.get(name).ok_or_else(|| {
                        ComputationError::Metadata(format!("undeclared category `{}`", name))
                    })?
                }
                Binner::Numeric {
                    lower,
                    upper,
                    width,
                } => {
                    let v = value.as_f64().ok_or_else(|| {
                        ComputationError::Metadata("numeric value is not a number".to_string())
                    })?;
                    let clamped = v.clamp(*lower, *upper);
                    (((clamped - lower) / width).floor() as u64).min(nbin - 1)
                }
            };
            cell.push(idx);
        }
        *counts.entry(cell).or_insert(0) += 1;
    }

    Ok(Discretized {
        labels,
        counts,
        rows: n,
    })
}

/// Noise and truncate the exact counts; `bases` gives the per-column bin
/// counts defining the full cell domain.
pub fn noisy_histogram<R: Rng + ?Sized>(
    rng: &mut R,
    eps: f64,
    threshold_tuning: f64,
    bases: &[u64],
    counts: &HashMap<Vec<u64>, u64>,
    max_cells: u64,
) -> Result<HashMap<Vec<u64>, i64>, ComputationError> {
    let total = bases
        .iter()
        .try_fold(1u64, |acc, b| acc.checked_mul(*b))
        .ok_or(ComputationError::DomainTooLarge {
            cells: u64::MAX,
            max: max_cells,
        })?;
    if total > max_cells {
        return Err(ComputationError::DomainTooLarge {
            cells: total,
            max: max_cells,
        });
    }

    let observed = counts.len() as u64;
    let tau = threshold_tuning * (observed.max(1) as f64).ln() / eps;
    let scale = 2.0 / eps;

    let mut out: HashMap<Vec<u64>, i64> = HashMap::new();
    for (cell, count) in counts {
        let noisy = sample_laplace(rng, scale, *count as f64);
        if noisy >= tau {
            out.insert(cell.clone(), noisy.round() as i64);
        }
    }

    // Unobserved cells all have true count zero; draw how many survive
    // truncation, then sample that many distinct cells.
    let survive_p = 0.5 * (-tau / scale).exp();
    let nzero = sample_binomial(rng, total - observed, survive_p);

    let exclude: Vec<u64> = counts
        .keys()
        .map(|cell| mixed_radix_to_int(cell, bases))
        .collect();
    let lower_cdf = laplace_cdf(tau, 0.0, scale);
    let mut sampler = WorSampler::new(total, &exclude);
    for _ in 0..nzero {
        let Some(encoded) = sampler.draw(rng) else {
            break;
        };
        let cell = mixed_radix_from_int(encoded, bases);
        let noisy = sample_laplace_above(rng, scale, lower_cdf).round() as i64;
        out.insert(cell, noisy);
    }

    Ok(out)
}

pub struct Histogram {
    meta: ProcessorMeta,
    max_cells: u64,
}

impl Histogram {
    pub fn new(max_cells: u64) -> Self {
        Histogram {
            meta: ProcessorMeta {
                name: "histogram",
                description: "Perturbed histogram truncated by A * ln(n) / eps.",
                parameters: vec![ParameterMeta {
                    name: "A",
                    default: 0.5,
                    lower: 0.0,
                    upper: 5.0,
                    description: "truncation threshold tuning parameter",
                }],
            },
            max_cells,
        }
    }
}

impl Processor for Histogram {
    fn meta(&self) -> &ProcessorMeta {
        &self.meta
    }

    fn compute(
        &self,
        eps: f64,
        params: &HashMap<String, f64>,
        rows: &mut dyn Iterator<Item = Row>,
        columns: &[String],
        dataset: &DatasetMeta,
    ) -> Result<ResultMap, ComputationError> {
        check_eps(eps)?;
        let tuning = require_param(params, "A")?;
        let disc = discretize(rows, columns, dataset)?;
        let bases = disc.bases();
        let noisy = noisy_histogram(
            &mut rand::thread_rng(),
            eps,
            tuning,
            &bases,
            &disc.counts,
            self.max_cells,
        )?;

        let mut entries: Vec<(Vec<u64>, i64)> = noisy.into_iter().collect();
        entries.sort();
        let histogram: Vec<Json> = entries
            .into_iter()
            .map(|(cell, count)| {
                let tuple: Vec<Json> = cell
                    .iter()
                    .zip(&disc.labels)
                    .map(|(idx, labels)| labels[*idx as usize].clone())
                    .collect();
                Json::Array(vec![Json::Array(tuple), Json::from(count)])
            })
            .collect();

        let mut out = ResultMap::new();
        out.insert(
            "col_names".to_string(),
            Json::Array(columns.iter().map(|c| Json::String(c.clone())).collect()),
        );
        out.insert("histogram".to_string(), Json::Array(histogram));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpq_contracts::meta::{AttributeMeta, Bounds, CategoryValue};
    use dpq_contracts::Value;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_dataset() -> DatasetMeta {
        DatasetMeta {
            name: "demo".to_string(),
            size: 1000,
            description: "test set".to_string(),
            attributes: vec![
                AttributeMeta {
                    name: "color".to_string(),
                    atype: AttributeType::Categorical,
                    description: String::new(),
                    bounds: None,
                    values: vec![
                        CategoryValue {
                            name: "red".to_string(),
                            description: String::new(),
                        },
                        CategoryValue {
                            name: "blue".to_string(),
                            description: String::new(),
                        },
                    ],
                },
                AttributeMeta {
                    name: "age".to_string(),
                    atype: AttributeType::Float,
                    description: String::new(),
                    bounds: Some(Bounds {
                        lower: 0.0,
                        upper: 100.0,
                    }),
                    values: Vec::new(),
                },
            ],
            processors: vec!["histogram".to_string()],
        }
    }

    fn rows(values: &[(&str, f64)]) -> Vec<Row> {
        values
            .iter()
            .map(|(c, a)| vec![Value::Text(c.to_string()), Value::Float(*a)])
            .collect()
    }

    #[test]
    fn discretize_bins_and_windsorizes() {
        let dataset = test_dataset();
        let columns = vec!["color".to_string(), "age".to_string()];
        let data = rows(&[
            ("red", 10.0),
            ("red", 10.0),
            ("blue", 95.0),
            // outside the declared bounds, clamped before binning
            ("blue", 250.0),
            ("red", -5.0),
        ]);

        let disc = discretize(&mut data.into_iter(), &columns, &dataset).unwrap();
        assert_eq!(disc.rows, 5);
        assert_eq!(disc.labels[0].len(), 2);
        assert!(disc.labels[1].len() >= 2);

        let top_bin = disc.labels[1].len() as u64 - 1;
        assert_eq!(disc.counts[&vec![0, 0]], 3); // two at 10.0, one clamped to 0.0
        assert_eq!(disc.counts[&vec![1, top_bin]], 2); // 95.0 and the clamp to 100.0
    }

    #[test]
    fn bin_count_follows_the_declared_dataset_size() {
        // size 1000, one column: floor((1000 / ln 1000)^(1/2)) = 12 bins,
        // no matter how few rows the selection matched.
        let dataset = test_dataset();
        let data = rows(&[
            ("red", 10.0),
            ("red", 20.0),
            ("blue", 30.0),
            ("blue", 40.0),
            ("red", 50.0),
        ]);
        let disc = discretize(
            &mut data.into_iter().map(|r| vec![r[1].clone()]),
            &["age".to_string()],
            &dataset,
        )
        .unwrap();
        assert_eq!(disc.labels[0].len(), 12);
        assert_eq!(disc.rows, 5);

        // a tiny declared size falls back to the minimum of two bins
        let mut small = test_dataset();
        small.size = 1;
        let disc = discretize(
            &mut vec![vec![Value::Float(1.0)]].into_iter(),
            &["age".to_string()],
            &small,
        )
        .unwrap();
        assert_eq!(disc.labels[0].len(), 2);
    }

    #[test]
    fn discretize_rejects_unusable_columns() {
        let mut dataset = test_dataset();
        dataset.attributes.push(AttributeMeta {
            name: "note".to_string(),
            atype: AttributeType::Text,
            description: String::new(),
            bounds: None,
            values: Vec::new(),
        });

        let err = discretize(
            &mut Vec::new().into_iter(),
            &["note".to_string()],
            &dataset,
        )
        .unwrap_err();
        assert!(matches!(err, ComputationError::BadColumn(_)));

        let err = discretize(&mut Vec::new().into_iter(), &[], &dataset).unwrap_err();
        assert!(matches!(err, ComputationError::BadColumn(_)));
    }

    #[test]
    fn noisy_histogram_never_reports_below_threshold() {
        let mut rng = StdRng::seed_from_u64(5);
        let bases = vec![20u64, 20];
        let mut counts = HashMap::new();
        for i in 0..10u64 {
            counts.insert(vec![i, i], 40 + i);
        }

        let eps = 0.5;
        let tuning = 2.0;
        let tau = tuning * (counts.len() as f64).ln() / eps;

        for _ in 0..50 {
            let noisy = noisy_histogram(&mut rng, eps, tuning, &bases, &counts, 500_000).unwrap();
            for (cell, value) in &noisy {
                // Rounding can shave at most half a count off a survivor.
                assert!(
                    *value as f64 >= tau - 0.5,
                    "cell {:?} reported {} below threshold {}",
                    cell,
                    value,
                    tau
                );
            }
        }
    }

    #[test]
    fn noisy_histogram_rejects_oversized_domains() {
        let mut rng = StdRng::seed_from_u64(6);
        let err = noisy_histogram(&mut rng, 1.0, 0.5, &[1000, 1000], &HashMap::new(), 500_000)
            .unwrap_err();
        assert!(matches!(err, ComputationError::DomainTooLarge { .. }));
    }

    #[test]
    fn compute_rejects_an_unresolved_parameter_map() {
        let dataset = test_dataset();
        let processor = Histogram::new(DEFAULT_MAX_CELLS);
        let err = processor
            .compute(
                1.0,
                &HashMap::new(),
                &mut Vec::new().into_iter(),
                &["age".to_string()],
                &dataset,
            )
            .unwrap_err();
        assert!(matches!(err, ComputationError::BadParameter(_)));
    }

    #[test]
    fn histogram_processor_reports_columns_and_cells() {
        let dataset = test_dataset();
        let columns = vec!["color".to_string(), "age".to_string()];
        let mut data = rows(&[
            ("red", 10.0),
            ("red", 12.0),
            ("red", 11.0),
            ("blue", 80.0),
            ("blue", 82.0),
        ])
        .into_iter();

        let processor = Histogram::new(DEFAULT_MAX_CELLS);
        let params = crate::resolve_parameters(processor.meta(), &[]).unwrap();
        let out = processor
            .compute(1.0, &params, &mut data, &columns, &dataset)
            .unwrap();

        assert_eq!(
            out["col_names"],
            serde_json::json!(["color", "age"])
        );
        for entry in out["histogram"].as_array().unwrap() {
            let pair = entry.as_array().unwrap();
            assert_eq!(pair.len(), 2);
            assert_eq!(pair[0].as_array().unwrap().len(), 2);
            assert!(pair[1].is_i64());
        }
    }
}
