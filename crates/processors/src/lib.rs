//! Differentially private statistic processors. A processor is a pure
//! function (aside from randomness) from a privacy budget, resolved
//! parameters and a row stream to a JSON result map; the broker looks them
//! up by name in an immutable registry snapshot that hot reload replaces
//! wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use dpq_contracts::meta::DatasetMeta;
use dpq_contracts::{Predicate, Value};
use serde::Serialize;

pub mod count;
pub mod distributions;
pub mod histogram;
pub mod sampler;

pub type Row = Vec<Value>;
pub type ResultMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, PartialEq)]
pub enum ComputationError {
    BadParameter(String),
    BadColumn(String),
    DatasetTooSmall { rows: u64 },
    DomainTooLarge { cells: u64, max: u64 },
    Metadata(String),
}

impl std::fmt::Display for ComputationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputationError::BadParameter(what) => write!(f, "bad parameter: {}", what),
            ComputationError::BadColumn(what) => write!(f, "unusable column: {}", what),
            ComputationError::DatasetTooSmall { rows } => {
                write!(f, "selection of {} rows is too small", rows)
            }
            ComputationError::DomainTooLarge { cells, max } => {
                write!(f, "histogram domain of {} cells exceeds limit {}", cells, max)
            }
            ComputationError::Metadata(what) => write!(f, "metadata mismatch: {}", what),
        }
    }
}

impl std::error::Error for ComputationError {}

/// Declared parameter of a processor: clients may omit it (the default
/// applies) but a supplied value must be numeric and within bounds.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterMeta {
    pub name: &'static str,
    pub default: f64,
    pub lower: f64,
    pub upper: f64,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorMeta {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParameterMeta>,
}

/// Apply defaults and bounds-check the client-supplied parameter list.
pub fn resolve_parameters(
    meta: &ProcessorMeta,
    supplied: &[(String, Value)],
) -> Result<HashMap<String, f64>, ComputationError> {
    let mut resolved: HashMap<String, f64> = meta
        .parameters
        .iter()
        .map(|p| (p.name.to_string(), p.default))
        .collect();

    for (name, value) in supplied {
        let decl = meta
            .parameters
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                ComputationError::BadParameter(format!(
                    "`{}` is not a parameter of {}",
                    name, meta.name
                ))
            })?;
        let number = value.as_f64().ok_or_else(|| {
            ComputationError::BadParameter(format!("`{}` must be numeric", name))
        })?;
        if !number.is_finite() || number < decl.lower || number > decl.upper {
            return Err(ComputationError::BadParameter(format!(
                "`{}` = {} outside [{}, {}]",
                name, number, decl.lower, decl.upper
            )));
        }
        resolved.insert(name.clone(), number);
    }
    Ok(resolved)
}

/// Fetch a resolved parameter; absent means the caller skipped
/// [`resolve_parameters`].
pub(crate) fn require_param(
    params: &HashMap<String, f64>,
    name: &str,
) -> Result<f64, ComputationError> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| ComputationError::BadParameter(format!("`{}` was not resolved", name)))
}

pub(crate) fn check_eps(eps: f64) -> Result<(), ComputationError> {
    if !eps.is_finite() || eps <= 0.0 {
        return Err(ComputationError::BadParameter(format!(
            "eps must be a positive number, got {}",
            eps
        )));
    }
    Ok(())
}

pub trait Processor: Send + Sync {
    fn meta(&self) -> &ProcessorMeta;

    /// Optional query rewrite applied before selection. The default keeps
    /// the query as submitted.
    fn edit_query(
        &self,
        predicate: &Predicate,
        columns: &[String],
    ) -> Option<(Predicate, Vec<String>)> {
        let _ = (predicate, columns);
        None
    }

    /// Compute the private result. `columns` names the projected columns in
    /// row order; `rows` must be consumed exactly once.
    fn compute(
        &self,
        eps: f64,
        params: &HashMap<String, f64>,
        rows: &mut dyn Iterator<Item = Row>,
        columns: &[String],
        dataset: &DatasetMeta,
    ) -> Result<ResultMap, ComputationError>;
}

pub type ProcessorRegistry = HashMap<String, Arc<dyn Processor>>;

/// The stock registry: `simple_count`, `user_pref_count` and `histogram`.
pub fn builtin_registry(max_histogram_cells: u64) -> ProcessorRegistry {
    let mut registry: ProcessorRegistry = HashMap::new();
    let entries: Vec<Arc<dyn Processor>> = vec![
        Arc::new(count::SimpleCount::new()),
        Arc::new(count::UserPrefCount::new()),
        Arc::new(histogram::Histogram::new(max_histogram_cells)),
    ];
    for processor in entries {
        registry.insert(processor.meta().name.to_string(), processor);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_one_param() -> ProcessorMeta {
        ProcessorMeta {
            name: "fake",
            description: "test double",
            parameters: vec![ParameterMeta {
                name: "A",
                default: 0.5,
                lower: 0.0,
                upper: 5.0,
                description: "tuning",
            }],
        }
    }

    #[test]
    fn parameters_default_when_omitted() {
        let resolved = resolve_parameters(&meta_with_one_param(), &[]).unwrap();
        assert_eq!(resolved["A"], 0.5);
    }

    #[test]
    fn supplied_parameters_override_defaults_within_bounds() {
        let supplied = vec![("A".to_string(), Value::Float(2.5))];
        let resolved = resolve_parameters(&meta_with_one_param(), &supplied).unwrap();
        assert_eq!(resolved["A"], 2.5);

        let supplied = vec![("A".to_string(), Value::Int(3))];
        let resolved = resolve_parameters(&meta_with_one_param(), &supplied).unwrap();
        assert_eq!(resolved["A"], 3.0);
    }

    #[test]
    fn out_of_bounds_and_unknown_parameters_are_rejected() {
        let meta = meta_with_one_param();
        let over = vec![("A".to_string(), Value::Float(5.1))];
        assert!(matches!(
            resolve_parameters(&meta, &over),
            Err(ComputationError::BadParameter(_))
        ));

        let unknown = vec![("B".to_string(), Value::Float(1.0))];
        assert!(matches!(
            resolve_parameters(&meta, &unknown),
            Err(ComputationError::BadParameter(_))
        ));

        let text = vec![("A".to_string(), Value::Text("high".to_string()))];
        assert!(matches!(
            resolve_parameters(&meta, &text),
            Err(ComputationError::BadParameter(_))
        ));
    }

    #[test]
    fn builtin_registry_carries_the_stock_processors() {
        let registry = builtin_registry(500_000);
        let mut names: Vec<&String> = registry.keys().collect();
        names.sort();
        assert_eq!(names, ["histogram", "simple_count", "user_pref_count"]);
    }
}
