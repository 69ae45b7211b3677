//! Predicate validation and SQL assembly. Every attribute, operator and
//! value is checked against the dataset metadata exactly once; SQL text is
//! assembled only from server-side fragments and quoted catalog
//! identifiers, with all client values carried as bound parameters.

use dpq_contracts::meta::{operator_spec, AttributeType, DatasetMeta};
use dpq_contracts::{Predicate, Value};

#[derive(Debug, PartialEq)]
pub enum SelectionError {
    UnknownColumn(String),
    BadOperator { attribute: String, operator: String },
    BadValue { attribute: String, reason: String },
}

impl std::fmt::Display for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionError::UnknownColumn(name) => write!(f, "unknown column `{}`", name),
            SelectionError::BadOperator {
                attribute,
                operator,
            } => write!(f, "operator `{}` not valid for `{}`", operator, attribute),
            SelectionError::BadValue { attribute, reason } => {
                write!(f, "bad value for `{}`: {}", attribute, reason)
            }
        }
    }
}

impl std::error::Error for SelectionError {}

/// A validated SELECT plus its bind values, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub sql: String,
    pub binds: Vec<Value>,
    pub columns: Vec<String>,
}

/// Validate the query against the dataset metadata and build the SELECT.
/// An empty column list projects every declared attribute; an empty
/// predicate selects all rows.
pub fn build_select(
    dataset: &DatasetMeta,
    predicate: &Predicate,
    columns: &[String],
) -> Result<SelectStatement, SelectionError> {
    let columns: Vec<String> = if columns.is_empty() {
        dataset.column_names()
    } else {
        columns.to_vec()
    };
    for column in &columns {
        if dataset.attribute(column).is_none() {
            return Err(SelectionError::UnknownColumn(column.clone()));
        }
    }

    let mut binds = Vec::new();
    let mut disjuncts = Vec::new();
    for conjunction in predicate {
        let mut terms = Vec::new();
        for comparison in &conjunction.terms {
            let attr = dataset
                .attribute(&comparison.attribute)
                .ok_or_else(|| SelectionError::UnknownColumn(comparison.attribute.clone()))?;
            let op = operator_spec(attr.atype, &comparison.operator).ok_or_else(|| {
                SelectionError::BadOperator {
                    attribute: attr.name.clone(),
                    operator: comparison.operator.clone(),
                }
            })?;
            check_value(attr.atype, attr, &comparison.value)?;
            terms.push(format!("{} {} ?", quote_ident(&attr.name), op.sql));
            binds.push(comparison.value.clone());
        }
        if terms.is_empty() {
            continue;
        }
        let body = terms.join(" AND ");
        if conjunction.negated {
            disjuncts.push(format!("NOT ({})", body));
        } else {
            disjuncts.push(format!("({})", body));
        }
    }

    let projection = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(&dataset.name));
    if !disjuncts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&disjuncts.join(" OR "));
    }

    Ok(SelectStatement {
        sql,
        binds,
        columns,
    })
}

fn check_value(
    atype: AttributeType,
    attr: &dpq_contracts::meta::AttributeMeta,
    value: &Value,
) -> Result<(), SelectionError> {
    match atype {
        AttributeType::Categorical => {
            let name = value.as_str().ok_or_else(|| SelectionError::BadValue {
                attribute: attr.name.clone(),
                reason: "categorical comparisons take a value name".to_string(),
            })?;
            if !attr.values.iter().any(|v| v.name == name) {
                return Err(SelectionError::BadValue {
                    attribute: attr.name.clone(),
                    reason: format!("`{}` is not a declared value", name),
                });
            }
        }
        AttributeType::Integer => {
            if !matches!(value, Value::Int(_)) {
                return Err(SelectionError::BadValue {
                    attribute: attr.name.clone(),
                    reason: "expected an integer".to_string(),
                });
            }
        }
        AttributeType::Float => {
            if value.as_f64().is_none() {
                return Err(SelectionError::BadValue {
                    attribute: attr.name.clone(),
                    reason: "expected a number".to_string(),
                });
            }
        }
        AttributeType::Text | AttributeType::Date => {
            if value.as_str().is_none() {
                return Err(SelectionError::BadValue {
                    attribute: attr.name.clone(),
                    reason: "expected text".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Identifiers come from the catalog, never from clients, but are quoted
/// anyway so nothing depends on their spelling.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpq_contracts::meta::{AttributeMeta, Bounds, CategoryValue};
    use dpq_contracts::{Comparison, Conjunction};

    fn dataset() -> DatasetMeta {
        DatasetMeta {
            name: "census".to_string(),
            size: 100,
            description: String::new(),
            attributes: vec![
                AttributeMeta {
                    name: "sex".to_string(),
                    atype: AttributeType::Categorical,
                    description: String::new(),
                    bounds: None,
                    values: vec![
                        CategoryValue {
                            name: "f".to_string(),
                            description: String::new(),
                        },
                        CategoryValue {
                            name: "m".to_string(),
                            description: String::new(),
                        },
                    ],
                },
                AttributeMeta {
                    name: "age".to_string(),
                    atype: AttributeType::Integer,
                    description: String::new(),
                    bounds: Some(Bounds {
                        lower: 0.0,
                        upper: 120.0,
                    }),
                    values: Vec::new(),
                },
            ],
            processors: Vec::new(),
        }
    }

    fn eq(attribute: &str, value: Value) -> Comparison {
        Comparison {
            attribute: attribute.to_string(),
            operator: "==".to_string(),
            value,
        }
    }

    #[test]
    fn builds_a_parameterized_select() {
        let predicate = vec![Conjunction {
            negated: false,
            terms: vec![
                eq("sex", Value::Text("f".to_string())),
                Comparison {
                    attribute: "age".to_string(),
                    operator: ">=".to_string(),
                    value: Value::Int(30),
                },
            ],
        }];
        let stmt = build_select(&dataset(), &predicate, &["age".to_string()]).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"age\" FROM \"census\" WHERE (\"sex\" = ? AND \"age\" >= ?)"
        );
        assert_eq!(
            stmt.binds,
            vec![Value::Text("f".to_string()), Value::Int(30)]
        );
    }

    #[test]
    fn empty_columns_project_all_attributes_and_empty_predicate_selects_all() {
        let stmt = build_select(&dataset(), &Vec::new(), &[]).unwrap();
        assert_eq!(stmt.sql, "SELECT \"sex\", \"age\" FROM \"census\"");
        assert_eq!(stmt.columns, vec!["sex", "age"]);
        assert!(stmt.binds.is_empty());
    }

    #[test]
    fn negated_conjunctions_wrap_in_not() {
        let predicate = vec![
            Conjunction {
                negated: true,
                terms: vec![eq("sex", Value::Text("m".to_string()))],
            },
            Conjunction {
                negated: false,
                terms: vec![Comparison {
                    attribute: "age".to_string(),
                    operator: "<".to_string(),
                    value: Value::Int(18),
                }],
            },
        ];
        let stmt = build_select(&dataset(), &predicate, &[]).unwrap();
        assert!(stmt.sql.ends_with("WHERE NOT (\"sex\" = ?) OR (\"age\" < ?)"));
    }

    #[test]
    fn invalid_queries_are_rejected_before_any_sql_exists() {
        // unknown column
        let err = build_select(&dataset(), &Vec::new(), &["salary".to_string()]).unwrap_err();
        assert_eq!(err, SelectionError::UnknownColumn("salary".to_string()));

        // ordering operator on a categorical attribute
        let predicate = vec![Conjunction {
            negated: false,
            terms: vec![Comparison {
                attribute: "sex".to_string(),
                operator: "<".to_string(),
                value: Value::Text("f".to_string()),
            }],
        }];
        assert!(matches!(
            build_select(&dataset(), &predicate, &[]).unwrap_err(),
            SelectionError::BadOperator { .. }
        ));

        // undeclared categorical value
        let predicate = vec![Conjunction {
            negated: false,
            terms: vec![eq("sex", Value::Text("x".to_string()))],
        }];
        assert!(matches!(
            build_select(&dataset(), &predicate, &[]).unwrap_err(),
            SelectionError::BadValue { .. }
        ));

        // sql injection attempt travels as a plain bind value
        let predicate = vec![Conjunction {
            negated: false,
            terms: vec![Comparison {
                attribute: "age".to_string(),
                operator: "==".to_string(),
                value: Value::Text("1; DROP TABLE census".to_string()),
            }],
        }];
        assert!(matches!(
            build_select(&dataset(), &predicate, &[]).unwrap_err(),
            SelectionError::BadValue { .. }
        ));
    }
}
