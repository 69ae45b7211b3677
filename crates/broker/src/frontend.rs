//! Immutable broker state snapshot: dataset metadata, the processor
//! registry and the merged capability document served for `Meta` requests.
//! Hot reload builds a new snapshot and swaps the shared pointer; requests
//! keep the snapshot they started with.

use std::collections::HashMap;
use std::time::Duration;

use dpq_contracts::meta::{operators_for, AttributeType, DatasetMeta};
use dpq_contracts::{QueryPayload, Value};
use dpq_processors::{resolve_parameters, ProcessorRegistry, ResultMap, Row};
use serde_json::Value as Json;

use crate::metadata::{self, MetadataError};
use crate::selection::{build_select, SelectStatement};

#[derive(Debug)]
pub enum QueryError {
    /// Client-caused: reported with a description, connection stays open.
    BadQuery(String),
    /// Store-caused: reported generically, logged in full.
    Internal(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::BadQuery(what) => write!(f, "bad query: {}", what),
            QueryError::Internal(what) => write!(f, "internal query failure: {}", what),
        }
    }
}

impl std::error::Error for QueryError {}

pub struct Frontend {
    pool: sqlx::SqlitePool,
    datasets: HashMap<String, DatasetMeta>,
    registry: ProcessorRegistry,
    meta_json: Json,
    selection_timeout: Duration,
}

impl Frontend {
    pub async fn build(
        pool: sqlx::SqlitePool,
        registry: ProcessorRegistry,
        selection_timeout: Duration,
    ) -> Result<Self, MetadataError> {
        let datasets = metadata::load_datasets(&pool, selection_timeout).await?;
        let meta_json = merged_meta(&datasets, &registry);
        Ok(Frontend {
            pool,
            datasets,
            registry,
            meta_json,
            selection_timeout,
        })
    }

    /// Capability document: dataset schemas, processor metadata and the
    /// operator table, merged into one JSON object.
    pub fn meta_json(&self) -> &Json {
        &self.meta_json
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetMeta> {
        self.datasets.get(name)
    }

    pub async fn handle_query(
        &self,
        eps: f64,
        payload: &QueryPayload,
    ) -> Result<ResultMap, QueryError> {
        let dataset = self
            .datasets
            .get(&payload.dataset)
            .ok_or_else(|| QueryError::BadQuery(format!("unknown dataset `{}`", payload.dataset)))?;

        if !dataset.processors.iter().any(|p| p == &payload.processor) {
            return Err(QueryError::BadQuery(format!(
                "processor `{}` is not permitted for dataset `{}`",
                payload.processor, payload.dataset
            )));
        }
        let processor = self.registry.get(&payload.processor).ok_or_else(|| {
            QueryError::BadQuery(format!("unknown processor `{}`", payload.processor))
        })?;

        let params = resolve_parameters(processor.meta(), &payload.parameters)
            .map_err(|err| QueryError::BadQuery(err.to_string()))?;

        let (predicate, columns) = processor
            .edit_query(&payload.predicate, &payload.columns)
            .unwrap_or_else(|| (payload.predicate.clone(), payload.columns.clone()));

        let stmt = build_select(dataset, &predicate, &columns)
            .map_err(|err| QueryError::BadQuery(err.to_string()))?;

        let rows = self.select(&stmt, dataset).await?;

        processor
            .compute(eps, &params, &mut rows.into_iter(), &stmt.columns, dataset)
            .map_err(|err| QueryError::BadQuery(err.to_string()))
    }

    async fn select(
        &self,
        stmt: &SelectStatement,
        dataset: &DatasetMeta,
    ) -> Result<Vec<Row>, QueryError> {
        let mut query = sqlx::query(&stmt.sql);
        for bind in &stmt.binds {
            query = match bind {
                Value::Int(v) => query.bind(*v),
                Value::Float(v) => query.bind(*v),
                Value::Text(v) => query.bind(v.clone()),
            };
        }

        let raw = tokio::time::timeout(self.selection_timeout, query.fetch_all(&self.pool))
            .await
            .map_err(|_| QueryError::Internal("selection timed out".to_string()))?
            .map_err(|err| QueryError::Internal(format!("selection failed: {}", err)))?;

        let mut rows = Vec::with_capacity(raw.len());
        for raw_row in raw {
            let mut row = Vec::with_capacity(stmt.columns.len());
            for (i, column) in stmt.columns.iter().enumerate() {
                // Columns were validated against the metadata in build_select.
                let atype = dataset
                    .attribute(column)
                    .map(|a| a.atype)
                    .unwrap_or(AttributeType::Text);
                let value = decode_value(&raw_row, i, atype)
                    .map_err(|err| QueryError::Internal(format!("row decode failed: {}", err)))?;
                row.push(value);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

fn decode_value(
    row: &sqlx::sqlite::SqliteRow,
    index: usize,
    atype: AttributeType,
) -> Result<Value, sqlx::Error> {
    use sqlx::Row as _;
    Ok(match atype {
        AttributeType::Integer => Value::Int(row.try_get::<i64, _>(index)?),
        AttributeType::Float => Value::Float(row.try_get::<f64, _>(index)?),
        _ => Value::Text(row.try_get::<String, _>(index)?),
    })
}

fn merged_meta(datasets: &HashMap<String, DatasetMeta>, registry: &ProcessorRegistry) -> Json {
    let mut dataset_map = serde_json::Map::new();
    for (name, dataset) in datasets {
        dataset_map.insert(
            name.clone(),
            serde_json::to_value(dataset).unwrap_or(Json::Null),
        );
    }

    let mut processor_map = serde_json::Map::new();
    for (name, processor) in registry {
        processor_map.insert(
            name.clone(),
            serde_json::to_value(processor.meta()).unwrap_or(Json::Null),
        );
    }

    serde_json::json!({
        "datasets": dataset_map,
        "processors": processor_map,
        "operators": {
            "categorical": operators_for(AttributeType::Categorical),
            "ordered": operators_for(AttributeType::Integer),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpq_contracts::meta::{AttributeMeta, Bounds, CategoryValue};
    use dpq_contracts::{Comparison, Conjunction};
    use dpq_processors::builtin_registry;
    use sqlx::sqlite::SqlitePoolOptions;

    fn census_meta() -> DatasetMeta {
        DatasetMeta {
            name: "census".to_string(),
            size: 200,
            description: "toy census extract".to_string(),
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
            processors: vec!["simple_count".to_string(), "histogram".to_string()],
        }
    }

    async fn test_frontend() -> Frontend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let meta = census_meta();
        crate::metadata::seed_catalog(&pool, &meta).await.unwrap();

        sqlx::query("CREATE TABLE census (sex TEXT NOT NULL, age INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        for i in 0..200i64 {
            sqlx::query("INSERT INTO census (sex, age) VALUES (?, ?)")
                .bind(if i % 2 == 0 { "f" } else { "m" })
                .bind(20 + (i % 60))
                .execute(&pool)
                .await
                .unwrap();
        }

        Frontend::build(pool, builtin_registry(500_000), Duration::from_secs(5))
            .await
            .unwrap()
    }

    fn count_payload(predicate: dpq_contracts::Predicate) -> QueryPayload {
        QueryPayload {
            dataset: "census".to_string(),
            predicate,
            columns: Vec::new(),
            processor: "simple_count".to_string(),
            parameters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn counts_matching_rows_with_noise() {
        let frontend = test_frontend().await;
        let predicate = vec![Conjunction {
            negated: false,
            terms: vec![Comparison {
                attribute: "sex".to_string(),
                operator: "==".to_string(),
                value: Value::Text("f".to_string()),
            }],
        }];

        // 100 true matches; with eps=10 the noise is tight enough to land
        // well inside +-20 essentially always.
        let result = frontend
            .handle_query(10.0, &count_payload(predicate))
            .await
            .unwrap();
        let count = result["count"].as_i64().unwrap();
        assert!((count - 100).abs() < 20, "count {}", count);
    }

    #[tokio::test]
    async fn disallowed_and_unknown_processors_are_rejected() {
        let frontend = test_frontend().await;

        let mut payload = count_payload(Vec::new());
        payload.processor = "user_pref_count".to_string(); // not on the allow-list
        assert!(matches!(
            frontend.handle_query(1.0, &payload).await,
            Err(QueryError::BadQuery(_))
        ));

        let mut payload = count_payload(Vec::new());
        payload.processor = "no_such_processor".to_string();
        assert!(matches!(
            frontend.handle_query(1.0, &payload).await,
            Err(QueryError::BadQuery(_))
        ));

        let mut payload = count_payload(Vec::new());
        payload.dataset = "no_such_dataset".to_string();
        assert!(matches!(
            frontend.handle_query(1.0, &payload).await,
            Err(QueryError::BadQuery(_))
        ));
    }

    #[tokio::test]
    async fn histogram_runs_end_to_end_over_the_store() {
        let frontend = test_frontend().await;
        let payload = QueryPayload {
            dataset: "census".to_string(),
            predicate: Vec::new(),
            columns: vec!["sex".to_string(), "age".to_string()],
            processor: "histogram".to_string(),
            parameters: Vec::new(),
        };

        let result = frontend.handle_query(1.0, &payload).await.unwrap();
        assert_eq!(result["col_names"], serde_json::json!(["sex", "age"]));
        assert!(result["histogram"].is_array());
    }

    #[tokio::test]
    async fn meta_document_lists_datasets_processors_and_operators() {
        let frontend = test_frontend().await;
        let meta = frontend.meta_json();
        assert!(meta["datasets"]["census"]["attributes"].is_array());
        assert!(meta["processors"]["simple_count"].is_object());
        assert_eq!(meta["operators"]["categorical"].as_array().unwrap().len(), 2);
        assert_eq!(meta["operators"]["ordered"].as_array().unwrap().len(), 6);
    }
}
