//! Loads dataset metadata from the data store's catalog tables:
//! `datasets`, `attributes`, `bounds`, `values` and `processors`. The
//! loaded snapshot is immutable; hot reload builds a fresh one.

use std::collections::HashMap;
use std::time::Duration;

use dpq_contracts::meta::{
    AttributeMeta, AttributeType, Bounds, CategoryValue, DatasetMeta,
};
use sqlx::Row;

#[derive(Debug)]
pub enum MetadataError {
    Timeout,
    Sqlx(sqlx::Error),
    Invalid(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Timeout => write!(f, "metadata load timed out"),
            MetadataError::Sqlx(err) => write!(f, "metadata sql error: {}", err),
            MetadataError::Invalid(what) => write!(f, "invalid metadata: {}", what),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<sqlx::Error> for MetadataError {
    fn from(value: sqlx::Error) -> Self {
        MetadataError::Sqlx(value)
    }
}

pub async fn load_datasets(
    pool: &sqlx::SqlitePool,
    timeout: Duration,
) -> Result<HashMap<String, DatasetMeta>, MetadataError> {
    tokio::time::timeout(timeout, load_datasets_inner(pool))
        .await
        .map_err(|_| MetadataError::Timeout)?
}

async fn load_datasets_inner(
    pool: &sqlx::SqlitePool,
) -> Result<HashMap<String, DatasetMeta>, MetadataError> {
    let mut datasets = HashMap::new();

    let dataset_rows = sqlx::query("SELECT name, size, description FROM datasets").fetch_all(pool).await?;
    for dataset_row in dataset_rows {
        let name: String = dataset_row.try_get("name")?;
        let size: i64 = dataset_row.try_get("size")?;
        let description: String = dataset_row.try_get("description")?;
        if size < 0 {
            return Err(MetadataError::Invalid(format!(
                "dataset `{}` has negative size",
                name
            )));
        }

        let mut attributes = Vec::new();
        let attribute_rows = sqlx::query(
            "SELECT name, type, description FROM attributes WHERE \"set\" = ? ORDER BY rowid",
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;
        for attribute_row in attribute_rows {
            let attr_name: String = attribute_row.try_get("name")?;
            let type_code: i64 = attribute_row.try_get("type")?;
            let attr_description: String = attribute_row.try_get("description")?;
            let atype = u8::try_from(type_code)
                .ok()
                .and_then(AttributeType::from_code)
                .ok_or_else(|| {
                    MetadataError::Invalid(format!(
                        "attribute `{}` of `{}` has unknown type {}",
                        attr_name, name, type_code
                    ))
                })?;

            let bounds = sqlx::query(
                "SELECT lower, upper FROM bounds WHERE attribute = ? AND \"set\" = ?",
            )
            .bind(&attr_name)
            .bind(&name)
            .fetch_optional(pool)
            .await?
            .map(|row| {
                Ok::<_, sqlx::Error>(Bounds {
                    lower: row.try_get("lower")?,
                    upper: row.try_get("upper")?,
                })
            })
            .transpose()?;

            let values = sqlx::query(
                "SELECT name, description FROM \"values\" WHERE attribute = ? AND \"set\" = ? ORDER BY rowid",
            )
            .bind(&attr_name)
            .bind(&name)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|row| {
                Ok::<_, sqlx::Error>(CategoryValue {
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

            if atype == AttributeType::Categorical && values.is_empty() {
                return Err(MetadataError::Invalid(format!(
                    "categorical attribute `{}` of `{}` declares no values",
                    attr_name, name
                )));
            }

            attributes.push(AttributeMeta {
                name: attr_name,
                atype,
                description: attr_description,
                bounds,
                values,
            });
        }

        let processors = sqlx::query("SELECT type FROM processors WHERE \"set\" = ? ORDER BY rowid")
            .bind(&name)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|row| row.try_get::<String, _>("type"))
            .collect::<Result<Vec<_>, _>>()?;

        datasets.insert(
            name.clone(),
            DatasetMeta {
                name,
                size: size as u64,
                description,
                attributes,
                processors,
            },
        );
    }

    Ok(datasets)
}

#[cfg(test)]
pub(crate) async fn seed_catalog(
    pool: &sqlx::SqlitePool,
    dataset: &DatasetMeta,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS datasets (name TEXT PRIMARY KEY, size INTEGER NOT NULL, description TEXT NOT NULL DEFAULT '')",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS attributes (name TEXT NOT NULL, \"set\" TEXT NOT NULL, type INTEGER NOT NULL, description TEXT NOT NULL DEFAULT '')",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS bounds (attribute TEXT NOT NULL, \"set\" TEXT NOT NULL, lower REAL NOT NULL, upper REAL NOT NULL)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS \"values\" (attribute TEXT NOT NULL, \"set\" TEXT NOT NULL, name TEXT NOT NULL, description TEXT NOT NULL DEFAULT '')",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS processors (\"set\" TEXT NOT NULL, type TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO datasets (name, size, description) VALUES (?, ?, ?)")
        .bind(&dataset.name)
        .bind(dataset.size as i64)
        .bind(&dataset.description)
        .execute(pool)
        .await?;
    for attr in &dataset.attributes {
        sqlx::query("INSERT INTO attributes (name, \"set\", type, description) VALUES (?, ?, ?, ?)")
            .bind(&attr.name)
            .bind(&dataset.name)
            .bind(attr.atype.code() as i64)
            .bind(&attr.description)
            .execute(pool)
            .await?;
        if let Some(bounds) = attr.bounds {
            sqlx::query("INSERT INTO bounds (attribute, \"set\", lower, upper) VALUES (?, ?, ?, ?)")
                .bind(&attr.name)
                .bind(&dataset.name)
                .bind(bounds.lower)
                .bind(bounds.upper)
                .execute(pool)
                .await?;
        }
        for value in &attr.values {
            sqlx::query(
                "INSERT INTO \"values\" (attribute, \"set\", name, description) VALUES (?, ?, ?, ?)",
            )
            .bind(&attr.name)
            .bind(&dataset.name)
            .bind(&value.name)
            .bind(&value.description)
            .execute(pool)
            .await?;
        }
    }
    for processor in &dataset.processors {
        sqlx::query("INSERT INTO processors (\"set\", type) VALUES (?, ?)")
            .bind(&dataset.name)
            .bind(processor)
            .execute(pool)
            .await?;
    }
    Ok(())
}
