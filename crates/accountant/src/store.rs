//! SQLite-backed spend ledger. The cumulative spend for a user is always
//! the sum over their history rows; admission and the matching history
//! append happen in one transaction behind a single-writer lock so two
//! concurrent checks can never both read the pre-spend total.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dpq_policy::{AdmissionPolicy, HistoryEntry};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    UnknownUser(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "risk store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "risk store sql error: {}", err),
            StoreError::UnknownUser(user) => write!(f, "unknown user `{}`", user),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub info: String,
    pub total_threshold: f64,
    pub per_query_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageRecord {
    pub used: f64,
    pub total_threshold: f64,
    pub per_query_threshold: f64,
}

#[derive(Clone)]
pub struct RiskStore {
    pool: sqlx::SqlitePool,
    op_timeout: Duration,
    write_lock: Arc<Mutex<()>>,
}

impl RiskStore {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        // A single connection keeps SQLite writes serialized and makes
        // `sqlite::memory:` databases behave like one database.
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            SqlitePoolOptions::new().max_connections(1).connect_with(options),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            op_timeout,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, op_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// Register a user, or replace their info and thresholds. Spend history
    /// is never touched.
    pub async fn put_user(
        &self,
        id: &str,
        info: &str,
        total_threshold: f64,
        per_query_threshold: f64,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "INSERT INTO users (id, info, total_threshold, per_query_threshold) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET info = excluded.info, \
                 total_threshold = excluded.total_threshold, \
                 per_query_threshold = excluded.per_query_threshold",
            )
            .bind(id)
            .bind(info)
            .bind(total_threshold)
            .bind(per_query_threshold)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn fetch_user(&self, id: &str) -> Result<UserRecord, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "SELECT id, info, total_threshold, per_query_threshold FROM users WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??
        .ok_or_else(|| StoreError::UnknownUser(id.to_string()))?;

        Ok(UserRecord {
            id: row.try_get("id")?,
            info: row.try_get("info")?,
            total_threshold: row.try_get("total_threshold")?,
            per_query_threshold: row.try_get("per_query_threshold")?,
        })
    }

    /// Thresholds plus cumulative spend; zero spend for an empty history.
    pub async fn usage(&self, id: &str) -> Result<UsageRecord, StoreError> {
        let user = self.fetch_user(id).await?;
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query("SELECT COALESCE(SUM(eps), 0.0) AS used FROM history WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(UsageRecord {
            used: row.try_get("used")?,
            total_threshold: user.total_threshold,
            per_query_threshold: user.per_query_threshold,
        })
    }

    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = tokio::time::timeout(
            self.op_timeout,
            sqlx::query("SELECT eps, timestamp FROM history WHERE id = ? ORDER BY entry_id")
                .bind(id)
                .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        rows.into_iter()
            .map(|row| {
                Ok(HistoryEntry {
                    eps: row.try_get("eps")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    /// Decide admission and, when granted, append the spend — atomically.
    pub async fn check_and_record(
        &self,
        id: &str,
        eps: f64,
        policy: &dyn AdmissionPolicy,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        let granted = tokio::time::timeout(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;

            let user = sqlx::query(
                "SELECT total_threshold, per_query_threshold FROM users WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::UnknownUser(id.to_string()))?;
            let total_threshold: f64 = user.try_get("total_threshold")?;
            let per_query_threshold: f64 = user.try_get("per_query_threshold")?;

            let used: f64 =
                sqlx::query("SELECT COALESCE(SUM(eps), 0.0) AS used FROM history WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?
                    .try_get("used")?;

            let history_rows =
                sqlx::query("SELECT eps, timestamp FROM history WHERE id = ? ORDER BY entry_id")
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await?;
            let history: Vec<HistoryEntry> = history_rows
                .into_iter()
                .map(|row| {
                    Ok::<_, sqlx::Error>(HistoryEntry {
                        eps: row.try_get("eps")?,
                        timestamp: row.try_get("timestamp")?,
                    })
                })
                .collect::<Result<_, _>>()?;

            let granted = policy.admit(eps, total_threshold, per_query_threshold, used, &history);
            if granted {
                sqlx::query("INSERT INTO history (id, eps) VALUES (?, ?)")
                    .bind(id)
                    .bind(eps)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok::<bool, StoreError>(granted)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(granted)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpq_policy::ThresholdPolicy;

    async fn memory_store() -> RiskStore {
        let store = RiskStore::connect_and_migrate("sqlite::memory:", Duration::from_secs(2))
            .await
            .expect("in-memory store should open");
        store
    }

    #[tokio::test]
    async fn unknown_users_are_reported_as_such() {
        let store = memory_store().await;
        assert!(matches!(
            store.usage("nobody").await,
            Err(StoreError::UnknownUser(_))
        ));
        assert!(matches!(
            store.check_and_record("nobody", 1.0, &ThresholdPolicy).await,
            Err(StoreError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn empty_history_reads_as_zero_spend() {
        let store = memory_store().await;
        store.put_user("alice", "analyst", 10.0, 3.0).await.unwrap();

        let usage = store.usage("alice").await.unwrap();
        assert_eq!(usage.used, 0.0);
        assert_eq!(usage.total_threshold, 10.0);
        assert_eq!(usage.per_query_threshold, 3.0);
        assert!(store.history("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn granted_spends_accumulate_and_denied_spends_do_not() {
        let store = memory_store().await;
        store.put_user("alice", "", 10.0, 3.0).await.unwrap();

        // 2 + 2 + 2 + 2 admitted, then 3 would overshoot the total of 10
        for _ in 0..4 {
            assert!(store
                .check_and_record("alice", 2.0, &ThresholdPolicy)
                .await
                .unwrap());
        }
        assert!(!store
            .check_and_record("alice", 3.0, &ThresholdPolicy)
            .await
            .unwrap());

        let usage = store.usage("alice").await.unwrap();
        assert_eq!(usage.used, 8.0);
        assert_eq!(store.history("alice").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cumulative_spend_never_exceeds_the_total_threshold() {
        let store = memory_store().await;
        store.put_user("bob", "", 5.0, 2.0).await.unwrap();

        let requests = [1.5, 2.0, 0.5, 2.0, 1.0, 0.4, 2.0, 0.1];
        for eps in requests {
            let _ = store.check_and_record("bob", eps, &ThresholdPolicy).await.unwrap();
            let usage = store.usage("bob").await.unwrap();
            assert!(
                usage.used <= usage.total_threshold + 1e-9,
                "spend {} exceeded threshold {}",
                usage.used,
                usage.total_threshold
            );
        }
    }

    #[tokio::test]
    async fn concurrent_checks_cannot_double_spend() {
        let store = memory_store().await;
        store.put_user("carol", "", 4.0, 4.0).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.check_and_record("carol", 3.0, &ThresholdPolicy).await
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                granted += 1;
            }
        }
        // Only one 3.0 spend fits under the total of 4.0.
        assert_eq!(granted, 1);
        assert_eq!(store.usage("carol").await.unwrap().used, 3.0);
    }

    #[tokio::test]
    async fn put_user_updates_thresholds_without_clearing_history() {
        let store = memory_store().await;
        store.put_user("dave", "", 10.0, 5.0).await.unwrap();
        assert!(store
            .check_and_record("dave", 4.0, &ThresholdPolicy)
            .await
            .unwrap());

        store.put_user("dave", "promoted", 20.0, 5.0).await.unwrap();
        let usage = store.usage("dave").await.unwrap();
        assert_eq!(usage.used, 4.0);
        assert_eq!(usage.total_threshold, 20.0);
    }
}
