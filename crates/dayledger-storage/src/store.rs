//! Persistence contracts for daily metrics, product costs and sync jobs.

use async_trait::async_trait;
use chrono::NaiveDate;
use dayledger_core::{DailyMetrics, DailyMetricsRecord, ProductCost, SyncJob};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("sync job {0} is not running")]
    JobNotRunning(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The merged record was identical to the stored one; nothing was written.
    Unchanged,
}

/// SHA-256 over the serialized metrics. Timestamps are not part of
/// [`DailyMetrics`], so identical computations hash identically.
pub fn fingerprint(metrics: &DailyMetrics) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(metrics)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Idempotent per-(user, date) store for [`DailyMetrics`].
///
/// `upsert` applies [`dayledger_core::merge`] against the stored row inside
/// one atomic step per document; the last completed upsert wins.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn find(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyMetricsRecord>, StoreError>;

    async fn upsert(&self, incoming: DailyMetrics) -> Result<UpsertOutcome, StoreError>;

    /// Records for `user_id` with `start <= date <= end`, ordered by date.
    async fn range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyMetricsRecord>, StoreError>;
}

#[async_trait]
pub trait ProductCostStore: Send + Sync {
    async fn costs_for(&self, user_id: &str, product_ids: &[String]) -> Result<Vec<ProductCost>, StoreError>;

    /// Inserts each estimate unless a cost already exists for that product.
    /// Returns how many rows were inserted.
    async fn insert_estimates(&self, estimates: &[ProductCost]) -> Result<u64, StoreError>;

    /// Replaces any existing cost with a user-supplied one. Already persisted
    /// days are not recomputed.
    async fn set_override(
        &self,
        user_id: &str,
        product_id: &str,
        unit_cost: f64,
        name: Option<String>,
    ) -> Result<ProductCost, StoreError>;
}

#[async_trait]
pub trait SyncJobStore: Send + Sync {
    async fn create(&self, job: &SyncJob) -> Result<(), StoreError>;

    /// Writes the terminal state. Fails with [`StoreError::JobNotRunning`] if
    /// the job was already finalized.
    async fn finish(&self, job: &SyncJob) -> Result<(), StoreError>;

    /// Most recently started job still marked running for the user.
    async fn find_running(&self, user_id: &str) -> Result<Option<SyncJob>, StoreError>;

    async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<SyncJob>, StoreError>;
}
