//! In-process implementation of the store traits, used by tests and dry runs.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dayledger_core::{merge, DailyMetrics, DailyMetricsRecord, ProductCost, SyncJob, SyncJobStatus};
use tokio::sync::Mutex;

use crate::store::{fingerprint, MetricsStore, ProductCostStore, StoreError, SyncJobStore, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryStore {
    metrics: Mutex<BTreeMap<(String, NaiveDate), DailyMetricsRecord>>,
    costs: Mutex<BTreeMap<(String, String), ProductCost>>,
    jobs: Mutex<Vec<SyncJob>>,
    failing_dates: Mutex<HashSet<NaiveDate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent upsert for `date` fail.
    pub async fn fail_upserts_on(&self, date: NaiveDate) {
        self.failing_dates.lock().await.insert(date);
    }

    pub async fn all_metrics(&self) -> Vec<DailyMetricsRecord> {
        self.metrics.lock().await.values().cloned().collect()
    }

    pub async fn all_jobs(&self) -> Vec<SyncJob> {
        self.jobs.lock().await.clone()
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn find(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyMetricsRecord>, StoreError> {
        let metrics = self.metrics.lock().await;
        Ok(metrics.get(&(user_id.to_string(), date)).cloned())
    }

    async fn upsert(&self, incoming: DailyMetrics) -> Result<UpsertOutcome, StoreError> {
        if self.failing_dates.lock().await.contains(&incoming.date) {
            return Err(StoreError::Unavailable(format!("injected failure for {}", incoming.date)));
        }

        let key = (incoming.user_id.clone(), incoming.date);
        let mut metrics = self.metrics.lock().await;
        let existing = metrics.get(&key);
        let merged = merge(existing.map(|r| &r.metrics), incoming);
        let fp = fingerprint(&merged)?;
        let now = Utc::now();

        let (created_at, outcome) = match existing {
            Some(record) if record.fingerprint == fp => return Ok(UpsertOutcome::Unchanged),
            Some(record) => (record.created_at, UpsertOutcome::Updated),
            None => (now, UpsertOutcome::Created),
        };
        metrics.insert(
            key,
            DailyMetricsRecord {
                metrics: merged,
                fingerprint: fp,
                created_at,
                updated_at: now,
            },
        );
        Ok(outcome)
    }

    async fn range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyMetricsRecord>, StoreError> {
        let metrics = self.metrics.lock().await;
        Ok(metrics
            .range((user_id.to_string(), start)..=(user_id.to_string(), end))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[async_trait]
impl ProductCostStore for MemoryStore {
    async fn costs_for(&self, user_id: &str, product_ids: &[String]) -> Result<Vec<ProductCost>, StoreError> {
        let costs = self.costs.lock().await;
        Ok(product_ids
            .iter()
            .filter_map(|id| costs.get(&(user_id.to_string(), id.clone())).cloned())
            .collect())
    }

    async fn insert_estimates(&self, estimates: &[ProductCost]) -> Result<u64, StoreError> {
        let mut costs = self.costs.lock().await;
        let mut inserted = 0;
        for estimate in estimates {
            let key = (estimate.user_id.clone(), estimate.product_id.clone());
            if !costs.contains_key(&key) {
                costs.insert(key, estimate.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn set_override(
        &self,
        user_id: &str,
        product_id: &str,
        unit_cost: f64,
        name: Option<String>,
    ) -> Result<ProductCost, StoreError> {
        let mut costs = self.costs.lock().await;
        let key = (user_id.to_string(), product_id.to_string());
        let name = name.or_else(|| costs.get(&key).and_then(|c| c.name.clone()));
        let cost = ProductCost {
            user_id: user_id.to_string(),
            product_id: product_id.to_string(),
            name,
            unit_cost,
            is_estimate: false,
            updated_at: Utc::now(),
        };
        costs.insert(key, cost.clone());
        Ok(cost)
    }
}

#[async_trait]
impl SyncJobStore for MemoryStore {
    async fn create(&self, job: &SyncJob) -> Result<(), StoreError> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }

    async fn finish(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .iter_mut()
            .find(|j| j.id == job.id && j.status == SyncJobStatus::Running)
            .ok_or(StoreError::JobNotRunning(job.id))?;
        *stored = job.clone();
        Ok(())
    }

    async fn find_running(&self, user_id: &str) -> Result<Option<SyncJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .iter()
            .filter(|j| j.user_id == user_id && j.status == SyncJobStatus::Running)
            .max_by_key(|j| j.started_at)
            .cloned())
    }

    async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<SyncJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut out = jobs
            .iter()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}
