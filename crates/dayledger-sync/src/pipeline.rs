//! One user's sync run: fetch, group, cost, compute, merge, upsert, and the
//! SyncJob bookkeeping around it.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dayledger_adapters::{AdSource, AdapterError, OrderSource, ShipmentSource, SourceAdapter};
use dayledger_core::{
    compute_daily_metrics, CostLookup, SourceKind, SyncJob, SyncJobStatus, SyncTrigger, SyncWindow,
};
use dayledger_storage::{MetricsStore, ProductCostStore, SyncJobStore, UpsertOutcome};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::costs::CostResolver;
use crate::grouping::{group_by_day, SourceBatch};
use crate::registry::MerchantCredentials;
use crate::retry::RetryExecutor;

pub const NO_CREDENTIALS: &str = "no source credentials configured";
pub const ALL_SOURCES_FAILED: &str = "every configured source failed, nothing to sync";

#[derive(Clone)]
pub struct SyncSources {
    pub orders: Arc<OrderSource>,
    pub ads: Arc<AdSource>,
    pub shipments: Arc<ShipmentSource>,
}

#[derive(Clone)]
pub struct SyncStores {
    pub metrics: Arc<dyn MetricsStore>,
    pub costs: Arc<dyn ProductCostStore>,
    pub jobs: Arc<dyn SyncJobStore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub job_id: Uuid,
    pub status: SyncJobStatus,
    pub records_synced: i64,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: Vec<String>,
    pub parse_warnings: usize,
}

/// Per-source fetch results; `None` means no credentials for that source.
struct Fetched<T> {
    source: SourceKind,
    result: Option<Result<Vec<T>, AdapterError>>,
}

impl<T> Fetched<T> {
    fn take(self, errors: &mut Vec<String>) -> (Vec<T>, bool) {
        match self.result {
            None => (Vec::new(), false),
            Some(Ok(records)) => (records, true),
            Some(Err(error)) => {
                errors.push(format!("{}: {error}", self.source));
                (Vec::new(), false)
            }
        }
    }
}

#[derive(Clone)]
pub struct SyncPipeline {
    sources: SyncSources,
    stores: SyncStores,
    executor: RetryExecutor,
    costs: CostResolver,
}

impl SyncPipeline {
    pub fn new(sources: SyncSources, stores: SyncStores, executor: RetryExecutor) -> Self {
        let costs = CostResolver::new(stores.costs.clone());
        Self {
            sources,
            stores,
            executor,
            costs,
        }
    }

    pub fn stores(&self) -> &SyncStores {
        &self.stores
    }

    /// Runs one sync and finalizes its SyncJob. Source, cost and per-date
    /// persistence failures end up in the outcome's error list; only job
    /// bookkeeping failures are returned as `Err`.
    pub async fn run(
        &self,
        user_id: &str,
        credentials: &MerchantCredentials,
        window: SyncWindow,
        trigger: SyncTrigger,
    ) -> Result<SyncOutcome> {
        let span = info_span!(
            "sync_run",
            user_id,
            trigger = trigger.as_str(),
            start = %window.start,
            end = %window.end
        );
        async move {
            let mut job = SyncJob::start(user_id, trigger, window, Utc::now());
            self.stores
                .jobs
                .create(&job)
                .await
                .with_context(|| format!("recording sync job for {user_id}"))?;

            let mut outcome = self.execute(user_id, credentials, window).await;
            outcome.job_id = job.id;

            job.status = outcome.status;
            job.records_synced = outcome.records_synced;
            job.errors = outcome.errors.clone();
            job.finished_at = Some(Utc::now());
            self.stores
                .jobs
                .finish(&job)
                .await
                .with_context(|| format!("finalizing sync job {}", job.id))?;

            info!(
                status = job.status.as_str(),
                records_synced = outcome.records_synced,
                created = outcome.created,
                updated = outcome.updated,
                unchanged = outcome.unchanged,
                errors = outcome.errors.len(),
                parse_warnings = outcome.parse_warnings,
                "sync run finished"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, user_id: &str, credentials: &MerchantCredentials, window: SyncWindow) -> SyncOutcome {
        let mut outcome = SyncOutcome {
            job_id: Uuid::nil(),
            status: SyncJobStatus::Completed,
            records_synced: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            errors: Vec::new(),
            parse_warnings: 0,
        };

        let configured = credentials.configured_sources();
        if configured == 0 {
            warn!("no source credentials configured, nothing to sync");
            outcome.status = SyncJobStatus::Failed;
            outcome.errors.push(NO_CREDENTIALS.to_string());
            return outcome;
        }

        let (orders, ads, shipments) = tokio::join!(
            self.fetch_from(&self.sources.orders, credentials.shopify.as_ref(), window),
            self.fetch_from(&self.sources.ads, credentials.meta.as_ref(), window),
            self.fetch_from(&self.sources.shipments, credentials.shiprocket.as_ref(), window),
        );
        let (orders, orders_ok) = orders.take(&mut outcome.errors);
        let (ads, ads_ok) = ads.take(&mut outcome.errors);
        let (shipments, shipments_ok) = shipments.take(&mut outcome.errors);

        if !(orders_ok || ads_ok || shipments_ok) {
            outcome.status = SyncJobStatus::Failed;
            outcome.errors.push(ALL_SOURCES_FAILED.to_string());
            return outcome;
        }

        let lookup = match self.costs.resolve(user_id, &orders, Utc::now()).await {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!(error = %err, "cost resolution failed, falling back to revenue ratio");
                outcome.errors.push(format!("product costs: {err}"));
                CostLookup::new()
            }
        };

        let grouped = group_by_day(SourceBatch { orders, ads, shipments }, window);
        for warning in &grouped.warnings {
            warn!(source = %warning.source, raw = %warning.raw, "dropping record with unparseable timestamp");
        }
        outcome.parse_warnings = grouped.warnings.len();
        if outcome.parse_warnings > 0 {
            outcome
                .errors
                .push(format!("{} records dropped: unparseable timestamps", outcome.parse_warnings));
        }
        if grouped.out_of_window > 0 {
            debug!(count = grouped.out_of_window, "ignored records outside the window");
        }

        for (date, cohort) in &grouped.cohorts {
            let metrics = compute_daily_metrics(user_id, cohort, &lookup);
            match self.stores.metrics.upsert(metrics).await {
                Ok(UpsertOutcome::Created) => outcome.created += 1,
                Ok(UpsertOutcome::Updated) => outcome.updated += 1,
                Ok(UpsertOutcome::Unchanged) => outcome.unchanged += 1,
                Err(err) => {
                    error!(%date, error = %err, "persisting daily metrics failed");
                    outcome.errors.push(format!("{date}: {err}"));
                }
            }
        }
        outcome.records_synced = (outcome.created + outcome.updated + outcome.unchanged) as i64;
        outcome
    }

    /// Fetches one source through the retry executor. `None` credentials
    /// skip the source without an error.
    async fn fetch_from<C, R>(
        &self,
        source: &Arc<dyn SourceAdapter<Credentials = C, Record = R>>,
        credentials: Option<&C>,
        window: SyncWindow,
    ) -> Fetched<R>
    where
        C: Send + Sync + 'static,
        R: Send + 'static,
    {
        let kind = source.source();
        let result = match credentials {
            None => {
                debug!(source = %kind, "no credentials, skipping source");
                None
            }
            Some(creds) => Some(
                self.executor
                    .run(kind, |_| {
                        let source = source.clone();
                        async move { source.fetch(creds, window).await }
                    })
                    .await,
            ),
        };
        Fetched { source: kind, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, merchant, shipment_record, Harness};
    use chrono::NaiveDate;
    use dayledger_core::ShipmentStatus;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, d).unwrap()
    }

    fn window() -> SyncWindow {
        SyncWindow::new(day(20), day(27)).unwrap()
    }

    async fn run(h: &Harness) -> SyncOutcome {
        h.pipeline
            .run("u1", &merchant("u1").credentials, window(), SyncTrigger::Manual)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_run_persists_one_record_per_day() {
        let h = harness();
        let outcome = run(&h).await;

        assert_eq!(outcome.status, SyncJobStatus::Completed);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.records_synced, 2);
        assert_eq!(outcome.created, 2);

        let stored = h.store.range("u1", day(20), day(27)).await.unwrap();
        let scenario = &stored.iter().find(|r| r.metrics.date == day(26)).unwrap().metrics;
        assert_eq!(scenario.order_count, 3);
        assert!((scenario.revenue - 5997.0).abs() < 1e-9);
        assert!((scenario.cogs - 2398.8).abs() < 1e-6);
        assert!((scenario.net_profit - 3068.2).abs() < 1e-6);
        assert_eq!(scenario.total_shipments, 1);
        assert_eq!(scenario.new_customers, 2);
        assert_eq!(scenario.returning_customers, 1);

        let jobs = h.store.all_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, SyncJobStatus::Completed);
        assert_eq!(jobs[0].records_synced, 2);
        assert!(jobs[0].finished_at.is_some());
        assert_eq!(jobs[0].id, outcome.job_id);
    }

    #[tokio::test]
    async fn rerunning_identical_data_changes_nothing() {
        let h = harness();
        run(&h).await;
        let before = h.store.all_metrics().await;

        let again = run(&h).await;
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.created + again.updated, 0);

        let after = h.store.all_metrics().await;
        let strip = |records: Vec<dayledger_core::DailyMetricsRecord>| {
            records
                .into_iter()
                .map(|r| (r.metrics, r.fingerprint))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(before), strip(after));
    }

    #[tokio::test]
    async fn failing_shipments_leave_one_error_and_other_fields_intact() {
        let h = harness();
        h.shipments.fail_always();
        let outcome = run(&h).await;

        assert_eq!(outcome.status, SyncJobStatus::Completed);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("shipments:"), "{}", outcome.errors[0]);
        assert_eq!(h.shipments.calls(), 3);

        let record = h.store.find("u1", day(26)).await.unwrap().unwrap().metrics;
        assert!((record.revenue - 5997.0).abs() < 1e-9);
        assert_eq!(record.ad_spend, 450.0);
        assert!((record.roas - 13.326).abs() < 0.01);
        assert_eq!(record.total_shipments, 0);
    }

    #[tokio::test]
    async fn empty_shipment_fetch_preserves_stored_shipments() {
        let h = harness();
        run(&h).await;
        h.shipments.set_records(vec![]);
        let outcome = run(&h).await;
        assert!(outcome.errors.is_empty());

        let record = h.store.find("u1", day(26)).await.unwrap().unwrap().metrics;
        assert_eq!(record.total_shipments, 1);
        assert_eq!(record.shipping_cost, 80.0);
        assert!((record.net_profit - 3068.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn shipment_only_day_is_recorded() {
        let h = harness();
        h.shipments.set_records(vec![
            shipment_record("s1", "26th Oct 2024 08:11 AM", ShipmentStatus::Delivered, 80.0),
            shipment_record("s2", "21st Oct 2024 11:00 AM", ShipmentStatus::Rto, 60.0),
        ]);
        let outcome = run(&h).await;
        assert_eq!(outcome.records_synced, 3);

        let record = h.store.find("u1", day(21)).await.unwrap().unwrap().metrics;
        assert_eq!(record.order_count, 0);
        assert_eq!(record.rto, 1);
        assert_eq!(record.rto_rate, 100.0);
        assert_eq!(record.net_profit, -60.0);
    }

    #[tokio::test]
    async fn persistence_failure_is_recorded_per_date() {
        let h = harness();
        h.store.fail_upserts_on(day(27)).await;
        let outcome = run(&h).await;

        assert_eq!(outcome.status, SyncJobStatus::Completed);
        assert_eq!(outcome.records_synced, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("2024-10-27"));
        assert!(h.store.find("u1", day(26)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unparseable_timestamps_are_counted_not_fatal() {
        let h = harness();
        let mut orders = h.orders.records();
        orders[0].created_at = "not a timestamp".into();
        h.orders.set_records(orders);

        let outcome = run(&h).await;
        assert_eq!(outcome.status, SyncJobStatus::Completed);
        assert_eq!(outcome.parse_warnings, 1);
        assert_eq!(outcome.errors, vec!["1 records dropped: unparseable timestamps".to_string()]);
        let record = h.store.find("u1", day(26)).await.unwrap().unwrap().metrics;
        assert_eq!(record.order_count, 2);

        let job = &h.store.all_jobs().await[0];
        assert_eq!(job.errors, outcome.errors);
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_run() {
        let h = harness();
        let outcome = h
            .pipeline
            .run("u1", &MerchantCredentials::default(), window(), SyncTrigger::Manual)
            .await
            .unwrap();

        assert_eq!(outcome.status, SyncJobStatus::Failed);
        assert_eq!(outcome.errors, vec![NO_CREDENTIALS.to_string()]);
        assert_eq!(h.orders.calls(), 0);
        assert_eq!(h.store.all_jobs().await[0].status, SyncJobStatus::Failed);
    }

    #[tokio::test]
    async fn absent_source_is_skipped_without_error() {
        let h = harness();
        let mut credentials = merchant("u1").credentials;
        credentials.shiprocket = None;
        let outcome = h
            .pipeline
            .run("u1", &credentials, window(), SyncTrigger::Manual)
            .await
            .unwrap();

        assert!(outcome.errors.is_empty());
        assert_eq!(h.shipments.calls(), 0);
        let record = h.store.find("u1", day(26)).await.unwrap().unwrap().metrics;
        assert_eq!(record.total_shipments, 0);
    }

    #[tokio::test]
    async fn every_configured_source_failing_fails_the_run() {
        let h = harness();
        h.orders.fail_always();
        h.ads.fail_always();
        h.shipments.fail_always();
        let outcome = run(&h).await;

        assert_eq!(outcome.status, SyncJobStatus::Failed);
        assert_eq!(outcome.errors.len(), 4);
        assert_eq!(outcome.errors.last().map(String::as_str), Some(ALL_SOURCES_FAILED));
        assert_eq!(outcome.records_synced, 0);
        assert_eq!(h.store.all_jobs().await[0].errors, outcome.errors);
    }

    #[tokio::test]
    async fn estimated_costs_are_persisted_for_later_runs() {
        let h = harness();
        run(&h).await;
        let costs = h.store.costs_for("u1", &["p-kurta".to_string()]).await.unwrap();
        assert_eq!(costs.len(), 1);
        assert!(costs[0].is_estimate);
        assert!((costs[0].unit_cost - 799.6).abs() < 1e-9);
    }
}
