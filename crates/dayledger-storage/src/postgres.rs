//! Postgres-backed stores.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dayledger_core::{
    merge, CampaignSpend, DailyMetrics, DailyMetricsRecord, ProductCost, SyncJob, SyncJobStatus, SyncTrigger,
    SyncWindow,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::store::{fingerprint, MetricsStore, ProductCostStore, StoreError, SyncJobStore, UpsertOutcome};

const SELECT_METRICS: &str = r#"
    SELECT user_id, metric_date, order_count, revenue, cogs, ad_spend, shipping_cost,
           gross_profit, gross_profit_margin, net_profit, net_profit_margin,
           roas, poas, aov, cpp, cpc, ctr, cpm, reach, impressions, clicks,
           new_customers, returning_customers,
           total_shipments, delivered, in_transit, rto, ndr, delivery_rate, rto_rate, ndr_rate,
           campaign_breakdown, fingerprint, created_at, updated_at
      FROM daily_metrics
"#;

const UPSERT_METRICS: &str = r#"
    INSERT INTO daily_metrics (
        user_id, metric_date, order_count, revenue, cogs, ad_spend, shipping_cost,
        gross_profit, gross_profit_margin, net_profit, net_profit_margin,
        roas, poas, aov, cpp, cpc, ctr, cpm, reach, impressions, clicks,
        new_customers, returning_customers,
        total_shipments, delivered, in_transit, rto, ndr, delivery_rate, rto_rate, ndr_rate,
        campaign_breakdown, fingerprint, created_at, updated_at
    )
    VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
        $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33, $34, $34
    )
    ON CONFLICT (user_id, metric_date) DO UPDATE SET
        order_count = EXCLUDED.order_count,
        revenue = EXCLUDED.revenue,
        cogs = EXCLUDED.cogs,
        ad_spend = EXCLUDED.ad_spend,
        shipping_cost = EXCLUDED.shipping_cost,
        gross_profit = EXCLUDED.gross_profit,
        gross_profit_margin = EXCLUDED.gross_profit_margin,
        net_profit = EXCLUDED.net_profit,
        net_profit_margin = EXCLUDED.net_profit_margin,
        roas = EXCLUDED.roas,
        poas = EXCLUDED.poas,
        aov = EXCLUDED.aov,
        cpp = EXCLUDED.cpp,
        cpc = EXCLUDED.cpc,
        ctr = EXCLUDED.ctr,
        cpm = EXCLUDED.cpm,
        reach = EXCLUDED.reach,
        impressions = EXCLUDED.impressions,
        clicks = EXCLUDED.clicks,
        new_customers = EXCLUDED.new_customers,
        returning_customers = EXCLUDED.returning_customers,
        total_shipments = EXCLUDED.total_shipments,
        delivered = EXCLUDED.delivered,
        in_transit = EXCLUDED.in_transit,
        rto = EXCLUDED.rto,
        ndr = EXCLUDED.ndr,
        delivery_rate = EXCLUDED.delivery_rate,
        rto_rate = EXCLUDED.rto_rate,
        ndr_rate = EXCLUDED.ndr_rate,
        campaign_breakdown = EXCLUDED.campaign_breakdown,
        fingerprint = EXCLUDED.fingerprint,
        updated_at = EXCLUDED.updated_at
    RETURNING (xmax = 0) AS inserted
"#;

const SELECT_JOBS: &str = r#"
    SELECT id, user_id, trigger_kind, status, window_start, window_end,
           records_synced, errors, started_at, finished_at
      FROM sync_jobs
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn metrics_from_row(row: &PgRow) -> Result<DailyMetricsRecord, sqlx::Error> {
    let campaigns: Json<Vec<CampaignSpend>> = row.try_get("campaign_breakdown")?;
    Ok(DailyMetricsRecord {
        metrics: DailyMetrics {
            user_id: row.try_get("user_id")?,
            date: row.try_get("metric_date")?,
            order_count: row.try_get("order_count")?,
            revenue: row.try_get("revenue")?,
            cogs: row.try_get("cogs")?,
            ad_spend: row.try_get("ad_spend")?,
            shipping_cost: row.try_get("shipping_cost")?,
            gross_profit: row.try_get("gross_profit")?,
            gross_profit_margin: row.try_get("gross_profit_margin")?,
            net_profit: row.try_get("net_profit")?,
            net_profit_margin: row.try_get("net_profit_margin")?,
            roas: row.try_get("roas")?,
            poas: row.try_get("poas")?,
            aov: row.try_get("aov")?,
            cpp: row.try_get("cpp")?,
            cpc: row.try_get("cpc")?,
            ctr: row.try_get("ctr")?,
            cpm: row.try_get("cpm")?,
            reach: row.try_get("reach")?,
            impressions: row.try_get("impressions")?,
            clicks: row.try_get("clicks")?,
            new_customers: row.try_get("new_customers")?,
            returning_customers: row.try_get("returning_customers")?,
            total_shipments: row.try_get("total_shipments")?,
            delivered: row.try_get("delivered")?,
            in_transit: row.try_get("in_transit")?,
            rto: row.try_get("rto")?,
            ndr: row.try_get("ndr")?,
            delivery_rate: row.try_get("delivery_rate")?,
            rto_rate: row.try_get("rto_rate")?,
            ndr_rate: row.try_get("ndr_rate")?,
            campaigns: campaigns.0,
        },
        fingerprint: row.try_get("fingerprint")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cost_from_row(row: &PgRow) -> Result<ProductCost, sqlx::Error> {
    Ok(ProductCost {
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        name: row.try_get("name")?,
        unit_cost: row.try_get("unit_cost")?,
        is_estimate: row.try_get("is_estimate")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<SyncJob, StoreError> {
    let trigger: String = row.try_get("trigger_kind")?;
    let status: String = row.try_get("status")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        trigger: SyncTrigger::parse(&trigger)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown sync trigger {trigger:?}")))?,
        status: SyncJobStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown sync status {status:?}")))?,
        window: SyncWindow {
            start: row.try_get("window_start")?,
            end: row.try_get("window_end")?,
        },
        records_synced: row.try_get("records_synced")?,
        errors: row.try_get("errors")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn find(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyMetricsRecord>, StoreError> {
        let sql = format!("{SELECT_METRICS} WHERE user_id = $1 AND metric_date = $2");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(metrics_from_row).transpose()?)
    }

    async fn upsert(&self, incoming: DailyMetrics) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("{SELECT_METRICS} WHERE user_id = $1 AND metric_date = $2 FOR UPDATE");
        let existing = sqlx::query(&sql)
            .bind(&incoming.user_id)
            .bind(incoming.date)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(metrics_from_row)
            .transpose()?;

        let merged = merge(existing.as_ref().map(|r| &r.metrics), incoming);
        let fp = fingerprint(&merged)?;
        if existing.as_ref().is_some_and(|r| r.fingerprint == fp) {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged);
        }

        let m = &merged;
        let inserted: bool = sqlx::query(UPSERT_METRICS)
            .bind(&m.user_id)
            .bind(m.date)
            .bind(m.order_count)
            .bind(m.revenue)
            .bind(m.cogs)
            .bind(m.ad_spend)
            .bind(m.shipping_cost)
            .bind(m.gross_profit)
            .bind(m.gross_profit_margin)
            .bind(m.net_profit)
            .bind(m.net_profit_margin)
            .bind(m.roas)
            .bind(m.poas)
            .bind(m.aov)
            .bind(m.cpp)
            .bind(m.cpc)
            .bind(m.ctr)
            .bind(m.cpm)
            .bind(m.reach)
            .bind(m.impressions)
            .bind(m.clicks)
            .bind(m.new_customers)
            .bind(m.returning_customers)
            .bind(m.total_shipments)
            .bind(m.delivered)
            .bind(m.in_transit)
            .bind(m.rto)
            .bind(m.ndr)
            .bind(m.delivery_rate)
            .bind(m.rto_rate)
            .bind(m.ndr_rate)
            .bind(Json(&m.campaigns))
            .bind(&fp)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?
            .try_get("inserted")?;
        tx.commit().await?;

        debug!(user_id = %m.user_id, date = %m.date, inserted, "daily metrics written");
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyMetricsRecord>, StoreError> {
        let sql = format!(
            "{SELECT_METRICS} WHERE user_id = $1 AND metric_date BETWEEN $2 AND $3 ORDER BY metric_date"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(metrics_from_row(row)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ProductCostStore for PgStore {
    async fn costs_for(&self, user_id: &str, product_ids: &[String]) -> Result<Vec<ProductCost>, StoreError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT user_id, product_id, name, unit_cost, is_estimate, updated_at
              FROM product_costs
             WHERE user_id = $1
               AND product_id = ANY($2)
            "#,
        )
        .bind(user_id)
        .bind(product_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(cost_from_row(row)?);
        }
        Ok(out)
    }

    async fn insert_estimates(&self, estimates: &[ProductCost]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for estimate in estimates {
            let result = sqlx::query(
                r#"
                INSERT INTO product_costs (user_id, product_id, name, unit_cost, is_estimate, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (user_id, product_id) DO NOTHING
                "#,
            )
            .bind(&estimate.user_id)
            .bind(&estimate.product_id)
            .bind(&estimate.name)
            .bind(estimate.unit_cost)
            .bind(estimate.is_estimate)
            .bind(estimate.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn set_override(
        &self,
        user_id: &str,
        product_id: &str,
        unit_cost: f64,
        name: Option<String>,
    ) -> Result<ProductCost, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO product_costs (user_id, product_id, name, unit_cost, is_estimate, updated_at)
            VALUES ($1, $2, $3, $4, FALSE, NOW())
            ON CONFLICT (user_id, product_id) DO UPDATE SET
                unit_cost = EXCLUDED.unit_cost,
                name = COALESCE(EXCLUDED.name, product_costs.name),
                is_estimate = FALSE,
                updated_at = NOW()
            RETURNING user_id, product_id, name, unit_cost, is_estimate, updated_at
            "#,
        )
        .bind(user_id)
        .bind(product_id)
        .bind(name)
        .bind(unit_cost)
        .fetch_one(&self.pool)
        .await?;
        Ok(cost_from_row(&row)?)
    }
}

#[async_trait]
impl SyncJobStore for PgStore {
    async fn create(&self, job: &SyncJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, user_id, trigger_kind, status, window_start, window_end,
                records_synced, errors, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(job.trigger.as_str())
        .bind(job.status.as_str())
        .bind(job.window.start)
        .bind(job.window.end)
        .bind(job.records_synced)
        .bind(&job.errors)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(&self, job: &SyncJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = $2,
                   records_synced = $3,
                   errors = $4,
                   finished_at = $5
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.records_synced)
        .bind(&job.errors)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotRunning(job.id));
        }
        Ok(())
    }

    async fn find_running(&self, user_id: &str) -> Result<Option<SyncJob>, StoreError> {
        let sql = format!(
            "{SELECT_JOBS} WHERE user_id = $1 AND status = 'running' ORDER BY started_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).bind(user_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<SyncJob>, StoreError> {
        let sql = format!("{SELECT_JOBS} WHERE user_id = $1 ORDER BY started_at DESC LIMIT $2");
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }
}
