//! Core domain model for dayledger: raw source records, canonical daily metrics,
//! product costs and sync job bookkeeping.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod dates;
pub mod merge;
pub mod metrics;

pub use dates::{business_midnight_utc, business_today, business_tz, parse_source_date, DateParseError};
pub use merge::merge;
pub use metrics::{compute_daily_metrics, summarize, CohortOrder, CostLookup, DayCohort, MetricsSummary};

pub const CRATE_NAME: &str = "dayledger-core";

/// The three external systems a merchant's day is reconciled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Orders,
    Ads,
    Shipments,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Orders, SourceKind::Ads, SourceKind::Shipments];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Orders => "orders",
            SourceKind::Ads => "ads",
            SourceKind::Shipments => "shipments",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub name: Option<String>,
    pub quantity: u32,
    pub unit_price: f64,
}

/// One order as handed over by the commerce adapter. `created_at` is kept raw;
/// it is only interpreted by the date grouping stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrderRecord {
    pub external_id: String,
    pub created_at: String,
    pub total: f64,
    pub line_items: Vec<LineItem>,
    pub customer_id: Option<String>,
}

/// Day-bucketed ad insight, account level when `campaign_id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAdInsight {
    pub date: String,
    pub spend: f64,
    pub reach: u64,
    pub impressions: u64,
    pub clicks: u64,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
}

impl RawAdInsight {
    pub fn is_campaign_level(&self) -> bool {
        self.campaign_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Delivered,
    InTransit,
    Rto,
    Ndr,
    Other,
}

impl ShipmentStatus {
    /// Maps a carrier/aggregator status token onto the canonical buckets.
    /// RTO wins over everything else ("RTO DELIVERED" is a return, not a delivery).
    pub fn from_token(token: &str) -> Self {
        let upper = token.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        if upper.contains("RTO") {
            ShipmentStatus::Rto
        } else if upper.contains("NDR") || upper.contains("UNDELIVERED") {
            ShipmentStatus::Ndr
        } else if upper == "DELIVERED" {
            ShipmentStatus::Delivered
        } else if upper.contains("TRANSIT")
            || upper.contains("SHIPPED")
            || upper.contains("OUT FOR DELIVERY")
            || upper.contains("PICKED UP")
            || upper.contains("REACHED")
        {
            ShipmentStatus::InTransit
        } else {
            ShipmentStatus::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ShipmentCharges {
    pub freight: f64,
    pub cod: f64,
    pub other: f64,
}

impl ShipmentCharges {
    pub fn total(&self) -> f64 {
        self.freight + self.cod + self.other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawShipment {
    pub external_id: String,
    pub status: ShipmentStatus,
    pub created_at: String,
    pub charges: ShipmentCharges,
}

/// Unit cost of one product for one merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCost {
    pub user_id: String,
    pub product_id: String,
    pub name: Option<String>,
    pub unit_cost: f64,
    /// `true` while the cost is the automatic price-based estimate.
    pub is_estimate: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSpend {
    pub campaign_id: String,
    pub campaign_name: Option<String>,
    pub spend: f64,
    pub reach: i64,
    pub impressions: i64,
    pub clicks: i64,
}

/// Canonical aggregate for one merchant and one business day.
///
/// Invariants: `gross_profit = revenue - cogs`,
/// `net_profit = gross_profit - ad_spend - shipping_cost`, and every ratio is
/// exactly `0.0` when its denominator is zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyMetrics {
    pub user_id: String,
    pub date: NaiveDate,

    pub order_count: i64,
    pub revenue: f64,
    pub cogs: f64,
    pub ad_spend: f64,
    pub shipping_cost: f64,

    pub gross_profit: f64,
    pub gross_profit_margin: f64,
    pub net_profit: f64,
    pub net_profit_margin: f64,

    pub roas: f64,
    pub poas: f64,
    pub aov: f64,
    pub cpp: f64,
    pub cpc: f64,
    pub ctr: f64,
    pub cpm: f64,

    pub reach: i64,
    pub impressions: i64,
    pub clicks: i64,

    pub new_customers: i64,
    pub returning_customers: i64,

    pub total_shipments: i64,
    pub delivered: i64,
    pub in_transit: i64,
    pub rto: i64,
    pub ndr: i64,
    pub delivery_rate: f64,
    pub rto_rate: f64,
    pub ndr_rate: f64,

    pub campaigns: Vec<CampaignSpend>,
}

/// A persisted [`DailyMetrics`] row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyMetricsRecord {
    #[serde(flatten)]
    pub metrics: DailyMetrics,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Running,
    Completed,
    Failed,
}

impl SyncJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobStatus::Running => "running",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(SyncJobStatus::Running),
            "completed" => Some(SyncJobStatus::Completed),
            "failed" => Some(SyncJobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Scheduled,
    Manual,
    Onboarding,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Onboarding => "onboarding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(SyncTrigger::Scheduled),
            "manual" => Some(SyncTrigger::Manual),
            "onboarding" => Some(SyncTrigger::Onboarding),
            _ => None,
        }
    }
}

/// Inclusive range of business days a sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sync window: start {start} is after end {end}")]
pub struct InvalidWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SyncWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidWindow> {
        if start > end {
            return Err(InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// The `days` business days ending on (and including) `end`.
    pub fn trailing(end: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: end - chrono::Duration::days(span),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn day_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// One pipeline invocation for one user. Finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: Uuid,
    pub user_id: String,
    pub trigger: SyncTrigger,
    pub status: SyncJobStatus,
    pub window: SyncWindow,
    pub records_synced: i64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn start(user_id: &str, trigger: SyncTrigger, window: SyncWindow, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            trigger,
            status: SyncJobStatus::Running,
            window,
            records_synced: 0,
            errors: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    /// A running job older than `max_age` is assumed abandoned (crashed process).
    pub fn is_in_flight(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.status == SyncJobStatus::Running && now - self.started_at < max_age
    }
}
