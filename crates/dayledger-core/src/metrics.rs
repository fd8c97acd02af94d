//! Pure daily metrics calculation.
//!
//! [`compute_daily_metrics`] turns one day's cohort plus a product cost lookup
//! into a fully populated [`DailyMetrics`]. No I/O happens here. Every ratio is
//! zero-guarded on its denominator and every float leaving this module is
//! finite.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{CampaignSpend, DailyMetrics, RawAdInsight, RawOrderRecord, RawShipment, ShipmentStatus};

/// Share of revenue (or of unit price) assumed to be cost of goods when no
/// cost is on file.
pub const DEFAULT_COST_RATIO: f64 = 0.4;

/// Product id -> unit cost.
pub type CostLookup = HashMap<String, f64>;

/// An order inside a cohort. `returning` is decided over the whole fetched
/// window by the grouping stage, not per day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortOrder {
    pub order: RawOrderRecord,
    pub returning: bool,
}

/// All raw records attributed to one business day.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DayCohort {
    pub date: NaiveDate,
    pub orders: Vec<CohortOrder>,
    pub ad_insight: Option<RawAdInsight>,
    pub campaigns: Vec<RawAdInsight>,
    pub shipments: Vec<RawShipment>,
}

impl DayCohort {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            ..Default::default()
        }
    }
}

/// Coerces NaN and infinities to zero.
pub fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// `numerator / denominator`, or exactly `0.0` when the denominator is zero
/// or the quotient is not finite.
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    sanitize(numerator / denominator)
}

pub fn compute_daily_metrics(user_id: &str, cohort: &DayCohort, costs: &CostLookup) -> DailyMetrics {
    let order_count = cohort.orders.len() as i64;
    let revenue: f64 = cohort.orders.iter().map(|o| sanitize(o.order.total)).sum();

    let mut cogs: f64 = cohort
        .orders
        .iter()
        .flat_map(|o| o.order.line_items.iter())
        .filter_map(|item| {
            costs
                .get(&item.product_id)
                .map(|unit_cost| sanitize(unit_cost * f64::from(item.quantity)))
        })
        .sum();
    if cogs == 0.0 && revenue > 0.0 {
        cogs = revenue * DEFAULT_COST_RATIO;
    }

    let campaigns = campaign_breakdown(&cohort.campaigns);
    let ad_spend = if campaigns.is_empty() {
        cohort.ad_insight.as_ref().map(|a| sanitize(a.spend)).unwrap_or(0.0)
    } else {
        campaigns.iter().map(|c| c.spend).sum()
    };
    let (reach, impressions, clicks) = match &cohort.ad_insight {
        Some(account) => (
            account.reach as i64,
            account.impressions as i64,
            account.clicks as i64,
        ),
        None => campaigns.iter().fold((0, 0, 0), |(r, i, c), camp| {
            (r + camp.reach, i + camp.impressions, c + camp.clicks)
        }),
    };

    let new_customers = cohort.orders.iter().filter(|o| !o.returning).count() as i64;
    let returning_customers = order_count - new_customers;

    let mut shipments = ShipmentTally::default();
    for shipment in &cohort.shipments {
        shipments.add(shipment);
    }

    let mut metrics = DailyMetrics {
        user_id: user_id.to_string(),
        date: cohort.date,
        order_count,
        revenue,
        cogs,
        ad_spend,
        shipping_cost: shipments.cost,
        reach,
        impressions,
        clicks,
        new_customers,
        returning_customers,
        total_shipments: shipments.total,
        delivered: shipments.delivered,
        in_transit: shipments.in_transit,
        rto: shipments.rto,
        ndr: shipments.ndr,
        campaigns,
        ..Default::default()
    };
    metrics.recompute_derived();
    metrics
}

impl DailyMetrics {
    /// Recomputes every derived field from the base amounts and counts, then
    /// sanitizes all floats.
    pub fn recompute_derived(&mut self) {
        self.gross_profit = self.revenue - self.cogs;
        self.gross_profit_margin = safe_ratio(self.gross_profit, self.revenue) * 100.0;

        self.roas = safe_ratio(self.revenue, self.ad_spend);
        self.aov = safe_ratio(self.revenue, self.order_count as f64);
        self.cpp = safe_ratio(self.ad_spend, self.order_count as f64);
        self.cpc = safe_ratio(self.ad_spend, self.clicks as f64);
        self.ctr = safe_ratio(self.clicks as f64, self.impressions as f64) * 100.0;
        self.cpm = safe_ratio(self.ad_spend, self.impressions as f64) * 1000.0;

        self.recompute_shipment_rates();
        self.recompute_net_profit();
    }

    /// Net profit and the ratios hanging off it. Used on its own when shipment
    /// figures are carried over from a previous record.
    pub fn recompute_net_profit(&mut self) {
        self.net_profit = self.gross_profit - self.ad_spend - self.shipping_cost;
        self.net_profit_margin = safe_ratio(self.net_profit, self.revenue) * 100.0;
        self.poas = profit_on_ad_spend(self.net_profit, self.revenue, self.ad_spend);
        self.sanitize_all();
    }

    fn recompute_shipment_rates(&mut self) {
        let total = self.total_shipments as f64;
        self.delivery_rate = safe_ratio(self.delivered as f64, total) * 100.0;
        self.rto_rate = safe_ratio(self.rto as f64, total) * 100.0;
        self.ndr_rate = safe_ratio(self.ndr as f64, total) * 100.0;
    }

    fn sanitize_all(&mut self) {
        for value in [
            &mut self.revenue,
            &mut self.cogs,
            &mut self.ad_spend,
            &mut self.shipping_cost,
            &mut self.gross_profit,
            &mut self.gross_profit_margin,
            &mut self.net_profit,
            &mut self.net_profit_margin,
            &mut self.roas,
            &mut self.poas,
            &mut self.aov,
            &mut self.cpp,
            &mut self.cpc,
            &mut self.ctr,
            &mut self.cpm,
            &mut self.delivery_rate,
            &mut self.rto_rate,
            &mut self.ndr_rate,
        ] {
            *value = sanitize(*value);
        }
        for campaign in &mut self.campaigns {
            campaign.spend = sanitize(campaign.spend);
        }
    }
}

/// POAS is zero when there is no ad spend, and also when there is no revenue:
/// an ad-only day has no profit to attribute to the spend.
fn profit_on_ad_spend(net_profit: f64, revenue: f64, ad_spend: f64) -> f64 {
    if revenue == 0.0 {
        return 0.0;
    }
    safe_ratio(net_profit, ad_spend)
}

/// Collapses campaign-level insights into one entry per campaign id, ordered
/// by id so the output is stable across runs.
fn campaign_breakdown(insights: &[RawAdInsight]) -> Vec<CampaignSpend> {
    let mut by_id: BTreeMap<&str, CampaignSpend> = BTreeMap::new();
    for insight in insights {
        let Some(id) = insight.campaign_id.as_deref() else {
            continue;
        };
        let entry = by_id.entry(id).or_insert_with(|| CampaignSpend {
            campaign_id: id.to_string(),
            campaign_name: insight.campaign_name.clone(),
            ..Default::default()
        });
        entry.spend += sanitize(insight.spend);
        entry.reach += insight.reach as i64;
        entry.impressions += insight.impressions as i64;
        entry.clicks += insight.clicks as i64;
    }
    by_id.into_values().collect()
}

#[derive(Debug, Default)]
struct ShipmentTally {
    total: i64,
    delivered: i64,
    in_transit: i64,
    rto: i64,
    ndr: i64,
    cost: f64,
}

impl ShipmentTally {
    fn add(&mut self, shipment: &RawShipment) {
        self.total += 1;
        self.cost += sanitize(shipment.charges.total());
        match shipment.status {
            ShipmentStatus::Delivered => self.delivered += 1,
            ShipmentStatus::InTransit => self.in_transit += 1,
            ShipmentStatus::Rto => self.rto += 1,
            ShipmentStatus::Ndr => self.ndr += 1,
            ShipmentStatus::Other => {}
        }
    }
}

/// Totals over a date range, with ratios recomputed from the totals rather
/// than averaged across days.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub days: i64,
    pub order_count: i64,
    pub revenue: f64,
    pub cogs: f64,
    pub ad_spend: f64,
    pub shipping_cost: f64,
    pub gross_profit: f64,
    pub net_profit: f64,
    pub net_profit_margin: f64,
    pub roas: f64,
    pub poas: f64,
    pub aov: f64,
    pub total_shipments: i64,
    pub delivery_rate: f64,
    pub rto_rate: f64,
}

pub fn summarize(records: &[DailyMetrics]) -> MetricsSummary {
    let mut summary = MetricsSummary {
        days: records.len() as i64,
        ..Default::default()
    };
    let mut delivered = 0i64;
    let mut rto = 0i64;
    for day in records {
        summary.order_count += day.order_count;
        summary.revenue += day.revenue;
        summary.cogs += day.cogs;
        summary.ad_spend += day.ad_spend;
        summary.shipping_cost += day.shipping_cost;
        summary.gross_profit += day.gross_profit;
        summary.net_profit += day.net_profit;
        summary.total_shipments += day.total_shipments;
        delivered += day.delivered;
        rto += day.rto;
    }
    summary.net_profit_margin = safe_ratio(summary.net_profit, summary.revenue) * 100.0;
    summary.roas = safe_ratio(summary.revenue, summary.ad_spend);
    summary.poas = profit_on_ad_spend(summary.net_profit, summary.revenue, summary.ad_spend);
    summary.aov = safe_ratio(summary.revenue, summary.order_count as f64);
    summary.delivery_rate = safe_ratio(delivered as f64, summary.total_shipments as f64) * 100.0;
    summary.rto_rate = safe_ratio(rto as f64, summary.total_shipments as f64) * 100.0;
    summary
}
