//! Buckets raw records from all three sources into per-day cohorts in the
//! business timezone.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use dayledger_core::{
    parse_source_date, CohortOrder, DayCohort, RawAdInsight, RawOrderRecord, RawShipment, SourceKind, SyncWindow,
};

/// Everything fetched for one user and window, before grouping.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub orders: Vec<RawOrderRecord>,
    pub ads: Vec<RawAdInsight>,
    pub shipments: Vec<RawShipment>,
}

/// A record dropped because its timestamp matched no known shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub source: SourceKind,
    pub record: Option<String>,
    pub raw: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(id) => write!(f, "{} record {id}: unparseable timestamp {:?}", self.source, self.raw),
            None => write!(f, "{} record: unparseable timestamp {:?}", self.source, self.raw),
        }
    }
}

#[derive(Debug, Default)]
pub struct Grouped {
    pub cohorts: BTreeMap<NaiveDate, DayCohort>,
    pub warnings: Vec<ParseWarning>,
    /// Records that parsed fine but fell outside the window.
    pub out_of_window: usize,
}

impl Grouped {
    fn cohort(&mut self, date: NaiveDate) -> &mut DayCohort {
        self.cohorts.entry(date).or_insert_with(|| DayCohort::new(date))
    }

    fn warn(&mut self, source: SourceKind, record: Option<&str>, raw: &str) {
        self.warnings.push(ParseWarning {
            source,
            record: record.map(ToString::to_string),
            raw: raw.to_string(),
        });
    }

    fn place(&mut self, window: SyncWindow, source: SourceKind, record: Option<&str>, raw: &str) -> Option<NaiveDate> {
        match parse_source_date(raw, source) {
            Ok(date) if window.contains(date) => Some(date),
            Ok(_) => {
                self.out_of_window += 1;
                None
            }
            Err(_) => {
                self.warn(source, record, raw);
                None
            }
        }
    }
}

pub fn group_by_day(batch: SourceBatch, window: SyncWindow) -> Grouped {
    let mut grouped = Grouped::default();
    group_orders(&mut grouped, batch.orders, window);
    group_ads(&mut grouped, batch.ads, window);
    group_shipments(&mut grouped, batch.shipments, window);
    grouped
}

/// Orders are walked in chronological order so that a customer's first order
/// in the window is the new one and every later order is returning.
fn group_orders(grouped: &mut Grouped, orders: Vec<RawOrderRecord>, window: SyncWindow) {
    let mut seen_ids = HashSet::new();
    let mut placed: Vec<(NaiveDate, Option<DateTime<FixedOffset>>, RawOrderRecord)> = Vec::new();

    for order in orders {
        if !seen_ids.insert(order.external_id.clone()) {
            continue;
        }
        let Some(date) = grouped.place(window, SourceKind::Orders, Some(&order.external_id), &order.created_at) else {
            continue;
        };
        let instant = DateTime::parse_from_rfc3339(order.created_at.trim()).ok();
        placed.push((date, instant, order));
    }
    placed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut customers = HashSet::new();
    for (date, _, order) in placed {
        let returning = match &order.customer_id {
            Some(id) => !customers.insert(id.clone()),
            None => false,
        };
        grouped.cohort(date).orders.push(CohortOrder { order, returning });
    }
}

fn group_ads(grouped: &mut Grouped, ads: Vec<RawAdInsight>, window: SyncWindow) {
    for insight in ads {
        let record = insight.campaign_id.clone();
        let Some(date) = grouped.place(window, SourceKind::Ads, record.as_deref(), &insight.date) else {
            continue;
        };
        let cohort = grouped.cohort(date);
        if insight.is_campaign_level() {
            cohort.campaigns.push(insight);
            continue;
        }
        match &mut cohort.ad_insight {
            Some(account) => {
                account.spend += insight.spend;
                account.reach += insight.reach;
                account.impressions += insight.impressions;
                account.clicks += insight.clicks;
            }
            None => cohort.ad_insight = Some(insight),
        }
    }
}

fn group_shipments(grouped: &mut Grouped, shipments: Vec<RawShipment>, window: SyncWindow) {
    let mut seen_ids = HashSet::new();
    for shipment in shipments {
        if !seen_ids.insert(shipment.external_id.clone()) {
            continue;
        }
        if let Some(date) = grouped.place(window, SourceKind::Shipments, Some(&shipment.external_id), &shipment.created_at) {
            grouped.cohort(date).shipments.push(shipment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayledger_core::{ShipmentCharges, ShipmentStatus};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, d).unwrap()
    }

    fn window() -> SyncWindow {
        SyncWindow::new(day(20), day(27)).unwrap()
    }

    fn order(id: &str, created_at: &str, customer: Option<&str>) -> RawOrderRecord {
        RawOrderRecord {
            external_id: id.into(),
            created_at: created_at.into(),
            total: 100.0,
            line_items: vec![],
            customer_id: customer.map(Into::into),
        }
    }

    fn insight(date: &str, spend: f64, campaign: Option<&str>) -> RawAdInsight {
        RawAdInsight {
            date: date.into(),
            spend,
            reach: 10,
            impressions: 100,
            clicks: 5,
            campaign_id: campaign.map(Into::into),
            campaign_name: None,
        }
    }

    fn shipment(id: &str, created_at: &str) -> RawShipment {
        RawShipment {
            external_id: id.into(),
            status: ShipmentStatus::Delivered,
            created_at: created_at.into(),
            charges: ShipmentCharges {
                freight: 80.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn mixed_timestamp_shapes_land_on_business_days() {
        let batch = SourceBatch {
            // 2024-10-25T20:00Z is 01:30 on the 26th in the business timezone.
            orders: vec![order("o1", "2024-10-25T20:00:00Z", None)],
            ads: vec![insight("2024-10-26", 450.0, None)],
            shipments: vec![shipment("s1", "26th Oct 2024 08:11 AM")],
        };
        let grouped = group_by_day(batch, window());

        assert_eq!(grouped.cohorts.len(), 1);
        let cohort = &grouped.cohorts[&day(26)];
        assert_eq!(cohort.orders.len(), 1);
        assert_eq!(cohort.ad_insight.as_ref().map(|a| a.spend), Some(450.0));
        assert_eq!(cohort.shipments.len(), 1);
        assert!(grouped.warnings.is_empty());
    }

    #[test]
    fn unparseable_records_become_warnings() {
        let batch = SourceBatch {
            orders: vec![order("o1", "yesterday-ish", None), order("o2", "2024-10-22T10:00:00+05:30", None)],
            shipments: vec![shipment("s1", "")],
            ..Default::default()
        };
        let grouped = group_by_day(batch, window());

        assert_eq!(grouped.cohorts.len(), 1);
        assert_eq!(grouped.warnings.len(), 2);
        assert_eq!(grouped.warnings[0].source, SourceKind::Orders);
        assert_eq!(grouped.warnings[0].record.as_deref(), Some("o1"));
        assert!(grouped.warnings[0].to_string().contains("yesterday-ish"));
    }

    #[test]
    fn out_of_window_records_are_dropped() {
        let batch = SourceBatch {
            orders: vec![order("o1", "2024-10-28T09:00:00+05:30", None)],
            ads: vec![insight("2024-10-19", 10.0, None)],
            ..Default::default()
        };
        let grouped = group_by_day(batch, window());
        assert!(grouped.cohorts.is_empty());
        assert_eq!(grouped.out_of_window, 2);
        assert!(grouped.warnings.is_empty());
    }

    #[test]
    fn repeat_customers_are_returning_after_first_order() {
        // Listed newest first, as the order API returns them.
        let batch = SourceBatch {
            orders: vec![
                order("o3", "2024-10-24T18:00:00+05:30", Some("c1")),
                order("o2", "2024-10-24T09:00:00+05:30", Some("c1")),
                order("o1", "2024-10-22T12:00:00+05:30", Some("c1")),
                order("o4", "2024-10-24T10:00:00+05:30", Some("c2")),
                order("o5", "2024-10-24T11:00:00+05:30", None),
                order("o5", "2024-10-24T11:00:00+05:30", None),
            ],
            ..Default::default()
        };
        let grouped = group_by_day(batch, window());

        let first_day = &grouped.cohorts[&day(22)];
        assert_eq!(first_day.orders.len(), 1);
        assert!(!first_day.orders[0].returning);

        let later = &grouped.cohorts[&day(24)];
        assert_eq!(later.orders.len(), 4);
        let returning: Vec<_> = later
            .orders
            .iter()
            .filter(|o| o.returning)
            .map(|o| o.order.external_id.as_str())
            .collect();
        assert_eq!(returning, vec!["o2", "o3"]);
    }

    #[test]
    fn campaign_rows_are_kept_apart_from_account_totals() {
        let batch = SourceBatch {
            ads: vec![
                insight("2024-10-26", 450.0, None),
                insight("2024-10-26", 300.0, Some("c-1")),
                insight("2024-10-26", 150.0, Some("c-2")),
                insight("2024-10-27", 90.0, Some("c-1")),
            ],
            ..Default::default()
        };
        let grouped = group_by_day(batch, window());

        let with_account = &grouped.cohorts[&day(26)];
        assert_eq!(with_account.ad_insight.as_ref().map(|a| a.spend), Some(450.0));
        assert_eq!(with_account.campaigns.len(), 2);

        let campaign_only = &grouped.cohorts[&day(27)];
        assert!(campaign_only.ad_insight.is_none());
        assert_eq!(campaign_only.campaigns.len(), 1);
    }

    #[test]
    fn duplicate_shipments_count_once() {
        let batch = SourceBatch {
            shipments: vec![shipment("s1", "2024-10-23 10:00:00"), shipment("s1", "2024-10-23 10:00:00")],
            ..Default::default()
        };
        let grouped = group_by_day(batch, window());
        assert_eq!(grouped.cohorts[&day(23)].shipments.len(), 1);
    }
}
