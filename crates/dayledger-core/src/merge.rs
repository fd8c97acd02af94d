//! Merge policy applied when a freshly computed day meets a persisted one.
//!
//! Field groups:
//! - shipment fields (totals, status counts, rates, shipping cost): preserved
//!   from the existing record when it has shipments and the incoming
//!   computation has none;
//! - everything else: always taken from the incoming computation.
//!
//! Net profit, net margin and POAS are recomputed whenever shipment fields are
//! preserved so they reflect the preserved shipping cost.

use crate::DailyMetrics;

pub fn merge(existing: Option<&DailyMetrics>, incoming: DailyMetrics) -> DailyMetrics {
    match existing {
        Some(existing) if should_preserve_shipments(existing, &incoming) => {
            let mut merged = incoming;
            copy_shipment_fields(existing, &mut merged);
            merged.recompute_net_profit();
            merged
        }
        _ => incoming,
    }
}

pub fn should_preserve_shipments(existing: &DailyMetrics, incoming: &DailyMetrics) -> bool {
    existing.total_shipments > 0 && incoming.total_shipments == 0
}

fn copy_shipment_fields(from: &DailyMetrics, to: &mut DailyMetrics) {
    to.total_shipments = from.total_shipments;
    to.delivered = from.delivered;
    to.in_transit = from.in_transit;
    to.rto = from.rto;
    to.ndr = from.ndr;
    to.delivery_rate = from.delivery_rate;
    to.rto_rate = from.rto_rate;
    to.ndr_rate = from.ndr_rate;
    to.shipping_cost = from.shipping_cost;
}
