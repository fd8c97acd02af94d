//! Resolves unit costs for every product in a window, estimating and
//! persisting costs for products seen for the first time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dayledger_core::metrics::DEFAULT_COST_RATIO;
use dayledger_core::{CostLookup, ProductCost, RawOrderRecord};
use dayledger_storage::{ProductCostStore, StoreError};
use tracing::debug;

#[derive(Clone)]
pub struct CostResolver {
    store: Arc<dyn ProductCostStore>,
}

struct SeenProduct {
    name: Option<String>,
    unit_price: f64,
}

impl CostResolver {
    pub fn new(store: Arc<dyn ProductCostStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        orders: &[RawOrderRecord],
        now: DateTime<Utc>,
    ) -> Result<CostLookup, StoreError> {
        let mut seen: BTreeMap<&str, SeenProduct> = BTreeMap::new();
        for item in orders.iter().flat_map(|o| o.line_items.iter()) {
            seen.entry(item.product_id.as_str()).or_insert_with(|| SeenProduct {
                name: item.name.clone(),
                unit_price: item.unit_price,
            });
        }
        if seen.is_empty() {
            return Ok(CostLookup::new());
        }

        let ids: Vec<String> = seen.keys().map(|id| id.to_string()).collect();
        let mut lookup: CostLookup = self
            .store
            .costs_for(user_id, &ids)
            .await?
            .into_iter()
            .map(|cost| (cost.product_id, cost.unit_cost))
            .collect();

        let estimates: Vec<ProductCost> = seen
            .iter()
            .filter(|(id, product)| !lookup.contains_key(**id) && product.unit_price > 0.0)
            .map(|(id, product)| ProductCost {
                user_id: user_id.to_string(),
                product_id: id.to_string(),
                name: product.name.clone(),
                unit_cost: product.unit_price * DEFAULT_COST_RATIO,
                is_estimate: true,
                updated_at: now,
            })
            .collect();

        if !estimates.is_empty() {
            let inserted = self.store.insert_estimates(&estimates).await?;
            debug!(user_id, estimated = estimates.len(), inserted, "persisted product cost estimates");
            lookup.extend(estimates.into_iter().map(|e| (e.product_id, e.unit_cost)));
        }
        Ok(lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayledger_core::LineItem;
    use dayledger_storage::MemoryStore;

    fn order(items: Vec<(&str, u32, f64)>) -> RawOrderRecord {
        RawOrderRecord {
            external_id: "o1".into(),
            created_at: "2024-10-26T10:00:00+05:30".into(),
            total: items.iter().map(|(_, q, p)| f64::from(*q) * p).sum(),
            line_items: items
                .into_iter()
                .map(|(id, quantity, unit_price)| LineItem {
                    product_id: id.into(),
                    name: Some(format!("Product {id}")),
                    quantity,
                    unit_price,
                })
                .collect(),
            customer_id: None,
        }
    }

    #[tokio::test]
    async fn unseen_products_are_estimated_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let resolver = CostResolver::new(store.clone());

        let lookup = resolver
            .resolve("u1", &[order(vec![("p1", 2, 1000.0), ("p2", 1, 250.0)])], Utc::now())
            .await
            .unwrap();
        assert_eq!(lookup["p1"], 400.0);
        assert_eq!(lookup["p2"], 100.0);

        let stored = store
            .costs_for("u1", &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|c| c.is_estimate));
    }

    #[tokio::test]
    async fn overrides_win_over_estimates() {
        let store = Arc::new(MemoryStore::new());
        store.set_override("u1", "p1", 123.0, None).await.unwrap();
        let resolver = CostResolver::new(store.clone());

        let lookup = resolver
            .resolve("u1", &[order(vec![("p1", 1, 1000.0)])], Utc::now())
            .await
            .unwrap();
        assert_eq!(lookup["p1"], 123.0);
    }

    #[tokio::test]
    async fn estimates_are_scoped_per_user() {
        let store = Arc::new(MemoryStore::new());
        let resolver = CostResolver::new(store.clone());
        resolver
            .resolve("u1", &[order(vec![("p1", 1, 1000.0)])], Utc::now())
            .await
            .unwrap();

        let lookup = resolver
            .resolve("u2", &[order(vec![("p1", 1, 500.0)])], Utc::now())
            .await
            .unwrap();
        assert_eq!(lookup["p1"], 200.0);
    }

    #[tokio::test]
    async fn no_line_items_means_empty_lookup() {
        let store = Arc::new(MemoryStore::new());
        let lookup = CostResolver::new(store)
            .resolve("u1", &[order(vec![])], Utc::now())
            .await
            .unwrap();
        assert!(lookup.is_empty());
    }
}
