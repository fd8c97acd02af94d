//! Commerce platform orders (Shopify Admin REST).

use std::sync::Arc;

use async_trait::async_trait;
use dayledger_core::{LineItem, RawOrderRecord, SourceKind, SyncWindow};
use dayledger_storage::{next_link, HttpFetcher};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{de_amount, de_id, de_opt_id, window_bounds_rfc3339, AdapterError, ShopifyCredentials, SourceAdapter, MAX_PAGES};

pub const DEFAULT_API_VERSION: &str = "2024-01";
const PAGE_LIMIT: &str = "250";
const TOKEN_HEADER: &str = "X-Shopify-Access-Token";

#[derive(Debug, Deserialize)]
struct OrdersPage {
    #[serde(default)]
    orders: Vec<ShopifyOrder>,
}

#[derive(Debug, Deserialize)]
struct ShopifyOrder {
    #[serde(deserialize_with = "de_id")]
    id: String,
    created_at: String,
    #[serde(default, deserialize_with = "de_amount")]
    total_price: f64,
    #[serde(default)]
    customer: Option<ShopifyCustomer>,
    #[serde(default)]
    line_items: Vec<ShopifyLineItem>,
}

#[derive(Debug, Deserialize)]
struct ShopifyCustomer {
    #[serde(default, deserialize_with = "de_opt_id")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShopifyLineItem {
    #[serde(default, deserialize_with = "de_opt_id")]
    product_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    quantity: u32,
    #[serde(default, deserialize_with = "de_amount")]
    price: f64,
}

impl From<ShopifyOrder> for RawOrderRecord {
    fn from(order: ShopifyOrder) -> Self {
        RawOrderRecord {
            external_id: order.id,
            created_at: order.created_at,
            total: order.total_price,
            customer_id: order.customer.and_then(|c| c.id),
            // Custom line items have no product and cannot be costed.
            line_items: order
                .line_items
                .into_iter()
                .filter_map(|item| {
                    Some(LineItem {
                        product_id: item.product_id?,
                        name: item.title,
                        quantity: item.quantity,
                        unit_price: item.price,
                    })
                })
                .collect(),
        }
    }
}

/// Decodes one page of `orders.json`.
pub fn parse_orders_page(body: &[u8]) -> Result<Vec<RawOrderRecord>, AdapterError> {
    let page: OrdersPage = serde_json::from_slice(body).map_err(|e| AdapterError::payload(SourceKind::Orders, e))?;
    Ok(page.orders.into_iter().map(RawOrderRecord::from).collect())
}

pub struct ShopifyOrderSource {
    http: Arc<HttpFetcher>,
    api_version: String,
}

impl ShopifyOrderSource {
    pub fn new(http: Arc<HttpFetcher>, api_version: impl Into<String>) -> Self {
        Self {
            http,
            api_version: api_version.into(),
        }
    }

    fn orders_url(&self, store: &str) -> String {
        let store = store.trim().trim_end_matches('/');
        let base = if store.starts_with("http://") || store.starts_with("https://") {
            store.to_string()
        } else if store.contains('.') {
            format!("https://{store}")
        } else {
            format!("https://{store}.myshopify.com")
        };
        format!("{base}/admin/api/{}/orders.json", self.api_version)
    }
}

#[async_trait]
impl SourceAdapter for ShopifyOrderSource {
    type Credentials = ShopifyCredentials;
    type Record = RawOrderRecord;

    fn source(&self) -> SourceKind {
        SourceKind::Orders
    }

    async fn fetch(
        &self,
        credentials: &ShopifyCredentials,
        window: SyncWindow,
    ) -> Result<Vec<RawOrderRecord>, AdapterError> {
        let (created_min, created_max) = window_bounds_rfc3339(window);
        let client = self.http.client();
        let mut request = client
            .get(self.orders_url(&credentials.store))
            .header(TOKEN_HEADER, &credentials.access_token)
            .query(&[
                ("status", "any"),
                ("limit", PAGE_LIMIT),
                ("created_at_min", created_min.as_str()),
                ("created_at_max", created_max.as_str()),
            ]);

        let mut records = Vec::new();
        for page in 1..=MAX_PAGES {
            let response = self.http.execute(SourceKind::Orders, request).await?;
            let batch = parse_orders_page(&response.body)?;
            debug!(page, count = batch.len(), "fetched orders page");
            records.extend(batch);

            // Cursor URLs already carry limit and page_info; filters must not be resent.
            match response.link.as_deref().and_then(next_link) {
                Some(next) => request = client.get(next).header(TOKEN_HEADER, &credentials.access_token),
                None => return Ok(records),
            }
        }

        warn!(max_pages = MAX_PAGES, "order pagination truncated");
        Ok(records)
    }
}
