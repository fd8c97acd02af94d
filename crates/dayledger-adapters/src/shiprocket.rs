//! Logistics aggregator shipments (Shiprocket external API).
//!
//! The API wants an email/password login that yields a bearer token valid for
//! days, so tokens are cached per account and dropped on the first 401.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dayledger_core::{RawShipment, ShipmentCharges, ShipmentStatus, SourceKind, SyncWindow};
use dayledger_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{de_amount, de_id, AdapterError, ShiprocketCredentials, SourceAdapter, MAX_PAGES};

pub const DEFAULT_BASE_URL: &str = "https://apiv2.shiprocket.in";
const PER_PAGE: &str = "100";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ShipmentsPage {
    #[serde(default)]
    data: Vec<ShiprocketShipment>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    current_page: u32,
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ShiprocketShipment {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    status: String,
    created_at: String,
    #[serde(default)]
    charges: Charges,
}

#[derive(Debug, Default, Deserialize)]
struct Charges {
    #[serde(default, deserialize_with = "de_amount")]
    freight_charges: f64,
    #[serde(default, deserialize_with = "de_amount")]
    cod_charges: f64,
    #[serde(default, deserialize_with = "de_amount")]
    rto_charges: f64,
    #[serde(default, deserialize_with = "de_amount")]
    other_charges: f64,
}

impl From<ShiprocketShipment> for RawShipment {
    fn from(shipment: ShiprocketShipment) -> Self {
        RawShipment {
            external_id: shipment.id,
            status: ShipmentStatus::from_token(&shipment.status),
            created_at: shipment.created_at,
            charges: ShipmentCharges {
                freight: shipment.charges.freight_charges,
                cod: shipment.charges.cod_charges,
                other: shipment.charges.rto_charges + shipment.charges.other_charges,
            },
        }
    }
}

/// Decodes one shipments page; the flag reports whether more pages follow.
pub fn parse_shipments_page(body: &[u8]) -> Result<(Vec<RawShipment>, bool), AdapterError> {
    let page: ShipmentsPage =
        serde_json::from_slice(body).map_err(|e| AdapterError::payload(SourceKind::Shipments, e))?;
    let has_more = page
        .meta
        .and_then(|m| m.pagination)
        .is_some_and(|p| p.current_page < p.total_pages);
    Ok((page.data.into_iter().map(RawShipment::from).collect(), has_more))
}

fn is_auth_rejection(err: &FetchError) -> bool {
    matches!(err, FetchError::HttpStatus { status: 401 | 403, .. })
}

pub struct ShiprocketShipmentSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    tokens: Mutex<HashMap<String, String>>,
}

impl ShiprocketShipmentSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a token and whether it came from the cache.
    async fn token(&self, credentials: &ShiprocketCredentials) -> Result<(String, bool), AdapterError> {
        if let Some(token) = self.tokens.lock().await.get(&credentials.email) {
            return Ok((token.clone(), true));
        }

        let request = self
            .http
            .client()
            .post(format!("{}/v1/external/auth/login", self.base_url))
            .json(&LoginRequest {
                email: &credentials.email,
                password: &credentials.password,
            });

        let response = match self.http.execute(SourceKind::Shipments, request).await {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 400 | 401 | 403, .. }) => {
                return Err(AdapterError::Auth {
                    source_kind: SourceKind::Shipments,
                    message: "login rejected".to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let login: LoginResponse = response.json()?;
        info!("logged in to shipment aggregator");

        self.tokens
            .lock()
            .await
            .insert(credentials.email.clone(), login.token.clone());
        Ok((login.token, false))
    }

    async fn forget_token(&self, email: &str) {
        self.tokens.lock().await.remove(email);
    }
}

#[async_trait]
impl SourceAdapter for ShiprocketShipmentSource {
    type Credentials = ShiprocketCredentials;
    type Record = RawShipment;

    fn source(&self) -> SourceKind {
        SourceKind::Shipments
    }

    async fn fetch(
        &self,
        credentials: &ShiprocketCredentials,
        window: SyncWindow,
    ) -> Result<Vec<RawShipment>, AdapterError> {
        let (token, cached) = self.token(credentials).await?;
        let url = format!("{}/v1/external/shipments", self.base_url);
        let from = window.start.format("%Y-%m-%d").to_string();
        let to = window.end.format("%Y-%m-%d").to_string();

        let mut shipments = Vec::new();
        for page in 1..=MAX_PAGES {
            let page_param = page.to_string();
            let request = self.http.client().get(&url).bearer_auth(&token).query(&[
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("per_page", PER_PAGE),
                ("page", page_param.as_str()),
            ]);

            let response = match self.http.execute(SourceKind::Shipments, request).await {
                Ok(response) => response,
                Err(err) if is_auth_rejection(&err) => {
                    self.forget_token(&credentials.email).await;
                    return Err(if cached {
                        AdapterError::StaleToken(SourceKind::Shipments)
                    } else {
                        AdapterError::Auth {
                            source_kind: SourceKind::Shipments,
                            message: err.to_string(),
                        }
                    });
                }
                Err(err) => return Err(err.into()),
            };

            let (batch, has_more) = parse_shipments_page(&response.body)?;
            debug!(page, count = batch.len(), "fetched shipments page");
            let exhausted = batch.is_empty();
            shipments.extend(batch);
            if !has_more || exhausted {
                return Ok(shipments);
            }
        }

        warn!(max_pages = MAX_PAGES, "shipment pagination truncated");
        Ok(shipments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use dayledger_storage::RetryDisposition;

    #[test]
    fn parses_shipments_fixture() {
        let (shipments, has_more) = parse_shipments_page(&fixture("shiprocket/shipments_page.json")).unwrap();
        assert!(has_more);
        assert_eq!(shipments.len(), 4);

        let first = &shipments[0];
        assert_eq!(first.external_id, "612345001");
        assert_eq!(first.status, ShipmentStatus::Delivered);
        assert_eq!(first.created_at, "26th Oct 2024 08:11 AM");
        assert_eq!(first.charges.freight, 85.5);
        assert_eq!(first.charges.cod, 30.0);
        assert_eq!(first.charges.total(), 115.5);

        let statuses: Vec<_> = shipments.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                ShipmentStatus::Delivered,
                ShipmentStatus::InTransit,
                ShipmentStatus::Rto,
                ShipmentStatus::Ndr
            ]
        );
        // RTO surcharge lands in the residual bucket.
        assert_eq!(shipments[2].charges.other, 92.0);
    }

    #[test]
    fn last_page_reports_no_more() {
        let body = br#"{"data": [], "meta": {"pagination": {"current_page": 2, "total_pages": 2}}}"#;
        let (shipments, has_more) = parse_shipments_page(body).unwrap();
        assert!(shipments.is_empty());
        assert!(!has_more);
    }

    #[test]
    fn stale_token_is_retryable_but_rejected_login_is_not() {
        assert_eq!(
            AdapterError::StaleToken(SourceKind::Shipments).disposition(),
            RetryDisposition::Retryable
        );
        let rejected = AdapterError::Auth {
            source_kind: SourceKind::Shipments,
            message: "login rejected".into(),
        };
        assert_eq!(rejected.disposition(), RetryDisposition::NonRetryable);
        assert!(is_auth_rejection(&FetchError::HttpStatus {
            status: 401,
            url: "https://x.test".into()
        }));
    }
}
