//! Source adapter contract and the three production adapters (orders, ads,
//! shipments).
//!
//! Adapters fetch raw records for a window and hand them over untouched apart
//! from decoding; timestamps stay raw until the grouping stage. An adapter
//! never retries itself: failures surface as [`AdapterError`] carrying a
//! [`RetryDisposition`] for the executor.

use std::fmt;

use async_trait::async_trait;
use chrono::Duration;
use dayledger_core::{business_midnight_utc, RawAdInsight, RawOrderRecord, RawShipment, SourceKind, SyncWindow};
use dayledger_storage::{FetchError, RetryDisposition};
use serde::{de, Deserialize, Deserializer};
use thiserror::Error;

pub mod meta;
pub mod shiprocket;
pub mod shopify;

pub use meta::MetaAdSource;
pub use shiprocket::ShiprocketShipmentSource;
pub use shopify::ShopifyOrderSource;

pub const CRATE_NAME: &str = "dayledger-adapters";

/// Upper bound on pages followed for one fetch, in case a source keeps
/// returning a next cursor.
pub const MAX_PAGES: usize = 500;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("authentication rejected by {source_kind}: {message}")]
    Auth { source_kind: SourceKind, message: String },
    /// A cached session token stopped working; a fresh attempt will log in again.
    #[error("session token for {0} expired")]
    StaleToken(SourceKind),
    #[error("unexpected {source_kind} payload: {message}")]
    Payload { source_kind: SourceKind, message: String },
}

impl AdapterError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            AdapterError::Fetch(err) => err.disposition(),
            AdapterError::StaleToken(_) => RetryDisposition::Retryable,
            AdapterError::Auth { .. } | AdapterError::Payload { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub(crate) fn payload(source_kind: SourceKind, err: impl fmt::Display) -> Self {
        AdapterError::Payload {
            source_kind,
            message: err.to_string(),
        }
    }
}

/// One external system.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Credentials: Send + Sync;
    type Record: Send;

    fn source(&self) -> SourceKind;

    async fn fetch(
        &self,
        credentials: &Self::Credentials,
        window: SyncWindow,
    ) -> Result<Vec<Self::Record>, AdapterError>;
}

pub type OrderSource = dyn SourceAdapter<Credentials = ShopifyCredentials, Record = RawOrderRecord>;
pub type AdSource = dyn SourceAdapter<Credentials = MetaCredentials, Record = RawAdInsight>;
pub type ShipmentSource = dyn SourceAdapter<Credentials = ShiprocketCredentials, Record = RawShipment>;

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ShopifyCredentials {
    /// Shop domain, e.g. `acme.myshopify.com` (a bare handle gets the suffix).
    pub store: String,
    pub access_token: String,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct MetaCredentials {
    pub access_token: String,
    pub ad_account_id: String,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ShiprocketCredentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for ShopifyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShopifyCredentials")
            .field("store", &self.store)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for MetaCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaCredentials")
            .field("ad_account_id", &self.ad_account_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for ShiprocketCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShiprocketCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Window bounds as RFC 3339 instants in the business timezone: the first
/// second of `start` and the last second of `end`.
pub(crate) fn window_bounds_rfc3339(window: SyncWindow) -> (String, String) {
    let tz = dayledger_core::business_tz();
    let start = business_midnight_utc(window.start).with_timezone(&tz);
    let end = (business_midnight_utc(window.end + Duration::days(1)) - Duration::seconds(1)).with_timezone(&tz);
    (start.to_rfc3339(), end.to_rfc3339())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

/// Amounts arrive as JSON numbers or as decimal strings depending on the API.
pub(crate) fn de_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(0.0),
        Some(NumberOrText::Number(v)) => Ok(v),
        Some(NumberOrText::Text(s)) => {
            let cleaned = s.trim().replace(',', "");
            if cleaned.is_empty() {
                return Ok(0.0);
            }
            cleaned.parse().map_err(de::Error::custom)
        }
    }
}

pub(crate) fn de_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = de_amount(deserializer)?;
    if value < 0.0 || value.fract() != 0.0 {
        return Err(de::Error::custom(format!("expected a non-negative count, got {value}")));
    }
    Ok(value as u64)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdValue {
    Number(serde_json::Number),
    Text(String),
}

impl IdValue {
    /// Integer ids keep every digit; the JSON number is printed as received.
    fn into_string(self) -> String {
        match self {
            IdValue::Number(n) => n.to_string(),
            IdValue::Text(s) => s,
        }
    }
}

/// Identifiers arrive as numbers from some APIs and strings from others.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(IdValue::deserialize(deserializer)?.into_string())
}

pub(crate) fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<IdValue>::deserialize(deserializer)?
        .map(IdValue::into_string)
        .filter(|id| !id.trim().is_empty()))
}
