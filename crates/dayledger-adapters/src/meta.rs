//! Advertising platform insights (Meta Graph API, ad account level plus an
//! optional campaign breakdown).

use std::sync::Arc;

use async_trait::async_trait;
use dayledger_core::{RawAdInsight, SourceKind, SyncWindow};
use dayledger_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{de_amount, de_count, de_opt_id, AdapterError, MetaCredentials, SourceAdapter, MAX_PAGES};

pub const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com/v19.0";
const ACCOUNT_FIELDS: &str = "spend,reach,impressions,clicks,date_start";
const CAMPAIGN_FIELDS: &str = "campaign_id,campaign_name,spend,reach,impressions,clicks,date_start";
const PAGE_LIMIT: &str = "500";

#[derive(Debug, Deserialize)]
struct InsightsPage {
    #[serde(default)]
    data: Vec<InsightRow>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsightRow {
    date_start: String,
    #[serde(default, deserialize_with = "de_amount")]
    spend: f64,
    #[serde(default, deserialize_with = "de_count")]
    reach: u64,
    #[serde(default, deserialize_with = "de_count")]
    impressions: u64,
    #[serde(default, deserialize_with = "de_count")]
    clicks: u64,
    #[serde(default, deserialize_with = "de_opt_id")]
    campaign_id: Option<String>,
    #[serde(default)]
    campaign_name: Option<String>,
}

impl From<InsightRow> for RawAdInsight {
    fn from(row: InsightRow) -> Self {
        RawAdInsight {
            date: row.date_start,
            spend: row.spend,
            reach: row.reach,
            impressions: row.impressions,
            clicks: row.clicks,
            campaign_id: row.campaign_id,
            campaign_name: row.campaign_name,
        }
    }
}

/// Decodes one insights page, returning the rows and the next cursor URL.
pub fn parse_insights_page(body: &[u8]) -> Result<(Vec<RawAdInsight>, Option<String>), AdapterError> {
    let page: InsightsPage = serde_json::from_slice(body).map_err(|e| AdapterError::payload(SourceKind::Ads, e))?;
    let next = page.paging.and_then(|p| p.next);
    Ok((page.data.into_iter().map(RawAdInsight::from).collect(), next))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Account,
    Campaign,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Account => "account",
            Level::Campaign => "campaign",
        }
    }

    fn fields(self) -> &'static str {
        match self {
            Level::Account => ACCOUNT_FIELDS,
            Level::Campaign => CAMPAIGN_FIELDS,
        }
    }
}

pub struct MetaAdSource {
    http: Arc<HttpFetcher>,
    graph_url: String,
    campaign_breakdown: bool,
}

impl MetaAdSource {
    pub fn new(http: Arc<HttpFetcher>, graph_url: impl Into<String>) -> Self {
        Self {
            http,
            graph_url: graph_url.into().trim_end_matches('/').to_string(),
            campaign_breakdown: true,
        }
    }

    pub fn without_campaign_breakdown(mut self) -> Self {
        self.campaign_breakdown = false;
        self
    }

    fn insights_url(&self, ad_account_id: &str) -> String {
        let id = ad_account_id.trim();
        let id = id.strip_prefix("act_").unwrap_or(id);
        format!("{}/act_{id}/insights", self.graph_url)
    }

    async fn fetch_level(
        &self,
        credentials: &MetaCredentials,
        window: SyncWindow,
        level: Level,
    ) -> Result<Vec<RawAdInsight>, AdapterError> {
        let client = self.http.client();
        let time_range = serde_json::json!({
            "since": window.start.format("%Y-%m-%d").to_string(),
            "until": window.end.format("%Y-%m-%d").to_string(),
        })
        .to_string();

        let mut request = client.get(self.insights_url(&credentials.ad_account_id)).query(&[
            ("access_token", credentials.access_token.as_str()),
            ("fields", level.fields()),
            ("level", level.as_str()),
            ("time_increment", "1"),
            ("time_range", time_range.as_str()),
            ("limit", PAGE_LIMIT),
        ]);

        let mut rows = Vec::new();
        for page in 1..=MAX_PAGES {
            let response = self.http.execute(SourceKind::Ads, request).await?;
            let (batch, next) = parse_insights_page(&response.body)?;
            debug!(page, level = level.as_str(), count = batch.len(), "fetched insights page");
            rows.extend(batch);

            // The cursor URL embeds the token and every original parameter.
            match next {
                Some(next) => request = client.get(next),
                None => return Ok(rows),
            }
        }

        warn!(max_pages = MAX_PAGES, level = level.as_str(), "insights pagination truncated");
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for MetaAdSource {
    type Credentials = MetaCredentials;
    type Record = RawAdInsight;

    fn source(&self) -> SourceKind {
        SourceKind::Ads
    }

    /// Account-level daily rows, followed by campaign-level rows when the
    /// breakdown is enabled. A failed breakdown degrades to account totals.
    async fn fetch(&self, credentials: &MetaCredentials, window: SyncWindow) -> Result<Vec<RawAdInsight>, AdapterError> {
        let mut rows = self.fetch_level(credentials, window, Level::Account).await?;
        if !self.campaign_breakdown {
            return Ok(rows);
        }

        match self.fetch_level(credentials, window, Level::Campaign).await {
            Ok(campaigns) => rows.extend(campaigns.into_iter().filter(RawAdInsight::is_campaign_level)),
            Err(error) => warn!(%error, "campaign breakdown unavailable, keeping account totals"),
        }
        Ok(rows)
    }
}
