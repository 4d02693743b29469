//! Upstream surface: the copy-trading portal and its history API.
//!
//! [`LeadApi`] owns the HTTP client, the retry policy, and the request
//! construction for both variants. Loops depend on this struct, never on an
//! ambient session, so tests can point it at local fixtures.

use std::time::Duration;

use anyhow::Context as _;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::extract::{self, ExtractPath, ParseError};
use crate::fetch::{self, FetchError, RequestSpec, RetryPolicy};
use crate::types::Record;

/// A cycle fails the same way whether the wire or the shape broke; the
/// variants keep the stage visible in logs and alert texts.
#[derive(Debug, Error)]
pub enum LeadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub struct LeadApi {
    client: reqwest::Client,
    policy: RetryPolicy,
    app_data_path: ExtractPath,
    cfg: Config,
}

impl LeadApi {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("copysentry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_millis(cfg.binance.http_connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.binance.http_timeout_ms))
            .build()
            .context("build http client")?;

        Ok(Self {
            client,
            policy: cfg.retry_policy(),
            app_data_path: ExtractPath::parse(&cfg.extract.app_data_path),
            cfg: cfg.clone(),
        })
    }

    fn lead_details_url(&self, lead_id: &str) -> String {
        format!(
            "{}/copy-trading/lead-details/{}",
            self.cfg.binance.portal_base.trim_end_matches('/'),
            lead_id
        )
    }

    fn deal_history_url(&self) -> String {
        format!(
            "{}{}",
            self.cfg.binance.api_base.trim_end_matches('/'),
            self.cfg.binance.deal_history_path
        )
    }

    fn page_spec(&self, lead_id: &str, time_range: &str) -> RequestSpec {
        RequestSpec::get(self.lead_details_url(lead_id))
            .query("timeRange", time_range)
            .header("accept", &self.cfg.binance.page_accept)
            .header("accept-language", &self.cfg.binance.page_accept_language)
            .header("referer", &self.cfg.binance.page_referer)
            .header("user-agent", &self.cfg.binance.page_user_agent)
    }

    fn history_spec(&self, lead_id: &str, start_ms: u64, end_ms: u64, page_size: u32) -> RequestSpec {
        RequestSpec::post(self.deal_history_url())
            .header("referer", &self.cfg.binance.page_referer)
            .header("user-agent", &self.cfg.binance.page_user_agent)
            .json(json!({
                "entityId": lead_id,
                "startTime": start_ms,
                "endTime": end_ms,
                "pageSize": page_size,
            }))
    }

    /// Scrape variant: portal page, marker JSON, versioned path, count.
    pub async fn copy_count(&self, lead_id: &str, time_range: &str) -> Result<u64, LeadError> {
        let spec = self.page_spec(lead_id, time_range);
        let page = fetch::fetch(&self.client, &spec, &self.policy).await?;
        let app_data = extract::marker_json(&page.body, &self.cfg.extract.marker_id)?;
        let detail = self.app_data_path.walk(&app_data)?;
        let count = extract::require_u64(detail, &self.cfg.extract.copy_count_field)?;
        debug!(lead_id, count, "copy count extracted");
        Ok(count)
    }

    /// History variant: POST the window, decode the envelope into rows.
    pub async fn deal_history(
        &self,
        lead_id: &str,
        start_ms: u64,
        end_ms: u64,
        page_size: u32,
    ) -> Result<Vec<Record>, LeadError> {
        let spec = self.history_spec(lead_id, start_ms, end_ms, page_size);
        let resp = fetch::fetch(&self.client, &spec, &self.policy).await?;
        let rows = extract::decode_envelope(&resp.body, &self.cfg.extract.envelope_success_code)?;
        debug!(lead_id, rows = rows.len(), "deal history page decoded");
        Ok(rows)
    }
}
