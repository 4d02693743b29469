use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::fetch::RetryPolicy;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub binance: BinanceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl Config {
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.monitor.enabled && !self.ingest.enabled {
            anyhow::bail!("monitor and ingest both disabled; nothing to run");
        }

        if self.binance.http_timeout_ms == 0 {
            anyhow::bail!("invalid binance.http_timeout_ms=0 (must be > 0)");
        }
        if !self.fetch.backoff_factor.is_finite() || self.fetch.backoff_factor < 0.0 {
            anyhow::bail!(
                "invalid fetch.backoff_factor (must be finite and >= 0), got {}",
                self.fetch.backoff_factor
            );
        }

        fn check_nonempty(name: &str, v: &str) -> anyhow::Result<()> {
            if v.trim().is_empty() {
                anyhow::bail!("{name} must not be empty");
            }
            Ok(())
        }

        check_nonempty("extract.marker_id", &self.extract.marker_id)?;
        check_nonempty("extract.app_data_path", &self.extract.app_data_path)?;
        check_nonempty("extract.copy_count_field", &self.extract.copy_count_field)?;
        check_nonempty(
            "extract.envelope_success_code",
            &self.extract.envelope_success_code,
        )?;

        if self.monitor.enabled {
            check_nonempty("monitor.lead_id", &self.monitor.lead_id)?;
            if self.monitor.poll_interval_ms == 0 {
                anyhow::bail!("invalid monitor.poll_interval_ms=0 (must be > 0)");
            }
            if self.monitor.max_error_count == 0 {
                anyhow::bail!("invalid monitor.max_error_count=0 (must be > 0)");
            }
        }

        if self.ingest.enabled {
            check_nonempty("ingest.lead_id", &self.ingest.lead_id)?;
            if self.ingest.poll_interval_ms == 0 {
                anyhow::bail!("invalid ingest.poll_interval_ms=0 (must be > 0)");
            }
            if self.ingest.fetch_retry_limit == 0 {
                anyhow::bail!("invalid ingest.fetch_retry_limit=0 (must be > 0)");
            }
            if self.ingest.page_size == 0 {
                anyhow::bail!("invalid ingest.page_size=0 (must be > 0)");
            }
            check_nonempty("ingest.store_file", &self.ingest.store_file)?;
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.fetch.max_retries,
            backoff_factor: self.fetch.backoff_factor,
            timeout: Duration::from_millis(self.binance.http_timeout_ms),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.run.data_dir.join(&self.ingest.store_file)
    }

    pub fn health_path(&self) -> PathBuf {
        self.run.data_dir.join("health.jsonl")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BinanceConfig {
    /// Portal base for the lead-detail pages (scrape variant).
    #[serde(default = "default_portal_base")]
    pub portal_base: String,
    /// API base for the copy-trade endpoints (history variant).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_deal_history_path")]
    pub deal_history_path: String,
    /// Request timeout applied to every upstream call (ms).
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// TCP connect timeout (ms).
    #[serde(default = "default_http_connect_timeout_ms")]
    pub http_connect_timeout_ms: u64,
    /// Browser-shaped headers for the portal GET. The page is served to
    /// browsers; a bare client UA gets a challenge page without the marker.
    #[serde(default = "default_page_accept")]
    pub page_accept: String,
    #[serde(default = "default_page_accept_language")]
    pub page_accept_language: String,
    #[serde(default = "default_page_referer")]
    pub page_referer: String,
    #[serde(default = "default_page_user_agent")]
    pub page_user_agent: String,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            portal_base: default_portal_base(),
            api_base: default_api_base(),
            deal_history_path: default_deal_history_path(),
            http_timeout_ms: default_http_timeout_ms(),
            http_connect_timeout_ms: default_http_connect_timeout_ms(),
            page_accept: default_page_accept(),
            page_accept_language: default_page_accept_language(),
            page_referer: default_page_referer(),
            page_user_agent: default_page_user_agent(),
        }
    }
}

fn default_portal_base() -> String {
    "https://www.binance.com/zh-CN".to_string()
}

fn default_api_base() -> String {
    "https://www.binance.com/bapi/futures/v1/public/future/copy-trade".to_string()
}

fn default_deal_history_path() -> String {
    "/lead-portfolio/deal-history".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_http_connect_timeout_ms() -> u64 {
    3_000
}

fn default_page_accept() -> String {
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8".to_string()
}

fn default_page_accept_language() -> String {
    "zh-CN,zh;q=0.9".to_string()
}

fn default_page_referer() -> String {
    "https://www.binance.com/zh-CN/copy-trading".to_string()
}

fn default_page_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    0.3
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_marker_id")]
    pub marker_id: String,
    /// Dotted path from the marker JSON root to the lead-detail object.
    /// The `d6a9` route-id segment is versioned upstream; when the portal
    /// redeploys, fix it here.
    #[serde(default = "default_app_data_path")]
    pub app_data_path: String,
    #[serde(default = "default_copy_count_field")]
    pub copy_count_field: String,
    #[serde(default = "default_envelope_success_code")]
    pub envelope_success_code: String,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            marker_id: default_marker_id(),
            app_data_path: default_app_data_path(),
            copy_count_field: default_copy_count_field(),
            envelope_success_code: default_envelope_success_code(),
        }
    }
}

fn default_marker_id() -> String {
    "__APP_DATA".to_string()
}

fn default_app_data_path() -> String {
    "appState.loader.dataByRouteId.d6a9.dehydratedState.queries.1.state.data.data".to_string()
}

fn default_copy_count_field() -> String {
    "currentCopyCount".to_string()
}

fn default_envelope_success_code() -> String {
    "000000".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub lead_id: String,
    #[serde(default = "default_copy_count_floor")]
    pub copy_count_floor: u64,
    #[serde(default = "default_monitor_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive failed cycles before the critical alert fires.
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,
    /// When true, warning/critical alerts fire on regime entry only and
    /// re-arm on recovery. Default repeats them every qualifying cycle.
    #[serde(default)]
    pub suppress_repeat_alerts: bool,
    #[serde(default = "default_time_range")]
    pub time_range: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            lead_id: String::new(),
            copy_count_floor: default_copy_count_floor(),
            poll_interval_ms: default_monitor_poll_interval_ms(),
            max_error_count: default_max_error_count(),
            suppress_repeat_alerts: false,
            time_range: default_time_range(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_copy_count_floor() -> u64 {
    1_000
}

fn default_monitor_poll_interval_ms() -> u64 {
    60_000
}

fn default_max_error_count() -> u32 {
    5
}

fn default_time_range() -> String {
    "30D".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub lead_id: String,
    #[serde(default = "default_ingest_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// In-cycle attempts before the cycle is declared failed.
    #[serde(default = "default_fetch_retry_limit")]
    pub fetch_retry_limit: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// How far back each history request reaches (ms).
    #[serde(default = "default_history_window_ms")]
    pub history_window_ms: u64,
    /// Store file name, joined under `run.data_dir`.
    #[serde(default = "default_store_file")]
    pub store_file: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            lead_id: String::new(),
            poll_interval_ms: default_ingest_poll_interval_ms(),
            fetch_retry_limit: default_fetch_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            page_size: default_page_size(),
            history_window_ms: default_history_window_ms(),
            store_file: default_store_file(),
        }
    }
}

fn default_ingest_poll_interval_ms() -> u64 {
    30_000
}

fn default_fetch_retry_limit() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_page_size() -> u32 {
    50
}

fn default_history_window_ms() -> u64 {
    86_400_000
}

fn default_store_file() -> String {
    "deals.jsonl".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_webhook_base")]
    pub webhook_base: String,
    /// Env var name holding the webhook access token. Config carries the
    /// name only; the value never lands in a file.
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_content_prefix")]
    pub content_prefix: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_base: default_webhook_base(),
            access_token_env: default_access_token_env(),
            content_prefix: default_content_prefix(),
        }
    }
}

fn default_webhook_base() -> String {
    "https://oapi.dingtalk.com/robot/send".to_string()
}

fn default_access_token_env() -> String {
    "COPYSENTRY_WEBHOOK_TOKEN".to_string()
}

fn default_content_prefix() -> String {
    "[copysentry]".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
