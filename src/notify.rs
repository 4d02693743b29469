//! Best-effort webhook alert delivery.
//!
//! One POST per alert, no retries, failures logged and swallowed: losing an
//! alert must never take down the monitor that produced it. With no webhook
//! or token configured the notifier runs disabled and alerts only hit the log.

use std::time::Duration;

use anyhow::Context as _;
use serde_json::json;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::types::Alert;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Notifier {
    client: reqwest::Client,
    webhook_base: String,
    access_token: Option<String>,
    content_prefix: String,
}

impl Notifier {
    /// The token is read from the environment variable named in config;
    /// config carries names, never secrets.
    pub fn new(cfg: &NotifyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("copysentry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build webhook client")?;

        let access_token = std::env::var(&cfg.access_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            client,
            webhook_base: cfg.webhook_base.clone(),
            access_token,
            content_prefix: cfg.content_prefix.clone(),
        })
    }

    pub fn is_active(&self) -> bool {
        !self.webhook_base.is_empty() && self.access_token.is_some()
    }

    fn content(&self, alert: &Alert) -> String {
        if self.content_prefix.is_empty() {
            alert.to_string()
        } else {
            format!("{} {}", self.content_prefix, alert)
        }
    }

    /// Deliver one alert. Returns whether the webhook accepted it; a
    /// disabled notifier logs the alert and returns false.
    pub async fn notify(&self, alert: &Alert) -> bool {
        let Some(token) = &self.access_token else {
            info!(severity = alert.severity.as_str(), text = %alert.text, "alert (notifier disabled)");
            return false;
        };
        if self.webhook_base.is_empty() {
            info!(severity = alert.severity.as_str(), text = %alert.text, "alert (no webhook configured)");
            return false;
        }

        let payload = json!({
            "msgtype": "text",
            "text": { "content": self.content(alert) },
        });

        let res = self
            .client
            .post(&self.webhook_base)
            .query(&[("access_token", token.as_str())])
            .json(&payload)
            .send()
            .await;

        match res {
            Ok(resp) if resp.status().is_success() => {
                info!(severity = alert.severity.as_str(), "alert delivered");
                true
            }
            Ok(resp) => {
                warn!(
                    status = resp.status().as_u16(),
                    severity = alert.severity.as_str(),
                    "alert delivery rejected"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, severity = alert.severity.as_str(), "alert delivery failed");
                false
            }
        }
    }
}
