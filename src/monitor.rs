//! The two polling loops and the pure alert decision they share.
//!
//! [`evaluate_cycle`] is separated from the loops so the alerting contract is
//! testable without I/O: feed it outcomes, read back alerts. The loops own
//! cadence, shutdown, and delivery.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::binance::LeadApi;
use crate::config::{IngestConfig, MonitorConfig};
use crate::health::{HealthCounters, HealthLine};
use crate::notify::Notifier;
use crate::store::{self, DealStore, IngestStatus};
use crate::types::{now_ms, Alert, Record};

/// Per-loop state. Never persisted: a restart starts with a clean slate.
#[derive(Clone, Debug, Default)]
pub struct MonitorState {
    pub consecutive_errors: u32,
    pub last_value: Option<u64>,
    below_floor_alerted: bool,
    critical_alerted: bool,
}

/// What one poll produced. Failure is collapsed to its display text: the
/// decision does not care which stage broke, only that the cycle did.
#[derive(Clone, Debug)]
pub enum CycleOutcome {
    Value(u64),
    Failed(String),
}

/// Fold one outcome into the state and return the cycle's alerts, in
/// emission order.
///
/// Default behavior repeats warning/error/critical every qualifying cycle.
/// With `suppress_repeat_alerts` they fire on regime entry only and re-arm
/// once the condition clears.
pub fn evaluate_cycle(
    state: &mut MonitorState,
    outcome: &CycleOutcome,
    cfg: &MonitorConfig,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    match outcome {
        CycleOutcome::Failed(detail) => {
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            let first_of_streak = state.consecutive_errors == 1;
            if !cfg.suppress_repeat_alerts || first_of_streak {
                alerts.push(Alert::error(format!(
                    "lead {} data unavailable ({} consecutive errors): {}",
                    cfg.lead_id, state.consecutive_errors, detail
                )));
            }
            if state.consecutive_errors >= cfg.max_error_count
                && (!cfg.suppress_repeat_alerts || !state.critical_alerted)
            {
                alerts.push(Alert::critical(format!(
                    "monitor failing: {} consecutive errors for lead {}",
                    state.consecutive_errors, cfg.lead_id
                )));
                state.critical_alerted = true;
            }
        }
        CycleOutcome::Value(v) => {
            state.consecutive_errors = 0;
            state.critical_alerted = false;
            state.last_value = Some(*v);
            if *v < cfg.copy_count_floor {
                if !cfg.suppress_repeat_alerts || !state.below_floor_alerted {
                    alerts.push(Alert::warning(format!(
                        "lead {} copy count {} below floor {}",
                        cfg.lead_id, v, cfg.copy_count_floor
                    )));
                }
                state.below_floor_alerted = true;
            } else {
                state.below_floor_alerted = false;
            }
        }
    }

    alerts
}

async fn deliver(notifier: &Notifier, health: &HealthCounters, alerts: &[Alert]) {
    for alert in alerts {
        if notifier.notify(alert).await {
            health.inc_alerts_sent(1);
        } else if notifier.is_active() {
            health.inc_alerts_failed(1);
        }
    }
}

/// Threshold loop: poll the lead detail page every interval, track the copy
/// count against the floor and the error streak against the cap.
pub async fn run_threshold_monitor(
    cfg: MonitorConfig,
    api: std::sync::Arc<LeadApi>,
    notifier: std::sync::Arc<Notifier>,
    health: std::sync::Arc<HealthCounters>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut state = MonitorState::default();
    let mut tick = tokio::time::interval(Duration::from_millis(cfg.poll_interval_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(lead_id = %cfg.lead_id, floor = cfg.copy_count_floor, "threshold monitor started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = tick.tick() => {
                let outcome = match api.copy_count(&cfg.lead_id, &cfg.time_range).await {
                    Ok(v) => {
                        health.inc_monitor_cycles_ok(1);
                        health.set_last_copy_count(v);
                        health.set_last_monitor_ok_ms(now_ms());
                        info!(lead_id = %cfg.lead_id, copy_count = v, "monitor cycle ok");
                        CycleOutcome::Value(v)
                    }
                    Err(e) => {
                        health.inc_monitor_cycles_failed(1);
                        CycleOutcome::Failed(e.to_string())
                    }
                };
                let alerts = evaluate_cycle(&mut state, &outcome, &cfg);
                deliver(&notifier, &health, &alerts).await;
            }
        }
    }

    info!("threshold monitor stopped");
    Ok(())
}

/// Ingest loop: pull the recent history window every interval, dedup into
/// the store, alert once per new fill.
pub async fn run_deal_ingest(
    cfg: IngestConfig,
    api: std::sync::Arc<LeadApi>,
    mut store: Box<dyn DealStore + Send>,
    notifier: std::sync::Arc<Notifier>,
    health: std::sync::Arc<HealthCounters>,
    health_tx: mpsc::Sender<HealthLine>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(Duration::from_millis(cfg.poll_interval_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(lead_id = %cfg.lead_id, "deal ingest started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = tick.tick() => {
                run_ingest_cycle(&cfg, &api, store.as_mut(), &notifier, &health, &health_tx).await;
            }
        }
    }

    if let Err(e) = store.flush() {
        warn!(error = %e, "deal store flush failed");
    }
    info!("deal ingest stopped");
    Ok(())
}

async fn run_ingest_cycle(
    cfg: &IngestConfig,
    api: &LeadApi,
    store: &mut (dyn DealStore + Send),
    notifier: &Notifier,
    health: &HealthCounters,
    health_tx: &mpsc::Sender<HealthLine>,
) {
    let end_ms = now_ms();
    let start_ms = end_ms.saturating_sub(cfg.history_window_ms);

    let rows = match fetch_history_page(cfg, api, start_ms, end_ms).await {
        Ok(rows) => rows,
        Err(detail) => {
            health.inc_ingest_cycles_failed(1);
            let alert = Alert::critical(format!(
                "deal history unavailable after {} attempts for lead {}: {}",
                cfg.fetch_retry_limit, cfg.lead_id, detail
            ));
            deliver(notifier, health, std::slice::from_ref(&alert)).await;
            return;
        }
    };

    let mut inserted = 0usize;
    let mut duplicated = 0usize;
    for row in &rows {
        match store::ingest(store, row) {
            Ok(IngestStatus::Inserted) => {
                inserted += 1;
                health.inc_deals_inserted(1);
                let alert = Alert::info(deal_summary(row));
                deliver(notifier, health, std::slice::from_ref(&alert)).await;
            }
            Ok(IngestStatus::Duplicate) => {
                duplicated += 1;
                health.inc_deals_duplicated(1);
            }
            Err(e) => {
                error!(error = %e, "deal store write failed; aborting cycle");
                health.inc_ingest_cycles_failed(1);
                let alert = Alert::error(format!("deal store write failed: {e}"));
                deliver(notifier, health, std::slice::from_ref(&alert)).await;
                return;
            }
        }
    }

    health.inc_ingest_cycles_ok(1);
    health.set_last_ingest_ok_ms(now_ms());
    health.set_store_size(store.len());
    if inserted > 0 || duplicated > 0 {
        info!(fetched = rows.len(), inserted, duplicated, "ingest cycle");
    }

    let line = HealthLine::IngestCycle {
        ts_ms: now_ms(),
        fetched: rows.len(),
        inserted,
        duplicated,
    };
    if let Err(e) = health_tx.try_send(line) {
        debug!(error = %e, "health event dropped");
    }
}

/// In-cycle bounded retry around the history fetch. Distinct from the wire
/// retry inside [`LeadApi`]: this layer also covers parse failures, and its
/// exhaustion is what escalates to the critical alert.
async fn fetch_history_page(
    cfg: &IngestConfig,
    api: &LeadApi,
    start_ms: u64,
    end_ms: u64,
) -> Result<Vec<Record>, String> {
    let mut last_err = String::new();
    for attempt in 1..=cfg.fetch_retry_limit {
        match api
            .deal_history(&cfg.lead_id, start_ms, end_ms, cfg.page_size)
            .await
        {
            Ok(rows) => return Ok(rows),
            Err(e) => {
                warn!(
                    error = %e,
                    attempt,
                    limit = cfg.fetch_retry_limit,
                    "deal history fetch failed"
                );
                last_err = e.to_string();
                if attempt < cfg.fetch_retry_limit {
                    tokio::time::sleep(Duration::from_millis(cfg.retry_delay_ms)).await;
                }
            }
        }
    }
    Err(last_err)
}

/// One-line fill summary for the insert alert; `N/A` for absent fields.
fn deal_summary(row: &Record) -> String {
    fn field(row: &Record, key: &str) -> String {
        match row.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "N/A".to_string(),
            Some(other) => other.to_string(),
        }
    }
    format!(
        "new deal: symbol={} side={} avgPrice={} executedQty={}",
        field(row, "symbol"),
        field(row, "side"),
        field(row, "avgPrice"),
        field(row, "executedQty"),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{deal_summary, evaluate_cycle, CycleOutcome, MonitorState};
    use crate::config::MonitorConfig;
    use crate::types::Severity;

    fn cfg() -> MonitorConfig {
        MonitorConfig {
            lead_id: "lead-1".to_string(),
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn warning_fires_only_on_the_below_floor_poll() {
        let cfg = cfg();
        let mut state = MonitorState::default();

        assert!(evaluate_cycle(&mut state, &CycleOutcome::Value(1500), &cfg).is_empty());

        let alerts = evaluate_cycle(&mut state, &CycleOutcome::Value(900), &cfg);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].text.contains("900"));
        assert!(alerts[0].text.contains("1000"));

        assert!(evaluate_cycle(&mut state, &CycleOutcome::Value(1200), &cfg).is_empty());
        assert_eq!(state.last_value, Some(1200));
    }

    #[test]
    fn fifth_consecutive_failure_escalates_to_critical() {
        let cfg = cfg();
        let mut state = MonitorState::default();

        for i in 1..=4u32 {
            let alerts = evaluate_cycle(&mut state, &CycleOutcome::Failed("timeout".into()), &cfg);
            assert_eq!(alerts.len(), 1, "failure {i} should emit the error alert only");
            assert_eq!(alerts[0].severity, Severity::Error);
            assert!(alerts[0].text.contains(&format!("({i} consecutive errors)")));
        }

        let alerts = evaluate_cycle(&mut state, &CycleOutcome::Failed("timeout".into()), &cfg);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert_eq!(alerts[1].severity, Severity::Critical);
        assert_eq!(state.consecutive_errors, 5);
    }

    #[test]
    fn success_resets_the_error_streak() {
        let cfg = cfg();
        let mut state = MonitorState::default();

        for _ in 0..3 {
            evaluate_cycle(&mut state, &CycleOutcome::Failed("connect".into()), &cfg);
        }
        assert_eq!(state.consecutive_errors, 3);

        assert!(evaluate_cycle(&mut state, &CycleOutcome::Value(1500), &cfg).is_empty());
        assert_eq!(state.consecutive_errors, 0);

        let alerts = evaluate_cycle(&mut state, &CycleOutcome::Failed("connect".into()), &cfg);
        assert!(alerts[0].text.contains("(1 consecutive errors)"));
    }

    #[test]
    fn persisting_conditions_repeat_by_default() {
        let cfg = cfg();
        let mut state = MonitorState::default();

        let first = evaluate_cycle(&mut state, &CycleOutcome::Value(900), &cfg);
        let second = evaluate_cycle(&mut state, &CycleOutcome::Value(950), &cfg);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        for _ in 0..5 {
            evaluate_cycle(&mut state, &CycleOutcome::Failed("x".into()), &cfg);
        }
        // Sixth failure: still error + critical under the default policy.
        let alerts = evaluate_cycle(&mut state, &CycleOutcome::Failed("x".into()), &cfg);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].severity, Severity::Critical);
    }

    #[test]
    fn suppression_makes_alerts_edge_triggered() {
        let cfg = MonitorConfig {
            suppress_repeat_alerts: true,
            ..cfg()
        };
        let mut state = MonitorState::default();

        // Warning once for the whole below-floor stretch, re-armed on recovery.
        assert_eq!(evaluate_cycle(&mut state, &CycleOutcome::Value(900), &cfg).len(), 1);
        assert!(evaluate_cycle(&mut state, &CycleOutcome::Value(950), &cfg).is_empty());
        assert!(evaluate_cycle(&mut state, &CycleOutcome::Value(1500), &cfg).is_empty());
        assert_eq!(evaluate_cycle(&mut state, &CycleOutcome::Value(800), &cfg).len(), 1);

        // Errors: first of the streak only; critical once at the cap.
        let mut state = MonitorState::default();
        assert_eq!(
            evaluate_cycle(&mut state, &CycleOutcome::Failed("x".into()), &cfg).len(),
            1
        );
        for _ in 0..3 {
            assert!(evaluate_cycle(&mut state, &CycleOutcome::Failed("x".into()), &cfg).is_empty());
        }
        let at_cap = evaluate_cycle(&mut state, &CycleOutcome::Failed("x".into()), &cfg);
        assert_eq!(at_cap.len(), 1);
        assert_eq!(at_cap[0].severity, Severity::Critical);
        assert!(evaluate_cycle(&mut state, &CycleOutcome::Failed("x".into()), &cfg).is_empty());
    }

    #[test]
    fn deal_summary_falls_back_to_na() {
        let row = json!({"symbol": "BTCUSDT", "executedQty": 2.5})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(
            deal_summary(&row),
            "new deal: symbol=BTCUSDT side=N/A avgPrice=N/A executedQty=2.5"
        );
    }
}
