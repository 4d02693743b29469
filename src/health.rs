use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::recorder::JsonlAppender;
use crate::types::now_ms;

#[derive(Default)]
pub struct HealthCounters {
    monitor_cycles_ok: AtomicU64,
    monitor_cycles_failed: AtomicU64,
    ingest_cycles_ok: AtomicU64,
    ingest_cycles_failed: AtomicU64,
    deals_inserted: AtomicU64,
    deals_duplicated: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_failed: AtomicU64,
    store_size: AtomicU64,
    last_copy_count: AtomicU64,
    last_monitor_ok_ms: AtomicU64,
    last_ingest_ok_ms: AtomicU64,
}

impl HealthCounters {
    pub fn inc_monitor_cycles_ok(&self, n: u64) {
        self.monitor_cycles_ok.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_monitor_cycles_failed(&self, n: u64) {
        self.monitor_cycles_failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_ingest_cycles_ok(&self, n: u64) {
        self.ingest_cycles_ok.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_ingest_cycles_failed(&self, n: u64) {
        self.ingest_cycles_failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_deals_inserted(&self, n: u64) {
        self.deals_inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_deals_duplicated(&self, n: u64) {
        self.deals_duplicated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_alerts_sent(&self, n: u64) {
        self.alerts_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_alerts_failed(&self, n: u64) {
        self.alerts_failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_store_size(&self, size: usize) {
        self.store_size.store(size as u64, Ordering::Relaxed);
    }

    pub fn set_last_copy_count(&self, count: u64) {
        self.last_copy_count.store(count, Ordering::Relaxed);
    }

    pub fn set_last_monitor_ok_ms(&self, ts_ms: u64) {
        self.last_monitor_ok_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn set_last_ingest_ok_ms(&self, ts_ms: u64) {
        self.last_ingest_ok_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            ts_ms: now_ms(),
            monitor_cycles_ok: self.monitor_cycles_ok.load(Ordering::Relaxed),
            monitor_cycles_failed: self.monitor_cycles_failed.load(Ordering::Relaxed),
            ingest_cycles_ok: self.ingest_cycles_ok.load(Ordering::Relaxed),
            ingest_cycles_failed: self.ingest_cycles_failed.load(Ordering::Relaxed),
            deals_inserted: self.deals_inserted.load(Ordering::Relaxed),
            deals_duplicated: self.deals_duplicated.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed.load(Ordering::Relaxed),
            store_size: self.store_size.load(Ordering::Relaxed),
            last_copy_count: self.last_copy_count.load(Ordering::Relaxed),
            last_monitor_ok_ms: self.last_monitor_ok_ms.load(Ordering::Relaxed),
            last_ingest_ok_ms: self.last_ingest_ok_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthLine {
    Heartbeat(HealthSnapshot),
    IngestCycle {
        ts_ms: u64,
        fetched: usize,
        inserted: usize,
        duplicated: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ts_ms: u64,
    pub monitor_cycles_ok: u64,
    pub monitor_cycles_failed: u64,
    pub ingest_cycles_ok: u64,
    pub ingest_cycles_failed: u64,
    pub deals_inserted: u64,
    pub deals_duplicated: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub store_size: u64,
    pub last_copy_count: u64,
    pub last_monitor_ok_ms: u64,
    pub last_ingest_ok_ms: u64,
}

pub fn spawn_health_writer(
    path: PathBuf,
    counters: Arc<HealthCounters>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(mpsc::Sender<HealthLine>, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<HealthLine>(1_000);

    let handle = tokio::spawn(async move {
        let mut out = match JsonlAppender::open(&path) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "health file open failed");
                return;
            }
        };

        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {
                    let line = HealthLine::Heartbeat(counters.snapshot());
                    if let Err(e) = out.append(&line) {
                        warn!(error = %e, "heartbeat write failed");
                    }
                }
                maybe = rx.recv() => {
                    let Some(line) = maybe else { break; };
                    if let Err(e) = out.append(&line) {
                        warn!(error = %e, "health line write failed");
                    }
                }
            }
        }

        if let Err(e) = out.flush_and_sync() {
            warn!(error = %e, "health file flush failed");
        }
    });

    Ok((tx, handle))
}
