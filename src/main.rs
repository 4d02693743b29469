use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use copysentry::binance::LeadApi;
use copysentry::config::Config;
use copysentry::health::{spawn_health_writer, HealthCounters};
use copysentry::monitor;
use copysentry::notify::Notifier;
use copysentry::store::{DealStore as _, JsonlStore};

#[derive(Parser, Debug)]
#[command(
    name = "copysentry",
    version,
    about = "Binance copy-trading lead monitor"
)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let cfg = Config::load(&args.config).context("load config")?;
    cfg.validate().context("validate config")?;

    std::fs::create_dir_all(&cfg.run.data_dir).context("create data_dir")?;

    let api = Arc::new(LeadApi::new(&cfg).context("build upstream api")?);
    let notifier = Arc::new(Notifier::new(&cfg.notify).context("build notifier")?);
    if notifier.is_active() {
        info!("webhook alerts enabled");
    } else {
        info!(
            token_env = %cfg.notify.access_token_env,
            "webhook alerts disabled (token env not set); alerts go to the log"
        );
    }

    let health = Arc::new(HealthCounters::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (health_tx, health_handle) =
        spawn_health_writer(cfg.health_path(), health.clone(), shutdown_rx.clone())
            .context("spawn health writer")?;

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if cfg.monitor.enabled {
        tasks.spawn(monitor::run_threshold_monitor(
            cfg.monitor.clone(),
            api.clone(),
            notifier.clone(),
            health.clone(),
            shutdown_rx.clone(),
        ));
    }

    if cfg.ingest.enabled {
        let store = JsonlStore::open(cfg.store_path()).context("open deal store")?;
        health.set_store_size(store.len());
        tasks.spawn(monitor::run_deal_ingest(
            cfg.ingest.clone(),
            api.clone(),
            Box::new(store),
            notifier.clone(),
            health.clone(),
            health_tx.clone(),
            shutdown_rx.clone(),
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c, shutting down");
        }
        Some(res) = tasks.join_next() => {
            match res {
                Ok(Ok(())) => info!("pipeline task exited"),
                Ok(Err(e)) => error!(error = %e, "pipeline task failed"),
                Err(e) => error!(error = %e, "pipeline task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "pipeline task failed during shutdown"),
            Err(e) => error!(error = %e, "pipeline task panicked during shutdown"),
        }
    }
    let _ = health_handle.await;

    info!("done");
    Ok(())
}
