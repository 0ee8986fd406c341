use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use mirrorbot::alert::{Alert, AlertSink, WebhookAlerts};
use mirrorbot::config::{AccountConfig, Config};
use mirrorbot::control;
use mirrorbot::engine::{Engine, EngineSettings};
use mirrorbot::params::ParamStore;
use mirrorbot::scheduler;
use mirrorbot::session::{AccountSession, PxSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!("mirrorbot ", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = Config::from_env()?;
    info!("PRIMARY_API_BASE={}", cfg.primary.api_base);

    let alerts: Arc<dyn AlertSink> = Arc::new(WebhookAlerts::new(cfg.alert_webhook_url.clone())?);

    let primary = build_session(&cfg.primary, cfg.request_timeout).context("primary session")?;
    let mut mirrors = vec![build_session(&cfg.mirror1, cfg.request_timeout).context("mirror1 session")?];
    if let Some(m2) = &cfg.mirror2 {
        mirrors.push(build_session(m2, cfg.request_timeout).context("mirror2 session")?);
    }
    info!("Replicating onto {} mirror account(s)", mirrors.len());

    let settings = EngineSettings {
        double_check_ticks: cfg.double_check_ticks,
        reconcile_on_startup: cfg.reconcile_on_startup,
    };
    let engine = Arc::new(Engine::new(
        primary,
        mirrors,
        ParamStore::new(cfg.params_path.clone()),
        alerts.clone(),
        settings,
    )?);
    engine.initialize().await?;
    alerts.notify(Alert::Started { version: VERSION });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut ticker = scheduler::spawn_supervised(engine.clone(), cfg.tick_policy, shutdown_rx.clone());
    let emergency = tokio::spawn(scheduler::run_emergency_loop(engine.clone(), cfg.emergency_period, shutdown_rx.clone()));
    let control = tokio::spawn(control::run_control_loop(engine.clone(), control::spawn_stdin_reader(), shutdown_rx));

    let tick_result = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Shutdown: ctrl-c handler failed: {}", e);
            }
            info!("Shutdown: stop requested");
            shutdown_tx.send(true).ok();
            join_ticker(&mut ticker).await
        }
        res = &mut ticker => flatten_join(res),
    };
    // the ticker is done in both arms; stop the other loops too
    shutdown_tx.send(true).ok();
    if let Err(e) = emergency.await {
        warn!("Shutdown: emergency loop ended abnormally: {}", e);
    }
    if let Err(e) = control.await {
        warn!("Shutdown: control loop ended abnormally: {}", e);
    }

    if let Err(e) = engine.persist_params().await {
        error!("Shutdown: {}", e);
    }
    match serde_json::to_string(&engine.status().await) {
        Ok(json) => info!("Final status: {}", json),
        Err(e) => warn!("Final status unavailable: {}", e),
    }
    alerts.notify(Alert::Stopped);
    // let in-flight webhook posts finish
    tokio::time::sleep(Duration::from_millis(500)).await;

    tick_result
}

fn build_session(acc: &AccountConfig, timeout: Duration) -> Result<Box<dyn AccountSession>> {
    let session = PxSession::new(
        acc.api_base.clone(),
        acc.username.clone(),
        acc.api_key.clone(),
        acc.account.clone(),
        timeout,
    )?;
    Ok(Box::new(session))
}

async fn join_ticker(ticker: &mut tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    flatten_join(ticker.await)
}

fn flatten_join(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.map_err(|e| anyhow!("tick supervisor failed: {}", e))?
}
