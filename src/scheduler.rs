use crate::engine::Engine;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{error, info};

/// When the tick loop wakes up. Picked once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPolicy {
    /// Every `period`, first tick one period after start.
    Fixed(Duration),
    /// On every wall-clock minute boundary (UTC).
    MinuteAligned,
}

enum Ticker {
    Fixed(Interval),
    MinuteAligned,
}

impl Ticker {
    fn new(policy: TickPolicy) -> Self {
        match policy {
            TickPolicy::Fixed(period) => {
                let mut interval = interval_at(Instant::now() + period, period);
                // a slow tick pushes the schedule back instead of bursting
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Ticker::Fixed(interval)
            }
            TickPolicy::MinuteAligned => Ticker::MinuteAligned,
        }
    }

    async fn wait(&mut self) {
        match self {
            Ticker::Fixed(interval) => {
                interval.tick().await;
            }
            Ticker::MinuteAligned => sleep(until_next_minute(Utc::now())).await,
        }
    }
}

/// Time left until the next full minute. Exactly on a boundary this is a
/// full minute, so one boundary never produces two ticks.
pub fn until_next_minute(now: DateTime<Utc>) -> Duration {
    // leap seconds report nanosecond() >= 1e9
    let nanos_into_minute = u64::from(now.second()) * 1_000_000_000 + u64::from(now.nanosecond().min(999_999_999));
    Duration::from_nanos(60_000_000_000 - nanos_into_minute)
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Runs `engine.tick()` on the given policy until shutdown. A tick error
/// ends the loop and is returned.
pub async fn run_tick_loop(engine: Arc<Engine>, policy: TickPolicy, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    info!("Tick loop starting ({:?})", policy);
    let mut ticker = Ticker::new(policy);
    loop {
        tokio::select! {
            _ = ticker.wait() => {}
            _ = shutdown.changed() => {}
        }
        if shutdown_requested(&shutdown) || shutdown.has_changed().is_err() {
            break;
        }
        // never interrupted mid-tick
        engine.tick().await.context("tick failed")?;
    }
    info!("Tick loop stopped");
    Ok(())
}

/// Drains the emergency queue every `period` until shutdown.
pub async fn run_emergency_loop(engine: Arc<Engine>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    info!("Emergency loop starting (every {} ms)", period.as_millis());
    let mut ticker = Ticker::new(TickPolicy::Fixed(period));
    loop {
        tokio::select! {
            _ = ticker.wait() => {}
            _ = shutdown.changed() => {}
        }
        if shutdown_requested(&shutdown) || shutdown.has_changed().is_err() {
            break;
        }
        engine.drain_emergency().await;
    }
    info!("Emergency loop stopped");
}

/// Spawns the tick loop under a supervisor. If the loop fails or panics the
/// engine is halted (fatal alert, pause commands refused) and the error is
/// returned through the handle.
pub fn spawn_supervised(engine: Arc<Engine>, policy: TickPolicy, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
    let worker = tokio::spawn(run_tick_loop(engine.clone(), policy, shutdown));
    tokio::spawn(async move {
        let outcome = match worker.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow!("tick loop panicked: {}", join_err)),
        };
        if let Err(e) = &outcome {
            error!("Tick loop terminated: {:#}", e);
            engine.halt(format!("{e:#}"));
        }
        outcome
    })
}
