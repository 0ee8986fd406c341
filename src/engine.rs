//! Position replication engine.
//!
//! Owns every account, the replication parameters, the double-check state
//! and the emergency queue. The tick loop and the emergency drain loop share
//! one `Arc<Engine>`; each account sits behind its own lock so a mirror is
//! never corrected by two passes at once.

use crate::alert::{Alert, AlertSink};
use crate::double_check::{DoubleCheck, DoubleCheckScheduler, DEFAULT_DOUBLE_CHECK_TICKS};
use crate::emergency::{EmergencyQueue, EmergencyTask};
use crate::health::{classify, SessionHealth};
use crate::params::{ParamStore, ReplicationParams};
use crate::positions::{AccountRole, PositionEntry, Snapshot};
use crate::reconcile::{reconcile, CorrectiveOrder, ReconcileError};
use crate::session::AccountSession;
use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine halted after a fatal tick error")]
    Halted,
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("failed to persist replication params: {0:#}")]
    Persist(anyhow::Error),
    #[error("at most {max} mirror accounts are supported, got {got}")]
    TooManyMirrors { max: usize, got: usize },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ticks between a detected primary change and the repeat pass.
    pub double_check_ticks: u32,
    /// Treat the first fresh primary read as a change.
    pub reconcile_on_startup: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { double_check_ticks: DEFAULT_DOUBLE_CHECK_TICKS, reconcile_on_startup: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Paused,
    Idle,
    /// Primary changed; every eligible mirror was reconciled.
    Replicated,
    /// The delayed repeat pass ran.
    DoubleChecked,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub role: AccountRole,
    pub connected: bool,
    pub session_dirty: bool,
    pub positions: Vec<PositionEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub paused: bool,
    pub halted: bool,
    pub double_check: DoubleCheck,
    pub pending_emergency_tasks: usize,
    pub accounts: Vec<AccountStatus>,
}

/// Outcome of one reconciliation pass over the mirrors.
#[derive(Debug, Default, Clone, Copy)]
struct PassReport {
    failed: usize,
    skipped: usize,
}

struct Account {
    role: AccountRole,
    session: Box<dyn AccountSession>,
    connected: bool,
    session_dirty: bool,
    /// Positions were read successfully during the current tick and no order
    /// has been sent since.
    fresh: bool,
    snapshot: Snapshot,
}

impl Account {
    fn new(role: AccountRole, session: Box<dyn AccountSession>) -> Self {
        Self { role, session, connected: false, session_dirty: false, fresh: false, snapshot: Snapshot::default() }
    }

    fn usable(&self) -> bool {
        self.connected && !self.session_dirty
    }

    async fn login(&mut self, alerts: &dyn AlertSink) -> bool {
        match self.session.login().await {
            Ok(()) => {
                self.connected = true;
                self.session_dirty = false;
                alerts.notify(Alert::LoginSucceeded { role: self.role });
                true
            }
            Err(failure) => {
                // stays dirty so the next tick tries again
                self.connected = false;
                self.session_dirty = true;
                alerts.notify(Alert::LoginFailed { role: self.role, message: failure.message });
                false
            }
        }
    }

    async fn relogin(&mut self, alerts: &dyn AlertSink) -> bool {
        info!("Session: re-login {}", self.role);
        self.session.close().await;
        self.login(alerts).await
    }

    /// Refresh the snapshot. On failure the previous positions are kept and
    /// the session is marked dirty.
    async fn poll(&mut self, alerts: &dyn AlertSink) -> bool {
        self.fresh = false;
        if !self.usable() {
            debug!("Poll: skipping {} (connected={}, dirty={})", self.role, self.connected, self.session_dirty);
            return false;
        }
        match self.session.fetch_positions().await {
            Ok(positions) => {
                self.snapshot.replace(positions);
                self.fresh = true;
                true
            }
            Err(failure) => {
                let health = classify(&failure.message);
                self.session_dirty = true;
                alerts.notify(Alert::PollFailed { role: self.role, message: failure.message, health });
                false
            }
        }
    }

    /// Send every order, one instrument at a time. Returns the number of
    /// failed orders.
    async fn submit_orders(&mut self, orders: Vec<CorrectiveOrder>, alerts: &dyn AlertSink) -> usize {
        let mut failed = 0;
        for order in orders {
            match self.session.submit_order(&order).await {
                Ok(ack) => {
                    info!("Sync {}: {} on {} via order {}", order.instrument, order, self.role, ack.order_id);
                    alerts.notify(Alert::OrderPlaced { role: self.role, order, order_id: ack.order_id });
                }
                Err(failure) => {
                    failed += 1;
                    let health = classify(&failure.message);
                    if health == SessionHealth::ReauthRequired {
                        self.session_dirty = true;
                    }
                    alerts.notify(Alert::OrderFailed { role: self.role, order, message: failure.message, health });
                }
            }
        }
        // positions are unknown until the next read
        self.fresh = false;
        failed
    }

    fn status(&self) -> AccountStatus {
        AccountStatus {
            role: self.role,
            connected: self.connected,
            session_dirty: self.session_dirty,
            positions: self.snapshot.current().to_vec(),
        }
    }
}

pub struct Engine {
    primary: Mutex<Account>,
    mirrors: Vec<Mutex<Account>>,
    params: RwLock<ReplicationParams>,
    store: ParamStore,
    alerts: Arc<dyn AlertSink>,
    paused: AtomicBool,
    halted: AtomicBool,
    startup_pass_pending: AtomicBool,
    double_check: Mutex<DoubleCheckScheduler>,
    emergency: EmergencyQueue,
}

impl Engine {
    /// Mirrors are assigned roles in order: the first is mirror 1, the
    /// second mirror 2.
    pub fn new(
        primary: Box<dyn AccountSession>,
        mirrors: Vec<Box<dyn AccountSession>>,
        store: ParamStore,
        alerts: Arc<dyn AlertSink>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        if mirrors.len() > AccountRole::MIRRORS.len() {
            return Err(EngineError::TooManyMirrors { max: AccountRole::MIRRORS.len(), got: mirrors.len() });
        }
        let mirrors = AccountRole::MIRRORS
            .iter()
            .zip(mirrors)
            .map(|(role, session)| Mutex::new(Account::new(*role, session)))
            .collect();

        Ok(Self {
            primary: Mutex::new(Account::new(AccountRole::Primary, primary)),
            mirrors,
            params: RwLock::new(ReplicationParams::default()),
            store,
            alerts,
            paused: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            startup_pass_pending: AtomicBool::new(settings.reconcile_on_startup),
            double_check: Mutex::new(DoubleCheckScheduler::new(settings.double_check_ticks)),
            emergency: EmergencyQueue::new(),
        })
    }

    /// Load saved params and log every account in. Login failures are not
    /// fatal; those accounts are retried on the next tick.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        match self.store.load().await.context("load replication params")? {
            Some(params) => {
                info!("Params loaded from {}: {:?}", self.store.path().display(), params);
                *self.params.write().await = params;
            }
            None => info!("No saved params at {}, using defaults", self.store.path().display()),
        }

        for slot in self.accounts() {
            slot.lock().await.login(self.alerts.as_ref()).await;
        }
        Ok(())
    }

    fn accounts(&self) -> impl Iterator<Item = &Mutex<Account>> {
        std::iter::once(&self.primary).chain(self.mirrors.iter())
    }

    fn account(&self, role: AccountRole) -> anyhow::Result<&Mutex<Account>> {
        let slot = match role {
            AccountRole::Primary => Some(&self.primary),
            AccountRole::Mirror1 => self.mirrors.first(),
            AccountRole::Mirror2 => self.mirrors.get(1),
        };
        slot.ok_or_else(|| anyhow!("{} is not configured", role))
    }

    // ===== Tick =====

    /// One replication cycle. An `Err` is fatal for the tick loop.
    pub async fn tick(&self) -> Result<TickOutcome, EngineError> {
        if self.paused.load(Ordering::SeqCst) {
            debug!("Tick: paused");
            return Ok(TickOutcome::Paused);
        }

        self.relogin_dirty().await;
        for slot in self.accounts() {
            slot.lock().await.poll(self.alerts.as_ref()).await;
        }

        let (primary_fresh, primary_changed, primary_positions) = {
            let primary = self.primary.lock().await;
            (primary.fresh, primary.snapshot.changed(), primary.snapshot.current().to_vec())
        };
        let startup_pass = primary_fresh && self.startup_pass_pending.swap(false, Ordering::SeqCst);
        let replicate = primary_fresh && (primary_changed || startup_pass);

        let outcome = {
            let mut double_check = self.double_check.lock().await;
            if replicate {
                double_check.arm();
                TickOutcome::Replicated
            } else if double_check.advance(primary_fresh) {
                TickOutcome::DoubleChecked
            } else {
                TickOutcome::Idle
            }
        };

        let pass = match outcome {
            TickOutcome::Replicated if primary_changed => {
                self.alerts.notify(Alert::PositionsChanged { positions: primary_positions.clone() });
                Some(self.reconcile_mirrors(&primary_positions).await?)
            }
            TickOutcome::Replicated => {
                info!("Tick: startup reconciliation");
                Some(self.reconcile_mirrors(&primary_positions).await?)
            }
            TickOutcome::DoubleChecked => {
                info!("Tick: double check, reconciling again");
                Some(self.reconcile_mirrors(&primary_positions).await?)
            }
            TickOutcome::Idle | TickOutcome::Paused => None,
        };
        if let Some(pass) = pass {
            if pass.failed > 0 {
                warn!("Tick: {} corrective order(s) failed", pass.failed);
            }
            if outcome == TickOutcome::DoubleChecked && pass.skipped > 0 {
                // a mirror missed the repeat pass too; check it again later
                warn!("Tick: {} mirror(s) skipped by the double check, re-arming", pass.skipped);
                self.double_check.lock().await.arm();
            }
        }

        for slot in self.accounts() {
            slot.lock().await.snapshot.rotate();
        }
        Ok(outcome)
    }

    async fn relogin_dirty(&self) {
        for slot in self.accounts() {
            let mut account = slot.lock().await;
            if account.session_dirty && !account.relogin(self.alerts.as_ref()).await {
                warn!("Session: {} still dirty, skipping it this tick", account.role);
            }
        }
    }

    /// Bring every mirror read fresh this tick to `primary * scale`.
    async fn reconcile_mirrors(&self, primary: &[PositionEntry]) -> Result<PassReport, ReconcileError> {
        let params = *self.params.read().await;
        let mut report = PassReport::default();
        for slot in &self.mirrors {
            let mut account = slot.lock().await;
            match self.sync_mirror(&mut account, primary, &params).await? {
                Some(failed) => report.failed += failed,
                None => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Returns the number of failed orders, or `None` when the mirror was
    /// skipped.
    async fn sync_mirror(
        &self,
        account: &mut Account,
        primary: &[PositionEntry],
        params: &ReplicationParams,
    ) -> Result<Option<usize>, ReconcileError> {
        if !account.usable() || !account.fresh {
            warn!(
                "Sync: skipping {} (connected={}, dirty={}, fresh={})",
                account.role, account.connected, account.session_dirty, account.fresh
            );
            return Ok(None);
        }
        let scale = params.scale_for(account.role);
        let orders = reconcile(primary, account.snapshot.current(), scale)?;
        if orders.is_empty() {
            debug!("Sync: {} already matches primary x{}", account.role, scale);
            return Ok(Some(0));
        }
        Ok(Some(account.submit_orders(orders, self.alerts.as_ref()).await))
    }

    // ===== Emergency =====

    pub fn enqueue_emergency(&self, task: EmergencyTask) {
        info!("Emergency: queued {}", task);
        self.emergency.push(task);
    }

    /// Run every task queued before this call, in order. Failures are
    /// alerted and do not stop the batch. Returns the number of tasks run.
    pub async fn drain_emergency(&self) -> usize {
        let batch = self.emergency.take_batch();
        let count = batch.len();
        for task in batch {
            debug!("Emergency: running {}", task);
            if let Err(e) = self.run_emergency(&task).await {
                error!("Emergency: {} failed: {:#}", task, e);
                self.alerts.notify(Alert::EmergencyFailed { task, message: format!("{e:#}") });
            }
        }
        count
    }

    async fn run_emergency(&self, task: &EmergencyTask) -> anyhow::Result<()> {
        match task {
            EmergencyTask::FlattenMirror { role } => self.close_positions(*role, None).await,
            EmergencyTask::ClosePosition { role, instrument } => {
                self.close_positions(*role, Some(instrument.as_str())).await
            }
            EmergencyTask::Resync => self.resync().await,
            EmergencyTask::Relogin { role } => {
                let mut account = self.account(*role)?.lock().await;
                if !account.relogin(self.alerts.as_ref()).await {
                    bail!("login failed");
                }
                Ok(())
            }
        }
    }

    /// Close open positions on one account from a fresh read. The engine is
    /// not paused here; pause first if the mirror should stay flat.
    async fn close_positions(&self, role: AccountRole, instrument: Option<&str>) -> anyhow::Result<()> {
        if role == AccountRole::Primary {
            bail!("{} is not a mirror account", role);
        }
        let mut account = self.account(role)?.lock().await;
        if !account.poll(self.alerts.as_ref()).await {
            bail!("could not read {} positions", role);
        }
        let mut orders = reconcile(&[], account.snapshot.current(), 0)?;
        if let Some(code) = instrument {
            orders.retain(|o| o.instrument == code);
        }
        if orders.is_empty() {
            info!("Emergency: nothing open to close on {}", role);
            return Ok(());
        }
        let failed = account.submit_orders(orders, self.alerts.as_ref()).await;
        if failed > 0 {
            bail!("{} closing order(s) failed on {}", failed, role);
        }
        Ok(())
    }

    async fn resync(&self) -> anyhow::Result<()> {
        let primary_positions = {
            let mut primary = self.primary.lock().await;
            if !primary.poll(self.alerts.as_ref()).await {
                bail!("could not read primary positions");
            }
            primary.snapshot.current().to_vec()
        };

        let params = *self.params.read().await;
        let mut failed = 0;
        for slot in &self.mirrors {
            let mut account = slot.lock().await;
            if !account.poll(self.alerts.as_ref()).await {
                warn!("Resync: could not read {} positions", account.role);
                failed += 1;
                continue;
            }
            failed += self.sync_mirror(&mut account, &primary_positions, &params).await?.unwrap_or(1);
        }
        if failed > 0 {
            bail!("{} mirror read/order failure(s) during resync", failed);
        }
        Ok(())
    }

    // ===== Operator API =====

    pub async fn params(&self) -> ReplicationParams {
        *self.params.read().await
    }

    /// Persist, then apply. Nothing changes if the write fails.
    pub async fn set_params(&self, params: ReplicationParams) -> Result<(), EngineError> {
        let mut current = self.params.write().await;
        self.store.save(&params).await.map_err(EngineError::Persist)?;
        info!("Params updated: {:?} -> {:?}", *current, params);
        *current = params;
        Ok(())
    }

    pub async fn persist_params(&self) -> Result<(), EngineError> {
        let params = *self.params.read().await;
        self.store.save(&params).await.map_err(EngineError::Persist)
    }

    /// Takes effect at the top of the next tick. Refused once halted.
    pub fn set_pause(&self, pause: bool) -> Result<(), EngineError> {
        if self.is_halted() {
            return Err(EngineError::Halted);
        }
        self.paused.store(pause, Ordering::SeqCst);
        info!("Replication {}", if pause { "paused" } else { "resumed" });
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Called by the tick supervisor when the loop dies.
    pub fn halt(&self, message: String) {
        self.halted.store(true, Ordering::SeqCst);
        self.alerts.notify(Alert::Fatal { message });
    }

    pub async fn status(&self) -> EngineStatus {
        let mut accounts = Vec::with_capacity(1 + self.mirrors.len());
        for slot in self.accounts() {
            accounts.push(slot.lock().await.status());
        }
        EngineStatus {
            paused: self.is_paused(),
            halted: self.is_halted(),
            double_check: self.double_check.lock().await.state(),
            pending_emergency_tasks: self.emergency.len(),
            accounts,
        }
    }
}
