//! In-memory collaborators for engine tests.

use crate::alert::{Alert, AlertSink};
use crate::engine::{Engine, EngineSettings};
use crate::params::{ParamStore, ReplicationParams};
use crate::positions::{net_positions, PositionEntry, Side};
use crate::reconcile::CorrectiveOrder;
use crate::session::{AccountSession, OrderAck, SessionFailure};
use ahash::AHashMap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

#[derive(Debug, Default)]
pub struct FakeBroker {
    pub positions: Vec<PositionEntry>,
    /// Apply accepted orders to `positions` immediately.
    pub fill_orders: bool,
    pub fetch_failure: Option<String>,
    pub login_failure: Option<String>,
    pub order_failures: AHashMap<String, String>,
    /// Accepted orders only.
    pub orders: Vec<CorrectiveOrder>,
    pub logins: usize,
    pub closes: usize,
    pub fetches: usize,
}

impl FakeBroker {
    fn fill(&mut self, order: &CorrectiveOrder) {
        let mut net = net_positions(&self.positions);
        *net.entry(order.instrument.clone()).or_insert(0) += order.side.sign() * order.quantity as i64;
        let mut positions: Vec<PositionEntry> = net
            .into_iter()
            .filter(|(_, q)| *q != 0)
            .map(|(code, q)| {
                let side = if q > 0 { Side::Long } else { Side::Short };
                PositionEntry::new(code, q.unsigned_abs() as u32, side)
            })
            .collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        self.positions = positions;
    }
}

/// Scriptable session; clones share one broker.
#[derive(Debug, Clone, Default)]
pub struct FakeSession {
    broker: Arc<Mutex<FakeBroker>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(&self) -> MutexGuard<'_, FakeBroker> {
        self.broker.lock().unwrap()
    }

    pub fn set_positions(&self, positions: Vec<PositionEntry>) {
        self.broker().positions = positions;
    }

    pub fn positions(&self) -> Vec<PositionEntry> {
        self.broker().positions.clone()
    }

    pub fn fill_orders(&self, fill: bool) {
        self.broker().fill_orders = fill;
    }

    pub fn fail_fetch(&self, message: &str) {
        self.broker().fetch_failure = Some(message.to_string());
    }

    pub fn clear_fetch_failure(&self) {
        self.broker().fetch_failure = None;
    }

    pub fn fail_login(&self, message: &str) {
        self.broker().login_failure = Some(message.to_string());
    }

    pub fn clear_login_failure(&self) {
        self.broker().login_failure = None;
    }

    pub fn fail_order(&self, instrument: &str, message: &str) {
        self.broker().order_failures.insert(instrument.to_string(), message.to_string());
    }

    pub fn clear_order_failures(&self) {
        self.broker().order_failures.clear();
    }

    pub fn orders(&self) -> Vec<CorrectiveOrder> {
        self.broker().orders.clone()
    }

    pub fn logins(&self) -> usize {
        self.broker().logins
    }

    pub fn closes(&self) -> usize {
        self.broker().closes
    }

    pub fn fetches(&self) -> usize {
        self.broker().fetches
    }
}

#[async_trait]
impl AccountSession for FakeSession {
    async fn login(&self) -> Result<(), SessionFailure> {
        let mut broker = self.broker();
        broker.logins += 1;
        match &broker.login_failure {
            Some(message) => Err(SessionFailure::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.broker().closes += 1;
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionEntry>, SessionFailure> {
        let mut broker = self.broker();
        broker.fetches += 1;
        match &broker.fetch_failure {
            Some(message) => Err(SessionFailure::new(message.clone())),
            None => Ok(broker.positions.clone()),
        }
    }

    async fn submit_order(&self, order: &CorrectiveOrder) -> Result<OrderAck, SessionFailure> {
        let mut broker = self.broker();
        if let Some(message) = broker.order_failures.get(&order.instrument) {
            return Err(SessionFailure::new(message.clone()));
        }
        broker.orders.push(order.clone());
        if broker.fill_orders {
            broker.fill(order);
        }
        Ok(OrderAck { order_id: broker.orders.len() as i64 })
    }
}

#[derive(Debug, Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn count(&self, pred: impl Fn(&Alert) -> bool) -> usize {
        self.alerts.lock().unwrap().iter().filter(|&a| pred(a)).count()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub primary: FakeSession,
    pub mirror1: FakeSession,
    pub mirror2: FakeSession,
    pub alerts: Arc<RecordingAlerts>,
    pub store: ParamStore,
    _dir: TempDir,
}

/// Initialised engine with a primary and two mirrors, no saved params.
pub async fn harness(settings: EngineSettings) -> Harness {
    harness_with(settings, None).await
}

pub async fn harness_with(settings: EngineSettings, saved: Option<ReplicationParams>) -> Harness {
    build(settings, saved, 2).await
}

pub async fn single_mirror_harness(settings: EngineSettings) -> Harness {
    build(settings, None, 1).await
}

async fn build(settings: EngineSettings, saved: Option<ReplicationParams>, mirror_count: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = ParamStore::new(dir.path().join("replication_params.json"));
    if let Some(params) = saved {
        store.save(&params).await.unwrap();
    }

    let primary = FakeSession::new();
    let mirror1 = FakeSession::new();
    let mirror2 = FakeSession::new();
    let alerts = Arc::new(RecordingAlerts::default());

    let mirrors: Vec<Box<dyn AccountSession>> = [mirror1.clone(), mirror2.clone()]
        .into_iter()
        .take(mirror_count)
        .map(|s| Box::new(s) as Box<dyn AccountSession>)
        .collect();
    let engine = Engine::new(Box::new(primary.clone()), mirrors, store.clone(), alerts.clone(), settings).unwrap();
    engine.initialize().await.unwrap();

    Harness { engine: Arc::new(engine), primary, mirror1, mirror2, alerts, store, _dir: dir }
}
