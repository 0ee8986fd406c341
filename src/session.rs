//! The account session boundary: everything the engine needs from a broker
//! login, and the REST-backed implementation.

use crate::client::PxClient;
use crate::models::{
    AuthMode, PlaceOrderReq, PositionRecord, ORDER_SIDE_ASK, ORDER_SIDE_BID, ORDER_TYPE_MARKET,
    POSITION_TYPE_LONG, POSITION_TYPE_SHORT,
};
use crate::positions::{PositionEntry, Side};
use crate::reconcile::CorrectiveOrder;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

/// A failed remote call. The message is what the session health table sees.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SessionFailure {
    pub message: String,
}

impl SessionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<anyhow::Error> for SessionFailure {
    fn from(e: anyhow::Error) -> Self {
        Self { message: format!("{e:#}") }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: i64,
}

#[async_trait]
pub trait AccountSession: Send + Sync {
    async fn login(&self) -> Result<(), SessionFailure>;

    /// Drop the current session. Never fails; a dead session is already closed.
    async fn close(&self);

    async fn fetch_positions(&self) -> Result<Vec<PositionEntry>, SessionFailure>;

    async fn submit_order(&self, order: &CorrectiveOrder) -> Result<OrderAck, SessionFailure>;
}

static ORDER_TAG_SEQ: AtomicU64 = AtomicU64::new(1);

#[inline]
fn unique_sync_tag(contract_id: &str, account_id: i32) -> String {
    let seq = ORDER_TAG_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("MB:SYNC:{}:{}:{}", contract_id, account_id, seq)
}

fn entry_from_record(p: &PositionRecord) -> Option<PositionEntry> {
    let side = match p.r#type {
        POSITION_TYPE_LONG => Side::Long,
        POSITION_TYPE_SHORT => Side::Short,
        other => {
            warn!("Ignoring position {} with unknown type {}", p.contract_id, other);
            return None;
        }
    };
    let quantity = p.size.unsigned_abs();
    if quantity == 0 {
        return None;
    }
    Some(PositionEntry::new(p.contract_id.clone(), quantity, side))
}

/// [`AccountSession`] over a [`PxClient`]. The configured account may be a
/// numeric id or an exact account name; names are resolved at login.
pub struct PxSession {
    client: PxClient,
    account: String,
    account_id: RwLock<Option<i32>>,
}

impl PxSession {
    pub fn new(api_base: String, username: String, api_key: String, account: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = PxClient::new(api_base, AuthMode::ApiKey { username, api_key }, timeout)?;
        Ok(Self { client, account, account_id: RwLock::new(None) })
    }

    async fn resolve_account_id(&self) -> anyhow::Result<i32> {
        if let Ok(n) = self.account.parse::<i32>() {
            return Ok(n);
        }
        let res = self.client.search_accounts(Some(true)).await?;
        res.accounts
            .into_iter()
            .find(|a| a.name == self.account)
            .map(|a| a.id)
            .ok_or_else(|| anyhow::anyhow!("Account not found by name: {}", self.account))
    }

    async fn account_id(&self) -> Result<i32, SessionFailure> {
        self.account_id
            .read()
            .await
            .ok_or_else(|| SessionFailure::new("invalid token: account not resolved, login required"))
    }
}

#[async_trait]
impl AccountSession for PxSession {
    async fn login(&self) -> Result<(), SessionFailure> {
        self.client.login().await?;
        let id = self.resolve_account_id().await?;
        *self.account_id.write().await = Some(id);
        Ok(())
    }

    async fn close(&self) {
        self.client.logout().await;
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionEntry>, SessionFailure> {
        let account_id = self.account_id().await?;
        let res = self.client.search_open_positions(account_id).await?;
        Ok(res.positions.iter().filter_map(entry_from_record).collect())
    }

    async fn submit_order(&self, order: &CorrectiveOrder) -> Result<OrderAck, SessionFailure> {
        let account_id = self.account_id().await?;
        let size = i32::try_from(order.quantity)
            .map_err(|_| SessionFailure::new(format!("order size {} out of range", order.quantity)))?;
        let req = PlaceOrderReq {
            account_id,
            contract_id: &order.instrument,
            r#type: ORDER_TYPE_MARKET,
            side: match order.side { Side::Long => ORDER_SIDE_BID, Side::Short => ORDER_SIDE_ASK },
            size,
            custom_tag: Some(unique_sync_tag(&order.instrument, account_id)),
        };
        let res = self.client.place_order(&req).await?;
        Ok(OrderAck { order_id: res.order_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(contract: &str, r#type: i32, size: i32) -> PositionRecord {
        PositionRecord { contract_id: contract.into(), r#type, size }
    }

    #[test]
    fn test_records_map_to_entries() {
        assert_eq!(
            entry_from_record(&record("ES", POSITION_TYPE_LONG, 2)),
            Some(PositionEntry::new("ES", 2, Side::Long))
        );
        assert_eq!(
            entry_from_record(&record("NQ", POSITION_TYPE_SHORT, 1)),
            Some(PositionEntry::new("NQ", 1, Side::Short))
        );
        assert_eq!(entry_from_record(&record("CL", 0, 3)), None);
        assert_eq!(entry_from_record(&record("CL", POSITION_TYPE_LONG, 0)), None);
    }

    #[test]
    fn test_sync_tags_are_unique() {
        let a = unique_sync_tag("ES", 1);
        let b = unique_sync_tag("ES", 1);
        assert_ne!(a, b);
        assert!(a.starts_with("MB:SYNC:ES:1:"));
    }

    #[test]
    fn test_failure_keeps_error_chain() {
        let err = anyhow::anyhow!("401 Unauthorized").context("POST /api/Order/place");
        let failure = SessionFailure::from(err);
        assert_eq!(failure.message, "POST /api/Order/place: 401 Unauthorized");
    }

    #[tokio::test]
    async fn test_calls_before_login_need_reauth() {
        let session = PxSession::new(
            "http://127.0.0.1:9".into(),
            "u".into(),
            "k".into(),
            "1234".into(),
            Duration::from_millis(100),
        )
        .unwrap();
        let failure = session.fetch_positions().await.unwrap_err();
        assert_eq!(
            crate::health::classify(&failure.message),
            crate::health::SessionHealth::ReauthRequired
        );
    }
}
