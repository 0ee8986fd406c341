use crate::emergency::EmergencyTask;
use crate::health::SessionHealth;
use crate::positions::{AccountRole, PositionEntry};
use crate::reconcile::CorrectiveOrder;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

/// Notifications emitted by the engine. Delivery is best effort.
#[derive(Debug, Clone)]
pub enum Alert {
    Started { version: &'static str },
    Stopped,
    LoginSucceeded { role: AccountRole },
    LoginFailed { role: AccountRole, message: String },
    PositionsChanged { positions: Vec<PositionEntry> },
    OrderPlaced { role: AccountRole, order: CorrectiveOrder, order_id: i64 },
    OrderFailed { role: AccountRole, order: CorrectiveOrder, message: String, health: SessionHealth },
    PollFailed { role: AccountRole, message: String, health: SessionHealth },
    EmergencyFailed { task: EmergencyTask, message: String },
    Fatal { message: String },
}

impl Alert {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Alert::LoginFailed { .. }
                | Alert::OrderFailed { .. }
                | Alert::PollFailed { .. }
                | Alert::EmergencyFailed { .. }
                | Alert::Fatal { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            Alert::Started { version } => format!("{version} started"),
            Alert::Stopped => "shutdown complete".to_string(),
            Alert::LoginSucceeded { role } => format!("[{role}] login successful"),
            Alert::LoginFailed { role, message } => format!("[{role}] login failed: {message}"),
            Alert::PositionsChanged { positions } => {
                if positions.is_empty() {
                    "primary positions changed: flat".to_string()
                } else {
                    let lines: Vec<String> = positions
                        .iter()
                        .map(|p| format!("{} {} {}", p.instrument, p.side, p.quantity))
                        .collect();
                    format!("primary positions changed: {}", lines.join(", "))
                }
            }
            Alert::OrderPlaced { role, order, order_id } => {
                format!("[{role}] order {order_id} placed: {order}")
            }
            Alert::OrderFailed { role, order, message, health } => {
                format!("[{role}] order {order} failed ({health:?}): {message}")
            }
            Alert::PollFailed { role, message, health } => {
                format!("[{role}] position poll failed ({health:?}): {message}")
            }
            Alert::EmergencyFailed { task, message } => format!("emergency task '{task}' failed: {message}"),
            Alert::Fatal { message } => format!("FATAL: {message}"),
        }
    }
}

/// One-way notification sink. Implementations must not block the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    content: &'a str,
}

/// Logs every alert and, when configured, forwards it to a Discord-style
/// webhook on a background task.
pub struct WebhookAlerts {
    http: Client,
    webhook_url: Option<String>,
}

impl WebhookAlerts {
    pub fn new(webhook_url: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        // discordapp.com hooks are served from discord.com now
        let webhook_url = webhook_url.map(|u| u.replace("discordapp.com", "discord.com"));
        Ok(Self { http, webhook_url })
    }
}

impl AlertSink for WebhookAlerts {
    fn notify(&self, alert: Alert) {
        let text = alert.message();
        match &alert {
            Alert::Fatal { .. } => error!("Alert: {}", text),
            a if a.is_failure() => warn!("Alert: {}", text),
            _ => info!("Alert: {}", text),
        }

        let Some(url) = self.webhook_url.clone() else { return };
        let Ok(rt) = tokio::runtime::Handle::try_current() else { return };
        let http = self.http.clone();
        rt.spawn(async move {
            let body = WebhookBody { content: &text };
            match http.post(&url).json(&body).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!("Alert webhook returned {}", resp.status());
                }
                Ok(_) => {}
                Err(e) => warn!("Alert webhook failed: {}", e),
            }
        });
    }
}
