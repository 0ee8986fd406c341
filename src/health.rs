//! Classification of broker failure messages.
//!
//! Every failure text coming back from a session goes through [`classify`].
//! Nothing else in the crate inspects message contents.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    /// Session credential expired or invalid; log in again on the next tick.
    ReauthRequired,
    /// Rate limiting, service delay or insufficient balance. Logged only.
    TransientIgnore,
    Unknown,
}

/// Substrings are matched against the lowercased failure text, first hit wins.
const FAILURE_TABLE: &[(&str, SessionHealth)] = &[
    // broker session messages
    ("기간이 만료된 token", SessionHealth::ReauthRequired),
    ("유효하지 않은 token", SessionHealth::ReauthRequired),
    ("expired token", SessionHealth::ReauthRequired),
    ("token expired", SessionHealth::ReauthRequired),
    ("invalid token", SessionHealth::ReauthRequired),
    ("401 unauthorized", SessionHealth::ReauthRequired),
    // throttling
    ("서비스가 지연", SessionHealth::TransientIgnore),
    ("429 too many requests", SessionHealth::TransientIgnore),
    ("rate limit", SessionHealth::TransientIgnore),
    // balance
    ("주문가능금액을 초과", SessionHealth::TransientIgnore),
    ("insufficient balance", SessionHealth::TransientIgnore),
    ("insufficient funds", SessionHealth::TransientIgnore),
];

pub fn classify(failure_text: &str) -> SessionHealth {
    let text = failure_text.to_lowercase();
    FAILURE_TABLE
        .iter()
        .find(|(needle, _)| text.contains(needle))
        .map(|(_, health)| *health)
        .unwrap_or(SessionHealth::Unknown)
}
