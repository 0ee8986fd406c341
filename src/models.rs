use serde::{Deserialize, Serialize};

// ===== Common API envelope =====
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(flatten)]
    pub data: T,
}

// ===== Auth =====
#[derive(Clone, Debug)]
pub enum AuthMode {
    ApiKey { username: String, api_key: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginKeyReq<'a> {
    pub user_name: &'a str,
    pub api_key: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginKeyRes {}

// ===== Account search =====
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSearchReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_active_accounts: Option<bool>,
}
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub id: i32,
    pub name: String,
}
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSearchRes {
    #[serde(default)]
    pub accounts: Vec<AccountSummary>,
}

// ===== Position search open =====
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSearchOpenReq { pub account_id: i32 }

pub const POSITION_TYPE_LONG: i32 = 1;
pub const POSITION_TYPE_SHORT: i32 = 2;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub contract_id: String,
    pub r#type: i32, // 1=Long, 2=Short
    pub size: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSearchOpenRes {
    #[serde(default)]
    pub positions: Vec<PositionRecord>,
}

// ===== Orders =====
pub const ORDER_TYPE_MARKET: i32 = 2;
pub const ORDER_SIDE_BID: i32 = 0;
pub const ORDER_SIDE_ASK: i32 = 1;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderReq<'a> {
    pub account_id: i32,
    pub contract_id: &'a str,
    pub r#type: i32, // 2 = Market
    pub side: i32,   // 0 buy, 1 sell
    pub size: i32,
    #[serde(skip_serializing_if = "Option::is_none")] pub custom_tag: Option<String>,
}
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRes { pub order_id: i64 }
