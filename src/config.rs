use crate::double_check::DEFAULT_DOUBLE_CHECK_TICKS;
use crate::scheduler::TickPolicy;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AccountConfig {
    pub api_base: String,
    pub username: String,
    pub api_key: String,
    // Account identifier: numeric ID or exact name
    pub account: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub primary: AccountConfig,
    pub mirror1: AccountConfig,
    pub mirror2: Option<AccountConfig>,

    pub tick_policy: TickPolicy,
    pub emergency_period: Duration,
    pub double_check_ticks: u32,
    pub reconcile_on_startup: bool,
    pub request_timeout: Duration,

    pub params_path: PathBuf,
    pub alert_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let shared_base = var("MB_API_BASE");

        let account = |prefix: &str| -> Result<Option<AccountConfig>> {
            let username = var(&format!("MB_{prefix}_USERNAME"));
            let api_key = var(&format!("MB_{prefix}_API_KEY"));
            let account = var(&format!("MB_{prefix}_ACCOUNT"));
            if username.is_none() && api_key.is_none() && account.is_none() {
                return Ok(None);
            }
            let api_base = var(&format!("MB_{prefix}_API_BASE"))
                .or_else(|| shared_base.clone())
                .ok_or_else(|| anyhow!("Provide MB_{prefix}_API_BASE or MB_API_BASE"))?;
            Ok(Some(AccountConfig {
                api_base,
                username: username.ok_or_else(|| anyhow!("MB_{prefix}_USERNAME is required"))?,
                api_key: api_key.ok_or_else(|| anyhow!("MB_{prefix}_API_KEY is required"))?,
                account: account.ok_or_else(|| anyhow!("MB_{prefix}_ACCOUNT is required"))?,
            }))
        };

        let primary = account("PRIMARY")?.ok_or_else(|| anyhow!("Primary account not configured (MB_PRIMARY_*)"))?;
        let mirror1 = account("MIRROR1")?.ok_or_else(|| anyhow!("At least one mirror required (MB_MIRROR1_*)"))?;
        let mirror2 = account("MIRROR2")?;

        let tick_ms: u64 = parse_or(var("MB_TICK_MS"), 1000, "MB_TICK_MS")?;
        let tick_policy = match var("MB_TICK_POLICY").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("fixed") => TickPolicy::Fixed(Duration::from_millis(tick_ms.max(1))),
            Some("minute") => TickPolicy::MinuteAligned,
            Some(other) => return Err(anyhow!("MB_TICK_POLICY must be 'fixed' or 'minute', got '{}'", other)),
        };

        let emergency_ms: u64 = parse_or(var("MB_EMERGENCY_MS"), 1000, "MB_EMERGENCY_MS")?;
        let double_check_ticks: u32 = parse_or(var("MB_DOUBLE_CHECK_TICKS"), DEFAULT_DOUBLE_CHECK_TICKS, "MB_DOUBLE_CHECK_TICKS")?;
        if double_check_ticks == 0 {
            return Err(anyhow!("MB_DOUBLE_CHECK_TICKS must be at least 1"));
        }
        let reconcile_on_startup: bool = parse_or(var("MB_RECONCILE_ON_STARTUP"), true, "MB_RECONCILE_ON_STARTUP")?;
        let timeout_ms: u64 = parse_or(var("MB_REQUEST_TIMEOUT_MS"), 10_000, "MB_REQUEST_TIMEOUT_MS")?;

        Ok(Self {
            primary,
            mirror1,
            mirror2,
            tick_policy,
            emergency_period: Duration::from_millis(emergency_ms.max(1)),
            double_check_ticks,
            reconcile_on_startup,
            request_timeout: Duration::from_millis(timeout_ms),
            params_path: var("MB_PARAMS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("params/replication_params.json")),
            alert_webhook_url: var("MB_ALERT_WEBHOOK_URL"),
        })
    }
}

fn parse_or<T>(raw: Option<String>, default: T, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(v) => v.parse::<T>().with_context(|| format!("invalid {key}: '{v}'")),
        None => Ok(default),
    }
}
