//! Line-based operator commands, read from stdin by the binary.
//!
//! ```text
//! pause | resume
//! scale <mirror1> <mirror2>
//! flatten <mirror1|mirror2>
//! close <mirror1|mirror2> <instrument>
//! resync
//! relogin <primary|mirror1|mirror2>
//! status | params
//! ```

use crate::emergency::EmergencyTask;
use crate::engine::Engine;
use crate::params::ReplicationParams;
use crate::positions::AccountRole;
use anyhow::Result;
use std::io::BufRead;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Scale(ReplicationParams),
    Emergency(EmergencyTask),
    Status,
    Params,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not an account (primary, mirror1, mirror2)")]
    BadRole(String),
    #[error("'{0}' is not a mirror account")]
    NotMirror(String),
    #[error("'{0}' is not a valid scale")]
    BadScale(String),
}

fn parse_role(raw: &str) -> Result<AccountRole, ControlError> {
    match raw.to_ascii_lowercase().as_str() {
        "primary" => Ok(AccountRole::Primary),
        "mirror1" => Ok(AccountRole::Mirror1),
        "mirror2" => Ok(AccountRole::Mirror2),
        _ => Err(ControlError::BadRole(raw.to_string())),
    }
}

fn parse_mirror(raw: &str) -> Result<AccountRole, ControlError> {
    match parse_role(raw)? {
        AccountRole::Primary => Err(ControlError::NotMirror(raw.to_string())),
        role => Ok(role),
    }
}

fn parse_scale(raw: &str) -> Result<u32, ControlError> {
    raw.parse().map_err(|_| ControlError::BadScale(raw.to_string()))
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = words.split_first() else {
            return Err(ControlError::Unknown(String::new()));
        };
        let cmd = match (verb.to_ascii_lowercase().as_str(), args) {
            ("pause", []) => ControlCommand::Pause,
            ("resume", []) => ControlCommand::Resume,
            ("status", []) => ControlCommand::Status,
            ("params", []) => ControlCommand::Params,
            ("resync", []) => ControlCommand::Emergency(EmergencyTask::Resync),
            ("scale", [m1, m2]) => ControlCommand::Scale(ReplicationParams {
                mirror_1_scale: parse_scale(m1)?,
                mirror_2_scale: parse_scale(m2)?,
            }),
            ("scale", _) => return Err(ControlError::Usage("scale <mirror1> <mirror2>")),
            ("flatten", [role]) => {
                ControlCommand::Emergency(EmergencyTask::FlattenMirror { role: parse_mirror(role)? })
            }
            ("flatten", _) => return Err(ControlError::Usage("flatten <mirror1|mirror2>")),
            ("close", [role, instrument]) => ControlCommand::Emergency(EmergencyTask::ClosePosition {
                role: parse_mirror(role)?,
                instrument: instrument.to_string(),
            }),
            ("close", _) => return Err(ControlError::Usage("close <mirror1|mirror2> <instrument>")),
            ("relogin", [role]) => ControlCommand::Emergency(EmergencyTask::Relogin { role: parse_role(role)? }),
            ("relogin", _) => return Err(ControlError::Usage("relogin <primary|mirror1|mirror2>")),
            _ => return Err(ControlError::Unknown(line.trim().to_string())),
        };
        Ok(cmd)
    }
}

/// Apply one command to the engine. Returns a one-line reply.
pub async fn execute(engine: &Engine, cmd: ControlCommand) -> Result<String> {
    let reply = match cmd {
        ControlCommand::Pause => {
            engine.set_pause(true)?;
            "replication paused".to_string()
        }
        ControlCommand::Resume => {
            engine.set_pause(false)?;
            "replication resumed".to_string()
        }
        ControlCommand::Scale(params) => {
            engine.set_params(params).await?;
            format!("params set: {:?}", params)
        }
        ControlCommand::Emergency(task) => {
            let reply = format!("queued {task}");
            engine.enqueue_emergency(task);
            reply
        }
        ControlCommand::Status => serde_json::to_string(&engine.status().await)?,
        ControlCommand::Params => format!("{:?}", engine.params().await),
    };
    Ok(reply)
}

/// Reads stdin on a plain thread so a pending read never holds up runtime
/// shutdown. The channel closes at EOF.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Executes commands as they arrive until shutdown or the input closes.
/// Bad commands are logged and skipped.
pub async fn run_control_loop(engine: Arc<Engine>, mut input: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) {
    info!("Control: accepting commands");
    loop {
        let line = tokio::select! {
            line = input.recv() => line,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            info!("Control: input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cmd = match ControlCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Control: {}", e);
                continue;
            }
        };
        match execute(&engine, cmd).await {
            Ok(reply) => info!("Control: {}", reply),
            Err(e) => warn!("Control: '{}' failed: {:#}", line, e),
        }
    }
}
