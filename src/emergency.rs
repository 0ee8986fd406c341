use crate::positions::AccountRole;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

/// Out-of-band corrective commands, executed by the emergency drain loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum EmergencyTask {
    /// Close every open position on one mirror.
    FlattenMirror { role: AccountRole },
    /// Close a single instrument on one mirror.
    ClosePosition { role: AccountRole, instrument: String },
    /// Poll every account and reconcile all mirrors right away.
    Resync,
    /// Drop and re-establish one account's session now.
    Relogin { role: AccountRole },
}

impl fmt::Display for EmergencyTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyTask::FlattenMirror { role } => write!(f, "flatten {role}"),
            EmergencyTask::ClosePosition { role, instrument } => write!(f, "close {instrument} on {role}"),
            EmergencyTask::Resync => write!(f, "resync"),
            EmergencyTask::Relogin { role } => write!(f, "relogin {role}"),
        }
    }
}

/// FIFO of pending emergency tasks.
///
/// The lock is only held to push or to take a batch, never across an await.
#[derive(Debug, Default)]
pub struct EmergencyQueue {
    tasks: Mutex<VecDeque<EmergencyTask>>,
}

impl EmergencyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: EmergencyTask) {
        self.lock().push_back(task);
    }

    /// Everything queued so far, in order. Tasks pushed afterwards belong to
    /// the next batch.
    pub fn take_batch(&self) -> Vec<EmergencyTask> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EmergencyTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
