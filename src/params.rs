use crate::positions::AccountRole;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Operator-tunable replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationParams {
    /// Mirror 1 target = primary net * this.
    pub mirror_1_scale: u32,
    pub mirror_2_scale: u32,
}

impl Default for ReplicationParams {
    fn default() -> Self {
        Self { mirror_1_scale: 1, mirror_2_scale: 1 }
    }
}

impl ReplicationParams {
    /// Scale factor for a mirror; the primary always mirrors itself at 1.
    pub fn scale_for(&self, role: AccountRole) -> u32 {
        match role {
            AccountRole::Primary => 1,
            AccountRole::Mirror1 => self.mirror_1_scale,
            AccountRole::Mirror2 => self.mirror_2_scale,
        }
    }
}

/// JSON file holding the last saved [`ReplicationParams`].
#[derive(Debug, Clone)]
pub struct ParamStore {
    path: PathBuf,
}

impl ParamStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub async fn load(&self) -> Result<Option<ReplicationParams>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let params = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(params))
    }

    /// Write to a sibling temp file, then rename over the target.
    pub async fn save(&self, params: &ReplicationParams) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        let body = serde_json::to_vec_pretty(params)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        debug!("Params saved to {}", self.path.display());
        Ok(())
    }
}
