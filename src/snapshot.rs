//! Engine checkpointing as a JSON object-of-objects on disk.
//!
//! The persisted state is the full registry map plus the retained submission
//! histories. A load failure of any kind means starting empty with a
//! warning; a corrupt checkpoint must never keep the process down.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::ledger::LedgerSnapshot;
use crate::registry::RegistrySnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub events: RegistrySnapshot,
    #[serde(default)]
    pub submissions: LedgerSnapshot,
}

pub fn save_state(path: &Path, state: &EngineState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state).context("serialize engine state")?;

    // Write-then-rename so a crash mid-write can't truncate the previous
    // checkpoint.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;

    info!(path = %path.display(), events = state.events.len(), "checkpoint saved");
    Ok(())
}

pub fn load_state(path: &Path) -> Option<EngineState> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "failed to read checkpoint: {}", e);
            return None;
        }
    };

    match serde_json::from_slice::<EngineState>(&raw) {
        Ok(state) => {
            info!(path = %path.display(), events = state.events.len(), "checkpoint restored");
            Some(state)
        }
        Err(e) => {
            warn!(path = %path.display(), "corrupt checkpoint ignored: {}", e);
            None
        }
    }
}
