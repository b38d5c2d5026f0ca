use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;
use crate::bpf::routes::RouteInputs;
use crate::bpf::service::ServiceSpec;

/// Everything the orchestrator wants programmed on this node.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(flatten)]
    pub routes: RouteInputs,
}

impl DesiredState {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Desired state document re-read whenever its modification time changes.
pub struct DesiredStateFile {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl DesiredStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the new document if the file changed since the last call.
    /// A missing file is not an error; the orchestrator may not have
    /// written it yet.
    pub fn poll(&mut self) -> Result<Option<DesiredState>> {
        let modified = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "desired state not written yet");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if self.modified == Some(modified) {
            return Ok(None);
        }
        // a document that fails to parse is reported once, not on every poll
        self.modified = Some(modified);
        let data = std::fs::read(&self.path)?;
        let state = DesiredState::from_slice(&data)?;
        info!(
            path = %self.path.display(),
            services = state.services.len(),
            "loaded desired state"
        );
        Ok(Some(state))
    }
}
