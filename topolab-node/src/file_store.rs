//! Lab file store.
//!
//! The lab (hypervisors, definitions, topologies and their operational
//! state) lives in one YAML file. Updates are serialized in-process and
//! written through a temporary file in the same directory, so readers
//! never see a partial file.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use topolab_orchestrator::{ConfigStore, Lab, OrchestratorError, Result, TopologyChange};

pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

fn store_error(path: &Path, e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Store(format!("{}: {}", path.display(), e))
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Lab> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| store_error(&self.path, e))?;
        Lab::from_yaml(&text)
    }

    async fn write(&self, lab: &Lab) -> Result<()> {
        let text = lab.to_yaml()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| store_error(&path, e))?;
            file.write_all(text.as_bytes()).map_err(|e| store_error(&path, e))?;
            file.persist(&path).map_err(|e| store_error(&path, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("Store writer failed: {}", e)))?
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn snapshot(&self) -> Result<Lab> {
        self.read().await
    }

    #[instrument(skip(self, change), fields(path = %self.path.display(), topology = %topology))]
    async fn update(&self, topology: &str, change: TopologyChange) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut lab = self.read().await?;
        change.apply(lab.topology_mut(topology)?)?;
        self.write(&lab).await?;
        debug!(change = ?change, "Store updated");
        Ok(())
    }
}
