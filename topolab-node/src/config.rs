//! Configuration management for the node.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use topolab_orchestrator::{MonitorSettings, OrchestratorSettings};

use crate::cli::Args;

/// Default configuration location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/topolab/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub templates: TemplatesConfig,
    pub monitor: MonitorSettings,
    pub orchestrator: OrchestratorSettings,
    pub manager: ManagerConfig,
    pub backends: BackendsConfig,
    /// Mock backends and management plane
    pub dev: bool,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref store) = args.store {
            self.store.path = PathBuf::from(store);
        }

        if args.dev {
            self.dev = true;
        }

        self
    }
}

/// Where the lab file lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("/var/lib/topolab/lab.yaml") }
    }
}

/// Day-0 and device configuration templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub dir: PathBuf,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("/etc/topolab/templates") }
    }
}

/// Management-plane hook.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Executable called as `<hook> <operation> <device> [args]`
    pub hook: Option<PathBuf>,
}

/// Backend driver tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Local directory for simulation output
    pub simulation_dir: PathBuf,
    /// Simulator CLI
    pub simulation_command: String,
    /// Watch device consoles while monitoring
    pub console: bool,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            simulation_dir: PathBuf::from("/var/lib/topolab/vxr"),
            simulation_command: "vxr.py".to_string(),
            console: true,
        }
    }
}
