//! # topolab Node
//!
//! Drives emulated network topologies onto the hypervisors listed in the
//! lab file: lifecycle verbs for topologies, devices and links, and the
//! per-topology liveness monitor.
//!
//! ## Usage
//! ```bash
//! topolab-node --config /etc/topolab/node.yaml action lab define
//! topolab-node action lab start --monitor
//! topolab-node link lab r1 r2 set-delay --delay 25
//! topolab-node events lab
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use topolab_common::LogFormat;
use topolab_orchestrator::{
    ActionReport, Actions, ConfigStore, Connector, DeviceManager, DirectoryRenderer, LinkId, LinkVerb,
    MockConnector, MockDeviceManager, MonitorRegistry, Orchestrator, PingProber, Prober, ScriptedProber,
    StatusChecker, TcpConsole,
};
use topolab_virt::{Day0Packager, MockPackager, SystemPackager};

mod cli;
mod config;
mod connector;
mod file_store;
mod manager;

use cli::{Args, Command, LinkVerbArg};
use config::{Config, DEFAULT_CONFIG_PATH};
use connector::NodeConnector;
use file_store::FileStore;
use manager::HookManager;

/// Everything a command needs, wired from the configuration.
struct Node {
    store: Arc<dyn ConfigStore>,
    orchestrator: Arc<Orchestrator>,
    monitor: Arc<MonitorRegistry>,
    prober: Arc<dyn Prober>,
}

impl Node {
    fn build(config: &Config) -> Self {
        let store: Arc<dyn ConfigStore> = Arc::new(FileStore::new(&config.store.path));

        let (connector, packager, manager, prober): (
            Arc<dyn Connector>,
            Arc<dyn Day0Packager>,
            Arc<dyn DeviceManager>,
            Arc<dyn Prober>,
        ) = if config.dev {
            warn!("Development mode: mock backends, no management plane, probes always succeed");
            (
                Arc::new(MockConnector::new()),
                Arc::new(MockPackager),
                Arc::new(MockDeviceManager::new()),
                Arc::new(ScriptedProber::new()),
            )
        } else {
            (
                Arc::new(NodeConnector::new(
                    &config.backends.simulation_dir,
                    config.backends.simulation_command.clone(),
                )),
                Arc::new(SystemPackager::new()),
                Arc::new(HookManager::new(config.manager.hook.clone())),
                Arc::new(PingProber::from_settings(&config.monitor)),
            )
        };

        let orchestrator = Arc::new(
            Orchestrator::new(
                store.clone(),
                connector,
                Arc::new(DirectoryRenderer::new(&config.templates.dir)),
                packager,
                manager,
            )
            .with_settings(config.orchestrator.clone()),
        );

        let mut monitor = MonitorRegistry::new(orchestrator.clone(), prober.clone(), config.monitor.clone());
        if config.backends.console && !config.dev {
            monitor = monitor.with_console(Arc::new(TcpConsole));
        }

        Self { store, orchestrator, monitor: Arc::new(monitor), prober }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default()
            }
        },
    };
    Ok(config.with_cli_overrides(args))
}

fn finish(report: ActionReport) -> Result<()> {
    print!("{}", report);
    if report.is_success() {
        Ok(())
    } else {
        Err(anyhow!("{} resource(s) failed", report.failures.len()))
    }
}

async fn wait_for_interrupt() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping monitors");
    Ok(())
}

async fn run(node: Node, command: Command) -> Result<()> {
    match command {
        Command::Action { topology, verb, device, force, monitor } => {
            let mut actions = Actions::new(node.orchestrator.clone());
            if monitor {
                actions = actions.with_monitor(node.monitor.clone());
            }
            let report = actions.topology(&topology, verb.into(), device.as_deref(), force).await?;
            if monitor && node.monitor.status(&topology).await.running {
                wait_for_interrupt().await?;
                node.monitor.stop_all().await?;
            }
            finish(report)
        }

        Command::Link { topology, a_device, z_device, verb, delay } => {
            let verb = match verb {
                LinkVerbArg::Start => LinkVerb::Start,
                LinkVerbArg::Stop => LinkVerb::Stop,
                LinkVerbArg::SetDelay => {
                    LinkVerb::SetDelay(delay.ok_or_else(|| anyhow!("set-delay needs --delay"))?)
                }
            };
            let report = Actions::new(node.orchestrator.clone())
                .link(&topology, &LinkId::new(a_device, z_device), verb)
                .await?;
            finish(report)
        }

        Command::Monitor { topology, once } => {
            if once {
                let report = node.monitor.once(&topology).await?;
                println!("{}: {}", topology, report.status);
                return Ok(());
            }
            let id = node.monitor.start(&topology).await?;
            println!("{}: {}", topology, node.monitor.status(&topology).await);
            info!(worker = %id, "Monitoring until interrupted");
            wait_for_interrupt().await?;
            if let Some(written) = node.monitor.stop(&topology).await? {
                info!(written, "Monitor finished");
            }
            Ok(())
        }

        Command::Check { topology } => {
            let checker = StatusChecker::new(node.orchestrator.manager().clone(), node.prober.clone());
            let lab = node.store.snapshot().await?;
            let report = checker.check(&lab, &topology, false, Utc::now()).await?;
            for change in report.changes.iter().cloned() {
                node.store.update(&topology, change).await?;
            }
            for device in &report.reboots {
                println!("{}: needs reboot", device);
            }
            println!("{}: {}", topology, report.status);
            Ok(())
        }

        Command::Events { topology, clear } => {
            if clear {
                node.monitor.clear(&topology).await?;
                return Ok(());
            }
            let lab = node.store.snapshot().await?;
            for event in &lab.topology(&topology)?.state_events {
                println!(
                    "{} {} {} {:?}",
                    event.timestamp.to_rfc3339(),
                    event.device,
                    event.kind.as_str(),
                    event.detail
                );
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.log_json { LogFormat::Json } else { LogFormat::Pretty };
    topolab_common::init(format, &args.log_level)?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(version = env!("CARGO_PKG_VERSION"), host = %host, "Starting topolab node");

    let config = load_config(&args)?;
    info!(
        store = %config.store.path.display(),
        templates = %config.templates.dir.display(),
        dev = config.dev,
        "Node configured"
    );

    let node = Node::build(&config);
    if let Err(e) = run(node, args.command).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
