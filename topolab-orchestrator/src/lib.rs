//! # topolab Orchestrator
//!
//! Drives emulated network topologies onto backend hypervisors.
//!
//! A topology is a named graph of devices joined by point-to-point links
//! and multi-access networks. The orchestrator resolves that graph into
//! backend resources (virtual networks, volumes and domains), sequences
//! their lifecycle on every hypervisor the topology spans, writes the
//! derived addresses back to the store, and monitors running devices.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐      ┌──────────────────────┐
//!  verbs ──▶ │   Actions    │ ───▶ │    MonitorRegistry   │
//!            └──────┬───────┘      │ liveness / console / │
//!                   ▼              │ status ─▶ supervisor │
//!            ┌──────────────┐      └──────────┬───────────┘
//!            │ Orchestrator │                 │
//!            └──────┬───────┘                 ▼
//!   Placement · NetworkResolver ·       ConfigStore
//!   ResourceAllocator · BackendCache
//!                   ▼
//!   Network / Volume / Domain controllers ──▶ topolab_virt::Driver
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use topolab_orchestrator::{Action, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(store, connector, renderer, packager, manager);
//! let report = orchestrator.run("lab", Action::Define, None).await?;
//! println!("{}", report);
//! ```

pub mod actions;
pub mod allocator;
pub mod cache;
pub mod day0;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod names;
pub mod orchestrator;
pub mod placement;
pub mod plan;
pub mod profiles;
pub mod resolver;
pub mod status;
pub mod store;
pub mod template;

#[cfg(test)]
mod testing;

pub use actions::{Actions, LinkVerb, MonitorControl, TopologyVerb};
pub use allocator::ResourceAllocator;
pub use cache::{BackendCache, BackendKind, Connection, Connector, MockConnector};
pub use error::{OrchestratorError, Result};
pub use lifecycle::{Action, ActionReport, Controllers};
pub use manager::{DeviceManager, MockDeviceManager};
pub use model::*;
pub use monitor::{MonitorRegistry, MonitorSettings, MonitorStatus, PingProber, Prober, ScriptedProber, TcpConsole};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use placement::Placement;
pub use profiles::{DeviceProfile, ProfileRegistry};
pub use resolver::NetworkResolver;
pub use status::{StatusChecker, StatusReport};
pub use store::{ConfigStore, MemoryStore, TopologyChange};
pub use template::{DirectoryRenderer, MemoryRenderer, TemplateRenderer};
