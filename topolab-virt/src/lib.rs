//! # topolab Virt
//!
//! Backend driver layer for emulated network topologies.
//!
//! Every compute endpoint a topology runs on is reached through the
//! [`Driver`] trait, which manages three resource kinds: virtual networks,
//! storage volumes and domains (VMs, containers or simulations).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Driver Trait                 │
//! │  (inventory, state, define_*, apply, ...)    │
//! └──────┬─────────────┬─────────────┬───────────┘
//!        ▼             ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌────────────┐
//! │  Libvirt   │ │ Container  │ │ Simulation  │ │    Mock    │
//! │  (virt)    │ │ (docker)   │ │ (vxr.py)    │ │ (tests)    │
//! └────────────┘ └────────────┘ └─────────────┘ └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use topolab_virt::{Driver, MockDriver, NetworkDefinition, PowerAction, ResourceRef};
//!
//! #[tokio::main]
//! async fn main() {
//!     let driver = MockDriver::new("hv1");
//!     let net = NetworkDefinition::new("net-1-2", "vbr-1-2", "52:54:00:00:01:02".parse().unwrap());
//!
//!     driver.define_network(&net).await.unwrap();
//!     driver.apply(&ResourceRef::network("net-1-2"), PowerAction::Create).await.unwrap();
//! }
//! ```

pub mod container;
pub mod day0;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod simulation;
pub mod traits;
pub mod types;
pub mod xml;

pub use container::ContainerDriver;
pub use day0::{Day0Image, Day0Packager, MockPackager, PasswordScheme, SystemPackager};
pub use error::DriverError;
pub use mock::MockDriver;
pub use simulation::SimulationDriver;
pub use traits::{Driver, DriverCapabilities};
pub use types::*;

// Re-export libvirt driver when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDriver;
