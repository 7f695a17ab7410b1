//! warden - minimal service supervisor
//!
//! A Rust implementation that:
//! - Loads compose-style unit files into a service registry
//! - Supervises one process per unit with docker-style restart policies
//! - Watches for newer unit definitions and cycles the affected units
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                     warden                      │
//! ├─────────────────────────────────────────────────┤
//! │  Unit Parser  │   Supervisor    │ Update Watcher│
//! ├─────────────────────────────────────────────────┤
//! │   Registry    │  Runtime (process + cgroups)    │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod cgroups;
pub mod config;
pub mod manager;
pub mod registry;
pub mod units;
pub mod watcher;

// Used by integration tests
pub mod test_support;

pub use config::PollConfig;
pub use manager::{CommandRuntime, ContainerRuntime, ManagerError, Supervisor, UnitState};
pub use registry::{Registry, RegistryError, SharedRegistry};
pub use units::{RestartPolicy, ServiceSpec};
pub use watcher::{UnitFileSource, Update, UpdateSource, UpdateWatcher};
