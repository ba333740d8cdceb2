//! Docker Compose compatible orchestration
//!
//! A descriptor is loaded into an immutable [`Project`], ordered by the
//! [`DependencyResolver`], and run by the [`ComposeOrchestrator`], which
//! provisions shared resources, launches services and supervises them.

pub mod config;
pub mod env;
pub mod launcher;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod provisioner;
pub mod resolver;
pub mod supervisor;

pub use config::{ComposeConfig, ServiceConfig};
pub use model::{Project, RestartPolicy, Service, VolumeSpec};
pub use orchestrator::{ComposeOrchestrator, SuperviseOutcome, UpOptions, UpReport};
pub use parser::{ComposeParser, ProjectOptions};
pub use resolver::{DependencyGraph, DependencyResolver};
pub use supervisor::{ServiceState, ServiceStatus};
