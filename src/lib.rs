//! rune-compose - Compose descriptor interpreter for Rune
//!
//! Turns a declarative service graph into a running set of containers:
//!
//! - Descriptor loading with anchors, merge keys, interpolation and validation
//! - Dependency ordering with cycle detection
//! - Idempotent provisioning of shared volumes and networks
//! - Concurrent launching and restart-policy supervision

pub mod compose;
pub mod engine;
pub mod error;
pub mod network;
pub mod settings;
pub mod storage;

pub use error::{ComposeError, Result};
