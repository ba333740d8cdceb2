//! Storage management module
//!
//! Named volumes shared between the services of a project.

pub mod volume;

pub use volume::{Volume, VolumeDriver, VolumeManager, VolumeScope};
