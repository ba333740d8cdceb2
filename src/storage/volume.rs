//! Volume management
//!
//! Volumes are host directories under the state directory:
//! `<base>/<name>/_data` holds the data and `<base>/<name>/volume.json` the
//! metadata. The manager reloads existing volumes on startup, so ensuring a
//! volume that a previous run created is a no-op.

use crate::error::{ComposeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const METADATA_FILE: &str = "volume.json";
const DATA_DIR: &str = "_data";

/// Volume driver types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDriver {
    /// Local filesystem driver
    #[default]
    Local,
    /// Custom driver
    Custom(String),
}

impl std::fmt::Display for VolumeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeDriver::Local => write!(f, "local"),
            VolumeDriver::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for VolumeDriver {
    fn from(name: &str) -> Self {
        match name {
            "local" => VolumeDriver::Local,
            other => VolumeDriver::Custom(other.to_string()),
        }
    }
}

/// Volume scope. Volumes belong to the project and its host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeScope {
    #[default]
    Local,
}

/// Volume configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Volume driver
    pub driver: VolumeDriver,
    /// Mount point on host
    pub mountpoint: PathBuf,
    /// Volume scope
    pub scope: VolumeScope,
    /// Driver options
    pub options: HashMap<String, String>,
    /// Volume labels
    pub labels: HashMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Usage data
    #[serde(skip)]
    pub usage_data: Option<VolumeUsageData>,
}

impl Volume {
    /// Create a new volume
    pub fn new(name: &str, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            driver: VolumeDriver::Local,
            mountpoint: base_path.join(name).join(DATA_DIR),
            scope: VolumeScope::Local,
            options: HashMap::new(),
            labels: HashMap::new(),
            created_at: Utc::now(),
            usage_data: None,
        }
    }

    /// Set driver
    pub fn driver(mut self, driver: VolumeDriver) -> Self {
        self.driver = driver;
        self
    }

    /// Get size in bytes
    pub fn size(&self) -> Result<u64> {
        if !self.mountpoint.exists() {
            return Ok(0);
        }

        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }

    /// Number of running containers mounting this volume
    pub fn ref_count(&self) -> i64 {
        self.usage_data.as_ref().map_or(0, |u| u.ref_count)
    }
}

/// Volume usage data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeUsageData {
    /// Reference count (number of containers using this volume)
    pub ref_count: i64,
}

/// Volume manager
pub struct VolumeManager {
    /// Volumes indexed by name
    volumes: Arc<RwLock<HashMap<String, Volume>>>,
    /// Base path for volume storage
    base_path: PathBuf,
}

impl VolumeManager {
    /// Create a volume manager, loading volumes already present under `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        let mut volumes = HashMap::new();
        for entry in std::fs::read_dir(&base_path)? {
            let meta_path = entry?.path().join(METADATA_FILE);
            if !meta_path.is_file() {
                continue;
            }
            match std::fs::read(&meta_path)
                .map_err(ComposeError::from)
                .and_then(|raw| serde_json::from_slice::<Volume>(&raw).map_err(ComposeError::from))
            {
                Ok(volume) => {
                    volumes.insert(volume.name.clone(), volume);
                }
                Err(e) => tracing::warn!(
                    "Ignoring unreadable volume metadata {}: {}",
                    meta_path.display(),
                    e
                ),
            }
        }
        tracing::debug!("Loaded {} volume(s) from {}", volumes.len(), base_path.display());

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
        })
    }

    /// Create a new volume; fails if it already exists
    pub fn create(
        &self,
        name: &str,
        driver: Option<VolumeDriver>,
        options: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<Volume> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        if volumes.contains_key(name) {
            return Err(ComposeError::provision(
                name,
                format!("volume {} already exists", name),
            ));
        }

        let volume = self.materialize(name, driver, options, labels)?;
        volumes.insert(name.to_string(), volume.clone());
        Ok(volume)
    }

    /// Make sure a volume exists. Returns the volume and whether it was created now.
    pub fn ensure(
        &self,
        name: &str,
        driver: Option<VolumeDriver>,
        options: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<(Volume, bool)> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(existing) = volumes.get(name) {
            if let Some(requested) = &driver {
                if *requested != existing.driver {
                    tracing::warn!(
                        "Volume {} already exists with driver {}, ignoring requested driver {}",
                        name,
                        existing.driver,
                        requested
                    );
                }
            }
            // The data directory may have been removed behind our back
            std::fs::create_dir_all(&existing.mountpoint)
                .map_err(|e| ComposeError::provision(name, e))?;
            return Ok((existing.clone(), false));
        }

        let volume = self.materialize(name, driver, options, labels)?;
        volumes.insert(name.to_string(), volume.clone());
        Ok((volume, true))
    }

    fn materialize(
        &self,
        name: &str,
        driver: Option<VolumeDriver>,
        options: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> Result<Volume> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ComposeError::provision(name, "invalid volume name"));
        }

        let driver = driver.unwrap_or_default();
        if driver != VolumeDriver::Local {
            return Err(ComposeError::provision(
                name,
                format!("unsupported volume driver {}", driver),
            ));
        }

        let mut volume = Volume::new(name, &self.base_path).driver(driver);
        volume.options = options;
        volume.labels = labels;

        std::fs::create_dir_all(&volume.mountpoint).map_err(|e| ComposeError::provision(name, e))?;
        let meta = serde_json::to_vec_pretty(&volume)?;
        std::fs::write(self.base_path.join(name).join(METADATA_FILE), meta)
            .map_err(|e| ComposeError::provision(name, e))?;

        tracing::info!("Created volume {}", name);
        Ok(volume)
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))
    }

    /// Whether a volume exists
    pub fn exists(&self, name: &str) -> Result<bool> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.contains_key(name))
    }

    /// List all volumes, sorted by name
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        let mut list: Vec<Volume> = volumes.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Remove a volume
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get(name)
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))?;

        if volume.ref_count() > 0 && !force {
            return Err(ComposeError::provision(
                name,
                format!("volume is in use by {} container(s)", volume.ref_count()),
            ));
        }

        let dir = self.base_path.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        volumes.remove(name);
        tracing::info!("Removed volume {}", name);

        Ok(())
    }

    /// Increment reference count for a volume
    pub fn add_reference(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))?;

        match &mut volume.usage_data {
            Some(usage) => usage.ref_count += 1,
            None => volume.usage_data = Some(VolumeUsageData { ref_count: 1 }),
        }

        Ok(())
    }

    /// Decrement reference count for a volume
    pub fn remove_reference(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))?;

        if let Some(ref mut usage) = volume.usage_data {
            usage.ref_count = (usage.ref_count - 1).max(0);
        }

        Ok(())
    }
}
