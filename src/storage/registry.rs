//! Disk registry.
//!
//! Builds one [`StorageDriver`] per configured disk and hands them out by
//! name.  There is no process-wide instance; whoever owns the
//! configuration owns the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::driver::StorageDriver;
use crate::config::Config;
use crate::errors::{StorageError, StorageResult};

/// Named storage drivers.
#[derive(Default)]
pub struct DiskRegistry {
    drivers: BTreeMap<String, Arc<StorageDriver>>,
    default_disk: Option<String>,
}

impl DiskRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config` and build a driver for every disk in it.
    pub async fn from_config(config: &Config) -> StorageResult<Self> {
        config.validate()?;

        let mut registry = Self::new();
        for (name, disk) in &config.disks {
            let driver = StorageDriver::new(name.clone(), disk.clone()).await?;
            registry.insert(driver);
        }
        registry.default_disk = config.default_disk.clone();
        Ok(registry)
    }

    /// Register `driver` under its disk name, returning the one it replaces.
    pub fn insert(&mut self, driver: StorageDriver) -> Option<Arc<StorageDriver>> {
        self.drivers
            .insert(driver.disk().to_string(), Arc::new(driver))
    }

    /// Make `name` the default disk.
    pub fn set_default(&mut self, name: &str) -> StorageResult<()> {
        if !self.drivers.contains_key(name) {
            return Err(StorageError::UnknownDisk(name.to_string()));
        }
        self.default_disk = Some(name.to_string());
        Ok(())
    }

    /// The driver for disk `name`.
    pub fn disk(&self, name: &str) -> StorageResult<Arc<StorageDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownDisk(name.to_string()))
    }

    /// The configured default disk, or the only disk when there is just one.
    pub fn default_disk(&self) -> StorageResult<Arc<StorageDriver>> {
        if let Some(name) = &self.default_disk {
            return self.disk(name);
        }
        let mut drivers = self.drivers.values();
        match (drivers.next(), drivers.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(StorageError::InvalidConfig("no disks are configured".to_string())),
            (Some(_), Some(_)) => Err(StorageError::InvalidConfig(
                "several disks are configured but default_disk is not set".to_string(),
            )),
        }
    }

    /// Registered disk names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, DiskConfig};

    #[tokio::test]
    async fn test_from_config_builds_every_disk() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
default_disk: scratch
disks:
  scratch:
    driver: memory
  files:
    driver: local
    base_path: uploads
    local:
      root_dir: {}
"#,
            dir.path().display()
        );
        let config = parse_config(&yaml).unwrap();
        let registry = DiskRegistry::from_config(&config).await.unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["files", "scratch"]);
        assert_eq!(registry.default_disk().unwrap().disk(), "scratch");
        let files = registry.disk("files").unwrap();
        assert_eq!(files.get_path("a.png"), "uploads/a.png");
        assert_eq!(files.backend().kind(), "local");
    }

    #[tokio::test]
    async fn test_unknown_disk() {
        let registry = DiskRegistry::new();
        let err = registry.disk("nope").err().unwrap();
        assert_eq!(err.code(), "UnknownDisk");
        assert!(registry.default_disk().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_single_disk_is_default() {
        let mut registry = DiskRegistry::new();
        registry.insert(StorageDriver::new("only", DiskConfig::memory()).await.unwrap());
        assert_eq!(registry.default_disk().unwrap().disk(), "only");

        registry.insert(StorageDriver::new("second", DiskConfig::memory()).await.unwrap());
        assert!(registry.default_disk().is_err());
        registry.set_default("second").unwrap();
        assert_eq!(registry.default_disk().unwrap().disk(), "second");
        assert!(registry.set_default("third").is_err());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_replaces_same_name() {
        let mut registry = DiskRegistry::new();
        assert!(registry
            .insert(StorageDriver::new("a", DiskConfig::memory()).await.unwrap())
            .is_none());
        assert!(registry
            .insert(StorageDriver::new("a", DiskConfig::memory()).await.unwrap())
            .is_some());
        assert_eq!(registry.len(), 1);
    }
}
