//! Restart-safe key/value settings store.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fs2::FileExt;

use crate::error::{DeployError, DeployResult};
use crate::request::DeploymentId;

/// Keys under which the orchestrator persists its state.
pub mod keys {
    pub const CURRENT_PROFILE: &str = "CurrentProfileName";
    pub const CURRENT_REGION: &str = "CurrentRegion";
    pub const CURRENT_BUCKET: &str = "CurrentBucketName";
    pub const CURRENT_DEPLOYMENT: &str = "CurrentDeploymentId";

    pub const SCENARIO: &str = "DeploymentScenario";
    pub const GAME_NAME: &str = "DeploymentGameName";
    pub const BUILD_FOLDER: &str = "DeploymentBuildFolderPath";
    pub const BUILD_FILE: &str = "DeploymentBuildFilePath";
    pub const LAUNCH_PARAMETERS: &str = "LaunchParameters";
    pub const BUILD_OPERATING_SYSTEM: &str = "BuildOperatingSystem";
    pub const FLEET_NAME: &str = "FleetName";
    pub const BUILD_NAME: &str = "BuildName";

    pub const CONTAINER_IMAGE_BUILT: &str = "IsContainerImageBuilt";
    pub const CONTAINER_IMAGE_PUSHED: &str = "IsContainerPushedToECR";
    pub const CONTAINER_IMAGE_URI: &str = "ContainerECRImageUri";
    pub const CONTAINER_GROUP_DEFINITION: &str = "ContainerGroupDefinitionName";
    pub const CONTAINER_FLEET_ID: &str = "ContainerFleetId";
}

/// Opaque string key/value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> DeployResult<Option<String>>;

    fn put(&self, key: &str, value: &str) -> DeployResult<()>;

    fn clear(&self, key: &str) -> DeployResult<()>;

    /// Write `value` when present, clear the key otherwise.
    fn put_optional(&self, key: &str, value: Option<&str>) -> DeployResult<()> {
        match value {
            Some(value) => self.put(key, value),
            None => self.clear(key),
        }
    }
}

/// In-process store, used by tests and by callers that do not need persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> DeployResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| DeployError::Store("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> DeployResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> DeployResult<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> DeployResult<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// JSON file backed store.
///
/// Every operation takes an exclusive lock on the file so that two processes
/// sharing a state file never interleave a read-modify-write.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool),
    ) -> anyhow::Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open state file {}", self.path.display()))?;
        FileExt::lock_exclusive(&file).context("Failed to lock state file")?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .context("Failed to read state file")?;

        let mut entries: BTreeMap<String, String> = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&content).context("Failed to parse state file as JSON")?
        };

        let (out, dirty) = f(&mut entries);

        if dirty {
            let serialized =
                serde_json::to_string_pretty(&entries).context("Failed to serialize state")?;
            file.set_len(0).context("Failed to truncate state file")?;
            file.seek(SeekFrom::Start(0))
                .context("Failed to rewind state file")?;
            file.write_all(serialized.as_bytes())
                .context("Failed to write state file")?;
            file.sync_all().context("Failed to flush state file")?;
        }

        FileExt::unlock(&file).context("Failed to unlock state file")?;
        Ok(out)
    }
}

fn store_error(err: anyhow::Error) -> DeployError {
    DeployError::Store(format!("{err:#}"))
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> DeployResult<Option<String>> {
        self.with_entries(|entries| (entries.get(key).cloned(), false))
            .map_err(store_error)
    }

    fn put(&self, key: &str, value: &str) -> DeployResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
            ((), true)
        })
        .map_err(store_error)
    }

    fn clear(&self, key: &str) -> DeployResult<()> {
        self.with_entries(|entries| {
            let removed = entries.remove(key).is_some();
            ((), removed)
        })
        .map_err(store_error)
    }
}

/// The persisted identity of the deployment currently being watched.
#[derive(Clone)]
pub struct DeploymentIdSlot {
    store: Arc<dyn KeyValueStore>,
}

impl DeploymentIdSlot {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn get(&self) -> DeployResult<Option<DeploymentId>> {
        let Some(raw) = self.store.get(keys::CURRENT_DEPLOYMENT)? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                // An unreadable id cannot be resumed; drop it instead of failing forever.
                tracing::warn!(error = %err, "Discarding unreadable persisted deployment id");
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn has_value(&self) -> DeployResult<bool> {
        Ok(self.get()?.is_some())
    }

    pub fn set(&self, id: &DeploymentId) -> DeployResult<()> {
        let raw = serde_json::to_string(id)
            .map_err(|e| DeployError::Store(format!("Failed to serialize deployment id: {e}")))?;
        self.store.put(keys::CURRENT_DEPLOYMENT, &raw)?;
        tracing::debug!(deployment = %id, "Persisted deployment id");
        Ok(())
    }

    pub fn clear(&self) -> DeployResult<()> {
        self.store.clear(keys::CURRENT_DEPLOYMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn sample_id() -> DeploymentId {
        DeploymentId {
            profile: "p".to_string(),
            region: "us-west-2".to_string(),
            stack_name: "GameLiftPluginForUnity-game".to_string(),
            scenario_name: "Single-Region Fleet".to_string(),
        }
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new("stackpilot-store").unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStore::new(&path);
        store.put(keys::CURRENT_PROFILE, "dev").unwrap();
        store.put(keys::CURRENT_REGION, "eu-west-1").unwrap();
        store.clear(keys::CURRENT_REGION).unwrap();

        let reopened = FileStore::new(&path);
        assert_eq!(
            reopened.get(keys::CURRENT_PROFILE).unwrap(),
            Some("dev".to_string())
        );
        assert_eq!(reopened.get(keys::CURRENT_REGION).unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = TempDir::new("stackpilot-store").unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileStore::new(&path).get("any").unwrap_err();
        assert_eq!(err.code(), "StoreFailed");
    }

    #[test]
    fn test_deployment_id_slot_round_trip() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let slot = DeploymentIdSlot::new(store.clone());
        assert!(!slot.has_value().unwrap());

        slot.set(&sample_id()).unwrap();
        assert_eq!(slot.get().unwrap(), Some(sample_id()));

        slot.clear().unwrap();
        assert_eq!(slot.get().unwrap(), None);
    }

    #[test]
    fn test_unreadable_deployment_id_is_discarded() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.put(keys::CURRENT_DEPLOYMENT, "{broken").unwrap();

        let slot = DeploymentIdSlot::new(store.clone());
        assert_eq!(slot.get().unwrap(), None);
        assert_eq!(store.get(keys::CURRENT_DEPLOYMENT).unwrap(), None);
    }
}
