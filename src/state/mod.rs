// State module - Persistent storage for instance records

use crate::error::StateError;
use crate::instance::Instance;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Version of the state file format
const STATE_VERSION: &str = "1.0.0";

/// Durable persistence of instance snapshots, keyed by instance id
pub trait StateStore: Send + Sync {
    fn save(&self, instance: &Instance) -> Result<(), StateError>;

    fn load(&self, instance_id: &str) -> Result<Option<Instance>, StateError>;

    fn delete(&self, instance_id: &str) -> Result<(), StateError>;

    /// Every persisted instance, used for reconciliation at startup
    fn load_all(&self) -> Result<Vec<Instance>, StateError>;
}

/// Complete fleet state as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetState {
    pub version: String,
    pub instances: Vec<Instance>,
    pub last_updated: DateTime<Utc>,
}

impl FleetState {
    /// Create a new empty fleet state
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            instances: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Validate the state structure
    pub fn validate(&self) -> Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::Corruption(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        let mut seen_ids = HashSet::new();
        for instance in &self.instances {
            if !seen_ids.insert(instance.id.as_str()) {
                return Err(StateError::Corruption(format!(
                    "Duplicate instance ID found: {}",
                    instance.id
                )));
            }
        }

        Ok(())
    }

    fn upsert(&mut self, instance: &Instance) {
        match self.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance.clone(),
            None => self.instances.push(instance.clone()),
        }
        self.last_updated = Utc::now();
    }
}

impl Default for FleetState {
    fn default() -> Self {
        Self::new()
    }
}

/// State store backed by a single JSON document
///
/// Every mutation rewrites the whole file through a temporary file and an
/// atomic rename.
pub struct JsonStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the full state document
    pub fn read_state(&self) -> Result<FleetState, StateError> {
        // If file doesn't exist, return empty state
        if !self.path.exists() {
            return Ok(FleetState::new());
        }

        let file = File::open(&self.path)
            .map_err(|e| StateError::Load(format!("Failed to open state file: {}", e)))?;

        let reader = BufReader::new(file);

        let state: FleetState = serde_json::from_reader(reader)
            .map_err(|e| StateError::Load(format!("Failed to parse state file: {}", e)))?;

        state.validate()?;

        Ok(state)
    }

    /// Write the full state document atomically
    pub fn write_state(&self, state: &FleetState) -> Result<(), StateError> {
        state.validate()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StateError::Save(format!("Failed to create state directory: {}", e))
            })?;
        }

        let temp_path = self.path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                StateError::Save(format!("Failed to create temp state file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);

            serde_json::to_writer_pretty(&mut writer, state)
                .map_err(|e| StateError::Save(format!("Failed to serialize state: {}", e)))?;

            writer
                .flush()
                .map_err(|e| StateError::Save(format!("Failed to flush state file: {}", e)))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            StateError::Save(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    /// Remove the state file
    pub fn clear(&self) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| StateError::Save(format!("Failed to clear state file: {}", e)))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn save(&self, instance: &Instance) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        let mut state = self.read_state()?;
        state.upsert(instance);
        self.write_state(&state)
    }

    fn load(&self, instance_id: &str) -> Result<Option<Instance>, StateError> {
        let state = self.read_state()?;
        Ok(state.instances.into_iter().find(|i| i.id == instance_id))
    }

    fn delete(&self, instance_id: &str) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        let mut state = self.read_state()?;
        let before = state.instances.len();
        state.instances.retain(|i| i.id != instance_id);
        if state.instances.len() != before {
            state.last_updated = Utc::now();
            self.write_state(&state)?;
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Instance>, StateError> {
        Ok(self.read_state()?.instances)
    }
}

/// In-memory state store, for tests and runs without a state file
#[derive(Default)]
pub struct MemoryStateStore {
    instances: Mutex<HashMap<String, Instance>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, instance: &Instance) -> Result<(), StateError> {
        self.instances
            .lock()
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn load(&self, instance_id: &str) -> Result<Option<Instance>, StateError> {
        Ok(self.instances.lock().get(instance_id).cloned())
    }

    fn delete(&self, instance_id: &str) -> Result<(), StateError> {
        self.instances.lock().remove(instance_id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Instance>, StateError> {
        let mut all: Vec<Instance> = self.instances.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceEnv, InstanceStatus};
    use tempfile::TempDir;

    fn create_test_instance(id: &str) -> Instance {
        let mut instance = Instance::new(
            id.to_string(),
            PathBuf::from("/tmp"),
            "sleep 30".to_string(),
            None,
            InstanceEnv::new([("MODE", "test")]).unwrap(),
        );
        instance.status = InstanceStatus::Running;
        instance
    }

    #[test]
    fn test_fleet_state_new() {
        let state = FleetState::new();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.instances.is_empty());
    }

    #[test]
    fn test_fleet_state_validate_duplicate_id() {
        let mut state = FleetState::new();
        state.instances.push(create_test_instance("a"));
        state.instances.push(create_test_instance("a"));

        let result = state.validate();
        assert!(matches!(result, Err(StateError::Corruption(_))));
    }

    #[test]
    fn test_fleet_state_validate_wrong_version() {
        let mut state = FleetState::new();
        state.version = "0.0.0".to_string();

        assert!(matches!(state.validate(), Err(StateError::Corruption(_))));
    }

    #[test]
    fn test_json_store_load_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::new(temp_dir.path().join("state.json"));

        assert!(store.load_all().unwrap().is_empty());
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_json_store_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::new(temp_dir.path().join("state.json"));

        store.save(&create_test_instance("a")).unwrap();
        store.save(&create_test_instance("b")).unwrap();

        let loaded = store.load("a").unwrap().unwrap();
        assert_eq!(loaded.id, "a");
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.extra_env.get("MODE"), Some("test"));
        assert_eq!(store.load_all().unwrap().len(), 2);
    }

    #[test]
    fn test_json_store_save_replaces_existing() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::new(temp_dir.path().join("state.json"));

        let mut instance = create_test_instance("a");
        store.save(&instance).unwrap();

        instance.status = InstanceStatus::Stopped;
        store.save(&instance).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, InstanceStatus::Stopped);
    }

    #[test]
    fn test_json_store_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStateStore::new(temp_dir.path().join("state.json"));

        store.save(&create_test_instance("a")).unwrap();
        store.save(&create_test_instance("b")).unwrap();
        store.delete("a").unwrap();
        store.delete("never-existed").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "b");
    }

    #[test]
    fn test_json_store_clear() {
        let temp_dir = TempDir::new().unwrap();
        let state_path = temp_dir.path().join("state.json");
        let store = JsonStateStore::new(&state_path);

        store.save(&create_test_instance("a")).unwrap();
        store.clear().unwrap();

        assert!(!state_path.exists());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let state_path = temp_dir.path().join("subdir").join("state.json");
        let store = JsonStateStore::new(&state_path);

        store.save(&create_test_instance("a")).unwrap();

        assert!(state_path.exists());
        assert!(!state_path.with_extension("tmp").exists());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let state_path = temp_dir.path().join("state.json");
        fs::write(&state_path, "not json").unwrap();

        let store = JsonStateStore::new(&state_path);
        assert!(matches!(store.load_all(), Err(StateError::Load(_))));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        store.save(&create_test_instance("b")).unwrap();
        store.save(&create_test_instance("a")).unwrap();

        let ids: Vec<String> = store.load_all().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        store.delete("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
    }
}
