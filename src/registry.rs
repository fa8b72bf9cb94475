// Registry - The shared id -> instance table with per-instance operation locks

use crate::error::{OrchestratorError, Result};
use crate::instance::{Instance, InstanceStatus};
use crate::notify::{deliver, FleetEvent, NotificationSink};
use crate::state::StateStore;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Registry entry for one instance
pub struct InstanceSlot {
    /// Serializes start/stop/restart for this instance
    op_lock: Mutex<()>,
    record: RwLock<Instance>,
    /// Set once an operator stopped the instance; automatic restarts skip it
    retired: AtomicBool,
}

impl InstanceSlot {
    fn new(instance: Instance) -> Self {
        Self {
            op_lock: Mutex::new(()),
            record: RwLock::new(instance),
            retired: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Instance {
        self.record.read().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        self.record.read().status
    }

    pub fn generation(&self) -> u64 {
        self.record.read().generation
    }

    /// Acquire the operation lock, giving up after `wait`
    pub async fn lock_ops(&self, wait: Duration) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(wait, self.op_lock.lock())
            .await
            .map_err(|_| OrchestratorError::LockTimeout {
                instance_id: self.record.read().id.clone(),
                waited: wait,
            })
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn set_retired(&self, retired: bool) {
        self.retired.store(retired, Ordering::SeqCst);
    }
}

/// Table of every known instance
///
/// Owned by the orchestrator and shared with the supervisor, health monitor
/// and recovery controller. Status changes go through [`transition`], which
/// persists the new snapshot and publishes a notification.
///
/// [`transition`]: InstanceRegistry::transition
pub struct InstanceRegistry {
    slots: RwLock<HashMap<String, Arc<InstanceSlot>>>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn NotificationSink>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn StateStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
            sink,
        }
    }

    pub fn sink(&self) -> &dyn NotificationSink {
        self.sink.as_ref()
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Insert a new instance, failing if the id is taken
    pub fn reserve(&self, instance: Instance) -> Result<Arc<InstanceSlot>> {
        let slot = {
            let mut slots = self.slots.write();
            if slots.contains_key(&instance.id) {
                return Err(OrchestratorError::AlreadyExists(instance.id));
            }
            let slot = Arc::new(InstanceSlot::new(instance.clone()));
            slots.insert(instance.id.clone(), Arc::clone(&slot));
            slot
        };

        self.persist(&instance);
        Ok(slot)
    }

    pub fn slot(&self, id: &str) -> Option<Arc<InstanceSlot>> {
        self.slots.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().contains_key(id)
    }

    pub fn snapshot(&self, id: &str) -> Option<Instance> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    /// Point-in-time copies of every instance, ordered by id
    pub fn list(&self) -> Vec<Instance> {
        let slots: Vec<Arc<InstanceSlot>> = self.slots.read().values().cloned().collect();
        let mut instances: Vec<Instance> = slots.iter().map(|s| s.snapshot()).collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Drop an instance from the registry and the state store
    pub fn remove(&self, id: &str) -> Option<Instance> {
        let slot = self.slots.write().remove(id)?;
        if let Err(e) = self.store.delete(id) {
            warn!(instance_id = %id, "Failed to delete persisted state: {}", e);
        }
        Some(slot.snapshot())
    }

    /// Mutate bookkeeping fields without changing the status
    pub fn update<F>(&self, id: &str, f: F) -> Option<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let slot = self.slot(id)?;
        let mut record = slot.record.write();
        f(&mut *record);
        Some(record.clone())
    }

    /// Start a new process generation and return its number
    pub fn next_generation(&self, id: &str) -> Option<u64> {
        self.update(id, |instance| instance.generation += 1)
            .map(|instance| instance.generation)
    }

    /// Move an instance to a new status
    ///
    /// When `generation` is given the write only happens if the instance is
    /// still on that process generation, so a late event from a retired
    /// process cannot overwrite the status of its successor. Returns whether
    /// the write happened.
    pub fn transition<F>(
        &self,
        id: &str,
        generation: Option<u64>,
        to: InstanceStatus,
        f: F,
    ) -> bool
    where
        F: FnOnce(&mut Instance),
    {
        self.transition_if(
            id,
            |record| generation.map_or(true, |g| record.generation == g),
            to,
            f,
        )
    }

    /// Move an instance to a new status if `precondition` holds
    ///
    /// The check, the write and the save to the state store happen under the
    /// same lock.
    pub fn transition_if<P, F>(&self, id: &str, precondition: P, to: InstanceStatus, f: F) -> bool
    where
        P: FnOnce(&Instance) -> bool,
        F: FnOnce(&mut Instance),
    {
        let Some(slot) = self.slot(id) else {
            return false;
        };

        // Saved before the lock drops so the store sees writes in order
        let (from, at) = {
            let mut record = slot.record.write();
            if !precondition(&record) {
                return false;
            }
            let from = record.status;
            f(&mut *record);
            record.status = to;
            record.last_activity_at = Utc::now();
            self.persist(&record);
            (from, record.last_activity_at)
        };

        if from != to {
            deliver(
                self.sink.as_ref(),
                FleetEvent::StatusChanged {
                    instance_id: id.to_string(),
                    from,
                    to,
                    at,
                },
            );
        }

        true
    }

    /// Save the current snapshot of an instance
    pub fn persist_current(&self, id: &str) {
        if let Some(slot) = self.slot(id) {
            let record = slot.record.read();
            self.persist(&record);
        }
    }

    fn persist(&self, instance: &Instance) {
        if let Err(e) = self.store.save(instance) {
            warn!(instance_id = %instance.id, "Failed to persist instance state: {}", e);
        }
    }
}
