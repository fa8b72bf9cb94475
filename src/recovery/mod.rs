// Recovery - Turns UNHEALTHY instances into bounded, backed-off restarts

mod backoff;

pub use backoff::ExponentialBackoff;

use crate::config::RecoveryConfig;
use crate::health::{HealthEvent, HealthEventKind, HealthObserver, HealthState};
use crate::instance::InstanceStatus;
use crate::notify::{deliver, FleetEvent};
use crate::registry::InstanceRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryKind {
    Restart,
    Escalate,
    /// The event was absorbed by an action already in progress
    None,
}

impl std::fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryKind::Restart => write!(f, "restart"),
            RecoveryKind::Escalate => write!(f, "escalate"),
            RecoveryKind::None => write!(f, "none"),
        }
    }
}

/// A recovery decision for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub instance_id: String,
    pub kind: RecoveryKind,
    /// Attempt number this action represents (1-based for restarts)
    pub attempt: u32,
    /// Earliest time the action runs
    pub next_eligible_at: DateTime<Utc>,
    /// Process generation that was reported unhealthy
    pub generation: u64,
}

/// The orchestrator side of recovery
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    /// Restart the instance with its stored configuration
    async fn restart(&self, instance_id: &str) -> crate::error::Result<()>;

    /// Stop health checks and kill any leftover process
    ///
    /// Returns false when an operator already stopped or removed the
    /// instance, in which case it must not be marked FAILED.
    async fn retire(&self, instance_id: &str) -> crate::error::Result<bool>;
}

#[derive(Default)]
struct RecoveryState {
    attempts: u32,
    pending: Option<PendingAction>,
    failed: bool,
}

struct PendingAction {
    action: RecoveryAction,
    task: JoinHandle<()>,
}

/// Per-instance restart policy driven by health events
///
/// At most one action is pending per instance. An UNHEALTHY event for a
/// generation at or below the pending action's generation is absorbed; one
/// for a newer generation means the restart went through.
pub struct RecoveryController {
    config: RecoveryConfig,
    backoff: ExponentialBackoff,
    registry: Arc<InstanceRegistry>,
    executor: Weak<dyn RecoveryExecutor>,
    states: Mutex<HashMap<String, RecoveryState>>,
    shut_down: AtomicBool,
}

impl RecoveryController {
    pub fn new(
        config: RecoveryConfig,
        registry: Arc<InstanceRegistry>,
        executor: Weak<dyn RecoveryExecutor>,
    ) -> Self {
        Self {
            backoff: ExponentialBackoff::from_config(&config),
            config,
            registry,
            executor,
            states: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// React to a health event
    ///
    /// Returns the decision for UNHEALTHY transitions and `None` for every
    /// other event.
    pub fn handle(&self, event: &HealthEvent) -> Option<RecoveryAction> {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }

        match event.kind {
            HealthEventKind::Transition {
                to: HealthState::Unhealthy,
                ..
            } => Some(self.on_unhealthy(event)),
            HealthEventKind::Stabilized => {
                self.on_stabilized(event);
                None
            }
            HealthEventKind::Transition { .. } => None,
        }
    }

    fn on_unhealthy(&self, event: &HealthEvent) -> RecoveryAction {
        let id = event.instance_id.as_str();
        let now = Utc::now();
        let mut states = self.states.lock();
        let state = states.entry(id.to_string()).or_default();

        let absorbed = RecoveryAction {
            instance_id: id.to_string(),
            kind: RecoveryKind::None,
            attempt: state.attempts,
            next_eligible_at: now,
            generation: event.generation,
        };

        if state.failed {
            debug!(instance_id = %id, "Instance already failed, ignoring unhealthy event");
            return absorbed;
        }

        if let Some(pending) = &state.pending {
            if event.generation <= pending.action.generation {
                debug!(
                    instance_id = %id,
                    generation = event.generation,
                    "Recovery already in progress, ignoring unhealthy event"
                );
                return absorbed;
            }
            state.pending = None;
        }

        if state.attempts >= self.config.max_attempts {
            state.failed = true;
            let action = RecoveryAction {
                kind: RecoveryKind::Escalate,
                attempt: state.attempts,
                ..absorbed
            };
            warn!(
                instance_id = %id,
                attempts = state.attempts,
                "Recovery attempts exhausted, escalating"
            );
            deliver(
                self.registry.sink(),
                FleetEvent::RecoveryScheduled {
                    action: action.clone(),
                },
            );
            let task = tokio::spawn(escalate(
                self.executor.clone(),
                Arc::clone(&self.registry),
                id.to_string(),
                state.attempts,
            ));
            state.pending = Some(PendingAction {
                action: action.clone(),
                task,
            });
            return action;
        }

        let delay = self.backoff.delay(state.attempts);
        state.attempts += 1;
        let attempts = state.attempts;
        let next_eligible_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let action = RecoveryAction {
            kind: RecoveryKind::Restart,
            attempt: attempts,
            next_eligible_at,
            ..absorbed
        };

        self.registry.update(id, |instance| {
            instance.recovery_attempt_count = attempts;
        });
        self.registry.persist_current(id);

        info!(
            instance_id = %id,
            attempt = attempts,
            max_attempts = self.config.max_attempts,
            "Scheduling restart in {:?}",
            delay
        );
        deliver(
            self.registry.sink(),
            FleetEvent::RecoveryScheduled {
                action: action.clone(),
            },
        );

        let executor = self.executor.clone();
        let instance_id = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(executor) = executor.upgrade() else {
                return;
            };
            if let Err(e) = executor.restart(&instance_id).await {
                warn!(instance_id = %instance_id, "Automatic restart failed: {}", e);
            }
        });
        state.pending = Some(PendingAction {
            action: action.clone(),
            task,
        });

        action
    }

    fn on_stabilized(&self, event: &HealthEvent) {
        let id = event.instance_id.as_str();
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(id) else {
            return;
        };
        if state.failed {
            return;
        }
        if let Some(pending) = &state.pending {
            if pending.action.generation >= event.generation {
                return;
            }
        }

        state.pending = None;
        if state.attempts > 0 {
            info!(instance_id = %id, "Instance stable again, resetting recovery attempts");
            state.attempts = 0;
            self.registry.update(id, |instance| instance.recovery_attempt_count = 0);
            self.registry.persist_current(id);
        }
    }

    /// Drop any pending action for an instance
    pub fn cancel(&self, instance_id: &str) -> bool {
        let mut states = self.states.lock();
        let pending = states
            .get_mut(instance_id)
            .and_then(|state| state.pending.take());
        match pending {
            Some(pending) => {
                pending.task.abort();
                debug!(instance_id = %instance_id, kind = %pending.action.kind, "Cancelled pending recovery");
                true
            }
            None => false,
        }
    }

    /// Clear all recovery history, used by operator restarts
    pub fn reset(&self, instance_id: &str) {
        self.cancel(instance_id);
        self.states.lock().remove(instance_id);
        self.registry
            .update(instance_id, |instance| instance.recovery_attempt_count = 0);
    }

    /// Remove all state for an instance that left the registry
    pub fn forget(&self, instance_id: &str) {
        self.cancel(instance_id);
        self.states.lock().remove(instance_id);
    }

    /// Abort every pending action and ignore later events
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut states = self.states.lock();
        for state in states.values_mut() {
            if let Some(pending) = state.pending.take() {
                pending.task.abort();
            }
        }
    }

    pub fn attempts(&self, instance_id: &str) -> u32 {
        self.states
            .lock()
            .get(instance_id)
            .map_or(0, |state| state.attempts)
    }

    pub fn pending(&self, instance_id: &str) -> Option<RecoveryAction> {
        self.states
            .lock()
            .get(instance_id)
            .and_then(|state| state.pending.as_ref().map(|p| p.action.clone()))
    }

    pub fn is_failed(&self, instance_id: &str) -> bool {
        self.states
            .lock()
            .get(instance_id)
            .map_or(false, |state| state.failed)
    }
}

impl HealthObserver for RecoveryController {
    fn on_health_event(&self, event: &HealthEvent) {
        self.handle(event);
    }
}

async fn escalate(
    executor: Weak<dyn RecoveryExecutor>,
    registry: Arc<InstanceRegistry>,
    instance_id: String,
    attempts: u32,
) {
    let retired = match executor.upgrade() {
        Some(executor) => executor.retire(&instance_id).await.unwrap_or_else(|e| {
            error!(instance_id = %instance_id, "Failed to retire instance: {}", e);
            true
        }),
        None => true,
    };
    let Some(slot) = registry.slot(&instance_id) else {
        return;
    };
    if !retired || slot.is_retired() {
        debug!(instance_id = %instance_id, "Instance was stopped, not marking it failed");
        return;
    }

    // A process running here was started by someone else since
    let failed = registry.transition_if(
        &instance_id,
        |instance| !instance.status.has_process() && !slot.is_retired(),
        InstanceStatus::Failed,
        |instance| {
            instance.process_ref = None;
            instance.last_error = Some(format!("recovery exhausted after {} attempts", attempts));
        },
    );
    if !failed {
        return;
    }

    error!(instance_id = %instance_id, attempts, "Instance failed");
    deliver(
        registry.sink(),
        FleetEvent::InstanceFailed {
            instance_id,
            attempts,
            at: Utc::now(),
        },
    );
}
