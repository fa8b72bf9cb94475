// Health module - Periodic per-instance checks and the HEALTHY/DEGRADED/UNHEALTHY machine

mod tracker;

use crate::config::HealthConfig;
use crate::error::ProcessError;
use crate::instance::Instance;
use crate::notify::{deliver, FleetEvent};
use crate::process::{ProcessSupervisor, ResourceSample};
use crate::registry::InstanceRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracker::{CheckOutcome, HealthTracker};

/// Health classification of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of a single health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    /// Why the check failed
    pub reason: Option<String>,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
}

impl HealthCheckResult {
    fn new(instance_id: &str, sample: Option<ResourceSample>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            timestamp: Utc::now(),
            healthy: true,
            reason: None,
            cpu_percent: sample.map(|s| s.cpu_percent),
            memory_bytes: sample.map(|s| s.memory_bytes),
        }
    }

    fn fail(mut self, reason: impl Into<String>) -> Self {
        self.healthy = false;
        self.reason = Some(reason.into());
        self
    }
}

/// Application-level liveness check run after the resource thresholds
///
/// An `Err` marks the check failed. Implementations should not block; they
/// run on the runtime under the configured check timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, instance: &Instance) -> anyhow::Result<()>;
}

/// Probe that accepts every live process
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self, _instance: &Instance) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEventKind {
    Transition { from: HealthState, to: HealthState },
    /// The passing streak reached the stability threshold
    Stabilized,
}

/// Event handed to the [`HealthObserver`] after the registry was updated
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEvent {
    pub instance_id: String,
    /// Process generation the check loop was registered for
    pub generation: u64,
    pub kind: HealthEventKind,
    pub result: HealthCheckResult,
}

/// Consumer of health events, called synchronously from the check loop
pub trait HealthObserver: Send + Sync {
    fn on_health_event(&self, event: &HealthEvent);
}

/// Runs one check loop per registered instance
pub struct HealthMonitor {
    config: HealthConfig,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<InstanceRegistry>,
    probe: Arc<dyn HealthProbe>,
    observer: Arc<dyn HealthObserver>,
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        supervisor: Arc<ProcessSupervisor>,
        registry: Arc<InstanceRegistry>,
        probe: Arc<dyn HealthProbe>,
        observer: Arc<dyn HealthObserver>,
    ) -> Self {
        Self {
            config,
            supervisor,
            registry,
            probe,
            observer,
            loops: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start checking an instance's current process generation
    ///
    /// Replaces any previous registration for the id and resets the health
    /// state to HEALTHY. The first check runs one interval from now.
    pub fn register(&self, instance_id: &str, generation: u64) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            debug!(instance_id = %instance_id, "Health monitor is shut down, not registering");
            return false;
        }

        self.registry.update(instance_id, |instance| {
            instance.health_state = HealthState::Healthy;
        });

        let check_loop = CheckLoop {
            instance_id: instance_id.to_string(),
            generation,
            config: self.config.clone(),
            supervisor: Arc::clone(&self.supervisor),
            registry: Arc::clone(&self.registry),
            probe: Arc::clone(&self.probe),
            observer: Arc::clone(&self.observer),
            tracker: HealthTracker::new(
                self.config.degraded_after,
                self.config.unhealthy_after,
                self.config.stable_after,
            ),
        };

        let handle = tokio::spawn(check_loop.run());
        if let Some(previous) = self.loops.lock().insert(instance_id.to_string(), handle) {
            previous.abort();
        }

        debug!(instance_id = %instance_id, generation, "Registered for health checks");
        true
    }

    /// Stop checking an instance
    pub fn deregister(&self, instance_id: &str) -> bool {
        match self.loops.lock().remove(instance_id) {
            Some(handle) => {
                handle.abort();
                debug!(instance_id = %instance_id, "Deregistered from health checks");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, instance_id: &str) -> bool {
        self.loops.lock().contains_key(instance_id)
    }

    pub fn registered_count(&self) -> usize {
        self.loops.lock().len()
    }

    /// Stop every loop and refuse new registrations
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let loops: Vec<(String, JoinHandle<()>)> = self.loops.lock().drain().collect();
        if !loops.is_empty() {
            info!("Stopping {} health check loop(s)", loops.len());
        }
        for (_, handle) in loops {
            handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for (_, handle) in self.loops.get_mut().drain() {
            handle.abort();
        }
    }
}

struct CheckLoop {
    instance_id: String,
    generation: u64,
    config: HealthConfig,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<InstanceRegistry>,
    probe: Arc<dyn HealthProbe>,
    observer: Arc<dyn HealthObserver>,
    tracker: HealthTracker,
}

impl CheckLoop {
    async fn run(mut self) {
        let period = self.config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(instance) = self.registry.snapshot(&self.instance_id) else {
                debug!(instance_id = %self.instance_id, "Instance removed, ending health checks");
                return;
            };
            if instance.generation != self.generation {
                debug!(instance_id = %self.instance_id, "Stale generation, ending health checks");
                return;
            }

            self.check_once(&instance).await;
        }
    }

    async fn check_once(&mut self, instance: &Instance) {
        let (result, outcome) = self.evaluate(instance).await;
        let update = self.tracker.record(outcome);
        let state = self.tracker.state();

        debug!(
            instance_id = %self.instance_id,
            healthy = result.healthy,
            state = %state,
            "Health check completed"
        );

        self.registry.update(&self.instance_id, |instance| {
            instance.health_check_count += 1;
            if result.healthy {
                instance.healthy_check_count += 1;
            }
            instance.health_state = state;
            instance.last_health = Some(result.clone());
            instance.last_health_check_at = Some(result.timestamp);
        });

        if let Some((from, to)) = update.transition {
            let reason = result
                .reason
                .clone()
                .unwrap_or_else(|| "check passed".to_string());
            if to == HealthState::Healthy {
                info!(instance_id = %self.instance_id, "Health {} -> {}", from, to);
            } else {
                warn!(instance_id = %self.instance_id, "Health {} -> {}: {}", from, to, reason);
            }

            self.registry.persist_current(&self.instance_id);
            deliver(
                self.registry.sink(),
                FleetEvent::HealthChanged {
                    instance_id: self.instance_id.clone(),
                    from,
                    to,
                    reason,
                    at: result.timestamp,
                },
            );
            self.emit(HealthEventKind::Transition { from, to }, &result);
        }

        if update.stabilized {
            self.emit(HealthEventKind::Stabilized, &result);
        }
    }

    fn emit(&self, kind: HealthEventKind, result: &HealthCheckResult) {
        self.observer.on_health_event(&HealthEvent {
            instance_id: self.instance_id.clone(),
            generation: self.generation,
            kind,
            result: result.clone(),
        });
    }

    async fn evaluate(&self, instance: &Instance) -> (HealthCheckResult, CheckOutcome) {
        let id = self.instance_id.as_str();

        let sample = match self.supervisor.sample(id) {
            Ok(sample) => sample,
            Err(ProcessError::NotFound(_)) => {
                let result = HealthCheckResult::new(id, None).fail("process not found");
                return (result, CheckOutcome::Dead);
            }
            Err(e) => {
                let result = HealthCheckResult::new(id, None).fail(e.to_string());
                return (result, CheckOutcome::Fail);
            }
        };

        let result = HealthCheckResult::new(id, Some(sample));

        if let Some(max_cpu) = self.config.max_cpu_percent {
            if sample.cpu_percent > max_cpu {
                let reason = format!("cpu {:.1}% above {:.1}%", sample.cpu_percent, max_cpu);
                return (result.fail(reason), CheckOutcome::Fail);
            }
        }

        if let Some(max_memory) = self.config.max_memory_bytes {
            if sample.memory_bytes > max_memory {
                let reason = format!("memory {} bytes above {}", sample.memory_bytes, max_memory);
                return (result.fail(reason), CheckOutcome::Fail);
            }
        }

        match self.run_probe(instance).await {
            Ok(()) => (result, CheckOutcome::Pass),
            Err(reason) => (result.fail(reason), CheckOutcome::Fail),
        }
    }

    /// Run the probe in its own task so a panic or hang stays contained
    async fn run_probe(&self, instance: &Instance) -> Result<(), String> {
        let probe = Arc::clone(&self.probe);
        let instance = instance.clone();
        let mut handle = tokio::spawn(async move { probe.check(&instance).await });

        let wait = self.config.check_timeout();
        match tokio::time::timeout(wait, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(format!("probe failed: {}", e)),
            Ok(Err(e)) if e.is_panic() => Err("probe panicked".to_string()),
            Ok(Err(e)) => Err(format!("probe aborted: {}", e)),
            Err(_) => {
                handle.abort();
                Err(format!("check timed out after {:?}", wait))
            }
        }
    }
}
