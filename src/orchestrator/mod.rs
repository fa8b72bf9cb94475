// Orchestrator - Public facade over registry, supervisor, health and recovery

mod request;

pub use request::InstanceSpec;

use crate::config::FleetConfig;
use crate::error::{ConfigError, OrchestratorError, ProcessError, Result};
use crate::health::{AlwaysHealthy, HealthMonitor, HealthProbe};
use crate::instance::{validate_instance_id, Instance, InstanceEnv, InstanceStatus};
use crate::notify::{BroadcastSink, FanoutSink, FleetEvent, NotificationSink, TracingSink};
use crate::process::{parse_command, ProcessRecord, ProcessSupervisor, SpawnRequest};
use crate::providers::{SessionProvider, WorkspaceProvider};
use crate::recovery::{RecoveryController, RecoveryExecutor};
use crate::registry::{InstanceRegistry, InstanceSlot};
use crate::state::{MemoryStateStore, StateStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Counts from a start-up reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Persisted instances loaded into the registry
    pub restored: usize,
    /// Live process groups adopted
    pub reattached: usize,
    /// Instances whose process was gone
    pub crashed: usize,
}

/// Assembles an [`Orchestrator`] from its collaborators
pub struct OrchestratorBuilder {
    config: FleetConfig,
    store: Option<Arc<dyn StateStore>>,
    sink: Option<Arc<dyn NotificationSink>>,
    workspaces: Option<Arc<dyn WorkspaceProvider>>,
    sessions: Option<Arc<dyn SessionProvider>>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl OrchestratorBuilder {
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sink receiving every event in addition to the built-in broadcast
    /// (defaults to [`TracingSink`])
    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn workspace_provider(mut self, provider: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspaces = Some(provider);
        self
    }

    pub fn session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(provider);
        self
    }

    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Wire the components together; must be called inside a tokio runtime
    ///
    /// Fails with `InvalidRequest` when the health, recovery or supervisor
    /// settings are unusable, e.g. a zero check interval.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate_policy()?;

        let broadcast = BroadcastSink::new();
        let sink = FanoutSink::new()
            .with(Arc::new(broadcast.clone()))
            .with(self.sink.unwrap_or_else(|| Arc::new(TracingSink)));

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        let registry = Arc::new(InstanceRegistry::new(store, Arc::new(sink)));
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            self.config.supervisor.log_dir.clone(),
        ));
        let probe = self.probe.unwrap_or_else(|| Arc::new(AlwaysHealthy));
        let config = self.config;
        let workspaces = self.workspaces;
        let sessions = self.sessions;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let executor: Weak<dyn RecoveryExecutor> = weak.clone();
            let recovery = Arc::new(RecoveryController::new(
                config.recovery.clone(),
                Arc::clone(&registry),
                executor,
            ));
            let health = HealthMonitor::new(
                config.health.clone(),
                Arc::clone(&supervisor),
                Arc::clone(&registry),
                probe,
                recovery.clone(),
            );

            Inner {
                config,
                registry,
                supervisor,
                health,
                recovery,
                workspaces,
                sessions,
                broadcast,
                shutting_down: AtomicBool::new(false),
            }
        });

        Ok(Orchestrator { inner })
    }
}

/// Control plane for a fleet of supervised instances
///
/// Cheap to clone; clones share the same fleet. Start, stop and restart of
/// one instance are serialized by a per-instance lock, different instances
/// proceed independently.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: FleetConfig,
    registry: Arc<InstanceRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    health: HealthMonitor,
    recovery: Arc<RecoveryController>,
    workspaces: Option<Arc<dyn WorkspaceProvider>>,
    sessions: Option<Arc<dyn SessionProvider>>,
    broadcast: BroadcastSink,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn builder(config: FleetConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: None,
            sink: None,
            workspaces: None,
            sessions: None,
            probe: None,
        }
    }

    /// Orchestrator with in-memory state and default collaborators
    pub fn new(config: FleetConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Create an instance and start its process
    ///
    /// The id is reserved atomically, so of two concurrent starts with the
    /// same id exactly one fails with `AlreadyExists`. A spawn failure leaves
    /// the instance registered in ERROR.
    pub async fn start_instance(&self, spec: InstanceSpec) -> Result<Instance> {
        let inner = &self.inner;
        inner.ensure_running()?;

        validate_instance_id(&spec.id)?;
        if parse_command(&spec.command).is_none() {
            return Err(ConfigError::Validation(format!(
                "cannot parse command {:?}",
                spec.command
            ))
            .into());
        }
        let env = InstanceEnv::try_from(spec.env)?;

        // Fail fast before provisioning a workspace
        if inner.registry.contains(&spec.id) {
            return Err(OrchestratorError::AlreadyExists(spec.id));
        }

        let workspace = match (spec.workspace_path, &inner.workspaces) {
            (Some(path), _) => path,
            (None, Some(provider)) => provider.resolve(&spec.id, spec.branch.as_deref())?,
            (None, None) => {
                return Err(ConfigError::MissingField(
                    "workspace_path (no workspace provider configured)".to_string(),
                )
                .into())
            }
        };

        let instance = Instance::new(spec.id, workspace, spec.command, spec.session_ref, env);
        let id = instance.id.clone();
        let slot = inner.registry.reserve(instance)?;
        info!(instance_id = %id, "Starting instance");

        let _guard = slot.lock_ops(inner.lock_timeout()).await?;
        if slot.is_retired() {
            // Stopped before it got going
            return Ok(slot.snapshot());
        }
        inner.launch(&slot, false).await
    }

    /// Stop an instance's process and keep its record
    ///
    /// Health checks and pending recovery are cancelled before the process is
    /// signalled. With `force` the group is killed without a graceful phase.
    /// Returns true once no process is left; repeated calls return true.
    pub async fn stop_instance(&self, instance_id: &str, timeout: Duration, force: bool) -> Result<bool> {
        let inner = &self.inner;
        let slot = inner.slot(instance_id)?;
        let _guard = slot.lock_ops(inner.lock_timeout()).await?;

        slot.set_retired(true);
        inner.health.deregister(instance_id);
        inner.recovery.cancel(instance_id);

        let timeout = if force { Duration::ZERO } else { timeout };
        let dead = match inner.supervisor.terminate(instance_id, timeout).await {
            Ok(dead) => dead,
            Err(e) => {
                inner.mark_error(instance_id, None, e.to_string());
                return Err(e.into());
            }
        };

        if !dead {
            error!(instance_id = %instance_id, "Process survived SIGKILL");
            inner.mark_error(instance_id, None, "process did not exit after SIGKILL".to_string());
            return Ok(false);
        }

        inner.supervisor.mark_stopped(instance_id);
        info!(instance_id = %instance_id, "Instance stopped");
        Ok(true)
    }

    /// Operator restart with the stored configuration
    ///
    /// Clears recovery history, so it also revives FAILED instances.
    pub async fn restart_instance(&self, instance_id: &str) -> Result<Instance> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let slot = inner.slot(instance_id)?;
        let _guard = slot.lock_ops(inner.lock_timeout()).await?;

        info!(instance_id = %instance_id, "Restarting instance");
        inner.recovery.reset(instance_id);
        slot.set_retired(false);
        inner.relaunch(&slot, false).await
    }

    /// Drop a finished instance from the registry and the state store
    pub async fn remove_instance(&self, instance_id: &str) -> Result<Instance> {
        let inner = &self.inner;
        let slot = inner.slot(instance_id)?;
        let _guard = slot.lock_ops(inner.lock_timeout()).await?;

        let status = slot.status();
        if !status.is_removable() || inner.supervisor.is_tracked(instance_id) {
            return Err(OrchestratorError::InvalidState {
                instance_id: instance_id.to_string(),
                status: status.to_string(),
                operation: "remove",
            });
        }

        slot.set_retired(true);
        inner.health.deregister(instance_id);
        inner.recovery.forget(instance_id);
        let removed = inner
            .registry
            .remove(instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(instance_id.to_string()))?;

        info!(instance_id = %instance_id, "Instance removed");
        Ok(removed)
    }

    pub fn get_status(&self, instance_id: &str) -> Result<Instance> {
        self.inner
            .registry
            .snapshot(instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(instance_id.to_string()))
    }

    /// Point-in-time copies of every instance, ordered by id
    pub fn list_instances(&self) -> Vec<Instance> {
        self.inner.registry.list()
    }

    pub fn process_record(&self, instance_id: &str) -> Option<ProcessRecord> {
        self.inner.supervisor.record(instance_id)
    }

    /// Number of live processes owned or adopted by this control plane
    pub fn live_process_count(&self) -> usize {
        self.inner.supervisor.live_count()
    }

    /// Receive every status, health and recovery event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Load persisted instances and adopt their surviving processes
    ///
    /// Instances persisted with a process are re-attached when their group is
    /// still alive and get a fresh health registration; otherwise they are
    /// marked CRASHED. Ids already in the registry are skipped.
    pub async fn recover(&self) -> Result<RecoverySummary> {
        let inner = &self.inner;
        inner.ensure_running()?;

        let persisted = inner.registry.store().load_all()?;
        let mut summary = RecoverySummary::default();

        for instance in persisted {
            if inner.registry.contains(&instance.id) {
                continue;
            }

            let id = instance.id.clone();
            let had_process = instance.status.has_process();
            let slot = inner.registry.reserve(instance.clone())?;
            summary.restored += 1;

            if !had_process {
                if matches!(instance.status, InstanceStatus::Stopped | InstanceStatus::Failed) {
                    slot.set_retired(true);
                }
                continue;
            }

            let _guard = slot.lock_ops(inner.lock_timeout()).await?;
            match inner.supervisor.reattach(&instance) {
                Ok(record) => {
                    inner.health.register(&id, record.generation);
                    summary.reattached += 1;
                }
                Err(e) => {
                    warn!(instance_id = %id, "Could not re-attach: {}", e);
                    summary.crashed += 1;
                }
            }
        }

        info!(
            restored = summary.restored,
            reattached = summary.reattached,
            crashed = summary.crashed,
            "Recovered persisted state"
        );
        Ok(summary)
    }

    /// Stop the whole fleet
    ///
    /// Health checks stop first so no recovery is triggered by the exits,
    /// then pending recovery is dropped and every process terminated. Later
    /// starts fail with `ShuttingDown`.
    pub async fn shutdown(&self, timeout: Duration) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
        }

        info!("Shutting down fleet");
        inner.health.shutdown();
        inner.recovery.shutdown();
        inner.supervisor.cleanup_all(timeout).await;
        info!("Fleet shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    fn lock_timeout(&self) -> Duration {
        self.config.supervisor.lock_timeout()
    }

    fn slot(&self, instance_id: &str) -> Result<Arc<InstanceSlot>> {
        self.registry
            .slot(instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(instance_id.to_string()))
    }

    fn mark_error(&self, instance_id: &str, generation: Option<u64>, reason: String) {
        self.registry
            .transition(instance_id, generation, InstanceStatus::Error, |instance| {
                instance.process_ref = None;
                instance.last_error = Some(reason);
            });
    }

    /// Replace the current process with a new generation
    ///
    /// Caller holds the instance's operation lock.
    async fn relaunch(&self, slot: &InstanceSlot, keep_checking_on_failure: bool) -> Result<Instance> {
        let id = slot.snapshot().id;
        self.health.deregister(&id);

        let stop_timeout = self.config.supervisor.stop_timeout();
        if !self.supervisor.terminate(&id, stop_timeout).await? {
            let reason = "previous process did not exit";
            self.mark_error(&id, None, reason.to_string());
            return Err(ProcessError::terminate_failed(&id, reason).into());
        }

        self.launch(slot, keep_checking_on_failure).await
    }

    /// Spawn a new process generation
    ///
    /// Caller holds the instance's operation lock. With
    /// `keep_checking_on_failure` the new generation is registered for health
    /// checks even if the spawn failed, so recovery keeps making progress.
    async fn launch(&self, slot: &InstanceSlot, keep_checking_on_failure: bool) -> Result<Instance> {
        let id = slot.snapshot().id;
        let generation = self
            .registry
            .next_generation(&id)
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))?;
        let instance = slot.snapshot();

        let prepared = instance
            .render_command()
            .map_err(OrchestratorError::from)
            .and_then(|rendered| match &self.sessions {
                Some(sessions) => sessions
                    .wrap(&rendered, &instance.workspace_path, &id)
                    .map(|wrapped| (wrapped.command, Some(wrapped.session_ref)))
                    .map_err(OrchestratorError::from),
                None => Ok((rendered, instance.session_ref.clone())),
            });
        let (command, session_ref) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.mark_error(&id, Some(generation), e.to_string());
                if keep_checking_on_failure {
                    self.health.register(&id, generation);
                }
                return Err(e);
            }
        };
        self.registry
            .update(&id, |instance| instance.session_ref = session_ref);

        let request = SpawnRequest {
            instance_id: id.clone(),
            command,
            workdir: instance.workspace_path.clone(),
            env: instance.extra_env.clone(),
            generation,
        };

        match self.supervisor.spawn(request).await {
            Ok(_) => {
                self.health.register(&id, generation);
                Ok(slot.snapshot())
            }
            Err(e) => {
                warn!(instance_id = %id, generation, "Spawn failed: {}", e);
                self.mark_error(&id, Some(generation), e.to_string());
                if keep_checking_on_failure {
                    self.health.register(&id, generation);
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl RecoveryExecutor for Inner {
    async fn restart(&self, instance_id: &str) -> Result<()> {
        let Some(slot) = self.registry.slot(instance_id) else {
            return Ok(());
        };
        let _guard = slot.lock_ops(self.lock_timeout()).await?;

        if slot.is_retired() || self.shutting_down.load(Ordering::SeqCst) {
            debug!(instance_id = %instance_id, "Skipping automatic restart");
            return Ok(());
        }
        if slot.status() == InstanceStatus::Failed {
            return Ok(());
        }

        info!(instance_id = %instance_id, "Automatic restart");
        self.relaunch(&slot, true).await.map(|_| ())
    }

    async fn retire(&self, instance_id: &str) -> Result<bool> {
        let Some(slot) = self.registry.slot(instance_id) else {
            return Ok(false);
        };
        let _guard = slot.lock_ops(self.lock_timeout()).await?;

        if slot.is_retired() {
            debug!(instance_id = %instance_id, "Already stopped, skipping escalation");
            return Ok(false);
        }

        self.health.deregister(instance_id);
        let stop_timeout = self.config.supervisor.stop_timeout();
        self.supervisor.terminate(instance_id, stop_timeout).await?;
        Ok(true)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::providers::{DirectoryWorkspaceProvider, WrappedCommand};
    use std::path::Path;
    use tempfile::TempDir;

    fn orchestrator() -> (Orchestrator, TempDir) {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder(FleetConfig::default())
            .workspace_provider(Arc::new(DirectoryWorkspaceProvider::new(dir.path())))
            .build()
            .unwrap();
        (orchestrator, dir)
    }

    struct PrefixSession;

    impl SessionProvider for PrefixSession {
        fn wrap(
            &self,
            command: &str,
            _workdir: &Path,
            instance_id: &str,
        ) -> std::result::Result<WrappedCommand, SessionError> {
            Ok(WrappedCommand {
                command: format!("env SESSION={} {}", instance_id, command),
                session_ref: format!("session:{}", instance_id),
            })
        }
    }

    struct BrokenSession;

    impl SessionProvider for BrokenSession {
        fn wrap(
            &self,
            _command: &str,
            _workdir: &Path,
            instance_id: &str,
        ) -> std::result::Result<WrappedCommand, SessionError> {
            Err(SessionError {
                instance_id: instance_id.to_string(),
                reason: "no terminal server".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_start_resolves_workspace() {
        let (orchestrator, dir) = orchestrator();

        let instance = orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30").branch("main"))
            .await
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.workspace_path, dir.path().join("a-main"));
        assert_eq!(instance.generation, 1);
        assert!(orchestrator.process_record("a").is_some());

        orchestrator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_start_requires_workspace_source() {
        let orchestrator = Orchestrator::new(FleetConfig::default()).unwrap();
        let result = orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));
        assert!(orchestrator.list_instances().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_requests() {
        let (orchestrator, _dir) = orchestrator();

        let bad_id = orchestrator
            .start_instance(InstanceSpec::new("../x", "sleep 1"))
            .await;
        assert!(matches!(bad_id, Err(OrchestratorError::InvalidRequest(_))));

        let reserved_env = orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 1").env("FLOTILLA_X", "1"))
            .await;
        assert!(matches!(reserved_env, Err(OrchestratorError::InvalidRequest(_))));

        let empty_command = orchestrator.start_instance(InstanceSpec::new("a", "")).await;
        assert!(matches!(empty_command, Err(OrchestratorError::InvalidRequest(_))));
        assert!(orchestrator.list_instances().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_error() {
        let (orchestrator, _dir) = orchestrator();

        let result = orchestrator
            .start_instance(InstanceSpec::new("a", "/nonexistent/binary"))
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Process(ProcessError::SpawnFailed { .. }))
        ));

        let instance = orchestrator.get_status("a").unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        assert!(instance.last_error.is_some());
        assert!(orchestrator.process_record("a").is_none());
    }

    #[tokio::test]
    async fn test_session_provider_wraps_command() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder(FleetConfig::default())
            .session_provider(Arc::new(PrefixSession))
            .build()
            .unwrap();

        let instance = orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30").workspace(dir.path()))
            .await
            .unwrap();

        assert_eq!(instance.session_ref.as_deref(), Some("session:a"));
        assert_eq!(
            orchestrator.process_record("a").unwrap().command,
            "env SESSION=a sleep 30"
        );

        orchestrator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_session_failure_surfaces() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder(FleetConfig::default())
            .session_provider(Arc::new(BrokenSession))
            .build()
            .unwrap();

        let result = orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30").workspace(dir.path()))
            .await;

        assert!(matches!(result, Err(OrchestratorError::Session(_))));
        assert_eq!(orchestrator.get_status("a").unwrap().status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_command_template_is_rendered() {
        let (orchestrator, dir) = orchestrator();

        orchestrator
            .start_instance(InstanceSpec::new("tpl", "sh -c 'echo {instance_id} > {workspace}/id; sleep 30'"))
            .await
            .unwrap();

        let marker = dir.path().join("tpl").join("id");
        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(std::fs::read_to_string(marker).unwrap().trim(), "tpl");

        orchestrator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_workspace_with_spaces_stays_one_argument() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("my workspace");
        std::fs::create_dir(&workspace).unwrap();
        let orchestrator = Orchestrator::new(FleetConfig::default()).unwrap();

        orchestrator
            .start_instance(InstanceSpec::new("spaced", "touch {workspace}/marker").workspace(&workspace))
            .await
            .unwrap();

        let marker = workspace.join("marker");
        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(marker.exists());
        assert!(!dir.path().join("my").exists());
    }

    #[test]
    fn test_build_rejects_unusable_policy() {
        let mut config = FleetConfig::default();
        config.health.interval_ms = 0;
        assert!(matches!(
            Orchestrator::new(config),
            Err(OrchestratorError::InvalidRequest(_))
        ));

        let mut config = FleetConfig::default();
        config.recovery.base_delay_ms = 1_000;
        config.recovery.max_delay_ms = 10;
        assert!(matches!(
            Orchestrator::builder(config).build(),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_retire_after_operator_stop_is_skipped() {
        let (orchestrator, _dir) = orchestrator();
        orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await
            .unwrap();
        assert!(orchestrator
            .stop_instance("a", Duration::from_secs(5), false)
            .await
            .unwrap());

        let retired = RecoveryExecutor::retire(orchestrator.inner.as_ref(), "a")
            .await
            .unwrap();

        assert!(!retired);
        assert_eq!(orchestrator.get_status("a").unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_remove_requires_finished_instance() {
        let (orchestrator, _dir) = orchestrator();
        orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await
            .unwrap();

        let running = orchestrator.remove_instance("a").await;
        assert!(matches!(running, Err(OrchestratorError::InvalidState { .. })));

        orchestrator
            .stop_instance("a", Duration::from_secs(5), false)
            .await
            .unwrap();
        let removed = orchestrator.remove_instance("a").await.unwrap();
        assert_eq!(removed.status, InstanceStatus::Stopped);
        assert!(matches!(
            orchestrator.get_status("a"),
            Err(OrchestratorError::NotFound(_))
        ));

        // The id is free again
        orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await
            .unwrap();
        orchestrator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_restart_instance_bumps_generation() {
        let (orchestrator, _dir) = orchestrator();
        let first = orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await
            .unwrap();

        let second = orchestrator.restart_instance("a").await.unwrap();

        assert_eq!(second.status, InstanceStatus::Running);
        assert_eq!(second.generation, first.generation + 1);
        assert_ne!(second.pid(), first.pid());
        assert_eq!(orchestrator.live_process_count(), 1);

        orchestrator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (orchestrator, _dir) = orchestrator();
        orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await
            .unwrap();
        orchestrator
            .stop_instance("a", Duration::from_secs(5), true)
            .await
            .unwrap();

        let restarted = orchestrator.restart_instance("a").await.unwrap();
        assert_eq!(restarted.status, InstanceStatus::Running);

        orchestrator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_starts() {
        let (orchestrator, _dir) = orchestrator();
        orchestrator
            .start_instance(InstanceSpec::new("a", "sleep 30"))
            .await
            .unwrap();

        orchestrator.shutdown(Duration::from_secs(5)).await;

        assert!(orchestrator.is_shutting_down());
        assert_eq!(orchestrator.live_process_count(), 0);
        assert_eq!(orchestrator.get_status("a").unwrap().status, InstanceStatus::Stopped);
        assert!(matches!(
            orchestrator.start_instance(InstanceSpec::new("b", "sleep 1")).await,
            Err(OrchestratorError::ShuttingDown)
        ));
    }
}
