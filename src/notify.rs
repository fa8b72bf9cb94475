// Notifications - Status, health and recovery events published to observers

use crate::health::HealthState;
use crate::instance::InstanceStatus;
use crate::recovery::RecoveryAction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default capacity of the broadcast channel
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Event published by the control plane
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    StatusChanged {
        instance_id: String,
        from: InstanceStatus,
        to: InstanceStatus,
        at: DateTime<Utc>,
    },
    HealthChanged {
        instance_id: String,
        from: HealthState,
        to: HealthState,
        reason: String,
        at: DateTime<Utc>,
    },
    RecoveryScheduled {
        action: RecoveryAction,
    },
    InstanceFailed {
        instance_id: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
}

impl FleetEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            FleetEvent::StatusChanged { instance_id, .. }
            | FleetEvent::HealthChanged { instance_id, .. }
            | FleetEvent::InstanceFailed { instance_id, .. } => instance_id,
            FleetEvent::RecoveryScheduled { action } => &action.instance_id,
        }
    }
}

/// Receiver of control-plane events (logging, alerting, dashboards)
///
/// Errors are logged by the caller and never propagated.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &FleetEvent) -> anyhow::Result<()>;
}

/// Deliver an event, logging and discarding sink failures
pub(crate) fn deliver(sink: &dyn NotificationSink, event: FleetEvent) {
    if let Err(e) = sink.notify(&event) {
        warn!(
            instance_id = %event.instance_id(),
            "Notification sink failed: {:#}",
            e
        );
    }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: &FleetEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink that writes every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        match event {
            FleetEvent::StatusChanged {
                instance_id,
                from,
                to,
                ..
            } => info!(instance_id = %instance_id, "Status {} -> {}", from, to),
            FleetEvent::HealthChanged {
                instance_id,
                from,
                to,
                reason,
                ..
            } => info!(instance_id = %instance_id, "Health {} -> {} ({})", from, to, reason),
            FleetEvent::RecoveryScheduled { action } => info!(
                instance_id = %action.instance_id,
                "Recovery {} scheduled (attempt {}, eligible at {})",
                action.kind,
                action.attempt,
                action.next_eligible_at
            ),
            FleetEvent::InstanceFailed {
                instance_id,
                attempts,
                ..
            } => error!(
                instance_id = %instance_id,
                "Instance failed permanently after {} recovery attempts", attempts
            ),
        }
        Ok(())
    }
}

/// Sink that fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<FleetEvent>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        // No subscribers is not a failure
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Sink forwarding each event to several sinks
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, event: &FleetEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            deliver(sink.as_ref(), event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status_event(id: &str) -> FleetEvent {
        FleetEvent::StatusChanged {
            instance_id: id.to_string(),
            from: InstanceStatus::Starting,
            to: InstanceStatus::Running,
            at: Utc::now(),
        }
    }

    struct FailingSink(AtomicUsize);

    impl NotificationSink for FailingSink {
        fn notify(&self, _event: &FleetEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("sink offline")
        }
    }

    #[test]
    fn test_instance_id_accessor() {
        assert_eq!(status_event("a").instance_id(), "a");
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();

        sink.notify(&status_event("a")).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance_id(), "a");
    }

    #[test]
    fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::new();
        assert!(sink.notify(&status_event("a")).is_ok());
    }

    #[test]
    fn test_deliver_swallows_errors() {
        let sink = FailingSink(AtomicUsize::new(0));
        deliver(&sink, status_event("a"));
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fanout_continues_past_failures() {
        let failing = Arc::new(FailingSink(AtomicUsize::new(0)));
        let broadcast = BroadcastSink::new();
        let mut rx = broadcast.subscribe();

        let fanout = FanoutSink::new()
            .with(failing.clone())
            .with(Arc::new(broadcast));

        assert!(fanout.notify(&status_event("b")).is_ok());
        assert_eq!(failing.0.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap().instance_id(), "b");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_string(&status_event("a")).unwrap();
        assert!(json.contains("\"type\":\"status_changed\""));
        assert!(json.contains("\"to\":\"running\""));
    }
}
