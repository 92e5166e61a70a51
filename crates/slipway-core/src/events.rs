//! Lifecycle notifications
//!
//! The orchestrator publishes events on an [`EventBus`]; sinks (UI streaming,
//! audit) subscribe. Publishing never blocks: with no subscribers the event
//! is dropped, and slow subscribers lag rather than back-pressure.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{BuildId, InstanceId, ProjectId};

/// Lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    #[serde(rename = "build.started")]
    BuildStarted {
        build_id: BuildId,
        project_id: ProjectId,
    },
    #[serde(rename = "build.succeeded")]
    BuildSucceeded {
        build_id: BuildId,
        project_id: ProjectId,
        artifact: String,
    },
    #[serde(rename = "build.failed")]
    BuildFailed {
        build_id: BuildId,
        project_id: ProjectId,
        reason: String,
    },
    #[serde(rename = "instance.healthy")]
    InstanceHealthy {
        instance_id: InstanceId,
        project_id: ProjectId,
        port: u16,
    },
    #[serde(rename = "instance.unhealthy")]
    InstanceUnhealthy {
        instance_id: InstanceId,
        project_id: ProjectId,
    },
    #[serde(rename = "instance.failed")]
    InstanceFailed {
        instance_id: InstanceId,
        project_id: ProjectId,
        reason: String,
    },
    #[serde(rename = "instance.stopped")]
    InstanceStopped {
        instance_id: InstanceId,
        project_id: ProjectId,
    },
}

impl LifecycleEvent {
    /// Dotted event name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BuildStarted { .. } => "build.started",
            Self::BuildSucceeded { .. } => "build.succeeded",
            Self::BuildFailed { .. } => "build.failed",
            Self::InstanceHealthy { .. } => "instance.healthy",
            Self::InstanceUnhealthy { .. } => "instance.unhealthy",
            Self::InstanceFailed { .. } => "instance.failed",
            Self::InstanceStopped { .. } => "instance.stopped",
        }
    }
}

/// Fire-and-forget broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Create bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish; never blocks, never fails
    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(event = event.name(), "lifecycle event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// New subscription, seeing events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(LifecycleEvent::BuildStarted {
            build_id: BuildId::new(),
            project_id: ProjectId::new(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let instance_id = InstanceId::new();
        let project_id = ProjectId::new();

        bus.emit(LifecycleEvent::InstanceStopped {
            instance_id,
            project_id,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "instance.stopped");
    }

    #[test]
    fn events_serialize_with_dotted_tag() {
        let event = LifecycleEvent::BuildFailed {
            build_id: BuildId::new(),
            project_id: ProjectId::new(),
            reason: "build_timeout".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "build.failed");
        assert_eq!(json["reason"], "build_timeout");
    }
}
