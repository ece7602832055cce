//! Build event definitions and bus.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::BuildPhase;

/// Build progress events.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    /// The build moved to a new phase.
    PhaseChanged { build: String, phase: BuildPhase },
    /// A stage began executing.
    StageStarted { stage: String },
    /// An instruction is about to run.
    InstructionStarted {
        stage: String,
        index: usize,
        instruction: String,
    },
    /// A filesystem instruction produced or reused a layer.
    LayerReady {
        stage: String,
        digest: String,
        cached: bool,
    },
    /// A stage finished.
    StageCompleted { stage: String, layers: usize },
    /// A stage failed.
    StageFailed { stage: String, error: String },
    /// A stage was not run because a dependency failed.
    StageSkipped { stage: String, dependency: String },
    /// A stage stopped because the build was cancelled.
    StageCancelled { stage: String },
}

/// Event bus for build events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BuildEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: BuildEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BuildEvent::StageStarted {
            stage: "builder".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            BuildEvent::StageStarted {
                stage: "builder".into()
            }
        );
    }

    #[test]
    fn publish_without_subscribers() {
        EventBus::new().publish(BuildEvent::StageCancelled { stage: "x".into() });
    }

    #[test]
    fn event_json_is_tagged() {
        let json = serde_json::to_value(BuildEvent::StageSkipped {
            stage: "runtime".into(),
            dependency: "builder".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "stage_skipped");
        assert_eq!(json["dependency"], "builder");
    }
}
