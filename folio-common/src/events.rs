//! Event types for the Folio execution event system

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted while an execution moves through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    /// Execution accepted and handed to a worker
    ExecutionStarted {
        execution_id: Uuid,
        engine_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Worker began processing a graph node
    NodeStarted {
        execution_id: Uuid,
        node_id: String,
        label: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Graph node finished and its output was checkpointed
    NodeCompleted {
        execution_id: Uuid,
        node_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Generated chapter passed validation and entered the manuscript
    ChapterAccepted {
        execution_id: Uuid,
        number: u32,
        title: String,
        words: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Generated chapter was rejected (duplicate or failed validation)
    ChapterRejected {
        execution_id: Uuid,
        title: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Validation failed and the generation call is being retried
    GenerationRetry {
        execution_id: Uuid,
        node_id: String,
        attempt: u32,
        code: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Overall progress update (sent after each node or chapter boundary)
    ExecutionProgress {
        execution_id: Uuid,
        percentage: f32,
        completed_nodes: usize,
        total_nodes: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Execution reached the completed terminal state
    ExecutionCompleted {
        execution_id: Uuid,
        total_chapters: usize,
        total_words: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Execution reached the failed terminal state
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Execution was cancelled by operator request
    ExecutionCancelled {
        execution_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ExecutionEvent {
    /// Event type name, used as the SSE event field
    pub fn event_type(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => "ExecutionStarted",
            ExecutionEvent::NodeStarted { .. } => "NodeStarted",
            ExecutionEvent::NodeCompleted { .. } => "NodeCompleted",
            ExecutionEvent::ChapterAccepted { .. } => "ChapterAccepted",
            ExecutionEvent::ChapterRejected { .. } => "ChapterRejected",
            ExecutionEvent::GenerationRetry { .. } => "GenerationRetry",
            ExecutionEvent::ExecutionProgress { .. } => "ExecutionProgress",
            ExecutionEvent::ExecutionCompleted { .. } => "ExecutionCompleted",
            ExecutionEvent::ExecutionFailed { .. } => "ExecutionFailed",
            ExecutionEvent::ExecutionCancelled { .. } => "ExecutionCancelled",
        }
    }

    /// Execution this event belongs to, for per-stream SSE filtering
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::ChapterAccepted { execution_id, .. }
            | ExecutionEvent::ChapterRejected { execution_id, .. }
            | ExecutionEvent::GenerationRetry { execution_id, .. }
            | ExecutionEvent::ExecutionProgress { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. }
            | ExecutionEvent::ExecutionCancelled { execution_id, .. } => *execution_id,
        }
    }
}

/// Broadcast event bus shared by workers and SSE subscribers
///
/// # Examples
///
/// ```
/// use folio_common::events::EventBus;
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    ///
    /// Events beyond capacity are dropped for lagging subscribers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ExecutionEvent,
    ) -> Result<usize, broadcast::error::SendError<ExecutionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Progress and chapter events use this; it is acceptable for no
    /// component to be watching a given execution.
    pub fn emit_lossy(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.emit_lossy(ExecutionEvent::ExecutionCancelled {
            execution_id: id,
            timestamp: chrono::Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), id);
    }

    #[test]
    fn test_emit_without_subscribers_is_lossy() {
        let bus = EventBus::new(16);
        // No subscribers; emit_lossy must not panic or error
        bus.emit_lossy(ExecutionEvent::ExecutionStarted {
            execution_id: Uuid::new_v4(),
            engine_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ExecutionEvent::ChapterAccepted {
            execution_id: Uuid::new_v4(),
            number: 3,
            title: "The Long Road".to_string(),
            words: 1200,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ChapterAccepted");
        assert_eq!(json["number"], 3);
    }
}
