//! Server-Sent Events for execution progress streaming
//!
//! Supplements status polling: one stream per execution, carrying node,
//! chapter and terminal events as they happen.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;

/// GET /executions/:execution_id/events - SSE stream for one execution
///
/// Streams events:
/// - ExecutionStarted
/// - NodeStarted / NodeCompleted
/// - ChapterAccepted / ChapterRejected
/// - GenerationRetry
/// - ExecutionProgress
/// - ExecutionCompleted / ExecutionFailed / ExecutionCancelled
pub async fn execution_event_stream(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(execution_id = %execution_id, "New SSE client connected to execution events");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                // Heartbeat every 15 seconds
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                // Broadcast events, filtered to this execution
                Ok(event) = rx.recv() => {
                    if event.execution_id() != execution_id {
                        continue;
                    }

                    let event_type = event.event_type();
                    match serde_json::to_string(&event) {
                        Ok(event_json) => {
                            debug!("SSE: Broadcasting execution event: {}", event_type);
                            yield Ok(Event::default()
                                .event(event_type)
                                .data(event_json));
                        }
                        Err(e) => {
                            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
