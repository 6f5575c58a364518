//! Sync status streaming via Server-Sent Events.
//!
//! The UI listens here to drive its "syncing" and "sync failed" indicators.
//! Each reconciler [`SyncEvent`] becomes one SSE event named after its type
//! with the JSON-encoded event as data:
//!
//! ```text
//! event: completed
//! data: {"type":"completed","summary":{"reports":[...]}}
//! ```

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use routine_core::SyncEvent;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

/// SSE event name for a sync event.
#[must_use]
pub fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::Started { .. } => "started",
        SyncEvent::Completed { .. } => "completed",
        SyncEvent::Failed { .. } => "failed",
    }
}

/// SSE stream of reconciliation progress.
///
/// # Example
///
/// ```text
/// curl -N http://localhost:7688/api/sync/events
/// ```
pub async fn sync_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.reconciler.subscribe());

    // Lagged receivers skip what they missed; the next event carries a full summary.
    let event_stream = stream.filter_map(|result| result.ok()).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event_name(&event)).data(data))
    });

    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use routine_core::{SyncSummary, SyncTrigger};

    #[test]
    fn test_event_names() {
        assert_eq!(
            event_name(&SyncEvent::Started {
                trigger: SyncTrigger::Reconnect
            }),
            "started"
        );
        assert_eq!(
            event_name(&SyncEvent::Failed {
                message: "1 change(s) could not be synced".to_string(),
                summary: SyncSummary::default(),
            }),
            "failed"
        );
    }
}
