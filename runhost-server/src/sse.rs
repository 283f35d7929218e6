//! Server-Sent Events stream of instance changes.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use runhost::core::types::InstanceEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

/// SSE endpoint handler.
///
/// Sends `connected` once, then one `instance` event per persisted change.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    debug!("SSE client connected");
    Sse::new(event_stream(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn event_stream(
    mut rx: broadcast::Receiver<InstanceEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change) => {
                    if let Ok(json) = serde_json::to_string(&change) {
                        yield Ok(Event::default().event("instance").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}
