//! Server-sent events for one conversation topic.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};

use crate::shared_state::AppState;
use crate::transport::topic_for;

/// GET /v1/conversations/:id/events
pub async fn conversation_events(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topic = topic_for(&conversation_id);
    info!("Client subscribed to {}", topic);
    let receiver = state.publisher.subscribe(&topic);

    let events = BroadcastStream::new(receiver).filter_map(move |item| {
        let topic = topic.clone();
        async move {
            match item {
                Ok(event) => Some(Ok(Event::default().event(event.kind).data(event.payload.to_string()))),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Subscriber of {} lagged, {} events dropped", topic, skipped);
                    None
                }
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
