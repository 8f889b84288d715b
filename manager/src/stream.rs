//! `GET /v1/private/stream`: Server-Sent Events feed of service status
//! changes and recent log lines (spec §4.5), replaying the current
//! snapshot before switching to live reconciler events.

use crate::auth::authenticate_admin;
use crate::error::ManagerError;
use crate::state::ManagerState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use swarm_monitor::SseEvent;
use tokio::sync::broadcast;

pub async fn stream_services(
    State(state): State<ManagerState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ManagerError> {
    authenticate_admin(&headers, &state.config.core_base_url, &state.http).await?;

    let replay: Vec<SseEvent> = state.services.snapshot().into_iter().map(SseEvent::Status).collect();
    let replay_stream = stream::iter(replay.into_iter().map(|event| Ok(to_sse_event(&event))));

    let receiver = state.events_tx.subscribe();
    let live_stream = stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(to_sse_event(&event)), rx)),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    Ok(Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse_event(event: &SseEvent) -> Event {
    let (name, payload) = match event {
        SseEvent::Status(state) => ("status", serde_json::to_string(state).unwrap_or_default()),
        SseEvent::Log(entry) => ("log", serde_json::to_string(entry).unwrap_or_default()),
    };
    Event::default().event(name).data(payload)
}
