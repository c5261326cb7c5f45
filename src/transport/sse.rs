use super::TransportState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

/// Bridge a session's push channel onto an SSE response.
///
/// The first frame on any fresh registration is `connection: established`;
/// when the client goes away the receiver drops and the bus unregisters the
/// session on its next send.
pub async fn subscribe(
    State(state): State<TransportState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(session_id, "sse subscriber attached");
    let rx = state.bus.register(&session_id);

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        Some((
            Ok(Event::default().event(frame.event).data(frame.data)),
            rx,
        ))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
