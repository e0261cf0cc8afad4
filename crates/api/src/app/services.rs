use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use clipforge_core::UserId;
use clipforge_events::{InMemoryRealtimeHub, user_channel};
use clipforge_infra::service::JobService;

/// Services shared by every request handler.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: JobService,
    pub realtime: Arc<InMemoryRealtimeHub>,
}

impl AppServices {
    pub fn new(jobs: JobService, realtime: Arc<InMemoryRealtimeHub>) -> Self {
        Self { jobs, realtime }
    }
}

/// SSE stream of one user's realtime channel (`job:progress`, `job:completed`,
/// `job:failed`, `notification`).
pub fn user_sse_stream(
    services: Arc<AppServices>,
    user_id: UserId,
) -> Sse<UnboundedReceiverStream<Result<SseEvent, Infallible>>> {
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    let mut subscription = services.realtime.subscribe(user_channel(user_id));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                msg = subscription.recv() => {
                    let Some(msg) = msg else { break };
                    let event = SseEvent::default()
                        .event(msg.event)
                        .data(msg.payload.to_string());
                    if tx.send(Ok(event)).is_err() {
                        break;
                    }
                }
            }
        }
        debug!(%user_id, "realtime stream closed");
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
