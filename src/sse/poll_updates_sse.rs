use crate::error::DeliveryFailure;
use crate::hub::Subscriber;
use crate::models::{PollId, TallySnapshot};
use crate::startup::AppState;
use axum::{
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::future::BoxFuture;
use futures::stream::Stream;
use serde_json::json;
use std::{convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Feeds snapshots into an SSE response stream.
///
/// The stream owns the receiving half; when the client goes away axum drops
/// the stream and `closed` resolves.
pub struct SseSubscriber {
    tx: mpsc::Sender<Arc<TallySnapshot>>,
}

impl SseSubscriber {
    pub fn new(tx: mpsc::Sender<Arc<TallySnapshot>>) -> Self {
        Self { tx }
    }
}

impl Subscriber for SseSubscriber {
    fn send(&self, snapshot: Arc<TallySnapshot>) -> BoxFuture<'_, Result<(), DeliveryFailure>> {
        Box::pin(async move {
            self.tx
                .send(snapshot)
                .await
                .map_err(|_| DeliveryFailure::Disconnected)
        })
    }

    // The response stream ends once this subscriber, and with it `tx`, is dropped.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.tx.closed())
    }
}

pub async fn poll_updates_sse(
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<PollId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel(app_state.config.subscriber_buffer);
    let subscribed = app_state
        .hub
        .subscribe(Box::new(SseSubscriber::new(tx)), poll_id.clone())
        .await;
    debug!(
        poll_id = %poll_id,
        observers = app_state.hub.subscriber_count(&poll_id),
        "sse observer connected"
    );

    let stream = async_stream::stream! {
        match subscribed {
            Ok(_) => {
                while let Some(snapshot) = rx.recv().await {
                    match Event::default().event("tally").json_data(&*snapshot) {
                        Ok(event) => yield Ok(event),
                        Err(e) => {
                            warn!(poll_id = %poll_id, error = %e, "failed to encode snapshot");
                        }
                    }
                }
            }
            Err(e) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"error": e.to_string()}).to_string()));
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(app_state.config.sse_keep_alive)
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::gate::OpenGate;
    use crate::models::{OptionId, PollId};
    use crate::startup::{AppState, router};
    use crate::store::{MemoryCounterStore, VoteCounterStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn next_frame(
        stream: &mut (impl futures::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin),
    ) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("body error");
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn streams_initial_snapshot_then_vote_updates() {
        let store = Arc::new(MemoryCounterStore::new());
        let config = Config::from_lookup(|_| None).unwrap();
        let state = AppState::from_parts(config, store.clone(), Arc::new(OpenGate));
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/polls/p1/updates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let first = next_frame(&mut body).await;
        assert!(first.contains("event: tally"));
        assert!(first.contains(r#"data: {"pollId":"p1","options":[],"total":0}"#));

        let (poll, option) = (PollId::from("p1"), OptionId::from("a"));
        let count = store.record_vote(&poll, &option).await.unwrap();
        state.hub.on_vote_recorded(&poll, &option, count);

        let update = next_frame(&mut body).await;
        assert!(update.contains(r#""options":[{"optionId":"a","count":1}],"total":1"#));
    }
}
