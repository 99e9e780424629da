use crate::error::DeliveryFailure;
use crate::hub::Subscriber;
use crate::models::{PollId, TallySnapshot};
use crate::startup::AppState;
use axum::{
    extract::{
        Extension, Path,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::future::BoxFuture;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Writes snapshots as JSON text frames on the socket's write half.
struct WsSubscriber {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl Subscriber for WsSubscriber {
    fn send(&self, snapshot: Arc<TallySnapshot>) -> BoxFuture<'_, Result<(), DeliveryFailure>> {
        Box::pin(async move {
            let text = serde_json::to_string(&*snapshot)?;
            self.sink
                .lock()
                .await
                .send(Message::Text(text))
                .await
                .map_err(|e| DeliveryFailure::Transport(e.to_string()))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.sink.lock().await.close().await;
        })
    }
}

pub async fn poll_results_ws(
    ws: WebSocketUpgrade,
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<PollId>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| watch_poll(socket, app_state, poll_id))
}

async fn watch_poll(socket: WebSocket, app_state: AppState, poll_id: PollId) {
    let (sink, mut stream) = socket.split();
    let subscriber = WsSubscriber {
        sink: Mutex::new(sink),
    };

    let subscription = match app_state.hub.subscribe(Box::new(subscriber), poll_id.clone()).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(poll_id = %poll_id, error = %e, "websocket subscription refused");
            return;
        }
    };
    debug!(poll_id = %poll_id, subscription = %subscription.id, "websocket observer connected");

    // Observers never send anything meaningful; read only to notice the close.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    app_state.hub.unsubscribe(&subscription);
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::gate::OpenGate;
    use crate::models::{OptionId, PollId, TallySnapshot};
    use crate::startup::{AppState, router};
    use crate::store::{MemoryCounterStore, VoteCounterStore};
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn next_snapshot(ws: &mut Client) -> TallySnapshot {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for snapshot")
                .expect("socket ended")
                .expect("socket error");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn pushes_snapshots_over_websocket_until_closed() {
        let store = Arc::new(MemoryCounterStore::new());
        let config = Config::from_lookup(|_| None).unwrap();
        let state = AppState::from_parts(config, store.clone(), Arc::new(OpenGate));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = connect_async(format!("ws://{addr}/polls/p1/results"))
            .await
            .unwrap();
        let poll = PollId::from("p1");

        let first = next_snapshot(&mut ws).await;
        assert_eq!(first, TallySnapshot::new(poll.clone(), Vec::new()));
        assert_eq!(state.hub.subscriber_count(&poll), 1);

        let option = OptionId::from("a");
        let count = store.record_vote(&poll, &option).await.unwrap();
        state.hub.on_vote_recorded(&poll, &option, count);

        let update = next_snapshot(&mut ws).await;
        assert_eq!(update.total, 1);
        assert_eq!(update.options[0].option_id, option);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.hub.subscriber_count(&poll) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription outlived the socket");
    }
}
