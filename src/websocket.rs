use crate::subscribers::SubscriberRegistry;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};

// Snapshots are tens of seconds apart; a viewer this far behind is stuck.
const OUTBOUND_QUEUE: usize = 4;

/// Serves one viewer until it disconnects or a write fails. Inbound
/// frames are only logged.
pub async fn handle_viewer(socket: WebSocket, registry: Arc<SubscriberRegistry>, write_timeout: Duration) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(OUTBOUND_QUEUE);

    let id = registry.next_id();
    registry.register(id, tx).await;
    let viewers = registry.len().await;
    info!(connection = id, viewers = viewers, "viewer connected");

    let writer_registry = registry.clone();
    let writer = tokio::spawn(async move {
        while let Some(document) = rx.recv().await {
            // Dropped by a broadcast; anything still queued is stale.
            if !writer_registry.contains(id).await {
                break;
            }
            match tokio::time::timeout(write_timeout, sink.send(Message::text(document.as_ref()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(connection = id, "websocket write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(connection = id, "websocket write timed out");
                    break;
                }
            }
        }
        writer_registry.unregister(id).await;
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(msg) if msg.is_close() => break,
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    info!(connection = id, "received message: {}", text);
                } else {
                    debug!(connection = id, "ignoring non-text frame");
                }
            }
            Err(e) => {
                warn!(connection = id, "websocket read failed: {}", e);
                break;
            }
        }
    }

    // Dropping the registry's sender ends the writer loop, which closes the sink.
    registry.unregister(id).await;
    let _ = writer.await;
    info!(connection = id, "viewer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::Filter;

    fn viewer_route(
        registry: Arc<SubscriberRegistry>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
            let registry = registry.clone();
            ws.on_upgrade(move |socket| handle_viewer(socket, registry, Duration::from_secs(1)))
        })
    }

    async fn wait_for_viewers(registry: &SubscriberRegistry, n: usize) {
        for _ in 0..200 {
            if registry.len().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} viewers", n);
    }

    #[tokio::test]
    async fn viewer_receives_broadcasts_until_dropped() {
        let registry = Arc::new(SubscriberRegistry::new(Duration::from_millis(200)));
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(viewer_route(registry.clone()))
            .await
            .unwrap();
        wait_for_viewers(&registry, 1).await;

        let report = registry.broadcast(Arc::from("[]")).await;
        assert_eq!(report.delivered, 1);
        let msg = client.recv().await.unwrap();
        assert_eq!(msg.to_str().unwrap(), "[]");

        // Removing the viewer closes its socket.
        assert!(registry.unregister(1).await);
        client.recv_closed().await.unwrap();
    }

    #[tokio::test]
    async fn client_disconnect_unregisters_viewer() {
        let registry = Arc::new(SubscriberRegistry::new(Duration::from_millis(200)));
        let mut client = warp::test::ws()
            .path("/ws")
            .handshake(viewer_route(registry.clone()))
            .await
            .unwrap();
        wait_for_viewers(&registry, 1).await;

        client.send_text("hello").await;
        drop(client);
        wait_for_viewers(&registry, 0).await;
    }
}
