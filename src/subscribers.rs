use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

pub type ConnectionId = u64;

/// Outbound queue of one viewer. The viewer's writer task drains it.
pub type ViewerSender = mpsc::Sender<Arc<str>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: usize,
}

/// Live viewer connections. One mutex guards the set for register,
/// unregister and broadcast alike.
pub struct SubscriberRegistry {
    connections: Mutex<HashMap<ConnectionId, ViewerSender>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl SubscriberRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // Registering an id twice keeps the newest sender.
    pub async fn register(&self, id: ConnectionId, sender: ViewerSender) {
        self.connections.lock().await.insert(id, sender);
    }

    pub async fn unregister(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    /// Sends `document` to every viewer. A viewer whose queue is closed or
    /// stays full past the send timeout is dropped on the spot; dropping
    /// its sender closes the writer side of the socket.
    pub async fn broadcast(&self, document: Arc<str>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut connections = self.connections.lock().await;

        let mut failed = Vec::new();
        for (id, sender) in connections.iter() {
            match sender.send_timeout(document.clone(), self.send_timeout).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    info!(connection = id, "dropping viewer: {}", e);
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            connections.remove(&id);
            report.removed += 1;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broken_viewer_is_removed_and_others_get_one_message() {
        let registry = SubscriberRegistry::new(Duration::from_millis(50));
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = mpsc::channel(4);
            let id = registry.next_id();
            registry.register(id, tx).await;
            receivers.push((id, rx));
        }

        let (broken_id, broken_rx) = receivers.remove(2);
        drop(broken_rx);

        let report = registry.broadcast(Arc::from("[]")).await;
        assert_eq!(report, BroadcastReport { delivered: 3, removed: 1 });
        assert!(!registry.contains(broken_id).await);
        assert_eq!(registry.len().await, 3);

        for (id, rx) in receivers.iter_mut() {
            assert!(registry.contains(*id).await);
            assert_eq!(rx.try_recv().unwrap().as_ref(), "[]");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn slow_viewer_times_out_without_blocking_others() {
        let registry = SubscriberRegistry::new(Duration::from_millis(20));

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        slow_tx.try_send(Arc::from("backlog")).unwrap();
        registry.register(1, slow_tx).await;

        let (fast_tx, mut fast_rx) = mpsc::channel(1);
        registry.register(2, fast_tx).await;

        let report = registry.broadcast(Arc::from("snapshot")).await;
        assert_eq!(report.removed, 1);
        assert!(!registry.contains(1).await);
        assert_eq!(fast_rx.try_recv().unwrap().as_ref(), "snapshot");
    }

    #[tokio::test]
    async fn register_and_unregister_are_idempotent() {
        let registry = SubscriberRegistry::new(Duration::from_millis(20));
        let (tx, _rx) = mpsc::channel(1);
        registry.register(7, tx.clone()).await;
        registry.register(7, tx).await;
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister(7).await);
        assert!(!registry.unregister(7).await);
        assert_eq!(registry.len().await, 0);

        let report = registry.broadcast(Arc::from("[]")).await;
        assert_eq!(report, BroadcastReport::default());
    }
}
