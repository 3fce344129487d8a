//! Update fan-out to live observers
//!
//! Each subscriber owns a bounded queue. A new subscriber first receives a
//! snapshot of every node, then one update per status change. Publishing
//! never waits: a subscriber whose queue is full or closed is dropped and
//! the rest still get the update.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::api::Metrics;
use crate::registry::NodeRegistry;
use crate::types::{NodeRecord, ServerMessage};

/// Receiving end handed to an observer connection
pub struct Subscriber {
    pub id: u64,
    pub receiver: mpsc::Receiver<ServerMessage>,
}

pub struct UpdateBroadcaster {
    registry: Arc<NodeRegistry>,
    metrics: Arc<Metrics>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<ServerMessage>>>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl UpdateBroadcaster {
    pub fn new(registry: Arc<NodeRegistry>, metrics: Arc<Metrics>, queue_size: usize) -> Self {
        Self {
            registry,
            metrics,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        }
    }

    /// Register an observer. The snapshot is queued before the subscriber
    /// becomes visible to `publish`, so no update can overtake it.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(self.queue_size);

        let mut subscribers = self.subscribers.lock();
        let snapshot: Vec<NodeRecord> = self
            .registry
            .get_all()
            .iter()
            .map(|node| node.to_record(false))
            .collect();
        let count = snapshot.len();

        // Fresh channel with capacity >= 1, cannot fail
        let _ = tx.try_send(ServerMessage::Snapshot(snapshot));
        subscribers.insert(id, tx);
        let total = subscribers.len();
        drop(subscribers);

        self.metrics.set_subscribers(total as u64);
        info!(subscriber = id, nodes = count, "New observer connected");

        Subscriber { id, receiver }
    }

    /// Remove an observer. Safe to call more than once.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let removed = subscribers.remove(&id).is_some();
        let total = subscribers.len();
        drop(subscribers);

        if removed {
            self.metrics.set_subscribers(total as u64);
            info!(subscriber = id, "Observer disconnected");
        }
        removed
    }

    /// Deliver one update to every observer, returns the delivery count
    pub fn publish(&self, record: NodeRecord) -> usize {
        let message = ServerMessage::Update(record);
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        let before = subscribers.len();

        subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                info!(subscriber = id, "Observer too slow, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "Observer gone, dropping");
                false
            }
        });

        let total = subscribers.len();
        drop(subscribers);

        self.metrics.add_subscribers_dropped((before - total) as u64);
        self.metrics.add_broadcasts_sent(delivered as u64);
        self.metrics.set_subscribers(total as u64);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoInfo;
    use tempfile::TempDir;

    fn setup(queue: usize) -> (TempDir, Arc<NodeRegistry>, UpdateBroadcaster) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(NodeRegistry::open(dir.path()).unwrap());
        let broadcaster = UpdateBroadcaster::new(registry.clone(), Arc::new(Metrics::new()), queue);
        (dir, registry, broadcaster)
    }

    fn record(ip: &str, registry: &NodeRegistry) -> NodeRecord {
        registry.get(ip).unwrap().to_record(false)
    }

    #[tokio::test]
    async fn test_snapshot_first() {
        let (_dir, registry, broadcaster) = setup(8);
        registry.upsert_discovered("1.2.3.4", GeoInfo::default()).unwrap();

        let mut sub = broadcaster.subscribe();
        match sub.receiver.recv().await.unwrap() {
            ServerMessage::Snapshot(nodes) => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].ip, "1.2.3.4");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_snapshot() {
        let (_dir, _registry, broadcaster) = setup(8);
        let mut sub = broadcaster.subscribe();
        assert_eq!(
            sub.receiver.recv().await.unwrap(),
            ServerMessage::Snapshot(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_failing_subscriber_removed_others_served() {
        let (_dir, registry, broadcaster) = setup(8);
        registry.upsert_discovered("5.6.7.8", GeoInfo::default()).unwrap();

        let mut a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        let mut c = broadcaster.subscribe();
        let b_id = b.id;
        drop(b);

        assert_eq!(broadcaster.publish(record("5.6.7.8", &registry)), 2);
        assert_eq!(broadcaster.subscriber_count(), 2);
        assert!(!broadcaster.unsubscribe(b_id));

        for sub in [&mut a, &mut c] {
            assert!(matches!(sub.receiver.recv().await, Some(ServerMessage::Snapshot(_))));
            assert!(matches!(sub.receiver.recv().await, Some(ServerMessage::Update(_))));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped() {
        let (_dir, registry, broadcaster) = setup(2);
        registry.upsert_discovered("9.9.9.9", GeoInfo::default()).unwrap();

        // Never drained: snapshot + one update fill the queue
        let _slow = broadcaster.subscribe();
        assert_eq!(broadcaster.publish(record("9.9.9.9", &registry)), 1);
        assert_eq!(broadcaster.publish(record("9.9.9.9", &registry)), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.metrics.subscribers_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let (_dir, _registry, broadcaster) = setup(4);
        let sub = broadcaster.subscribe();

        assert!(broadcaster.unsubscribe(sub.id));
        assert!(!broadcaster.unsubscribe(sub.id));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let (_dir, registry, broadcaster) = setup(4);
        registry.upsert_discovered("4.3.2.1", GeoInfo::default()).unwrap();
        assert_eq!(broadcaster.publish(record("4.3.2.1", &registry)), 0);
    }
}
