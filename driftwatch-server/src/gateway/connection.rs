use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::gateway::messages::Frame;

/// One gateway connection: its subscriptions, heartbeat bookkeeping, and a
/// bounded send queue.
///
/// Enqueueing never blocks: when the queue is full the oldest frame is
/// dropped, so one slow client only loses its own backlog.
pub struct Connection {
    pub id: Uuid,
    topics: RwLock<HashSet<String>>,
    last_seen: RwLock<DateTime<Utc>>,
    queue: Mutex<VecDeque<Frame>>,
    queue_capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    /// Cancelled when the server closes this connection.
    pub closer: CancellationToken,
}

impl Connection {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            topics: RwLock::new(HashSet::new()),
            last_seen: RwLock::new(Utc::now()),
            queue: Mutex::new(VecDeque::with_capacity(queue_capacity)),
            queue_capacity: queue_capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closer: CancellationToken::new(),
        }
    }

    pub async fn subscribe(&self, topic: String) {
        self.topics.write().await.insert(topic);
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        self.topics.write().await.remove(topic)
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().await.contains(topic)
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.iter().cloned().collect()
    }

    /// Record client liveness; any client frame counts.
    pub async fn touch(&self) {
        *self.last_seen.write().await = Utc::now();
    }

    pub async fn idle_seconds(&self) -> i64 {
        (Utc::now() - *self.last_seen.read().await).num_seconds()
    }

    /// Queue a frame for the writer task, dropping the oldest on overflow.
    pub async fn enqueue(&self, frame: Frame) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.queue_capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(connection = %self.id, dropped, "send queue full, dropping oldest frame");
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
    }

    /// Wait for the next queued frame, FIFO.
    pub async fn next_frame(&self) -> Frame {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.queue.lock().await.pop_front() {
                return frame;
            }
            notified.await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn queue_is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_overflow_drops_the_oldest() {
        let conn = Connection::new(3);
        for i in 0..5 {
            conn.enqueue(Frame::ack("subscribed", &format!("t{i}"))).await;
        }
        assert_eq!(conn.dropped_count(), 2);
        // The two oldest frames were dropped; t2 is now first.
        let first = conn.next_frame().await;
        assert_eq!(first.topic.as_deref(), Some("t2"));
        let second = conn.next_frame().await;
        assert_eq!(second.topic.as_deref(), Some("t3"));
    }

    #[tokio::test]
    async fn delivery_is_fifo() {
        let conn = Connection::new(16);
        conn.enqueue(Frame::ack("subscribed", "a")).await;
        conn.enqueue(Frame::ack("subscribed", "b")).await;
        assert_eq!(conn.next_frame().await.topic.as_deref(), Some("a"));
        assert_eq!(conn.next_frame().await.topic.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn subscriptions_toggle() {
        let conn = Connection::new(4);
        conn.subscribe("anomalies".to_string()).await;
        assert!(conn.is_subscribed("anomalies").await);
        assert!(conn.unsubscribe("anomalies").await);
        assert!(!conn.unsubscribe("anomalies").await);
        assert!(!conn.is_subscribed("anomalies").await);
    }
}
