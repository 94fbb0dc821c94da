use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::gateway::connection::Connection;
use crate::gateway::messages::Frame;

/// Tracks active gateway connections and routes events by topic.
///
/// Broadcast walks every connection subscribed to the topic and enqueues
/// onto its bounded queue; delivery per connection is FIFO and one slow
/// client never stalls the others.
pub struct ConnectionManager {
    connections: DashMap<Uuid, Arc<Connection>>,
    queue_capacity: usize,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        queue_capacity: usize,
        heartbeat_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            queue_capacity,
            heartbeat_interval,
            idle_timeout,
        }
    }

    pub fn open_connection(&self) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(self.queue_capacity));
        info!(connection = %connection.id, "gateway connection opened");
        self.connections.insert(connection.id, Arc::clone(&connection));
        connection
    }

    /// Drop a connection; its subscriptions die with it.
    pub fn remove_connection(&self, id: Uuid) {
        if let Some((_, connection)) = self.connections.remove(&id) {
            connection.closer.cancel();
            info!(connection = %id, "gateway connection closed");
        }
    }

    pub fn get_connection(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(&c))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Enqueue an event on every connection subscribed to the topic.
    pub async fn publish(&self, topic: &str, event_type: &str, payload: Value) {
        let frame = Frame::event(topic, event_type, payload);
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut delivered = 0usize;
        for connection in connections {
            if connection.is_subscribed(topic).await {
                connection.enqueue(frame.clone()).await;
                delivered += 1;
            }
        }
        debug!(topic, delivered, "event published");
    }

    /// Heartbeat loop: every interval, close connections idle past the
    /// timeout and send a heartbeat frame to the rest.
    pub fn spawn_heartbeat(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("gateway heartbeat stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        let connections: Vec<Arc<Connection>> = self
                            .connections
                            .iter()
                            .map(|entry| Arc::clone(entry.value()))
                            .collect();
                        for connection in connections {
                            if connection.idle_seconds().await
                                >= self.idle_timeout.as_secs() as i64
                            {
                                info!(connection = %connection.id, "closing idle connection");
                                self.remove_connection(connection.id);
                            } else {
                                connection.enqueue(Frame::heartbeat()).await;
                            }
                        }
                    }
                }
            }
        })
    }
}
