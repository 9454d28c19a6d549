use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::bus::{
    subject_matches, BusConnection, BusConnector, BusMessage, BusResult, ConnectionState,
    Subscription,
};

/// In-process message bus with NATS-like delivery semantics.
///
/// Backs the integration tests and local development: subjects support the
/// `*`/`>` wildcards, queue groups deliver each message to one member
/// round-robin, and the connection state can be forced from tests to exercise
/// the watcher's escalation paths.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Default)]
struct MemoryBusInner {
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    published: Mutex<Vec<BusMessage>>,
    round_robin: AtomicUsize,
}

struct SubscriptionEntry {
    pattern: String,
    queue: Option<String>,
    sender: async_channel::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { bus: self.clone() }
    }

    /// Connects directly, bypassing the connector. Tests use this to hold the
    /// connection they poke `set_status` on.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            bus: self.clone(),
            state: Mutex::new(ConnectionState::Connected),
        })
    }

    /// Every message published through any connection, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.inner.published.lock().unwrap().clone()
    }

    fn deliver(&self, message: BusMessage) {
        self.inner.published.lock().unwrap().push(message.clone());

        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        subscriptions.retain(|entry| !entry.sender.is_closed());

        let mut queues_seen: Vec<String> = Vec::new();
        for entry in subscriptions.iter() {
            if !subject_matches(&entry.pattern, &message.subject) {
                continue;
            }
            match &entry.queue {
                None => {
                    let _ = entry.sender.try_send(message.clone());
                }
                Some(queue) => {
                    if queues_seen.contains(queue) {
                        continue;
                    }
                    queues_seen.push(queue.clone());

                    let members: Vec<&SubscriptionEntry> = subscriptions
                        .iter()
                        .filter(|candidate| {
                            candidate.queue.as_deref() == Some(queue)
                                && subject_matches(&candidate.pattern, &message.subject)
                        })
                        .collect();
                    if members.is_empty() {
                        continue;
                    }
                    let turn = self.inner.round_robin.fetch_add(1, Ordering::SeqCst);
                    let _ = members[turn % members.len()].sender.try_send(message.clone());
                }
            }
        }
    }

    fn register(&self, pattern: &str, queue: Option<&str>) -> MemorySubscription {
        let (sender, receiver) = async_channel::unbounded();
        self.inner.subscriptions.lock().unwrap().push(SubscriptionEntry {
            pattern: pattern.to_string(),
            queue: queue.map(str::to_string),
            sender,
        });
        MemorySubscription { receiver }
    }
}

pub struct MemoryConnector {
    bus: MemoryBus,
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self) -> BusResult<Arc<dyn BusConnection>> {
        Ok(self.bus.connect())
    }
}

pub struct MemoryConnection {
    bus: MemoryBus,
    state: Mutex<ConnectionState>,
}

impl MemoryConnection {
    /// Forces the observed connection state; watcher tests drive this.
    pub fn set_status(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        self.bus.deliver(BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Box<dyn Subscription>> {
        Ok(Box::new(self.bus.register(subject, None)))
    }

    async fn queue_subscribe(&self, subject: &str, queue: &str) -> BusResult<Box<dyn Subscription>> {
        Ok(Box::new(self.bus.register(subject, Some(queue))))
    }

    async fn flush(&self) -> BusResult<()> {
        Ok(())
    }

    fn status(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn close(&self) -> BusResult<()> {
        *self.state.lock().unwrap() = ConnectionState::Closed;
        Ok(())
    }
}

pub struct MemorySubscription {
    receiver: async_channel::Receiver<BusMessage>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn plain_subscribers_all_receive() {
        let bus = MemoryBus::new();
        let conn = bus.connect();
        let mut first = conn.subscribe("request.all").await.unwrap();
        let mut second = conn.subscribe("request.>").await.unwrap();

        conn.publish("request.all", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(
            first.next_message().await.unwrap().payload,
            Bytes::from_static(b"hello")
        );
        assert_eq!(
            second.next_message().await.unwrap().subject,
            "request.all".to_string()
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queue_groups_deliver_to_one_member() {
        let bus = MemoryBus::new();
        let conn = bus.connect();
        let mut first = conn.queue_subscribe("request.all", "engines").await.unwrap();
        let mut second = conn.queue_subscribe("request.all", "engines").await.unwrap();

        for i in 0..4 {
            conn.publish("request.all", Bytes::from(format!("m{i}")))
                .await
                .unwrap();
        }

        let mut delivered = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), first.next_message()).await
        {
            delivered += 1;
        }
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), second.next_message()).await
        {
            delivered += 1;
        }
        assert_eq!(delivered, 4);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wildcard_subtree_subscription_sees_scoped_subjects() {
        let bus = MemoryBus::new();
        let conn = bus.connect();
        let mut sub = conn.subscribe("request.scope.>").await.unwrap();

        conn.publish("request.scope.production", Bytes::new())
            .await
            .unwrap();
        conn.publish("request.all", Bytes::new()).await.unwrap();

        let message = sub.next_message().await.unwrap();
        assert_eq!(message.subject, "request.scope.production");
    }
}
