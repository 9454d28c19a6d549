use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::bus::{
    connection_failed, flush_failed, publish_failed, subscribe_failed, BusConnection, BusConnector,
    BusMessage, BusResult, ConnectionState, Subscription,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial parameters for the NATS transport.
#[derive(Clone, Debug)]
pub struct NatsOptions {
    /// Server URLs, e.g. `nats://localhost:4222`.
    pub servers: Vec<String>,
    /// Connection name visible in NATS monitoring.
    pub connection_name: String,
    pub connect_timeout: Duration,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            connection_name: "discovery-source".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Connects the engine to a real NATS deployment.
pub struct NatsConnector {
    options: NatsOptions,
}

impl NatsConnector {
    pub fn new(options: NatsOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self) -> BusResult<Arc<dyn BusConnection>> {
        let servers = self.options.servers.join(",");
        let client = async_nats::ConnectOptions::new()
            .name(self.options.connection_name.clone())
            .connection_timeout(self.options.connect_timeout)
            .connect(servers.as_str())
            .await
            .map_err(|err| connection_failed(format!("failed to connect to NATS: {err}")))?;
        Ok(Arc::new(NatsConnection { client }))
    }
}

pub struct NatsConnection {
    client: async_nats::Client,
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|err| publish_failed(format!("failed to publish to {subject}: {err}")))
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Box<dyn Subscription>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|err| subscribe_failed(format!("failed to subscribe to {subject}: {err}")))?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn queue_subscribe(&self, subject: &str, queue: &str) -> BusResult<Box<dyn Subscription>> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue.to_string())
            .await
            .map_err(|err| subscribe_failed(format!("failed to subscribe to {subject}: {err}")))?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn flush(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|err| flush_failed(format!("failed to flush: {err}")))
    }

    fn status(&self) -> ConnectionState {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    async fn close(&self) -> BusResult<()> {
        // Dropping the last clone of the client tears the connection down;
        // flushing first keeps queued publishes from being lost.
        let _ = self.client.flush().await;
        Ok(())
    }
}

struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        let message = self.subscriber.next().await?;
        Some(BusMessage {
            subject: message.subject.to_string(),
            reply: message.reply.map(|reply| reply.to_string()),
            payload: message.payload,
        })
    }
}
