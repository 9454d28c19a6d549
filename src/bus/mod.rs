pub mod memory;
pub mod nats;
pub mod watcher;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Coarse connection health as seen by the watcher and the readiness probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// Terminal: the connection will never self-recover.
    Closed,
}

/// One message delivered to a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// The slice of a message-bus client the engine depends on.
///
/// Implementations must be safe for concurrent publish/subscribe from many
/// tasks; the engine shares one connection across every in-flight query.
#[async_trait]
pub trait BusConnection: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()>;

    async fn subscribe(&self, subject: &str) -> BusResult<Box<dyn Subscription>>;

    /// Subscribes as a member of `queue`: each message goes to exactly one
    /// member, which is how multiple engine instances load-balance.
    async fn queue_subscribe(&self, subject: &str, queue: &str) -> BusResult<Box<dyn Subscription>>;

    async fn flush(&self) -> BusResult<()>;

    fn status(&self) -> ConnectionState;

    async fn close(&self) -> BusResult<()>;
}

/// A live subscription. Dropping it removes interest in the subject.
#[async_trait]
pub trait Subscription: Send {
    /// The next message, or `None` once the subscription is dead.
    async fn next_message(&mut self) -> Option<BusMessage>;
}

/// Dial factory, so the engine can reconnect without knowing transport
/// details.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn BusConnection>>;
}

/// True when `subject` matches `pattern` under NATS token rules: `*` matches
/// one token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusErrorCode {
    ConnectionFailed,
    PublishFailed,
    SubscribeFailed,
    FlushFailed,
    Closed,
}

impl BusErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusErrorCode::ConnectionFailed => "bus/connection-failed",
            BusErrorCode::PublishFailed => "bus/publish-failed",
            BusErrorCode::SubscribeFailed => "bus/subscribe-failed",
            BusErrorCode::FlushFailed => "bus/flush-failed",
            BusErrorCode::Closed => "bus/closed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BusError {
    pub code: BusErrorCode,
    message: String,
}

impl BusError {
    pub fn new(code: BusErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for BusError {}

pub type BusResult<T> = Result<T, BusError>;

pub fn connection_failed(message: impl Into<String>) -> BusError {
    BusError::new(BusErrorCode::ConnectionFailed, message)
}

pub fn publish_failed(message: impl Into<String>) -> BusError {
    BusError::new(BusErrorCode::PublishFailed, message)
}

pub fn subscribe_failed(message: impl Into<String>) -> BusError {
    BusError::new(BusErrorCode::SubscribeFailed, message)
}

pub fn flush_failed(message: impl Into<String>) -> BusError {
    BusError::new(BusErrorCode::FlushFailed, message)
}

pub fn closed(message: impl Into<String>) -> BusError {
    BusError::new(BusErrorCode::Closed, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_matching_follows_token_rules() {
        assert!(subject_matches("request.all", "request.all"));
        assert!(subject_matches("request.scope.>", "request.scope.production"));
        assert!(subject_matches(
            "request.scope.>",
            "request.scope.production.eu-west-1"
        ));
        assert!(subject_matches("request.*", "request.all"));

        assert!(!subject_matches("request.scope.>", "request.scope"));
        assert!(!subject_matches("request.all", "request.scope.production"));
        assert!(!subject_matches("request.*", "request.scope.production"));
        assert!(!subject_matches("cancel.all", "request.all"));
    }
}
