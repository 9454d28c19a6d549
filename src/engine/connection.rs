use std::sync::{Arc, LazyLock};

use tokio_util::sync::CancellationToken;

use crate::bus::watcher::{ConnectionWatcher, FailureHandler, WatcherConfig};
use crate::bus::{BusConnection, ConnectionState, Subscription};
use crate::engine::{internal_error, Engine, EngineResult, DEFAULT_FLUSH_TIMEOUT};
use crate::logger::Logger;
use crate::query::{CancelQuery, Query};
use crate::runtime;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/connection"));

/// The four subjects every engine serves. Scoped variants subscribe the whole
/// subtree; the queries themselves carry their concrete scope.
const REQUEST_SUBJECTS: [&str; 2] = ["request.all", "request.scope.>"];
const CANCEL_SUBJECTS: [&str; 2] = ["cancel.all", "cancel.scope.>"];

#[derive(Clone, Copy)]
enum SubjectKind {
    Request,
    Cancel,
}

impl Engine {
    /// Dials the bus, starts the watcher, flushes, and subscribes the four
    /// request/cancel subjects. No-op on engines without a configured
    /// transport.
    pub(crate) async fn connect(&self) -> EngineResult<()> {
        let Some(connector) = self.inner.connector.clone() else {
            return Ok(());
        };

        let connection = connector
            .connect()
            .await
            .map_err(|err| internal_error(format!("failed to connect: {err}")))?;
        *self.inner.connection.lock().unwrap() = Some(Arc::clone(&connection));

        self.start_watcher(&connection);

        match runtime::with_timeout(connection.flush(), DEFAULT_FLUSH_TIMEOUT).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(internal_error(format!("flush before subscribing failed: {err}")))
            }
            Err(_) => return Err(internal_error("flush before subscribing timed out")),
        }

        let reader_token = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .reader_token
            .lock()
            .unwrap()
            .replace(reader_token.clone())
        {
            previous.cancel();
        }

        for subject in REQUEST_SUBJECTS {
            let subscription = self.subscribe(connection.as_ref(), subject).await?;
            self.spawn_reader(subscription, SubjectKind::Request, reader_token.clone());
        }
        for subject in CANCEL_SUBJECTS {
            let subscription = self.subscribe(connection.as_ref(), subject).await?;
            self.spawn_reader(subscription, SubjectKind::Cancel, reader_token.clone());
        }

        LOGGER.info("connected and subscribed");
        Ok(())
    }

    async fn subscribe(
        &self,
        connection: &dyn BusConnection,
        subject: &str,
    ) -> EngineResult<Box<dyn Subscription>> {
        let result = match &self.inner.config.queue_name {
            Some(queue) => connection.queue_subscribe(subject, queue).await,
            None => connection.subscribe(subject).await,
        };
        result.map_err(|err| internal_error(format!("failed to subscribe to {subject}: {err}")))
    }

    fn start_watcher(&self, connection: &Arc<dyn BusConnection>) {
        let engine = self.clone();
        let handler: FailureHandler = Arc::new(move || {
            let engine = engine.clone();
            // Never reconnect inline: the handler is invoked from the watcher
            // loop, which disconnect() is about to stop.
            runtime::spawn_detached(async move {
                engine.reconnect().await;
            });
        });

        let watcher = ConnectionWatcher::start(
            Arc::downgrade(connection),
            WatcherConfig {
                reconnection_timeout: self.inner.config.reconnection_timeout,
                ..Default::default()
            },
            handler,
        );
        if let Some(previous) = self.inner.watcher.lock().unwrap().replace(watcher) {
            previous.stop();
        }
    }

    pub(crate) async fn reconnect(&self) {
        LOGGER.warn("connection failure escalated; reconnecting");
        self.disconnect().await;
        if let Err(err) = self.connect().await {
            LOGGER.error(format!("reconnect failed: {err}"));
        }
    }

    /// Stops the watcher and readers, then closes the connection. Flushes
    /// first when the connection is still healthy so buffered responses are
    /// not lost.
    pub(crate) async fn disconnect(&self) {
        if let Some(watcher) = self.inner.watcher.lock().unwrap().take() {
            watcher.stop();
        }
        if let Some(token) = self.inner.reader_token.lock().unwrap().take() {
            token.cancel();
        }
        let connection = self.inner.connection.lock().unwrap().take();
        if let Some(connection) = connection {
            if connection.status() == ConnectionState::Connected {
                if let Err(err) = connection.flush().await {
                    LOGGER.warn(format!("flush on disconnect failed: {err}"));
                }
            }
            if let Err(err) = connection.close().await {
                LOGGER.warn(format!("close failed: {err}"));
            }
        }
    }

    fn spawn_reader(
        &self,
        mut subscription: Box<dyn Subscription>,
        kind: SubjectKind,
        token: CancellationToken,
    ) {
        let engine = self.clone();
        runtime::spawn_detached(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => return,
                    message = subscription.next_message() => message,
                };
                let Some(message) = message else { return };

                match kind {
                    SubjectKind::Request => {
                        match serde_json::from_slice::<Query>(&message.payload) {
                            Ok(mut query) => {
                                if query.reply_subject.is_empty() {
                                    if let Some(reply) = message.reply {
                                        query.reply_subject = reply;
                                    }
                                }
                                let engine = engine.clone();
                                runtime::spawn_detached(async move {
                                    engine.handle_query(query).await;
                                });
                            }
                            Err(err) => LOGGER.warn(format!(
                                "dropping undecodable query on {}: {err}",
                                message.subject
                            )),
                        }
                    }
                    SubjectKind::Cancel => {
                        match serde_json::from_slice::<CancelQuery>(&message.payload) {
                            Ok(cancel) => engine.handle_cancel_query(cancel),
                            Err(err) => LOGGER.warn(format!(
                                "dropping undecodable cancel on {}: {err}",
                                message.subject
                            )),
                        }
                    }
                }
            }
        });
    }
}
