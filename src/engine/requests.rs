use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::BusConnection;
use crate::engine::{Engine, QueryTracker};
use crate::logger::Logger;
use crate::query::{CancelQuery, Query, QueryResponse, ResponseStatus, StatusMessage};
use crate::runtime;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/requests"));

impl Engine {
    /// Full inbound path for one query: deadline clamp, cancellation
    /// tracking, the `STARTED` frame, execution, and exactly one terminal
    /// status.
    ///
    /// When no adapter serves the queried `(type, scope)` this returns
    /// without starting a responder: silence tells the client this source
    /// does not answer for that pair.
    pub async fn handle_query(&self, mut query: Query) {
        let max_deadline = Utc::now()
            + chrono::Duration::from_std(self.inner.config.max_request_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let overridden = query
            .deadline
            .map_or(true, |deadline| deadline > max_deadline);
        if overridden {
            query.deadline = Some(max_deadline);
            LOGGER.debug(format!(
                "deadline clamped to {max_deadline} for {}",
                query.describe()
            ));
        }

        let token = CancellationToken::new();
        let deadline_done = CancellationToken::new();
        if let Some(deadline) = query.deadline {
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let token = token.clone();
            let done = deadline_done.clone();
            runtime::spawn_detached(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = runtime::sleep(wait) => token.cancel(),
                }
            });
        }

        if self.inner.host.expand_query(&query).is_empty() {
            LOGGER.debug(format!(
                "no adapters serve {}; staying silent",
                query.describe()
            ));
            deadline_done.cancel();
            return;
        }

        let tracked_uuid = query.uuid;
        if let Some(uuid) = tracked_uuid {
            self.track(uuid, token.clone());
        }

        let responder = ResponseSender::start(
            self.connection(),
            query.reply_subject.clone(),
            self.inner.config.source_name.clone(),
            query.uuid,
        )
        .await;

        let tracker = QueryTracker::new(self.clone(), query.clone(), token.clone());
        let outcome = tracker.execute().await;

        let status = if token.is_cancelled() {
            ResponseStatus::Cancelled
        } else if outcome.error.is_some() {
            ResponseStatus::Errored
        } else {
            ResponseStatus::Done
        };
        responder.finish(status).await;

        if let Some(uuid) = tracked_uuid {
            self.untrack(uuid);
        }
        deadline_done.cancel();
    }

    /// A missing tracker is routine, not an error: the query may already have
    /// finished, or a different instance in the queue group owns it.
    pub fn handle_cancel_query(&self, cancel: CancelQuery) {
        let Some(uuid) = cancel.uuid else {
            LOGGER.debug("cancel request without a parseable uuid; ignoring");
            return;
        };
        if self.cancel_tracked_query(uuid) {
            LOGGER.info(format!("cancelled tracked query {uuid}"));
        } else {
            LOGGER.debug(format!("no tracked query with uuid {uuid}"));
        }
    }
}

/// Emits the lifecycle frames on a query's reply subject: `STARTED` when
/// constructed, one terminal status when the query finishes.
pub struct ResponseSender {
    connection: Option<Arc<dyn BusConnection>>,
    reply_subject: String,
    responder_name: String,
    query_uuid: Option<Uuid>,
}

impl ResponseSender {
    pub(crate) async fn start(
        connection: Option<Arc<dyn BusConnection>>,
        reply_subject: String,
        responder_name: String,
        query_uuid: Option<Uuid>,
    ) -> Self {
        let sender = Self {
            connection,
            reply_subject,
            responder_name,
            query_uuid,
        };
        sender.publish_status(ResponseStatus::Started).await;
        sender
    }

    pub(crate) async fn finish(&self, status: ResponseStatus) {
        self.publish_status(status).await;
    }

    async fn publish_status(&self, status: ResponseStatus) {
        let (Some(connection), false) = (&self.connection, self.reply_subject.is_empty()) else {
            return;
        };
        let frame = QueryResponse::Status(StatusMessage {
            responder_name: self.responder_name.clone(),
            query_uuid: self.query_uuid,
            status,
        });
        match serde_json::to_vec(&frame) {
            Ok(payload) => {
                if let Err(err) = connection
                    .publish(&self.reply_subject, Bytes::from(payload))
                    .await
                {
                    LOGGER.warn(format!(
                        "failed to publish {status:?} on {}: {err}",
                        self.reply_subject
                    ));
                }
            }
            Err(err) => LOGGER.error(format!("failed to encode status frame: {err}")),
        }
    }
}
