use std::sync::LazyLock;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Engine;
use crate::item::{Edge, Item};
use crate::logger::Logger;
use crate::query::{Query, QueryError, QueryResponse};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/tracker"));

/// Everything a finished query produced, after republishing.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    pub items: Vec<Item>,
    pub edges: Vec<Edge>,
    pub errors: Vec<QueryError>,
    /// Execution-level failure, distinct from the per-adapter `errors`.
    pub error: Option<QueryError>,
}

/// Binds one query to its cancellable context and drives it to completion,
/// republishing every response frame on the query's reply subject.
pub struct QueryTracker {
    engine: Engine,
    query: Query,
    token: CancellationToken,
}

impl QueryTracker {
    pub fn new(engine: Engine, query: Query, token: CancellationToken) -> Self {
        Self {
            engine,
            query,
            token,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Idempotent; the whole execution subtree observes the cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Runs the query to completion, draining the response stream as it is
    /// produced. Publish failures are logged, never fatal: local accumulation
    /// continues so the caller still gets the full result set.
    pub async fn execute(&self) -> QueryOutcome {
        let (sender, receiver) = async_channel::bounded::<QueryResponse>(1);

        let engine = self.engine.clone();
        let query = self.query.clone();
        let token = self.token.clone();
        let execution = tokio::spawn(async move {
            engine.execute_query(&token, &query, sender).await
        });

        let mut outcome = QueryOutcome::default();
        let connection = self.engine.connection();
        let reply_subject = self.query.reply_subject.clone();

        while let Ok(response) = receiver.recv().await {
            if let Some(connection) = &connection {
                if !reply_subject.is_empty() {
                    match serde_json::to_vec(&response) {
                        Ok(payload) => {
                            if let Err(err) = connection
                                .publish(&reply_subject, Bytes::from(payload))
                                .await
                            {
                                LOGGER.warn(format!(
                                    "failed to publish response on {reply_subject}: {err}"
                                ));
                            }
                        }
                        Err(err) => {
                            LOGGER.error(format!("failed to encode response frame: {err}"))
                        }
                    }
                }
            }
            match response {
                QueryResponse::Item(item) => outcome.items.push(item),
                QueryResponse::Edge(edge) => outcome.edges.push(edge),
                QueryResponse::Error(error) => outcome.errors.push(error),
                QueryResponse::Status(_) => {}
            }
        }

        match execution.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => outcome.error = Some(error),
            Err(join_error) => {
                outcome.error = Some(QueryError::other(format!(
                    "query execution task failed: {join_error}"
                )));
            }
        }
        if outcome.error.is_none() && self.token.is_cancelled() {
            outcome.error = Some(QueryError::other("query cancelled"));
        }
        outcome
    }
}

impl Engine {
    /// Registers a cancellation token under the query UUID so a remote
    /// `CancelQuery` can interrupt it.
    pub(crate) fn track(&self, uuid: Uuid, token: CancellationToken) {
        self.inner.tracked.write().unwrap().insert(uuid, token);
    }

    pub(crate) fn untrack(&self, uuid: Uuid) {
        self.inner.tracked.write().unwrap().remove(&uuid);
    }

    pub fn tracked_query_count(&self) -> usize {
        self.inner.tracked.read().unwrap().len()
    }

    pub fn is_tracking(&self, uuid: Uuid) -> bool {
        self.inner.tracked.read().unwrap().contains_key(&uuid)
    }

    /// Cancels the tracked query with this UUID. Returns false when nothing
    /// is tracked under it, which is routine: the query may have finished, or
    /// another engine instance may own it.
    pub fn cancel_tracked_query(&self, uuid: Uuid) -> bool {
        let token = self.inner.tracked.read().unwrap().get(&uuid).cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
