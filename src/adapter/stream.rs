use std::sync::{Arc, LazyLock, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::item::Item;
use crate::logger::Logger;
use crate::query::QueryError;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/result-stream"));

pub type ItemHandler = Arc<dyn Fn(Item) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(QueryError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Sink for the items and errors produced by a single adapter call.
///
/// Both send methods are safe to call from concurrent tasks; ordering is only
/// defined between calls that do not overlap. A panicking handler is contained
/// and logged, never propagated into the adapter.
pub struct QueryResultStream {
    item_handler: ItemHandler,
    error_handler: ErrorHandler,
}

impl QueryResultStream {
    pub fn new(item_handler: ItemHandler, error_handler: ErrorHandler) -> Self {
        Self {
            item_handler,
            error_handler,
        }
    }

    /// Recording variant for adapter tests: everything sent is captured
    /// instead of dispatched.
    pub fn recording() -> (Self, RecordedResults) {
        let recorded = RecordedResults::default();
        let items = Arc::clone(&recorded.items);
        let errors = Arc::clone(&recorded.errors);
        let stream = Self::new(
            Arc::new(move |item| {
                let items = Arc::clone(&items);
                async move {
                    items.lock().unwrap().push(item);
                }
                .boxed()
            }),
            Arc::new(move |error| {
                let errors = Arc::clone(&errors);
                async move {
                    errors.lock().unwrap().push(error);
                }
                .boxed()
            }),
        );
        (stream, recorded)
    }

    pub async fn send_item(&self, item: Item) {
        let future = (self.item_handler)(item);
        if std::panic::AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .is_err()
        {
            LOGGER.error("item handler panicked; discarding result");
        }
    }

    pub async fn send_error(&self, error: QueryError) {
        let future = (self.error_handler)(error);
        if std::panic::AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .is_err()
        {
            LOGGER.error("error handler panicked; discarding result");
        }
    }
}

/// Shared capture buffers backing [`QueryResultStream::recording`].
#[derive(Clone, Default)]
pub struct RecordedResults {
    items: Arc<Mutex<Vec<Item>>>,
    errors: Arc<Mutex<Vec<QueryError>>>,
}

impl RecordedResults {
    pub fn items(&self) -> Vec<Item> {
        self.items.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<QueryError> {
        self.errors.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(name: &str) -> Item {
        let mut attributes = serde_json::Map::new();
        attributes.insert("name".to_string(), json!(name));
        Item {
            item_type: "person".to_string(),
            unique_attribute: "name".to_string(),
            scope: "test".to_string(),
            attributes,
            metadata: None,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recording_stream_captures_everything() {
        let (stream, recorded) = QueryResultStream::recording();
        stream.send_item(item("Dylan")).await;
        stream.send_item(item("Robin")).await;
        stream.send_error(QueryError::not_found("no items found")).await;

        assert_eq!(recorded.items().len(), 2);
        assert_eq!(recorded.errors().len(), 1);
        assert_eq!(recorded.items()[0].unique_attribute_value(), "Dylan");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_sends_are_all_delivered() {
        let (stream, recorded) = QueryResultStream::recording();
        let stream = Arc::new(stream);

        let mut handles = Vec::new();
        for i in 0..16 {
            let stream = Arc::clone(&stream);
            handles.push(tokio::spawn(async move {
                stream.send_item(item(&format!("person-{i}"))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(recorded.items().len(), 16);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_panic_is_contained() {
        let stream = QueryResultStream::new(
            Arc::new(|_| async { panic!("handler exploded") }.boxed()),
            Arc::new(|_| async {}.boxed()),
        );
        // Must not unwind into the caller.
        stream.send_item(item("Dylan")).await;
    }
}
