use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, ErrorHandler, ItemHandler, QueryResultStream};
use crate::cache::{Cache, CacheQuery, CacheResult};
use crate::engine::Engine;
use crate::item::ItemMetadata;
use crate::logger::Logger;
use crate::query::{Query, QueryError, QueryMethod, QueryResponse, QueryResult};
use crate::runtime;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/dispatch"));

enum MethodGuard {
    Get(tokio::sync::OwnedRwLockReadGuard<()>),
    List(tokio::sync::OwnedRwLockWriteGuard<()>),
    None,
}

impl Engine {
    /// Fans a query out to every matching adapter and runs them concurrently,
    /// pushing results into `responses` as they appear. The channel closes
    /// when the last worker finishes.
    ///
    /// LIST work runs on its own pool: a LIST holds the exclusive side of the
    /// get/list mutex, so queueing it behind GETs that wait on the same key
    /// would deadlock a saturated shared pool.
    pub async fn execute_query(
        &self,
        token: &CancellationToken,
        query: &Query,
        responses: async_channel::Sender<QueryResponse>,
    ) -> QueryResult<()> {
        if token.is_cancelled() {
            return Err(QueryError::other("query context cancelled before execution"));
        }

        let expanded = self.inner.host.expand_query(query);
        if expanded.is_empty() {
            let mut error = QueryError::no_scope("no matching adapters found");
            error.scope = query.scope.clone();
            error.item_type = query.item_type.clone();
            error.uuid = query.uuid;
            error.responder_name = self.inner.config.source_name.clone();
            let _ = responses.send(QueryResponse::Error(error.clone())).await;
            return Err(error);
        }

        let live: Arc<Mutex<HashMap<usize, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut handles = Vec::with_capacity(expanded.len());

        for (index, (expanded_query, adapter)) in expanded.into_iter().enumerate() {
            live.lock().unwrap().insert(
                index,
                format!(
                    "uuid={:?} {} via {}",
                    expanded_query.uuid,
                    expanded_query.describe(),
                    adapter.name()
                ),
            );

            let engine = self.clone();
            let token = token.clone();
            let responses = responses.clone();
            let live = Arc::clone(&live);

            // Pool acquisition happens inside the worker so this loop never
            // blocks on a saturated pool.
            handles.push(tokio::spawn(async move {
                let (pool, counter) = match expanded_query.method {
                    QueryMethod::List => {
                        (&engine.inner.list_pool, &engine.inner.lists_in_flight)
                    }
                    _ => (&engine.inner.get_pool, &engine.inner.gets_in_flight),
                };
                let Ok(_permit) = Arc::clone(pool).acquire_owned().await else {
                    live.lock().unwrap().remove(&index);
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if !token.is_cancelled() {
                    engine
                        .execute(&token, &expanded_query, adapter, &responses)
                        .await;
                }
                counter.fetch_sub(1, Ordering::SeqCst);
                live.lock().unwrap().remove(&index);
            }));
        }
        drop(responses);

        let mut all = futures::future::join_all(handles);
        let results = tokio::select! {
            results = &mut all => results,
            _ = token.cancelled() => {
                // Keep waiting, but call out workers that ignore the
                // cancellation for too long.
                let grace = self.inner.config.execution_grace_period;
                let still_live = Arc::clone(&live);
                let straggler_log = tokio::spawn(async move {
                    runtime::sleep(grace).await;
                    for description in still_live.lock().unwrap().values() {
                        LOGGER.warn(format!(
                            "execution still running after cancellation grace period: {description}"
                        ));
                    }
                });
                let results = all.await;
                straggler_log.abort();
                results
            }
        };

        for result in results {
            if let Err(join_error) = result {
                if join_error.is_panic() {
                    LOGGER.error(format!("query execution worker panicked: {join_error}"));
                }
            }
        }

        if token.is_cancelled() {
            return Err(QueryError::other("query context cancelled during execution"));
        }
        Ok(())
    }

    /// Runs one `(query, adapter)` pair: get/list coordination, cache
    /// consultation, then the adapter call with validated, stamped results
    /// streaming into `responses`.
    pub(crate) async fn execute(
        &self,
        token: &CancellationToken,
        query: &Query,
        adapter: Arc<dyn Adapter>,
        responses: &async_channel::Sender<QueryResponse>,
    ) {
        let _method_guard = match query.method {
            QueryMethod::Get => MethodGuard::Get(
                self.inner
                    .get_list_mutex
                    .lock_get(&query.scope, &query.item_type)
                    .await,
            ),
            QueryMethod::List => MethodGuard::List(
                self.inner
                    .get_list_mutex
                    .lock_list(&query.scope, &query.item_type)
                    .await,
            ),
            QueryMethod::Search => MethodGuard::None,
        };

        // Surfaces adapters that hang past their deadline.
        let finished = CancellationToken::new();
        {
            let token = token.clone();
            let finished = finished.clone();
            let description = format!(
                "uuid={:?} {} via {}",
                query.uuid,
                query.describe(),
                adapter.name()
            );
            runtime::spawn_detached(async move {
                tokio::select! {
                    _ = finished.cancelled() => {}
                    _ = token.cancelled() => {
                        LOGGER.warn(format!(
                            "query context cancelled while adapter still executing: {description}"
                        ));
                    }
                }
            });
        }

        let caching = adapter
            .caching()
            .map(|caching| (caching.cache(), caching.default_cache_duration()));
        let cache_query = CacheQuery {
            source_name: adapter.name(),
            scope: query.scope.clone(),
            item_type: query.item_type.clone(),
            method: query.method,
            query: query.query.clone(),
        };

        if !query.ignore_cache {
            if let Some((cache, _)) = &caching {
                match cache.lookup(&cache_query) {
                    CacheResult::Hit(items) => {
                        for item in items {
                            let _ = responses.send(QueryResponse::Item(item)).await;
                        }
                        finished.cancel();
                        return;
                    }
                    CacheResult::HitError(mut error) => {
                        error.uuid = query.uuid;
                        error.responder_name = self.inner.config.source_name.clone();
                        let _ = responses.send(QueryResponse::Error(error)).await;
                        finished.cancel();
                        return;
                    }
                    CacheResult::Miss => {}
                }
            }
        }

        if token.is_cancelled() {
            let error = stamp_error(
                QueryError::other("query context cancelled before adapter call"),
                query,
                &adapter,
                &self.inner.config.source_name,
            );
            let _ = responses.send(QueryResponse::Error(error)).await;
            finished.cancel();
            return;
        }

        let stream = self.result_stream(query, &adapter, &caching, &cache_query, responses.clone());

        match query.method {
            QueryMethod::Get => {
                match adapter
                    .get(token, &query.scope, &query.query, query.ignore_cache)
                    .await
                {
                    Ok(item) => stream.send_item(item).await,
                    Err(error) => stream.send_error(error).await,
                }
            }
            QueryMethod::List => {
                if let Some(streaming) = adapter.streaming_list() {
                    streaming
                        .list_stream(token, &query.scope, query.ignore_cache, &stream)
                        .await;
                } else if let Some(listing) = adapter.listing() {
                    match listing.list(token, &query.scope, query.ignore_cache).await {
                        Ok(items) => {
                            for item in items {
                                stream.send_item(item).await;
                            }
                        }
                        Err(error) => stream.send_error(error).await,
                    }
                } else {
                    LOGGER.warn(format!("adapter {} does not support LIST", adapter.name()));
                }
            }
            QueryMethod::Search => {
                if let Some(streaming) = adapter.streaming_search() {
                    streaming
                        .search_stream(token, &query.scope, &query.query, query.ignore_cache, &stream)
                        .await;
                } else if let Some(searching) = adapter.searching() {
                    match searching
                        .search(token, &query.scope, &query.query, query.ignore_cache)
                        .await
                    {
                        Ok(items) => {
                            for item in items {
                                stream.send_item(item).await;
                            }
                        }
                        Err(error) => stream.send_error(error).await,
                    }
                } else {
                    LOGGER.warn(format!(
                        "adapter {} does not support SEARCH",
                        adapter.name()
                    ));
                }
            }
        }

        finished.cancel();
    }

    fn result_stream(
        &self,
        query: &Query,
        adapter: &Arc<dyn Adapter>,
        caching: &Option<(Cache, Duration)>,
        cache_query: &CacheQuery,
        responses: async_channel::Sender<QueryResponse>,
    ) -> QueryResultStream {
        let item_handler: ItemHandler = {
            let responses = responses.clone();
            let query = query.clone();
            let adapter = Arc::clone(adapter);
            let caching = caching.clone();
            let cache_query = cache_query.clone();
            let responder_name = self.inner.config.source_name.clone();
            Arc::new(move |mut item| {
                let responses = responses.clone();
                let query = query.clone();
                let adapter = Arc::clone(&adapter);
                let caching = caching.clone();
                let cache_query = cache_query.clone();
                let responder_name = responder_name.clone();
                async move {
                    if let Err(validation) = item.validate() {
                        let error = stamp_error(
                            QueryError::other(validation.to_string()),
                            &query,
                            &adapter,
                            &responder_name,
                        );
                        let _ = responses.send(QueryResponse::Error(error)).await;
                        return;
                    }
                    item.metadata = Some(ItemMetadata {
                        timestamp: Utc::now(),
                        source_name: adapter.name(),
                        source_query: Some(Box::new(query.clone())),
                        hidden: adapter.hidden(),
                    });
                    if let Some((cache, duration)) = &caching {
                        cache.store_item(item.clone(), *duration, &cache_query);
                    }
                    let _ = responses.send(QueryResponse::Item(item)).await;
                }
                .boxed()
            })
        };

        let error_handler: ErrorHandler = {
            let query = query.clone();
            let adapter = Arc::clone(adapter);
            let caching = caching.clone();
            let cache_query = cache_query.clone();
            let responder_name = self.inner.config.source_name.clone();
            Arc::new(move |error| {
                let responses = responses.clone();
                let query = query.clone();
                let adapter = Arc::clone(&adapter);
                let caching = caching.clone();
                let cache_query = cache_query.clone();
                let responder_name = responder_name.clone();
                async move {
                    let error = stamp_error(error, &query, &adapter, &responder_name);
                    if error.kind == crate::query::ErrorKind::NotFound {
                        if let Some((cache, duration)) = &caching {
                            cache.store_error(error.clone(), *duration, &cache_query);
                        }
                    }
                    let _ = responses.send(QueryResponse::Error(error)).await;
                }
                .boxed()
            })
        };

        QueryResultStream::new(item_handler, error_handler)
    }
}

/// Stamps query and adapter provenance onto an error before it is streamed.
fn stamp_error(
    mut error: QueryError,
    query: &Query,
    adapter: &Arc<dyn Adapter>,
    responder_name: &str,
) -> QueryError {
    error.scope = query.scope.clone();
    error.uuid = query.uuid;
    error.source_name = adapter.name();
    error.item_type = adapter.metadata().item_type;
    error.responder_name = responder_name.to_string();
    error
}
