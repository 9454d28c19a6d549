#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use discovery_source::adapter::{
    Adapter, AdapterMetadata, CachingAdapter, ListAdapter, SearchAdapter,
};
use discovery_source::bus::memory::MemoryBus;
use discovery_source::cache::Cache;
use discovery_source::engine::{
    Engine, EngineConfig, HeartbeatPayload, ManagementClient, ManagementResult,
};
use discovery_source::item::Item;
use discovery_source::query::{
    Query, QueryError, QueryMethod, QueryResponse, QueryResult,
};

pub const ENGINE_NAME: &str = "engine-test";

/// Configurable adapter for driving the engine in tests.
///
/// Scope conventions: `empty` answers GET with a `NOTFOUND` error, `error`
/// with an `OTHER` error; everything else returns a person item named by the
/// query. LIST returns Dylan and Robin.
pub struct TestAdapter {
    item_type: String,
    scopes: Vec<String>,
    cache: Cache,
    cache_duration: Duration,
    hidden: bool,
    wildcard_scope: bool,
    get_delay: Option<Duration>,
    list_delay: Option<Duration>,
    panic_on_get: bool,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl TestAdapter {
    pub fn new(item_type: &str, scopes: &[&str]) -> Self {
        Self {
            item_type: item_type.to_string(),
            scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
            cache: Cache::new(),
            cache_duration: Duration::from_millis(100),
            hidden: false,
            wildcard_scope: false,
            get_delay: None,
            list_delay: None,
            panic_on_get: false,
            get_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }

    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = Some(delay);
        self
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn with_hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_wildcard_scope(mut self) -> Self {
        self.wildcard_scope = true;
        self
    }

    pub fn with_panic_on_get(mut self) -> Self {
        self.panic_on_get = true;
        self
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn item(&self, scope: &str, name: &str) -> Item {
        let mut attributes = serde_json::Map::new();
        attributes.insert("name".to_string(), json!(name));
        attributes.insert("age".to_string(), json!(31));
        Item {
            item_type: self.item_type.clone(),
            unique_attribute: "name".to_string(),
            scope: scope.to_string(),
            attributes,
            metadata: None,
        }
    }

    async fn wait(&self, token: &CancellationToken, delay: Option<Duration>) -> QueryResult<()> {
        let Some(delay) = delay else { return Ok(()) };
        tokio::select! {
            _ = token.cancelled() => Err(QueryError::other("cancelled mid-flight")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl Adapter for TestAdapter {
    fn item_type(&self) -> String {
        self.item_type.clone()
    }

    fn name(&self) -> String {
        format!("testAdapter-{}", self.item_type)
    }

    fn scopes(&self) -> Vec<String> {
        self.scopes.clone()
    }

    fn metadata(&self) -> AdapterMetadata {
        AdapterMetadata {
            item_type: self.item_type.clone(),
            descriptive_name: self.name(),
            supported_query_methods: vec![
                QueryMethod::Get,
                QueryMethod::List,
                QueryMethod::Search,
            ],
        }
    }

    async fn get(
        &self,
        token: &CancellationToken,
        scope: &str,
        query: &str,
        _ignore_cache: bool,
    ) -> QueryResult<Item> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_get {
            panic!("adapter exploded");
        }
        self.wait(token, self.get_delay).await?;
        match scope {
            "empty" => Err(QueryError::not_found("no items found")),
            "error" => Err(QueryError::other("Error for testing")),
            _ => Ok(self.item(scope, query)),
        }
    }

    fn listing(&self) -> Option<&dyn ListAdapter> {
        Some(self)
    }

    fn searching(&self) -> Option<&dyn SearchAdapter> {
        Some(self)
    }

    fn caching(&self) -> Option<&dyn CachingAdapter> {
        Some(self)
    }

    fn hidden(&self) -> bool {
        self.hidden
    }

    fn supports_wildcard_scope(&self) -> bool {
        self.wildcard_scope
    }
}

#[async_trait]
impl ListAdapter for TestAdapter {
    async fn list(
        &self,
        token: &CancellationToken,
        scope: &str,
        _ignore_cache: bool,
    ) -> QueryResult<Vec<Item>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.wait(token, self.list_delay).await?;
        match scope {
            "empty" => Ok(Vec::new()),
            "error" => Err(QueryError::other("Error for testing")),
            _ => Ok(vec![self.item(scope, "Dylan"), self.item(scope, "Robin")]),
        }
    }
}

#[async_trait]
impl SearchAdapter for TestAdapter {
    async fn search(
        &self,
        token: &CancellationToken,
        scope: &str,
        query: &str,
        _ignore_cache: bool,
    ) -> QueryResult<Vec<Item>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.wait(token, None).await?;
        match scope {
            "empty" => Err(QueryError::not_found("no items found")),
            _ => Ok(vec![self.item(scope, query)]),
        }
    }
}

impl CachingAdapter for TestAdapter {
    fn cache(&self) -> Cache {
        self.cache.clone()
    }

    fn default_cache_duration(&self) -> Duration {
        self.cache_duration
    }
}

/// Heartbeat sink capturing every payload.
#[derive(Clone, Default)]
pub struct RecordingManagementClient {
    heartbeats: Arc<Mutex<Vec<HeartbeatPayload>>>,
}

impl RecordingManagementClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatPayload> {
        self.heartbeats.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManagementClient for RecordingManagementClient {
    async fn submit_source_heartbeat(&self, heartbeat: HeartbeatPayload) -> ManagementResult<()> {
        self.heartbeats.lock().unwrap().push(heartbeat);
        Ok(())
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        source_name: ENGINE_NAME.to_string(),
        engine_type: "test".to_string(),
        max_parallel_executions: 8,
        heartbeat_frequency: Duration::ZERO,
        ..Default::default()
    }
}

/// An engine with no bus: queries are driven directly through
/// `execute_query` / `handle_query`.
pub fn local_engine() -> Engine {
    Engine::with_connector(test_config(), None, None).expect("engine config must validate")
}

/// An engine wired to the in-memory bus.
pub fn bus_engine(bus: &MemoryBus, config: EngineConfig) -> Engine {
    Engine::with_connector(config, Some(Arc::new(bus.connector())), None)
        .expect("engine config must validate")
}

pub fn get_query(item_type: &str, scope: &str, query: &str) -> Query {
    Query {
        item_type: item_type.to_string(),
        scope: scope.to_string(),
        method: QueryMethod::Get,
        query: query.to_string(),
        ..Default::default()
    }
}

pub fn list_query(item_type: &str, scope: &str) -> Query {
    Query {
        item_type: item_type.to_string(),
        scope: scope.to_string(),
        method: QueryMethod::List,
        ..Default::default()
    }
}

/// Runs a query to completion against the engine, returning collected items
/// and errors plus the execution result.
pub async fn run_query(
    engine: &Engine,
    query: &Query,
) -> (Vec<Item>, Vec<QueryError>, QueryResult<()>) {
    let (sender, receiver) = async_channel::bounded::<QueryResponse>(1);
    let drain = tokio::spawn(async move {
        let mut items = Vec::new();
        let mut errors = Vec::new();
        while let Ok(response) = receiver.recv().await {
            match response {
                QueryResponse::Item(item) => items.push(item),
                QueryResponse::Error(error) => errors.push(error),
                _ => {}
            }
        }
        (items, errors)
    });

    let token = CancellationToken::new();
    let result = engine.execute_query(&token, query, sender).await;
    let (items, errors) = drain.await.expect("drain task must not panic");
    (items, errors, result)
}
