mod host;
mod stream;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::item::Item;
use crate::query::{QueryMethod, QueryResult};

#[doc(inline)]
pub use host::{AdapterHost, HostError, HostResult};
#[doc(inline)]
pub use stream::{ErrorHandler, ItemHandler, QueryResultStream, RecordedResults};

/// The wildcard token accepted for query types and scopes, and usable as an
/// adapter scope to mean "serves every scope".
pub const WILDCARD: &str = "*";

/// How long cached results live when a caching adapter does not say otherwise.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(10 * 60);

/// A discovery plugin answering queries for one resource type over one or
/// more scopes.
///
/// `get` is the only mandatory operation. Everything else is a capability the
/// engine feature-detects through the accessor methods: an adapter that can
/// enumerate implements [`ListAdapter`] and overrides `listing`; one that can
/// stream overrides `streaming_list`, which the engine prefers when both are
/// present. Implementations must watch the cancellation token and abandon
/// outbound work when it fires.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The RFC 1123 type of item this adapter returns.
    fn item_type(&self) -> String;

    /// Descriptive name, unique within the engine, stamped into item metadata.
    fn name(&self) -> String;

    /// The scopes this adapter serves. The single element `*` means "all
    /// scopes, not enumerable".
    fn scopes(&self) -> Vec<String>;

    fn metadata(&self) -> AdapterMetadata;

    async fn get(
        &self,
        token: &CancellationToken,
        scope: &str,
        query: &str,
        ignore_cache: bool,
    ) -> QueryResult<Item>;

    fn listing(&self) -> Option<&dyn ListAdapter> {
        None
    }

    fn searching(&self) -> Option<&dyn SearchAdapter> {
        None
    }

    fn streaming_list(&self) -> Option<&dyn StreamingListAdapter> {
        None
    }

    fn streaming_search(&self) -> Option<&dyn StreamingSearchAdapter> {
        None
    }

    fn caching(&self) -> Option<&dyn CachingAdapter> {
        None
    }

    /// Hidden adapters are reachable only by exact `(type, scope)` match and
    /// are excluded from wildcard expansion and heartbeat scope reports.
    fn hidden(&self) -> bool {
        false
    }

    /// True when the adapter can answer a `scope = "*"` query directly,
    /// without the engine enumerating its scopes.
    fn supports_wildcard_scope(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait ListAdapter: Send + Sync {
    async fn list(
        &self,
        token: &CancellationToken,
        scope: &str,
        ignore_cache: bool,
    ) -> QueryResult<Vec<Item>>;
}

#[async_trait]
pub trait SearchAdapter: Send + Sync {
    async fn search(
        &self,
        token: &CancellationToken,
        scope: &str,
        query: &str,
        ignore_cache: bool,
    ) -> QueryResult<Vec<Item>>;
}

#[async_trait]
pub trait StreamingListAdapter: Send + Sync {
    async fn list_stream(
        &self,
        token: &CancellationToken,
        scope: &str,
        ignore_cache: bool,
        stream: &QueryResultStream,
    );
}

#[async_trait]
pub trait StreamingSearchAdapter: Send + Sync {
    async fn search_stream(
        &self,
        token: &CancellationToken,
        scope: &str,
        query: &str,
        ignore_cache: bool,
        stream: &QueryResultStream,
    );
}

/// Adapters expose their cache so the engine can serve repeat queries without
/// another backend round-trip, and so lifecycle operations can purge them.
pub trait CachingAdapter: Send + Sync {
    fn cache(&self) -> Cache;

    fn default_cache_duration(&self) -> Duration {
        DEFAULT_CACHE_DURATION
    }
}

/// Static description of an adapter, reported in heartbeats.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterMetadata {
    #[serde(rename = "type")]
    pub item_type: String,
    pub descriptive_name: String,
    pub supported_query_methods: Vec<QueryMethod>,
}
