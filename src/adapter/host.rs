use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, WILDCARD};
use crate::cache::DEFAULT_PURGE_INTERVAL;
use crate::logger::Logger;
use crate::query::Query;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@discovery/adapter-host"));

/// Registry of the adapters an engine serves.
///
/// Besides bookkeeping, the host owns query expansion: resolving type and
/// scope wildcards into the concrete `(query, adapter)` pairs that will
/// actually run. The `type → scopes` index makes duplicate registration an
/// O(1) check per scope.
#[derive(Default)]
pub struct AdapterHost {
    inner: RwLock<HostInner>,
}

#[derive(Default)]
struct HostInner {
    adapters: Vec<Arc<dyn Adapter>>,
    index: HashMap<String, HashSet<String>>,
}

impl AdapterHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a batch of adapters.
    ///
    /// The whole batch is checked for `(type, scope)` overlap, against the
    /// existing registry and within the batch itself, before anything is
    /// inserted, so a rejected call leaves the registry untouched.
    pub fn add_adapters(&self, new: Vec<Arc<dyn Adapter>>) -> HostResult<()> {
        let mut inner = self.inner.write().unwrap();

        let mut staged: HashMap<String, HashSet<String>> = HashMap::new();
        for adapter in &new {
            let item_type = adapter.item_type();
            for scope in adapter.scopes() {
                let registered = inner
                    .index
                    .get(&item_type)
                    .is_some_and(|scopes| scopes.contains(&scope));
                let in_batch = staged
                    .get(&item_type)
                    .is_some_and(|scopes| scopes.contains(&scope));
                if registered || in_batch {
                    return Err(HostError::DuplicateAdapter {
                        item_type,
                        scope,
                        name: adapter.name(),
                    });
                }
                staged.entry(item_type.clone()).or_default().insert(scope);
            }
        }

        for (item_type, scopes) in staged {
            inner.index.entry(item_type).or_default().extend(scopes);
        }
        for adapter in new {
            LOGGER.debug(format!(
                "registered adapter {} for type {}",
                adapter.name(),
                adapter.item_type()
            ));
            inner.adapters.push(adapter);
        }
        Ok(())
    }

    pub fn adapters(&self) -> Vec<Arc<dyn Adapter>> {
        self.inner.read().unwrap().adapters.clone()
    }

    /// Adapters that are not hidden; the set wildcards expand over and the
    /// set whose scopes appear in heartbeats.
    pub fn visible_adapters(&self) -> Vec<Arc<dyn Adapter>> {
        self.inner
            .read()
            .unwrap()
            .adapters
            .iter()
            .filter(|adapter| !adapter.hidden())
            .cloned()
            .collect()
    }

    /// Removes all adapters with the given name. Returns true when anything
    /// was removed.
    pub fn remove_adapter(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.adapters.len();
        inner.adapters.retain(|adapter| adapter.name() != name);
        let removed = inner.adapters.len() != before;
        if removed {
            inner.rebuild_index();
        }
        removed
    }

    pub fn clear_adapters(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.adapters.clear();
        inner.index.clear();
    }

    /// Resolves a query's wildcards into the concrete `(query, adapter)` pairs
    /// that will run.
    ///
    /// Every emitted clone carries the adapter's concrete type. Scopes stay
    /// wildcard only for adapters that declared wildcard-scope support. An
    /// adapter scope matches when it equals `*`, when the query scope is `*`
    /// (visible adapters only), or when it contains the query scope as a
    /// substring.
    pub fn expand_query(&self, query: &Query) -> Vec<(Query, Arc<dyn Adapter>)> {
        let candidates: Vec<Arc<dyn Adapter>> = if query.item_type == WILDCARD {
            self.visible_adapters()
        } else {
            self.inner
                .read()
                .unwrap()
                .adapters
                .iter()
                .filter(|adapter| adapter.item_type() == query.item_type)
                .cloned()
                .collect()
        };

        let mut expanded = Vec::new();
        for adapter in candidates {
            let hidden = adapter.hidden();

            if adapter.supports_wildcard_scope() && query.scope == WILDCARD && !hidden {
                let mut clone = query.clone();
                clone.item_type = adapter.item_type();
                expanded.push((clone, adapter));
                continue;
            }

            for adapter_scope in adapter.scopes() {
                let matched = adapter_scope == WILDCARD
                    || (query.scope == WILDCARD && !hidden)
                    || adapter_scope.contains(&query.scope);
                if !matched {
                    continue;
                }
                let mut clone = query.clone();
                clone.item_type = adapter.item_type();
                clone.scope = if adapter_scope == WILDCARD {
                    query.scope.clone()
                } else {
                    adapter_scope.clone()
                };
                expanded.push((clone, Arc::clone(&adapter)));
            }
        }
        expanded
    }

    pub fn purge_caches(&self, now: DateTime<Utc>) {
        for adapter in self.adapters() {
            if let Some(caching) = adapter.caching() {
                caching.cache().purge(now);
            }
        }
    }

    pub fn clear_caches(&self) {
        for adapter in self.adapters() {
            if let Some(caching) = adapter.caching() {
                caching.cache().clear();
            }
        }
    }

    /// Starts a background purger per caching adapter; all of them stop when
    /// the token is cancelled.
    pub fn start_purgers(&self, token: &CancellationToken, interval: Option<Duration>) {
        let interval = interval.unwrap_or(DEFAULT_PURGE_INTERVAL);
        for adapter in self.adapters() {
            if let Some(caching) = adapter.caching() {
                caching.cache().start_purger(token.child_token(), interval);
            }
        }
    }
}

impl HostInner {
    fn rebuild_index(&mut self) {
        self.index.clear();
        for adapter in &self.adapters {
            let entry = self.index.entry(adapter.item_type()).or_default();
            entry.extend(adapter.scopes());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostError {
    DuplicateAdapter {
        item_type: String,
        scope: String,
        name: String,
    },
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::DuplicateAdapter {
                item_type,
                scope,
                name,
            } => write!(
                f,
                "adapter {name} replicates existing (type, scope) pair ({item_type}, {scope})"
            ),
        }
    }
}

impl std::error::Error for HostError {}

pub type HostResult<T> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterMetadata;
    use crate::item::Item;
    use crate::query::{QueryError, QueryMethod, QueryResult};
    use async_trait::async_trait;

    struct StubAdapter {
        item_type: String,
        name: String,
        scopes: Vec<String>,
        hidden: bool,
        wildcard_scope: bool,
    }

    impl StubAdapter {
        fn new(item_type: &str, scopes: &[&str]) -> Arc<dyn Adapter> {
            Arc::new(Self {
                item_type: item_type.to_string(),
                name: format!("{item_type}-adapter"),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                hidden: false,
                wildcard_scope: false,
            })
        }

        fn hidden(item_type: &str, scopes: &[&str]) -> Arc<dyn Adapter> {
            Arc::new(Self {
                item_type: item_type.to_string(),
                name: format!("{item_type}-hidden-adapter"),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                hidden: true,
                wildcard_scope: false,
            })
        }

        fn wildcard(item_type: &str) -> Arc<dyn Adapter> {
            Arc::new(Self {
                item_type: item_type.to_string(),
                name: format!("{item_type}-wildcard-adapter"),
                scopes: vec!["account-a".to_string(), "account-b".to_string()],
                hidden: false,
                wildcard_scope: true,
            })
        }
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn item_type(&self) -> String {
            self.item_type.clone()
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        fn scopes(&self) -> Vec<String> {
            self.scopes.clone()
        }

        fn metadata(&self) -> AdapterMetadata {
            AdapterMetadata {
                item_type: self.item_type.clone(),
                descriptive_name: self.name.clone(),
                supported_query_methods: vec![QueryMethod::Get],
            }
        }

        async fn get(
            &self,
            _token: &CancellationToken,
            _scope: &str,
            _query: &str,
            _ignore_cache: bool,
        ) -> QueryResult<Item> {
            Err(QueryError::not_found("no items found"))
        }

        fn hidden(&self) -> bool {
            self.hidden
        }

        fn supports_wildcard_scope(&self) -> bool {
            self.wildcard_scope
        }
    }

    fn query(item_type: &str, scope: &str) -> Query {
        Query {
            item_type: item_type.to_string(),
            scope: scope.to_string(),
            method: QueryMethod::Get,
            query: "x".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_scope_rejects_whole_batch() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::new("person", &["test"])])
            .unwrap();

        let err = host
            .add_adapters(vec![
                StubAdapter::new("dog", &["test"]),
                StubAdapter::new("person", &["test", "other"]),
            ])
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateAdapter { .. }));

        // Nothing from the failed batch may be visible.
        assert_eq!(host.adapters().len(), 1);
        assert!(host.expand_query(&query("dog", "test")).is_empty());
    }

    #[test]
    fn intra_batch_duplicates_detected() {
        let host = AdapterHost::new();
        let err = host
            .add_adapters(vec![
                StubAdapter::new("person", &["test"]),
                StubAdapter::new("person", &["test"]),
            ])
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateAdapter { .. }));
        assert!(host.adapters().is_empty());
    }

    #[test]
    fn wildcard_type_fans_out_to_all_visible() {
        let host = AdapterHost::new();
        host.add_adapters(vec![
            StubAdapter::new("person", &["test1", "test2"]),
            StubAdapter::new("dog", &["test1", "testA", "testB"]),
        ])
        .unwrap();

        let expanded = host.expand_query(&query("*", "test1"));
        assert_eq!(expanded.len(), 2);
        for (clone, adapter) in &expanded {
            assert_ne!(clone.item_type, "*");
            assert_eq!(clone.item_type, adapter.item_type());
            assert_eq!(clone.scope, "test1");
        }
    }

    #[test]
    fn wildcard_scope_enumerates_concrete_scopes() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::new("person", &["test1", "test2"])])
            .unwrap();

        let expanded = host.expand_query(&query("person", "*"));
        let mut scopes: Vec<String> = expanded.iter().map(|(q, _)| q.scope.clone()).collect();
        scopes.sort();
        assert_eq!(scopes, ["test1", "test2"]);
    }

    #[test]
    fn wildcard_scope_capable_adapter_gets_single_wildcard_clone() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::wildcard("person")]).unwrap();

        let expanded = host.expand_query(&query("person", "*"));
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].0.scope, "*");
    }

    #[test]
    fn adapter_wildcard_scope_keeps_query_scope() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::new("person", &["*"])]).unwrap();

        let expanded = host.expand_query(&query("person", "anything"));
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].0.scope, "anything");
    }

    #[test]
    fn substring_scope_match_fans_out() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::new("person", &["multiA", "multiB"])])
            .unwrap();

        let expanded = host.expand_query(&query("person", "multi"));
        let mut scopes: Vec<String> = expanded.iter().map(|(q, _)| q.scope.clone()).collect();
        scopes.sort();
        assert_eq!(scopes, ["multiA", "multiB"]);
    }

    #[test]
    fn hidden_adapters_invisible_to_wildcards() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::hidden("secret", &["test"])])
            .unwrap();

        assert!(host.expand_query(&query("*", "test")).is_empty());
        assert!(host.expand_query(&query("secret", "*")).is_empty());

        let exact = host.expand_query(&query("secret", "test"));
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn remove_adapter_unregisters_its_pairs() {
        let host = AdapterHost::new();
        host.add_adapters(vec![StubAdapter::new("person", &["test"])])
            .unwrap();
        assert!(host.remove_adapter("person-adapter"));

        // The (type, scope) pair is free again.
        host.add_adapters(vec![StubAdapter::new("person", &["test"])])
            .unwrap();
        assert!(!host.remove_adapter("no-such-adapter"));
    }
}
