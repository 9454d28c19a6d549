use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::item::Item;
use crate::query::{QueryError, QueryMethod};
use crate::runtime;

/// How often a background purger sweeps expired entries.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Per-adapter TTL cache for query results.
///
/// Items are indexed by `(sourceName, scope, type)` plus their unique
/// attribute value and the `(method, query)` of the call that produced them.
/// A GET lookup matches any unexpired item with the requested unique attribute
/// value regardless of which method stored it, so a LIST populates the cache
/// for the GETs that follow it. LIST and SEARCH lookups replay exactly the
/// items their own earlier invocation stored. Negative entries are whole
/// `QueryError`s keyed by the producing call.
///
/// The cache stores whatever it is handed; which error kinds are worth storing
/// is the caller's policy.
#[derive(Clone, Default)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: Mutex<Vec<CacheEntry>>,
}

/// Identifies one adapter call for lookup and store purposes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheQuery {
    pub source_name: String,
    pub scope: String,
    pub item_type: String,
    pub method: QueryMethod,
    pub query: String,
}

/// Outcome of a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheResult {
    Miss,
    Hit(Vec<Item>),
    HitError(QueryError),
}

struct CacheEntry {
    expires_at: DateTime<Utc>,
    source_name: String,
    scope: String,
    item_type: String,
    method: QueryMethod,
    query: String,
    payload: CachedPayload,
}

enum CachedPayload {
    Item {
        unique_attribute_value: String,
        item: Item,
    },
    Error(QueryError),
}

impl CacheEntry {
    fn matches_call(&self, cq: &CacheQuery) -> bool {
        self.source_name == cq.source_name
            && self.scope == cq.scope
            && self.item_type == cq.item_type
            && self.method == cq.method
            && self.query == cq.query
    }

    fn matches_identity(&self, cq: &CacheQuery) -> bool {
        self.source_name == cq.source_name
            && self.scope == cq.scope
            && self.item_type == cq.item_type
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, cq: &CacheQuery) -> CacheResult {
        let now = Utc::now();
        let entries = self.inner.entries.lock().unwrap();

        for entry in entries.iter() {
            if entry.expires_at <= now {
                continue;
            }
            if let CachedPayload::Error(error) = &entry.payload {
                if entry.matches_call(cq) {
                    return CacheResult::HitError(error.clone());
                }
            }
        }

        let mut items = Vec::new();
        for entry in entries.iter() {
            if entry.expires_at <= now {
                continue;
            }
            let CachedPayload::Item {
                unique_attribute_value,
                item,
            } = &entry.payload
            else {
                continue;
            };
            let hit = match cq.method {
                QueryMethod::Get => {
                    entry.matches_identity(cq) && *unique_attribute_value == cq.query
                }
                QueryMethod::List => entry.matches_identity(cq) && entry.method == QueryMethod::List,
                QueryMethod::Search => entry.matches_call(cq),
            };
            if hit {
                items.push(item.clone());
                if cq.method == QueryMethod::Get {
                    break;
                }
            }
        }

        if items.is_empty() {
            CacheResult::Miss
        } else {
            CacheResult::Hit(items)
        }
    }

    /// Stores one item produced by the call described in `cq`, replacing any
    /// previous entry for the same item identity.
    pub fn store_item(&self, item: Item, duration: Duration, cq: &CacheQuery) {
        let unique_attribute_value = item.unique_attribute_value();
        let mut entries = self.inner.entries.lock().unwrap();
        entries.retain(|entry| match &entry.payload {
            CachedPayload::Item {
                unique_attribute_value: existing,
                ..
            } => !(entry.matches_identity(cq) && *existing == unique_attribute_value),
            CachedPayload::Error(_) => true,
        });
        entries.push(CacheEntry {
            expires_at: Utc::now() + to_chrono(duration),
            source_name: cq.source_name.clone(),
            scope: cq.scope.clone(),
            item_type: cq.item_type.clone(),
            method: cq.method,
            query: cq.query.clone(),
            payload: CachedPayload::Item {
                unique_attribute_value,
                item,
            },
        });
    }

    /// Stores a negative result for the call described in `cq`, replacing any
    /// previous negative entry for the same call.
    pub fn store_error(&self, error: QueryError, duration: Duration, cq: &CacheQuery) {
        let mut entries = self.inner.entries.lock().unwrap();
        entries.retain(|entry| match entry.payload {
            CachedPayload::Error(_) => !entry.matches_call(cq),
            CachedPayload::Item { .. } => true,
        });
        entries.push(CacheEntry {
            expires_at: Utc::now() + to_chrono(duration),
            source_name: cq.source_name.clone(),
            scope: cq.scope.clone(),
            item_type: cq.item_type.clone(),
            method: cq.method,
            query: cq.query.clone(),
            payload: CachedPayload::Error(error),
        });
    }

    /// Drops every entry whose expiry is at or before `now`.
    pub fn purge(&self, now: DateTime<Utc>) {
        self.inner
            .entries
            .lock()
            .unwrap()
            .retain(|entry| entry.expires_at > now);
    }

    pub fn clear(&self) {
        self.inner.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps expired entries every `interval` until the token is cancelled.
    pub fn start_purger(&self, token: CancellationToken, interval: Duration) {
        let cache = self.clone();
        runtime::spawn_detached(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = runtime::sleep(interval) => cache.purge(Utc::now()),
                }
            }
        });
    }
}
