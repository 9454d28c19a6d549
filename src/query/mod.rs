use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{Edge, Item};

/// A typed request for items of one type in one scope.
///
/// `type` and `scope` accept the `*` wildcard; expansion resolves wildcards to
/// concrete adapters before any adapter runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(rename = "type")]
    pub item_type: String,
    pub scope: String,
    pub method: QueryMethod,
    pub query: String,
    pub ignore_cache: bool,
    pub recursion_behaviour: RecursionBehaviour,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reply_subject: String,
}

impl Query {
    /// Short human form used in logs: `GET person.test "Dylan"`.
    pub fn describe(&self) -> String {
        format!(
            "{} {}.{} {:?}",
            self.method.as_str(),
            self.item_type,
            self.scope,
            self.query
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "LIST")]
    List,
    #[serde(rename = "SEARCH")]
    Search,
}

impl QueryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::Get => "GET",
            QueryMethod::List => "LIST",
            QueryMethod::Search => "SEARCH",
        }
    }
}

impl fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far link-following recursion should go. The engine carries this
/// opaquely for clients that correlate results downstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecursionBehaviour {
    pub link_depth: u32,
    pub follow_only_blast_propagation: bool,
}

/// Remote request to cancel a tracked query by UUID.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
}

/// Classification of query errors. Only `NotFound` is cacheable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "NOTFOUND")]
    NotFound,
    #[serde(rename = "NOSCOPE")]
    NoScope,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[default]
    #[serde(rename = "OTHER")]
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOTFOUND",
            ErrorKind::NoScope => "NOSCOPE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed error for one query against one adapter.
///
/// Adapters populate `kind` and `error_string`; the engine stamps the
/// remaining provenance fields before the error reaches the reply subject.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(rename = "errorType")]
    pub kind: ErrorKind,
    pub error_string: String,
    pub scope: String,
    pub source_name: String,
    pub item_type: String,
    pub responder_name: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, error_string: impl Into<String>) -> Self {
        Self {
            kind,
            error_string: error_string.into(),
            ..Default::default()
        }
    }

    pub fn not_found(error_string: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, error_string)
    }

    pub fn no_scope(error_string: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoScope, error_string)
    }

    pub fn timeout(error_string: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, error_string)
    }

    pub fn other(error_string: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, error_string)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error_string)?;
        if !self.scope.is_empty() || !self.item_type.is_empty() {
            write!(f, " ({}.{})", self.item_type, self.scope)?;
        }
        Ok(())
    }
}

impl std::error::Error for QueryError {}

pub type QueryResult<T> = Result<T, QueryError>;

/// One frame on a query's reply subject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryResponse {
    #[serde(rename = "newItem")]
    Item(Item),
    #[serde(rename = "edge")]
    Edge(Edge),
    #[serde(rename = "error")]
    Error(QueryError),
    #[serde(rename = "status")]
    Status(StatusMessage),
}

/// Lifecycle frame: exactly one `Started` at the beginning and exactly one
/// terminal (`Done` | `Cancelled` | `Errored`) at the end of every answered
/// query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusMessage {
    pub responder_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_uuid: Option<Uuid>,
    pub status: ResponseStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[default]
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "ERRORED")]
    Errored,
}
