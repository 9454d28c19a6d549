use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::Query;

/// A discovered resource.
///
/// Identity is the `(type, scope, uniqueAttributeValue)` triple; everything
/// else is payload. The `unique_attribute` field names which attribute carries
/// the unique value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Item {
    #[serde(rename = "type")]
    pub item_type: String,
    pub unique_attribute: String,
    pub scope: String,
    pub attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ItemMetadata>,
}

impl Item {
    /// The value of the attribute named by `unique_attribute`, stringified.
    pub fn unique_attribute_value(&self) -> String {
        match self.attributes.get(&self.unique_attribute) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// `scope.type.uniqueAttributeValue`, unique across all sources.
    pub fn globally_unique_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.scope,
            self.item_type,
            self.unique_attribute_value()
        )
    }

    pub fn reference(&self) -> Reference {
        Reference {
            item_type: self.item_type.clone(),
            unique_attribute_value: self.unique_attribute_value(),
            scope: self.scope.clone(),
        }
    }

    /// Checks the invariants every emitted item must satisfy: a non-empty
    /// RFC 1123 type, a non-empty unique attribute value, and at least one
    /// attribute.
    pub fn validate(&self) -> ItemResult<()> {
        if self.item_type.is_empty() {
            return Err(ItemError::new(
                ItemErrorCode::EmptyType,
                "item has an empty type",
            ));
        }
        if !is_rfc1123_label(&self.item_type) {
            return Err(ItemError::new(
                ItemErrorCode::InvalidType,
                format!(
                    "item type \"{}\" is not a valid RFC 1123 label",
                    self.item_type
                ),
            ));
        }
        if self.unique_attribute_value().is_empty() {
            return Err(ItemError::new(
                ItemErrorCode::MissingUniqueAttribute,
                format!(
                    "item has no value for unique attribute \"{}\"",
                    self.unique_attribute
                ),
            ));
        }
        if self.attributes.is_empty() {
            return Err(ItemError::new(
                ItemErrorCode::EmptyAttributes,
                "item has no attributes",
            ));
        }
        Ok(())
    }
}

/// Engine-stamped provenance for an item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    pub timestamp: DateTime<Utc>,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_query: Option<Box<Query>>,
    #[serde(default)]
    pub hidden: bool,
}

/// A pointer to an item by identity, without the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(rename = "type")]
    pub item_type: String,
    pub unique_attribute_value: String,
    pub scope: String,
}

/// A relationship between two discovered items.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Edge {
    pub from: Reference,
    pub to: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blast_propagation: Option<BlastPropagation>,
}

/// How failure propagates along an edge. Carried opaquely; the engine never
/// interprets it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlastPropagation {
    pub incoming: bool,
    pub outgoing: bool,
}

/// An RFC 1123 label: 1-63 characters of lowercase alphanumerics and dashes,
/// starting and ending alphanumeric.
pub fn is_rfc1123_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemErrorCode {
    EmptyType,
    InvalidType,
    MissingUniqueAttribute,
    EmptyAttributes,
}

impl ItemErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemErrorCode::EmptyType => "item/empty-type",
            ItemErrorCode::InvalidType => "item/invalid-type",
            ItemErrorCode::MissingUniqueAttribute => "item/missing-unique-attribute",
            ItemErrorCode::EmptyAttributes => "item/empty-attributes",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ItemError {
    pub code: ItemErrorCode,
    message: String,
}

impl ItemError {
    pub fn new(code: ItemErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for ItemError {}

pub type ItemResult<T> = Result<T, ItemError>;
