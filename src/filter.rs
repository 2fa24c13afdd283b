//! Query filter normalisation.
//!
//! Every `_id` leaf of a filter that is still a plain string is coerced into an
//! [`ObjectId`]: a scalar `_id`, the members of `$in` / `$nin`, and the members of a
//! positional list. Other fields are never touched. Logical operators (`$and`, `$or`,
//! `$nor`) are descended into so that their sub-filters get the same treatment.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::DbError;

pub const ID_FIELD: &str = "_id";

/// A filter as the caller built it.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Built programmatically, usually with `doc!`.
    Document(Document),
    /// Deserialized from a request payload.
    Object(Map<String, JsonValue>),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Document(Document::new())
    }
}

impl From<Document> for Filter {
    fn from(doc: Document) -> Self {
        Filter::Document(doc)
    }
}

impl From<Map<String, JsonValue>> for Filter {
    fn from(map: Map<String, JsonValue>) -> Self {
        Filter::Object(map)
    }
}

impl Filter {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the object variant from any value that serializes to a map.
    pub fn object<T: Serialize>(value: &T) -> Result<Self, DbError> {
        match serde_json::to_value(value) {
            Ok(JsonValue::Object(map)) => Ok(Filter::Object(map)),
            Ok(JsonValue::Null) => Ok(Filter::Object(Map::new())),
            Ok(other) => Err(DbError::Configuration(format!(
                "filter must serialize to an object, got {other}"
            ))),
            Err(e) => Err(DbError::Configuration(format!("invalid filter: {e}"))),
        }
    }

    pub fn normalize(self) -> Result<Document, DbError> {
        match self {
            Filter::Document(doc) => normalize_document(doc),
            Filter::Object(map) => normalize_object(map),
        }
    }
}

/// Parses a hex string into an identifier.
pub fn coerce_id(value: &str) -> Result<ObjectId, DbError> {
    ObjectId::parse_str(value)
        .map_err(|e| DbError::Configuration(format!("invalid object id `{value}`: {e}")))
}

pub fn normalize_document(mut filter: Document) -> Result<Document, DbError> {
    for (key, value) in filter.iter_mut() {
        match key.as_str() {
            ID_FIELD => coerce_id_value(value)?,
            "$and" | "$or" | "$nor" => {
                if let Bson::Array(clauses) = value {
                    for clause in clauses.iter_mut() {
                        if let Bson::Document(sub) = clause {
                            *sub = normalize_document(std::mem::take(sub))?;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(filter)
}

pub fn normalize_object(filter: Map<String, JsonValue>) -> Result<Document, DbError> {
    let doc = bson::to_document(&filter)
        .map_err(|e| DbError::Configuration(format!("invalid filter: {e}")))?;
    normalize_document(doc)
}

fn coerce_id_value(value: &mut Bson) -> Result<(), DbError> {
    match value {
        Bson::Document(operators) => {
            for (key, operand) in operators.iter_mut() {
                match key.as_str() {
                    "$in" | "$nin" => {
                        if let Bson::Array(items) = operand {
                            for item in items.iter_mut() {
                                coerce_scalar(item)?;
                            }
                        }
                    }
                    // positional keys, e.g. {"0": "...", "1": "..."}
                    k if k.parse::<usize>().is_ok() => coerce_scalar(operand)?,
                    _ => {}
                }
            }
            Ok(())
        }
        Bson::Array(items) => {
            for item in items.iter_mut() {
                coerce_scalar(item)?;
            }
            Ok(())
        }
        other => coerce_scalar(other),
    }
}

fn coerce_scalar(value: &mut Bson) -> Result<(), DbError> {
    if let Bson::String(s) = value {
        if !s.is_empty() {
            let oid = coerce_id(s)?;
            *value = Bson::ObjectId(oid);
        }
    }
    Ok(())
}
