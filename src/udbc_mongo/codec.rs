use bson::{Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind};
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::error::{DriverError, DriverErrorKind};
use crate::udbc::{FindOptions, Namespace, ReturnDocument};

/// 驱动错误 -> 统一的 DriverError
pub fn from_mongo_error(err: MongoError) -> DriverError {
    let kind = match err.kind.as_ref() {
        MongoErrorKind::InvalidArgument { .. } => DriverErrorKind::InvalidArgument,
        MongoErrorKind::Authentication { .. } => DriverErrorKind::Authentication,
        MongoErrorKind::Io(_)
        | MongoErrorKind::ConnectionPoolCleared { .. }
        | MongoErrorKind::ServerSelection { .. }
        | MongoErrorKind::DnsResolve { .. } => DriverErrorKind::Connection,
        MongoErrorKind::Command(_) | MongoErrorKind::Write(_) | MongoErrorKind::InsertMany(_) => {
            DriverErrorKind::Runtime
        }
        _ => DriverErrorKind::Other,
    };
    DriverError::new(kind, err.to_string())
}

pub fn to_find_options(options: FindOptions) -> mongodb::options::FindOptions {
    let mut out = mongodb::options::FindOptions::default();
    out.sort = options.sort;
    out.projection = options.projection;
    out.skip = options.skip;
    out.limit = options.limit;
    out
}

pub fn to_return_document(value: ReturnDocument) -> mongodb::options::ReturnDocument {
    match value {
        ReturnDocument::Before => mongodb::options::ReturnDocument::Before,
        ReturnDocument::After => mongodb::options::ReturnDocument::After,
    }
}

/// Seconds from a config value that may be an integer or a float.
pub fn seconds(value: &JsonValue) -> Option<Duration> {
    value
        .as_f64()
        .filter(|secs| *secs > 0.0)
        .map(Duration::from_secs_f64)
}

pub fn list_indexes_command(ns: &Namespace) -> Document {
    doc! { "listIndexes": ns.collection.as_str() }
}

pub fn list_collections_command(filter: Document) -> Document {
    doc! { "listCollections": 1, "filter": filter }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_commands() {
        let ns = Namespace::new("app", "users");
        assert_eq!(list_indexes_command(&ns), doc! { "listIndexes": "users" });
        assert_eq!(
            list_collections_command(doc! { "name": "users" }),
            doc! { "listCollections": 1, "filter": { "name": "users" } }
        );
    }

    #[test]
    fn converts_seconds() {
        assert_eq!(seconds(&serde_json::json!(2)), Some(Duration::from_secs(2)));
        assert_eq!(seconds(&serde_json::json!(0.5)), Some(Duration::from_millis(500)));
        assert_eq!(seconds(&serde_json::json!(0)), None);
        assert_eq!(seconds(&serde_json::json!("x")), None);
    }

    #[test]
    fn maps_find_options() {
        let out = to_find_options(FindOptions::new().skip(5).limit(2).sort(doc! { "a": -1 }));
        assert_eq!(out.skip, Some(5));
        assert_eq!(out.limit, Some(2));
        assert_eq!(out.sort, Some(doc! { "a": -1 }));
        assert_eq!(out.projection, None);
    }
}
