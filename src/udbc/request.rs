use bson::{Bson, Document};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Options handed to `Driver::connect`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub driver_options: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Read requests answered with a list of documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Find {
        filter: Document,
        options: FindOptions,
    },
    Aggregate {
        pipeline: Vec<Document>,
    },
    ListIndexes,
    ListCollections {
        filter: Document,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

/// Write requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    InsertOne {
        document: Document,
    },
    InsertMany {
        documents: Vec<Document>,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
    FindOneAndUpdate {
        filter: Document,
        update: Document,
        upsert: bool,
        return_document: ReturnDocument,
    },
    FindOneAndReplace {
        filter: Document,
        replacement: Document,
        upsert: bool,
        return_document: ReturnDocument,
    },
    FindOneAndDelete {
        filter: Document,
    },
}

impl Write {
    pub fn name(&self) -> &'static str {
        match self {
            Write::InsertOne { .. } => "insert_one",
            Write::InsertMany { .. } => "insert_many",
            Write::UpdateOne { .. } => "update_one",
            Write::UpdateMany { .. } => "update_many",
            Write::ReplaceOne { .. } => "replace_one",
            Write::DeleteOne { .. } => "delete_one",
            Write::DeleteMany { .. } => "delete_many",
            Write::FindOneAndUpdate { .. } => "find_one_and_update",
            Write::FindOneAndReplace { .. } => "find_one_and_replace",
            Write::FindOneAndDelete { .. } => "find_one_and_delete",
        }
    }
}

/// What a write reports back. Fields a given write does not produce stay at their defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub inserted_ids: Vec<Bson>,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    pub upserted_id: Option<Bson>,
    /// The document returned by find-and-modify writes.
    pub document: Option<Document>,
}
