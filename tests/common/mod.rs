#![allow(dead_code)]

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use umongo::error::DriverError;
use umongo::models::db_config::PoolConfig;
use umongo::pool::ReconnectPolicy;
use umongo::pool_manager::PoolManager;
use umongo::udbc::{
    ConnectOptions, Driver, DriverHandle, Namespace, Query, ReturnDocument, Write, WriteOutcome,
};

/// One handle opened by the in-memory driver.
pub struct HandleState {
    alive: AtomicBool,
    pub pings: AtomicUsize,
}

/// Shared state of the in-memory server.
#[derive(Default)]
pub struct MemoryState {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
    indexes: Mutex<HashMap<String, Vec<Document>>>,
    handles: Mutex<Vec<Arc<HandleState>>>,
    pub connects: AtomicUsize,
    pub pings: AtomicUsize,
    pub refuse_connect: AtomicBool,
    pub reject_auth: AtomicBool,
    pub fail_writes: AtomicBool,
    pub commands: Mutex<Vec<Document>>,
    pub filters: Mutex<Vec<Document>>,
    pub find_options: Mutex<Vec<umongo::udbc::FindOptions>>,
    pub query_delay: Mutex<Duration>,
}

impl MemoryState {
    /// Every handle opened so far stops answering.
    pub fn kill_connections(&self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.alive.store(false, Ordering::SeqCst);
        }
    }

    /// The `index`-th handle opened stops answering.
    pub fn kill_handle(&self, index: usize) {
        self.handles.lock().unwrap()[index].alive.store(false, Ordering::SeqCst);
    }

    /// Pings answered or refused per handle, in connect order.
    pub fn pings_per_handle(&self) -> Vec<usize> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.pings.load(Ordering::SeqCst))
            .collect()
    }

    pub fn reset_pings(&self) {
        self.pings.store(0, Ordering::SeqCst);
        for handle in self.handles.lock().unwrap().iter() {
            handle.pings.store(0, Ordering::SeqCst);
        }
    }

    pub fn documents(&self, db: &str, collection: &str) -> Vec<Document> {
        self.collections
            .lock()
            .unwrap()
            .get(&format!("{db}.{collection}"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_filter(&self) -> Option<Document> {
        self.filters.lock().unwrap().last().cloned()
    }

    pub fn last_command(&self) -> Option<Document> {
        self.commands.lock().unwrap().last().cloned()
    }
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    pub state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(
        &self,
        _uri: &str,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Err(DriverError::connection("connection refused"));
        }
        if self.state.reject_auth.load(Ordering::SeqCst) {
            return Err(DriverError::authentication("bad credentials"));
        }
        let handle = Arc::new(HandleState {
            alive: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
        });
        self.state.handles.lock().unwrap().push(handle.clone());
        Ok(Box::new(MemoryHandle {
            state: self.state.clone(),
            handle,
        }))
    }
}

pub struct MemoryHandle {
    state: Arc<MemoryState>,
    handle: Arc<HandleState>,
}

impl MemoryHandle {
    fn check_alive(&self) -> Result<(), DriverError> {
        if self.handle.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::connection("socket closed"))
        }
    }
}

fn key(ns: &Namespace) -> String {
    format!("{}.{}", ns.db, ns.collection)
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, expected)| {
        let actual = document.get(field);
        match expected {
            Bson::Document(op) if op.keys().any(|k| k.starts_with('$')) => {
                op.iter().all(|(name, arg)| match (name.as_str(), arg) {
                    ("$in", Bson::Array(items)) => actual.is_some_and(|a| items.contains(a)),
                    ("$nin", Bson::Array(items)) => actual.is_none_or(|a| !items.contains(a)),
                    ("$ne", value) => actual != Some(value),
                    _ => false,
                })
            }
            value => actual == Some(value),
        }
    })
}

fn compare(a: Option<&Bson>, b: Option<&Bson>) -> CmpOrdering {
    fn number(v: &Bson) -> Option<f64> {
        match v {
            Bson::Int32(n) => Some(*n as f64),
            Bson::Int64(n) => Some(*n as f64),
            Bson::Double(n) => Some(*n),
            _ => None,
        }
    }
    match (a, b) {
        (Some(Bson::String(x)), Some(Bson::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => match (number(x), number(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal),
            _ => CmpOrdering::Equal,
        },
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

fn apply_update(document: &mut Document, update: &Document) {
    if let Ok(set) = update.get_document("$set") {
        for (k, v) in set {
            document.insert(k.clone(), v.clone());
        }
    }
    if let Ok(inc) = update.get_document("$inc") {
        for (k, v) in inc {
            let current = match document.get(k) {
                Some(Bson::Int32(n)) => i64::from(*n),
                Some(Bson::Int64(n)) => *n,
                _ => 0,
            };
            let by = v.as_i64().or_else(|| v.as_i32().map(i64::from)).unwrap_or(0);
            document.insert(k.clone(), current + by);
        }
    }
}

fn update_docs(
    docs: &mut Vec<Document>,
    filter: &Document,
    update: &Document,
    upsert: bool,
    many: bool,
    outcome: &mut WriteOutcome,
) {
    let mut touched = 0;
    for document in docs.iter_mut().filter(|d| matches(d, filter)) {
        apply_update(document, update);
        touched += 1;
        if !many {
            break;
        }
    }
    outcome.matched = touched;
    outcome.modified = touched;
    if touched == 0 && upsert {
        let mut document = seed_from_filter(filter);
        apply_update(&mut document, update);
        outcome.upserted_id = Some(ensure_id(&mut document));
        docs.push(document);
    }
}

fn seed_from_filter(filter: &Document) -> Document {
    filter
        .iter()
        .filter(|(k, v)| !k.starts_with('$') && !matches!(v, Bson::Document(_)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn ensure_id(document: &mut Document) -> Bson {
    if !document.contains_key("_id") {
        document.insert("_id", ObjectId::new());
    }
    document.get("_id").cloned().unwrap_or(Bson::Null)
}

fn ok() -> Document {
    doc! { "ok": 1.0 }
}

#[async_trait]
impl DriverHandle for MemoryHandle {
    async fn query(&self, ns: &Namespace, query: Query) -> Result<Vec<Document>, DriverError> {
        self.check_alive()?;
        let delay = *self.state.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let docs = self.state.documents(&ns.db, &ns.collection);
        match query {
            Query::Find { filter, options } => {
                self.state.filters.lock().unwrap().push(filter.clone());
                self.state.find_options.lock().unwrap().push(options.clone());
                let mut out: Vec<Document> =
                    docs.into_iter().filter(|d| matches(d, &filter)).collect();
                if let Some((field, direction)) = options.sort.as_ref().and_then(|s| s.iter().next()) {
                    let descending = direction.as_i32() == Some(-1) || direction.as_i64() == Some(-1);
                    out.sort_by(|a, b| {
                        let ord = compare(a.get(field), b.get(field));
                        if descending { ord.reverse() } else { ord }
                    });
                }
                let skip = options.skip.unwrap_or(0) as usize;
                let out = out.into_iter().skip(skip);
                Ok(match options.limit {
                    Some(limit) if limit != 0 => out.take(limit.unsigned_abs() as usize).collect(),
                    _ => out.collect(),
                })
            }
            Query::Aggregate { pipeline } => {
                let mut out = docs;
                for stage in &pipeline {
                    if let Ok(filter) = stage.get_document("$match") {
                        out.retain(|d| matches(d, filter));
                    }
                }
                Ok(out)
            }
            Query::ListIndexes => {
                let mut out = vec![doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }];
                out.extend(
                    self.state
                        .indexes
                        .lock()
                        .unwrap()
                        .get(&key(ns))
                        .cloned()
                        .unwrap_or_default(),
                );
                Ok(out)
            }
            Query::ListCollections { filter } => {
                let prefix = format!("{}.", ns.db);
                let names: Vec<Document> = self
                    .state
                    .collections
                    .lock()
                    .unwrap()
                    .keys()
                    .filter_map(|k| k.strip_prefix(prefix.as_str()))
                    .map(|name| doc! { "name": name, "type": "collection" })
                    .filter(|d| matches(d, &filter))
                    .collect();
                Ok(names)
            }
        }
    }

    async fn write(&self, ns: &Namespace, write: Write) -> Result<WriteOutcome, DriverError> {
        self.check_alive()?;
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(DriverError::runtime("E11000 duplicate key error"));
        }
        if let Some(filter) = match &write {
            Write::UpdateOne { filter, .. }
            | Write::UpdateMany { filter, .. }
            | Write::ReplaceOne { filter, .. }
            | Write::DeleteOne { filter }
            | Write::DeleteMany { filter }
            | Write::FindOneAndUpdate { filter, .. }
            | Write::FindOneAndReplace { filter, .. }
            | Write::FindOneAndDelete { filter } => Some(filter.clone()),
            _ => None,
        } {
            self.state.filters.lock().unwrap().push(filter);
        }

        let mut collections = self.state.collections.lock().unwrap();
        let docs = collections.entry(key(ns)).or_default();
        let mut outcome = WriteOutcome::default();
        match write {
            Write::InsertOne { mut document } => {
                outcome.inserted_ids.push(ensure_id(&mut document));
                docs.push(document);
            }
            Write::InsertMany { documents } => {
                for mut document in documents {
                    outcome.inserted_ids.push(ensure_id(&mut document));
                    docs.push(document);
                }
            }
            Write::UpdateOne { filter, update, upsert } => {
                update_docs(docs, &filter, &update, upsert, false, &mut outcome);
            }
            Write::UpdateMany { filter, update, upsert } => {
                update_docs(docs, &filter, &update, upsert, true, &mut outcome);
            }
            Write::ReplaceOne { filter, replacement, upsert } => {
                match docs.iter_mut().find(|d| matches(d, &filter)) {
                    Some(document) => {
                        let id = document.get("_id").cloned();
                        *document = replacement;
                        if let Some(id) = id {
                            document.insert("_id", id);
                        }
                        outcome.matched = 1;
                        outcome.modified = 1;
                    }
                    None if upsert => {
                        let mut document = replacement;
                        outcome.upserted_id = Some(ensure_id(&mut document));
                        docs.push(document);
                    }
                    None => {}
                }
            }
            Write::DeleteOne { filter } => {
                if let Some(pos) = docs.iter().position(|d| matches(d, &filter)) {
                    docs.remove(pos);
                    outcome.deleted = 1;
                }
            }
            Write::DeleteMany { filter } => {
                let before = docs.len();
                docs.retain(|d| !matches(d, &filter));
                outcome.deleted = (before - docs.len()) as u64;
            }
            Write::FindOneAndUpdate { filter, update, upsert, return_document } => {
                match docs.iter_mut().find(|d| matches(d, &filter)) {
                    Some(document) => {
                        let before = document.clone();
                        apply_update(document, &update);
                        outcome.document = Some(match return_document {
                            ReturnDocument::Before => before,
                            ReturnDocument::After => document.clone(),
                        });
                    }
                    None if upsert => {
                        let mut document = seed_from_filter(&filter);
                        apply_update(&mut document, &update);
                        ensure_id(&mut document);
                        if return_document == ReturnDocument::After {
                            outcome.document = Some(document.clone());
                        }
                        docs.push(document);
                    }
                    None => {}
                }
            }
            Write::FindOneAndReplace { filter, replacement, upsert, return_document } => {
                match docs.iter_mut().find(|d| matches(d, &filter)) {
                    Some(document) => {
                        let before = document.clone();
                        *document = replacement;
                        if let Some(id) = before.get("_id") {
                            document.insert("_id", id.clone());
                        }
                        outcome.document = Some(match return_document {
                            ReturnDocument::Before => before,
                            ReturnDocument::After => document.clone(),
                        });
                    }
                    None if upsert => {
                        let mut document = replacement;
                        ensure_id(&mut document);
                        docs.push(document);
                    }
                    None => {}
                }
            }
            Write::FindOneAndDelete { filter } => {
                if let Some(pos) = docs.iter().position(|d| matches(d, &filter)) {
                    outcome.document = Some(docs.remove(pos));
                }
            }
        }
        Ok(outcome)
    }

    async fn command(&self, db: &str, command: Document) -> Result<Document, DriverError> {
        self.check_alive()?;
        self.state.commands.lock().unwrap().push(command.clone());
        let Some((name, target)) = command.iter().next() else {
            return Err(DriverError::invalid_argument("empty command"));
        };
        let ns = Namespace::new(db, target.as_str().unwrap_or_default());
        match name.as_str() {
            "count" => {
                let filter = command.get_document("query").cloned().unwrap_or_default();
                let n = self
                    .state
                    .documents(db, &ns.collection)
                    .iter()
                    .filter(|d| matches(d, &filter))
                    .count();
                Ok(doc! { "n": n as i32, "ok": 1.0 })
            }
            "distinct" => {
                let field = command.get_str("key").unwrap_or_default();
                let filter = command.get_document("query").cloned().unwrap_or_default();
                let mut values: Vec<Bson> = Vec::new();
                for document in self.state.documents(db, &ns.collection) {
                    if let Some(value) = document.get(field).filter(|_| matches(&document, &filter)) {
                        if !values.contains(value) {
                            values.push(value.clone());
                        }
                    }
                }
                Ok(doc! { "values": values, "ok": 1.0 })
            }
            "create" => {
                let mut collections = self.state.collections.lock().unwrap();
                if collections.contains_key(&key(&ns)) {
                    return Err(DriverError::runtime(format!(
                        "Collection {} already exists. NamespaceExists",
                        key(&ns)
                    )));
                }
                collections.insert(key(&ns), Vec::new());
                Ok(ok())
            }
            "drop" => {
                self.state.collections.lock().unwrap().remove(&key(&ns));
                self.state.indexes.lock().unwrap().remove(&key(&ns));
                Ok(ok())
            }
            "createIndexes" => {
                let mut indexes = self.state.indexes.lock().unwrap();
                let list = indexes.entry(key(&ns)).or_default();
                if let Ok(specs) = command.get_array("indexes") {
                    list.extend(specs.iter().filter_map(|s| s.as_document().cloned()));
                }
                Ok(doc! { "numIndexesAfter": list.len() as i32 + 1, "ok": 1.0 })
            }
            "dropIndexes" => {
                let index = command.get_str("index").unwrap_or_default();
                let mut indexes = self.state.indexes.lock().unwrap();
                let list = indexes.entry(key(&ns)).or_default();
                if index == "*" {
                    list.clear();
                } else {
                    let before = list.len();
                    list.retain(|s| s.get_str("name").ok() != Some(index));
                    if before == list.len() {
                        return Err(DriverError::runtime(format!("index not found with name [{index}]")));
                    }
                }
                Ok(ok())
            }
            _ => Ok(ok()),
        }
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        self.handle.pings.fetch_add(1, Ordering::SeqCst);
        self.check_alive()
    }
}

pub fn config(max_connections: usize) -> PoolConfig {
    PoolConfig::new("memory.local", 27017, "app")
        .min_connections(0)
        .max_connections(max_connections)
        .wait_timeout(0.2)
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(1),
    }
}

/// A registry with one pool named `default` backed by a fresh in-memory server.
pub fn manager(max_connections: usize) -> (PoolManager, MemoryDriver) {
    let driver = MemoryDriver::new();
    let manager = PoolManager::with_driver(driver.clone());
    manager.set_reconnect_policy(fast_policy());
    manager
        .register("default", config(max_connections))
        .expect("valid config");
    (manager, driver)
}
