use bson::{Bson, Document, doc};
use serde::Serialize;
use std::future::Future;
use std::panic::Location;
use std::time::Instant;
use tracing::debug;

use crate::error::DbError;
use crate::executor::binding::{self, ConnectionRef};
use crate::filter::{Filter, ID_FIELD, coerce_id};
use crate::pool::Pool;
use crate::pool_manager::PoolManager;
use crate::udbc::{FindOptions, Query, ReturnDocument, Write, WriteOutcome};

/// The name of the "created at" field.
pub const CREATED_AT: &str = "created_at";
/// The name of the "updated at" field.
pub const UPDATED_AT: &str = "updated_at";

/// One page of a paginated find.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub total: u64,
    pub page_no: u64,
    pub page_size: u64,
    pub rows: Vec<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub upsert: bool,
    /// Only read by `update_row`: update every match instead of the first.
    pub multi: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindAndModifyOptions {
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    pub keys: Document,
    pub options: Option<Document>,
}

impl IndexModel {
    pub fn new(keys: Document) -> Self {
        Self { keys, options: None }
    }

    pub fn options(mut self, options: Document) -> Self {
        self.options = Some(options);
        self
    }
}

/// `skip` for a 1-based page number; `None` when it does not fit in a `u64`.
pub fn page_skip(page: u64, page_size: u64) -> Option<u64> {
    if page <= 1 {
        Some(0)
    } else {
        (page - 1).checked_mul(page_size)
    }
}

/// 集合操作客户端
///
/// Every operation resolves a connection (the task's bound one or a fresh lease),
/// normalizes its filter, stamps timestamps on inserts and updates when enabled, runs
/// against the connection and releases it before returning, on success and failure alike.
/// Failures come back as a single [`DbError::Operation`] carrying the caller's location.
#[derive(Clone)]
pub struct Collection {
    manager: PoolManager,
    pool_name: String,
    name: String,
    timestamps: bool,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("pool", &self.pool_name)
            .field("name", &self.name)
            .field("timestamps", &self.timestamps)
            .finish()
    }
}

impl Collection {
    pub fn new(manager: PoolManager, pool_name: &str, name: &str) -> Self {
        Self {
            manager,
            pool_name: pool_name.to_string(),
            name: name.to_string(),
            timestamps: true,
        }
    }

    /// The same collection through another pool.
    pub fn pool(mut self, pool_name: &str) -> Self {
        self.pool_name = pool_name.to_string();
        self
    }

    /// Another collection through the same pool.
    pub fn collection(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamps_enabled(&self) -> bool {
        self.timestamps
    }

    /// Runs `fut` with one connection of this collection's pool bound to the task, so
    /// every operation awaited inside shares it.
    pub async fn bound<F: Future>(&self, fut: F) -> Result<F::Output, DbError> {
        let pool = self.get_pool().await?;
        binding::bind(&pool, fut).await
    }

    // ---------- find ----------

    /// 返回满足条件的第一个数据
    #[track_caller]
    pub fn find_one(
        &self,
        filter: impl Into<Filter>,
        options: FindOptions,
    ) -> impl Future<Output = Result<Option<Document>, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("find_one", location, async move {
            let filter = filter.normalize()?;
            let docs = self
                .query(Query::Find {
                    filter,
                    options: options.limit(1),
                })
                .await?;
            Ok(docs.into_iter().next().map(stringify_id))
        })
    }

    /// 返回满足 filter 的全部数据
    #[track_caller]
    pub fn find_many(
        &self,
        filter: impl Into<Filter>,
        options: FindOptions,
    ) -> impl Future<Output = Result<Vec<Document>, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("find_many", location, async move {
            let filter = filter.normalize()?;
            let docs = self.query(Query::Find { filter, options }).await?;
            Ok(docs.into_iter().map(stringify_id).collect())
        })
    }

    /// 返回分页数据
    ///
    /// An explicit positive `limit` / `skip` in `options` wins over the page arithmetic.
    #[track_caller]
    pub fn find_pagination(
        &self,
        page: u64,
        page_size: u64,
        filter: impl Into<Filter>,
        options: FindOptions,
    ) -> impl Future<Output = Result<Page, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("find_pagination", location, async move {
            if page_size == 0 {
                return Err(DbError::Configuration("page_size must be at least 1".into()));
            }
            let filter = filter.normalize()?;
            let mut options = options;
            if options.limit.is_none_or(|l| l <= 0) {
                let limit = i64::try_from(page_size).map_err(|_| {
                    DbError::Configuration(format!("page_size {page_size} is too large"))
                })?;
                options.limit = Some(limit);
            }
            if options.skip.is_none_or(|s| s == 0) {
                let skip = page_skip(page, page_size).ok_or_else(|| {
                    DbError::Configuration(format!("page {page} of size {page_size} is out of range"))
                })?;
                options.skip = Some(skip);
            }
            let rows = self
                .query(Query::Find {
                    filter: filter.clone(),
                    options,
                })
                .await?;
            let total = self.count_normalized(Some(filter)).await?;
            Ok(Page {
                total,
                page_no: page,
                page_size,
                rows: rows.into_iter().map(stringify_id).collect(),
            })
        })
    }

    /// 查找单个文档并删除它，返回原始文档
    #[track_caller]
    pub fn find_one_and_delete(
        &self,
        filter: impl Into<Filter>,
    ) -> impl Future<Output = Result<Option<Document>, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("find_one_and_delete", location, async move {
            let filter = filter.normalize()?;
            let outcome = self.write(Write::FindOneAndDelete { filter }).await?;
            Ok(outcome.document.map(stringify_id))
        })
    }

    #[track_caller]
    pub fn find_one_and_replace(
        &self,
        filter: impl Into<Filter>,
        replacement: Document,
        options: FindAndModifyOptions,
    ) -> impl Future<Output = Result<Option<Document>, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("find_one_and_replace", location, async move {
            let filter = filter.normalize()?;
            let outcome = self
                .write(Write::FindOneAndReplace {
                    filter,
                    replacement,
                    upsert: options.upsert,
                    return_document: options.return_document,
                })
                .await?;
            Ok(outcome.document.map(stringify_id))
        })
    }

    #[track_caller]
    pub fn find_one_and_update(
        &self,
        filter: impl Into<Filter>,
        update: Document,
        options: FindAndModifyOptions,
    ) -> impl Future<Output = Result<Option<Document>, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("find_one_and_update", location, async move {
            let filter = filter.normalize()?;
            let outcome = self
                .write(Write::FindOneAndUpdate {
                    filter,
                    update,
                    upsert: options.upsert,
                    return_document: options.return_document,
                })
                .await?;
            Ok(outcome.document.map(stringify_id))
        })
    }

    // ---------- insert ----------

    /// 插入一个数据，返回插入的 _id
    #[track_caller]
    pub fn insert_one(&self, document: Document) -> impl Future<Output = Result<String, DbError>> {
        let location = Location::caller();
        self.located("insert_one", location, async move {
            let mut document = document;
            if self.timestamps {
                stamp_insert(&mut document, now());
            }
            let outcome = self.write(Write::InsertOne { document }).await?;
            outcome
                .inserted_ids
                .into_iter()
                .next()
                .map(id_string)
                .ok_or_else(|| DbError::Runtime("insert_one reported no inserted id".into()))
        })
    }

    /// 插入多个数据，返回插入的 _id 列表
    #[track_caller]
    pub fn insert_many(
        &self,
        documents: Vec<Document>,
    ) -> impl Future<Output = Result<Vec<String>, DbError>> {
        let location = Location::caller();
        self.located("insert_many", location, async move {
            let mut documents = documents;
            if self.timestamps {
                let ts = now();
                for document in documents.iter_mut() {
                    stamp_insert(document, ts);
                }
            }
            let outcome = self.write(Write::InsertMany { documents }).await?;
            Ok(outcome.inserted_ids.into_iter().map(id_string).collect())
        })
    }

    // ---------- update ----------

    /// 更新匹配到的第一条数据
    #[track_caller]
    pub fn update_one(
        &self,
        filter: impl Into<Filter>,
        update: Document,
        options: UpdateOptions,
    ) -> impl Future<Output = Result<UpdateOutcome, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("update_one", location, async move {
            let filter = filter.normalize()?;
            let update = self.stamped_update(update);
            let outcome = self
                .write(Write::UpdateOne {
                    filter,
                    update,
                    upsert: options.upsert,
                })
                .await?;
            Ok(update_outcome(outcome))
        })
    }

    /// 更新匹配到的所有数据
    #[track_caller]
    pub fn update_many(
        &self,
        filter: impl Into<Filter>,
        update: Document,
        options: UpdateOptions,
    ) -> impl Future<Output = Result<UpdateOutcome, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("update_many", location, async move {
            let filter = filter.normalize()?;
            let update = self.stamped_update(update);
            let outcome = self
                .write(Write::UpdateMany {
                    filter,
                    update,
                    upsert: options.upsert,
                })
                .await?;
            Ok(update_outcome(outcome))
        })
    }

    /// 更新满足 filter 的行，返回修改的条数；`options.multi` 决定是否批量更新
    #[track_caller]
    pub fn update_row(
        &self,
        filter: impl Into<Filter>,
        update: Document,
        options: UpdateOptions,
    ) -> impl Future<Output = Result<u64, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("update_row", location, async move {
            let filter = filter.normalize()?;
            let update = self.stamped_update(update);
            let write = if options.multi {
                Write::UpdateMany {
                    filter,
                    update,
                    upsert: options.upsert,
                }
            } else {
                Write::UpdateOne {
                    filter,
                    update,
                    upsert: options.upsert,
                }
            };
            Ok(self.write(write).await?.modified)
        })
    }

    #[track_caller]
    pub fn replace_one(
        &self,
        filter: impl Into<Filter>,
        replacement: Document,
        options: UpdateOptions,
    ) -> impl Future<Output = Result<UpdateOutcome, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("replace_one", location, async move {
            let filter = filter.normalize()?;
            let outcome = self
                .write(Write::ReplaceOne {
                    filter,
                    replacement,
                    upsert: options.upsert,
                })
                .await?;
            Ok(update_outcome(outcome))
        })
    }

    // ---------- delete ----------

    #[track_caller]
    pub fn delete_one(&self, filter: impl Into<Filter>) -> impl Future<Output = Result<u64, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("delete_one", location, async move {
            let filter = filter.normalize()?;
            Ok(self.write(Write::DeleteOne { filter }).await?.deleted)
        })
    }

    #[track_caller]
    pub fn delete_many(
        &self,
        filter: impl Into<Filter>,
    ) -> impl Future<Output = Result<u64, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("delete_many", location, async move {
            let filter = filter.normalize()?;
            Ok(self.write(Write::DeleteMany { filter }).await?.deleted)
        })
    }

    /// 通过 ids 删除
    #[track_caller]
    pub fn delete_by_ids<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> impl Future<Output = Result<u64, DbError>> {
        let location = Location::caller();
        let ids: Result<Vec<Bson>, DbError> = ids
            .iter()
            .map(|id| coerce_id(id.as_ref()).map(Bson::ObjectId))
            .collect();
        self.located("delete_by_ids", location, async move {
            let ids = ids?;
            let filter = doc! { ID_FIELD: { "$in": ids } };
            Ok(self.write(Write::DeleteMany { filter }).await?.deleted)
        })
    }

    // ---------- read helpers ----------

    #[track_caller]
    pub fn distinct(
        &self,
        field: &str,
        filter: impl Into<Filter>,
    ) -> impl Future<Output = Result<Vec<Bson>, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        let field = field.to_string();
        self.located("distinct", location, async move {
            let filter = filter.normalize()?;
            let reply = self
                .command(doc! { "distinct": self.name.as_str(), "key": field, "query": filter })
                .await?;
            match reply.get("values") {
                Some(Bson::Array(values)) => Ok(values.clone()),
                _ => Err(DbError::Runtime("distinct reply has no values".into())),
            }
        })
    }

    #[track_caller]
    pub fn aggregate(
        &self,
        pipeline: Vec<Document>,
    ) -> impl Future<Output = Result<Vec<Document>, DbError>> {
        let location = Location::caller();
        self.located("aggregate", location, async move {
            let docs = self.query(Query::Aggregate { pipeline }).await?;
            Ok(docs.into_iter().map(stringify_id).collect())
        })
    }

    /// 获取 collection 中满足条件的条数
    #[track_caller]
    pub fn count_documents(
        &self,
        filter: impl Into<Filter>,
    ) -> impl Future<Output = Result<u64, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        self.located("count_documents", location, async move {
            let filter = filter.normalize()?;
            self.count_normalized(Some(filter)).await
        })
    }

    /// Count from collection metadata, no filter.
    #[track_caller]
    pub fn estimated_document_count(&self) -> impl Future<Output = Result<u64, DbError>> {
        let location = Location::caller();
        self.located("estimated_document_count", location, async move {
            self.count_normalized(None).await
        })
    }

    // ---------- indexes ----------

    /// 创建索引，返回索引名
    #[track_caller]
    pub fn create_index(
        &self,
        keys: Document,
        options: Option<Document>,
    ) -> impl Future<Output = Result<String, DbError>> {
        let location = Location::caller();
        self.located("create_index", location, async move {
            let mut names = self.create_index_models(vec![IndexModel { keys, options }]).await?;
            names
                .pop()
                .ok_or_else(|| DbError::Runtime("createIndexes returned no index".into()))
        })
    }

    /// 批量创建索引
    #[track_caller]
    pub fn create_indexes(
        &self,
        indexes: Vec<IndexModel>,
    ) -> impl Future<Output = Result<Vec<String>, DbError>> {
        let location = Location::caller();
        self.located("create_indexes", location, async move {
            self.create_index_models(indexes).await
        })
    }

    #[track_caller]
    pub fn list_indexes(&self) -> impl Future<Output = Result<Vec<Document>, DbError>> {
        let location = Location::caller();
        self.located("list_indexes", location, async move { self.query(Query::ListIndexes).await })
    }

    #[track_caller]
    pub fn drop_index(&self, index_name: &str) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        let index_name = index_name.to_string();
        self.located("drop_index", location, async move {
            self.command(doc! { "dropIndexes": self.name.as_str(), "index": index_name })
                .await
        })
    }

    #[track_caller]
    pub fn drop_indexes(&self) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        self.located("drop_indexes", location, async move {
            self.command(doc! { "dropIndexes": self.name.as_str(), "index": "*" })
                .await
        })
    }

    /// 判断是否已经存在索引：某个索引的全部键都在 `fields` 中
    #[track_caller]
    pub fn is_exist_index(&self, fields: &[&str]) -> impl Future<Output = Result<bool, DbError>> {
        let location = Location::caller();
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.located("is_exist_index", location, async move {
            let indexes = self.query(Query::ListIndexes).await?;
            Ok(indexes.iter().any(|index| match index.get_document("key") {
                Ok(key) => !key.is_empty() && key.keys().all(|k| fields.contains(k)),
                Err(_) => false,
            }))
        })
    }

    // ---------- collections ----------

    /// 创建集合
    #[track_caller]
    pub fn create_collection(
        &self,
        options: Option<Document>,
    ) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        self.located("create_collection", location, async move {
            let mut command = doc! { "create": self.name.as_str() };
            merge(&mut command, options.unwrap_or_default());
            self.command(command).await
        })
    }

    /// 删除集合
    #[track_caller]
    pub fn drop_collection(&self) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        self.located("drop_collection", location, async move {
            self.command(doc! { "drop": self.name.as_str() }).await
        })
    }

    #[track_caller]
    pub fn modify_collection(
        &self,
        options: Document,
    ) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        self.located("modify_collection", location, async move {
            let mut command = doc! { "collMod": self.name.as_str() };
            merge(&mut command, options);
            self.command(command).await
        })
    }

    /// Collections of the pool's database matching `filter`.
    #[track_caller]
    pub fn list_collections(
        &self,
        filter: Document,
    ) -> impl Future<Output = Result<Vec<Document>, DbError>> {
        let location = Location::caller();
        self.located("list_collections", location, async move {
            self.query(Query::ListCollections { filter }).await
        })
    }

    /// 判断集合是否存在
    #[track_caller]
    pub fn is_exist_collection(&self) -> impl Future<Output = Result<bool, DbError>> {
        let location = Location::caller();
        self.located("is_exist_collection", location, async move {
            let found = self
                .query(Query::ListCollections {
                    filter: doc! { "name": self.name.as_str() },
                })
                .await?;
            Ok(!found.is_empty())
        })
    }

    // ---------- misc ----------

    #[track_caller]
    pub fn map_reduce(
        &self,
        map: &str,
        reduce: &str,
        out: impl Into<Bson>,
        options: Option<Document>,
    ) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        let out: Bson = out.into();
        let mut command = doc! {
            "mapReduce": self.name.as_str(),
            "map": Bson::JavaScriptCode(map.to_string()),
            "reduce": Bson::JavaScriptCode(reduce.to_string()),
            "out": out,
        };
        merge(&mut command, options.unwrap_or_default());
        self.located("map_reduce", location, async move { self.command(command).await })
    }

    /// Explains a find over this collection.
    #[track_caller]
    pub fn explain(
        &self,
        filter: impl Into<Filter>,
        verbosity: &str,
    ) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        let filter = filter.into();
        let verbosity = verbosity.to_string();
        self.located("explain", location, async move {
            let filter = filter.normalize()?;
            self.command(doc! {
                "explain": { "find": self.name.as_str(), "filter": filter },
                "verbosity": verbosity,
            })
            .await
        })
    }

    /// Runs a raw database command.
    #[track_caller]
    pub fn command_raw(&self, command: Document) -> impl Future<Output = Result<Document, DbError>> {
        let location = Location::caller();
        self.located("command", location, async move { self.command(command).await })
    }

    // ---------- plumbing ----------

    async fn located<T>(
        &self,
        op: &'static str,
        location: &'static Location<'static>,
        fut: impl Future<Output = Result<T, DbError>>,
    ) -> Result<T, DbError> {
        let start = Instant::now();
        let result = fut.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(v) => {
                debug!(pool = %self.pool_name, collection = %self.name, op, elapsed_ms, "mongodb operation");
                Ok(v)
            }
            Err(e) => {
                debug!(pool = %self.pool_name, collection = %self.name, op, elapsed_ms, error = %e, "mongodb operation failed");
                Err(e.at(location))
            }
        }
    }

    async fn get_pool(&self) -> Result<Pool, DbError> {
        self.manager.get_pool(&self.pool_name).await
    }

    async fn connection(&self) -> Result<ConnectionRef, DbError> {
        let pool = self.get_pool().await?;
        binding::resolve(&pool).await
    }

    async fn query(&self, query: Query) -> Result<Vec<Document>, DbError> {
        let conn = self.connection().await?;
        conn.query(self.name.as_str(), query).await
    }

    async fn write(&self, write: Write) -> Result<WriteOutcome, DbError> {
        let conn = self.connection().await?;
        conn.write(self.name.as_str(), write).await
    }

    async fn command(&self, command: Document) -> Result<Document, DbError> {
        let conn = self.connection().await?;
        conn.command(command).await
    }

    async fn count_normalized(&self, filter: Option<Document>) -> Result<u64, DbError> {
        let mut command = doc! { "count": self.name.as_str() };
        if let Some(filter) = filter {
            command.insert("query", filter);
        }
        let reply = self.command(command).await?;
        read_count(&reply)
    }

    async fn create_index_models(&self, indexes: Vec<IndexModel>) -> Result<Vec<String>, DbError> {
        let mut names = Vec::with_capacity(indexes.len());
        let mut specs = Vec::with_capacity(indexes.len());
        for model in indexes {
            let mut spec = model.options.unwrap_or_default();
            let name = match spec.get_str("name") {
                Ok(name) => name.to_string(),
                Err(_) => index_name(&model.keys),
            };
            spec.insert("key", model.keys);
            spec.insert("name", name.clone());
            names.push(name);
            specs.push(Bson::Document(spec));
        }
        self.command(doc! { "createIndexes": self.name.as_str(), "indexes": specs })
            .await?;
        Ok(names)
    }

    fn stamped_update(&self, mut update: Document) -> Document {
        if self.timestamps {
            stamp_update(&mut update, now());
        }
        update
    }
}

fn merge(target: &mut Document, extra: Document) {
    for (key, value) in extra {
        target.insert(key, value);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn stamp_insert(document: &mut Document, ts: i64) {
    document.insert(CREATED_AT, ts);
    document.insert(UPDATED_AT, ts);
}

/// Sets `$set.updated_at`, creating `$set` when the update has none.
fn stamp_update(update: &mut Document, ts: i64) {
    match update.get_mut("$set") {
        Some(Bson::Document(set)) => {
            set.insert(UPDATED_AT, ts);
        }
        Some(_) => {}
        None => {
            update.insert("$set", doc! { UPDATED_AT: ts });
        }
    }
}

fn stringify_id(mut document: Document) -> Document {
    if let Some(Bson::ObjectId(oid)) = document.get(ID_FIELD) {
        let hex = oid.to_hex();
        document.insert(ID_FIELD, hex);
    }
    document
}

fn id_string(id: Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s,
        other => other.to_string(),
    }
}

fn update_outcome(outcome: WriteOutcome) -> UpdateOutcome {
    UpdateOutcome {
        matched: outcome.matched,
        modified: outcome.modified,
        upserted_id: outcome.upserted_id.map(id_string),
    }
}

fn read_count(reply: &Document) -> Result<u64, DbError> {
    match reply.get("n") {
        Some(Bson::Int32(n)) => Ok((*n).max(0) as u64),
        Some(Bson::Int64(n)) => Ok((*n).max(0) as u64),
        Some(Bson::Double(n)) => Ok(n.max(0.0) as u64),
        _ => Err(DbError::Runtime(format!("count reply has no `n`: {reply}"))),
    }
}

/// Server-style default index name, e.g. `{a: 1, b: -1}` -> `a_1_b_-1`.
fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(n) => n.to_string(),
                Bson::Int64(n) => n.to_string(),
                Bson::Double(n) if n.fract() == 0.0 => (*n as i64).to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{field}_{direction}")
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;

    #[test]
    fn page_skip_is_zero_for_first_page() {
        assert_eq!(page_skip(0, 10), Some(0));
        assert_eq!(page_skip(1, 10), Some(0));
        assert_eq!(page_skip(3, 10), Some(20));
        assert_eq!(page_skip(1, u64::MAX), Some(0));
    }

    #[test]
    fn page_skip_overflow_is_none() {
        assert_eq!(page_skip(u64::MAX, 10), None);
        assert_eq!(page_skip(3, u64::MAX), None);
    }

    #[test]
    fn update_stamp_creates_or_extends_set() {
        let mut update = doc! { "$inc": { "n": 1 } };
        stamp_update(&mut update, 7);
        assert_eq!(update, doc! { "$inc": { "n": 1 }, "$set": { UPDATED_AT: 7_i64 } });

        let mut update = doc! { "$set": { "x": 1 } };
        stamp_update(&mut update, 8);
        assert_eq!(update, doc! { "$set": { "x": 1, UPDATED_AT: 8_i64 } });
    }

    #[test]
    fn insert_stamp_sets_both_fields_equal() {
        let mut document = doc! { "x": 1 };
        stamp_insert(&mut document, 42);
        assert_eq!(document.get_i64(CREATED_AT).unwrap(), 42);
        assert_eq!(document.get_i64(UPDATED_AT).unwrap(), 42);
    }

    #[test]
    fn object_ids_are_stringified() {
        let oid = ObjectId::new();
        let out = stringify_id(doc! { "_id": oid, "x": 1 });
        assert_eq!(out, doc! { "_id": oid.to_hex(), "x": 1 });
        let out = stringify_id(doc! { "_id": 5 });
        assert_eq!(out, doc! { "_id": 5 });
    }

    #[test]
    fn default_index_names() {
        assert_eq!(index_name(&doc! { "dd": 1, "tt": -1 }), "dd_1_tt_-1");
        assert_eq!(index_name(&doc! { "body": "text" }), "body_text");
    }

    #[test]
    fn count_reply_variants() {
        assert_eq!(read_count(&doc! { "n": 3, "ok": 1 }).unwrap(), 3);
        assert_eq!(read_count(&doc! { "n": 4_i64 }).unwrap(), 4);
        assert_eq!(read_count(&doc! { "n": 5.0 }).unwrap(), 5);
        assert!(read_count(&doc! { "ok": 1 }).is_err());
    }
}
