//! 数据迁移
//!
//! A migration has an `up` and a `down`. The runner applies migrations in name order,
//! each with one connection bound for its whole duration. When `up` fails, `down` is
//! called and its result reported in place of the failure; nothing is rolled back.

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::error::DbError;
use crate::executor::binding;
use crate::executor::collection::{Collection, IndexModel};
use crate::pool_manager::PoolManager;

/// What a migration runs against: one named pool.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    manager: PoolManager,
    pool_name: String,
}

impl MigrationContext {
    pub fn new(manager: PoolManager, pool_name: &str) -> Self {
        Self {
            manager,
            pool_name: pool_name.to_string(),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// A collection of the migrated pool. Migrations write documents as given, without
    /// timestamps.
    pub fn collection(&self, name: &str) -> Collection {
        self.manager.collection(&self.pool_name, name).timestamps(false)
    }

    /// Runs a database command.
    pub async fn command(&self, command: Document) -> Result<Document, DbError> {
        self.collection("$cmd").command_raw(command).await
    }
}

#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    async fn up(&self, ctx: &MigrationContext) -> Result<JsonValue, DbError>;

    /// Called when `up` fails.
    async fn down(&self, ctx: &MigrationContext) -> Result<JsonValue, DbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Applied,
    /// `up` failed and `down` ran instead.
    Reverted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub name: String,
    pub status: MigrationStatus,
    pub result: JsonValue,
}

impl std::fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.result)
    }
}

pub struct MigrationRunner {
    ctx: MigrationContext,
}

impl MigrationRunner {
    pub fn new(manager: PoolManager, pool_name: &str) -> Self {
        Self {
            ctx: MigrationContext::new(manager, pool_name),
        }
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    /// Runs every migration, ordered by name. Stops at the first `down` that fails.
    pub async fn run(
        &self,
        mut migrations: Vec<Box<dyn Migration>>,
    ) -> Result<Vec<MigrationReport>, DbError> {
        migrations.sort_by(|a, b| a.name().cmp(b.name()));
        let pool = self.ctx.manager.get_pool(&self.ctx.pool_name).await?;
        let mut reports = Vec::with_capacity(migrations.len());
        for migration in &migrations {
            let report = binding::bind(&pool, self.run_one(migration.as_ref())).await??;
            info!(pool = %self.ctx.pool_name, migration = %report.name, status = ?report.status, result = %report.result, "migration finished");
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_one(&self, migration: &dyn Migration) -> Result<MigrationReport, DbError> {
        let name = migration.name().to_string();
        match migration.up(&self.ctx).await {
            Ok(result) => Ok(MigrationReport {
                name,
                status: MigrationStatus::Applied,
                result,
            }),
            Err(e) => {
                warn!(pool = %self.ctx.pool_name, migration = %name, error = %e, "migration up failed, running down");
                let result = migration.down(&self.ctx).await?;
                Ok(MigrationReport {
                    name,
                    status: MigrationStatus::Reverted,
                    result,
                })
            }
        }
    }
}

/// One step of a script migration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateCollection {
        collection: String,
        #[serde(default)]
        options: Option<Map<String, JsonValue>>,
    },
    DropCollection {
        collection: String,
    },
    InsertOne {
        collection: String,
        document: Map<String, JsonValue>,
    },
    InsertMany {
        collection: String,
        documents: Vec<Map<String, JsonValue>>,
    },
    CreateIndex {
        collection: String,
        keys: Map<String, JsonValue>,
        #[serde(default)]
        options: Option<Map<String, JsonValue>>,
    },
    /// Each entry is the key document of one index.
    CreateIndexes {
        collection: String,
        indexes: Vec<Map<String, JsonValue>>,
    },
    DropIndex {
        collection: String,
        index: String,
    },
    Command {
        command: Map<String, JsonValue>,
    },
    /// Contributes a fixed value to the result, e.g. a marker from `down`.
    Result {
        value: JsonValue,
    },
}

impl Step {
    async fn apply(&self, ctx: &MigrationContext) -> Result<JsonValue, DbError> {
        let value = match self {
            Step::CreateCollection {
                collection,
                options,
            } => {
                let options = options.as_ref().map(to_document).transpose()?;
                to_json(ctx.collection(collection).create_collection(options).await?)
            }
            Step::DropCollection { collection } => {
                to_json(ctx.collection(collection).drop_collection().await?)
            }
            Step::InsertOne {
                collection,
                document,
            } => JsonValue::String(
                ctx.collection(collection)
                    .insert_one(to_document(document)?)
                    .await?,
            ),
            Step::InsertMany {
                collection,
                documents,
            } => {
                let documents = documents
                    .iter()
                    .map(to_document)
                    .collect::<Result<Vec<_>, _>>()?;
                let ids = ctx.collection(collection).insert_many(documents).await?;
                JsonValue::from(ids)
            }
            Step::CreateIndex {
                collection,
                keys,
                options,
            } => {
                let options = options.as_ref().map(to_document).transpose()?;
                JsonValue::String(
                    ctx.collection(collection)
                        .create_index(to_document(keys)?, options)
                        .await?,
                )
            }
            Step::CreateIndexes {
                collection,
                indexes,
            } => {
                let models = indexes
                    .iter()
                    .map(|keys| to_document(keys).map(IndexModel::new))
                    .collect::<Result<Vec<_>, _>>()?;
                JsonValue::from(ctx.collection(collection).create_indexes(models).await?)
            }
            Step::DropIndex { collection, index } => {
                to_json(ctx.collection(collection).drop_index(index).await?)
            }
            Step::Command { command } => to_json(ctx.command(to_document(command)?).await?),
            Step::Result { value } => value.clone(),
        };
        Ok(value)
    }
}

/// 脚本迁移：YAML / JSON 文件中的 up / down 步骤
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ScriptMigration {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub up: Vec<Step>,
    #[serde(default)]
    pub down: Vec<Step>,
}

impl ScriptMigration {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn apply(steps: &[Step], ctx: &MigrationContext) -> Result<JsonValue, DbError> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            results.push(step.apply(ctx).await?);
        }
        // a lone `result` step reports its value as is
        if let [Step::Result { value }] = steps {
            return Ok(value.clone());
        }
        Ok(JsonValue::Array(results))
    }
}

#[async_trait]
impl Migration for ScriptMigration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, ctx: &MigrationContext) -> Result<JsonValue, DbError> {
        Self::apply(&self.up, ctx).await
    }

    async fn down(&self, ctx: &MigrationContext) -> Result<JsonValue, DbError> {
        Self::apply(&self.down, ctx).await
    }
}

fn to_document(map: &Map<String, JsonValue>) -> Result<Document, DbError> {
    bson::to_document(map)
        .map_err(|e| DbError::Configuration(format!("migration document is not valid bson: {e}")))
}

fn to_json(document: Document) -> JsonValue {
    Bson::Document(document).into_relaxed_extjson()
}
