use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::DbError;
use crate::executor::collection::Collection;
use crate::models::db_config::{PoolConfig, Settings};
use crate::pool::{Pool, ReconnectPolicy};
use crate::udbc::Driver;

// 全局单例（Rust 1.80+ 推荐）
pub static MONGO: LazyLock<PoolManager> = LazyLock::new(PoolManager::new);

/// 获取全局 PoolManager 实例
pub fn pool_mgr() -> &'static PoolManager {
    &MONGO
}

/// 连接池管理器：按名称懒加载连接池
/// Named pool registry. Each configured name gets exactly one pool, created on first use.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    configs: DashMap<String, PoolConfig>,
    pools: DashMap<String, Arc<OnceCell<Pool>>>,
    driver: RwLock<Option<Arc<dyn Driver>>>,
    policy: RwLock<ReconnectPolicy>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.inner.configs.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("PoolManager").field("pools", &names).finish()
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager {
    /// A registry using the default driver, when one is compiled in.
    pub fn new() -> Self {
        #[cfg(feature = "mongodb")]
        let driver: Option<Arc<dyn Driver>> = Some(Arc::new(crate::udbc_mongo::MongoDriver::new()));
        #[cfg(not(feature = "mongodb"))]
        let driver: Option<Arc<dyn Driver>> = None;
        Self::build(driver)
    }

    pub fn with_driver(driver: impl Driver + 'static) -> Self {
        Self::build(Some(Arc::new(driver)))
    }

    fn build(driver: Option<Arc<dyn Driver>>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                configs: DashMap::new(),
                pools: DashMap::new(),
                driver: RwLock::new(driver),
                policy: RwLock::new(ReconnectPolicy::default()),
            }),
        }
    }

    /// Replaces the driver used for pools created from now on.
    pub fn set_driver(&self, driver: Arc<dyn Driver>) {
        *self.inner.driver.write().unwrap_or_else(PoisonError::into_inner) = Some(driver);
    }

    /// Reconnect policy for pools created from now on.
    pub fn set_reconnect_policy(&self, policy: ReconnectPolicy) {
        *self.inner.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// 注册连接池配置
    ///
    /// Configuration is immutable once the pool exists, so re-registering a name whose
    /// pool has already been created is an error.
    pub fn register(&self, name: &str, config: PoolConfig) -> Result<(), DbError> {
        config.validate()?;
        if self.is_created(name) {
            return Err(DbError::Configuration(format!(
                "pool `{name}` already exists; its configuration can no longer change"
            )));
        }
        self.inner.configs.insert(name.to_string(), config);
        Ok(())
    }

    /// Registers every pool of a configuration file.
    pub fn configure(&self, settings: Settings) -> Result<(), DbError> {
        for (name, config) in settings.pools {
            self.register(&name, config)?;
        }
        Ok(())
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.inner.configs.contains_key(name)
    }

    pub fn config(&self, name: &str) -> Option<PoolConfig> {
        self.inner.configs.get(name).map(|c| c.value().clone())
    }

    fn is_created(&self, name: &str) -> bool {
        self.inner
            .pools
            .get(name)
            .is_some_and(|cell| cell.value().initialized())
    }

    /// 获取连接池，首次访问时按配置创建
    ///
    /// Concurrent first callers share a single construction.
    pub async fn get_pool(&self, name: &str) -> Result<Pool, DbError> {
        let config = self.config(name).ok_or_else(|| {
            DbError::Configuration(format!("config[mongodb.{name}] does not exist"))
        })?;
        let cell = self
            .inner
            .pools
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        let pool = cell
            .get_or_try_init(|| async {
                let driver = self.driver()?;
                let policy = *self.inner.policy.read().unwrap_or_else(PoisonError::into_inner);
                info!(pool = name, driver = driver.name(), "creating mongodb pool");
                Pool::with_policy(name, config, driver, policy).await
            })
            .await?;
        Ok(pool.clone())
    }

    fn driver(&self) -> Result<Arc<dyn Driver>, DbError> {
        self.inner
            .driver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DbError::Configuration("no mongodb driver registered".into()))
    }

    /// 获取集合操作客户端
    pub fn collection(&self, pool_name: &str, collection: &str) -> Collection {
        Collection::new(self.clone(), pool_name, collection)
    }

    /// Closes every pool created so far.
    pub fn close_all(&self) {
        for entry in self.inner.pools.iter() {
            if let Some(pool) = entry.value().get() {
                pool.close();
            }
        }
    }
}
