pub mod error;
pub mod executor;
pub mod filter;
pub mod migration;
pub mod migration_loader;
pub mod models;
pub mod pool;
pub mod pool_manager;
pub mod udbc;
#[cfg(feature = "mongodb")]
pub mod udbc_mongo;

pub use bson;
pub use error::{DbError, ErrorKind};
pub use executor::collection::{Collection, FindAndModifyOptions, IndexModel, Page, UpdateOptions, UpdateOutcome};
pub use filter::Filter;
pub use models::db_config::{PoolConfig, Settings};
pub use pool::Pool;
pub use pool_manager::{MONGO, PoolManager, pool_mgr};
pub use udbc::{FindOptions, ReturnDocument};
