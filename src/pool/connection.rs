use bson::Document;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{DbError, DriverError, DriverErrorKind, classify};
use crate::models::db_config::PoolConfig;
use crate::udbc::{ConnectOptions, Driver, DriverHandle, Namespace, Query, Write, WriteOutcome};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// RFC 3986 unreserved characters stay as they are.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Borrowed,
    Closed,
}

/// How a connectivity failure seen by the liveness probe is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly with each further attempt.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(50),
        }
    }
}

/// 一条到数据库服务器的连接，由所属连接池独占管理
/// One live server handle, owned by exactly one pool.
pub struct Connection {
    id: u64,
    pool_name: String,
    database: String,
    driver: Arc<dyn Driver>,
    config: Arc<PoolConfig>,
    handle: Option<Box<dyn DriverHandle>>,
    state: ConnectionState,
    created_at: Instant,
    last_used_at: Instant,
    policy: ReconnectPolicy,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool", &self.pool_name)
            .field("database", &self.database)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// Establishes a new connection from the pool's configuration.
    pub async fn connect(
        pool_name: &str,
        driver: Arc<dyn Driver>,
        config: Arc<PoolConfig>,
        policy: ReconnectPolicy,
    ) -> Result<Self, DbError> {
        let now = Instant::now();
        let mut conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            pool_name: pool_name.to_string(),
            database: default_database(&config),
            driver,
            config,
            handle: None,
            state: ConnectionState::Idle,
            created_at: now,
            last_used_at: now,
            policy,
        };
        conn.reconnect().await?;
        debug!(pool = %conn.pool_name, id = conn.id, "mongodb connection established");
        Ok(conn)
    }

    /// Rebuilds the driver handle. The previous handle, if any, is dropped.
    pub async fn reconnect(&mut self) -> Result<(), DbError> {
        let uri = build_uri(&self.config)?;
        let options = ConnectOptions {
            connect_timeout: self.config.pool.connect_timeout(),
            driver_options: self.config.driver_options.clone(),
        };
        let connecting = self.driver.connect(&uri, &options);
        let result = if options.connect_timeout.is_zero() {
            connecting.await
        } else {
            match tokio::time::timeout(options.connect_timeout, connecting).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(DbError::Connectivity(format!(
                        "connecting to {} timed out after {:?}",
                        redact(&uri),
                        options.connect_timeout
                    )));
                }
            }
        };
        let handle = result.map_err(classify_connect)?;
        self.handle = Some(handle);
        if self.state == ConnectionState::Closed {
            self.state = ConnectionState::Idle;
        }
        Ok(())
    }

    /// Liveness probe.
    ///
    /// A connectivity failure triggers the bounded reconnect loop; recovery reports the
    /// connection as alive, exhaustion is returned as `DbError::Connectivity`. Any other
    /// failure is fatal and returned as classified. A closed connection is simply not alive.
    /// Probing does not count as use: `last_used_at` is left as it was.
    pub async fn check(&mut self) -> Result<bool, DbError> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(false);
        };
        match handle.ping().await {
            Ok(()) => Ok(true),
            Err(e) => {
                let err = classify(e);
                if !err.is_retryable() {
                    return Err(err);
                }
                warn!(pool = %self.pool_name, id = self.id, error = %err, "liveness probe failed, reconnecting");
                self.recover(err).await?;
                Ok(true)
            }
        }
    }

    async fn recover(&mut self, cause: DbError) -> Result<(), DbError> {
        let mut last = cause;
        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 && !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff * (attempt - 1)).await;
            }
            match self.reconnect_and_ping().await {
                Ok(()) => {
                    info!(pool = %self.pool_name, id = self.id, attempt, "mongodb connection recovered");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!(pool = %self.pool_name, id = self.id, attempt, error = %e, "reconnect attempt failed");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(DbError::Connectivity(format!(
            "reconnect failed after {} attempts: {}",
            self.policy.max_attempts, last
        )))
    }

    async fn reconnect_and_ping(&mut self) -> Result<(), DbError> {
        self.reconnect().await?;
        self.handle()?.ping().await.map_err(classify)
    }

    /// Marks the connection closed and drops the driver handle. Idempotent.
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!(pool = %self.pool_name, id = self.id, "mongodb connection closed");
        }
        self.state = ConnectionState::Closed;
    }

    pub async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, DbError> {
        let ns = self.namespace(collection);
        Ok(self.handle()?.query(&ns, query).await?)
    }

    pub async fn write(&self, collection: &str, write: Write) -> Result<WriteOutcome, DbError> {
        let ns = self.namespace(collection);
        Ok(self.handle()?.write(&ns, write).await?)
    }

    /// Runs a database command against the configured database.
    pub async fn command(&self, command: Document) -> Result<Document, DbError> {
        Ok(self.handle()?.command(&self.database, command).await?)
    }

    fn handle(&self) -> Result<&dyn DriverHandle, DbError> {
        self.handle
            .as_deref()
            .ok_or_else(|| DbError::Connectivity(format!("connection {} is closed", self.id)))
    }

    pub fn namespace(&self, collection: &str) -> Namespace {
        Namespace::new(self.database.clone(), collection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != ConnectionState::Closed {
            self.state = state;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}

/// Connect failures: a rejected URI is a configuration problem, not a transport one.
fn classify_connect(err: DriverError) -> DbError {
    match err.kind {
        DriverErrorKind::InvalidArgument | DriverErrorKind::Runtime => {
            DbError::Configuration(format!("mongodb connection parameters: {}", err.message))
        }
        _ => classify(err),
    }
}

/// 组装连接串
///
/// An explicit `uri` wins and discards `uri_options`. Otherwise the URI is assembled from
/// host, port and db plus the merged option set, where `username`, `password`,
/// `replica_set` and `auth_mechanism` fill in only the options that are absent.
pub fn build_uri(config: &PoolConfig) -> Result<String, DbError> {
    if let Some(uri) = config.explicit_uri() {
        if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
            return Err(DbError::Configuration(format!(
                "mongodb uri must start with mongodb:// or mongodb+srv://, got `{}`",
                redact(uri)
            )));
        }
        return Ok(uri.to_string());
    }
    config.validate()?;

    let mut options = config.uri_options.clone();
    fill_absent(&mut options, "username", &config.username);
    fill_absent(&mut options, "password", &config.password);
    fill_absent(&mut options, "replicaSet", &config.replica_set);
    fill_absent(&mut options, "authMechanism", &config.auth_mechanism);

    let username = options.remove("username").map(|v| option_value("username", &v)).transpose()?;
    let password = options.remove("password").map(|v| option_value("password", &v)).transpose()?;

    let mut uri = String::from("mongodb://");
    if let Some(user) = username.filter(|u| !u.is_empty()) {
        uri.push_str(&encode(&user));
        if let Some(pass) = password.filter(|p| !p.is_empty()) {
            uri.push(':');
            uri.push_str(&encode(&pass));
        }
        uri.push('@');
    }
    uri.push_str(&format!("{}:{}/{}", config.host.trim(), config.port, encode(config.db.trim())));

    let mut pairs = Vec::with_capacity(options.len());
    for (key, value) in &options {
        pairs.push(format!("{}={}", encode(key), encode(&option_value(key, value)?)));
    }
    if !pairs.is_empty() {
        uri.push('?');
        uri.push_str(&pairs.join("&"));
    }
    Ok(uri)
}

fn fill_absent(
    options: &mut std::collections::BTreeMap<String, JsonValue>,
    key: &str,
    value: &str,
) {
    let absent = match options.get(key) {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if absent && !value.is_empty() {
        options.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

fn option_value(key: &str, value: &JsonValue) -> Result<String, DbError> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(DbError::Configuration(format!(
            "uri option `{key}` must be a string, number or bool, got {other}"
        ))),
    }
}

fn encode(s: &str) -> String {
    utf8_percent_encode(s, URI_COMPONENT).to_string()
}

/// The database operations run against: the path of an explicit URI, else `db`.
pub fn default_database(config: &PoolConfig) -> String {
    config
        .explicit_uri()
        .and_then(|uri| {
            let rest = uri.split_once("://")?.1;
            let path = rest.split_once('/')?.1;
            let db = path.split('?').next()?;
            (!db.is_empty()).then(|| db.to_string())
        })
        .unwrap_or_else(|| config.db.clone())
}

/// Hides the password of a URI for logging.
pub fn redact(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => match rest[..at].split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***{}", &rest[at..]),
            None => uri.to_string(),
        },
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_uri_from_parts() {
        let cfg = PoolConfig::new("db.local", 27017, "app");
        assert_eq!(build_uri(&cfg).unwrap(), "mongodb://db.local:27017/app");
    }

    #[test]
    fn credentials_fill_userinfo_and_are_encoded() {
        let cfg = PoolConfig::new("h", 1, "d")
            .username("root")
            .password("p@ss:w/rd")
            .replica_set("rs0")
            .auth_mechanism("SCRAM-SHA-256");
        assert_eq!(
            build_uri(&cfg).unwrap(),
            "mongodb://root:p%40ss%3Aw%2Frd@h:1/d?authMechanism=SCRAM-SHA-256&replicaSet=rs0"
        );
    }

    #[test]
    fn explicit_uri_options_take_precedence() {
        let cfg = PoolConfig::new("h", 1, "d")
            .username("fallback")
            .uri_option("username", "explicit")
            .replica_set("rs0")
            .uri_option("replicaSet", "rs9")
            .uri_option("ssl", true);
        assert_eq!(
            build_uri(&cfg).unwrap(),
            "mongodb://explicit@h:1/d?replicaSet=rs9&ssl=true"
        );
    }

    #[test]
    fn full_uri_overrides_everything() {
        let cfg = PoolConfig::from_uri("mongodb://u:p@a,b/orders?replicaSet=x")
            .username("ignored")
            .uri_option("ssl", true);
        assert_eq!(build_uri(&cfg).unwrap(), "mongodb://u:p@a,b/orders?replicaSet=x");
        assert_eq!(default_database(&cfg), "orders");
    }

    #[test]
    fn database_falls_back_to_db_field() {
        let cfg = PoolConfig::from_uri("mongodb://a:27017").database("fallback");
        assert_eq!(default_database(&cfg), "fallback");
    }

    #[test]
    fn malformed_parameters_are_configuration_errors() {
        let cfg = PoolConfig::from_uri("http://nope");
        assert!(matches!(build_uri(&cfg), Err(DbError::Configuration(_))));

        let cfg = PoolConfig::new("h", 1, "d").uri_option("weird", serde_json::json!([1]));
        assert!(matches!(build_uri(&cfg), Err(DbError::Configuration(_))));

        let cfg = PoolConfig::new("h", 1, "");
        assert!(matches!(build_uri(&cfg), Err(DbError::Configuration(_))));
    }

    #[test]
    fn connect_failures_are_classified() {
        let err = classify_connect(DriverError::invalid_argument("bad option"));
        assert!(matches!(err, DbError::Configuration(_)));
        let err = classify_connect(DriverError::connection("refused"));
        assert!(matches!(err, DbError::Connectivity(_)));
        let err = classify_connect(DriverError::authentication("denied"));
        assert!(matches!(err, DbError::Authentication(_)));
    }

    #[test]
    fn redacts_password() {
        assert_eq!(redact("mongodb://u:secret@h:1/d"), "mongodb://u:***@h:1/d");
        assert_eq!(redact("mongodb://h:1/d"), "mongodb://h:1/d");
        assert_eq!(redact("mongodb://u@h:1/d"), "mongodb://u@h:1/d");
        assert_eq!(redact("mongodb://u:@h:1/d"), "mongodb://u:***@h:1/d");
    }
}
