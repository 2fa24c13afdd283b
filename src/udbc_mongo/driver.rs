use async_trait::async_trait;
use mongodb::Client;
use mongodb::options::ClientOptions;

use crate::error::DriverError;
use crate::udbc::{ConnectOptions, Driver, DriverHandle};
use crate::udbc_mongo::codec::{from_mongo_error, seconds};
use crate::udbc_mongo::connection::MongoHandle;

const MONGODB_DRIVER: &str = "mongodb";

/// Opens one `mongodb::Client` per pooled connection.
///
/// The client's own pool is capped at a single connection so that sizing, waiting and
/// liveness are governed by [`crate::pool::Pool`] alone.
#[derive(Debug, Clone, Default)]
pub struct MongoDriver;

impl MongoDriver {
    pub fn new() -> Self {
        Self
    }

    async fn client_options(
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<ClientOptions, DriverError> {
        let mut client_options = ClientOptions::parse(uri).await.map_err(from_mongo_error)?;
        if !options.connect_timeout.is_zero() {
            client_options.connect_timeout = Some(options.connect_timeout);
            client_options.server_selection_timeout = Some(options.connect_timeout);
        }
        client_options.max_pool_size = Some(1);
        client_options.min_pool_size = Some(0);

        let driver_options = &options.driver_options;
        if let Some(name) = driver_options.get("app_name").and_then(|v| v.as_str()) {
            client_options.app_name = Some(name.to_string());
        }
        if let Some(timeout) = driver_options.get("server_selection_timeout").and_then(seconds) {
            client_options.server_selection_timeout = Some(timeout);
        }
        if let Some(direct) = driver_options.get("direct_connection").and_then(|v| v.as_bool()) {
            client_options.direct_connection = Some(direct);
        }
        Ok(client_options)
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn name(&self) -> &str {
        MONGODB_DRIVER
    }

    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn DriverHandle>, DriverError> {
        let client_options = Self::client_options(uri, options).await?;
        let database = client_options
            .default_database
            .clone()
            .unwrap_or_else(|| "admin".to_string());
        let client = Client::with_options(client_options).map_err(from_mongo_error)?;
        let handle = MongoHandle::new(client, database);
        // the client connects lazily; a ping makes connect failures surface here
        handle.ping().await?;
        Ok(Box::new(handle))
    }
}
