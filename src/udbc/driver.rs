use crate::error::DriverError;
use crate::udbc::connection::DriverHandle;
use crate::udbc::request::ConnectOptions;
use async_trait::async_trait;

/// Builds live server handles. One call yields one exclusively owned handle.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn DriverHandle>, DriverError>;
}
