use crate::error::DriverError;
use crate::udbc::request::{Namespace, Query, Write, WriteOutcome};
use async_trait::async_trait;
use bson::Document;

/// One live handle to the database server.
#[async_trait]
pub trait DriverHandle: Send + Sync {
    async fn query(&self, ns: &Namespace, query: Query) -> Result<Vec<Document>, DriverError>;

    async fn write(&self, ns: &Namespace, write: Write) -> Result<WriteOutcome, DriverError>;

    async fn command(&self, db: &str, command: Document) -> Result<Document, DriverError>;

    /// Lightweight round trip used as a liveness probe.
    async fn ping(&self) -> Result<(), DriverError>;
}
