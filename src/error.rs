use std::panic::Location;
use thiserror::Error;

/// Failure categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad connection parameters or arguments. Fatal, never retried.
    Configuration,
    /// Credentials rejected by the server. Fatal.
    Authentication,
    /// Transport failure. Triggers the bounded reconnect loop.
    Connectivity,
    /// No connection became available within `wait_timeout`.
    PoolExhausted,
    /// A well-formed request rejected or failed at the server.
    Runtime,
    Unknown,
}

/// Failure kinds a driver reports. Classification keys on these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    InvalidArgument,
    Authentication,
    Connection,
    Runtime,
    Other,
}

/// An error raised by the underlying driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::InvalidArgument, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Authentication, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Runtime, message)
    }
}

/// Represents errors that can occur while talking to the document database.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
    /// A failure leaving the collection API, tagged with the caller's location.
    #[error("{location}: {source}")]
    Operation {
        location: &'static Location<'static>,
        source: Box<DbError>,
    },
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Configuration(_) => ErrorKind::Configuration,
            DbError::Authentication(_) => ErrorKind::Authentication,
            DbError::Connectivity(_) => ErrorKind::Connectivity,
            DbError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            DbError::Runtime(_) => ErrorKind::Runtime,
            DbError::Unknown(_) => ErrorKind::Unknown,
            DbError::Operation { source, .. } => source.kind(),
        }
    }

    /// Only connectivity failures are worth an in-place reconnect.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// Where the failing call was issued, if the error passed through the collection API.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            DbError::Operation { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Wraps the error with a call-site location. An already located error keeps its first location.
    pub fn at(self, location: &'static Location<'static>) -> Self {
        match self {
            located @ DbError::Operation { .. } => located,
            other => DbError::Operation {
                location,
                source: Box::new(other),
            },
        }
    }
}

/// Maps a driver failure onto the domain taxonomy.
pub fn classify(err: DriverError) -> DbError {
    match err.kind {
        DriverErrorKind::InvalidArgument => {
            DbError::Configuration(format!("mongo argument exception: {}", err.message))
        }
        DriverErrorKind::Authentication => {
            DbError::Authentication(format!("mongo authentication failed: {}", err.message))
        }
        DriverErrorKind::Connection => DbError::Connectivity(err.message),
        DriverErrorKind::Runtime => {
            DbError::Runtime(format!("mongo runtime exception: {}", err.message))
        }
        DriverErrorKind::Other => {
            DbError::Unknown(format!("mongo unexpected exception: {}", err.message))
        }
    }
}

impl From<DriverError> for DbError {
    fn from(e: DriverError) -> Self {
        classify(e)
    }
}
