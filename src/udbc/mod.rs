pub mod connection;
pub mod driver;
pub mod request;

pub use connection::DriverHandle;
pub use driver::Driver;
pub use request::{
    ConnectOptions, FindOptions, Namespace, Query, ReturnDocument, Write, WriteOutcome,
};
