pub mod codec;
pub mod connection;
pub mod driver;

pub use connection::MongoHandle;
pub use driver::MongoDriver;
