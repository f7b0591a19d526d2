pub mod connection;
pub mod server;

pub use connection::{ClientConnection, MessageSink, MessageSource};
