pub mod address;
pub mod connection;
pub mod error;
pub mod fdlog;

pub use address::AddressSpec;
pub use connection::Connection;
pub use error::{ConnectionError, Result};
