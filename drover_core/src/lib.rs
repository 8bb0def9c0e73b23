pub mod app;
pub mod buffer;
pub mod cache;
pub mod connection;
pub mod controller;
pub mod http;
pub mod pool;

pub use app::application::{App, AppBuilder, RunMode};
pub use connection::Connection;
pub use pool::pool::Pool;
