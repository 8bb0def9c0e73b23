pub mod admin;
pub mod application;
pub mod balancer;

pub use application::{App, AppBuilder, RunMode};
