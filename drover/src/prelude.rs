pub use once_cell::sync::Lazy;

pub use crate::{App, AppBuilder, RunMode};
pub use crate::{AdminAccount, AdminConfig};
pub use crate::{ControllerConfig, Options, PoolConfig};
pub use crate::{SocketProtocol, SpawnError, SpawnedProcess, SpawnedSocket, Spawner};

pub use std::sync::Arc;
pub use std::time::Duration;
pub use tokio;

pub type SApp = Lazy<Arc<App>>;
