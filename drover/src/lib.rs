pub use drover_core::app::application::{App, AppBuilder, RunMode};
pub use drover_core::app::admin::{AdminAccount, AdminConfig};
pub use drover_core::connection::{AddressSpec, Connection};
pub use drover_core::controller::{Controller, ControllerConfig};
pub use drover_core::pool::{
    DummySpawner, GetError, Options, Pool, PoolConfig, Session, SocketProtocol, SpawnError,
    SpawnedProcess, SpawnedSocket, Spawner,
};

pub mod prelude;
