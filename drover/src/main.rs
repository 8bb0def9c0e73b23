use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use drover::{App, Options, PoolConfig, RunMode};

pub static APP: Lazy<Arc<App>> = Lazy::new(|| {
    let binding = std::env::var("DROVER_LISTEN").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let app_name = std::env::var("DROVER_APP").unwrap_or_else(|_| "default".to_string());
    let app_root =
        std::env::var("DROVER_APP_ROOT").unwrap_or_else(|_| format!("/var/www/{}", app_name));
    let max: usize = std::env::var("DROVER_MAX_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(6);
    let mode = match std::env::var("DROVER_ENV").as_deref() {
        Ok("production") => RunMode::Production,
        _ => RunMode::Development,
    };

    App::new()
        .binding(binding)
        .mode(mode)
        .pool_config(PoolConfig {
            max,
            max_idle_time: Duration::from_secs(300),
        })
        .options(
            Options::new(app_name)
                .app_root(app_root)
                .min_processes(1),
        )
        .build()
});

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    APP.clone().run().await;
}
