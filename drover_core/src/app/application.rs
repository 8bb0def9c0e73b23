//! The App ties the pieces together: listeners, worker loops, the pool, the
//! controller, the admin endpoint, and signal-driven shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::connection::Connection;
use crate::controller::{Controller, ControllerConfig};
use crate::pool::{DummySpawner, Options, Pool, PoolConfig, Spawner};

use super::admin::{AdminConfig, AdminServer};
use super::balancer::{bind_listener, run_accept_balancer};

/// RunMode enum to represent the mode of the application.
/// Production: terse pages and logs, no sensitive details.
/// Development: friendly error pages with spawn details. May contain
/// sensitive info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Production,
    Development,
}

pub struct App {
    pub binding_address: String,
    pub mode: RunMode,
    pub workers: usize,
    pub shutdown_drain_time: Duration,
    controller: Arc<Controller>,
    admin: Option<Arc<AdminServer>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
}

/// Builder for App.
pub struct AppBuilder {
    binding_address: Option<String>,
    admin_config: Option<AdminConfig>,
    mode: Option<RunMode>,
    workers: Option<usize>,
    shutdown_drain_time: Option<Duration>,
    pool_config: PoolConfig,
    controller_config: Option<ControllerConfig>,
    spawner: Option<Arc<dyn Spawner>>,
    default_options: Option<Options>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            binding_address: None,
            admin_config: None,
            mode: None,
            workers: None,
            shutdown_drain_time: None,
            pool_config: PoolConfig::default(),
            controller_config: None,
            spawner: None,
            default_options: None,
        }
    }

    pub fn binding<T: Into<String>>(mut self, binding: T) -> Self {
        self.binding_address = Some(binding.into());
        self
    }

    pub fn admin(mut self, config: AdminConfig) -> Self {
        self.admin_config = Some(config);
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn shutdown_drain_time(mut self, time: Duration) -> Self {
        self.shutdown_drain_time = Some(time);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn controller_config(mut self, config: ControllerConfig) -> Self {
        self.controller_config = Some(config);
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn application<T: Into<String>>(mut self, app_group_name: T) -> Self {
        self.default_options = Some(Options::new(app_group_name));
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.default_options = Some(options);
        self
    }

    pub fn build(self) -> Arc<App> {
        let binding_address = self
            .binding_address
            .unwrap_or_else(|| String::from("127.0.0.1:3000"));
        let mode = self.mode.unwrap_or(RunMode::Development);
        let workers = self.workers.unwrap_or_else(num_cpus);
        let shutdown_drain_time = self
            .shutdown_drain_time
            .unwrap_or_else(|| Duration::from_secs(5));
        let spawner = self
            .spawner
            .unwrap_or_else(|| Arc::new(DummySpawner::new(1)));
        let default_options = self
            .default_options
            .unwrap_or_else(|| Options::new("default"));

        let pool = Pool::new(self.pool_config, spawner);
        let mut controller_config = self
            .controller_config
            .unwrap_or_else(|| ControllerConfig::new(default_options));
        if mode == RunMode::Development {
            controller_config.friendly_error_pages = true;
        }
        if let Some((_, port)) = binding_address.rsplit_once(':') {
            controller_config.server_port = port.to_string();
        }
        let controller = Controller::new(pool.clone(), controller_config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let admin = self.admin_config.map(|config| {
            AdminServer::new(
                pool.clone(),
                config,
                format!(
                    "{{\"binding_address\": \"{}\", \"workers\": {}, \"pool_max\": {}}}\n",
                    binding_address,
                    workers.max(1),
                    pool.config().max
                ),
                shutdown_tx.clone(),
            )
        });

        Arc::new(App {
            binding_address,
            mode,
            workers: workers.max(1),
            shutdown_drain_time,
            controller,
            admin,
            shutdown_tx,
            shutdown_rx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn pool(&self) -> &Arc<Pool> {
        self.controller.pool()
    }

    pub fn get_mode(self: &Arc<Self>) -> RunMode {
        self.mode.clone()
    }

    /// Requests a graceful shutdown, as SIGTERM would.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handles a single accepted connection.
    pub fn handle_connection(self: &Arc<Self>, stream: TcpStream, remote_addr: String) {
        let controller = self.controller.clone();
        let active = self.active_connections.clone();
        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let conn = Connection::new_tcp(stream, "client connection");
            controller.handle_connection(conn, remote_addr).await;
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Main loop: bind, accept (directly or through the balancer), serve
    /// until a shutdown signal, then drain.
    pub async fn run(self: Arc<Self>) {
        let listener = match bind_listener(&self.binding_address) {
            Ok(listener) => listener,
            Err(e) => {
                error!("binding failed on {}: {}", self.binding_address, e);
                return;
            }
        };
        info!(
            address = %self.binding_address,
            workers = self.workers,
            "drover core agent listening"
        );

        let gc = self.pool().start_idle_gc();
        self.spawn_signal_handlers();
        if let Some(admin) = &self.admin {
            let admin = admin.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = admin.run(shutdown).await {
                    error!("admin endpoint failed: {}", e);
                }
            });
        }

        let mut shutdown = self.shutdown_rx.clone();
        if self.workers > 1 {
            // Multi-worker mode: the balancer owns the listening socket and
            // feeds per-worker channels.
            let mut worker_txs = Vec::new();
            for worker in 0..self.workers {
                let (tx, mut rx) = mpsc::unbounded_channel::<TcpStream>();
                worker_txs.push(tx);
                let app = self.clone();
                tokio::spawn(async move {
                    while let Some(stream) = rx.recv().await {
                        let remote_addr = stream
                            .peer_addr()
                            .map(|a| a.ip().to_string())
                            .unwrap_or_else(|_| String::from("unknown"));
                        app.handle_connection(stream, remote_addr);
                    }
                    info!(worker, "worker loop finished");
                });
            }
            run_accept_balancer(listener, worker_txs, shutdown).await;
        } else {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let _ = stream.set_nodelay(true);
                                self.handle_connection(stream, addr.ip().to_string());
                            }
                            Err(e) => {
                                warn!("failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }

        self.drain().await;
        gc.abort();
        info!("drover core agent shutdown complete");
    }

    /// Stops taking new work and waits for in-flight requests, bounded by
    /// the drain timeout; whatever remains is cut off with the pool.
    async fn drain(&self) {
        info!(
            "draining {} in-flight connection(s)",
            self.active_connections.load(Ordering::Relaxed)
        );
        let deadline = tokio::time::Instant::now() + self.shutdown_drain_time;
        while self.active_connections.load(Ordering::Relaxed) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftover = self.active_connections.load(Ordering::Relaxed);
        if leftover > 0 {
            warn!("{} connection(s) still active after drain timeout", leftover);
        }
        self.pool().shutdown();
    }

    fn spawn_signal_handlers(self: &Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("cannot install SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received interrupt; shutting down"),
                _ = term.recv() => info!("received SIGTERM; shutting down gracefully"),
            }
            let _ = shutdown_tx.send(true);
        });

        // SIGQUIT dumps the pool state without stopping anything.
        let pool = self.pool().clone();
        tokio::spawn(async move {
            let Ok(mut quit) = signal(SignalKind::quit()) else {
                return;
            };
            while quit.recv().await.is_some() {
                info!("\n{}", pool.inspect());
            }
        });
    }
}

// Helper function for determining CPU count.
fn num_cpus() -> usize {
    static COUNT: once_cell::sync::Lazy<usize> = once_cell::sync::Lazy::new(|| {
        match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(_) => 1,
        }
    });
    *COUNT
}
