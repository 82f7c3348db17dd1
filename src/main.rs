mod admin;
mod backend;
mod cli;
mod config;
mod dispatcher;
mod event_hub;
mod proxy;
mod registry;
mod scheduler;
mod server;
mod task;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use admin::ManagementHub;
use backend::http::HttpBackendClient;
use backend::BackendClientPool;
use config::{BackendConfig, Config};
use dispatcher::Dispatcher;
use event_hub::EventHub;
use registry::BackendRegistry;
use task::TaskStore;

/// Everything the HTTP surface (proxy + admin) needs, shared behind `Arc`
/// (spec.md §4.10 "Application wiring").
pub struct App {
    pub registry: Arc<BackendRegistry>,
    pub tasks: Arc<TaskStore>,
    pub clients: Arc<BackendClientPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub event_hub: Arc<EventHub>,
    pub management: Arc<ManagementHub>,
    pub config: Config,
    pub http: reqwest::Client,
    pub health_trigger: Arc<Notify>,
    reader_shutdown: Arc<Notify>,
}

impl App {
    /// Register a new backend at runtime (spec.md §6 `POST /lb/backends`):
    /// adds it to the Registry, builds its client, and starts its Event Hub
    /// reader — the same three steps `initialize` performs for every
    /// config-file backend at startup.
    pub async fn add_backend(&self, config: BackendConfig) -> anyhow::Result<()> {
        self.registry.add(config.clone())?;
        let client = HttpBackendClient::new(&config, self.config.health_check.timeout)?;
        self.clients.insert(config.name.clone(), Arc::new(client));
        self.event_hub.spawn_reader(
            &config.name,
            self.clients.clone(),
            self.tasks.clone(),
            self.dispatcher.clone(),
            self.reader_shutdown.clone(),
        );
        self.dispatcher.notify_capacity();
        Ok(())
    }

    /// Remove a backend (spec.md §6 `DELETE /lb/backends/{name}`). The
    /// Registry enforces disabled+drained before allowing this.
    pub fn remove_backend(&self, name: &str) -> anyhow::Result<()> {
        self.registry.remove(name)?;
        self.clients.remove(name);
        Ok(())
    }
}

async fn initialize(config_path: &std::path::Path) -> anyhow::Result<Arc<App>> {
    let config = Config::load(config_path)?;

    info!(
        config_path = %config_path.display(),
        backends = config.backends.len(),
        "comfy-lb starting"
    );

    let registry = BackendRegistry::new();
    let tasks = TaskStore::new(config.queue.max_size);
    let clients = BackendClientPool::new();
    let dispatcher = Dispatcher::new(
        registry.clone(),
        tasks.clone(),
        clients.clone(),
        config.scheduler.clone(),
        config.queue.clone(),
    );
    let event_hub = EventHub::new();
    let management = ManagementHub::new();
    let http = reqwest::Client::builder()
        .timeout(config.health_check.timeout)
        .build()?;
    let health_trigger = Arc::new(Notify::new());
    let reader_shutdown = Arc::new(Notify::new());

    for backend_config in &config.backends {
        registry.add(backend_config.clone())?;
        let client = HttpBackendClient::new(backend_config, config.health_check.timeout)?;
        clients.insert(backend_config.name.clone(), Arc::new(client));
        event_hub.spawn_reader(
            &backend_config.name,
            clients.clone(),
            tasks.clone(),
            dispatcher.clone(),
            reader_shutdown.clone(),
        );
    }

    Ok(Arc::new(App {
        registry,
        tasks,
        clients,
        dispatcher,
        event_hub,
        management,
        config,
        http,
        health_trigger,
        reader_shutdown,
    }))
}

/// Spawn every background loop the balancer needs while it's up: the
/// dispatch loop, the health-check poller, the history-poll fallback, and
/// the management-channel relay (spec.md §4.10).
fn spawn_background_tasks(app: Arc<App>, app_shutdown: Arc<Notify>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(app.dispatcher.clone().run()));

    handles.push(tokio::spawn(backend::health::run(
        app.registry.clone(),
        app.clients.clone(),
        app.tasks.clone(),
        app.dispatcher.clone(),
        app.config.health_check.clone(),
        app.config.queue.clone(),
        app.health_trigger.clone(),
        app_shutdown.clone(),
    )));

    handles.push(tokio::spawn(dispatcher::run_history_poll_fallback(
        app.dispatcher.clone(),
        app.tasks.clone(),
        app.clients.clone(),
        app.config.health_check.interval,
        app_shutdown.clone(),
    )));

    handles.push(tokio::spawn(admin::run_relay(app.clone(), app_shutdown.clone())));

    handles
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

/// Grace period for `dispatching` tasks to settle before the process exits
/// (spec.md §5 "Dispatcher stops accepting new tasks, waits up to a grace
/// period for dispatching tasks to settle").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = cli::Cli::parse();

    let app = match initialize(&cli.config).await {
        Ok(app) => app,
        Err(err) => {
            error!(error = %err, "failed to start comfy-lb");
            return ExitCode::from(1);
        }
    };

    let app_shutdown = Arc::new(Notify::new());
    let server_shutdown = Arc::new(Notify::new());
    let mut handles = spawn_background_tasks(app.clone(), app_shutdown.clone());

    let mut server_handle = tokio::spawn(server::start(app.clone(), server_shutdown.clone()));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => return ExitCode::SUCCESS,
                Ok(Err(err)) => {
                    error!(error = %err, "server failed to bind");
                    return ExitCode::from(2);
                }
                Err(err) => {
                    error!(error = %err, "server task panicked");
                    return ExitCode::from(2);
                }
            }
        }
    }

    info!("shutting down");
    app.dispatcher.begin_shutdown();
    app_shutdown.notify_waiters();
    server_shutdown.notify_waiters();

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = server_handle.await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    })
    .await;

    ExitCode::SUCCESS
}
