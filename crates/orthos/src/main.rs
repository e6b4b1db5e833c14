//! orthos daemon
//!
//! Fleet orchestration for lab machines: a kameo task engine driving BMC,
//! serial console and provisioning channels, served over axum.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use orthos_core::{Engine, EngineArgs, EngineSnapshot, MachineStore, Task};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod factory;
mod fleet;
mod router;
mod state;

use config::{Config, DaemonConfig, LogFormat};
use fleet::{Fleet, LocalFleet, RemoteFleet};
use state::AppState;

fn init_tracing(daemon: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&daemon.log_level));
    match daemon.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Store and queue from the snapshot, or empty ones
async fn restore(config: &Config) -> Result<(MachineStore, Vec<Task>)> {
    let capacity = config.engine.event_channel_capacity;
    let snapshot = match &config.daemon.state_path {
        Some(path) => EngineSnapshot::load(path).await?,
        None => None,
    };
    Ok(match snapshot {
        Some(snapshot) => snapshot.into_parts(capacity)?,
        None => (MachineStore::new(capacity), Vec::new()),
    })
}

/// Register `[[machine]]` entries the store does not know yet
async fn register_inventory(config: &Config, store: &MachineStore) -> Result<()> {
    for entry in &config.machine {
        if store.contains(&entry.id).await {
            debug!(machine = %entry.id, "Already known, keeping stored state");
            continue;
        }
        store.register(entry.to_machine()?).await?;
        info!(machine = %entry.id, fqdn = %entry.fqdn, "Machine registered from config");
    }
    Ok(())
}

/// Restore state, register the inventory and start the engine
async fn start_engine(config: &Config) -> Result<Engine> {
    let (store, restored_tasks) = restore(config).await?;
    let store = Arc::new(store);
    register_inventory(config, &store).await?;

    Ok(Engine::start(EngineArgs {
        config: config.engine_config(),
        store,
        adapters: factory::build_adapters(config)?,
        prober: factory::build_prober(config),
        restored_tasks,
    }))
}

async fn persist(engine: &Engine, path: &Path) {
    match engine.snapshot().await {
        Ok(snapshot) => {
            if let Err(e) = snapshot.save(path).await {
                warn!(error = %e, path = %path.display(), "Snapshot write failed");
            }
        }
        Err(e) => warn!(error = %e, "Snapshot could not be taken"),
    }
}

fn spawn_persister(engine: Engine, path: PathBuf, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            persist(&engine, &path).await;
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = Config::locate();
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    init_tracing(&config.daemon);

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => warn!("no config file found, using defaults"),
    }

    let mode = config.daemon.mode;
    let (fleet, engine): (Arc<dyn Fleet>, Option<Engine>) = if mode.runs_tasks() {
        let engine = start_engine(&config).await?;
        (Arc::new(LocalFleet::new(engine.clone())), Some(engine))
    } else {
        if config.daemon.state_path.is_some() {
            warn!("state_path is ignored in web mode, the taskmanager persists");
        }
        let url = config.taskmanager_url()?;
        let fleet = RemoteFleet::connect(url, config.engine.event_channel_capacity)?;
        (Arc::new(fleet), None)
    };

    let persister = engine
        .clone()
        .zip(config.daemon.state_path.clone())
        .map(|(engine, path)| spawn_persister(engine, path, config.persist_interval()));

    let app = router::create_router(Arc::new(AppState::new(fleet, mode)));
    let listener = TcpListener::bind(&config.daemon.bind).await?;
    info!(bind = %config.daemon.bind, %mode, "orthos listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = persister {
        handle.abort();
    }
    if let Some(engine) = &engine {
        if let Some(path) = &config.daemon.state_path {
            persist(engine, path).await;
        }
        engine.shutdown().await;
    }
    info!("orthos stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use orthos_core::{Architecture, Machine, SystemClass, TaskAction, TaskState};

    use super::*;
    use crate::config::MachineEntry;

    fn entry(id: &str) -> MachineEntry {
        MachineEntry {
            id: id.to_string(),
            fqdn: format!("{id}.example.com"),
            architecture: "aarch64".to_string(),
            system: "KVM".to_string(),
            bmc: None,
            maintenance: false,
        }
    }

    #[tokio::test]
    async fn test_restore_without_state_path_is_empty() {
        let (store, tasks) = restore(&Config::default()).await.unwrap();
        assert!(store.snapshot().await.0.is_empty());
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_restore_and_inventory_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut known = Machine::new(
            "m1",
            "m1.example.com",
            Architecture::Aarch64,
            SystemClass::BareMetal,
        )
        .unwrap();
        known.maintenance = true;
        let mut task = Task::new("m1", TaskAction::PowerOn, "alice");
        task.state = TaskState::Running;
        EngineSnapshot::new(vec![known], Default::default(), vec![task])
            .save(&path)
            .await
            .unwrap();

        let mut config = Config::default();
        config.daemon.state_path = Some(path);
        config.machine = vec![entry("m1"), entry("m2")];

        let (store, tasks) = restore(&config).await.unwrap();
        assert_eq!(tasks.len(), 1);
        register_inventory(&config, &store).await.unwrap();

        // stored state wins over the config entry
        let m1 = store.get("m1").await.unwrap();
        assert_eq!(m1.system, SystemClass::BareMetal);
        assert!(m1.maintenance);
        assert_eq!(store.get("m2").await.unwrap().system, SystemClass::Kvm);
    }

    #[tokio::test]
    async fn test_bad_inventory_entry_fails_startup() {
        let store = MachineStore::new(16);
        let mut config = Config::default();
        let mut bad = entry("m1");
        bad.architecture = "embedded".to_string();
        config.machine = vec![bad];
        assert!(register_inventory(&config, &store).await.is_err());
    }
}
