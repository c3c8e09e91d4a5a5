//! # Slate Node Entry Point
//!
//! Hosts the control-plane agent as a standalone daemon.
//!
//! ## Configuration Modes
//!
//! ```text
//! slate-node <config.toml>   load a TOML file, then apply SLATE_* overrides
//! slate-node env             build entirely from SLATE_* environment variables
//! slate-node                 same as `env`
//! ```
//!
//! Recognized variables: `SLATE_NODE_ID`, `SLATE_CONTROLLERS`
//! (comma-separated base URLs), `SLATE_HEARTBEAT_MS`, `SLATE_HTTP_PORT`,
//! `SLATE_LAYOUT_DIR`, `SLATE_FAILED_VOLUMES_TOLERATED` and
//! `SLATE_AUTH_TOKEN` (bearer token for controller sessions).
//!
//! ## Shutdown
//!
//! The daemon stops on SIGINT or when the agent escalates a fatal
//! condition through its stop hook; both paths run the same ordered
//! `stop_daemon` sequence.
//!
//! This binary publishes the in-memory reference engine. A production
//! deployment links the agent as a library and publishes its real
//! storage engine into the slot instead.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use slate_common::config::AgentConfig;
use slate_node::http::{self, AppState};
use slate_node::reports::InMemoryRevocationList;
use slate_node::upgrade::{
    FileLayoutStore, InMemoryLayoutStore, LayoutVersionStore, SOFTWARE_LAYOUT_VERSION,
};
use slate_node::{
    ControllerEndpoint, DownloadAndImportReplicator, EngineSlot, HttpContainerDownloader,
    HttpControllerClient, InMemoryEngine, NodeStateMachine, NodeStopService,
};

/// Fatal escalation hook: wakes the main task, which then runs the
/// ordered shutdown sequence.
struct NotifyStopService {
    notify: Arc<Notify>,
}

impl NodeStopService for NotifyStopService {
    fn stop_service(&self) {
        self.notify.notify_one();
    }
}

fn load_config() -> Result<AgentConfig, String> {
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("env") => AgentConfig::from_env().map_err(|e| e.to_string()),
        Some("--help") | Some("-h") => Err(usage(&args[0])),
        Some(path) => AgentConfig::load(path).map_err(|e| e.to_string()),
    }
}

fn usage(program: &str) -> String {
    format!(
        "usage: {} [<config.toml> | env]\n\
         environment: SLATE_NODE_ID, SLATE_CONTROLLERS, SLATE_HEARTBEAT_MS,\n\
         SLATE_HTTP_PORT, SLATE_LAYOUT_DIR, SLATE_FAILED_VOLUMES_TOLERATED,\n\
         SLATE_AUTH_TOKEN",
        program
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    // Two-phase engine publish: built privately, published once.
    let engine_slot = Arc::new(EngineSlot::new());
    engine_slot.publish(InMemoryEngine::new().handle())?;

    let auth_token = env::var("SLATE_AUTH_TOKEN").ok();
    let endpoints: Vec<Arc<dyn ControllerEndpoint>> = config
        .controller_endpoints
        .iter()
        .map(|base| {
            HttpControllerClient::new(base.clone(), auth_token.clone(), Duration::from_secs(10))
                .map(|client| Arc::new(client) as Arc<dyn ControllerEndpoint>)
        })
        .collect::<Result<_, _>>()?;
    if endpoints.is_empty() {
        warn!("no controller endpoints configured; the agent will idle");
    }

    let downloader = HttpContainerDownloader::new(auth_token, Duration::from_secs(60))?;
    let replicator = Arc::new(DownloadAndImportReplicator::new(
        downloader,
        Arc::clone(&engine_slot),
    ));

    let layout_store: Arc<dyn LayoutVersionStore> = match &config.layout_dir {
        Some(dir) => Arc::new(FileLayoutStore::open(dir, SOFTWARE_LAYOUT_VERSION)?),
        None => Arc::new(InMemoryLayoutStore::at_version(SOFTWARE_LAYOUT_VERSION)),
    };

    let fatal = Arc::new(Notify::new());
    let machine = NodeStateMachine::new(
        config.clone(),
        engine_slot,
        replicator,
        endpoints,
        layout_store,
        Arc::new(InMemoryRevocationList::new()),
        Arc::new(NotifyStopService {
            notify: Arc::clone(&fatal),
        }),
    )?;

    machine.start_daemon();

    let http_shutdown = Arc::new(Notify::new());
    if let Some(port) = config.http_port {
        let state = AppState::new(Arc::clone(&machine));
        let shutdown = Arc::clone(&http_shutdown);
        tokio::spawn(async move {
            if let Err(e) = http::serve(port, state, shutdown).await {
                error!(error = %e, "observability endpoint failed");
            }
        });
    }

    info!(node_id = machine.node_id(), "slate node agent running");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = fatal.notified() => {
            error!("fatal condition reported, shutting down");
        }
    }

    http_shutdown.notify_waiters();
    machine.stop_daemon().await;
    machine.join().await;
    info!("slate node agent exited");
    Ok(())
}
