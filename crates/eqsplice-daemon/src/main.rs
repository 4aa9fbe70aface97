// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! eqsplice daemon - keeps per-device EQ filters wired into the PipeWire graph.
//!
//! Connects to the server, mirrors its graph and re-runs the EQ reconciler
//! whenever the topology changes, until SIGTERM or SIGINT.

use eqsplice::audio::{ChangeFlags, EventLoopThread, GraphMirror, GraphStore, LoopStatus};
use eqsplice::config::{AppConfig, ConfigManager, PresetStore};
use eqsplice::eq::{EqReconciler, ReconcilerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

const FALLBACK_DIRECTIVE: &str = "eqsplice=info";

fn init_logging(directive: &str) {
    let directive = directive
        .parse::<Directive>()
        .or_else(|_| FALLBACK_DIRECTIVE.parse::<Directive>());
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = directive {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn next_status(rx: &mut Option<UnboundedReceiver<LoopStatus>>) -> Option<LoopStatus> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_manager = ConfigManager::new()?;
    let loaded = config_manager.load_config();
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };

    init_logging(&config.log.directive);
    info!("eqsplice daemon starting...");
    if let Err(e) = loaded {
        warn!(
            "Failed to load {}: {}; using defaults",
            config_manager.config_path().display(),
            e
        );
    }

    let store = Arc::new(GraphStore::new(config.graph.debounce()));
    let mut changes = store.subscribe();

    let pw = match EventLoopThread::connect(&config.connection, store.clone()) {
        Ok(pw) => Arc::new(pw),
        Err(e) => {
            error!("Failed to connect to PipeWire: {}", e);
            return Err(e.into());
        }
    };
    let mut status = pw.status_events();

    let mirror = Arc::new(GraphMirror::new(store, pw.clone()));
    let presets: Arc<dyn PresetStore> = Arc::new(config_manager.preset_store());
    let settings = ReconcilerSettings::from(&config.eq);
    let retry_period = settings.filter_retry.max(Duration::from_secs(1));
    let reconciler = EqReconciler::new(mirror, pw.clone(), presets, settings);

    // The handshake waited for the initial registry burst.
    reconciler.reconcile_all();
    info!("eqsplice daemon ready");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut retry = tokio::time::interval(retry_period);
    let mut lost_connection = false;

    loop {
        tokio::select! {
            Some(flags) = changes.recv() => {
                debug!("Graph changed: {:?}", flags);
                if flags.intersects(ChangeFlags::TOPOLOGY | ChangeFlags::METADATA) {
                    reconciler.reconcile_all();
                }
            }
            _ = retry.tick() => {
                // Filter failures and backoff expiry do not touch the graph.
                reconciler.reconcile_all();
            }
            Some(event) = next_status(&mut status) => {
                match event {
                    LoopStatus::ConnectionChanged(true) => info!("Connected to PipeWire"),
                    LoopStatus::ConnectionChanged(false) => {
                        error!("Lost connection to PipeWire");
                        lost_connection = true;
                        break;
                    }
                    LoopStatus::Error(message) => warn!("PipeWire error: {}", message),
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    reconciler.shutdown();
    pw.shutdown();

    info!("eqsplice daemon stopped");
    if lost_connection {
        return Err("connection to PipeWire lost".into());
    }
    Ok(())
}
