use power_tree::{
    build_tree,
    config::Config,
    engine::Engine,
    host::{LiveStateSource, RegistrySnapshot, RestClient},
    tree::Node,
    units,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "power_tree=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting power-tree");

    // Load configuration
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());

    let config = Config::load(&config_path)?;
    info!("Configuration loaded from: {}", config_path);
    let engine_config = Arc::new(config.resolve());

    let snapshot = RegistrySnapshot::load(&config.host.registry_snapshot)?;
    let client = Arc::new(RestClient::new(
        config.host.base_url.clone(),
        config.host.token.clone(),
    )?);

    let states = match client.fetch_states().await {
        Ok(states) => states,
        Err(e) => {
            warn!(error = %e, "host unreachable, building from snapshot states");
            snapshot.live_states()
        }
    };

    let forest = build_tree(&snapshot.registries, &states, &engine_config);
    info!(
        roots = forest.len(),
        nodes = power_tree::tree::flatten(&forest).len(),
        "power tree built"
    );

    let handle = Engine::spawn(forest, engine_config, client.clone(), client);
    let mut snapshots = handle.subscribe();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("engine stopped unexpectedly");
                    break;
                }
                let forest = snapshots.borrow_and_update().clone();
                log_roots(&forest);
            }
        }
    }

    handle.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn log_roots(forest: &[Node]) {
    for root in forest {
        let (value, unit) = units::display_power(root.power());
        debug!(
            node = %root.id,
            name = %root.name,
            buckets = root.power_history.len(),
            "{:.1} {}",
            value,
            unit
        );
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
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
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
