//! # Ranked-List Server
//!
//! Hosts one shared ranked list over WebSocket. Participants each own at most
//! one short item, vote each other's items up, and chat; the list is saved to
//! disk on a debounce and archived once it fills up.
//!
//! ## Functionality:
//! - **Configuration**: Built-in defaults, then `server_rank.conf`, then
//!   `RANK_*` environment variables and command-line flags.
//! - **Logging**: Console plus a daily rotating JSON file under `logDir`.
//! - **Graceful Shutdown**: `tokio-graceful` waits for SIGINT/SIGTERM, stops
//!   accepting connections and writes both documents one final time.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info};

use lib_common::gateway;
use lib_common::{load_config, setup_logging, Config, FsStore, Hub};

/// Loads a generic `.env` file, then the platform-specific one.
fn load_dotenv() {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
}

fn process_basename() -> String {
    env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::file_stem)
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "server_rank".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    let config = load_config().context("Invalid configuration")?;
    let _guard = setup_logging(&config.log_dir, &config.log_level, &process_basename())
        .context("Failed to initialize logging")?;
    info!("{:?}", config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| tokio_main(guard, config, listener));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}

/// Runs the hub and the gateway until the shutdown guard is cancelled.
async fn tokio_main(shutdown_guard: ShutdownGuard, config: Config, listener: TcpListener) {
    let (hub, handle) = Hub::new(config, Arc::new(FsStore));

    let hub_guard = shutdown_guard.clone();
    let hub_task = tokio::spawn(hub.run(async move { hub_guard.cancelled().await }));

    let gateway_guard = shutdown_guard.clone();
    let served = gateway::serve(listener, handle, async move {
        gateway_guard.cancelled().await;
        info!("Signal received: initiate graceful shutdown");
    })
    .await;
    if let Err(e) = served {
        error!("Gateway stopped: {}", e);
    }

    if let Err(e) = hub_task.await {
        error!("Hub task failed: {}", e);
    }
}
