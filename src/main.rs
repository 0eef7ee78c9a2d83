use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use twitshot::bluesky::BlueskyService;
use twitshot::browser::{BrowserEngine, ChromiumConfig, ChromiumEngine};
use twitshot::config::{Config, LogLevel};
use twitshot::handlers::{http_client, Services};
use twitshot::web::{self, AppState, RateLimiter};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let config = load_config()?;

    if config.run_mode.is_development() {
        clear_console();
    }

    init_tracing(config.log_level)?;
    config.validate().context("Invalid configuration")?;

    info!(run_mode = ?config.run_mode, "Starting twitshot");

    let engine: Arc<dyn BrowserEngine> = Arc::new(
        ChromiumEngine::launch(&ChromiumConfig {
            chrome_path: config.chrome_path.clone(),
        })
        .await
        .context("Failed to launch browser")?,
    );
    info!("Browser launched");

    let http = http_client()?;
    let bluesky = BlueskyService::init(&config, http.clone()).await;

    let limiter = RateLimiter::from_config(&config)
        .await
        .context("Failed to set up rate limiting")?;
    if config.redis_url.is_some() {
        info!("Using Redis for rate limit counters");
    }
    if !config.enable_raw_screenshots {
        info!("Raw screenshots disabled");
    }

    let state = AppState {
        services: Arc::new(Services::new(Arc::new(config), http, bluesky)),
        engine: Arc::clone(&engine),
        limiter: Arc::new(limiter),
    };

    let served = web::serve(state, shutdown_signal()).await;

    info!("Shutting down...");
    engine.shutdown().await;
    info!("Shutdown complete");

    served
}

/// Read the configuration. If that fails, logging is set up with defaults so
/// the error still reaches the console.
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => Ok(config),
        Err(e) => {
            init_tracing(LogLevel::Info)?;
            Err(e).context("Failed to load configuration")
        }
    }
}

fn init_tracing(level: LogLevel) -> Result<()> {
    let default_directive = match level {
        LogLevel::Warn | LogLevel::Error => level.as_directive().to_string(),
        _ => format!("info,twitshot={}", level.as_directive()),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        // Pretty-printed logging for development
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

fn clear_console() {
    use std::io::Write;

    let mut stdout = std::io::stdout();
    let _ = stdout
        .write_all(b"\x1b[2J\x1b[3J\x1b[H")
        .and_then(|()| stdout.flush());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
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
                error!("Failed to install signal handler: {e}");
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
}

#[cfg(test)]
mod tests {
    use super::*;

    use serial_test::serial;

    #[test]
    #[serial]
    fn test_bad_config_still_sets_up_logging() {
        std::env::set_var("PORT", "abc");
        let result = load_config();
        std::env::remove_var("PORT");

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("PORT"), "{err:#}");
        assert!(tracing::dispatcher::has_been_set());
    }
}
