mod api;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use api::AppState;
use relayruntime::{RelayRuntime, RuntimeConfig, StopFileSource, StopPoller};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_STOP_POLL_MS: u64 = 1000;

fn stop_poll_interval() -> anyhow::Result<Duration> {
    match std::env::var("RELAY_STOP_POLL_MS") {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("RELAY_STOP_POLL_MS={}: {}", raw, e))?;
            Ok(Duration::from_millis(ms.max(1)))
        }
        Err(_) => Ok(Duration::from_millis(DEFAULT_STOP_POLL_MS)),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting Relay Server");

    let config = RuntimeConfig::from_env()?;
    let registry = Arc::new(relaynodes::standard_registry());
    let runtime = Arc::new(RelayRuntime::with_registry(registry.clone(), config));

    info!("✅ Runtime initialized with standard nodes");

    let shutdown = CancellationToken::new();
    let reaper = runtime.spawn_reaper(shutdown.clone());

    let poller = match std::env::var("RELAY_STOP_DIR") {
        Ok(dir) => {
            info!("Polling {} for stop requests", dir);
            let source = Arc::new(StopFileSource::new(dir));
            Some(StopPoller::new(runtime.clone(), source, stop_poll_interval()?).spawn(shutdown.clone()))
        }
        Err(_) => None,
    };

    let app_state = web::Data::new(AppState {
        runtime,
        registry,
    });

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    shutdown.cancel();
    let _ = reaper.await;
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    info!("Server stopped");

    Ok(())
}
