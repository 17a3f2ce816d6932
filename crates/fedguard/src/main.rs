use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use audit_log::{AuditFlusher, AuditKind, AuditWriter};
use fedguard::cli::Cli;
use fedguard::{build_router, config, Services};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let loaded = config::load(&cli.config)?;
    let config_found = loaded.is_some();
    let mut cfg = loaded.unwrap_or_default();
    cli.apply(&mut cfg);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if !config_found {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    info!(
        config_file = %cli.config.display(),
        policy_file = %cfg.policy.file.display(),
        listen = %cfg.server.listen_addr,
        cache = cfg.cache.enabled,
        "fedguard starting"
    );

    // 4. Build store, engine and audit log.
    let services = Services::from_config(&cfg);
    info!(engine = ?services.engine, "decision engine ready");

    // 5. Start the audit flusher.
    let writer = match &cfg.audit.log_path {
        Some(path) => Some(
            AuditWriter::new(path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?,
        ),
        None => None,
    };
    let flusher = AuditFlusher::spawn(
        services.audit.clone(),
        writer,
        Duration::from_millis(cfg.audit.flush_interval_ms),
    );

    // 6. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx_signal.send(());
    });

    // 7. Serve the HTTP API.
    let listener = tokio::net::TcpListener::bind(&cfg.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.listen_addr))?;
    info!(listen = %cfg.server.listen_addr, "serving decision API");

    let router = build_router(services.app_state());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;

    // 8. Log shutdown and drain the audit buffer.
    info!("fedguard shutting down");
    services.audit.append(
        AuditKind::Custom,
        serde_json::json!({
            "event": "engine_stop",
            "serve_result": format!("{:?}", served),
        }),
    );
    flusher.shutdown().await;

    served.context("HTTP server failed")?;
    Ok(())
}
