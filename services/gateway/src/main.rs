use std::process::ExitCode;

use gateway::config::Config;
use gateway::{db, tcp, AppState};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    info!("connecting to database...");
    let pool = match db::create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "store unreachable at startup");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = db::run_migrations(&pool).await {
        error!(error = %e, "migrations failed");
        return ExitCode::from(2);
    }
    info!("migrations applied");

    let tcp_listener = match tokio::net::TcpListener::bind(&config.tcp_listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.tcp_listen_addr, error = %e, "tcp bind failed");
            return ExitCode::from(1);
        }
    };
    let http_listener = match tokio::net::TcpListener::bind(&config.http_listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.http_listen_addr, error = %e, "http bind failed");
            return ExitCode::from(1);
        }
    };
    info!(
        tcp = %config.tcp_listen_addr,
        http = %config.http_listen_addr,
        instance = %config.instance_id,
        "gateway listening"
    );

    let state = AppState::new(pool, config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = gateway::spawn_workers(&state, &shutdown_rx);
    tasks.push(tokio::spawn(tcp::listener::run(
        state.clone(),
        tcp_listener,
        shutdown_rx.clone(),
    )));

    let router = gateway::build_router(state);
    let graceful = async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    };
    if let Err(e) = axum::serve(http_listener, router)
        .with_graceful_shutdown(graceful)
        .await
    {
        error!(error = %e, "http server error");
        return ExitCode::FAILURE;
    }

    // Give the workers a moment to drain before the process exits; unsent
    // outbound rows stay pending for other instances.
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
    info!("gateway shut down gracefully");
    ExitCode::SUCCESS
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "installing Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C, shutting down"); }
        () = terminate => { info!("received SIGTERM, shutting down"); }
    }
}
