//! Reel job service binary: API server plus worker pool in one process.

use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reel_api::{
    bootstrap, create_router, drain, metrics, panic_hook, start_or_interrupt, AdmissionConfig,
    ApiConfig, DrainReason, Lifecycle, LifecycleState, Startup,
};
use reel_downloader::DownloaderConfig;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required for rustls 0.23+)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    init_tracing();
    info!("Starting reel-api");

    let lifecycle = Lifecycle::new();

    // Load configuration
    let config = ApiConfig::from_env();
    let admission = AdmissionConfig::from_env();
    info!(
        host = %config.host,
        port = config.port,
        environment = %config.environment,
        "API config loaded"
    );

    if let Err(e) = DownloaderConfig::from_env().locate_ytdlp() {
        warn!("yt-dlp not found, cookie and direct strategies will fail: {}", e);
    }

    // Faults from any thread land here and trigger a drain
    let (fault_tx, fault_rx) = mpsc::unbounded_channel();
    panic_hook::install(fault_tx);

    // Listen for drain triggers before acquiring anything, so a signal during
    // startup is honored too
    let (reason_tx, reason_rx) = watch::channel::<Option<DrainReason>>(None);
    tokio::spawn(async move {
        let reason = wait_for_drain_trigger(fault_rx).await;
        let _ = reason_tx.send(Some(reason));
    });

    let metrics_handle = if config.metrics_enabled {
        match metrics::init_metrics() {
            Ok(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                Some(handle)
            }
            Err(e) => {
                warn!("Failed to install metrics recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut startup_trigger = reason_rx.clone();
    let startup = bootstrap(config.clone(), admission, lifecycle.clone());
    let ctx = match start_or_interrupt(startup, &lifecycle, &mut startup_trigger).await {
        Startup::Ready(ctx) => ctx,
        Startup::Failed(e) => {
            error!(state = %lifecycle.state(), "Startup failed: {:#}", e);
            return ExitCode::FAILURE;
        }
        Startup::Interrupted(reason) if reason.is_fault() => return ExitCode::FAILURE,
        Startup::Interrupted(_) => return ExitCode::SUCCESS,
    };

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, "Failed to bind listener: {}", e);
            let _ = drain(ctx, DrainReason::ListenerFailed(e.to_string())).await;
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = lifecycle.advance(LifecycleState::Listening) {
        error!("{}", e);
        let _ = drain(ctx, DrainReason::ListenerFailed(e.to_string())).await;
        return ExitCode::FAILURE;
    }
    info!(addr = %addr, "Listening");

    let app = create_router(ctx.state.clone(), metrics_handle);
    let trigger = ctx.drain_trigger();
    let mut drain_requested = reason_rx.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = drain_requested.wait_for(Option::is_some).await;
        // Readiness flips and dequeues stop before in-flight requests finish
        trigger.fire();
    })
    .await;

    let reason = match served {
        Ok(()) => drain_reason(&reason_rx),
        Err(e) => {
            error!("Server error: {}", e);
            DrainReason::ListenerFailed(e.to_string())
        }
    };
    info!(reason = %reason, "HTTP listener stopped");

    let fault = reason.is_fault();
    match drain(ctx, reason).await {
        Ok(()) if !fault => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(()) => ExitCode::FAILURE,
        Err(e) => {
            error!("Drain failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::from_default_env().add_directive("reel=info".parse().expect("static directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

fn drain_reason(rx: &watch::Receiver<Option<DrainReason>>) -> DrainReason {
    rx.borrow().clone().unwrap_or(DrainReason::Signal("none"))
}

/// Resolve on SIGTERM, SIGINT or the first reported panic.
async fn wait_for_drain_trigger(mut faults: mpsc::UnboundedReceiver<String>) -> DrainReason {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, initiating shutdown");
            DrainReason::Signal("SIGINT")
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
            DrainReason::Signal("SIGTERM")
        }
        Some(record) = faults.recv() => {
            error!("Uncaught fault, initiating shutdown");
            DrainReason::Panic(record)
        }
    }
}
