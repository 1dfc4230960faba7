mod classifier;
mod config;
mod engine;
mod handlers;
mod health;
mod metrics;
mod patch;
mod predicate;
mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "k8s-label-webhook", about = "Label-compliance admission webhook for Pods and Deployments")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/label-webhook/config.yaml", env = "WEBHOOK_CONFIG")]
    config: String,
    /// Webhook HTTPS port, overrides the port of `listen_addr`
    #[arg(long)]
    port: Option<u16>,
    /// PEM certificate file, overrides `tls_cert_path`
    #[arg(long)]
    tls_cert_file: Option<String>,
    /// PEM private key file, overrides `tls_key_path`
    #[arg(long)]
    tls_key_file: Option<String>,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_webhook_server(
    addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    router: Router,
    ready: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind webhook listener: {e}");
            std::process::exit(1);
        }
    };

    info!(%addr, "HTTPS webhook server listening");
    ready.store(true, Ordering::Relaxed);

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                ready.store(false, Ordering::Relaxed);
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_probe_server(
    addr: SocketAddr,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind metrics listener: {e}");
            std::process::exit(1);
        }
    };

    info!(%addr, "HTTP metrics/health server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

fn parse_addr(field: &str, value: &str) -> SocketAddr {
    value.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {field} '{value}': {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let mut config = config::WebhookConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });
    if let Some(port) = cli.port {
        config.set_port(port);
    }
    if let Some(cert) = cli.tls_cert_file {
        config.tls_cert_path = cert;
    }
    if let Some(key) = cli.tls_key_file {
        config.tls_key_path = key;
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        log_level = %config.log_level,
        policy.exempt_namespaces = ?config.policy.exempt_namespaces,
        policy.required_labels = ?config.policy.required_labels,
        policy.inject_labels = ?config.policy.inject_labels,
        policy.annotations.validate = %config.policy.annotations.validate,
        policy.annotations.mutate = %config.policy.annotations.mutate,
        policy.annotations.status = %config.policy.annotations.status,
        "k8s-label-webhook starting"
    );

    let tls_config = tls::load_server_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| {
            eprintln!("Failed to load TLS config: {e}");
            std::process::exit(1);
        });
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let mut registry = Registry::default();
    let webhook_metrics = metrics::WebhookMetrics::new(&mut registry);
    let registry = Arc::new(registry);

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let metrics_addr = parse_addr("metrics_addr", &config.metrics_addr);

    let engine = engine::AdmissionEngine::new(Arc::new(config.policy));

    let app_state = Arc::new(handlers::AppState {
        engine,
        metrics: webhook_metrics,
    });

    let webhook_router = Router::new()
        .route("/validate", post(handlers::handle_validate))
        .route("/mutate", post(handlers::handle_mutate))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let probe_router = health::router(Arc::new(health::ProbeState {
        registry,
        ready: ready.clone(),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let https_shutdown_rx = shutdown_rx.clone();
    let http_shutdown_rx = shutdown_rx;

    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_webhook_server(listen_addr, tls_acceptor, webhook_router, ready, https_shutdown_rx),
        run_probe_server(metrics_addr, probe_router, http_shutdown_rx),
    );

    info!("k8s-label-webhook shut down gracefully");
}
