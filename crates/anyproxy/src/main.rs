//! anyproxy: SOCKS5 proxy that redirects every connection to a fixed
//! target, with optional built-in HTTP/HTTPS echo responders.

mod config;
mod echo;

use anyhow::Context as _;
use anyproxy_core::{Context, Server, ServerConfig, Socks5Engine};
use clap::Parser;
use config::{AppConfig, Overrides};
use echo::EchoServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "anyproxy", about = "SOCKS5 proxy that sends every request to one place", version)]
struct Cli {
    /// Host for all listeners
    #[arg(long)]
    listen: Option<String>,

    /// SOCKS5 port (0 disables the proxy)
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP echo port (0 disables it)
    #[arg(long)]
    http_port: Option<u16>,

    /// HTTPS echo port (0 disables it)
    #[arg(long)]
    https_port: Option<u16>,

    /// Redirect target IP. Empty uses the echo responders, 0.0.0.0 keeps
    /// the requested host
    #[arg(long)]
    target: Option<String>,

    /// Redirect target port (0 keeps the requested port)
    #[arg(long)]
    target_port: Option<String>,

    /// Seconds a connection may stay silent before shutdown drops it
    #[arg(long)]
    idle_grace: Option<u64>,

    /// Seconds to wait for the upstream dial
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Seconds to wait for connections to drain on shutdown
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.anyproxy/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let overrides = Overrides {
        listen: cli.listen,
        port: cli.port,
        http_port: cli.http_port,
        https_port: cli.https_port,
        target: cli.target,
        target_port: cli.target_port,
        idle_grace: cli.idle_grace,
        connect_timeout: cli.connect_timeout,
        shutdown_timeout: cli.shutdown_timeout,
    };
    let config = AppConfig::load(Some(&cli.config), overrides)?;
    run(config).await
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let (resolver, rewriter) = config.pipeline().context("invalid redirect settings")?;

    let mut proxy = None;
    if config.port != 0 {
        let server_config = ServerConfig {
            idle_grace: config.idle_grace,
            ..ServerConfig::new(resolver, rewriter)
        };
        let server = Arc::new(Server::new(
            server_config,
            Arc::new(Socks5Engine::new(config.connect_timeout)),
        ));
        let listener = bind(&config.socks_addr()).await?;
        info!(addr = %config.socks_addr(), redirect_host = %config.target, redirect_port = %config.target_port, "SOCKS5 proxy started");

        let srv = server.clone();
        tokio::spawn(async move {
            if let Err(e) = srv.serve(listener).await {
                if !e.is_server_closed() {
                    error!(error = %e, "SOCKS5 proxy stopped");
                }
            }
        });
        proxy = Some(server);
    }

    let mut responders = Vec::new();
    if config.http_port != 0 {
        let listener = bind(&config.http_addr()).await?;
        responders.push(start_echo(Arc::new(EchoServer::http()), listener));
    }
    if config.https_port != 0 {
        let (cert, key) = echo::self_signed_cert(&[config.listen.clone(), "localhost".to_string()])?;
        let acceptor = echo::tls_acceptor(cert, key)?;
        let listener = bind(&config.https_addr()).await?;
        responders.push(start_echo(Arc::new(EchoServer::https(acceptor)), listener));
    }

    info!("running, press CTRL+C to terminate");
    shutdown_signal().await;
    info!(timeout_secs = config.shutdown_timeout.as_secs(), "shutting down");

    let ctx = Context::background().with_timeout(config.shutdown_timeout);
    if let Some(server) = &proxy {
        if let Err(e) = server.shutdown(&ctx).await {
            error!(error = %e, live = server.tracker().len(), "could not drain SOCKS5 connections, closing");
            server.close();
        }
    }
    for responder in &responders {
        if let Err(e) = responder.shutdown(&ctx).await {
            error!(error = %e, "could not shut down echo responder");
        }
    }

    info!("stopped");
    Ok(())
}

async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))
}

fn start_echo(server: Arc<EchoServer>, listener: TcpListener) -> Arc<EchoServer> {
    let srv = server.clone();
    tokio::spawn(async move {
        if let Err(e) = srv.serve(listener).await {
            error!(error = %e, "echo responder stopped");
        }
    });
    server
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
