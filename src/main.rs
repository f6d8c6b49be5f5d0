use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use upgrade_tunnel::{ProxyAllowlist, StreamType, handle_connection, load_config, load_tls_config};

const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = Arc::new(load_config(&config_path)?);
    info!(
        config_file = %config_path.display(),
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        targets = config.targets.len(),
        idle_timeout_ms = ?config.tunnel.idle_timeout_ms,
        abort_on_error = config.tunnel.abort_on_error,
        "Configuration loaded"
    );

    let allowlist = Arc::new(ProxyAllowlist::parse(
        config.listen.allowed_proxy_ips.as_deref(),
    )?);

    let tls_acceptor = match &config.listen.tls {
        Some(tls_config) => {
            let acceptor = load_tls_config(tls_config).context("Failed to load TLS configuration")?;
            info!(
                cert_file = %tls_config.cert_file,
                key_file = %tls_config.key_file,
                "TLS enabled"
            );
            Some(acceptor)
        }
        None => None,
    };

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        listen_addr = %addr,
        tls = tls_acceptor.is_some(),
        "Upgrade tunnel listening"
    );

    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if !allowlist.allows(peer.ip()) {
            warn!(client_addr = %peer, "Rejected connection from disallowed proxy address");
            continue;
        }

        let config = Arc::clone(&config);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            let stream = match StreamType::accept(tcp, tls_acceptor.as_ref()).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(client_addr = %peer, error = %e, "Failed to set up client stream");
                    return;
                }
            };
            if let Err(e) = handle_connection(stream, peer, &config.targets, &config.tunnel).await
            {
                error!(client_addr = %peer, error = %e, "Connection failed");
            }
        });
    }
}
