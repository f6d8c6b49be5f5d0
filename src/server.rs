use anyhow::{Context, Result, anyhow};
use http::StatusCode;
use std::{collections::HashMap, hash::BuildHasher, net::SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::config::{TargetConfig, TunnelConfig};
use crate::proxy::{TcpConnector, proxy_upgrade, send_error_response};
use crate::request::read_request_head;
use crate::security::parse_original_client_ip;

/// Reads the upgrade request from an accepted client connection, routes it by
/// `Host` and runs the tunnel to the matching origin.
#[tracing::instrument(skip_all, fields(client_addr = %client_addr))]
pub async fn handle_connection<S, H>(
    mut stream: S,
    client_addr: SocketAddr,
    targets: &HashMap<String, TargetConfig, H>,
    tunnel: &TunnelConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: BuildHasher + Sync,
{
    let (request, early_data) = match read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            send_error_response(&mut stream, StatusCode::BAD_REQUEST).await;
            return Err(e).context("Failed to read request head");
        }
    };

    let Some(host) = request.host().map(str::to_string) else {
        send_error_response(&mut stream, StatusCode::BAD_REQUEST).await;
        return Err(anyhow!("No Host header found in request"));
    };

    let Some(target_config) = lookup_target(targets, &host) else {
        send_error_response(&mut stream, StatusCode::NOT_FOUND).await;
        return Err(anyhow!("No target configured for domain: {}", host));
    };

    if !request.is_upgrade() {
        send_error_response(&mut stream, StatusCode::BAD_REQUEST).await;
        return Err(anyhow!("Request for {} is not an upgrade request", host));
    }

    // Log with original client IP if available, otherwise use direct connection IP
    let original_client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_original_client_ip);
    match original_client_ip {
        Some(ref ip) => {
            info!(
                host = %host,
                target_host = %target_config.host,
                target_port = target_config.port,
                client_ip = %ip,
                direct_addr = %client_addr,
                "Routing upgrade request"
            );
        }
        None => {
            info!(
                host = %host,
                target_host = %target_config.host,
                target_port = target_config.port,
                client_ip = %client_addr,
                "Routing upgrade request"
            );
        }
    }

    let outcome = proxy_upgrade(
        stream,
        early_data,
        &request,
        target_config,
        tunnel,
        Some(client_addr.ip()),
        &TcpConnector,
    )
    .await
    .with_context(|| format!("Failed to establish tunnel to {}", target_config.authority()))?;

    info!(
        status = %outcome.status,
        client_to_origin = outcome.client_to_origin,
        origin_to_client = outcome.origin_to_client,
        "Proxy connection closed"
    );
    Ok(())
}

/// Exact `Host` match first, then the host with any port stripped.
fn lookup_target<'a, H: BuildHasher>(
    targets: &'a HashMap<String, TargetConfig, H>,
    host: &str,
) -> Option<&'a TargetConfig> {
    targets.get(host).or_else(|| {
        host.rsplit_once(':')
            .filter(|(_, port)| port.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|(name, _)| targets.get(name))
    })
}
