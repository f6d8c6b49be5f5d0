use bytes::Bytes;
use http::StatusCode;
use std::{future::Future, io, net::IpAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::brigade::{Brigade, write_brigade};
use crate::config::{TargetConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::headers::translate;
use crate::request::{RequestDescriptor, read_head};
use crate::shutdown::{Disposition, TunnelOutcome, TunnelPair};

/// How long a refused upgrade's response body may take to arrive when no idle
/// timeout is configured.
const REFUSAL_BODY_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of origin connections.
///
/// Backend selection and pooling live behind this seam; the tunnel only asks
/// for a connection and reports whether it may be reused.
pub trait Connector {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self, target: &TargetConfig) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// Called once the origin connection is no longer used by the tunnel.
    fn release(&self, _target: &TargetConfig, _disposition: Disposition) {}
}

/// Opens a fresh TCP connection per tunnel.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpStream;

    async fn connect(&self, target: &TargetConfig) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(target.authority()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Asks the origin to upgrade `request`, then relays bytes until the tunnel
/// closes.
///
/// Failures before the tunnel is established are answered with an HTTP error
/// response on `client` (or the origin's own refusal, forwarded verbatim).
/// Once tunnelling, failures only end up in the returned outcome's status.
#[tracing::instrument(
    skip_all,
    fields(method = %request.method(), uri = %request.uri(), target_addr = %target.authority())
)]
pub async fn proxy_upgrade<C, K>(
    mut client: C,
    early_data: Bytes,
    request: &RequestDescriptor,
    target: &TargetConfig,
    config: &TunnelConfig,
    client_ip: Option<IpAddr>,
    connector: &K,
) -> Result<TunnelOutcome, TunnelError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    K: Connector,
{
    let mut translated = match translate(request, target, config, client_ip) {
        Ok(translated) => translated,
        Err(e) => {
            warn!(error = %e, "Failed to translate upgrade request");
            send_error_response(&mut client, e.status()).await;
            return Err(e);
        }
    };
    translated.brigade.push(early_data);

    debug!("Attempting to connect to target server");
    let mut origin = match connector.connect(target).await {
        Ok(origin) => origin,
        Err(source) => {
            let e = TunnelError::Connect {
                authority: target.authority(),
                source,
            };
            warn!(error = %e, "Failed to connect to target server");
            send_error_response(&mut client, e.status()).await;
            return Err(e);
        }
    };
    info!("Connected to target server");

    let negotiated = match negotiate(&mut origin, &translated.brigade, config).await {
        Ok(negotiated) => negotiated,
        Err(e) => {
            warn!(error = %e, "Upgrade negotiation with origin failed");
            connector.release(target, Disposition::Discard);
            send_error_response(&mut client, e.status()).await;
            return Err(e);
        }
    };

    let status = negotiated.head.status;
    if status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        let e = TunnelError::UpgradeRefused { status };
        warn!(error = %e, "Origin refused upgrade");
        forward_refusal(&mut origin, &mut client, &negotiated, config).await;
        connector.release(target, Disposition::Discard);
        return Err(e);
    }

    // The 101 head and any tunnel bytes that followed it go out as one unit
    if let Err(e) = write_brigade(&mut client, &negotiated.response).await {
        warn!(error = %e, "Failed to forward upgrade response to client");
        connector.release(target, Disposition::Discard);
        return Err(e);
    }
    debug!("Origin confirmed upgrade");

    let mut pair = TunnelPair::new(client, origin, config.clone());
    let outcome = pair.run().await;
    connector.release(target, outcome.disposition);
    Ok(outcome)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ResponseHead {
    status: u16,
    /// Declared body length; `None` means the body runs until the origin
    /// closes.
    body_length: Option<u64>,
}

/// The origin's answer to the upgrade request.
struct Negotiated {
    head: ResponseHead,
    /// Everything read from the origin so far, head included, flushed.
    response: Brigade,
    /// Bytes read past the end of the head.
    past_head: u64,
}

/// Sends the upgrade request and waits for the origin's response head.
async fn negotiate<O>(
    origin: &mut O,
    request: &Brigade,
    config: &TunnelConfig,
) -> Result<Negotiated, TunnelError>
where
    O: AsyncRead + AsyncWrite + Unpin,
{
    write_brigade(origin, request).await?;

    let read = read_head(origin, parse_response_head, TunnelError::InvalidResponse);
    let (head, buf, len) = match config.idle_timeout() {
        Some(idle) => timeout(idle, read)
            .await
            .map_err(|_| TunnelError::Timeout(idle))??,
        None => read.await?,
    };

    Ok(Negotiated {
        head,
        past_head: (buf.len() - len) as u64,
        response: Brigade::with_chunk(buf.freeze(), true),
    })
}

/// Passes a refused upgrade's response through to the client, body included.
///
/// The body is bounded by its declared length, otherwise by the origin
/// closing, and in both cases by the idle timeout.
async fn forward_refusal<O, C>(
    origin: &mut O,
    client: &mut C,
    negotiated: &Negotiated,
    config: &TunnelConfig,
) where
    O: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    if let Err(e) = write_brigade(client, &negotiated.response).await {
        debug!(error = %e, "Failed to forward refusal to client");
        return;
    }

    let copy_body = async {
        match negotiated.head.body_length {
            Some(length) => {
                let mut body = (&mut *origin).take(length.saturating_sub(negotiated.past_head));
                tokio::io::copy(&mut body, client).await
            }
            None => tokio::io::copy(origin, client).await,
        }
    };
    let limit = config.idle_timeout().unwrap_or(REFUSAL_BODY_TIMEOUT);
    match timeout(limit, copy_body).await {
        Ok(Ok(bytes)) => debug!(bytes, "Forwarded refusal body"),
        Ok(Err(e)) => debug!(error = %e, "Failed to forward refusal body"),
        Err(_) => debug!(?limit, "Gave up waiting for refusal body"),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(TunnelError::InvalidResponse(e.to_string())),
    };

    let status = response.code.unwrap_or_default();
    let body_length = if (100..200).contains(&status) || status == 204 || status == 304 {
        Some(0)
    } else if response
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
    {
        None
    } else {
        response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    Ok(Some((ResponseHead { status, body_length }, len)))
}

/// Minimal error response for failures before the tunnel exists.
#[must_use]
pub fn error_response(status: StatusCode) -> Brigade {
    let reason = status.canonical_reason().unwrap_or("Error");
    Brigade::with_chunk(
        format!(
            "HTTP/1.1 {} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status.as_u16()
        ),
        true,
    )
}

pub(crate) async fn send_error_response<W>(writer: &mut W, status: StatusCode)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = write_brigade(writer, &error_response(status)).await {
        debug!(error = %e, %status, "Failed to send error response");
    }
}
