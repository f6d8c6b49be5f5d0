//! Builds the outbound upgrade request sent to the origin.

use bytes::BytesMut;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, VIA},
};
use std::net::IpAddr;

use crate::brigade::Brigade;
use crate::config::{TargetConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::request::{RequestDescriptor, header_tokens, joined_values};

/// Headers that only describe the client leg and are never forwarded as-is.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const KNOWN_CODINGS: &[&str] = &[
    "chunked",
    "gzip",
    "x-gzip",
    "deflate",
    "compress",
    "x-compress",
    "identity",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// How the request body, if any, is delimited on the origin leg.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    /// Forward `Content-Length` with its original value.
    ContentLength { value: String, length: u64 },
    /// Forward `Transfer-Encoding`; the coding list ends in `chunked`.
    Chunked { codings: String },
}

/// Decides which of `Content-Length` and `Transfer-Encoding` frames the body.
///
/// A chunked `Transfer-Encoding` always wins and the length is discarded.
pub fn resolve_body_framing(
    content_length: Option<&str>,
    transfer_encoding: Option<&str>,
) -> Result<BodyFraming, TunnelError> {
    if let Some(te) = transfer_encoding {
        let mut codings = Vec::new();
        for token in te.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let lower = token.to_ascii_lowercase();
            if !KNOWN_CODINGS.contains(&lower.as_str()) {
                return Err(TunnelError::UnsupportedEncoding(token.to_string()));
            }
            if lower != "identity" {
                codings.push(lower);
            }
        }

        match codings.last().map(String::as_str) {
            Some("chunked") => {
                if codings[..codings.len() - 1].iter().any(|c| c == "chunked") {
                    return Err(TunnelError::MalformedRequest(
                        "chunked applied more than once".into(),
                    ));
                }
                return Ok(BodyFraming::Chunked {
                    codings: codings.join(", "),
                });
            }
            Some(_) => {
                return Err(TunnelError::MalformedRequest(format!(
                    "transfer-encoding {te:?} does not end with chunked"
                )));
            }
            None => {}
        }
    }

    let Some(cl) = content_length else {
        return Ok(BodyFraming::None);
    };

    let mut values = cl.split(',').map(str::trim);
    let first = values.next().unwrap_or_default();
    let length = parse_content_length(first)?;
    for other in values {
        if parse_content_length(other)? != length {
            return Err(TunnelError::MalformedRequest(format!(
                "conflicting content-length values {cl:?}"
            )));
        }
    }

    Ok(BodyFraming::ContentLength {
        value: first.to_string(),
        length,
    })
}

fn parse_content_length(value: &str) -> Result<u64, TunnelError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TunnelError::MalformedRequest(format!(
            "invalid content-length {value:?}"
        )));
    }
    value
        .parse()
        .map_err(|_| TunnelError::MalformedRequest(format!("invalid content-length {value:?}")))
}

/// Result of translating a client request for the origin leg.
#[derive(Debug)]
pub struct TranslatedRequest {
    /// Request line, headers and the upgrade handshake, ready to send.
    pub brigade: Brigade,
    /// End-to-end headers sent to the origin. The `Connection`/`Upgrade`
    /// handshake pair is written to the brigade only.
    pub headers: HeaderMap,
    pub framing: BodyFraming,
    /// `Content-Length` value forwarded to the origin, if it framed the body.
    pub old_cl_val: Option<String>,
    /// `Transfer-Encoding` value forwarded to the origin, if it framed the body.
    pub old_te_val: Option<String>,
}

impl TranslatedRequest {
    /// Whether the original request carried a body that follows the head.
    #[must_use]
    pub fn has_body(&self) -> bool {
        match &self.framing {
            BodyFraming::None => false,
            BodyFraming::ContentLength { length, .. } => *length > 0,
            BodyFraming::Chunked { .. } => true,
        }
    }
}

/// Builds the upgrade request for `target` from the client's request.
///
/// Does not touch any connection; the returned brigade is flagged for flushing
/// so the origin sees the handshake immediately.
pub fn translate(
    request: &RequestDescriptor,
    target: &TargetConfig,
    config: &TunnelConfig,
    client_ip: Option<IpAddr>,
) -> Result<TranslatedRequest, TunnelError> {
    if request.method() != Method::GET {
        return Err(TunnelError::MalformedRequest(format!(
            "method {} cannot be upgraded",
            request.method()
        )));
    }

    let path = request
        .uri()
        .path_and_query()
        .map(http::uri::PathAndQuery::as_str)
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| {
            TunnelError::MalformedRequest(format!(
                "cannot resolve request target {}",
                request.uri()
            ))
        })?;

    let upgrade = request.upgrade_protocols().ok_or_else(|| {
        TunnelError::MalformedRequest("request does not ask for a protocol upgrade".into())
    })?;
    let upgrade = HeaderValue::from_str(&upgrade)
        .map_err(|e| TunnelError::MalformedRequest(e.to_string()))?;

    let framing = resolve_body_framing(
        request.old_content_length(),
        request.old_transfer_encoding(),
    )?;

    let nominated: Vec<String> = header_tokens(request.headers(), &CONNECTION).collect();
    let mut headers = HeaderMap::with_capacity(request.headers().len() + 4);
    for (name, value) in request.headers() {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || nominated.iter().any(|n| n == lower)
            || name == CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let original_host = request.host().map(str::to_string);
    if !config.preserve_host || original_host.is_none() {
        headers.insert(HOST, header_value(&target.host_header())?);
        if let Some(host) = original_host.filter(|_| !config.preserve_host) {
            headers.insert(X_FORWARDED_HOST.clone(), header_value(&host)?);
        }
    }

    if let Some(pseudonym) = &config.via {
        headers.append(VIA, header_value(&format!("1.1 {pseudonym}"))?);
    }

    if let (true, Some(ip)) = (config.forwarded_for, client_ip) {
        let forwarded = match joined_values(request.headers(), &X_FORWARDED_FOR) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip.to_string(),
        };
        headers.insert(X_FORWARDED_FOR.clone(), header_value(&forwarded)?);
    }

    let (old_cl_val, old_te_val) = match &framing {
        BodyFraming::None => (None, None),
        BodyFraming::ContentLength { value, .. } => {
            headers.insert(CONTENT_LENGTH, header_value(value)?);
            (Some(value.clone()), None)
        }
        BodyFraming::Chunked { codings } => {
            headers.insert(TRANSFER_ENCODING, header_value(codings)?);
            (None, Some(codings.clone()))
        }
    };

    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(request.method().as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in &headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"Connection: Upgrade\r\nUpgrade: ");
    head.extend_from_slice(upgrade.as_bytes());
    head.extend_from_slice(b"\r\n\r\n");

    Ok(TranslatedRequest {
        brigade: Brigade::with_chunk(head.freeze(), true),
        headers,
        framing,
        old_cl_val,
        old_te_val,
    })
}

fn header_value(value: &str) -> Result<HeaderValue, TunnelError> {
    HeaderValue::from_str(value).map_err(|e| TunnelError::MalformedRequest(e.to_string()))
}
