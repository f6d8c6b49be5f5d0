//! Request descriptor handed to the tunnel core, plus HTTP/1.1 head parsing.

use bytes::BytesMut;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Uri,
    header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE},
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TunnelError;

/// How much data to read for a request or response head before it's
/// considered invalid.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;

const MAX_HEADERS: usize = 64;

/// The original request as received from the client.
///
/// `old_content_length` and `old_transfer_encoding` are captured at
/// construction, before any header rewriting happens.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    old_content_length: Option<String>,
    old_transfer_encoding: Option<String>,
}

impl RequestDescriptor {
    #[must_use]
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let old_content_length = joined_values(&headers, &CONTENT_LENGTH);
        let old_transfer_encoding = joined_values(&headers, &TRANSFER_ENCODING);
        Self {
            method,
            uri,
            headers,
            old_content_length,
            old_transfer_encoding,
        }
    }

    /// Parses a request head from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the head is still incomplete, otherwise the
    /// descriptor and the length of the head section in bytes.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, TunnelError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(TunnelError::MalformedRequest(e.to_string())),
        };

        if req.version != Some(1) {
            return Err(TunnelError::MalformedRequest(
                "upgrade requires HTTP/1.1".into(),
            ));
        }
        let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
            .map_err(|e| TunnelError::MalformedRequest(e.to_string()))?;
        let uri = req
            .path
            .unwrap_or_default()
            .parse::<Uri>()
            .map_err(|e| TunnelError::MalformedRequest(e.to_string()))?;

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| TunnelError::MalformedRequest(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| TunnelError::MalformedRequest(e.to_string()))?;
            map.append(name, value);
        }

        Ok(Some((Self::new(method, uri, map), len)))
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn old_content_length(&self) -> Option<&str> {
        self.old_content_length.as_deref()
    }

    #[must_use]
    pub fn old_transfer_encoding(&self) -> Option<&str> {
        self.old_transfer_encoding.as_deref()
    }

    /// Host the client addressed, from the `Host` header or an absolute URI.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(http::uri::Authority::as_str))
    }

    /// `Upgrade` header values joined into one token list.
    #[must_use]
    pub fn upgrade_protocols(&self) -> Option<String> {
        joined_values(&self.headers, &UPGRADE)
    }

    /// Whether the client asked for a protocol switch.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.upgrade_protocols().is_some()
            && header_tokens(&self.headers, &CONNECTION).any(|t| t == "upgrade")
    }
}

/// All values of `name`, comma-joined in order. `None` if absent or blank.
pub(crate) fn joined_values(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let joined = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    (!joined.is_empty()).then_some(joined)
}

/// Lower-cased comma-separated tokens across every value of `name`.
pub(crate) fn header_tokens<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
) -> impl Iterator<Item = String> + use<'a> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
}

/// Reads from `reader` until `parse` recognises a complete head.
///
/// Returns the parsed value, the whole buffer read so far, and the head
/// length; bytes past the head belong to whatever follows it and are left in
/// the buffer untouched.
pub(crate) async fn read_head<R, T, F, E>(
    reader: &mut R,
    mut parse: F,
    too_large: E,
) -> Result<(T, BytesMut, usize), TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(&[u8]) -> Result<Option<(T, usize)>, TunnelError>,
    E: Fn(String) -> TunnelError,
{
    let oversized = || {
        too_large(format!(
            "header section exceeds {HEADER_SECTION_MAX_LENGTH} bytes"
        ))
    };
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((parsed, len)) = parse(&buf)? {
            // A single read may overshoot the limit and still complete the head
            if len > HEADER_SECTION_MAX_LENGTH {
                return Err(oversized());
            }
            return Ok((parsed, buf, len));
        }
        if buf.len() >= HEADER_SECTION_MAX_LENGTH {
            return Err(oversized());
        }
        buf.reserve(1024);
        let n = reader.read_buf(&mut buf).await.map_err(TunnelError::Read)?;
        if n == 0 {
            return Err(TunnelError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of header section",
            )));
        }
    }
}

/// Reads a request head from a client connection.
///
/// Returns the descriptor and any bytes the client sent after the head.
pub async fn read_request_head<R>(
    reader: &mut R,
) -> Result<(RequestDescriptor, bytes::Bytes), TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (request, mut buf, len) =
        read_head(reader, RequestDescriptor::parse, TunnelError::MalformedRequest).await?;
    let early_data = buf.split_off(len).freeze();
    Ok((request, early_data))
}
