//! One direction of the tunnel: read a bounded chunk, write it flushed.

use bytes::BytesMut;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
    time::Instant,
};
use tracing::debug;

use crate::brigade::{Brigade, write_brigade};
use crate::error::TunnelError;

pub const BUFFER_SIZE: usize = 8192;

/// Write side of a connection, shared between the direction writing to it and
/// the coordinator that may close it.
pub type CloseGuard<W> = Arc<Mutex<W>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

impl Direction {
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::ClientToOrigin => Self::OriginToClient,
            Self::OriginToClient => Self::ClientToOrigin,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToOrigin => f.write_str("client->origin"),
            Self::OriginToClient => f.write_str("origin->client"),
        }
    }
}

#[derive(Debug)]
pub enum DirectionEnd {
    /// The source reached EOF and the half-close was passed on.
    Eof,
    /// A read or write failed; carries `TunnelError::Read` or `TunnelError::Write`.
    Failed(TunnelError),
}

/// Completion signal sent by a direction when it stops.
#[derive(Debug)]
pub struct DirectionReport {
    pub direction: Direction,
    pub end: DirectionEnd,
}

/// Copies `source` into `sink` until EOF or the first error.
///
/// Every chunk read becomes its own flushed brigade, so bytes are never held
/// back waiting for more data. Nothing is retried: a failed write may already
/// have been partially observed by the peer.
pub async fn relay_direction<R, W>(
    direction: Direction,
    mut source: R,
    sink: CloseGuard<W>,
    transferred: Arc<AtomicU64>,
    activity: Arc<watch::Sender<Instant>>,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let end = loop {
        let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
        match source.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(%direction, "Source reached EOF, passing on half-close");
                shutdown_sink(direction, &sink).await;
                break DirectionEnd::Eof;
            }
            Ok(n) => {
                debug!(%direction, bytes = n, "Forwarding data");
                let brigade = Brigade::with_chunk(buf.freeze(), true);
                let result = {
                    let mut writer = sink.lock().await;
                    write_brigade(&mut *writer, &brigade).await
                };
                match result {
                    Ok(written) => {
                        transferred.fetch_add(written as u64, Ordering::Relaxed);
                        activity.send_replace(Instant::now());
                    }
                    Err(e) => {
                        if let TunnelError::Write { written, .. } = &e {
                            transferred.fetch_add(*written as u64, Ordering::Relaxed);
                        }
                        debug!(%direction, error = %e, "Failed to write");
                        break DirectionEnd::Failed(e);
                    }
                }
            }
            Err(e) => {
                debug!(%direction, error = %e, "Failed to read, passing on half-close");
                // Nothing more can come from this source
                shutdown_sink(direction, &sink).await;
                break DirectionEnd::Failed(TunnelError::Read(e));
            }
        }
    };

    DirectionReport { direction, end }
}

async fn shutdown_sink<W>(direction: Direction, sink: &CloseGuard<W>)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = sink.lock().await.shutdown().await {
        debug!(%direction, error = %e, "Failed to shut down write side");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io, time::Duration};
    use tokio::{io::duplex, time::timeout};

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    fn fresh_activity() -> Arc<watch::Sender<Instant>> {
        Arc::new(watch::channel(Instant::now()).0)
    }

    #[tokio::test]
    async fn copies_in_order_and_propagates_eof() {
        let (mut client, source) = duplex(64);
        let (sink, mut origin) = duplex(64);
        let counter = Arc::new(AtomicU64::new(0));
        let activity = fresh_activity();
        let seen = activity.subscribe();

        let relay = tokio::spawn(relay_direction(
            Direction::ClientToOrigin,
            source,
            Arc::new(Mutex::new(sink)),
            counter.clone(),
            activity.clone(),
        ));

        let chunks: [&[u8]; 3] = [b"first ", b"second ", b"third"];
        for chunk in chunks {
            client.write_all(chunk).await.unwrap();
        }
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, origin.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"first second third");

        let report = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
        assert_eq!(report.direction, Direction::ClientToOrigin);
        assert!(matches!(report.end, DirectionEnd::Eof));
        assert_eq!(counter.load(Ordering::Relaxed), 18);
        assert!(seen.has_changed().unwrap());
    }

    #[tokio::test]
    async fn chunk_larger_than_buffer_arrives_intact() {
        let (mut client, source) = duplex(BUFFER_SIZE * 4);
        let (sink, mut origin) = duplex(BUFFER_SIZE * 4);
        let payload: Vec<u8> = (0..BUFFER_SIZE * 3).map(|i| (i % 251) as u8).collect();

        let relay = tokio::spawn(relay_direction(
            Direction::OriginToClient,
            source,
            Arc::new(Mutex::new(sink)),
            Arc::new(AtomicU64::new(0)),
            fresh_activity(),
        ));

        client.write_all(&payload).await.unwrap();
        drop(client);

        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, origin.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn read_failure_still_passes_on_half_close() {
        let source = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (sink, mut origin) = duplex(64);

        let report = timeout(
            TEST_TIMEOUT,
            relay_direction(
                Direction::ClientToOrigin,
                source,
                Arc::new(Mutex::new(sink)),
                Arc::new(AtomicU64::new(0)),
                fresh_activity(),
            ),
        )
        .await
        .unwrap();

        match report.end {
            DirectionEnd::Failed(TunnelError::Read(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected read failure, got {other:?}"),
        }

        // The sink saw the forwarded bytes followed by EOF
        let mut received = Vec::new();
        timeout(TEST_TIMEOUT, origin.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"partial");
    }

    #[tokio::test]
    async fn write_failure_ends_direction() {
        let (mut client, source) = duplex(64);
        let (sink, origin) = duplex(64);
        drop(origin);

        let relay = tokio::spawn(relay_direction(
            Direction::ClientToOrigin,
            source,
            Arc::new(Mutex::new(sink)),
            Arc::new(AtomicU64::new(0)),
            fresh_activity(),
        ));

        client.write_all(b"lost").await.unwrap();

        let report = timeout(TEST_TIMEOUT, relay).await.unwrap().unwrap();
        match report.end {
            DirectionEnd::Failed(TunnelError::Write { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected write failure, got {other:?}"),
        }
    }

    #[test]
    fn direction_display_and_reverse() {
        assert_eq!(Direction::ClientToOrigin.to_string(), "client->origin");
        assert_eq!(
            Direction::OriginToClient.reverse(),
            Direction::ClientToOrigin
        );
    }
}
