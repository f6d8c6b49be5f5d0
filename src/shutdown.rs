//! Tunnel pair lifetime: half-close tracking, idle/drain timer and teardown.

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::relay::{CloseGuard, Direction, DirectionEnd, DirectionReport, relay_direction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Tunneling,
    HalfClosed(Direction),
    Closed,
}

impl ConnectionState {
    /// The origin confirmed the upgrade.
    #[must_use]
    pub fn upgraded(self) -> Self {
        match self {
            Self::Negotiating => Self::Tunneling,
            other => other,
        }
    }

    /// `direction` observed EOF or an error.
    #[must_use]
    pub fn half_closed(self, direction: Direction) -> Self {
        match self {
            Self::Tunneling => Self::HalfClosed(direction),
            Self::HalfClosed(stopped) if stopped != direction => Self::Closed,
            other => other,
        }
    }

    #[must_use]
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOp {
    Read,
    Write,
}

/// The transport failure that ended a direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayFailure {
    pub direction: Direction,
    pub op: RelayOp,
    pub kind: io::ErrorKind,
}

/// How a tunnel ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelStatus {
    Clean,
    Timeout,
    Error(RelayFailure),
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::Timeout => f.write_str("timeout"),
            Self::Error(failure) => {
                let op = match failure.op {
                    RelayOp::Read => "read",
                    RelayOp::Write => "write",
                };
                write!(f, "error:{op}:{}", failure.kind)
            }
        }
    }
}

/// Whether the origin connection may go back to a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Release,
    Discard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TunnelOutcome {
    pub status: TunnelStatus,
    pub client_to_origin: u64,
    pub origin_to_client: u64,
    pub disposition: Disposition,
}

/// A client and origin connection bound together after a successful upgrade.
///
/// Each relay direction owns the read half of its source; the write halves sit
/// behind close guards so teardown never overlaps an in-flight write. Both
/// connections are shut down together, exactly once.
pub struct TunnelPair<C, O> {
    client_read: Option<ReadHalf<C>>,
    origin_read: Option<ReadHalf<O>>,
    client_write: CloseGuard<WriteHalf<C>>,
    origin_write: CloseGuard<WriteHalf<O>>,
    client_to_origin: Arc<AtomicU64>,
    origin_to_client: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
    state: ConnectionState,
    closed: bool,
    outcome: Option<TunnelOutcome>,
    config: TunnelConfig,
}

impl<C, O> TunnelPair<C, O>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Binds the pair; the origin must already have confirmed the upgrade.
    pub fn new(client: C, origin: O, config: TunnelConfig) -> Self {
        let (client_read, client_write) = tokio::io::split(client);
        let (origin_read, origin_write) = tokio::io::split(origin);
        Self {
            client_read: Some(client_read),
            origin_read: Some(origin_read),
            client_write: Arc::new(Mutex::new(client_write)),
            origin_write: Arc::new(Mutex::new(origin_write)),
            client_to_origin: Arc::new(AtomicU64::new(0)),
            origin_to_client: Arc::new(AtomicU64::new(0)),
            tasks: Vec::with_capacity(2),
            state: ConnectionState::Negotiating.upgraded(),
            closed: false,
            outcome: None,
            config,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Relays both directions until the pair is finished, then closes it.
    ///
    /// Calling `run` again returns the first outcome without relaying.
    pub async fn run(&mut self) -> TunnelOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let (Some(client_read), Some(origin_read)) =
            (self.client_read.take(), self.origin_read.take())
        else {
            // Closed before it ever ran
            return self.finish(TunnelStatus::Clean).await;
        };

        let (done_tx, mut done_rx) = mpsc::channel::<DirectionReport>(2);
        let activity = Arc::new(watch::channel(Instant::now()).0);

        self.tasks.push(tokio::spawn({
            let done_tx = done_tx.clone();
            let relay = relay_direction(
                Direction::ClientToOrigin,
                client_read,
                self.origin_write.clone(),
                self.client_to_origin.clone(),
                activity.clone(),
            );
            async move {
                let _ = done_tx.send(relay.await).await;
            }
        }));
        self.tasks.push(tokio::spawn({
            let relay = relay_direction(
                Direction::OriginToClient,
                origin_read,
                self.client_write.clone(),
                self.origin_to_client.clone(),
                activity.clone(),
            );
            async move {
                let _ = done_tx.send(relay.await).await;
            }
        }));

        let idle_timeout = self.config.idle_timeout();
        let mut failure = None;
        loop {
            let deadline = idle_timeout.map(|idle| *activity.borrow() + idle);
            let report = tokio::select! {
                report = done_rx.recv() => report,
                () = idle_deadline(deadline) => {
                    if idle_timeout.is_some_and(|idle| *activity.borrow() + idle <= Instant::now()) {
                        debug!(state = ?self.state, "Idle timer fired");
                        failure.get_or_insert(TunnelStatus::Timeout);
                        break;
                    }
                    continue;
                }
            };
            let Some(report) = report else {
                break;
            };

            self.state = self.state.half_closed(report.direction);
            debug!(direction = %report.direction, state = ?self.state, "Direction stopped");

            if let DirectionEnd::Failed(err) = &report.end {
                let op = match err {
                    TunnelError::Write { .. } => RelayOp::Write,
                    _ => RelayOp::Read,
                };
                failure.get_or_insert(TunnelStatus::Error(RelayFailure {
                    direction: report.direction,
                    op,
                    kind: err.io_kind().unwrap_or(io::ErrorKind::Other),
                }));
            }

            if self.state.is_closed() {
                break;
            }
            if self.config.abort_on_error {
                debug!(direction = %report.direction.reverse(), "Aborting surviving direction");
                break;
            }
            // Drain timer starts from the half-close
            activity.send_replace(Instant::now());
        }

        self.finish(failure.unwrap_or(TunnelStatus::Clean)).await
    }

    async fn finish(&mut self, status: TunnelStatus) -> TunnelOutcome {
        self.close().await;
        let outcome = TunnelOutcome {
            status,
            client_to_origin: self.client_to_origin.load(Ordering::Relaxed),
            origin_to_client: self.origin_to_client.load(Ordering::Relaxed),
            disposition: if status == TunnelStatus::Clean {
                Disposition::Release
            } else {
                Disposition::Discard
            },
        };
        info!(
            status = %outcome.status,
            client_to_origin = outcome.client_to_origin,
            origin_to_client = outcome.origin_to_client,
            "Tunnel closed"
        );
        self.outcome = Some(outcome);
        outcome
    }

    /// Stops both directions and shuts down both connections.
    ///
    /// Closing an already closed pair does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.client_read = None;
        self.origin_read = None;

        if let Err(e) = self.client_write.lock().await.shutdown().await {
            debug!(error = %e, "Client shutdown failed");
        }
        if let Err(e) = self.origin_write.lock().await.shutdown().await {
            debug!(error = %e, "Origin shutdown failed");
        }
        self.state = ConnectionState::Closed;
    }
}

impl<C, O> Drop for TunnelPair<C, O> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn idle_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };
    use tokio::{
        io::{AsyncReadExt, DuplexStream, ReadBuf, duplex},
        time::{sleep, timeout},
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);
    const STILL_RUNNING: Duration = Duration::from_millis(100);

    /// Origin whose reads fail with a reset while writes still go through
    struct ResetOnRead(DuplexStream);

    impl AsyncRead for ResetOnRead {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "origin reset",
            )))
        }
    }

    impl AsyncWrite for ResetOnRead {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    fn config(idle_timeout_ms: Option<u64>, abort_on_error: bool) -> TunnelConfig {
        TunnelConfig {
            idle_timeout_ms,
            abort_on_error,
            ..TunnelConfig::default()
        }
    }

    /// Returns the pair plus the peers standing in for client and origin
    fn pair(config: TunnelConfig) -> (TunnelPair<DuplexStream, DuplexStream>, DuplexStream, DuplexStream) {
        let (client, client_peer) = duplex(1024);
        let (origin, origin_peer) = duplex(1024);
        (TunnelPair::new(client, origin, config), client_peer, origin_peer)
    }

    async fn assert_eof(stream: &mut (impl AsyncRead + Unpin)) {
        let mut rest = Vec::new();
        timeout(TEST_TIMEOUT, stream.read_to_end(&mut rest))
            .await
            .expect("peer was never closed")
            .unwrap();
    }

    mod state_machine {
        use super::*;

        #[test]
        fn negotiating_to_tunneling() {
            assert_eq!(
                ConnectionState::Negotiating.upgraded(),
                ConnectionState::Tunneling
            );
            assert_eq!(ConnectionState::Closed.upgraded(), ConnectionState::Closed);
        }

        #[test]
        fn closes_after_both_directions_stop() {
            let state = ConnectionState::Tunneling.half_closed(Direction::OriginToClient);
            assert_eq!(state, ConnectionState::HalfClosed(Direction::OriginToClient));

            // Repeated reports from the same direction change nothing
            let state = state.half_closed(Direction::OriginToClient);
            assert_eq!(state, ConnectionState::HalfClosed(Direction::OriginToClient));

            let state = state.half_closed(Direction::ClientToOrigin);
            assert!(state.is_closed());
        }

        #[test]
        fn status_display() {
            assert_eq!(TunnelStatus::Clean.to_string(), "clean");
            assert_eq!(TunnelStatus::Timeout.to_string(), "timeout");
            let failure = TunnelStatus::Error(RelayFailure {
                direction: Direction::OriginToClient,
                op: RelayOp::Read,
                kind: io::ErrorKind::ConnectionReset,
            });
            assert_eq!(failure.to_string(), "error:read:connection reset");
        }
    }

    mod relaying {
        use super::*;

        #[tokio::test]
        async fn chunks_arrive_in_order_both_ways() {
            let (mut pair, client_peer, origin_peer) = pair(config(None, false));
            let tunnel = tokio::spawn(async move { pair.run().await });

            let upstream: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; usize::from(i) + 1]).collect();
            let downstream: Vec<Vec<u8>> = (0..50u8).map(|i| vec![255 - i; 3]).collect();
            let expected_up: Vec<u8> = upstream.concat();
            let expected_down: Vec<u8> = downstream.concat();

            let (mut client_read, mut client_write) = tokio::io::split(client_peer);
            let (mut origin_read, mut origin_write) = tokio::io::split(origin_peer);

            let client_sender = tokio::spawn(async move {
                for chunk in upstream {
                    client_write.write_all(&chunk).await.unwrap();
                }
                client_write.shutdown().await.unwrap();
            });
            let origin_sender = tokio::spawn(async move {
                for chunk in downstream {
                    origin_write.write_all(&chunk).await.unwrap();
                }
                origin_write.shutdown().await.unwrap();
            });

            let mut at_origin = Vec::new();
            let mut at_client = Vec::new();
            let (up, down) = tokio::join!(
                timeout(TEST_TIMEOUT, origin_read.read_to_end(&mut at_origin)),
                timeout(TEST_TIMEOUT, client_read.read_to_end(&mut at_client)),
            );
            up.unwrap().unwrap();
            down.unwrap().unwrap();
            client_sender.await.unwrap();
            origin_sender.await.unwrap();

            assert_eq!(at_origin, expected_up);
            assert_eq!(at_client, expected_down);

            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(outcome.status, TunnelStatus::Clean);
            assert_eq!(outcome.disposition, Disposition::Release);
            assert_eq!(outcome.client_to_origin, expected_up.len() as u64);
            assert_eq!(outcome.origin_to_client, expected_down.len() as u64);
        }
    }

    mod half_close {
        use super::*;

        #[tokio::test]
        async fn origin_eof_lets_client_drain() {
            let (mut pair, mut client_peer, mut origin_peer) = pair(config(None, false));
            let mut tunnel = tokio::spawn(async move { pair.run().await });

            origin_peer.shutdown().await.unwrap();
            assert_eof(&mut client_peer).await;

            client_peer.write_all(b"still going").await.unwrap();
            let mut buf = [0u8; 11];
            timeout(TEST_TIMEOUT, origin_peer.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"still going");
            assert!(timeout(STILL_RUNNING, &mut tunnel).await.is_err());

            client_peer.shutdown().await.unwrap();
            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(outcome.status, TunnelStatus::Clean);
            assert_eq!(outcome.client_to_origin, 11);
            assert_eof(&mut origin_peer).await;
        }

        #[tokio::test]
        async fn origin_eof_aborts_client_when_aggressive() {
            let (mut pair, mut client_peer, mut origin_peer) = pair(config(None, true));
            let tunnel = tokio::spawn(async move { pair.run().await });

            origin_peer.shutdown().await.unwrap();

            // The client never closes, yet the tunnel finishes
            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(outcome.status, TunnelStatus::Clean);
            assert_eof(&mut client_peer).await;
            assert_eof(&mut origin_peer).await;
        }

        #[tokio::test]
        async fn origin_reset_drains_then_reports_error() {
            let (client, mut client_peer) = duplex(1024);
            let (origin, mut origin_peer) = duplex(1024);
            let mut pair = TunnelPair::new(client, ResetOnRead(origin), config(None, false));
            let mut tunnel = tokio::spawn(async move { pair.run().await });

            // The reset is passed on to the client as a half-close
            assert_eof(&mut client_peer).await;

            client_peer.write_all(b"late data").await.unwrap();
            let mut buf = [0u8; 9];
            timeout(TEST_TIMEOUT, origin_peer.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"late data");
            assert!(timeout(STILL_RUNNING, &mut tunnel).await.is_err());

            client_peer.shutdown().await.unwrap();
            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(
                outcome.status,
                TunnelStatus::Error(RelayFailure {
                    direction: Direction::OriginToClient,
                    op: RelayOp::Read,
                    kind: io::ErrorKind::ConnectionReset,
                })
            );
            assert_eq!(outcome.disposition, Disposition::Discard);
            assert_eq!(outcome.client_to_origin, 9);
        }

        #[tokio::test]
        async fn origin_reset_aborts_client_direction_when_aggressive() {
            let (client, mut client_peer) = duplex(1024);
            let (origin, _origin_peer) = duplex(1024);
            let mut pair = TunnelPair::new(client, ResetOnRead(origin), config(None, true));
            let tunnel = tokio::spawn(async move { pair.run().await });

            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert!(matches!(outcome.status, TunnelStatus::Error(_)));
            assert_eq!(outcome.disposition, Disposition::Discard);
            assert_eof(&mut client_peer).await;
        }
    }

    mod idle_timer {
        use super::*;

        #[tokio::test]
        async fn silent_tunnel_times_out() {
            let (mut pair, mut client_peer, mut origin_peer) = pair(config(Some(100), false));
            let tunnel = tokio::spawn(async move { pair.run().await });

            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(outcome.status, TunnelStatus::Timeout);
            assert_eq!(outcome.disposition, Disposition::Discard);
            assert_eof(&mut client_peer).await;
            assert_eof(&mut origin_peer).await;
        }

        #[tokio::test]
        async fn traffic_resets_the_timer() {
            let (mut pair, mut client_peer, mut origin_peer) = pair(config(Some(150), false));
            let mut tunnel = tokio::spawn(async move { pair.run().await });

            for _ in 0..6 {
                sleep(Duration::from_millis(50)).await;
                client_peer.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                origin_peer.read_exact(&mut buf).await.unwrap();
            }
            assert!(timeout(Duration::from_millis(50), &mut tunnel).await.is_err());

            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(outcome.status, TunnelStatus::Timeout);
            assert_eq!(outcome.client_to_origin, 24);
        }

        #[tokio::test]
        async fn drain_is_bounded_by_the_timer() {
            let (mut pair, mut client_peer, mut origin_peer) = pair(config(Some(100), false));
            let tunnel = tokio::spawn(async move { pair.run().await });

            origin_peer.shutdown().await.unwrap();
            assert_eof(&mut client_peer).await;

            // The client stays open but silent
            let outcome = timeout(TEST_TIMEOUT, tunnel).await.unwrap().unwrap();
            assert_eq!(outcome.status, TunnelStatus::Timeout);
        }
    }

    mod closing {
        use super::*;

        #[tokio::test]
        async fn close_twice_is_a_no_op() {
            let (mut pair, mut client_peer, mut origin_peer) = pair(config(None, false));

            pair.close().await;
            assert_eq!(pair.state(), ConnectionState::Closed);
            pair.close().await;
            assert_eq!(pair.state(), ConnectionState::Closed);

            assert_eof(&mut client_peer).await;
            assert_eof(&mut origin_peer).await;

            let outcome = pair.run().await;
            assert_eq!(outcome.status, TunnelStatus::Clean);
            assert_eq!(outcome.client_to_origin, 0);
        }

        #[tokio::test]
        async fn run_after_finish_returns_same_outcome() {
            let (mut pair, client_peer, origin_peer) = pair(config(None, false));
            drop(client_peer);
            drop(origin_peer);

            let first = timeout(TEST_TIMEOUT, pair.run()).await.unwrap();
            let second = pair.run().await;
            assert_eq!(first, second);
            pair.close().await;
        }
    }
}
