//! Inbound and outbound connection wrappers.
//!
//! A [`Connection`] owns one socket. Each read and write is bounded by
//! an idle timeout and reported to the metrics sink, and writes are
//! serialized under a lock. [`Connection::close`] releases the socket and
//! reports metrics exactly once no matter how many tasks call it.

use crate::metrics::MetricsSink;
use crate::peek::PeekableStream;
use crate::sni::{self, ParsedHello, SniError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-operation idle timeout applied to every read and write.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the router a connection faces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepted client socket.
    Inbound { peer: SocketAddr, local: SocketAddr },
    /// Dialed backend socket, labelled by destination and SNI.
    Outbound { dst: String, sni: String },
}

pub struct Connection<S> {
    // Taken out on close; the socket is released once both halves are gone
    reader: Mutex<Option<PeekableStream<ReadHalf<S>>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    role: Role,
    metrics: Arc<dyn MetricsSink>,
    idle_timeout: Duration,
    opened_at: Instant,
    closed: AtomicBool,
    shutdown: CancellationToken,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

fn idle_timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "idle timeout elapsed")
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps an accepted client socket and reports it as opened.
    pub fn inbound(
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
        metrics: Arc<dyn MetricsSink>,
        idle_timeout: Duration,
    ) -> Self {
        metrics.inbound_opened();
        Self::new(stream, Role::Inbound { peer, local }, metrics, idle_timeout)
    }

    /// Wraps a dialed backend socket and reports it as opened.
    pub fn outbound(
        stream: S,
        dst: impl Into<String>,
        sni: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
        idle_timeout: Duration,
    ) -> Self {
        let (dst, sni) = (dst.into(), sni.into());
        metrics.outbound_opened(&dst, &sni);
        Self::new(stream, Role::Outbound { dst, sni }, metrics, idle_timeout)
    }

    fn new(stream: S, role: Role, metrics: Arc<dyn MetricsSink>, idle_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(PeekableStream::new(reader))),
            writer: Mutex::new(Some(writer)),
            role,
            metrics,
            idle_timeout,
            opened_at: Instant::now(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Classifies the first bytes of the stream without consuming them.
    ///
    /// `deadline` bounds the whole inspection, however many reads it takes.
    pub async fn client_hello(&self, deadline: Duration) -> Result<ParsedHello, SniError> {
        let parse = async {
            let mut reader = self.reader.lock().await;
            match reader.as_mut() {
                Some(reader) => sni::read_client_hello(reader).await,
                None => Err(SniError::Io(closed_error())),
            }
        };
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SniError::Io(closed_error())),
            result = timeout(deadline, parse) => result.unwrap_or(Err(SniError::Timeout)),
        };
        self.release_if_closed();
        result
    }

    /// Reads into `buf`, replaying any bytes left over from
    /// [`client_hello`](Self::client_hello) first. `Ok(0)` means end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .guarded(async {
                let mut reader = self.reader.lock().await;
                match reader.as_mut() {
                    Some(reader) => reader.read(buf).await,
                    None => Err(closed_error()),
                }
            })
            .await?;

        if n > 0 {
            self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            match &self.role {
                Role::Inbound { .. } => self.metrics.inbound_bytes_in(n),
                Role::Outbound { dst, sni } => self.metrics.outbound_bytes_in(dst, sni, n),
            }
        }
        Ok(n)
    }

    /// Writes all of `buf` while holding the write lock, so concurrent
    /// writers never interleave partial writes.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.guarded(async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or_else(closed_error)?;
            writer.write_all(buf).await?;
            writer.flush().await
        })
        .await?;

        let n = buf.len();
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        match &self.role {
            Role::Inbound { .. } => self.metrics.inbound_bytes_out(n),
            Role::Outbound { dst, sni } => self.metrics.outbound_bytes_out(dst, sni, n),
        }
        Ok(n)
    }

    /// Runs `op` under the idle timeout, aborting it as soon as the
    /// connection is closed.
    async fn guarded<T>(&self, op: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(closed_error()),
            result = timeout(self.idle_timeout, op) => {
                result.unwrap_or_else(|_| Err(idle_timeout_error()))
            }
        };
        self.release_if_closed();
        result
    }
}

impl<S> Connection<S> {
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Remote address of an inbound connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.role {
            Role::Inbound { peer, .. } => Some(peer),
            Role::Outbound { .. } => None,
        }
    }

    /// Local accept address of an inbound connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.role {
            Role::Inbound { local, .. } => Some(local),
            Role::Outbound { .. } => None,
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection. Only the first call has any effect.
    ///
    /// Pending and future reads and writes fail with `NotConnected`. The
    /// socket is dropped right away, or as soon as an interrupted read or
    /// write lets go of its half.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.release_if_closed();

        let open_for = self.opened_at.elapsed();
        match &self.role {
            Role::Inbound { peer, .. } => {
                self.metrics.inbound_closed(open_for);
                debug!(
                    peer = %peer,
                    bytes_in = self.bytes_in(),
                    bytes_out = self.bytes_out(),
                    duration_secs = open_for.as_secs_f64(),
                    "Inbound connection closed"
                );
            }
            Role::Outbound { dst, sni } => {
                self.metrics.outbound_closed(dst, sni, open_for);
                debug!(
                    dst = %dst,
                    sni = %sni,
                    bytes_in = self.bytes_in(),
                    bytes_out = self.bytes_out(),
                    duration_secs = open_for.as_secs_f64(),
                    "Outbound connection closed"
                );
            }
        }
    }

    /// Drops whichever stream halves are not held by an in-flight operation.
    fn release_if_closed(&self) {
        if !self.shutdown.is_cancelled() {
            return;
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingMetrics;
    use tokio::io::{DuplexStream, duplex};

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "192.0.2.10:51000".parse().unwrap(),
            "198.51.100.1:443".parse().unwrap(),
        )
    }

    fn inbound_pair(
        metrics: &Arc<RecordingMetrics>,
        idle: Duration,
    ) -> (Connection<DuplexStream>, DuplexStream) {
        let (ours, theirs) = duplex(1024);
        let (peer, local) = addrs();
        let conn = Connection::inbound(ours, peer, local, metrics.clone(), idle);
        (conn, theirs)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, _peer) = inbound_pair(&metrics, IDLE_TIMEOUT);

        for _ in 0..5 {
            conn.close();
        }
        assert!(conn.is_closed());
        drop(conn);

        let totals = metrics.totals();
        assert_eq!(totals.inbound_opened, 1);
        assert_eq!(totals.inbound_closed, 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_reports_once() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (ours, _theirs) = duplex(64);
        let conn = Arc::new(Connection::outbound(
            ours,
            "127.0.0.1:9000",
            "svc.internal",
            metrics.clone(),
            IDLE_TIMEOUT,
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.close() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        drop(conn);

        let totals = metrics.totals();
        assert_eq!(totals.outbound_opened, 1);
        assert_eq!(totals.outbound_closed, 1);
    }

    #[tokio::test]
    async fn test_drop_closes_once() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, _peer) = inbound_pair(&metrics, IDLE_TIMEOUT);
        drop(conn);
        assert_eq!(metrics.totals().inbound_closed, 1);
    }

    #[tokio::test]
    async fn test_counts_bytes_both_ways() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, mut peer) = inbound_pair(&metrics, IDLE_TIMEOUT);

        assert_eq!(conn.write(b"hello").await.unwrap(), 5);
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"from client").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from client");

        assert_eq!(conn.bytes_out(), 5);
        assert_eq!(conn.bytes_in(), 11);
        let totals = metrics.totals();
        assert_eq!(totals.inbound_bytes_out, 5);
        assert_eq!(totals.inbound_bytes_in, 11);
    }

    #[tokio::test]
    async fn test_read_times_out_when_idle() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, _peer) = inbound_pair(&metrics, Duration::from_millis(50));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_read() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, _peer) = inbound_pair(&metrics, IDLE_TIMEOUT);
        let conn = Arc::new(conn);

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should be interrupted by close")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);

        let err = conn.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, mut peer) = inbound_pair(&metrics, IDLE_TIMEOUT);

        conn.close();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("peer should see end of stream after close")
            .unwrap();
        assert_eq!(n, 0);
        assert!(peer.write_all(b"too late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_during_read_releases_socket() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, mut peer) = inbound_pair(&metrics, IDLE_TIMEOUT);
        let conn = Arc::new(conn);

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        assert!(reader.await.unwrap().is_err());

        // The wrapper is still alive, but both halves are gone
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("peer should see end of stream after close")
            .unwrap();
        assert_eq!(n, 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (ours, mut theirs) = duplex(512);
        let conn = Arc::new(Connection::outbound(
            ours,
            "127.0.0.1:9000",
            "svc.internal",
            metrics.clone(),
            IDLE_TIMEOUT,
        ));

        const CHUNK: usize = 16 * 1024;
        let writers: Vec<_> = [b'a', b'b']
            .into_iter()
            .map(|byte| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.write(&[byte; CHUNK]).await })
            })
            .collect();

        let mut received = vec![0u8; 2 * CHUNK];
        theirs.read_exact(&mut received).await.unwrap();
        for writer in writers {
            assert_eq!(writer.await.unwrap().unwrap(), CHUNK);
        }

        let first = received[0];
        assert!(received[..CHUNK].iter().all(|&b| b == first));
        assert!(received[CHUNK..].iter().all(|&b| b != first));
        assert_eq!(metrics.totals().outbound_bytes_out, 2 * CHUNK);
    }

    #[tokio::test]
    async fn test_client_hello_bytes_are_replayed() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, mut peer) = inbound_pair(&metrics, IDLE_TIMEOUT);

        peer.write_all(b"SSH-2.0-client\r\n").await.unwrap();
        let parsed = conn.client_hello(Duration::from_secs(1)).await.unwrap();
        assert_eq!(parsed, ParsedHello::NonTls);

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"SSH-2.0-client\r\n");
        assert_eq!(metrics.totals().inbound_bytes_in, n);
    }

    #[tokio::test]
    async fn test_client_hello_deadline() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (conn, mut peer) = inbound_pair(&metrics, IDLE_TIMEOUT);

        // Handshake byte then silence
        peer.write_all(&[0x16, 0x03]).await.unwrap();
        let result = conn.client_hello(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SniError::Timeout)));
    }

    #[test]
    fn test_role_addresses() {
        let metrics: Arc<dyn MetricsSink> = Arc::new(RecordingMetrics::default());
        let (ours, _theirs) = duplex(64);
        let (peer, local) = addrs();
        let conn = Connection::inbound(ours, peer, local, metrics, IDLE_TIMEOUT);
        assert_eq!(conn.peer_addr(), Some(peer));
        assert_eq!(conn.local_addr(), Some(local));
        assert_eq!(conn.role(), &Role::Inbound { peer, local });
    }
}
