//! Bidirectional byte relay between a client and its backend.

use crate::connection::Connection;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

const BUFFER_SIZE: usize = 32 * 1024;

/// Bytes copied in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Copies bytes both ways until either side finishes.
///
/// Whichever direction stops first, through end of stream, an error or an
/// idle timeout, closes both connections, which in turn stops the other
/// direction. Returns once both directions are done.
pub async fn relay<C, B>(inbound: &Connection<C>, outbound: &Connection<B>) -> RelayStats
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (client_to_backend, backend_to_client) = tokio::join!(
        pipe(inbound, outbound, "client->backend"),
        pipe(outbound, inbound, "backend->client"),
    );
    RelayStats {
        client_to_backend,
        backend_to_client,
    }
}

async fn pipe<R, W>(from: &Connection<R>, to: &Connection<W>, direction: &'static str) -> u64
where
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;

    let result: io::Result<()> = async {
        loop {
            let n = from.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            to.write(&buf[..n]).await?;
            copied += n as u64;
        }
    }
    .await;

    match result {
        Ok(()) => debug!(direction, bytes = copied, "Relay direction finished"),
        // Closing one side interrupts the other direction; that is not a failure
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
            debug!(direction, bytes = copied, "Relay direction stopped")
        }
        Err(e) => debug!(direction, bytes = copied, error = %e, "Relay direction failed"),
    }

    from.close();
    to.close();
    copied
}
