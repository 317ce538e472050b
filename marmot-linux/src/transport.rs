//! Local transport: bind and accept exactly one peer (host), or dial one (join).
//!
//! Every blocking step takes a [`CancellationToken`]; cancelling it drops the
//! pending listener or socket, which is how `stop` unblocks a waiting start.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TransportError;

/// A bound listener waiting for its single peer.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

/// Bind a TCP listener on `addr`. Port 0 picks an ephemeral port.
pub async fn listen(addr: SocketAddr) -> Result<Listener, TransportError> {
    let inner = TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::Bind { addr, source })?;
    let local_addr = inner
        .local_addr()
        .map_err(|source| TransportError::Bind { addr, source })?;
    info!(%local_addr, "listening for peer");
    Ok(Listener { inner, local_addr })
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for one peer, then stop listening.
    pub async fn accept_one(
        self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, peer) = bounded(timeout, cancel, async {
            self.inner.accept().await.map_err(TransportError::Accept)
        })
        .await?;
        tune(&stream);
        info!(%peer, "peer connected");
        Ok((stream, peer))
    }
}

/// Resolve `host` and connect to the first address that accepts.
pub async fn dial(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(TcpStream, SocketAddr), TransportError> {
    let (stream, peer) = bounded(timeout, cancel, connect_any(host, port)).await?;
    tune(&stream);
    info!(%peer, "connected to peer");
    Ok((stream, peer))
}

async fn connect_any(host: &str, port: u16) -> Result<(TcpStream, SocketAddr), TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .collect();
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(source) => {
                debug!(%addr, error = %source, "connect attempt failed");
                last = Some(TransportError::Connect { addr, source });
            }
        }
    }
    Err(last.unwrap_or_else(|| TransportError::NoAddress {
        host: host.to_owned(),
    }))
}

/// Shut down and release the write side of a stream. The read side closes
/// when its owner drops it. Calling again, or with nothing attached, is a no-op.
pub async fn close(writer: &mut Option<OwnedWriteHalf>) {
    if let Some(mut w) = writer.take() {
        if let Err(e) = w.shutdown().await {
            debug!(error = %e, "shutdown on close failed");
        }
    }
}

async fn bounded<T, F>(
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => fut.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        res = timed => res,
    }
}

/// Control messages are tiny; send them without Nagle delay.
fn tune(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
}
