//! Client-side connection establishment.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::codec::Protocol;
use crate::id::IdGenerator;
use crate::network::Network;
use crate::session::Session;

/// Dial `address` on `network` and wrap the stream in a new session.
///
/// The session is not registered with any [`Manager`](crate::Manager); the
/// caller owns it outright. `network` must be `"tcp"`, `"tcp4"` or `"tcp6"`.
pub async fn connect<P>(
    network: &str,
    address: &str,
    protocol: &P,
    send_queue_capacity: usize,
    ids: &IdGenerator,
) -> io::Result<Arc<Session<P::Codec>>>
where
    P: Protocol<TcpStream>,
{
    let stream = dial(network, address).await?;
    establish(stream, protocol, send_queue_capacity, ids)
}

/// Like [`connect`], but gives up with [`io::ErrorKind::TimedOut`] if the
/// connection is not established within `timeout`.
pub async fn connect_timeout<P>(
    network: &str,
    address: &str,
    timeout: Duration,
    protocol: &P,
    send_queue_capacity: usize,
    ids: &IdGenerator,
) -> io::Result<Arc<Session<P::Codec>>>
where
    P: Protocol<TcpStream>,
{
    let stream = tokio::time::timeout(timeout, dial(network, address))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {address} timed out after {timeout:?}"),
            )
        })??;
    establish(stream, protocol, send_queue_capacity, ids)
}

fn establish<P>(
    stream: TcpStream,
    protocol: &P,
    send_queue_capacity: usize,
    ids: &IdGenerator,
) -> io::Result<Arc<Session<P::Codec>>>
where
    P: Protocol<TcpStream>,
{
    let codec = protocol.new_codec(stream)?;
    Ok(Session::new(ids.next_id(), codec, send_queue_capacity))
}

async fn dial(network: &str, address: &str) -> io::Result<TcpStream> {
    let network: Network = network.parse()?;
    let mut last_err = None;

    for addr in network.resolve(address).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::warn!(%addr, error = %err, "failed to set TCP_NODELAY");
                }
                tracing::debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(err) => {
                tracing::debug!(%addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to dial")
    }))
}
