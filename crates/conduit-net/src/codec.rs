//! The transport boundary: codecs and the protocols that build them.
//!
//! A [`Codec`] turns one duplex byte stream into discrete messages. The core
//! never looks inside a message; it only decides *when* the codec is called
//! and serialises concurrent callers so that a codec sees at most one reader
//! and one writer at a time.

use std::io;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// The receiving end of a session's outbound queue.
///
/// Handed to [`Codec::drain_send_queue`] after it has been closed, so only
/// messages that were accepted but never forwarded remain in it.
pub type SendQueue<M> = mpsc::Receiver<M>;

/// Encodes and decodes messages over one connection.
///
/// Implementations must tolerate one `receive` running concurrently with one
/// `send`. Concurrent senders are never issued: the owning session holds a
/// write lock around every direct send, and buffered sessions funnel all
/// messages through a single send loop.
#[async_trait]
pub trait Codec: Send + Sync + 'static {
    /// The application message type carried by this codec.
    type Message: Send + 'static;

    /// Read the next message from the connection.
    async fn receive(&self) -> io::Result<Self::Message>;

    /// Write one message to the connection.
    async fn send(&self, msg: Self::Message) -> io::Result<()>;

    /// Release the underlying connection. Pending reads should observe EOF.
    async fn close(&self) -> io::Result<()>;

    /// Release messages left in a buffered session's queue when it closes.
    ///
    /// Called at most once, before [`Codec::close`], with the queue already
    /// closed. Must not block. The default drops nothing and leaves the
    /// messages to be freed with the queue.
    fn drain_send_queue(&self, queue: &mut SendQueue<Self::Message>) {
        let _ = queue;
    }
}

/// Builds a [`Codec`] from a freshly established stream of type `S`.
pub trait Protocol<S>: Send + Sync + 'static {
    /// The codec produced for each connection.
    type Codec: Codec;

    /// Wrap `stream` in a codec. On error the stream is dropped, which closes
    /// the connection, and no session is created.
    fn new_codec(&self, stream: S) -> io::Result<Self::Codec>;
}

/// Adapts a plain function or closure into a [`Protocol`].
///
/// ```ignore
/// let protocol = ProtocolFn::new(|stream: TcpStream| Ok(MyCodec::new(stream)));
/// ```
pub struct ProtocolFn<S, F> {
    f: F,
    _stream: PhantomData<fn(S)>,
}

impl<S, F> ProtocolFn<S, F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _stream: PhantomData,
        }
    }
}

impl<S, C, F> Protocol<S> for ProtocolFn<S, F>
where
    S: 'static,
    C: Codec,
    F: Fn(S) -> io::Result<C> + Send + Sync + 'static,
{
    type Codec = C;

    fn new_codec(&self, stream: S) -> io::Result<C> {
        (self.f)(stream)
    }
}
