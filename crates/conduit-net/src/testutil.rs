//! Scriptable in-memory codec for exercising the session machinery.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc, watch};

use crate::codec::{Codec, Protocol, SendQueue};
use crate::signal;

/// Test-side handle for inspecting and steering a [`MockCodec`].
pub(crate) struct Probe {
    incoming: mpsc::UnboundedSender<io::Result<u32>>,
    sent: Mutex<Vec<u32>>,
    drained: Mutex<Vec<u32>>,
    closes: AtomicUsize,
    block_sends: AtomicBool,
    fail_sends: AtomicBool,
    fail_close: AtomicBool,
    closed: watch::Sender<bool>,
    /// Notified each time a send parks because sends are blocked.
    pub(crate) send_parked: Notify,
}

impl Probe {
    pub(crate) fn push(&self, msg: u32) {
        let _ = self.incoming.send(Ok(msg));
    }

    pub(crate) fn push_error(&self, kind: io::ErrorKind) {
        let _ = self.incoming.send(Err(io::Error::new(kind, "scripted failure")));
    }

    pub(crate) fn sent(&self) -> Vec<u32> {
        self.sent.lock().clone()
    }

    pub(crate) fn drained(&self) -> Vec<u32> {
        self.drained.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make every subsequent `send` park forever.
    pub(crate) fn block_sends(&self) {
        self.block_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

/// Codec over `u32` messages driven entirely by its [`Probe`].
pub(crate) struct MockCodec {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<u32>>>,
    probe: Arc<Probe>,
}

impl MockCodec {
    pub(crate) fn new() -> (Self, Arc<Probe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let probe = Arc::new(Probe {
            incoming: tx,
            sent: Mutex::new(Vec::new()),
            drained: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            block_sends: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            closed,
            send_parked: Notify::new(),
        });
        let codec = Self {
            incoming: tokio::sync::Mutex::new(rx),
            probe: Arc::clone(&probe),
        };
        (codec, probe)
    }
}

#[async_trait]
impl Codec for MockCodec {
    type Message = u32;

    async fn receive(&self) -> io::Result<u32> {
        let mut closed = self.probe.closed.subscribe();
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            next = incoming.recv() => next.unwrap_or_else(|| Err(io::ErrorKind::UnexpectedEof.into())),
            () = signal::fired(&mut closed) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    async fn send(&self, msg: u32) -> io::Result<()> {
        if self.probe.fail_sends.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.probe.block_sends.load(Ordering::SeqCst) {
            self.probe.send_parked.notify_one();
            std::future::pending::<()>().await;
        }
        self.probe.sent.lock().push(msg);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.probe.closed.send_replace(true);
        if self.probe.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("close failed"));
        }
        Ok(())
    }

    fn drain_send_queue(&self, queue: &mut SendQueue<u32>) {
        let mut drained = self.probe.drained.lock();
        while let Ok(msg) = queue.try_recv() {
            drained.push(msg);
        }
    }
}

/// Big-endian `u32` messages over a real byte stream.
pub(crate) struct WireCodec<S> {
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    closed: watch::Sender<bool>,
}

impl<S: AsyncRead + AsyncWrite> WireCodec<S> {
    pub(crate) fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed,
        }
    }
}

#[async_trait]
impl<S> Codec for WireCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Message = u32;

    async fn receive(&self) -> io::Result<u32> {
        let mut closed = self.closed.subscribe();
        let mut reader = self.reader.lock().await;
        tokio::select! {
            n = reader.read_u32() => n,
            () = signal::fired(&mut closed) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    async fn send(&self, msg: u32) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_u32(msg).await?;
        writer.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        let _ = self.writer.lock().await.shutdown().await;
        Ok(())
    }
}

/// Builds a [`WireCodec`] for any stream.
pub(crate) struct WireProtocol;

impl<S> Protocol<S> for WireProtocol
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Codec = WireCodec<S>;

    fn new_codec(&self, stream: S) -> io::Result<WireCodec<S>> {
        Ok(WireCodec::new(stream))
    }
}

/// Poll `cond` until it holds, panicking after one second.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 1s"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
