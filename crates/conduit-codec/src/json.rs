//! JSON messages carried in length-prefixed frames.
//!
//! Each frame holds one `serde_json` document. Message types are usually an
//! enum tagged with `#[serde(tag = "head", content = "body")]`, so the wire
//! form names the variant alongside its payload:
//!
//! ```text
//! {"head":"AddReq","body":{"a":1,"b":2}}
//! ```

use std::io;
use std::marker::PhantomData;

use async_trait::async_trait;
use conduit_net::{Codec, Protocol};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};

use crate::framing::{FrameConfig, read_frame, write_frame};

/// Bounds required of a JSON message type.
pub trait JsonMessage: Serialize + DeserializeOwned + Send + 'static {}

impl<T> JsonMessage for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// A [`Codec`] exchanging `M` values as framed JSON over stream `S`.
pub struct JsonCodec<S, M> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    config: FrameConfig,
    closed: watch::Sender<bool>,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> JsonCodec<S, M>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap `stream`.
    pub fn new(stream: S, config: FrameConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            config,
            closed,
            _message: PhantomData,
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn codec_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "codec closed")
}

#[async_trait]
impl<S, M> Codec for JsonCodec<S, M>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    M: JsonMessage,
{
    type Message = M;

    async fn receive(&self) -> io::Result<M> {
        let payload = {
            let mut reader = self.reader.lock().await;
            tokio::select! {
                frame = read_frame(&mut *reader, &self.config) => frame?,
                () = self.wait_closed() => return Err(codec_closed()),
            }
        };
        serde_json::from_slice(&payload).map_err(|err| {
            tracing::debug!(error = %err, len = payload.len(), "undecodable JSON frame");
            io::Error::new(io::ErrorKind::InvalidData, err)
        })
    }

    async fn send(&self, msg: M) -> io::Result<()> {
        let payload =
            serde_json::to_vec(&msg).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let mut writer = self.writer.lock().await;
        tokio::select! {
            written = write_frame(&mut *writer, &payload, &self.config) => Ok(written?),
            () = self.wait_closed() => Err(codec_closed()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}

/// Builds a [`JsonCodec`] for every new connection.
pub struct JsonProtocol<M> {
    config: FrameConfig,
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonProtocol<M> {
    /// A protocol using the default frame limits.
    pub fn new() -> Self {
        Self::with_frame_config(FrameConfig::default())
    }

    /// A protocol with custom frame limits.
    pub fn with_frame_config(config: FrameConfig) -> Self {
        Self {
            config,
            _message: PhantomData,
        }
    }
}

impl<M> Default for JsonProtocol<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, M> Protocol<S> for JsonProtocol<M>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    M: JsonMessage,
{
    type Codec = JsonCodec<S, M>;

    fn new_codec(&self, stream: S) -> io::Result<JsonCodec<S, M>> {
        Ok(JsonCodec::new(stream, self.config.clone()))
    }
}
