//! Transport-agnostic session core: sessions, the sharded session manager,
//! keyed channels, and the server accept loop with retry backoff.

pub mod accept;
pub mod callback;
pub mod channel;
pub mod client;
pub mod codec;
pub mod error;
pub mod id;
pub mod manager;
pub mod network;
pub mod server;
pub mod session;

mod signal;

#[cfg(test)]
mod testutil;

pub use accept::{AcceptBackoff, BackoffConfig, Listener, is_transient};
pub use callback::{CloseKey, OwnerToken};
pub use channel::Channel;
pub use client::{connect, connect_timeout};
pub use codec::{Codec, Protocol, ProtocolFn, SendQueue};
pub use error::SessionError;
pub use id::{IdGenerator, SessionId};
pub use manager::{Manager, SHARD_COUNT};
pub use network::Network;
pub use server::{Handler, HandlerFn, Server, listen};
pub use session::Session;
