//! The adder service: clients send two numbers, the server replies with the
//! sum. Every connected session also joins a lobby channel so the server can
//! broadcast notices.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_net::{Channel, Codec, Handler, Session, SessionError, SessionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Messages exchanged by the adder client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "head", content = "body")]
pub enum AdderMsg {
    /// Request `a + b`, wrapping on overflow.
    AddReq { a: i64, b: i64 },
    /// The sum.
    AddRsp { c: i64 },
    /// Server announcement sent to the whole lobby.
    Notice { text: String },
}

/// Server-side handler answering add requests.
pub struct AdderService<C: Codec<Message = AdderMsg>> {
    lobby: Channel<SessionId, C>,
}

impl<C: Codec<Message = AdderMsg>> AdderService<C> {
    /// A service with an empty lobby.
    pub fn new() -> Self {
        Self {
            lobby: Channel::new(),
        }
    }

    /// Sessions currently in the lobby.
    pub fn lobby(&self) -> &Channel<SessionId, C> {
        &self.lobby
    }

    /// Send `text` to every lobby member; returns how many received it.
    pub async fn announce(&self, text: &str) -> usize {
        let delivered = self
            .lobby
            .broadcast(AdderMsg::Notice {
                text: text.to_string(),
            })
            .await;
        info!(delivered, members = self.lobby.len(), "notice broadcast");
        delivered
    }
}

impl<C: Codec<Message = AdderMsg>> Default for AdderService<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Codec<Message = AdderMsg>> Handler<C> for AdderService<C> {
    async fn handle_session(&self, session: Arc<Session<C>>) {
        let id = session.id();
        if !self.lobby.put(id, &session) {
            debug!(session_id = %id, "session closed before joining lobby");
            return;
        }
        info!(session_id = %id, lobby = self.lobby.len(), "client joined");

        loop {
            let reply = match session.receive().await {
                Ok(AdderMsg::AddReq { a, b }) => AdderMsg::AddRsp { c: a.wrapping_add(b) },
                Ok(other) => {
                    warn!(session_id = %id, msg = ?other, "unexpected message");
                    continue;
                }
                Err(err) => {
                    debug!(session_id = %id, error = %err, "client left");
                    break;
                }
            };
            if let Err(err) = session.send(reply).await {
                debug!(session_id = %id, error = %err, "reply failed");
                break;
            }
        }
    }
}

/// Run `rounds` add requests over `session`, returning the sums.
///
/// Notices arriving in between are logged and skipped.
pub async fn run_rounds<C>(session: &Session<C>, rounds: i64) -> Result<Vec<i64>, SessionError>
where
    C: Codec<Message = AdderMsg>,
{
    let mut sums = Vec::new();
    for i in 0..rounds {
        session.send(AdderMsg::AddReq { a: i, b: i }).await?;
        info!("send: {i} + {i}");

        loop {
            match session.receive().await? {
                AdderMsg::AddRsp { c } => {
                    info!("receive: {c}");
                    sums.push(c);
                    break;
                }
                AdderMsg::Notice { text } => info!(%text, "server notice"),
                other => warn!(msg = ?other, "unexpected message"),
            }
        }
    }
    Ok(sums)
}
