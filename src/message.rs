//! # Dispatched Messages
//!
//! A [`Message`] is what a command handler receives: an immutable snapshot
//! of the connection it arrived on, the body parts, and (for requests) the
//! reply tag. The snapshot is taken on the proxy task at dispatch time, so
//! handlers see a consistent picture even if the connection is gone by the
//! time they run.
//!
//! Replying and sending back both post control frames to the proxy; nothing
//! here touches sockets.

use std::sync::Weak;

use tracing::warn;

use crate::auth::AuthLevel;
use crate::conn::ConnectionID;
use crate::node::{Inner, MeshMq};
use crate::proxy::{ControlSender, ProxyCommand};

/// An incoming command, handed to its handler on a worker thread.
pub struct Message {
    /// The connection the command arrived on. For master-node peers this is
    /// a pubkey handle; sending to it later reuses or re-dials the mesh
    /// connection.
    pub conn: ConnectionID,
    /// Command body parts, after the command name and reply tag.
    pub data: Vec<Vec<u8>>,
    reply_tag: Option<Vec<u8>>,
    auth: AuthLevel,
    control: ControlSender,
    inner: Weak<Inner>,
}

impl Message {
    pub(crate) fn new(
        conn: ConnectionID,
        data: Vec<Vec<u8>>,
        reply_tag: Option<Vec<u8>>,
        auth: AuthLevel,
        control: ControlSender,
        inner: Weak<Inner>,
    ) -> Self {
        Self {
            conn,
            data,
            reply_tag,
            auth,
            control,
            inner,
        }
    }

    /// The auth level the connection was admitted at.
    pub fn auth_level(&self) -> AuthLevel {
        self.auth
    }

    /// True when this command is a request and a reply is expected.
    pub fn is_request(&self) -> bool {
        self.reply_tag.is_some()
    }

    /// Send the reply for a request command back along the inbound
    /// connection. Logs and does nothing for notification commands.
    pub fn send_reply<P, B>(&self, parts: P)
    where
        P: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let Some(tag) = &self.reply_tag else {
            warn!(conn = %self.conn, "send_reply on a notification command; ignoring");
            return;
        };
        let _ = self.control.send(ProxyCommand::SendReply {
            to: self.conn.clone(),
            tag: tag.clone(),
            parts: parts.into_iter().map(Into::into).collect(),
        });
    }

    /// Send a new command to the peer this message came from, reusing the
    /// same connection.
    pub fn send_back<P, B>(&self, cmd: &str, parts: P)
    where
        P: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let _ = self.control.send(ProxyCommand::Send {
            to: self.conn.clone(),
            cmd: cmd.to_string(),
            parts: parts.into_iter().map(Into::into).collect(),
        });
    }

    /// The owning instance, for handlers that need the full API (for
    /// example to adjust the active master-node set). `None` only while the
    /// instance is being torn down.
    pub fn mq(&self) -> Option<MeshMq> {
        self.inner.upgrade().map(MeshMq::from_inner)
    }
}
