//! # meshmq - Authenticated Message Queueing and RPC
//!
//! meshmq is a message-queueing and RPC library for meshes of mutually
//! authenticated "master nodes" (MN) plus ordinary remote clients. Peers
//! exchange categorized commands as multipart frames: notifications are
//! one-shot, requests pair with a reply through a per-connection tag.
//!
//! ## Architecture
//!
//! One instance hosts a single **proxy thread** that owns every socket and
//! all runtime state, plus three lanes of worker threads that run handlers
//! and callbacks. Caller threads never touch proxy state; every operation
//! is a control message. This keeps the router single-threaded and lock
//! free while handlers remain free to block.
//!
//! ## Security Model
//!
//! - Identity = 32-byte Ed25519 public key; curve endpoints run a Noise IK
//!   handshake bound to it, so the transport authenticates the peer
//! - Command categories carry an access policy (auth level, remote/local
//!   master-node requirements) re-checked on every incoming command
//! - The active master-node set is replaceable at runtime; promotion and
//!   demotion take effect on the peer's next command
//! - Frame counts and sizes are bounded; malformed frames drop the peer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | The [`MeshMq`] handle: configuration, lifecycle, sends |
//! | `proxy` | Single-threaded router owning sockets and runtime state |
//! | `pool` | General/batch/reply worker lanes |
//! | `conn` | [`ConnectionID`] contract and the connection table |
//! | `registry` | Category and command registry, frozen at start |
//! | `auth` | Auth levels, access policies, admission checks |
//! | `frame` | Multipart frame codec and limits |
//! | `noise` | Curve handshake and per-frame session encryption |
//! | `transport` | Endpoint parsing, listeners, dialing, framed IO |
//! | `timer` | Periodic jobs with squelch semantics |
//! | `identity` | Keypairs and 32-byte identities |
//! | `message` | The [`Message`] handed to command handlers |

mod auth;
mod conn;
mod error;
mod frame;
mod identity;
mod message;
mod node;
mod noise;
mod pool;
mod proxy;
mod registry;
mod timer;
mod transport;

pub use auth::{Access, AllowFn, AuthLevel};
pub use conn::{ConnectFailure, ConnectSuccess, ConnectionID, ListenCallback, ReplyCallback};
pub use error::Error;
pub use identity::{Identity, Keypair};
pub use message::Message;
pub use node::{CategoryRef, LookupFn, MeshMq, MeshMqBuilder};
pub use registry::{CommandHandler, Lane};
pub use timer::TimerId;
pub use transport::Address;
