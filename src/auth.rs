//! # Authentication and Access Control
//!
//! Every connection carries an [`AuthLevel`] assigned when the peer connects;
//! every command category carries an [`Access`] requirement. Admission is
//! re-checked for each incoming command against the *current* master-node
//! set, so a peer promoted (or demoted) after connecting is treated
//! accordingly on its very next command.
//!
//! The connect-time decision is delegated to an embedder-supplied
//! [`AllowFn`] which sees the peer's IP, its curve pubkey (when the listener
//! is curve-authenticated), and whether that pubkey is a currently-known
//! master node.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Authentication levels, ordered from least to most privileged.
///
/// `Denied` is not a real level: it is returned by an [`AllowFn`] to refuse
/// an incoming connection outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthLevel {
    /// Refuse the connection; no command is ever served.
    Denied,
    /// No authentication; any connecting peer may invoke these commands.
    None,
    /// Requires a login or a node explicitly configured as public.
    Basic,
    /// Administrative commands; typically implied for localhost or
    /// in-process callers by the embedder's policy.
    Admin,
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthLevel::Denied => "denied",
            AuthLevel::None => "none",
            AuthLevel::Basic => "basic",
            AuthLevel::Admin => "admin",
        })
    }
}

/// Access requirement attached to a command category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    /// Minimum auth level required.
    pub auth: AuthLevel,
    /// If true, only peers currently recognized as remote master nodes may
    /// invoke commands in the category.
    pub remote_mn: bool,
    /// If true, the local node itself must be configured as a master node.
    pub local_mn: bool,
}

impl Access {
    pub fn new(auth: AuthLevel, remote_mn: bool, local_mn: bool) -> Self {
        Self {
            auth,
            remote_mn,
            local_mn,
        }
    }
}

/// An `AuthLevel` converts to an `Access` with no master-node requirements,
/// so a bare level can be passed wherever an `Access` is expected.
impl From<AuthLevel> for Access {
    fn from(auth: AuthLevel) -> Self {
        Self {
            auth,
            remote_mn: false,
            local_mn: false,
        }
    }
}

/// Connect-time admission predicate supplied by the embedder.
///
/// Arguments are the peer's IP (empty for `ipc://` peers), the
/// curve-verified pubkey if the listener is curve-authenticated, and whether
/// that pubkey is in the active master-node set. The returned level becomes
/// the connection's effective level; [`AuthLevel::Denied`] closes the
/// connection before any command is served.
pub type AllowFn = Arc<dyn Fn(&str, Option<Identity>, bool) -> AuthLevel + Send + Sync>;

/// Default admission: everyone connects at [`AuthLevel::None`].
pub(crate) fn default_allow() -> AllowFn {
    Arc::new(|_ip, _pubkey, _is_mn| AuthLevel::None)
}

/// Outcome of the per-command admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Granted,
    /// Auth level below the category requirement.
    Forbidden,
    /// Remote or local master-node requirement unmet. `drop_connection` is
    /// set when a non-MN peer hit a remote-MN category: the peer is cut so
    /// its retry reconnects and reauthenticates against the current MN set.
    ForbiddenMn { drop_connection: bool },
}

/// Re-evaluate a category's requirements for one incoming command.
pub(crate) fn check_access(
    access: &Access,
    conn_level: AuthLevel,
    peer_is_mn: bool,
    local_is_mn: bool,
) -> Admission {
    if access.remote_mn && !peer_is_mn {
        return Admission::ForbiddenMn {
            drop_connection: true,
        };
    }
    if access.local_mn && !local_is_mn {
        return Admission::ForbiddenMn {
            drop_connection: false,
        };
    }
    if conn_level < access.auth {
        return Admission::Forbidden;
    }
    Admission::Granted
}
