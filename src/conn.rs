//! # Connections
//!
//! [`ConnectionID`] is the opaque handle callers hold for a logical
//! connection. Master-node connections are identified by pubkey alone, so
//! the same handle stays valid across reconnects; other connections are
//! identified by an internal id plus the route token assigned by the
//! accepting side.
//!
//! The rest of this module is proxy-private: the per-connection record and
//! the table indexing records by token and by master-node pubkey. Only the
//! proxy task touches these, so none of it is synchronized.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;

use crate::auth::AuthLevel;
use crate::frame::Frame;
use crate::identity::Identity;

/// Internal id reserved for master-node handles.
const MN_ID: i64 = -1;

/// Opaque handle for a logical connection.
///
/// Equality and hashing partition by kind: two master-node handles are equal
/// iff their pubkeys match, two remote handles are equal iff both the
/// internal id and route token match. A default-constructed handle is
/// invalid and never matches a live connection.
#[derive(Clone)]
pub struct ConnectionID {
    id: i64,
    pubkey: Option<Identity>,
    route: Vec<u8>,
}

impl ConnectionID {
    /// Handle for a master node, addressed by its long-term pubkey.
    pub fn for_mn(pubkey: Identity) -> Self {
        Self {
            id: MN_ID,
            pubkey: Some(pubkey),
            route: Vec::new(),
        }
    }

    pub(crate) fn remote(id: i64, pubkey: Option<Identity>, route: Vec<u8>) -> Self {
        Self { id, pubkey, route }
    }

    /// True for a handle that can refer to a live connection.
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }

    /// True when this handle addresses a master node by pubkey.
    pub fn mn(&self) -> bool {
        self.id == MN_ID
    }

    /// The peer's curve pubkey, if any. All curve-authenticated connections
    /// have one, not only master nodes.
    pub fn pubkey(&self) -> Option<Identity> {
        self.pubkey
    }

    pub(crate) fn internal_id(&self) -> i64 {
        self.id
    }
}

impl Default for ConnectionID {
    fn default() -> Self {
        Self {
            id: 0,
            pubkey: None,
            route: Vec::new(),
        }
    }
}

impl From<Identity> for ConnectionID {
    fn from(pubkey: Identity) -> Self {
        Self::for_mn(pubkey)
    }
}

impl PartialEq for ConnectionID {
    fn eq(&self, other: &Self) -> bool {
        if self.mn() && other.mn() {
            return self.pubkey == other.pubkey;
        }
        self.id == other.id && self.route == other.route
    }
}

impl Eq for ConnectionID {}

impl PartialOrd for ConnectionID {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionID {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.mn() && other.mn() {
            return self.pubkey.cmp(&other.pubkey);
        }
        (self.id, &self.route).cmp(&(other.id, &other.route))
    }
}

impl Hash for ConnectionID {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if self.mn() {
            // Pubkeys are uniformly distributed; the first eight bytes are
            // already a good hash.
            if let Some(pk) = &self.pubkey {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&pk.as_bytes()[..8]);
                state.write_u64(u64::from_le_bytes(prefix));
            }
        } else {
            self.id.hash(state);
            self.route.hash(state);
        }
    }
}

impl fmt::Debug for ConnectionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mn() {
            write!(
                f,
                "ConnectionID(mn {})",
                self.pubkey.map(|p| p.log_id()).unwrap_or_default()
            )
        } else if !self.is_valid() {
            write!(f, "ConnectionID(invalid)")
        } else {
            write!(f, "ConnectionID({})", self.id)
        }
    }
}

impl fmt::Display for ConnectionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Proxy-side records
// ============================================================================

/// Callback for a request's outcome: `(success, reply parts)`.
pub type ReplyCallback = Box<dyn FnOnce(bool, Vec<Vec<u8>>) + Send>;

pub type ConnectSuccess = Box<dyn FnOnce(ConnectionID) + Send>;
pub type ConnectFailure = Box<dyn FnOnce(ConnectionID, String) + Send>;

/// Callback reporting whether a post-start listen bound successfully.
pub type ListenCallback = Box<dyn FnOnce(bool) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnKind {
    CurveIn,
    CurveOut,
    PlainIn,
    PlainOut,
    /// In-process caller connection; no socket, implicitly admin.
    Inproc,
    /// Synthetic connection to our own pubkey; no socket.
    Loopback,
}

impl ConnKind {
    pub fn is_local(self) -> bool {
        matches!(self, ConnKind::Inproc | ConnKind::Loopback)
    }
}

pub(crate) struct PendingRequest {
    pub callback: ReplyCallback,
    pub deadline: Instant,
}

/// Frames queued while an outbound dial is still in flight.
const MAX_QUEUED_FRAMES: usize = 1000;

pub(crate) struct ConnRecord {
    pub token: i64,
    pub id: ConnectionID,
    pub pubkey: Option<Identity>,
    pub kind: ConnKind,
    pub auth: AuthLevel,
    pub last_activity: Instant,
    /// Live once the socket tasks are running; `None` while dialing and for
    /// local kinds.
    pub writer: Option<mpsc::Sender<Frame>>,
    /// Held back until the dial completes.
    pub queued: VecDeque<Frame>,
    pub dialing: bool,
    /// Set after an outbound remote dial completes, until the peer echoes
    /// `HI`; connect callbacks fail if it passes.
    pub hi_deadline: Option<Instant>,
    /// reply tag -> outstanding request issued over this connection.
    pub pending: HashMap<Vec<u8>, PendingRequest>,
    /// Monotonic reply-tag counter. Carried over when a reconnecting
    /// master-node supersedes this record, so transferred tags stay unique.
    pub next_tag: u64,
    /// Set on outbound remote connections until the peer echoes `HI`.
    pub connect_cb: Option<(ConnectSuccess, ConnectFailure)>,
}

impl ConnRecord {
    pub fn new(token: i64, id: ConnectionID, kind: ConnKind, auth: AuthLevel) -> Self {
        let pubkey = id.pubkey();
        Self {
            token,
            id,
            pubkey,
            kind,
            auth,
            last_activity: Instant::now(),
            writer: None,
            queued: VecDeque::new(),
            dialing: false,
            hi_deadline: None,
            pending: HashMap::new(),
            next_tag: 0,
            connect_cb: None,
        }
    }

    pub fn next_reply_tag(&mut self) -> Vec<u8> {
        self.next_tag += 1;
        crate::frame::reply_tag(self.next_tag)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Queue a frame for delivery once the dial completes. Overflow drops
    /// the new frame rather than ballooning memory.
    pub fn queue_frame(&mut self, frame: Frame) {
        if self.queued.len() >= MAX_QUEUED_FRAMES {
            warn!(conn = %self.id, "outbound queue full, dropping frame");
            return;
        }
        self.queued.push_back(frame);
    }

    /// Pull requests whose deadline has passed, removing them from the table.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tag, _)| tag.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|tag| self.pending.remove(&tag))
            .collect()
    }

    pub fn next_pending_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every outstanding request, for failure delivery.
    pub fn take_all_pending(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, p)| p).collect()
    }
}

#[derive(Default)]
pub(crate) struct ConnTable {
    by_token: HashMap<i64, ConnRecord>,
    by_pubkey: HashMap<Identity, i64>,
}

impl ConnTable {
    pub fn insert(&mut self, record: ConnRecord) {
        if let Some(pk) = record.pubkey {
            if record.kind != ConnKind::Inproc {
                self.by_pubkey.insert(pk, record.token);
            }
        }
        self.by_token.insert(record.token, record);
    }

    pub fn get(&self, token: i64) -> Option<&ConnRecord> {
        self.by_token.get(&token)
    }

    pub fn get_mut(&mut self, token: i64) -> Option<&mut ConnRecord> {
        self.by_token.get_mut(&token)
    }

    /// The live connection for a master-node pubkey, whichever side opened it.
    pub fn token_for(&self, pubkey: &Identity) -> Option<i64> {
        self.by_pubkey.get(pubkey).copied()
    }

    pub fn remove(&mut self, token: i64) -> Option<ConnRecord> {
        let record = self.by_token.remove(&token)?;
        if let Some(pk) = record.pubkey {
            // Only drop the index entry if it still points at this record; a
            // superseding connection may already have claimed the pubkey.
            if self.by_pubkey.get(&pk) == Some(&record.token) {
                self.by_pubkey.remove(&pk);
            }
        }
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnRecord> {
        self.by_token.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnRecord> {
        self.by_token.values_mut()
    }

    pub fn tokens(&self) -> Vec<i64> {
        self.by_token.keys().copied().collect()
    }
}
