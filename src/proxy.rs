//! # The Proxy
//!
//! The proxy is the single task that owns every socket and every piece of
//! runtime state: the connection table, the active master-node set, the
//! timer wheel, and the pending-request tables. It runs on a dedicated OS
//! thread driving a current-thread tokio runtime.
//!
//! Nothing else mutates that state. Caller threads and worker threads talk
//! to the proxy exclusively through the unbounded control channel
//! ([`ProxyCommand`]); per-connection socket tasks report in through the
//! event channel ([`ConnEvent`]). Each loop iteration selects over both
//! channels and a deadline sleep derived from the nearest timer fire,
//! request expiry, or sweep.
//!
//! ## Connection lifecycle
//!
//! - Inbound: an accept task completes the (optional) curve handshake off
//!   the proxy, then reports the new connection; the proxy runs the
//!   listener's allow predicate and installs or refuses it.
//! - Outbound: the proxy installs a dialing record, frames queue on it, and
//!   a dial task reports success or failure; master-node records are keyed
//!   by pubkey so either side of an existing mesh link is reused.
//! - Self-send: a send to our own pubkey loops through a socketless record
//!   straight back into dispatch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::auth::{check_access, Admission, AllowFn, AuthLevel};
use crate::conn::{
    ConnKind, ConnRecord, ConnTable, ConnectFailure, ConnectSuccess, ConnectionID, ListenCallback,
    PendingRequest, ReplyCallback,
};
use crate::error::Error;
use crate::frame::{self, Frame};
use crate::identity::{Identity, Keypair};
use crate::message::Message;
use crate::node::{Inner, LookupFn};
use crate::noise;
use crate::pool::WorkerPool;
use crate::registry::{Lane, Registry};
use crate::timer::{TimerId, TimerJob, TimerWheel};
use crate::transport::{self, Address, Endpoint, FrameReader, FrameWriter, ListenerSocket};

/// Default deadline for a request's reply.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for establishing an outbound connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the curve handshake, either side.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an outbound remote connection may wait for the `HI` echo.
const HI_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Master-node connections idle longer than this are closed; the next send
/// re-dials.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long shutdown waits for socket tasks to flush queued frames.
const LINGER: Duration = Duration::from_secs(5);

/// Fallback wake interval when nothing sooner is scheduled.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-connection cap on frames sitting in the socket writer channel.
const OUTBOUND_CHANNEL_CAP: usize = 1000;

pub(crate) type ControlSender = mpsc::UnboundedSender<ProxyCommand>;

/// Control messages from caller and worker threads.
pub(crate) enum ProxyCommand {
    Send {
        to: ConnectionID,
        cmd: String,
        parts: Vec<Vec<u8>>,
    },
    Request {
        to: ConnectionID,
        cmd: String,
        parts: Vec<Vec<u8>>,
        callback: ReplyCallback,
        timeout: Duration,
    },
    SendReply {
        to: ConnectionID,
        tag: Vec<u8>,
        parts: Vec<Vec<u8>>,
    },
    ConnectRemote {
        token: i64,
        addr: Address,
        on_success: ConnectSuccess,
        on_failure: ConnectFailure,
    },
    ConnectInproc {
        token: i64,
        on_success: ConnectSuccess,
    },
    ConnectMn {
        pubkey: Identity,
    },
    Listen {
        spec: ListenerSpec,
    },
    Disconnect {
        conn: ConnectionID,
    },
    SetActiveMns {
        mns: HashSet<Identity>,
    },
    UpdateActiveMns {
        added: Vec<Identity>,
        removed: Vec<Identity>,
    },
    AddTimer {
        id: TimerId,
        job: TimerJob,
        interval: Duration,
        squelch: bool,
    },
    CancelTimer {
        id: TimerId,
    },
    Shutdown,
}

pub(crate) struct ListenerSpec {
    pub addr: String,
    pub endpoint: Endpoint,
    pub curve: bool,
    pub allow: AllowFn,
    pub ack: Option<ListenCallback>,
}

/// Pre-start configuration handed to the proxy when it spins up.
pub(crate) struct StartupState {
    pub listeners: Vec<ListenerSpec>,
    pub timers: Vec<(TimerId, TimerJob, Duration, bool)>,
    pub active_mns: HashSet<Identity>,
}

/// Reports from per-connection socket tasks.
enum ConnEvent {
    Inbound {
        token: i64,
        curve: bool,
        ip: String,
        pubkey: Option<Identity>,
        allow: AllowFn,
        writer: mpsc::Sender<Frame>,
    },
    DialDone {
        token: i64,
        result: Result<mpsc::Sender<Frame>, String>,
    },
    Frame {
        token: i64,
        parts: Frame,
    },
    Closed {
        token: i64,
    },
}

enum Routed {
    Done,
    Bye,
    Command,
    Malformed(&'static str),
}

pub(crate) struct Proxy {
    keypair: Keypair,
    local_pubkey: Identity,
    is_master_node: bool,
    lookup: LookupFn,
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    control_tx: ControlSender,
    control_rx: mpsc::UnboundedReceiver<ProxyCommand>,
    event_tx: mpsc::UnboundedSender<ConnEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnEvent>,
    conns: ConnTable,
    mns: HashSet<Identity>,
    timers: TimerWheel,
    listeners: Vec<(String, JoinHandle<()>)>,
    next_token: Arc<AtomicI64>,
    inner: Weak<Inner>,
    loopback: Option<i64>,
    /// Held (never sent on) by every socket writer task; shutdown waits for
    /// all clones to drop, which means the flushes finished.
    linger_tx: Option<mpsc::Sender<()>>,
    linger_rx: mpsc::Receiver<()>,
}

impl Proxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Keypair,
        is_master_node: bool,
        lookup: LookupFn,
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        control_tx: ControlSender,
        control_rx: mpsc::UnboundedReceiver<ProxyCommand>,
        next_token: Arc<AtomicI64>,
        inner: Weak<Inner>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (linger_tx, linger_rx) = mpsc::channel(1);
        let local_pubkey = keypair.identity();
        Self {
            keypair,
            local_pubkey,
            is_master_node,
            lookup,
            registry,
            pool,
            control_tx,
            control_rx,
            event_tx,
            event_rx,
            conns: ConnTable::default(),
            mns: HashSet::new(),
            timers: TimerWheel::default(),
            listeners: Vec::new(),
            next_token,
            inner,
            loopback: None,
            linger_tx: Some(linger_tx),
            linger_rx,
        }
    }

    pub async fn run(mut self, startup: StartupState, ready: oneshot::Sender<Result<(), Error>>) {
        self.mns = startup.active_mns;
        for (id, job, interval, squelch) in startup.timers {
            self.timers.add(id, job, interval, squelch);
        }
        for mut spec in startup.listeners {
            let ack = spec.ack.take();
            let addr = spec.addr.clone();
            match self.start_listener(spec).await {
                Ok(()) => {
                    if let Some(ack) = ack {
                        self.pool.dispatch(Lane::Reply, Box::new(move || ack(true)));
                    }
                }
                Err(reason) => {
                    let _ = ready.send(Err(Error::Bind { addr, reason }));
                    self.teardown().await;
                    return;
                }
            }
        }
        let _ = ready.send(Ok(()));
        debug!(local = %self.local_pubkey.log_id(), "proxy running");

        loop {
            let wake = self.next_wake();
            tokio::select! {
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(ProxyCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                ev = self.event_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_event(ev);
                    }
                }
                _ = tokio::time::sleep_until(wake) => self.tick(),
            }
        }

        self.teardown().await;
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn next_wake(&self) -> tokio::time::Instant {
        let now = Instant::now();
        let mut next = now + SWEEP_INTERVAL;
        if let Some(t) = self.timers.next_deadline() {
            next = next.min(t);
        }
        for record in self.conns.iter() {
            if let Some(t) = record.next_pending_deadline() {
                next = next.min(t);
            }
            if let Some(t) = record.hi_deadline {
                next = next.min(t);
            }
        }
        tokio::time::Instant::from_std(next.max(now))
    }

    fn tick(&mut self) {
        let now = Instant::now();

        for job in self.timers.take_due(now) {
            self.pool.dispatch(Lane::Batch, job);
        }

        let pool = self.pool.clone();
        let mut hi_expired = Vec::new();
        let mut idle = Vec::new();
        for record in self.conns.iter_mut() {
            for expired in record.take_expired(now) {
                debug!(conn = %record.id, "request timed out");
                pool.dispatch(
                    Lane::Reply,
                    Box::new(move || (expired.callback)(false, Vec::new())),
                );
            }
            if record.hi_deadline.is_some_and(|d| d <= now) {
                hi_expired.push(record.token);
            }
            let is_mn_link = record.pubkey.map(|p| self.mns.contains(&p)).unwrap_or(false);
            if is_mn_link
                && !record.kind.is_local()
                && !record.dialing
                && record.pending.is_empty()
                && now.duration_since(record.last_activity) > IDLE_TIMEOUT
            {
                idle.push(record.token);
            }
        }
        for token in hi_expired {
            self.close_conn(token, false, "timed out waiting for the remote to answer");
        }
        for token in idle {
            debug!(token, "closing idle master-node connection");
            self.close_conn(token, true, "idle");
        }
    }

    // ========================================================================
    // Control commands
    // ========================================================================

    async fn handle_command(&mut self, cmd: ProxyCommand) {
        match cmd {
            ProxyCommand::Send { to, cmd, parts } => {
                self.do_send(to, cmd, parts, None);
            }
            ProxyCommand::Request {
                to,
                cmd,
                parts,
                callback,
                timeout,
            } => {
                self.do_send(to, cmd, parts, Some((callback, timeout)));
            }
            ProxyCommand::SendReply { to, tag, parts } => {
                self.do_reply(to, tag, parts);
            }
            ProxyCommand::ConnectRemote {
                token,
                addr,
                on_success,
                on_failure,
            } => {
                self.do_connect_remote(token, addr, on_success, on_failure);
            }
            ProxyCommand::ConnectInproc { token, on_success } => {
                let id = ConnectionID::remote(token, None, Vec::new());
                self.conns.insert(ConnRecord::new(
                    token,
                    id.clone(),
                    ConnKind::Inproc,
                    AuthLevel::Admin,
                ));
                debug!(conn = %id, "in-process connection opened");
                self.pool
                    .dispatch(Lane::Reply, Box::new(move || on_success(id)));
            }
            ProxyCommand::ConnectMn { pubkey } => {
                self.mn_token(pubkey, true);
            }
            ProxyCommand::Listen { mut spec } => {
                let ack = spec.ack.take();
                match self.start_listener(spec).await {
                    Ok(()) => {
                        if let Some(ack) = ack {
                            self.pool.dispatch(Lane::Reply, Box::new(move || ack(true)));
                        }
                    }
                    Err(reason) => {
                        warn!(reason = %reason, "listen failed");
                        if let Some(ack) = ack {
                            self.pool
                                .dispatch(Lane::Reply, Box::new(move || ack(false)));
                        }
                    }
                }
            }
            ProxyCommand::Disconnect { conn } => {
                if let Some(token) = self.resolve(&conn, false) {
                    self.close_conn(token, true, "disconnected");
                }
            }
            ProxyCommand::SetActiveMns { mns } => {
                debug!(count = mns.len(), "active master-node set replaced");
                self.mns = mns;
            }
            ProxyCommand::UpdateActiveMns { added, removed } => {
                for pk in removed {
                    self.mns.remove(&pk);
                }
                self.mns.extend(added);
            }
            ProxyCommand::AddTimer {
                id,
                job,
                interval,
                squelch,
            } => {
                self.timers.add(id, job, interval, squelch);
            }
            ProxyCommand::CancelTimer { id } => {
                self.timers.cancel(id);
            }
            ProxyCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Resolve a caller-held handle to a live (or dialing) record token.
    /// With `create` set, a master-node handle with no current connection
    /// starts a dial; remote handles are never re-created.
    fn resolve(&mut self, to: &ConnectionID, create: bool) -> Option<i64> {
        if to.mn() {
            let pk = to.pubkey()?;
            return self.mn_token(pk, create);
        }
        let token = to.internal_id();
        if token == 0 || self.conns.get(token).is_none() {
            return None;
        }
        Some(token)
    }

    fn mn_token(&mut self, pk: Identity, create: bool) -> Option<i64> {
        if pk == self.local_pubkey {
            return Some(self.loopback_token());
        }
        if let Some(token) = self.conns.token_for(&pk) {
            return Some(token);
        }
        if !create {
            return None;
        }
        let Some(addr) = (self.lookup)(&pk) else {
            warn!(mn = %pk.log_id(), "no address known for master node; dropping send");
            return None;
        };
        let endpoint = match transport::parse_endpoint(&addr) {
            Ok(ep @ (Endpoint::Tcp(_) | Endpoint::Ipc(_))) => ep,
            Ok(Endpoint::Inproc(_)) | Err(_) => {
                warn!(mn = %pk.log_id(), addr = %addr, "unusable master-node address");
                return None;
            }
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut record = ConnRecord::new(
            token,
            ConnectionID::for_mn(pk),
            ConnKind::CurveOut,
            AuthLevel::None,
        );
        record.dialing = true;
        self.conns.insert(record);
        info!(mn = %pk.log_id(), addr = %addr, "dialing master node");
        self.spawn_dial(token, endpoint, Some(pk));
        Some(token)
    }

    fn loopback_token(&mut self) -> i64 {
        if let Some(token) = self.loopback {
            if self.conns.get(token).is_some() {
                return token;
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(ConnRecord::new(
            token,
            ConnectionID::for_mn(self.local_pubkey),
            ConnKind::Loopback,
            AuthLevel::Admin,
        ));
        self.loopback = Some(token);
        trace!(token, "self-connection installed");
        token
    }

    fn do_send(
        &mut self,
        to: ConnectionID,
        cmd: String,
        parts: Vec<Vec<u8>>,
        request: Option<(ReplyCallback, Duration)>,
    ) {
        // A goodbye never dials: with no live connection there is nothing to
        // say goodbye to.
        if cmd.as_bytes() == frame::BYE {
            if let Some(token) = self.resolve(&to, false) {
                self.close_conn(token, true, "goodbye");
            }
            return;
        }
        if frame::is_reserved(cmd.as_bytes()) {
            warn!(command = %cmd, "refusing to send a reserved protocol word as a command");
            return;
        }

        let Some(token) = self.resolve(&to, true) else {
            debug!(conn = %to, command = %cmd, "send failed: no connection");
            if let Some((callback, _)) = request {
                self.pool
                    .dispatch(Lane::Reply, Box::new(move || callback(false, Vec::new())));
            }
            return;
        };

        let Some(record) = self.conns.get_mut(token) else {
            return;
        };
        let mut frame_parts: Frame = Vec::with_capacity(2 + parts.len());
        frame_parts.push(cmd.into_bytes());
        if let Some((callback, timeout)) = request {
            let tag = record.next_reply_tag();
            record.pending.insert(
                tag.clone(),
                PendingRequest {
                    callback,
                    deadline: Instant::now() + timeout,
                },
            );
            frame_parts.push(tag);
        }
        frame_parts.extend(parts);
        self.deliver(token, frame_parts);
    }

    fn do_reply(&mut self, to: ConnectionID, tag: Vec<u8>, parts: Vec<Vec<u8>>) {
        let Some(token) = self.resolve(&to, true) else {
            debug!(conn = %to, "reply dropped: no connection");
            return;
        };
        let pool = self.pool.clone();
        let Some(record) = self.conns.get_mut(token) else {
            return;
        };
        if record.kind.is_local() {
            // Both ends of a local connection share the record; the reply
            // resolves the stored request directly.
            match record.pending.remove(&tag) {
                Some(p) => pool.dispatch(Lane::Reply, Box::new(move || (p.callback)(true, parts))),
                None => debug!(conn = %record.id, "reply for unknown local tag"),
            }
            return;
        }
        let mut frame_parts: Frame = Vec::with_capacity(2 + parts.len());
        frame_parts.push(frame::REPLY.to_vec());
        frame_parts.push(tag);
        frame_parts.extend(parts);
        self.deliver(token, frame_parts);
    }

    /// Hand a frame to a resolved connection: local records loop it back
    /// into dispatch, live sockets get it on their writer channel, dialing
    /// records queue it.
    fn deliver(&mut self, token: i64, parts: Frame) {
        let is_local = match self.conns.get(token) {
            Some(record) => record.kind.is_local(),
            None => return,
        };
        if is_local {
            self.route_frame(token, parts);
            return;
        }
        let Some(record) = self.conns.get_mut(token) else {
            return;
        };
        record.touch();
        if let Some(writer) = &record.writer {
            if writer.try_send(parts).is_err() {
                warn!(conn = %record.id, "outbound channel full or closed, dropping frame");
            }
        } else {
            record.queue_frame(parts);
        }
    }

    fn do_connect_remote(
        &mut self,
        token: i64,
        addr: Address,
        on_success: ConnectSuccess,
        on_failure: ConnectFailure,
    ) {
        let id = ConnectionID::remote(token, addr.pubkey, Vec::new());
        let endpoint = match transport::parse_endpoint(&addr.url) {
            Ok(ep @ (Endpoint::Tcp(_) | Endpoint::Ipc(_))) => ep,
            Ok(Endpoint::Inproc(_)) => {
                let reason = format!("cannot connect_remote to {}; use connect_inproc", addr.url);
                self.pool
                    .dispatch(Lane::Reply, Box::new(move || on_failure(id, reason)));
                return;
            }
            Err(e) => {
                let reason = e.to_string();
                self.pool
                    .dispatch(Lane::Reply, Box::new(move || on_failure(id, reason)));
                return;
            }
        };
        let kind = if addr.pubkey.is_some() {
            ConnKind::CurveOut
        } else {
            ConnKind::PlainOut
        };
        let mut record = ConnRecord::new(token, id, kind, AuthLevel::None);
        record.dialing = true;
        record.connect_cb = Some((on_success, on_failure));
        self.conns.insert(record);
        debug!(token, addr = %addr.url, "dialing remote");
        self.spawn_dial(token, endpoint, addr.pubkey);
    }

    async fn start_listener(&mut self, spec: ListenerSpec) -> Result<(), String> {
        if self.listeners.iter().any(|(addr, _)| *addr == spec.addr) {
            return Err(format!("already listening on {}", spec.addr));
        }
        let socket = ListenerSocket::bind(&spec.endpoint)
            .await
            .map_err(|e| format!("{e:#}"))?;
        info!(addr = %spec.addr, curve = spec.curve, "listening");
        let handle = spawn_accept_loop(
            socket,
            spec.curve,
            spec.allow,
            self.keypair.clone(),
            self.next_token.clone(),
            self.event_tx.clone(),
            self.linger_sender(),
        );
        self.listeners.push((spec.addr, handle));
        Ok(())
    }

    fn linger_sender(&self) -> mpsc::Sender<()> {
        self.linger_tx
            .as_ref()
            .expect("linger sender taken only at teardown")
            .clone()
    }

    fn spawn_dial(&self, token: i64, endpoint: Endpoint, remote_pubkey: Option<Identity>) {
        let keypair = self.keypair.clone();
        let event_tx = self.event_tx.clone();
        let linger = self.linger_sender();
        tokio::spawn(async move {
            let result = async {
                let mut stream = timeout(DIAL_TIMEOUT, transport::dial(&endpoint))
                    .await
                    .map_err(|_| anyhow::anyhow!("connection timed out"))??;
                let cipher = match &remote_pubkey {
                    Some(pk) => {
                        let cipher = timeout(
                            HANDSHAKE_TIMEOUT,
                            noise::handshake_initiator(&mut stream, &keypair, pk),
                        )
                        .await
                        .map_err(|_| anyhow::anyhow!("handshake timed out"))??;
                        Some(Arc::new(cipher))
                    }
                    None => None,
                };
                let (reader, writer) = transport::framed(stream, cipher);
                Ok::<_, anyhow::Error>(spawn_socket_tasks(
                    token,
                    reader,
                    writer,
                    event_tx.clone(),
                    linger,
                ))
            }
            .await;
            let _ = event_tx.send(ConnEvent::DialDone {
                token,
                result: result.map_err(|e| format!("{e:#}")),
            });
        });
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    fn handle_event(&mut self, ev: ConnEvent) {
        match ev {
            ConnEvent::Inbound {
                token,
                curve,
                ip,
                pubkey,
                allow,
                writer,
            } => self.on_inbound(token, curve, ip, pubkey, allow, writer),
            ConnEvent::DialDone { token, result } => self.on_dial_done(token, result),
            ConnEvent::Frame { token, parts } => self.route_frame(token, parts),
            ConnEvent::Closed { token } => {
                self.close_conn(token, false, "connection closed");
            }
        }
    }

    fn on_inbound(
        &mut self,
        token: i64,
        curve: bool,
        ip: String,
        pubkey: Option<Identity>,
        allow: AllowFn,
        writer: mpsc::Sender<Frame>,
    ) {
        let is_known_mn = curve && pubkey.map(|pk| self.mns.contains(&pk)).unwrap_or(false);
        let level = allow(&ip, pubkey, is_known_mn);
        if level == AuthLevel::Denied {
            info!(ip = %ip, "inbound connection denied");
            drop(writer);
            return;
        }

        // A reconnecting master node supersedes its previous connection.
        // The old record's undelivered frames and outstanding requests move
        // to the new connection rather than failing; the tag counter moves
        // with them so fresh requests cannot collide.
        let mut carried = None;
        let (id, kind) = if is_known_mn {
            let pk = pubkey.expect("known master node has a pubkey");
            if let Some(old_token) = self.conns.token_for(&pk) {
                if let Some(mut old) = self.conns.remove(old_token) {
                    debug!(mn = %pk.log_id(), "superseding existing master-node connection");
                    if let Some((_, on_failure)) = old.connect_cb.take() {
                        let old_id = old.id.clone();
                        self.pool.dispatch(
                            Lane::Reply,
                            Box::new(move || on_failure(old_id, "superseded".to_string())),
                        );
                    }
                    carried = Some((
                        std::mem::take(&mut old.queued),
                        std::mem::take(&mut old.pending),
                        old.next_tag,
                    ));
                }
            }
            (ConnectionID::for_mn(pk), ConnKind::CurveIn)
        } else {
            let route = token.to_be_bytes().to_vec();
            let kind = if curve {
                ConnKind::CurveIn
            } else {
                ConnKind::PlainIn
            };
            (ConnectionID::remote(token, pubkey, route), kind)
        };

        debug!(
            conn = %id,
            ip = %ip,
            level = %level,
            mn = is_known_mn,
            "peer connected"
        );
        let mut record = ConnRecord::new(token, id, kind, level);
        if let Some((queued, pending, next_tag)) = carried {
            for parts in queued {
                let _ = writer.try_send(parts);
            }
            record.pending = pending;
            record.next_tag = next_tag;
        }
        record.writer = Some(writer);
        self.conns.insert(record);
    }

    fn on_dial_done(&mut self, token: i64, result: Result<mpsc::Sender<Frame>, String>) {
        if self.conns.get(token).is_none() {
            // Cancelled while dialing; dropping the writer closes the socket.
            return;
        }
        match result {
            Ok(writer) => {
                let Some(record) = self.conns.get_mut(token) else {
                    return;
                };
                record.dialing = false;
                let queued: Vec<Frame> = record.queued.drain(..).collect();
                for parts in queued {
                    let _ = writer.try_send(parts);
                }
                if record.connect_cb.is_some() {
                    let _ = writer.try_send(vec![frame::HI.to_vec()]);
                    record.hi_deadline = Some(Instant::now() + HI_ACK_TIMEOUT);
                }
                record.writer = Some(writer);
                record.touch();
                debug!(conn = %record.id, "outbound connection established");
            }
            Err(reason) => {
                warn!(token, reason = %reason, "outbound connection failed");
                self.close_conn(token, false, &reason);
            }
        }
    }

    /// Route one inbound frame: protocol words are handled inline, anything
    /// else goes through command dispatch.
    fn route_frame(&mut self, token: i64, mut parts: Frame) {
        let pool = self.pool.clone();
        let action = {
            let Some(record) = self.conns.get_mut(token) else {
                trace!(token, "frame for unknown connection dropped");
                return;
            };
            record.touch();
            if parts.is_empty() || parts[0].is_empty() {
                Routed::Malformed("empty frame")
            } else {
                match parts[0].as_slice() {
                    frame::HI => {
                        if let Some((on_success, _)) = record.connect_cb.take() {
                            record.hi_deadline = None;
                            let id = record.id.clone();
                            pool.dispatch(Lane::Reply, Box::new(move || on_success(id)));
                        } else if let Some(writer) = &record.writer {
                            let _ = writer.try_send(vec![frame::HI.to_vec()]);
                        }
                        Routed::Done
                    }
                    frame::BYE => Routed::Bye,
                    frame::REPLY => {
                        if parts.len() < 2 {
                            Routed::Malformed("REPLY without a tag")
                        } else {
                            let body = parts.split_off(2);
                            let tag = parts.pop().expect("length checked");
                            match record.pending.remove(&tag) {
                                Some(p) => pool.dispatch(
                                    Lane::Reply,
                                    Box::new(move || (p.callback)(true, body)),
                                ),
                                None => {
                                    debug!(conn = %record.id, "reply for unknown or expired tag")
                                }
                            }
                            Routed::Done
                        }
                    }
                    refusal @ (frame::FORBIDDEN | frame::FORBIDDEN_MN | frame::UNKNOWN_COMMAND) => {
                        let refusal = refusal.to_vec();
                        let resolved = parts
                            .get(1)
                            .and_then(|tag| record.pending.remove(tag.as_slice()));
                        match resolved {
                            Some(p) => {
                                let body = vec![refusal];
                                pool.dispatch(
                                    Lane::Reply,
                                    Box::new(move || (p.callback)(false, body)),
                                );
                            }
                            None => debug!(
                                conn = %record.id,
                                refusal = %String::from_utf8_lossy(&refusal),
                                "peer refused a command"
                            ),
                        }
                        Routed::Done
                    }
                    _ => Routed::Command,
                }
            }
        };

        match action {
            Routed::Done => {}
            Routed::Bye => self.close_conn(token, false, "peer said goodbye"),
            Routed::Malformed(why) => {
                warn!(token, why, "malformed frame; dropping connection");
                self.close_conn(token, false, why);
            }
            Routed::Command => self.dispatch_command(token, parts),
        }
    }

    fn dispatch_command(&mut self, token: i64, mut parts: Frame) {
        let registry = self.registry.clone();
        let name = match String::from_utf8(parts[0].clone()) {
            Ok(name) => name,
            Err(_) => {
                warn!(token, "non-utf8 command name");
                self.notify_unknown(token, b"?".to_vec());
                return;
            }
        };
        let Some((category, spec)) = registry.lookup(&name) else {
            warn!(token, command = %name, "unknown command");
            self.notify_unknown(token, name.into_bytes());
            return;
        };
        let access = category.access;
        let is_request = spec.is_request;
        let lane = spec.lane;
        let handler = spec.handler.clone();

        let (tag, body) = if is_request {
            let tag_ok = parts.len() >= 2
                && !parts[1].is_empty()
                && parts[1].len() <= frame::MAX_REPLY_TAG;
            if !tag_ok {
                warn!(token, command = %name, "request without a valid reply tag");
                self.close_conn(token, false, "malformed request");
                return;
            }
            let body = parts.split_off(2);
            (Some(parts.pop().expect("length checked")), body)
        } else {
            (None, parts.split_off(1))
        };

        let Some(record) = self.conns.get(token) else {
            return;
        };
        let conn_id = record.id.clone();
        let auth = record.auth;
        let is_local = record.kind.is_local();
        let peer_is_mn = record.kind == ConnKind::Loopback
            || record.pubkey.map(|pk| self.mns.contains(&pk)).unwrap_or(false);

        match check_access(&access, auth, peer_is_mn, self.is_master_node) {
            Admission::Granted => {
                let message = Message::new(
                    conn_id,
                    body,
                    tag,
                    auth,
                    self.control_tx.clone(),
                    self.inner.clone(),
                );
                self.pool
                    .dispatch(lane, Box::new(move || handler(message)));
            }
            Admission::Forbidden => {
                debug!(conn = %conn_id, command = %name, level = %auth, "forbidden");
                if let Some(tag) = tag {
                    self.refuse(token, frame::FORBIDDEN, tag);
                }
            }
            Admission::ForbiddenMn { drop_connection } => {
                debug!(conn = %conn_id, command = %name, "master-node requirement unmet");
                if let Some(tag) = tag {
                    self.refuse(token, frame::FORBIDDEN_MN, tag);
                }
                if drop_connection && !is_local {
                    // Cut the peer so its retry reconnects and
                    // reauthenticates against the current set.
                    self.close_conn(token, false, "not a master node");
                }
            }
        }
    }

    /// Refuse a request: an error word plus the reply tag, so the caller's
    /// callback fires with `success=false`.
    fn refuse(&mut self, token: i64, word: &'static [u8], tag: Vec<u8>) {
        let pool = self.pool.clone();
        let Some(record) = self.conns.get_mut(token) else {
            return;
        };
        if record.kind.is_local() {
            if let Some(p) = record.pending.remove(&tag) {
                pool.dispatch(
                    Lane::Reply,
                    Box::new(move || (p.callback)(false, vec![word.to_vec()])),
                );
            }
        } else if let Some(writer) = &record.writer {
            let _ = writer.try_send(vec![word.to_vec(), tag]);
        }
    }

    /// Best-effort notice for a command we do not serve; with no reply tag
    /// attached the caller's request simply times out.
    fn notify_unknown(&mut self, token: i64, name: Vec<u8>) {
        if let Some(record) = self.conns.get(token) {
            if let Some(writer) = &record.writer {
                let _ = writer.try_send(vec![frame::UNKNOWN_COMMAND.to_vec(), name]);
            }
        }
    }

    fn close_conn(&mut self, token: i64, send_bye: bool, reason: &str) {
        let Some(mut record) = self.conns.remove(token) else {
            return;
        };
        if send_bye {
            if let Some(writer) = &record.writer {
                let _ = writer.try_send(vec![frame::BYE.to_vec()]);
            }
        }
        // Dropping the sender lets the writer task drain what is queued and
        // then close the socket.
        record.writer = None;
        let pool = self.pool.clone();
        for p in record.take_all_pending() {
            pool.dispatch(
                Lane::Reply,
                Box::new(move || (p.callback)(false, Vec::new())),
            );
        }
        if let Some((_, on_failure)) = record.connect_cb.take() {
            let id = record.id.clone();
            let reason = reason.to_string();
            pool.dispatch(Lane::Reply, Box::new(move || on_failure(id, reason)));
        }
        if self.loopback == Some(token) {
            self.loopback = None;
        }
        debug!(conn = %record.id, reason, "connection closed");
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    async fn teardown(&mut self) {
        debug!("proxy shutting down");
        for (_, handle) in self.listeners.drain(..) {
            handle.abort();
        }
        for token in self.conns.tokens() {
            self.close_conn(token, true, "shutting down");
        }
        // Wait for writer tasks to flush, bounded by the linger. Receiving
        // `None` means every task (each holding a sender clone) has exited.
        drop(self.linger_tx.take());
        let _ = timeout(LINGER, async {
            while self.linger_rx.recv().await.is_some() {}
        })
        .await;
    }
}

// ============================================================================
// Socket tasks
// ============================================================================

/// Spawn the writer and reader tasks for a connected, handshaken stream and
/// return the writer channel. The reader reports frames and the eventual
/// close; the writer drains its channel and shuts the socket down.
fn spawn_socket_tasks(
    token: i64,
    mut reader: FrameReader,
    mut writer: FrameWriter,
    event_tx: mpsc::UnboundedSender<ConnEvent>,
    linger: mpsc::Sender<()>,
) -> mpsc::Sender<Frame> {
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CHANNEL_CAP);

    tokio::spawn(async move {
        let _flushing = linger;
        while let Some(parts) = rx.recv().await {
            if let Err(e) = writer.write_frame(&parts).await {
                debug!(token, error = %format!("{e:#}"), "write failed");
                break;
            }
        }
        writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            match reader.read_frame().await {
                Ok(parts) => {
                    if event_tx.send(ConnEvent::Frame { token, parts }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    trace!(token, error = %format!("{e:#}"), "read ended");
                    let _ = event_tx.send(ConnEvent::Closed { token });
                    return;
                }
            }
        }
    });

    tx
}

fn spawn_accept_loop(
    socket: ListenerSocket,
    curve: bool,
    allow: AllowFn,
    keypair: Keypair,
    next_token: Arc<AtomicI64>,
    event_tx: mpsc::UnboundedSender<ConnEvent>,
    linger: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match socket.accept().await {
                Ok((stream, ip)) => {
                    let allow = allow.clone();
                    let keypair = keypair.clone();
                    let event_tx = event_tx.clone();
                    let next_token = next_token.clone();
                    let linger = linger.clone();
                    tokio::spawn(async move {
                        let mut stream = stream;
                        let (cipher, pubkey) = if curve {
                            match timeout(
                                HANDSHAKE_TIMEOUT,
                                noise::handshake_responder(&mut stream, &keypair),
                            )
                            .await
                            {
                                Ok(Ok((cipher, peer))) => (Some(Arc::new(cipher)), Some(peer)),
                                Ok(Err(e)) => {
                                    debug!(ip = %ip, error = %format!("{e:#}"), "inbound handshake failed");
                                    return;
                                }
                                Err(_) => {
                                    debug!(ip = %ip, "inbound handshake timed out");
                                    return;
                                }
                            }
                        } else {
                            (None, None)
                        };
                        let token = next_token.fetch_add(1, Ordering::Relaxed);
                        let (reader, writer) = transport::framed(stream, cipher);
                        let writer_tx =
                            spawn_socket_tasks(token, reader, writer, event_tx.clone(), linger);
                        let _ = event_tx.send(ConnEvent::Inbound {
                            token,
                            curve,
                            ip,
                            pubkey,
                            allow,
                            writer: writer_tx,
                        });
                    });
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    })
}
