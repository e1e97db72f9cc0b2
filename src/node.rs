//! # High-Level Instance API
//!
//! [`MeshMq`] is the caller-facing handle for one message-queue instance.
//! Before `start()` it collects configuration (categories, listeners,
//! timers, worker counts) under a mutex; `start()` freezes the registry,
//! spawns the worker lanes and the proxy thread, and from then on every
//! operation becomes a control message to the proxy.
//!
//! ## Quick start
//!
//! ```ignore
//! let server = MeshMq::new();
//! server.add_category("public", AuthLevel::None)?
//!     .add_request_command("hello", |m| m.send_reply(["hi"]))?;
//! server.listen_plain("tcp://127.0.0.1:7788")?;
//! server.start()?;
//!
//! let client = MeshMq::new();
//! client.start()?;
//! let conn = client.connect_remote(
//!     Address::plain("tcp://127.0.0.1:7788"),
//!     |conn| println!("connected: {conn}"),
//!     |_conn, why| println!("failed: {why}"),
//! )?;
//! client.request(conn, "public.hello", |ok, parts| { /* ... */ }, [] as [Vec<u8>; 0])?;
//! ```
//!
//! Handles are cheap to clone. The instance shuts down when `shutdown()` is
//! called or the last handle is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::auth::{default_allow, Access, AllowFn};
use crate::conn::{ConnectionID, ListenCallback};
use crate::error::Error;
use crate::identity::{Identity, Keypair};
use crate::message::Message;
use crate::pool::WorkerPool;
use crate::proxy::{
    ControlSender, ListenerSpec, Proxy, ProxyCommand, StartupState, REQUEST_TIMEOUT,
};
use crate::registry::{Lane, Registry};
use crate::timer::TimerId;
use crate::transport::{self, Address, Endpoint};

/// Resolves a master-node pubkey to a dialable address (`tcp://...` or
/// `ipc://...`). Returning `None` makes sends to that pubkey fail (logged).
pub type LookupFn = Arc<dyn Fn(&Identity) -> Option<String> + Send + Sync>;

/// Builder for a [`MeshMq`] instance.
pub struct MeshMqBuilder {
    keypair: Option<Keypair>,
    master_node: bool,
    lookup: LookupFn,
    general_threads: usize,
    batch_threads: usize,
    reply_threads: usize,
}

impl MeshMqBuilder {
    /// Use a long-term identity keypair. Without one, an ephemeral keypair
    /// is generated.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Enable handling of categories that require the local node to be a
    /// master node.
    pub fn master_node(mut self, yes: bool) -> Self {
        self.master_node = yes;
        self
    }

    /// Install the master-node address resolver.
    pub fn lookup<F>(mut self, f: F) -> Self
    where
        F: Fn(&Identity) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Arc::new(f);
        self
    }

    pub fn general_threads(mut self, n: usize) -> Self {
        self.general_threads = n;
        self
    }

    pub fn batch_threads(mut self, n: usize) -> Self {
        self.batch_threads = n;
        self
    }

    pub fn reply_threads(mut self, n: usize) -> Self {
        self.reply_threads = n;
        self
    }

    pub fn build(self) -> MeshMq {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        MeshMq {
            inner: Arc::new(Inner {
                keypair,
                master_node: self.master_node,
                lookup: self.lookup,
                next_token: Arc::new(AtomicI64::new(1)),
                next_timer: AtomicU64::new(1),
                control: OnceLock::new(),
                state: Mutex::new(State::Config(ConfigState {
                    registry: Registry::default(),
                    listeners: Vec::new(),
                    timers: Vec::new(),
                    active_mns: HashSet::new(),
                    general_threads: self.general_threads,
                    batch_threads: self.batch_threads,
                    reply_threads: self.reply_threads,
                })),
            }),
        }
    }
}

struct ConfigState {
    registry: Registry,
    listeners: Vec<ListenerSpec>,
    timers: Vec<(TimerId, crate::timer::TimerJob, Duration, bool)>,
    active_mns: HashSet<Identity>,
    general_threads: usize,
    batch_threads: usize,
    reply_threads: usize,
}

enum State {
    Config(ConfigState),
    Running {
        proxy: Option<std::thread::JoinHandle<()>>,
        pool: Arc<WorkerPool>,
    },
    Stopped,
}

pub(crate) struct Inner {
    keypair: Keypair,
    master_node: bool,
    lookup: LookupFn,
    next_token: Arc<AtomicI64>,
    next_timer: AtomicU64,
    control: OnceLock<ControlSender>,
    state: Mutex<State>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(tx) = self.control.get() {
            let _ = tx.send(ProxyCommand::Shutdown);
        }
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let State::Running { proxy, pool } = state {
            if let Some(handle) = proxy.take() {
                let _ = handle.join();
            }
            pool.shutdown();
        }
    }
}

/// One authenticated message-queue instance. Cloning is cheap and every
/// clone refers to the same instance.
#[derive(Clone)]
pub struct MeshMq {
    inner: Arc<Inner>,
}

impl Default for MeshMq {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshMq {
    /// An instance with an ephemeral identity and default worker counts.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MeshMqBuilder {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        MeshMqBuilder {
            keypair: None,
            master_node: false,
            lookup: Arc::new(|_| None),
            general_threads: cpus,
            batch_threads: (cpus / 2).max(1),
            reply_threads: (cpus / 4).max(1),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// This instance's long-term pubkey.
    pub fn pubkey(&self) -> Identity {
        self.inner.keypair.identity()
    }

    // ========================================================================
    // Pre-start configuration
    // ========================================================================

    fn with_config<T>(
        &self,
        f: impl FnOnce(&mut ConfigState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut state = self.inner.state.lock().expect("state mutex poisoned");
        match &mut *state {
            State::Config(config) => f(config),
            _ => Err(Error::AlreadyStarted),
        }
    }

    /// Register a command category. The returned handle adds commands to it.
    pub fn add_category(
        &self,
        name: &str,
        access: impl Into<Access>,
    ) -> Result<CategoryRef<'_>, Error> {
        self.with_config(|config| config.registry.add_category(name, access.into()))?;
        Ok(CategoryRef {
            mq: self,
            name: name.to_string(),
        })
    }

    /// Register a notification command on the general lane.
    pub fn add_command<F>(&self, category: &str, name: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.with_config(|config| {
            config
                .registry
                .add_command(category, name, Arc::new(handler), false, Lane::General)
        })
    }

    /// Register a request command; its handler receives a reply tag and is
    /// expected to call `send_reply`.
    pub fn add_request_command<F>(
        &self,
        category: &str,
        name: &str,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.with_config(|config| {
            config
                .registry
                .add_command(category, name, Arc::new(handler), true, Lane::General)
        })
    }

    /// Register a notification command whose handler runs on the batch lane.
    pub fn add_batch_command<F>(&self, category: &str, name: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.with_config(|config| {
            config
                .registry
                .add_command(category, name, Arc::new(handler), false, Lane::Batch)
        })
    }

    pub fn set_general_threads(&self, n: usize) -> Result<(), Error> {
        self.with_config(|config| {
            config.general_threads = n.max(1);
            Ok(())
        })
    }

    pub fn set_batch_threads(&self, n: usize) -> Result<(), Error> {
        self.with_config(|config| {
            config.batch_threads = n;
            Ok(())
        })
    }

    pub fn set_reply_threads(&self, n: usize) -> Result<(), Error> {
        self.with_config(|config| {
            config.reply_threads = n;
            Ok(())
        })
    }

    // ========================================================================
    // Listening
    // ========================================================================

    /// Accept curve-authenticated connections on `addr`
    /// (`tcp://host:port` or `ipc:///path`).
    pub fn listen_curve(&self, addr: &str) -> Result<(), Error> {
        self.listen_curve_with(addr, None, None)
    }

    /// `listen_curve` with an admission predicate and a bind ack callback.
    /// Pre-start the ack fires after `start()` binds; post-start it reports
    /// whether the bind succeeded.
    pub fn listen_curve_with(
        &self,
        addr: &str,
        allow: Option<AllowFn>,
        ack: Option<ListenCallback>,
    ) -> Result<(), Error> {
        self.listen_any(addr, true, allow, ack)
    }

    /// Accept plain-text connections on `addr`.
    pub fn listen_plain(&self, addr: &str) -> Result<(), Error> {
        self.listen_plain_with(addr, None, None)
    }

    pub fn listen_plain_with(
        &self,
        addr: &str,
        allow: Option<AllowFn>,
        ack: Option<ListenCallback>,
    ) -> Result<(), Error> {
        self.listen_any(addr, false, allow, ack)
    }

    fn listen_any(
        &self,
        addr: &str,
        curve: bool,
        allow: Option<AllowFn>,
        ack: Option<ListenCallback>,
    ) -> Result<(), Error> {
        let endpoint = transport::parse_endpoint(addr)?;
        if matches!(endpoint, Endpoint::Inproc(_)) {
            return Err(Error::InprocListen(addr.to_string()));
        }
        let mut spec = Some(ListenerSpec {
            addr: addr.to_string(),
            endpoint,
            curve,
            allow: allow.unwrap_or_else(default_allow),
            ack,
        });
        let queued = self.with_config(|config| {
            config.listeners.push(spec.take().expect("spec set above"));
            Ok(())
        });
        match queued {
            Ok(()) => Ok(()),
            Err(Error::AlreadyStarted) => {
                let spec = spec.expect("not consumed pre-start");
                self.control()?
                    .send(ProxyCommand::Listen { spec })
                    .map_err(|_| Error::NotStarted)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spin up the worker lanes and the proxy thread. Binds every listener
    /// registered so far; a bind failure fails the start. Not re-entrant.
    pub fn start(&self) -> Result<(), Error> {
        let config = {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Config(config) => config,
                other => {
                    *state = other;
                    return Err(Error::AlreadyRunning);
                }
            }
        };

        let pool = Arc::new(WorkerPool::start(
            config.general_threads,
            config.batch_threads,
            config.reply_threads,
        ));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let _ = self.inner.control.set(control_tx.clone());

        let registry = config.registry.freeze();
        let startup = StartupState {
            listeners: config.listeners,
            timers: config.timers,
            active_mns: config.active_mns,
        };
        let proxy = Proxy::new(
            self.inner.keypair.clone(),
            self.inner.master_node,
            self.inner.lookup.clone(),
            registry,
            pool.clone(),
            control_tx,
            control_rx,
            self.inner.next_token.clone(),
            Arc::downgrade(&self.inner),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = std::thread::Builder::new()
            .name("meshmq-proxy".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build proxy runtime");
                rt.block_on(proxy.run(startup, ready_tx));
            })
            .expect("failed to spawn proxy thread");

        match ready_rx.blocking_recv() {
            Ok(Ok(())) => {
                let mut state = self.inner.state.lock().expect("state mutex poisoned");
                *state = State::Running {
                    proxy: Some(handle),
                    pool,
                };
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                pool.shutdown();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                pool.shutdown();
                Err(Error::Startup("proxy thread exited during startup".into()))
            }
        }
    }

    /// Stop the proxy, fail outstanding requests, drain the workers, and
    /// join every thread. Idempotent; also runs when the last handle drops.
    pub fn shutdown(&self) {
        if let Some(tx) = self.inner.control.get() {
            let _ = tx.send(ProxyCommand::Shutdown);
        }
        let (handle, pool) = {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            match &mut *state {
                State::Running { proxy, pool } => (proxy.take(), Some(pool.clone())),
                _ => (None, None),
            }
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        if let Some(pool) = pool {
            pool.shutdown();
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            *state = State::Stopped;
        }
    }

    fn control(&self) -> Result<&ControlSender, Error> {
        self.inner.control.get().ok_or(Error::NotStarted)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Open a connection to a remote listener. Returns the connection
    /// handle immediately; exactly one of the callbacks fires once the
    /// connection is confirmed or has failed.
    pub fn connect_remote<S, F>(
        &self,
        addr: Address,
        on_success: S,
        on_failure: F,
    ) -> Result<ConnectionID, Error>
    where
        S: FnOnce(ConnectionID) + Send + 'static,
        F: FnOnce(ConnectionID, String) + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionID::remote(token, addr.pubkey, Vec::new());
        self.control()?
            .send(ProxyCommand::ConnectRemote {
                token,
                addr,
                on_success: Box::new(on_success),
                on_failure: Box::new(on_failure),
            })
            .map_err(|_| Error::NotStarted)?;
        Ok(id)
    }

    /// Open the in-process connection: same dispatch pipeline, no socket,
    /// implicit admin level. The only way to get an `inproc` connection.
    pub fn connect_inproc<S, F>(&self, on_success: S, _on_failure: F) -> Result<ConnectionID, Error>
    where
        S: FnOnce(ConnectionID) + Send + 'static,
        F: FnOnce(ConnectionID, String) + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionID::remote(token, None, Vec::new());
        self.control()?
            .send(ProxyCommand::ConnectInproc {
                token,
                on_success: Box::new(on_success),
            })
            .map_err(|_| Error::NotStarted)?;
        Ok(id)
    }

    /// Connection handle for a master node; begins dialing if no connection
    /// is live. Sends to the returned handle queue until it is.
    pub fn connect_mn(&self, pubkey: Identity) -> Result<ConnectionID, Error> {
        self.control()?
            .send(ProxyCommand::ConnectMn { pubkey })
            .map_err(|_| Error::NotStarted)?;
        Ok(ConnectionID::for_mn(pubkey))
    }

    /// Gracefully close a connection.
    pub fn disconnect(&self, conn: impl Into<ConnectionID>) -> Result<(), Error> {
        self.control()?
            .send(ProxyCommand::Disconnect { conn: conn.into() })
            .map_err(|_| Error::NotStarted)?;
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a notification command. For master-node handles a connection is
    /// reused or dialed as needed; failures are logged, not reported.
    pub fn send<C, P, B>(&self, to: C, cmd: &str, parts: P) -> Result<(), Error>
    where
        C: Into<ConnectionID>,
        P: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        self.control()?
            .send(ProxyCommand::Send {
                to: to.into(),
                cmd: cmd.to_string(),
                parts: parts.into_iter().map(Into::into).collect(),
            })
            .map_err(|_| Error::NotStarted)?;
        Ok(())
    }

    /// Send a request command. The callback fires exactly once with the
    /// reply, or with `success=false` on refusal, timeout, connection loss,
    /// or shutdown.
    pub fn request<C, R, P, B>(&self, to: C, cmd: &str, callback: R, parts: P) -> Result<(), Error>
    where
        C: Into<ConnectionID>,
        R: FnOnce(bool, Vec<Vec<u8>>) + Send + 'static,
        P: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        self.request_with_timeout(to, cmd, callback, parts, REQUEST_TIMEOUT)
    }

    pub fn request_with_timeout<C, R, P, B>(
        &self,
        to: C,
        cmd: &str,
        callback: R,
        parts: P,
        timeout: Duration,
    ) -> Result<(), Error>
    where
        C: Into<ConnectionID>,
        R: FnOnce(bool, Vec<Vec<u8>>) + Send + 'static,
        P: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        self.control()?
            .send(ProxyCommand::Request {
                to: to.into(),
                cmd: cmd.to_string(),
                parts: parts.into_iter().map(Into::into).collect(),
                callback: Box::new(callback),
                timeout,
            })
            .map_err(|_| Error::NotStarted)?;
        Ok(())
    }

    // ========================================================================
    // Master-node set
    // ========================================================================

    /// Replace the active master-node set wholesale.
    pub fn set_active_mns(&self, mns: HashSet<Identity>) {
        let queued = self.with_config(|config| {
            config.active_mns = mns.clone();
            Ok(())
        });
        if queued.is_err() {
            if let Some(tx) = self.inner.control.get() {
                let _ = tx.send(ProxyCommand::SetActiveMns { mns });
            } else {
                warn!("set_active_mns on an instance that never started");
            }
        }
    }

    /// Apply an incremental diff to the active master-node set.
    pub fn update_active_mns<A, R>(&self, added: A, removed: R)
    where
        A: IntoIterator<Item = Identity>,
        R: IntoIterator<Item = Identity>,
    {
        let added: Vec<Identity> = added.into_iter().collect();
        let removed: Vec<Identity> = removed.into_iter().collect();
        let queued = self.with_config(|config| {
            for pk in &removed {
                config.active_mns.remove(pk);
            }
            config.active_mns.extend(added.iter().copied());
            Ok(())
        });
        if queued.is_err() {
            if let Some(tx) = self.inner.control.get() {
                let _ = tx.send(ProxyCommand::UpdateActiveMns { added, removed });
            } else {
                warn!("update_active_mns on an instance that never started");
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Schedule a periodic job on the batch lane. With `squelch`, a tick is
    /// skipped while the previous invocation is still running.
    pub fn add_timer<F>(&self, job: F, interval: Duration, squelch: bool) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = TimerId(self.inner.next_timer.fetch_add(1, Ordering::Relaxed));
        let job: crate::timer::TimerJob = Arc::new(job);
        let queued = self.with_config(|config| {
            config.timers.push((id, job.clone(), interval, squelch));
            Ok(())
        });
        if queued.is_err() {
            if let Some(tx) = self.inner.control.get() {
                let _ = tx.send(ProxyCommand::AddTimer {
                    id,
                    job,
                    interval,
                    squelch,
                });
            }
        }
        id
    }

    /// Cancel a timer. Idempotent, callable from any thread, including from
    /// inside the timer's own job.
    pub fn cancel_timer(&self, id: TimerId) {
        let queued = self.with_config(|config| {
            config.timers.retain(|(tid, ..)| *tid != id);
            Ok(())
        });
        if queued.is_err() {
            if let Some(tx) = self.inner.control.get() {
                let _ = tx.send(ProxyCommand::CancelTimer { id });
            }
        }
    }
}

/// Handle returned by [`MeshMq::add_category`] for chained command
/// registration.
pub struct CategoryRef<'a> {
    mq: &'a MeshMq,
    name: String,
}

impl CategoryRef<'_> {
    pub fn add_command<F>(&self, name: &str, handler: F) -> Result<&Self, Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.mq.add_command(&self.name, name, handler)?;
        Ok(self)
    }

    pub fn add_request_command<F>(&self, name: &str, handler: F) -> Result<&Self, Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.mq.add_request_command(&self.name, name, handler)?;
        Ok(self)
    }

    pub fn add_batch_command<F>(&self, name: &str, handler: F) -> Result<&Self, Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.mq.add_batch_command(&self.name, name, handler)?;
        Ok(self)
    }
}
