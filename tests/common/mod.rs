//! Shared helpers for the integration tests: unique loopback endpoints and
//! condition polling.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Each test binary is its own process, so deriving the port base from the
/// pid keeps parallel binaries off each other's ports.
fn port_base() -> u16 {
    20000 + (std::process::id() % 20000) as u16
}

/// A fresh loopback endpoint, unique within the test binary.
pub fn next_addr() -> String {
    format!(
        "tcp://127.0.0.1:{}",
        port_base() + PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Poll `cond` until it holds or ten seconds pass; returns its final value.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// An empty parts iterator, for commands with no body.
pub fn no_parts() -> std::iter::Empty<Vec<u8>> {
    std::iter::empty()
}

/// Connect and wait for the success callback; panics on failure.
pub fn connect_ok(client: &meshmq::MeshMq, addr: meshmq::Address) -> meshmq::ConnectionID {
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
    use std::sync::{Arc, Mutex};

    let connected = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(Mutex::new(None::<String>));
    let conn = {
        let connected = connected.clone();
        let failed = failed.clone();
        client
            .connect_remote(
                addr,
                move |_conn| connected.store(true, SeqCst),
                move |_conn, why| *failed.lock().unwrap() = Some(why),
            )
            .expect("connect_remote")
    };
    assert!(
        wait_for(|| connected.load(SeqCst) || failed.lock().unwrap().is_some()),
        "connection callback never fired"
    );
    if let Some(why) = failed.lock().unwrap().take() {
        panic!("connection failed: {why}");
    }
    conn
}

/// Issue a request and wait for its callback, returning (success, parts).
pub fn request_sync(
    client: &meshmq::MeshMq,
    conn: impl Into<meshmq::ConnectionID>,
    cmd: &str,
) -> (bool, Vec<Vec<u8>>) {
    request_sync_parts(client, conn, cmd, no_parts())
}

pub fn request_sync_parts<P, B>(
    client: &meshmq::MeshMq,
    conn: impl Into<meshmq::ConnectionID>,
    cmd: &str,
    parts: P,
) -> (bool, Vec<Vec<u8>>)
where
    P: IntoIterator<Item = B>,
    B: Into<Vec<u8>>,
{
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
    use std::sync::{Arc, Mutex};

    let done = Arc::new(AtomicBool::new(false));
    let result = Arc::new(Mutex::new((false, Vec::new())));
    {
        let done = done.clone();
        let result = result.clone();
        client
            .request(
                conn,
                cmd,
                move |ok, data| {
                    *result.lock().unwrap() = (ok, data);
                    done.store(true, SeqCst);
                },
                parts,
            )
            .expect("request");
    }
    assert!(wait_for(|| done.load(SeqCst)), "request never completed");
    let result = result.lock().unwrap();
    result.clone()
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
