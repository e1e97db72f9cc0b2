//! Connection-level integration tests: curve and plain listeners, post-start
//! listening, connection identity, in-process connections, and worker-lane
//! starvation.

mod common;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshmq::{Address, AuthLevel, ConnectionID, Error, MeshMq};

use common::{
    connect_ok, init_logging, next_addr, no_parts, request_sync, request_sync_parts, wait_for,
};

fn hash_of(id: &ConnectionID) -> u64 {
    let mut h = DefaultHasher::new();
    id.hash(&mut h);
    h.finish()
}

#[test]
fn curve_request_reply() {
    init_logging();
    let listen = next_addr();
    let server = MeshMq::new();
    server.listen_curve(&listen).unwrap();
    server
        .add_category("public", AuthLevel::None)
        .unwrap()
        .add_request_command("hello", |m| m.send_reply(["hi"]))
        .unwrap();
    server.start().unwrap();

    let client = MeshMq::new();
    client.start().unwrap();

    let conn = connect_ok(&client, Address::curve(&listen, server.pubkey()));
    let (ok, parts) = request_sync(&client, conn, "public.hello");
    assert!(ok);
    assert_eq!(parts, vec![b"hi".to_vec()]);

    client.shutdown();
    server.shutdown();
}

#[test]
fn plain_text_connections() {
    init_logging();
    let listen = next_addr();
    let server = MeshMq::new();
    server
        .add_category("public", AuthLevel::None)
        .unwrap()
        .add_request_command("hello", |m| m.send_reply(["hi"]))
        .unwrap();
    server.listen_plain(&listen).unwrap();
    server.start().unwrap();

    let client = MeshMq::new();
    client.start().unwrap();

    let conn = connect_ok(&client, Address::plain(&listen));
    let (ok, parts) = request_sync(&client, conn, "public.hello");
    assert!(ok);
    assert_eq!(parts, vec![b"hi".to_vec()]);

    client.shutdown();
    server.shutdown();
}

#[test]
fn post_start_listening() {
    init_logging();
    let server = MeshMq::new();
    server
        .add_category("x", AuthLevel::None)
        .unwrap()
        .add_request_command("y", |m| m.send_reply([b"hi".to_vec(), m.data[0].clone()]))
        .unwrap();
    server.start().unwrap();

    let listens = Arc::new(AtomicI32::new(0));
    let listen_curve = next_addr();
    let listen_plain = next_addr();
    {
        let listens = listens.clone();
        server
            .listen_curve_with(
                &listen_curve,
                None,
                Some(Box::new(move |ok| {
                    if ok {
                        listens.fetch_add(1, SeqCst);
                    }
                })),
            )
            .unwrap();
    }
    {
        let listens = listens.clone();
        server
            .listen_plain_with(
                &listen_plain,
                None,
                Some(Box::new(move |ok| {
                    if ok {
                        listens.fetch_add(10, SeqCst);
                    }
                })),
            )
            .unwrap();
    }
    assert!(wait_for(|| listens.load(SeqCst) >= 11));
    assert_eq!(listens.load(SeqCst), 11);

    // Already bound by the plain listener: the ack must report failure.
    {
        let listens = listens.clone();
        server
            .listen_curve_with(
                &listen_plain,
                None,
                Some(Box::new(move |ok| {
                    if !ok {
                        listens.fetch_add(1, SeqCst);
                    }
                })),
            )
            .unwrap();
    }
    assert!(wait_for(|| listens.load(SeqCst) >= 12));
    assert_eq!(listens.load(SeqCst), 12);

    let client = MeshMq::new();
    client.start().unwrap();
    let c1 = connect_ok(&client, Address::curve(&listen_curve, server.pubkey()));
    let c2 = connect_ok(&client, Address::plain(&listen_plain));

    let (ok1, parts1) = request_sync_parts(&client, c1, "x.y", [" world"]);
    let (ok2, parts2) = request_sync_parts(&client, c2, "x.y", [" cat"]);
    assert!(ok1);
    assert!(ok2);
    assert_eq!(parts1.concat(), b"hi world");
    assert_eq!(parts2.concat(), b"hi cat");

    client.shutdown();
    server.shutdown();
}

#[test]
fn unique_connection_ids() {
    init_logging();
    let listen = next_addr();
    let server = MeshMq::new();
    let first = Arc::new(Mutex::new(ConnectionID::default()));
    let second = Arc::new(Mutex::new(ConnectionID::default()));

    let cat = server.add_category("x", AuthLevel::None).unwrap();
    {
        let first = first.clone();
        cat.add_request_command("x", move |m| {
            *first.lock().unwrap() = m.conn.clone();
            m.send_reply(["hi"]);
        })
        .unwrap();
    }
    {
        let second = second.clone();
        cat.add_request_command("y", move |m| {
            *second.lock().unwrap() = m.conn.clone();
            m.send_reply(["hi"]);
        })
        .unwrap();
    }
    server.listen_plain(&listen).unwrap();
    server.start().unwrap();

    let client1 = MeshMq::new();
    let client2 = MeshMq::new();
    client1.start().unwrap();
    client2.start().unwrap();

    let r1 = connect_ok(&client1, Address::plain(&listen));
    let r2 = connect_ok(&client2, Address::plain(&listen));

    // Before any request both are the default (invalid) handle.
    {
        let a = first.lock().unwrap();
        let b = second.lock().unwrap();
        assert_eq!(*a, *b);
        assert!(!a.is_valid());
        assert!(!b.is_valid());
    }

    let (ok1, _) = request_sync(&client1, r1, "x.x");
    let (ok2, _) = request_sync(&client2, r2, "x.y");
    assert!(ok1);
    assert!(ok2);

    let a = first.lock().unwrap().clone();
    let b = second.lock().unwrap().clone();
    assert!(a.is_valid());
    assert!(b.is_valid());
    assert_ne!(a, b);
    assert_ne!(hash_of(&a), hash_of(&b));

    client1.shutdown();
    client2.shutdown();
    server.shutdown();
}

#[test]
fn inproc_connections() {
    init_logging();
    let mq = MeshMq::new();
    mq.add_category("public", AuthLevel::None)
        .unwrap()
        .add_request_command("hello", |m| m.send_reply(["hi"]))
        .unwrap();
    mq.start().unwrap();

    let connected = Arc::new(AtomicBool::new(false));
    let conn = {
        let connected = connected.clone();
        mq.connect_inproc(
            move |_conn| connected.store(true, SeqCst),
            |_conn, why: String| panic!("inproc connection failed: {why}"),
        )
        .unwrap()
    };
    assert!(wait_for(|| connected.load(SeqCst)));

    let (ok, parts) = request_sync(&mq, conn, "public.hello");
    assert!(ok);
    assert_eq!(parts, vec![b"hi".to_vec()]);

    mq.shutdown();
}

#[test]
fn no_explicit_inproc_listening() {
    let mq = MeshMq::new();
    assert!(matches!(
        mq.listen_plain("inproc://foo"),
        Err(Error::InprocListen(_))
    ));
    assert!(matches!(
        mq.listen_curve("inproc://foo"),
        Err(Error::InprocListen(_))
    ));
}

#[test]
fn inproc_connection_permissions() {
    init_logging();
    let listen = next_addr();
    let mq = MeshMq::new();
    mq.add_category("public", AuthLevel::None)
        .unwrap()
        .add_request_command("hello", |m| m.send_reply(["hi"]))
        .unwrap();
    mq.add_category("private", AuthLevel::Admin)
        .unwrap()
        .add_request_command("handshake", |m| m.send_reply(["yo dude"]))
        .unwrap();
    mq.listen_plain(&listen).unwrap();
    mq.start().unwrap();

    let connected = Arc::new(AtomicBool::new(false));
    let c_inproc = {
        let connected = connected.clone();
        mq.connect_inproc(
            move |_conn| connected.store(true, SeqCst),
            |_conn, why: String| panic!("inproc connection failed: {why}"),
        )
        .unwrap()
    };
    assert!(wait_for(|| connected.load(SeqCst)));
    let c_pub = connect_ok(&mq, Address::plain(&listen));

    let (ok, parts) = request_sync(&mq, c_inproc.clone(), "public.hello");
    assert!(ok);
    assert_eq!(parts, vec![b"hi".to_vec()]);

    let (ok, _) = request_sync(&mq, c_pub.clone(), "public.hello");
    assert!(ok);

    // The in-process connection is implicitly admin.
    let (ok, parts) = request_sync(&mq, c_inproc, "private.handshake");
    assert!(ok);
    assert_eq!(parts, vec![b"yo dude".to_vec()]);

    // A plain remote peer is not.
    let (ok, _) = request_sync(&mq, c_pub, "private.handshake");
    assert!(!ok);

    mq.shutdown();
}

#[test]
fn single_worker_completes_requests() {
    init_logging();
    let listen = next_addr();
    let server = MeshMq::new();
    server.set_general_threads(1).unwrap();
    server.set_batch_threads(0).unwrap();
    server.set_reply_threads(0).unwrap();
    server.listen_plain(&listen).unwrap();
    server
        .add_category("c", AuthLevel::None)
        .unwrap()
        .add_request_command("x", |m| m.send_reply(no_parts()))
        .unwrap();
    server.start().unwrap();

    let client = MeshMq::new();
    client.start().unwrap();
    let conn = connect_ok(&client, Address::plain(&listen));

    let (ok, _) = request_sync(&client, conn.clone(), "c.x");
    assert!(ok);
    let (ok, _) = request_sync(&client, conn, "c.x");
    assert!(ok);

    client.shutdown();
    server.shutdown();
}

#[test]
fn unknown_command_request_times_out() {
    init_logging();
    let listen = next_addr();
    let server = MeshMq::new();
    server.add_category("public", AuthLevel::None).unwrap();
    server.listen_plain(&listen).unwrap();
    server.start().unwrap();

    let client = MeshMq::new();
    client.start().unwrap();
    let conn = connect_ok(&client, Address::plain(&listen));

    let done = Arc::new(AtomicBool::new(false));
    let ok = Arc::new(AtomicBool::new(true));
    {
        let done = done.clone();
        let ok = ok.clone();
        client
            .request_with_timeout(
                conn,
                "public.nope",
                move |success, _parts| {
                    ok.store(success, SeqCst);
                    done.store(true, SeqCst);
                },
                no_parts(),
                Duration::from_millis(300),
            )
            .unwrap();
    }
    assert!(wait_for(|| done.load(SeqCst)));
    assert!(!ok.load(SeqCst));

    client.shutdown();
    server.shutdown();
}

#[test]
fn shutdown_fails_pending_requests() {
    init_logging();
    let listen = next_addr();
    let server = MeshMq::new();
    server
        .add_category("void", AuthLevel::None)
        .unwrap()
        .add_request_command("ever", |_m| {
            // Never replies; the caller only hears back at shutdown.
        })
        .unwrap();
    server.listen_plain(&listen).unwrap();
    server.start().unwrap();

    let client = MeshMq::new();
    client.start().unwrap();
    let conn = connect_ok(&client, Address::plain(&listen));

    let done = Arc::new(AtomicBool::new(false));
    let ok = Arc::new(AtomicBool::new(true));
    {
        let done = done.clone();
        let ok = ok.clone();
        client
            .request(
                conn,
                "void.ever",
                move |success, _parts| {
                    ok.store(success, SeqCst);
                    done.store(true, SeqCst);
                },
                no_parts(),
            )
            .unwrap();
    }
    // Give the request time to reach the server, then pull the plug.
    std::thread::sleep(Duration::from_millis(100));
    client.shutdown();
    assert!(done.load(SeqCst), "pending callback must fire at shutdown");
    assert!(!ok.load(SeqCst));

    server.shutdown();
}

#[test]
fn configuration_errors() {
    let mq = MeshMq::new();
    mq.add_category("dup", AuthLevel::None).unwrap();
    assert!(matches!(
        mq.add_category("dup", AuthLevel::None),
        Err(Error::DuplicateCategory(_))
    ));
    assert!(matches!(
        mq.add_category("bad.name", AuthLevel::None),
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        mq.add_command("ghost", "x", |_m| {}),
        Err(Error::UnknownCategory(_))
    ));

    mq.start().unwrap();
    assert!(matches!(
        mq.add_category("late", AuthLevel::None),
        Err(Error::AlreadyStarted)
    ));
    assert!(matches!(mq.start(), Err(Error::AlreadyRunning)));
    mq.shutdown();
}
