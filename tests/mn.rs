//! Master-node mesh integration tests: the self-connection optimization,
//! runtime promotion and demotion (the sandwich pattern), backchatter over a
//! single mesh link, and graceful disconnection.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshmq::{Access, AuthLevel, ConnectionID, Identity, Keypair, MeshMq};

use common::{init_logging, next_addr, no_parts, request_sync, wait_for};

fn mn_only() -> Access {
    Access::new(AuthLevel::None, true, false)
}

#[test]
fn self_connection_mn_optimization() {
    init_logging();
    let keypair = Keypair::generate();
    let pubkey = keypair.identity();
    let listen = next_addr();

    let mn = MeshMq::builder()
        .keypair(keypair)
        .master_node(true)
        .lookup({
            let listen = listen.clone();
            move |pk: &Identity| (*pk == pubkey).then(|| listen.clone())
        })
        .build();
    mn.listen_curve(&listen).unwrap();
    mn.add_category("a", AuthLevel::None).unwrap();

    let invoked = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(None::<(ConnectionID, Vec<Vec<u8>>)>));
    {
        let invoked = invoked.clone();
        let seen = seen.clone();
        mn.add_command("a", "b", move |m| {
            *seen.lock().unwrap() = Some((m.conn.clone(), m.data.clone()));
            invoked.store(true, SeqCst);
        })
        .unwrap();
    }
    mn.set_active_mns([pubkey].into_iter().collect());
    mn.start().unwrap();

    mn.send(pubkey, "a.b", ["my data"]).unwrap();
    assert!(wait_for(|| invoked.load(SeqCst)));

    let (conn, data) = seen.lock().unwrap().clone().expect("handler ran");
    assert!(conn.mn());
    assert_eq!(conn.pubkey(), Some(pubkey));
    assert_eq!(data, vec![b"my data".to_vec()]);

    mn.shutdown();
}

#[test]
fn mn_auth_sandwich() {
    init_logging();
    let listen = next_addr();
    let server_kp = Keypair::generate();
    let server_pk = server_kp.identity();

    let server = MeshMq::builder()
        .keypair(server_kp)
        .master_node(true)
        .build();
    server.listen_curve(&listen).unwrap();

    let public = server.add_category("public", AuthLevel::None).unwrap();
    public
        .add_request_command("hello", |m| m.send_reply(["hi"]))
        .unwrap();
    public
        .add_request_command("sudo", |m| {
            if let (Some(mq), Some(pk)) = (m.mq(), m.conn.pubkey()) {
                mq.update_active_mns([pk], std::iter::empty());
            }
            m.send_reply(["making sandwiches"]);
        })
        .unwrap();
    public
        .add_request_command("nosudo", |m| {
            // Reply before demoting the caller, so the reply goes out on
            // the existing connection rather than queueing behind a fresh
            // master-node dial.
            m.send_reply(["make them yourself"]);
            if let (Some(mq), Some(pk)) = (m.mq(), m.conn.pubkey()) {
                mq.update_active_mns(std::iter::empty(), [pk]);
            }
        })
        .unwrap();
    server
        .add_category("sandwich", mn_only())
        .unwrap()
        .add_request_command("make", |m| m.send_reply(["okay"]))
        .unwrap();
    server.start().unwrap();

    let client = MeshMq::builder()
        .lookup({
            let listen = listen.clone();
            move |pk: &Identity| (*pk == server_pk).then(|| listen.clone())
        })
        .build();
    client.start().unwrap();

    let (ok, _) = request_sync(&client, server_pk, "public.hello");
    assert!(ok);

    // Not a master node yet: refused, and the server cuts the connection.
    let (ok, parts) = request_sync(&client, server_pk, "sandwich.make");
    assert!(!ok);
    assert_eq!(parts, vec![b"FORBIDDEN_MN".to_vec()]);

    // Promotion; the retry reconnects and is recognized.
    let (ok, parts) = request_sync(&client, server_pk, "public.sudo");
    assert!(ok);
    assert_eq!(parts, vec![b"making sandwiches".to_vec()]);

    let (ok, parts) = request_sync(&client, server_pk, "sandwich.make");
    assert!(ok);
    assert_eq!(parts, vec![b"okay".to_vec()]);

    // Demotion; back to refused.
    let (ok, parts) = request_sync(&client, server_pk, "public.nosudo");
    assert!(ok);
    assert_eq!(parts, vec![b"make them yourself".to_vec()]);

    let (ok, parts) = request_sync(&client, server_pk, "sandwich.make");
    assert!(!ok);
    assert_eq!(parts, vec![b"FORBIDDEN_MN".to_vec()]);

    client.shutdown();
    server.shutdown();
}

fn mesh_node(keypair: Keypair, addrs: HashMap<Identity, String>) -> MeshMq {
    MeshMq::builder()
        .keypair(keypair)
        .master_node(true)
        .lookup(move |pk: &Identity| addrs.get(pk).cloned())
        .build()
}

#[test]
fn mn_backchatter() {
    init_logging();
    let kp_a = Keypair::generate();
    let kp_b = Keypair::generate();
    let pk_a = kp_a.identity();
    let pk_b = kp_b.identity();
    let addr_a = next_addr();
    let addr_b = next_addr();
    let addrs: HashMap<Identity, String> =
        [(pk_a, addr_a.clone()), (pk_b, addr_b.clone())].into();

    let a = mesh_node(kp_a, addrs.clone());
    let b = mesh_node(kp_b, addrs);
    a.listen_curve(&addr_a).unwrap();
    b.listen_curve(&addr_b).unwrap();
    let mns: HashSet<Identity> = [pk_a, pk_b].into_iter().collect();
    a.set_active_mns(mns.clone());
    b.set_active_mns(mns);

    let forwarded = Arc::new(Mutex::new(Vec::new()));
    let cat = a.add_category("a", mn_only()).unwrap();
    cat.add_command("a", |m| {
        // Answer over the same mesh link the command came in on.
        if let Some(mq) = m.mq() {
            let _ = mq.send(m.conn.clone(), "b.b", ["abc"]);
        }
    })
    .unwrap();
    {
        let forwarded = forwarded.clone();
        cat.add_command("z", move |m| {
            *forwarded.lock().unwrap() = m.data[0].clone();
        })
        .unwrap();
    }
    b.add_category("b", mn_only())
        .unwrap()
        .add_command("b", |m| m.send_back("a.z", [m.data[0].clone()]))
        .unwrap();

    a.start().unwrap();
    b.start().unwrap();

    let conn = b.connect_mn(pk_a).unwrap();
    b.send(conn, "a.a", no_parts()).unwrap();

    assert!(wait_for(|| forwarded.lock().unwrap().as_slice() == b"abc"));

    a.shutdown();
    b.shutdown();
}

#[test]
fn mn_disconnections() {
    init_logging();
    let keypairs: Vec<Keypair> = (0..3).map(|_| Keypair::generate()).collect();
    let pks: Vec<Identity> = keypairs.iter().map(Keypair::identity).collect();
    let addrs: HashMap<Identity, String> = pks.iter().map(|pk| (*pk, next_addr())).collect();
    let mns: HashSet<Identity> = pks.iter().copied().collect();

    let his = Arc::new(AtomicI32::new(0));
    let nodes: Vec<MeshMq> = keypairs
        .into_iter()
        .map(|kp| {
            let node = mesh_node(kp, addrs.clone());
            node.listen_curve(&addrs[&node.pubkey()]).unwrap();
            let his = his.clone();
            node.add_category("mn", mn_only())
                .unwrap()
                .add_command("hi", move |_m| {
                    his.fetch_add(1, SeqCst);
                })
                .unwrap();
            node.set_active_mns(mns.clone());
            node.start().unwrap();
            node
        })
        .collect();

    nodes[0].send(pks[1], "mn.hi", no_parts()).unwrap();
    nodes[0].send(pks[2], "mn.hi", no_parts()).unwrap();
    nodes[2].send(pks[0], "mn.hi", no_parts()).unwrap();
    nodes[2].send(pks[1], "mn.hi", no_parts()).unwrap();
    assert!(wait_for(|| his.load(SeqCst) >= 4));

    // Goodbye tears down the 1<->0 link; everything else keeps working.
    nodes[1].send(pks[0], "BYE", no_parts()).unwrap();
    nodes[0].send(pks[2], "mn.hi", no_parts()).unwrap();

    assert!(wait_for(|| his.load(SeqCst) >= 5));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(his.load(SeqCst), 5);

    // The torn-down link re-dials on the next send.
    nodes[1].send(pks[0], "mn.hi", no_parts()).unwrap();
    assert!(wait_for(|| his.load(SeqCst) >= 6));

    for node in &nodes {
        node.shutdown();
    }
}
