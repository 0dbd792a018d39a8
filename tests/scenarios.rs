//! End-to-end scenarios exercising the async manager, connection router,
//! correlator, and association table together, the way a real client and
//! server pair would.
//!
//! Every manager here is driven by its own background thread running
//! [`Manager::run`]; the actual `send`/`wait_for`/`wait_timeout` calls
//! always happen inside a fiber spawned on the *client* manager's own
//! scheduler, never on the thread driving that manager's loop — calling
//! them from the manager's own thread would suspend against a scheduler
//! with no other ready fiber, which falls straight back to the manager
//! and never blocks (see `ipc::manager`'s own tests for the same
//! constraint).

use std::net::Ipv4Addr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;

use asyncipc::config::Config;
use asyncipc::error::Errno;
use asyncipc::ipc::connection::{ConnectionCtx, Handler};
use asyncipc::ipc::kernel::{LoopbackKernel, Method};
use asyncipc::ipc::manager::Manager;
use asyncipc::udp::{Addr, AssocTable, Endpoint, EndpointPair, Port, UdpAssoc, Version};
use asyncipc::Error;

fn run_in_background(manager: Arc<Manager>) -> thread::JoinHandle<()> {
    thread::spawn(move || manager.run())
}

fn connect(client: &Arc<Manager>, phone: u64) -> (i32, u64) {
    let (tx, rx) = mpsc::channel();
    let client_for_fiber = Arc::clone(client);
    client.scheduler().spawn(
        move |_: ()| {
            let id = client_for_fiber.send(phone, Method::ConnectMeTo, [0, 0, phone, 0, 0]);
            let (retval, _answer) = client_for_fiber.wait_for(id).unwrap();
            let _ = tx.send(retval);
        },
        (),
    );
    let retval = rx.recv_timeout(Duration::from_secs(2)).expect("connect fiber never replied");
    (retval, phone)
}

/// Scenario 1: a single ping round-trips the argument it was sent with.
#[test]
fn single_ping_roundtrip() {
    let config = Config::default();
    let client_kernel = LoopbackKernel::new_bus();
    let server_kernel = LoopbackKernel::new_peer(&client_kernel);
    let phone = client_kernel.connect(&server_kernel);

    let handler: Handler = Arc::new(|ctx: ConnectionCtx, callid, call| {
        ctx.answer(callid, 0, call.args[0], 0);
    });

    let server = Manager::with_handler(server_kernel, &config, handler);
    let client = Manager::new(client_kernel, &config);
    let _server_thread = run_in_background(Arc::clone(&server));
    let _client_thread = run_in_background(Arc::clone(&client));

    let (connect_retval, _) = connect(&client, phone);
    assert_eq!(connect_retval, 0);

    let (tx, rx) = mpsc::channel();
    let client_for_fiber = Arc::clone(&client);
    client.scheduler().spawn(
        move |_: ()| {
            let id = client_for_fiber.send(phone, Method::User(1), [0x2a, 0, 0, 0, 0]);
            let (retval, answer) = client_for_fiber.wait_for(id).unwrap();
            let _ = tx.send((retval, answer.unwrap().r1));
        },
        (),
    );
    let (retval, echoed) = rx.recv_timeout(Duration::from_secs(2)).expect("ping fiber never replied");
    assert_eq!(retval, 0);
    assert_eq!(echoed, 0x2a);
}

/// Scenario 2: six concurrent pings each get their own argument echoed
/// back, with no guarantee about completion order — only that the set of
/// `(id, arg1)` pairs observed is exactly `{(1,1)..(6,6)}`.
#[test]
fn six_concurrent_pings_all_complete() {
    let config = Config::default();
    let client_kernel = LoopbackKernel::new_bus();
    let server_kernel = LoopbackKernel::new_peer(&client_kernel);
    let phone = client_kernel.connect(&server_kernel);

    let handler: Handler = Arc::new(|ctx: ConnectionCtx, callid, call| {
        // Serve every subsequent call on this same connection too, so all
        // six pings can share one phone/connection.
        let mut callid = callid;
        let mut call = call;
        loop {
            ctx.answer(callid, 0, call.args[0], call.args[0]);
            let next = ctx.get_call();
            callid = next.0;
            call = next.1;
        }
    });

    let server = Manager::with_handler(server_kernel, &config, handler);
    let client = Manager::new(client_kernel, &config);
    let _server_thread = run_in_background(Arc::clone(&server));
    let _client_thread = run_in_background(Arc::clone(&client));

    let (connect_retval, _) = connect(&client, phone);
    assert_eq!(connect_retval, 0);

    let (tx, rx) = mpsc::channel();
    for n in 1..=6u64 {
        let client_for_fiber = Arc::clone(&client);
        let tx = tx.clone();
        client.scheduler().spawn(
            move |_: ()| {
                let id = client_for_fiber.send(phone, Method::User(n as u32), [n, 0, 0, 0, 0]);
                let (retval, answer) = client_for_fiber.wait_for(id).unwrap();
                let _ = tx.send((retval, answer.unwrap().r1));
            },
            (),
        );
    }
    drop(tx);

    let mut observed: Vec<(i32, u64)> = Vec::new();
    for _ in 0..6 {
        observed.push(rx.recv_timeout(Duration::from_secs(2)).expect("ping fiber never replied"));
    }
    observed.sort_by_key(|(_, arg)| *arg);
    let expected: Vec<(i32, u64)> = (1..=6).map(|n| (0, n)).collect();
    assert_eq!(observed, expected);
}

/// Scenario 3: a hangup mid-flight completes the in-flight ping with
/// `EHANGUP`, and a fresh `connect_me_to` afterwards gets a brand new
/// phone/connection unaffected by the torn-down one.
#[test]
fn hangup_mid_flight_then_reconnect() {
    let config = Config::default();
    let client_kernel = LoopbackKernel::new_bus();
    let server_kernel = LoopbackKernel::new_peer(&client_kernel);
    let phone = client_kernel.connect(&server_kernel);

    // Answers the opening call, then serves further calls until it sees a
    // `Hangup`, which it exits on without answering. Whatever is still
    // queued behind that `Hangup` (the in-flight ping, below) is drained
    // with `EHANGUP` by `connection_fiber`'s teardown.
    let handler: Handler = Arc::new(|ctx: ConnectionCtx, callid, call| {
        ctx.answer(callid, 0, call.args[0], 0);
        loop {
            let (callid, call) = ctx.get_call();
            match call.method {
                Method::Hangup => break,
                _ => ctx.answer(callid, 0, call.args[0], 0),
            }
        }
    });

    let server = Manager::with_handler(server_kernel, &config, handler);
    let client = Manager::new(client_kernel, &config);
    let _server_thread = run_in_background(Arc::clone(&server));
    let _client_thread = run_in_background(Arc::clone(&client));

    let (connect_retval, _) = connect(&client, phone);
    assert_eq!(connect_retval, 0);

    let (tx, rx) = mpsc::channel();
    let client_for_fiber = Arc::clone(&client);
    client.scheduler().spawn(
        move |_: ()| {
            // Both sends happen back-to-back on this one fiber, so the
            // hangup event reaches the server's inbox strictly before the
            // ping event regardless of thread scheduling.
            client_for_fiber.send(phone, Method::Hangup, [0; 5]);
            let ping_id = client_for_fiber.send(phone, Method::User(7), [0x99, 0, 0, 0, 0]);
            let result = client_for_fiber.wait_for(ping_id).unwrap();
            let _ = tx.send(result);
        },
        (),
    );
    let (ping_retval, _answer) = rx.recv_timeout(Duration::from_secs(2)).expect("ping fiber never replied");
    assert_eq!(ping_retval, Errno::Ehangup.code());

    // A fresh `connect_me_to` on a newly minted phone succeeds, unaffected
    // by the torn-down connection above.
    let phone2 = client_kernel.connect(&server_kernel);
    let (second_retval, _) = connect(&client, phone2);
    assert_eq!(second_retval, 0);
}

/// Scenario 4: `wait_timeout` on a peer that never answers returns
/// `ETIMEOUT` within roughly the requested window.
#[test]
fn wait_timeout_on_unresponsive_peer() {
    let config = Config::default();
    let client_kernel = LoopbackKernel::new_bus();
    // No peer ever connected to this phone number: every call hangs up
    // immediately... to exercise a genuine timeout instead, route the call
    // to a server whose handler never answers.
    let server_kernel = LoopbackKernel::new_peer(&client_kernel);
    let phone = client_kernel.connect(&server_kernel);

    let handler: Handler = Arc::new(|ctx: ConnectionCtx, callid, call| {
        ctx.answer(callid, 0, call.args[0], 0);
        // Block forever waiting for a second call that never comes,
        // simulating a peer that accepted the connection but never
        // replies to a subsequent request.
        let _ = ctx.get_call();
    });

    let server = Manager::with_handler(server_kernel, &config, handler);
    let client = Manager::new(client_kernel, &config);
    let _server_thread = run_in_background(Arc::clone(&server));
    let _client_thread = run_in_background(Arc::clone(&client));

    let (connect_retval, _) = connect(&client, phone);
    assert_eq!(connect_retval, 0);

    let (tx, rx) = mpsc::channel();
    let client_for_fiber = Arc::clone(&client);
    let start = std::time::Instant::now();
    client.scheduler().spawn(
        move |_: ()| {
            let id = client_for_fiber.send(phone, Method::User(2), [0, 0, 0, 0, 0]);
            let result = client_for_fiber.wait_timeout(id, 1_000_000);
            let _ = tx.send(result);
        },
        (),
    );
    let result = rx.recv_timeout(Duration::from_secs(3)).expect("client fiber never replied");
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_micros(1_000_000));
    assert!(elapsed <= Duration::from_micros(1_100_000) + Duration::from_millis(50));
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> Addr {
    Addr::Ip(std::net::IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

/// Scenario 5: association lookup matches the more specific (concrete
/// local address) binding when registered first, and falls back to the
/// wildcard-bound association for any other local address. A binding with
/// no local port at all is never considered.
#[test]
fn association_match_prefers_exact_over_wildcard() {
    let table = AssocTable::new();

    let specific = UdpAssoc::new(
        EndpointPair {
            local: Endpoint {
                addr: v4(10, 0, 0, 1),
                port: Port::Num(53),
                version: Version::V4,
            },
            remote: Endpoint::any(Version::V4),
            local_link: 0,
        },
        "specific",
    );
    let wildcard = UdpAssoc::new(
        EndpointPair {
            local: Endpoint {
                addr: Addr::Any,
                port: Port::Num(53),
                version: Version::V4,
            },
            remote: Endpoint::any(Version::V4),
            local_link: 0,
        },
        "wildcard",
    );
    let unbound = UdpAssoc::new(
        EndpointPair {
            local: Endpoint::any(Version::V4),
            remote: Endpoint::any(Version::V4),
            local_link: 0,
        },
        "unbound",
    );
    table.add(&specific);
    table.add(&wildcard);
    table.add(&unbound);

    let to_specific = EndpointPair {
        local: Endpoint {
            addr: v4(10, 0, 0, 1),
            port: Port::Num(53),
            version: Version::V4,
        },
        remote: Endpoint {
            addr: v4(8, 8, 8, 8),
            port: Port::Num(9000),
            version: Version::V4,
        },
        local_link: 0,
    };
    table.received(&to_specific, b"a".to_vec());
    let (msg, _) = specific.recv().unwrap();
    assert_eq!(msg, b"a");

    let to_other = EndpointPair {
        local: Endpoint {
            addr: v4(10, 0, 0, 2),
            port: Port::Num(53),
            version: Version::V4,
        },
        remote: Endpoint {
            addr: v4(8, 8, 8, 8),
            port: Port::Num(9000),
            version: Version::V4,
        },
        local_link: 0,
    };
    table.received(&to_other, b"b".to_vec());
    let (msg, _) = wildcard.recv().unwrap();
    assert_eq!(msg, b"b");

    let _ = unbound; // never matched, nothing to assert beyond "no panic"
}

/// Scenario 6: resetting an association wakes a fiber blocked in `recv`
/// with `ENXIO`.
#[test]
fn reset_wakes_waiter_across_threads() {
    let assoc = UdpAssoc::new(
        EndpointPair {
            local: Endpoint {
                addr: v4(127, 0, 0, 1),
                port: Port::Num(9999),
                version: Version::V4,
            },
            remote: Endpoint::any(Version::V4),
            local_link: 0,
        },
        "reset-target",
    );

    let scheduler = asyncipc::fiber::Scheduler::new();
    let (tx, rx) = mpsc::channel();
    let assoc_for_fiber = Arc::clone(&assoc);
    scheduler.spawn(
        move |_: ()| {
            let _ = tx.send(assoc_for_fiber.recv());
        },
        (),
    );
    assert!(scheduler.yield_to_next(true));
    assert!(rx.try_recv().is_err());

    assoc.reset();
    assert!(scheduler.yield_to_next(true));

    let result = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never replied");
    assert_eq!(result.unwrap_err().as_errno(), Errno::Enxio);
}
