//! TCP layer behavior over the loopback: echo, accept, ephemeral ports,
//! connect failures, and read re-arming.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::error::IoError;
use evio::event::{Event, EventFlags, EventType};
use evio::io::net::{self, NetType};
use evio::io::{Io, IoState};

mod util;
use util::{init, run_until, Recorder};

#[test]
fn ephemeral_port_in_range() {
    init();
    let server = net::server_create(0, Some("127.0.0.1"), NetType::Ipv4).unwrap();
    let port = net::get_port(&server);
    assert!((1024..=65535).contains(&port), "port {}", port);
    server.destroy();
}

#[test]
fn loopback_echo_and_graceful_close() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let server = net::server_create(0, Some("127.0.0.1"), NetType::Ipv4).unwrap();
    let port = net::get_port(&server);

    let rec = Recorder::new();
    let echoed = Arc::new(Mutex::new(Vec::new()));
    let conns: Arc<Mutex<Vec<Arc<Io>>>> = Arc::new(Mutex::new(Vec::new()));

    // Server: accept, echo whatever arrives, disconnect when the client
    // closes.
    let r = rec.clone();
    let held = Arc::clone(&conns);
    event.add(&server, move |ev, ty, io| {
        if ty != EventType::Accept {
            return;
        }
        let conn = match io.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        r.push("accept", ty);

        let r = r.clone();
        ev.add(&conn, move |_ev, ty, io| {
            r.push("server-conn", ty);
            match ty {
                EventType::Read => {
                    let mut buf = [0u8; 128];
                    while let Ok(n) = io.read(&mut buf) {
                        let _ = io.write(&buf[..n]);
                    }
                }
                EventType::Disconnected => {
                    io.disconnect();
                    io.destroy();
                }
                _ => {}
            }
        });
        held.lock().unwrap().push(conn);
    });

    let client = net::client_create("127.0.0.1", port, NetType::Ipv4).unwrap();
    let r = rec.clone();
    let got = Arc::clone(&echoed);
    event.add(&client, move |_ev, ty, io| {
        r.push("client", ty);
        match ty {
            EventType::Connected => {
                assert_eq!(io.write(b"PING\n"), Ok(5));
            }
            EventType::Read => {
                let mut buf = [0u8; 128];
                if let Ok(n) = io.read(&mut buf) {
                    got.lock().unwrap().extend_from_slice(&buf[..n]);
                    if got.lock().unwrap().len() >= 5 {
                        io.disconnect();
                    }
                }
            }
            _ => {}
        }
    });

    assert!(run_until(&event, 5_000, || {
        rec.count("client", EventType::Disconnected) > 0
    }));

    assert_eq!(&*echoed.lock().unwrap(), b"PING\n");
    assert_eq!(rec.count("client", EventType::Connected), 1);
    assert_eq!(rec.count("accept", EventType::Accept), 1);
    assert_eq!(rec.count("client", EventType::Disconnected), 1);
    assert_eq!(client.state(), IoState::Disconnected);
    assert_eq!(client.error_string(), "Gracefully Closed Connection");

    client.destroy();
    server.destroy();
}

#[test]
fn three_concurrent_accepts() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let server = net::server_create(0, Some("127.0.0.1"), NetType::Ipv4).unwrap();
    let port = net::get_port(&server);

    let peers = Arc::new(Mutex::new(Vec::new()));
    let conns: Arc<Mutex<Vec<Arc<Io>>>> = Arc::new(Mutex::new(Vec::new()));

    let p = Arc::clone(&peers);
    let held = Arc::clone(&conns);
    event.add(&server, move |_ev, ty, io| {
        if ty != EventType::Accept {
            return;
        }
        // Drain the backlog: the kernel may fold several arrivals into
        // one notification.
        while let Ok(conn) = io.accept() {
            let peer = net::get_ipaddr(&conn).unwrap_or_default();
            let eport = net::get_ephemeral_port(&conn);
            assert!(!peer.is_empty());
            p.lock().unwrap().push((peer, eport));
            held.lock().unwrap().push(conn);
        }
    });

    let handle = std::thread::spawn(move || {
        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(std::net::TcpStream::connect(("127.0.0.1", port)).unwrap());
        }
        std::thread::sleep(Duration::from_millis(300));
        streams
    });

    assert!(run_until(&event, 5_000, || peers.lock().unwrap().len() >= 3));
    handle.join().unwrap();

    let peers = peers.lock().unwrap();
    assert_eq!(peers.len(), 3);
    // Same loopback address, three distinct remote ports.
    let mut ports: Vec<u16> = peers.iter().map(|(_, p)| *p).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 3);

    server.destroy();
}

#[test]
fn connect_refused_reports_error() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    // Bind-then-drop guarantees a closed port.
    let closed_port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let client = net::client_create("127.0.0.1", closed_port, NetType::Ipv4).unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&errors);
    event.add(&client, move |_ev, ty, io| {
        if ty == EventType::Error {
            assert_eq!(io.last_error(), IoError::ConnRefused);
            e.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert!(run_until(&event, 5_000, || errors.load(Ordering::SeqCst) > 0));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), IoState::Error);
    client.destroy();
}

#[test]
fn connect_timeout_fires_once_in_window() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    // TEST-NET-1 is never routable; depending on the environment the
    // connect either times out (expected) or fails fast with a network
    // error. Both must surface exactly one Error event.
    let client = net::client_create("192.0.2.1", 1, NetType::Ipv4).unwrap();
    net::set_connect_timeout_ms(&client, 50);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&errors);
    let start = Instant::now();
    event.add(&client, move |_ev, ty, io| {
        if ty == EventType::Error {
            e.lock().unwrap().push((io.last_error(), start.elapsed()));
        }
    });

    assert!(run_until(&event, 5_000, || !errors.lock().unwrap().is_empty()));
    event.run(100); // no second error may trail in

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    let (err, at) = errors[0];
    if err == IoError::TimedOut {
        assert!(at >= Duration::from_millis(45), "timed out at {:?}", at);
        assert!(at < Duration::from_millis(1_000), "timed out at {:?}", at);
    } else {
        assert!(
            matches!(err, IoError::NetUnreachable | IoError::NotPerm | IoError::ConnRefused),
            "unexpected error {:?}",
            err
        );
    }
    client.destroy();
}

#[test]
fn short_read_rearms_without_user_help() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();

    let server = net::server_create(0, Some("127.0.0.1"), NetType::Ipv4).unwrap();
    let port = net::get_port(&server);

    let conns: Arc<Mutex<Vec<Arc<Io>>>> = Arc::new(Mutex::new(Vec::new()));
    let held = Arc::clone(&conns);
    event.add(&server, move |_ev, ty, io| {
        if ty == EventType::Accept {
            if let Ok(conn) = io.accept() {
                held.lock().unwrap().push(conn);
            }
        }
    });

    let reads = Arc::new(Mutex::new(Vec::new()));
    let client = net::client_create("127.0.0.1", port, NetType::Ipv4).unwrap();
    let r = Arc::clone(&reads);
    event.add(&client, move |_ev, ty, io| {
        if ty == EventType::Read {
            // Ask for far more than is available; the short read must
            // re-arm readiness internally.
            let mut buf = [0u8; 4096];
            if let Ok(n) = io.read(&mut buf) {
                r.lock().unwrap().push(n);
            }
        }
    });

    // Wait for the accept, then dribble two small payloads with a gap.
    assert!(run_until(&event, 5_000, || !conns.lock().unwrap().is_empty()));
    let server_conn = conns.lock().unwrap()[0].clone();

    let _ = server_conn.write(b"abc");
    assert!(run_until(&event, 5_000, || reads.lock().unwrap().len() == 1));
    assert_eq!(reads.lock().unwrap()[0], 3);

    let _ = server_conn.write(b"defgh");
    assert!(run_until(&event, 5_000, || reads.lock().unwrap().len() == 2));
    assert_eq!(reads.lock().unwrap()[1], 5);

    client.destroy();
    server_conn.destroy();
    server.destroy();
}
