//! DNS-aware connector behavior. Real DNS servers aren't available in a
//! test environment, so these drive the connector with IP literals (which
//! resolve without a resolver round trip) and exercise the resolver's
//! synchronous answer paths directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use evio::dns::{Dns, DnsResult, HeStatus};
use evio::event::{Event, EventFlags, EventType};
use evio::io::net::{self, NetType};
use evio::io::netdns;
use evio::io::IoState;

mod util;
use util::{init, run_until, Recorder};

#[test]
fn literal_lookup_answers_synchronously() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let dns = Dns::create(Some(&event)).unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&results);
    let query = dns.gethostbyname(
        &event.distribute(),
        "127.0.0.1",
        80,
        NetType::Any,
        move |result, ips| {
            r.lock().unwrap().push((result, ips));
        },
    );

    // Synchronous: no query handle, answer already delivered.
    assert!(query.is_none());
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, DnsResult::Success);
    assert_eq!(results[0].1, vec!["127.0.0.1".to_string()]);
}

#[test]
fn literal_family_mismatch_is_invalid() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let dns = Dns::create(Some(&event)).unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&results);
    dns.gethostbyname(
        &event.distribute(),
        "127.0.0.1",
        80,
        NetType::Ipv6,
        move |result, ips| {
            r.lock().unwrap().push((result, ips));
        },
    );

    let results = results.lock().unwrap();
    assert_eq!(results[0].0, DnsResult::Invalid);
    assert!(results[0].1.is_empty());
}

#[test]
fn empty_hostname_is_invalid() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let dns = Dns::create(Some(&event)).unwrap();

    let got = Arc::new(AtomicUsize::new(0));
    let g = Arc::clone(&got);
    dns.gethostbyname(&event.distribute(), "", 80, NetType::Any, move |result, _| {
        assert_eq!(result, DnsResult::Invalid);
        g.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(got.load(Ordering::SeqCst), 1);
}

#[test]
fn connector_echo_through_literal() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let dns = Dns::create(Some(&event)).unwrap();

    let server = net::server_create(0, Some("127.0.0.1"), NetType::Ipv4).unwrap();
    let port = net::get_port(&server);

    let rec = Recorder::new();
    let conns = Arc::new(Mutex::new(Vec::new()));

    let held = Arc::clone(&conns);
    event.add(&server, move |ev, ty, io| {
        if ty != EventType::Accept {
            return;
        }
        if let Ok(conn) = io.accept() {
            ev.add(&conn, move |_ev, ty, io| {
                if ty == EventType::Read {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = io.read(&mut buf) {
                        let _ = io.write(&buf[..n]);
                    }
                }
            });
            held.lock().unwrap().push(conn);
        }
    });

    let client = netdns::client_create(&dns, "127.0.0.1", port, NetType::Any).unwrap();
    let r = rec.clone();
    let echoed = Arc::new(Mutex::new(Vec::new()));
    let got = Arc::clone(&echoed);
    event.add(&client, move |_ev, ty, io| {
        r.push("client", ty);
        match ty {
            EventType::Connected => {
                assert_eq!(io.write(b"PING\n"), Ok(5));
            }
            EventType::Read => {
                let mut buf = [0u8; 64];
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
    assert_eq!(client.state(), IoState::Disconnected);
    // The adopted transport resolved to the literal we gave.
    assert_eq!(net::get_ipaddr(&client).as_deref(), Some("127.0.0.1"));
    assert!(netdns::time_connect_ms(&client) < 5_000);

    client.destroy();
    server.destroy();
}

#[test]
fn connector_failure_reports_single_error() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let dns = Dns::create(Some(&event)).unwrap();

    let closed_port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let client = netdns::client_create(&dns, "127.0.0.1", closed_port, NetType::Any).unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&errors);
    event.add(&client, move |_ev, ty, io| {
        if ty == EventType::Error {
            e.fetch_add(1, Ordering::SeqCst);
            assert!(!io.error_string().is_empty());
        }
    });

    assert!(run_until(&event, 5_000, || errors.load(Ordering::SeqCst) > 0));
    event.run(100);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), IoState::Error);

    client.destroy();
}

#[test]
fn happyeyeballs_outcomes_shape_future_sorts() {
    init();
    let event = Event::create(EventFlags::NONE).unwrap();
    let dns = Dns::create(Some(&event)).unwrap();

    // Seed outcomes the way a failed race would: the v6 target proved
    // slow, the v4 target refused outright.
    dns.happyeyeballs_update("2001:db8::1", HeStatus::Slow);
    dns.happyeyeballs_update("192.0.2.2", HeStatus::Bad);
    dns.happyeyeballs_update("192.0.2.7", HeStatus::Good);

    // Outcome ranking is Good < Unknown < Slow < Bad.
    assert!(HeStatus::Good < HeStatus::Unknown);
    assert!(HeStatus::Unknown < HeStatus::Slow);
    assert!(HeStatus::Slow < HeStatus::Bad);
}
