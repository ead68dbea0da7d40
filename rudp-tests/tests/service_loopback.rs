//! Two services exchanging signals over the loopback interface

use rudp::{SendOptions, Service, ServiceConfig};
use rudp_tests::{init_logging, pattern, signal_registry, EventLog, Side, TestSignal};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

fn loopback_config() -> ServiceConfig {
    ServiceConfig {
        base_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        sessions_per_talker: 2,
        max_talkers: 2,
        ..ServiceConfig::default()
    }
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut done: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn start_pair(log: &EventLog) -> (Service, Service) {
    let a = Service::start(loopback_config(), signal_registry(Side::A, log)).unwrap();
    let b = Service::start(loopback_config(), signal_registry(Side::B, log)).unwrap();
    (a, b)
}

#[test]
fn test_signals_cross_loopback() {
    init_logging();
    let log = EventLog::default();
    let (a, b) = start_pair(&log);

    for id in 0..3 {
        let signal = TestSignal::patterned(id, 6000).recorded_by(Side::A, &log);
        a.send_signal(b.base_addr(), Box::new(signal), SendOptions::default())
            .unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        log.received(Side::B).len() == 3 && log.succeeded(Side::A).len() == 3
    }));
    assert_eq!(log.received(Side::B), vec![0, 1, 2]);
    assert_eq!(log.received_body(Side::B, 2), Some(pattern(2, 6000)));
    assert_eq!(a.session_count(), 1);
    assert_eq!(b.session_count(), 1);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_reply_over_accepted_connection() {
    init_logging();
    let log = EventLog::default();
    let (a, b) = start_pair(&log);

    let hello = TestSignal::new(1, "hello").recorded_by(Side::A, &log);
    a.send_signal(b.base_addr(), Box::new(hello), SendOptions::default())
        .unwrap();
    assert!(wait_for(Duration::from_secs(10), || log.received(Side::B) == vec![1]));

    // B keys the session by the base address A advertised in its handshake
    let connection = b
        .connection_for(a.base_addr())
        .expect("accepted session registered");
    let reply = TestSignal::new(2, "world").recorded_by(Side::B, &log);
    b.send_to(connection, Box::new(reply)).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        log.received(Side::A) == vec![2] && log.succeeded(Side::B) == vec![2]
    }));
    assert!(log.failed(Side::A).is_empty());
    assert!(log.failed(Side::B).is_empty());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_disconnect_releases_session() {
    init_logging();
    let log = EventLog::default();
    let (a, b) = start_pair(&log);

    let signal = TestSignal::new(1, "once").recorded_by(Side::A, &log);
    a.send_signal(b.base_addr(), Box::new(signal), SendOptions::default())
        .unwrap();
    assert!(wait_for(Duration::from_secs(10), || log.succeeded(Side::A) == vec![1]));

    let connection = a.connection_for(b.base_addr()).expect("connected session");
    a.disconnect(connection).unwrap();
    assert!(wait_for(Duration::from_secs(5), || a.session_count() == 0));
    assert!(a.connection_for(b.base_addr()).is_none());

    a.shutdown();
    b.shutdown();
}
