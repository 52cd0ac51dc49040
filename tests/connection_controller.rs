//! Connection Controller Tests
//!
//! Runs the controller against a fake host on a loopback socket: hosts
//! file resolution, negotiation into 3270 mode, the first host write
//! unlocking the keyboard, the login string, and the disconnect policy.

use std::cell::RefCell;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use tn3270r::config::EmulatorOptions;
use tn3270r::controller::{Controller, StateTopic, RECONNECT_MS};
use tn3270r::keyboard::Action;
use tn3270r::telnet_negotiation::{ConnectionState, DO, EOR, IAC, OPT_BINARY, OPT_EOR, OPT_TTYPE, WILL};

const TN3270_OPENING: [u8; 15] = [
    IAC, DO, OPT_TTYPE, IAC, DO, OPT_BINARY, IAC, WILL, OPT_BINARY, IAC, DO, OPT_EOR, IAC, WILL, OPT_EOR,
];

/// Erase/Write with WCC restore and no data
const ERASE_WRITE_RESTORE: [u8; 4] = [0xF5, 0x02, IAC, EOR];

type Events = Rc<RefCell<Vec<(StateTopic, bool)>>>;

fn options() -> EmulatorOptions {
    EmulatorOptions {
        connect_timeout: Duration::from_secs(5),
        ..EmulatorOptions::default()
    }
}

fn record_events(ctlr: &mut Controller) -> Events {
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    for topic in [
        StateTopic::Connect,
        StateTopic::Mode3270,
        StateTopic::Resolving,
        StateTopic::HalfConnect,
        StateTopic::Exiting,
    ] {
        let events = events.clone();
        ctlr.register(topic, Box::new(move |v| events.borrow_mut().push((topic, v))));
    }
    events
}

fn events_for(events: &Events, topic: StateTopic) -> Vec<bool> {
    events.borrow().iter().filter(|(t, _)| *t == topic).map(|(_, v)| *v).collect()
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn accept(listener: &TcpListener) -> TcpStream {
    let (server, _) = listener.accept().unwrap();
    server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    server
}

/// Read until the peer has sent a whole record
fn read_record(server: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    while !out.ends_with(&[IAC, EOR]) {
        let n = server.read(&mut buf).unwrap();
        assert!(n > 0, "host side closed before a record arrived");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Test a full session: hosts file entry, negotiation, unlock and login
#[test]
fn test_hosts_file_session_with_login() {
    let dir = TempDir::new().unwrap();
    let (listener, port) = listener();
    let hosts_path = dir.path().join("ibm_hosts");
    fs::write(
        &hosts_path,
        format!("# test hosts\nmvs primary N:127.0.0.1/{port} String(\"abc\\n\")\n"),
    )
    .unwrap();
    let recent_path = dir.path().join("recent");

    let mut ctlr = Controller::new(EmulatorOptions {
        hosts_file: Some(hosts_path),
        recent_file: Some(recent_path.clone()),
        ..options()
    });
    let events = record_events(&mut ctlr);

    ctlr.host_connect("mvs").unwrap();
    let mut server = accept(&listener);
    assert_eq!(ctlr.current_host(), Some("127.0.0.1"));
    assert_eq!(ctlr.full_current_host(), Some("mvs"));
    assert_eq!(ctlr.qualified_host(), Some(format!("127.0.0.1:{port}").as_str()));
    assert_eq!(ctlr.current_port(), port);
    assert!(ctlr.login_pending());
    assert_eq!(events_for(&events, StateTopic::Resolving), vec![true, false]);
    assert_eq!(events_for(&events, StateTopic::HalfConnect), vec![true, false]);
    assert_eq!(events_for(&events, StateTopic::Connect), vec![true]);
    assert!(fs::read_to_string(&recent_path).unwrap().contains(" mvs\n"));

    // Negotiate plain TN3270 (the N: prefix refuses TN3270E)
    server.write_all(&TN3270_OPENING).unwrap();
    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    let mut reply = [0u8; 15];
    server.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[..3], &[IAC, WILL, OPT_TTYPE]);
    assert_eq!(ctlr.state(), ConnectionState::Connected3270);
    assert_eq!(events_for(&events, StateTopic::Mode3270), vec![true]);

    // Still waiting for the host to write
    assert!(ctlr.keyboard().lock().awaiting_first);
    assert!(ctlr.login_pending());

    server.write_all(&ERASE_WRITE_RESTORE).unwrap();
    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    assert!(!ctlr.login_pending());

    // The login string typed "abc" and pressed Enter
    let record = read_record(&mut server);
    assert_eq!(record[0], 0x7D);
    assert!(record.windows(3).any(|w| w == [0x81, 0x82, 0x83]), "{record:02x?}");
    assert!(ctlr.keyboard().is_locked());
}

/// Test that typing and Enter after an unlock produce one record
#[test]
fn test_enter_sends_record() {
    let (listener, port) = listener();
    let mut ctlr = Controller::new(options());
    ctlr.host_connect(&format!("N:127.0.0.1:{port}")).unwrap();
    let mut server = accept(&listener);

    server.write_all(&TN3270_OPENING).unwrap();
    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    let mut reply = [0u8; 15];
    server.read_exact(&mut reply).unwrap();

    server.write_all(&ERASE_WRITE_RESTORE).unwrap();
    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    assert!(!ctlr.keyboard().is_locked());

    assert_eq!(ctlr.emulate_input("hi"), 0);
    assert!(ctlr.run_action(Action::Enter));
    let record = read_record(&mut server);
    assert_eq!(record[0], 0x7D);
    assert!(record.windows(2).any(|w| w == [0x88, 0x89]), "{record:02x?}");

    // A key pressed while locked is queued, not sent
    ctlr.run_action(Action::Key('x'));
    assert_eq!(ctlr.keyboard().typeahead_len(), 1);
}

/// Test the host closing the connection with reconnect enabled
#[test]
fn test_host_close_schedules_reconnect() {
    let (listener, port) = listener();
    let mut ctlr = Controller::new(EmulatorOptions {
        reconnect: true,
        ..options()
    });
    let events = record_events(&mut ctlr);
    ctlr.host_connect(&format!("127.0.0.1:{port}")).unwrap();
    let server = accept(&listener);
    drop(server);

    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    assert_eq!(ctlr.state(), ConnectionState::NotConnected);
    assert!(ctlr.keyboard().lock().not_connected);
    assert!(ctlr.reconnect_pending());
    let deadline = ctlr.next_deadline().unwrap();
    assert!(deadline <= Instant::now() + Duration::from_millis(RECONNECT_MS));
    assert_eq!(events_for(&events, StateTopic::Connect), vec![true, false]);
    assert!(!ctlr.is_exiting());

    ctlr.host_cancel_reconnect();
    assert!(!ctlr.reconnect_pending());
}

/// Test that a session run with `once` exits when the host goes away
#[test]
fn test_once_exits_on_disconnect() {
    let (listener, port) = listener();
    let mut ctlr = Controller::new(EmulatorOptions {
        once: true,
        reconnect: true,
        ..options()
    });
    let events = record_events(&mut ctlr);
    ctlr.host_connect(&format!("127.0.0.1:{port}")).unwrap();
    drop(accept(&listener));

    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    assert!(ctlr.is_exiting());
    assert!(!ctlr.reconnect_pending());
    assert_eq!(events_for(&events, StateTopic::Exiting), vec![true]);
}

/// Test the A: prefix: NVT mode from the start, keys go out as text
#[test]
fn test_ansi_prefix_session() {
    let (listener, port) = listener();
    let mut ctlr = Controller::new(options());
    let events = record_events(&mut ctlr);
    ctlr.host_connect(&format!("a:127.0.0.1:{port}")).unwrap();
    let mut server = accept(&listener);

    assert_eq!(ctlr.state(), ConnectionState::ConnectedAnsi);
    assert_eq!(events_for(&events, StateTopic::Mode3270), vec![false]);
    assert!(!ctlr.keyboard().is_locked());

    server.write_all(b"login: ").unwrap();
    ctlr.poll_once(Duration::from_secs(5)).unwrap();
    assert!(ctlr.screen().row_text(0).starts_with("login: "));

    ctlr.emulate_input("x\n");
    let mut typed = [0u8; 2];
    server.read_exact(&mut typed).unwrap();
    assert_eq!(&typed, b"x\r");
}

/// Test that a refused connection leaves the controller idle
#[test]
fn test_refused_connection() {
    let (listener, port) = listener();
    drop(listener);
    let mut ctlr = Controller::new(options());
    let events = record_events(&mut ctlr);
    assert!(ctlr.host_connect(&format!("127.0.0.1:{port}")).is_err());
    assert_eq!(ctlr.state(), ConnectionState::NotConnected);
    assert_eq!(events_for(&events, StateTopic::Connect), vec![false]);
    assert!(!ctlr.reconnect_pending());
}
