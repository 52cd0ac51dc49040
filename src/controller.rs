//! Connection controller
//!
//! Owns the one connection a session has: the transport, the telnet framer,
//! and the [`Emulator`] (screen, data stream processor, keyboard) the framer
//! feeds. Everything runs on the caller's thread; [`Controller::poll_once`]
//! is one turn of the event loop. Interested parties learn about lifecycle
//! changes through [`StateChangeRegistry`] callbacks.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, trace, warn};

use crate::ansi_processor::AnsiProcessor;
use crate::config::EmulatorOptions;
use crate::error::{HostError, NetworkError, TN3270Error, TN3270Result, TelnetError};
use crate::host::{HostSpec, HostsFile, RecentFile};
use crate::keyboard::{Action, Keyboard, Outbound};
use crate::lib3270::display::ScreenBuffer;
use crate::lib3270::protocol::{DataStreamProcessor, PdsResult};
use crate::network::HostConnection;
use crate::telnet_negotiation::{ConnectionState, InputStatus, RecordHandler, TelnetFramer};

/// Delay before reconnecting after a failure
pub const RECONNECT_ERR_MS: u64 = 5000;
/// Delay before reconnecting after a clean disconnect
pub const RECONNECT_MS: u64 = 2000;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// State-change notification topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTopic {
    /// Connected or disconnected
    Connect,
    /// Entered or left 3270 mode
    Mode3270,
    /// Host name resolution in progress
    Resolving,
    /// TCP connection in progress
    HalfConnect,
    /// The session is ending
    Exiting,
}

pub type StateCallback = Box<dyn FnMut(bool)>;

/// Callbacks per topic, run synchronously in registration order
#[derive(Default)]
pub struct StateChangeRegistry {
    subscribers: HashMap<StateTopic, Vec<StateCallback>>,
}

impl StateChangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: StateTopic, callback: StateCallback) {
        self.subscribers.entry(topic).or_default().push(callback);
    }

    pub fn fire(&mut self, topic: StateTopic, value: bool) {
        trace!("st_changed({topic:?}, {value})");
        if let Some(callbacks) = self.subscribers.get_mut(&topic) {
            for callback in callbacks.iter_mut() {
                callback(value);
            }
        }
    }

    pub fn count(&self, topic: StateTopic) -> usize {
        self.subscribers.get(&topic).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for StateChangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self.subscribers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("StateChangeRegistry").field("subscribers", &counts).finish()
    }
}

/// The terminal side of a session: what the framer hands records to
#[derive(Debug)]
pub struct Emulator {
    pub screen: ScreenBuffer,
    pub keyboard: Keyboard,
    processor: DataStreamProcessor,
    ansi: AnsiProcessor,
    /// Mode changes reported by the framer, not yet broadcast
    mode_changes: Vec<ConnectionState>,
}

impl Emulator {
    pub fn new(options: &EmulatorOptions) -> Self {
        let mut screen = ScreenBuffer::new(options.screen_size);
        screen.set_dbcs(options.dbcs);
        Self {
            screen,
            keyboard: Keyboard::new(options.keyboard.clone()),
            processor: DataStreamProcessor::new(),
            ansi: AnsiProcessor::new(),
            mode_changes: Vec::new(),
        }
    }

    /// Hand the side effects of host writes to the keyboard
    fn apply_writes(&mut self) {
        for write in self.processor.take_writes() {
            self.keyboard.host_write(&write);
        }
    }

    /// Run an action against the screen
    pub fn run_action(&mut self, action: Action) -> bool {
        self.keyboard.run_action(&mut self.screen, action)
    }

    /// Run queued typeahead and pending input while the keyboard is free
    pub fn drain(&mut self) {
        self.keyboard.drain(&mut self.screen);
    }

    /// Read Modified AID bookkeeping for an outbound record
    fn note_aid(&mut self, aid: u8) {
        self.processor.set_aid(aid);
    }
}

impl RecordHandler for Emulator {
    fn process_ds(&mut self, record: &[u8]) -> PdsResult {
        let result = self.processor.process_ds(&mut self.screen, record);
        self.apply_writes();
        result
    }

    fn write_sscp_lu(&mut self, record: &[u8]) {
        self.processor.write_sscp_lu(&mut self.screen, record);
        self.apply_writes();
    }

    fn process_nvt(&mut self, data: &[u8]) {
        self.ansi.process_data(data, &mut self.screen);
        self.keyboard.set_app_cursor(self.ansi.app_cursor());
    }

    fn mode_changed(&mut self, state: ConnectionState, bound: bool) {
        self.keyboard.in3270(state, bound);
        self.mode_changes.push(state);
    }
}

/// Resolve a port given by number or by service name
pub fn resolve_port(port: &str) -> Result<u16, NetworkError> {
    if let Ok(n) = port.parse::<u16>() {
        if n != 0 {
            return Ok(n);
        }
    }
    match port.to_ascii_lowercase().as_str() {
        "telnet" | "tn3270" => Ok(23),
        "telnets" => Ok(992),
        _ => Err(NetworkError::InvalidAddress {
            address: format!("unknown port '{port}'"),
        }),
    }
}

/// Connection controller for one session
#[derive(Debug)]
pub struct Controller {
    options: EmulatorOptions,
    emulator: Emulator,
    framer: TelnetFramer,
    connection: Option<HostConnection>,
    registry: StateChangeRegistry,
    hosts: HostsFile,
    recent: RecentFile,
    /// Host name with qualifiers, LU and port stripped
    current_host: Option<String>,
    /// What the user asked for, used to reconnect
    full_current_host: Option<String>,
    /// `[L:]host:port`
    qualified_host: Option<String>,
    current_port: u16,
    /// Login string waiting for the keyboard to unlock
    login: Option<String>,
    reconnect_at: Option<Instant>,
    exiting: bool,
}

impl Controller {
    pub fn new(options: EmulatorOptions) -> Self {
        let hosts = match options.hosts_file.as_deref() {
            Some(path) => Self::load_hosts(path),
            None => HostsFile::new(),
        };
        let mut recent = RecentFile::new(options.recent_file.clone());
        if let Err(e) = recent.load() {
            warn!("{e}");
        }
        let framer = TelnetFramer::new(options.negotiator_config(None, false, false));
        Self {
            emulator: Emulator::new(&options),
            framer,
            connection: None,
            registry: StateChangeRegistry::new(),
            hosts,
            recent,
            current_host: None,
            full_current_host: None,
            qualified_host: None,
            current_port: options.port,
            login: None,
            reconnect_at: None,
            exiting: false,
            options,
        }
    }

    fn load_hosts(path: &Path) -> HostsFile {
        HostsFile::load(path).unwrap_or_else(|e| {
            warn!("{e}");
            HostsFile::new()
        })
    }

    pub fn register(&mut self, topic: StateTopic, callback: StateCallback) {
        self.registry.register(topic, callback);
    }

    pub fn options(&self) -> &EmulatorOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.framer.state()
    }

    pub fn framer(&self) -> &TelnetFramer {
        &self.framer
    }

    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }

    pub fn screen(&self) -> &ScreenBuffer {
        &self.emulator.screen
    }

    pub fn keyboard(&self) -> &Keyboard {
        &self.emulator.keyboard
    }

    pub fn hosts(&self) -> &HostsFile {
        &self.hosts
    }

    pub fn recent(&self) -> &RecentFile {
        &self.recent
    }

    pub fn current_host(&self) -> Option<&str> {
        self.current_host.as_deref()
    }

    pub fn full_current_host(&self) -> Option<&str> {
        self.full_current_host.as_deref()
    }

    pub fn qualified_host(&self) -> Option<&str> {
        self.qualified_host.as_deref()
    }

    pub fn current_port(&self) -> u16 {
        self.current_port
    }

    pub fn is_secure(&self) -> bool {
        self.connection.as_ref().map_or(false, HostConnection::is_secure)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn login_pending(&self) -> bool {
        self.login.is_some()
    }

    fn set_cstate(&mut self, state: ConnectionState) {
        self.framer.set_state(state);
        let bound = self.framer.bound();
        self.emulator.keyboard.set_state(state, bound);
    }

    fn exit(&mut self) {
        if !self.exiting {
            info!("Exiting");
            self.exiting = true;
            self.registry.fire(StateTopic::Exiting, true);
        }
    }

    fn schedule_reconnect(&mut self, delay_ms: u64) {
        debug!("Reconnecting in {delay_ms}ms");
        self.reconnect_at = Some(Instant::now() + Duration::from_millis(delay_ms));
    }

    /// Connect to a host.
    ///
    /// `spec` follows the host name grammar (`[prefix:]*[lu@]host[:port]`)
    /// or names a hosts file entry.
    pub fn host_connect(&mut self, spec: &str) -> TN3270Result<()> {
        if self.state().is_pconnected() {
            return Err(HostError::AlreadyConnected.into());
        }
        let raw = spec.trim();
        if raw.is_empty() {
            return Err(HostError::EmptyHostname.into());
        }

        if let Err(e) = self.recent.save_recent(Some(raw), Utc::now()) {
            warn!("{e}");
        }

        let mut parsed = HostSpec::parse(raw)?;
        let mut login = None;
        // A bare name may be a hosts file entry, which then supplies
        // everything but the name
        if parsed.host == raw {
            if let Some(entry) = self.hosts.lookup(raw) {
                debug!("Host '{raw}' found in hosts file: {}", entry.hostname);
                login = entry.login_string.clone();
                parsed = HostSpec::parse(&entry.hostname)?;
            }
        }
        if login.is_none() {
            login = self.options.login_macro.clone();
        }
        if parsed.qualifiers.no_login {
            login = None;
        }
        if parsed.qualifiers.passthru {
            debug!("Passthru qualifier ignored");
        }

        let port = match parsed.port.as_deref() {
            Some(p) => resolve_port(p)?,
            None => self.options.port,
        };

        self.current_host = Some(parsed.host.clone());
        self.full_current_host = Some(raw.to_string());
        self.qualified_host = Some(parsed.qualified_host(&port.to_string()));
        self.current_port = port;
        self.reconnect_at = None;

        let config = self.options.negotiator_config(
            parsed.lu.clone(),
            parsed.qualifiers.std_ds,
            parsed.qualifiers.non_tn3270e,
        );
        self.framer.reset(config);

        info!("Connecting to {}, port {port}", parsed.host);
        self.set_cstate(ConnectionState::Resolving);
        self.registry.fire(StateTopic::Resolving, true);
        self.set_cstate(ConnectionState::Pending);
        self.registry.fire(StateTopic::HalfConnect, true);

        let result = HostConnection::connect(
            &parsed.host,
            port,
            self.options.connect_timeout,
            parsed.qualifiers.secure,
            self.options.tls.clone(),
        );

        self.registry.fire(StateTopic::Resolving, false);
        self.registry.fire(StateTopic::HalfConnect, false);

        let connection = match result {
            Ok(c) => c,
            Err(e) => {
                error!("{e}");
                self.set_cstate(ConnectionState::NotConnected);
                if self.options.once {
                    self.exit();
                } else if self.options.reconnect {
                    self.schedule_reconnect(RECONNECT_ERR_MS);
                }
                self.registry.fire(StateTopic::Connect, false);
                return Err(e.into());
            }
        };
        self.connection = Some(connection);
        self.login = login;

        self.set_cstate(ConnectionState::ConnectedInitial);
        self.emulator.keyboard.connect(true);
        self.registry.fire(StateTopic::Connect, true);

        if parsed.qualifiers.ansi {
            // The host speaks NVT from the start
            self.set_cstate(ConnectionState::ConnectedAnsi);
            self.emulator.mode_changed(ConnectionState::ConnectedAnsi, false);
            self.broadcast_mode_changes();
        }
        Ok(())
    }

    /// Connect again to the last host
    pub fn host_reconnect(&mut self) -> TN3270Result<()> {
        self.reconnect_at = None;
        match self.full_current_host.clone() {
            Some(host) => self.host_connect(&host),
            None => Err(HostError::EmptyHostname.into()),
        }
    }

    pub fn host_cancel_reconnect(&mut self) {
        if self.reconnect_at.take().is_some() {
            debug!("Reconnect cancelled");
        }
    }

    /// Tear down the connection; `failed` picks the longer reconnect delay
    pub fn host_disconnect(&mut self, failed: bool) {
        if !self.state().is_pconnected() {
            return;
        }
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect();
        }
        info!("Disconnected from {}", self.current_host.as_deref().unwrap_or("host"));
        self.login = None;
        self.set_cstate(ConnectionState::NotConnected);
        self.emulator.keyboard.connect(false);

        if self.options.once {
            self.exit();
            return;
        }
        if self.options.reconnect && self.reconnect_at.is_none() {
            self.schedule_reconnect(if failed { RECONNECT_ERR_MS } else { RECONNECT_MS });
        }
        self.registry.fire(StateTopic::Connect, false);
    }

    /// Broadcast 3270-mode changes the framer reported
    fn broadcast_mode_changes(&mut self) {
        for state in std::mem::take(&mut self.emulator.mode_changes) {
            info!("Now operating in {} mode.", state.name());
            self.host_in3270(state);
        }
    }

    /// Tell listeners whether `state` is a 3270 mode
    pub fn host_in3270(&mut self, state: ConnectionState) {
        let in3270 = matches!(
            state,
            ConnectionState::Connected3270 | ConnectionState::ConnectedSscp | ConnectionState::ConnectedTn3270e
        );
        self.registry.fire(StateTopic::Mode3270, in3270);
    }

    /// Run a keyboard action and send whatever it produced
    pub fn run_action(&mut self, action: Action) -> bool {
        let ok = self.emulator.run_action(action);
        self.after_input();
        ok
    }

    /// Type characters as if they came from the keyboard
    pub fn emulate_input(&mut self, text: &str) -> usize {
        let chars: Vec<char> = text.chars().collect();
        let left = self.emulator.keyboard.emulate_input(&mut self.emulator.screen, &chars);
        self.after_input();
        left
    }

    fn after_input(&mut self) {
        if let Err(e) = self.route_outbound() {
            self.protocol_error(e);
        }
        self.flush_output();
    }

    /// Move keyboard output into the framer
    fn route_outbound(&mut self) -> Result<(), TelnetError> {
        for out in self.emulator.keyboard.take_outbound() {
            if !self.state().is_connected() {
                debug!("Dropping output, not connected");
                continue;
            }
            match out {
                Outbound::Record { aid, data } => {
                    self.emulator.note_aid(aid);
                    self.framer.send_record(&data);
                }
                Outbound::Nvt(bytes) => self.framer.send_nvt(&bytes),
                Outbound::Break => self.framer.send_break(),
                Outbound::Interrupt => self.framer.send_interrupt(),
                Outbound::Abort => {
                    self.framer.send_abort(&mut self.emulator)?;
                    self.broadcast_mode_changes();
                }
            }
        }
        Ok(())
    }

    /// Write queued framer output to the transport
    fn flush_output(&mut self) {
        if !self.framer.has_output() {
            return;
        }
        let out = self.framer.take_output();
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = connection.send(&out) {
            error!("{e}");
            self.host_disconnect(true);
        }
    }

    fn protocol_error(&mut self, e: TelnetError) {
        error!("{e}");
        if e.is_fatal() {
            self.host_disconnect(true);
            self.exit();
        } else {
            self.host_disconnect(true);
        }
    }

    /// Feed bytes as if they had arrived from the host
    pub fn process_host_data(&mut self, data: &[u8]) -> TN3270Result<()> {
        let status = self.framer.process_incoming(data, &mut self.emulator);
        self.broadcast_mode_changes();
        match status {
            Ok(InputStatus::Consumed) => {}
            Ok(InputStatus::StartTls { consumed }) => {
                self.flush_output();
                if consumed < data.len() {
                    warn!("Discarding {} bytes received ahead of the TLS handshake", data.len() - consumed);
                }
                let result = match self.connection.as_mut() {
                    Some(connection) => connection.start_tls(),
                    None => Err(NetworkError::ConnectionLost {
                        reason: "not connected".to_string(),
                    }),
                };
                if let Err(e) = result {
                    error!("{e}");
                    self.host_disconnect(true);
                    return Err(e.into());
                }
            }
            Err(e) => {
                self.protocol_error(e.clone());
                return Err(TN3270Error::Telnet(e));
            }
        }
        self.after_host_input();
        Ok(())
    }

    fn after_host_input(&mut self) {
        self.emulator.drain();
        self.send_login();
        if let Err(e) = self.route_outbound() {
            self.protocol_error(e);
        }
        self.flush_output();
    }

    /// Type the login string once the keyboard first unlocks
    fn send_login(&mut self) {
        let state = self.state();
        if self.login.is_none() || self.emulator.keyboard.is_locked() {
            return;
        }
        if !(state.in_3270() || state.in_ansi()) {
            return;
        }
        let Some(login) = self.login.take() else {
            return;
        };
        debug!("Sending login string");
        let action = Action::from_str(&login).unwrap_or(Action::String(login));
        self.emulator.run_action(action);
    }

    /// When the next timer is due
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.emulator.keyboard.next_deadline(), self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire timers that are due
    pub fn run_timers(&mut self, now: Instant) {
        let was_locked = self.emulator.keyboard.is_locked();
        self.emulator.keyboard.poll_timers(now);
        if was_locked && !self.emulator.keyboard.is_locked() {
            self.after_host_input();
        }
        if self.reconnect_at.map_or(false, |at| now >= at) {
            self.reconnect_at = None;
            if let Err(e) = self.host_reconnect() {
                warn!("Reconnect failed: {e}");
            }
        }
    }

    /// One turn of the event loop: wait up to `timeout` for host data,
    /// process it and run due timers
    pub fn poll_once(&mut self, timeout: Duration) -> TN3270Result<()> {
        let now = Instant::now();
        let wait = match self.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(now)),
            None => timeout,
        };

        let mut result = Ok(());
        if let Some(connection) = self.connection.as_mut() {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            match connection.read_timeout(&mut buf, wait) {
                Ok(None) => {}
                Ok(Some(0)) => {
                    info!("Host closed the connection");
                    self.host_disconnect(false);
                }
                Ok(Some(n)) => result = self.process_host_data(&buf[..n]),
                Err(e) => {
                    error!("{e}");
                    self.host_disconnect(true);
                    result = Err(e.into());
                }
            }
        } else if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        self.run_timers(Instant::now());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet_negotiation::{DO, IAC, OPT_BINARY, OPT_EOR, OPT_TTYPE, WILL};
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::rc::Rc;

    fn quiet_options() -> EmulatorOptions {
        EmulatorOptions {
            connect_timeout: Duration::from_secs(5),
            ..EmulatorOptions::default()
        }
    }

    #[test]
    fn test_registry_fires_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut registry = StateChangeRegistry::new();
        for id in 0..3 {
            let seen = seen.clone();
            registry.register(StateTopic::Connect, Box::new(move |v| seen.borrow_mut().push((id, v))));
        }
        registry.fire(StateTopic::Connect, true);
        registry.fire(StateTopic::Exiting, true);
        assert_eq!(*seen.borrow(), vec![(0, true), (1, true), (2, true)]);
        assert_eq!(registry.count(StateTopic::Connect), 3);
        assert_eq!(registry.count(StateTopic::Mode3270), 0);
    }

    #[test]
    fn test_each_mode_change_reported_once() {
        let options = quiet_options();
        let mut emu = Emulator::new(&options);
        let mut framer = TelnetFramer::new(options.negotiator_config(None, false, true));
        framer.set_state(ConnectionState::ConnectedInitial);
        framer
            .process_incoming(
                &[IAC, DO, OPT_TTYPE, IAC, DO, OPT_BINARY, IAC, WILL, OPT_BINARY, IAC, DO, OPT_EOR, IAC, WILL, OPT_EOR],
                &mut emu,
            )
            .unwrap();
        assert_eq!(emu.mode_changes, vec![ConnectionState::Connected3270]);

        // Plain text before any negotiation switches straight to NVT
        let mut emu = Emulator::new(&options);
        let mut framer = TelnetFramer::new(options.negotiator_config(None, false, true));
        framer.set_state(ConnectionState::ConnectedInitial);
        framer.process_incoming(b"login: ", &mut emu).unwrap();
        assert_eq!(emu.mode_changes, vec![ConnectionState::ConnectedAnsi]);
    }

    #[test]
    fn test_resolve_port() {
        assert_eq!(resolve_port("992").unwrap(), 992);
        assert_eq!(resolve_port("telnet").unwrap(), 23);
        assert!(resolve_port("0").is_err());
        assert!(resolve_port("nosuchservice").is_err());
    }

    #[test]
    fn test_connect_rejects_empty_and_bad_names() {
        let mut ctlr = Controller::new(quiet_options());
        assert!(matches!(
            ctlr.host_connect("   "),
            Err(TN3270Error::Host(HostError::EmptyHostname))
        ));
        assert!(matches!(ctlr.host_connect("a:b@"), Err(TN3270Error::Host(HostError::Syntax(_)))));
        assert_eq!(ctlr.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn test_connect_and_first_negotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut ctlr = Controller::new(quiet_options());
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        ctlr.register(StateTopic::Connect, Box::new(move |v| e.borrow_mut().push(v)));

        ctlr.host_connect(&format!("127.0.0.1:{port}")).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        assert_eq!(ctlr.state(), ConnectionState::ConnectedInitial);
        assert_eq!(ctlr.qualified_host(), Some(format!("127.0.0.1:{port}").as_str()));
        assert!(ctlr.keyboard().lock().awaiting_first);
        assert_eq!(*events.borrow(), vec![true]);

        // Already connected
        assert!(matches!(
            ctlr.host_connect("127.0.0.1"),
            Err(TN3270Error::Host(HostError::AlreadyConnected))
        ));

        server.write_all(&[IAC, DO, OPT_TTYPE]).unwrap();
        ctlr.poll_once(Duration::from_secs(5)).unwrap();
        let mut reply = [0u8; 3];
        server.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [IAC, crate::telnet_negotiation::WILL, OPT_TTYPE]);

        ctlr.host_disconnect(false);
        assert_eq!(ctlr.state(), ConnectionState::NotConnected);
        assert!(ctlr.keyboard().lock().not_connected);
        assert_eq!(*events.borrow(), vec![true, false]);
        assert!(!ctlr.reconnect_pending());
    }

    #[test]
    fn test_failed_connect_schedules_reconnect() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut ctlr = Controller::new(EmulatorOptions {
            reconnect: true,
            ..quiet_options()
        });
        assert!(ctlr.host_connect(&format!("127.0.0.1:{port}")).is_err());
        assert!(ctlr.reconnect_pending());
        ctlr.host_cancel_reconnect();
        assert!(!ctlr.reconnect_pending());
    }

    #[test]
    fn test_failed_connect_once_exits() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut ctlr = Controller::new(EmulatorOptions {
            once: true,
            ..quiet_options()
        });
        let exiting = Rc::new(RefCell::new(false));
        let x = exiting.clone();
        ctlr.register(StateTopic::Exiting, Box::new(move |v| *x.borrow_mut() = v));
        assert!(ctlr.host_connect(&format!("127.0.0.1:{port}")).is_err());
        assert!(ctlr.is_exiting());
        assert!(*exiting.borrow());
    }
}
