//! Telnet framing and option negotiation for TN3270 and TN3270E
//!
//! [`TelnetFramer`] is a byte-driven state machine. It consumes whatever the
//! transport delivered, answers option negotiation, runs the TN3270E
//! sub-negotiation, and splits the stream into 3270 records (delimited by
//! `IAC EOR`) or NVT bytes, which it hands to a [`RecordHandler`]. Replies
//! accumulate in an output buffer the owner drains with
//! [`TelnetFramer::take_output`].

use log::{debug, info, trace, warn};

use crate::error::TelnetError;
use crate::lib3270::protocol::PdsResult;
use crate::lib3270::tn3270e::{
    self, reason_name, DataType, Function, FunctionSet, LuCandidates, Submode, Tn3270eHeader, Tn3270eMessage,
    Tn3270eState, EH_SIZE, TN3270E_NEG_COMMAND_REJECT, TN3270E_NEG_INTERVENTION_REQUIRED, TN3270E_NEG_OPERATION_CHECK,
    TN3270E_OP_IS, TN3270E_OP_REQUEST, TN3270E_RSF_ALWAYS_RESPONSE, TN3270E_RSF_NO_RESPONSE,
};

// Telnet commands
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const EL: u8 = 248;
pub const EC: u8 = 247;
pub const AYT: u8 = 246;
pub const AO: u8 = 245;
pub const IP: u8 = 244;
pub const BRK: u8 = 243;
pub const DM: u8 = 242;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;
pub const EOR: u8 = 239;

// Telnet options
pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TM: u8 = 6;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_EOR: u8 = 25;
pub const OPT_TN3270E: u8 = 40;
pub const OPT_STARTTLS: u8 = 46;

pub const TELQUAL_IS: u8 = 0;
pub const TELQUAL_SEND: u8 = 1;
pub const TLS_FOLLOWS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelnetOption {
    Binary = 0,
    Echo = 1,
    SuppressGoAhead = 3,
    TimingMark = 6,
    TerminalType = 24,
    EndOfRecord = 25,
    Tn3270e = 40,
    StartTls = 46,
}

impl TelnetOption {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TelnetOption::Binary),
            1 => Some(TelnetOption::Echo),
            3 => Some(TelnetOption::SuppressGoAhead),
            6 => Some(TelnetOption::TimingMark),
            24 => Some(TelnetOption::TerminalType),
            25 => Some(TelnetOption::EndOfRecord),
            40 => Some(TelnetOption::Tn3270e),
            46 => Some(TelnetOption::StartTls),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TelnetOption::Binary => "BINARY",
            TelnetOption::Echo => "ECHO",
            TelnetOption::SuppressGoAhead => "SUPPRESS GO AHEAD",
            TelnetOption::TimingMark => "TIMING MARK",
            TelnetOption::TerminalType => "TERMINAL TYPE",
            TelnetOption::EndOfRecord => "END OF RECORD",
            TelnetOption::Tn3270e => "TN3270E",
            TelnetOption::StartTls => "START-TLS",
        }
    }
}

/// Trace name of an option byte
pub fn option_name(opt: u8) -> String {
    TelnetOption::from_u8(opt)
        .map(|o| o.name().to_string())
        .unwrap_or_else(|| opt.to_string())
}

/// Trace name of a command byte
pub fn command_name(cmd: u8) -> String {
    let name = match cmd {
        IAC => "IAC",
        DONT => "DONT",
        DO => "DO",
        WONT => "WONT",
        WILL => "WILL",
        SB => "SB",
        GA => "GA",
        EL => "EL",
        EC => "EC",
        AYT => "AYT",
        AO => "AO",
        IP => "IP",
        BRK => "BRK",
        DM => "DMARK",
        NOP => "NOP",
        SE => "SE",
        EOR => "EOR",
        other => return other.to_string(),
    };
    name.to_string()
}

/// Hex dump of a network buffer, 32 bytes per line, each line prefixed
/// with the direction (`<` received, `>` sent) and the offset.
pub fn trace_netdata(direction: char, data: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    for (i, chunk) in data.chunks(32).enumerate() {
        let hex: String = chunk.iter().map(|b| format!("{b:02x}")).collect();
        trace!("{} 0x{:<3x} {}", direction, i * 32, hex);
    }
}

/// Connection state, ordered so that range checks express the predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    /// Resolving the host name
    Resolving,
    /// Connection initiated, not yet established
    Pending,
    /// Connected, no mode negotiated yet
    ConnectedInitial,
    /// Telnet NVT (ANSI) mode
    ConnectedAnsi,
    /// Plain TN3270 mode
    Connected3270,
    /// TN3270E option on, session not yet in a submode
    ConnectedInitialE,
    /// TN3270E NVT submode
    ConnectedNvt,
    /// TN3270E SSCP-LU submode
    ConnectedSscp,
    /// TN3270E 3270 submode
    ConnectedTn3270e,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self >= ConnectionState::ConnectedInitial
    }

    /// Connected or on the way there
    pub fn is_pconnected(self) -> bool {
        self >= ConnectionState::Resolving
    }

    pub fn is_half_connected(self) -> bool {
        matches!(self, ConnectionState::Resolving | ConnectionState::Pending)
    }

    pub fn in_ansi(self) -> bool {
        matches!(self, ConnectionState::ConnectedAnsi | ConnectionState::ConnectedNvt)
    }

    pub fn in_3270(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected3270 | ConnectionState::ConnectedSscp | ConnectionState::ConnectedTn3270e
        )
    }

    pub fn in_sscp(self) -> bool {
        self == ConnectionState::ConnectedSscp
    }

    pub fn in_tn3270e(self) -> bool {
        self == ConnectionState::ConnectedTn3270e
    }

    /// Any TN3270E state
    pub fn in_e(self) -> bool {
        self >= ConnectionState::ConnectedInitialE
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::NotConnected => "unconnected",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Pending => "pending",
            ConnectionState::ConnectedInitial => "connected initial",
            ConnectionState::ConnectedAnsi => "TN3270 NVT",
            ConnectionState::Connected3270 => "TN3270 3270",
            ConnectionState::ConnectedInitialE => "TN3270E",
            ConnectionState::ConnectedNvt => "TN3270E NVT",
            ConnectionState::ConnectedSscp => "TN3270E SSCP-LU",
            ConnectionState::ConnectedTn3270e => "TN3270E 3270",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    Data,
    Iac,
    Will,
    Wont,
    Do,
    Dont,
    Sb,
    SbIac,
}

/// How far [`TelnetFramer::process_incoming`] got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    /// Every byte was consumed
    Consumed,
    /// The host sent `SB STARTTLS FOLLOWS SE`; the bytes after `consumed`
    /// belong to the TLS handshake and must not be fed back in.
    StartTls { consumed: usize },
}

/// Consumer of what the framer extracts from the stream
pub trait RecordHandler {
    /// A 3270 data stream record (header already stripped)
    fn process_ds(&mut self, record: &[u8]) -> PdsResult;

    /// SSCP-LU data
    fn write_sscp_lu(&mut self, record: &[u8]);

    /// NVT bytes
    fn process_nvt(&mut self, data: &[u8]);

    /// The connection state changed
    fn mode_changed(&mut self, _state: ConnectionState, _bound: bool) {}
}

/// Per-connection negotiation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// Base terminal type, e.g. `IBM-3278-2`
    pub term_type: String,
    /// Host wants standard data stream only (no `-E` terminal type)
    pub std_ds: bool,
    /// Never negotiate TN3270E
    pub non_tn3270e: bool,
    /// Comma-separated LU names to try
    pub lu_names: Option<String>,
    /// LU to associate a printer session with
    pub assoc: Option<String>,
    /// TLS is available for STARTTLS
    pub tls_available: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            term_type: "IBM-3278-2".to_string(),
            std_ds: false,
            non_tn3270e: false,
            lu_names: None,
            assoc: None,
            tls_available: false,
        }
    }
}

impl NegotiatorConfig {
    /// Full model name, as used in TN3270E device-type requests
    pub fn full_model_name(&self) -> String {
        if self.term_type.ends_with("-E") {
            self.term_type.clone()
        } else {
            format!("{}-E", self.term_type)
        }
    }

    /// Name sent in the terminal-type sub-negotiation
    pub fn terminal_type(&self) -> String {
        if self.std_ds {
            self.term_type.trim_end_matches("-E").to_string()
        } else {
            self.full_model_name()
        }
    }
}

/// Telnet framer and TN3270E negotiator for one connection
#[derive(Debug)]
pub struct TelnetFramer {
    config: NegotiatorConfig,
    state: TelnetState,
    cstate: ConnectionState,
    myopts: [bool; 256],
    hisopts: [bool; 256],
    /// Record being assembled
    record: Vec<u8>,
    sbbuf: Vec<u8>,
    /// NVT bytes not yet handed over
    nvt: Vec<u8>,
    e: Tn3270eState,
    lus: LuCandidates,
    connected_lu: Option<String>,
    connected_type: Option<String>,
    output: Vec<u8>,
    syncing: bool,
    need_tls_follows: bool,
}

impl TelnetFramer {
    pub fn new(config: NegotiatorConfig) -> Self {
        let lus = LuCandidates::new(config.lu_names.as_deref(), config.assoc.as_deref());
        Self {
            config,
            state: TelnetState::Data,
            cstate: ConnectionState::NotConnected,
            myopts: [false; 256],
            hisopts: [false; 256],
            record: Vec::new(),
            sbbuf: Vec::new(),
            nvt: Vec::new(),
            e: Tn3270eState::new(),
            lus,
            connected_lu: None,
            connected_type: None,
            output: Vec::new(),
            syncing: false,
            need_tls_follows: false,
        }
    }

    /// Start over for a new connection with fresh parameters
    pub fn reset(&mut self, config: NegotiatorConfig) {
        let cstate = self.cstate;
        *self = Self::new(config);
        self.cstate = cstate;
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.cstate
    }

    /// Lifecycle transitions driven by the controller (resolving, pending,
    /// connected, disconnected)
    pub fn set_state(&mut self, state: ConnectionState) {
        self.cstate = state;
    }

    pub fn my_option(&self, opt: u8) -> bool {
        self.myopts[opt as usize]
    }

    pub fn his_option(&self, opt: u8) -> bool {
        self.hisopts[opt as usize]
    }

    pub fn tn3270e(&self) -> &Tn3270eState {
        &self.e
    }

    /// Whether a TN3270E BIND is in effect
    pub fn bound(&self) -> bool {
        self.cstate.in_e() && self.e.bound
    }

    pub fn connected_lu(&self) -> Option<&str> {
        self.connected_lu.as_deref()
    }

    pub fn connected_type(&self) -> Option<&str> {
        self.connected_type.as_deref()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Drain bytes waiting to go to the host
    pub fn take_output(&mut self) -> Vec<u8> {
        let out = std::mem::take(&mut self.output);
        trace_netdata('>', &out);
        out
    }

    /// The transport saw urgent data; discard records until `IAC DM`
    pub fn exception(&mut self) {
        debug!("RCVD urgent data indication");
        if !self.syncing {
            self.syncing = true;
        }
    }

    /// Feed bytes received from the host
    pub fn process_incoming(
        &mut self,
        data: &[u8],
        handler: &mut dyn RecordHandler,
    ) -> Result<InputStatus, TelnetError> {
        trace_netdata('<', data);
        for (i, &c) in data.iter().enumerate() {
            let result = self.telnet_fsm(c, handler);
            if let Err(e) = result {
                self.flush_nvt(handler);
                return Err(e);
            }
            if self.need_tls_follows && self.myopts[OPT_STARTTLS as usize] && self.tls_follows_received() {
                self.flush_nvt(handler);
                self.need_tls_follows = false;
                self.sbbuf.clear();
                return Ok(InputStatus::StartTls { consumed: i + 1 });
            }
        }
        self.flush_nvt(handler);
        Ok(InputStatus::Consumed)
    }

    fn tls_follows_received(&self) -> bool {
        self.state == TelnetState::Data && self.sbbuf.first() == Some(&OPT_STARTTLS) && self.sbbuf.last() == Some(&SE)
    }

    fn flush_nvt(&mut self, handler: &mut dyn RecordHandler) {
        if !self.nvt.is_empty() {
            let bytes = std::mem::take(&mut self.nvt);
            handler.process_nvt(&bytes);
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn send_opt(&mut self, cmd: u8, opt: u8) {
        self.send_raw(&[IAC, cmd, opt]);
        debug!("SENT {} {}", command_name(cmd), option_name(opt));
    }

    fn telnet_fsm(&mut self, c: u8, handler: &mut dyn RecordHandler) -> Result<(), TelnetError> {
        match self.state {
            TelnetState::Data => {
                if c == IAC {
                    self.state = TelnetState::Iac;
                    return Ok(());
                }
                if self.cstate == ConnectionState::ConnectedInitial {
                    // data before any negotiation: the host is a plain telnet server
                    self.cstate = ConnectionState::ConnectedAnsi;
                    handler.mode_changed(self.cstate, false);
                }
                if self.cstate.in_ansi() && !self.cstate.in_e() {
                    self.nvt.push(c);
                } else {
                    self.record.push(c);
                }
            }
            TelnetState::Iac => {
                if c != EOR && c != IAC {
                    trace!("RCVD {}", command_name(c));
                }
                self.state = TelnetState::Data;
                match c {
                    IAC => {
                        if self.cstate.in_ansi() && !self.cstate.in_e() {
                            self.nvt.push(c);
                        } else {
                            self.record.push(c);
                        }
                    }
                    EOR => {
                        if self.cstate.in_3270() || (self.cstate.in_e() && self.e.negotiated) {
                            trace!("RCVD EOR");
                            self.flush_nvt(handler);
                            self.process_eor(handler)?;
                        } else {
                            trace!("RCVD EOR (ignored -- not in 3270 mode)");
                            self.record.clear();
                        }
                    }
                    WILL => self.state = TelnetState::Will,
                    WONT => self.state = TelnetState::Wont,
                    DO => self.state = TelnetState::Do,
                    DONT => self.state = TelnetState::Dont,
                    SB => {
                        self.state = TelnetState::Sb;
                        self.sbbuf.clear();
                    }
                    DM => {
                        if self.syncing {
                            self.syncing = false;
                        }
                    }
                    GA | NOP | AO => {}
                    _ => trace!("{} (ignored -- unsupported)", command_name(c)),
                }
            }
            TelnetState::Will => {
                debug!("RCVD WILL {}", option_name(c));
                match c {
                    OPT_SGA | OPT_BINARY | OPT_EOR | OPT_TTYPE | OPT_ECHO | OPT_TN3270E => {
                        if !self.hisopts[c as usize] {
                            self.hisopts[c as usize] = true;
                            self.send_opt(DO, c);
                            // volunteer EOR when they do
                            if c == OPT_EOR && !self.myopts[c as usize] {
                                self.myopts[c as usize] = true;
                                self.send_opt(WILL, c);
                            }
                            self.check_in3270(handler)?;
                        }
                    }
                    _ => self.send_opt(DONT, c),
                }
                self.state = TelnetState::Data;
            }
            TelnetState::Wont => {
                debug!("RCVD WONT {}", option_name(c));
                if self.hisopts[c as usize] {
                    self.hisopts[c as usize] = false;
                    self.send_opt(DONT, c);
                    self.check_in3270(handler)?;
                }
                self.state = TelnetState::Data;
            }
            TelnetState::Do => {
                debug!("RCVD DO {}", option_name(c));
                let acceptable = match c {
                    OPT_BINARY | OPT_EOR | OPT_TTYPE | OPT_SGA | OPT_TM => true,
                    OPT_TN3270E => !self.config.non_tn3270e,
                    OPT_STARTTLS => self.config.tls_available,
                    _ => false,
                };
                if acceptable {
                    if !self.myopts[c as usize] {
                        if c != OPT_TM {
                            self.myopts[c as usize] = true;
                        }
                        self.send_opt(WILL, c);
                        self.check_in3270(handler)?;
                    }
                    if c == OPT_STARTTLS {
                        self.send_raw(&[IAC, SB, OPT_STARTTLS, TLS_FOLLOWS, IAC, SE]);
                        debug!("SENT SB {} FOLLOWS SE", option_name(OPT_STARTTLS));
                        self.need_tls_follows = true;
                    }
                } else {
                    self.send_opt(WONT, c);
                }
                self.state = TelnetState::Data;
            }
            TelnetState::Dont => {
                debug!("RCVD DONT {}", option_name(c));
                if self.myopts[c as usize] {
                    self.myopts[c as usize] = false;
                    self.send_opt(WONT, c);
                    self.check_in3270(handler)?;
                }
                self.state = TelnetState::Data;
            }
            TelnetState::Sb => {
                if c == IAC {
                    self.state = TelnetState::SbIac;
                } else {
                    self.sbbuf.push(c);
                }
            }
            TelnetState::SbIac => {
                self.sbbuf.push(c);
                if c == SE {
                    self.state = TelnetState::Data;
                    self.subnegotiation(handler)?;
                } else {
                    self.state = TelnetState::Sb;
                }
            }
        }
        Ok(())
    }

    fn subnegotiation(&mut self, handler: &mut dyn RecordHandler) -> Result<(), TelnetError> {
        let Some(&opt) = self.sbbuf.first() else {
            return Ok(());
        };
        if opt == OPT_TTYPE && self.sbbuf.get(1) == Some(&TELQUAL_SEND) {
            debug!("RCVD SB {} SEND SE", option_name(OPT_TTYPE));
            self.send_terminal_type()
        } else if opt == OPT_TN3270E && self.myopts[OPT_TN3270E as usize] {
            // drop the trailing SE
            let payload = self.sbbuf[1..self.sbbuf.len() - 1].to_vec();
            self.tn3270e_negotiate(&payload, handler)
        } else if opt == OPT_STARTTLS && self.need_tls_follows && self.myopts[OPT_STARTTLS as usize] {
            if self.sbbuf.len() != 3 || self.sbbuf[1] != TLS_FOLLOWS {
                warn!("Malformed STARTTLS reply: {:02x?}", self.sbbuf);
                return Err(TelnetError::TlsNegotiationFailure);
            }
            debug!("RCVD SB {} FOLLOWS SE", option_name(OPT_STARTTLS));
            Ok(())
        } else {
            trace!("RCVD SB {} (ignored)", option_name(opt));
            Ok(())
        }
    }

    fn send_terminal_type(&mut self) -> Result<(), TelnetError> {
        if self.lus.has_list() && self.lus.assoc().is_none() && self.lus.current().is_none() {
            return Err(TelnetError::LuListExhausted);
        }
        let mut tt = self.config.terminal_type();
        match self.lus.current() {
            Some(lu) if !lu.is_empty() => {
                tt.push('@');
                tt.push_str(lu);
                self.connected_lu = Some(lu.to_string());
            }
            _ => self.connected_lu = None,
        }
        self.send_raw(&[IAC, SB, OPT_TTYPE, TELQUAL_IS]);
        self.send_raw(tt.as_bytes());
        self.send_raw(&[IAC, SE]);
        debug!("SENT SB {} IS {} SE", option_name(OPT_TTYPE), tt);

        self.lus.advance();
        Ok(())
    }

    fn tn3270e_request(&mut self) {
        let msg = tn3270e::device_type_request(&self.config.full_model_name(), &self.lus);
        let target = match (self.lus.assoc(), self.lus.current()) {
            (Some(a), _) => format!(" ASSOCIATE {a}"),
            (None, Some(lu)) => format!(" CONNECT {lu}"),
            _ => String::new(),
        };
        self.send_raw(&msg);
        debug!(
            "SENT SB {} DEVICE-TYPE REQUEST {}{} SE",
            option_name(OPT_TN3270E),
            self.config.full_model_name(),
            target
        );
    }

    fn tn3270e_subneg_send(&mut self, op: u8, funcs: FunctionSet) {
        let msg = tn3270e::functions_message(op, funcs);
        self.send_raw(&msg);
        debug!(
            "SENT SB {} FUNCTIONS {} {} SE",
            option_name(OPT_TN3270E),
            if op == TN3270E_OP_IS { "IS" } else { "REQUEST" },
            funcs
        );
    }

    fn tn3270e_negotiate(&mut self, payload: &[u8], handler: &mut dyn RecordHandler) -> Result<(), TelnetError> {
        match Tn3270eMessage::parse(payload) {
            Tn3270eMessage::SendDeviceType => {
                debug!("RCVD TN3270E SEND DEVICE-TYPE SE");
                self.tn3270e_request();
            }
            Tn3270eMessage::DeviceTypeIs { device_type, lu_name } => {
                debug!(
                    "RCVD TN3270E DEVICE-TYPE IS {} CONNECT {} SE",
                    device_type,
                    lu_name.as_deref().unwrap_or("")
                );
                if !device_type.is_empty() {
                    self.connected_type = Some(device_type);
                }
                if let Some(lu) = lu_name.filter(|l| !l.is_empty()) {
                    self.connected_lu = Some(lu);
                }
                let funcs = self.e.funcs;
                self.tn3270e_subneg_send(TN3270E_OP_REQUEST, funcs);
            }
            Tn3270eMessage::DeviceTypeReject { reason } => {
                let reason = reason_name(reason);
                debug!("RCVD TN3270E DEVICE-TYPE REJECT REASON {} SE", reason);
                if self.lus.assoc().is_some() {
                    return Err(TelnetError::AssociateRejected { reason });
                }
                self.lus.advance();
                if self.lus.current().is_some() {
                    self.tn3270e_request();
                } else if self.lus.has_list() {
                    return Err(TelnetError::LuRejected { reason });
                } else {
                    return Err(TelnetError::DeviceTypeRejected { reason });
                }
            }
            Tn3270eMessage::FunctionsRequest(rcvd) => {
                debug!("RCVD TN3270E FUNCTIONS REQUEST {} SE", rcvd);
                if rcvd.is_subset_of(self.e.funcs) {
                    // no more than we offered
                    self.e.funcs = rcvd;
                    self.tn3270e_subneg_send(TN3270E_OP_IS, rcvd);
                    self.e.negotiated = true;
                    info!("TN3270E option negotiation complete.");
                    self.check_in3270(handler)?;
                } else {
                    self.e.funcs = self.e.funcs.intersection(rcvd);
                    let funcs = self.e.funcs;
                    self.tn3270e_subneg_send(TN3270E_OP_REQUEST, funcs);
                }
            }
            Tn3270eMessage::FunctionsIs(rcvd) => {
                debug!("RCVD TN3270E FUNCTIONS IS {} SE", rcvd);
                if !rcvd.is_subset_of(self.e.funcs) {
                    warn!("Host illegally added function(s), aborting TN3270E");
                    self.send_opt(WONT, OPT_TN3270E);
                    self.myopts[OPT_TN3270E as usize] = false;
                    return self.check_in3270(handler);
                }
                self.e.funcs = rcvd;
                self.e.negotiated = true;
                info!("TN3270E option negotiation complete.");
                self.check_in3270(handler)?;
            }
            Tn3270eMessage::Unknown(bytes) => {
                debug!("RCVD TN3270E {:02x?} (ignored)", bytes);
            }
        }
        Ok(())
    }

    /// Derive the connection state from the option table and TN3270E status
    fn check_in3270(&mut self, handler: &mut dyn RecordHandler) -> Result<(), TelnetError> {
        let new_state = if self.myopts[OPT_TN3270E as usize] {
            if !self.e.negotiated {
                ConnectionState::ConnectedInitialE
            } else {
                match self.e.submode {
                    Submode::None => ConnectionState::ConnectedInitialE,
                    Submode::Nvt => ConnectionState::ConnectedNvt,
                    Submode::Data3270 => ConnectionState::ConnectedTn3270e,
                    Submode::Sscp => ConnectionState::ConnectedSscp,
                }
            }
        } else if self.myopts[OPT_BINARY as usize]
            && self.myopts[OPT_EOR as usize]
            && self.myopts[OPT_TTYPE as usize]
            && self.hisopts[OPT_BINARY as usize]
            && self.hisopts[OPT_EOR as usize]
        {
            ConnectionState::Connected3270
        } else if self.cstate == ConnectionState::ConnectedInitial {
            return Ok(());
        } else {
            ConnectionState::ConnectedAnsi
        };

        if new_state != self.cstate {
            let was_in_e = self.cstate.in_e();
            self.cstate = new_state;

            if self.lus.assoc().is_some() && !new_state.in_e() {
                return Err(TelnetError::AssociationUnsupported);
            }
            if self.lus.has_list() && was_in_e != new_state.in_e() {
                self.lus.rewind();
            }
            if !self.myopts[OPT_TN3270E as usize] {
                self.e.reset_session();
            }
            handler.mode_changed(new_state, self.e.bound);
        }
        Ok(())
    }

    fn process_eor(&mut self, handler: &mut dyn RecordHandler) -> Result<(), TelnetError> {
        let record = std::mem::take(&mut self.record);
        if self.syncing || record.is_empty() {
            return Ok(());
        }

        if !self.cstate.in_e() {
            // plain TN3270: no responses
            if let PdsResult::OkayOutput(reply) = handler.process_ds(&record) {
                self.send_record(&reply);
            }
            return Ok(());
        }

        let Some(h) = Tn3270eHeader::parse(&record) else {
            debug!("RCVD TN3270E record too short ({} bytes)", record.len());
            return Ok(());
        };
        debug!("RCVD TN3270E({})", h.describe());
        self.e.recv_seq = h.seq;
        let body = &record[EH_SIZE..];

        match DataType::from_u8(h.data_type) {
            Some(DataType::Data3270) | Some(DataType::ScsData) => {
                if self.e.funcs.contains(Function::BindImage) && !self.e.bound {
                    return Ok(());
                }
                self.e.submode = Submode::Data3270;
                self.check_in3270(handler)?;
                self.e.response_required = h.response_flag;
                let rv = if h.data_type == DataType::Data3270 as u8 {
                    handler.process_ds(body)
                } else {
                    PdsResult::OkayNoOutput
                };
                match rv {
                    ref err if err.is_error() => {
                        if self.e.response_required != TN3270E_RSF_NO_RESPONSE {
                            self.tn3270e_nak(err);
                        }
                    }
                    PdsResult::OkayNoOutput => {
                        if self.e.response_required == TN3270E_RSF_ALWAYS_RESPONSE {
                            self.tn3270e_ack();
                        }
                    }
                    PdsResult::OkayOutput(reply) => self.send_record(&reply),
                    _ => {}
                }
                self.e.response_required = TN3270E_RSF_NO_RESPONSE;
            }
            Some(DataType::BindImage) => {
                if !self.e.funcs.contains(Function::BindImage) {
                    return Ok(());
                }
                self.e.bound = true;
                self.check_in3270(handler)?;
                if h.response_flag != TN3270E_RSF_NO_RESPONSE {
                    self.tn3270e_ack();
                }
            }
            Some(DataType::Unbind) => {
                if !self.e.funcs.contains(Function::BindImage) {
                    return Ok(());
                }
                self.e.bound = false;
                if self.e.submode == Submode::Data3270 {
                    self.e.submode = Submode::None;
                }
                self.check_in3270(handler)?;
                if h.response_flag != TN3270E_RSF_NO_RESPONSE {
                    self.tn3270e_ack();
                }
            }
            Some(DataType::SscpLuData) => {
                if h.response_flag != TN3270E_RSF_NO_RESPONSE {
                    self.tn3270e_nak(&PdsResult::BadCommand);
                }
                self.e.submode = Submode::Sscp;
                self.check_in3270(handler)?;
                handler.write_sscp_lu(body);
            }
            Some(DataType::NvtData) => {
                if h.response_flag != TN3270E_RSF_NO_RESPONSE {
                    self.tn3270e_nak(&PdsResult::BadCommand);
                }
                self.e.submode = Submode::Nvt;
                self.check_in3270(handler)?;
                handler.process_nvt(body);
            }
            _ => {}
        }
        Ok(())
    }

    fn tn3270e_ack(&mut self) {
        let seq = self.e.recv_seq;
        let rsp = tn3270e::positive_response(seq);
        self.send_raw(&rsp);
        debug!("SENT TN3270E(RESPONSE POSITIVE-RESPONSE {}) DEVICE-END", seq);
    }

    fn tn3270e_nak(&mut self, rv: &PdsResult) {
        let code = match rv {
            PdsResult::BadAddress => TN3270E_NEG_OPERATION_CHECK,
            PdsResult::Failed => TN3270E_NEG_INTERVENTION_REQUIRED,
            _ => TN3270E_NEG_COMMAND_REJECT,
        };
        let seq = self.e.recv_seq;
        let rsp = tn3270e::negative_response(seq, code);
        self.send_raw(&rsp);
        let name = match code {
            TN3270E_NEG_OPERATION_CHECK => "OPERATION-CHECK",
            TN3270E_NEG_INTERVENTION_REQUIRED => "INTERVENTION-REQUIRED",
            _ => "COMMAND-REJECT",
        };
        debug!("SENT TN3270E(RESPONSE NEGATIVE-RESPONSE {}) {}", seq, name);

        if code == TN3270E_NEG_INTERVENTION_REQUIRED {
            self.tn3270e_cleared();
        }
    }

    fn tn3270e_cleared(&mut self) {
        let seq = self.e.xmit_seq;
        let req = tn3270e::error_condition_cleared(seq);
        self.send_raw(&req);
        debug!("SENT TN3270E(REQUEST ERR-COND-CLEARED {})", seq);
        self.e.xmit_seq = (self.e.xmit_seq + 1) & tn3270e::SEQ_MASK;
    }

    /// Header for NVT or SSCP-LU output in a negotiated submode
    pub fn dummy_header(&self) -> Option<[u8; EH_SIZE]> {
        if !self.cstate.in_e() {
            return None;
        }
        let data_type = match self.e.submode {
            Submode::None => return None,
            Submode::Nvt => DataType::NvtData,
            Submode::Sscp => DataType::SscpLuData,
            Submode::Data3270 => DataType::Data3270,
        };
        Some(
            Tn3270eHeader {
                data_type: data_type as u8,
                request_flag: 0,
                response_flag: TN3270E_RSF_NO_RESPONSE,
                seq: 0,
            }
            .to_bytes(),
        )
    }

    /// Send one outbound 3270 record: TN3270E header when needed, IACs
    /// doubled, `IAC EOR` appended.
    pub fn send_record(&mut self, data: &[u8]) {
        let framed = self.cstate.in_tn3270e() || self.cstate.in_sscp();
        let mut buf = Vec::with_capacity(data.len() + EH_SIZE + 4);
        if framed {
            if self.e.response_required == TN3270E_RSF_ALWAYS_RESPONSE {
                self.tn3270e_ack();
                self.e.response_required = TN3270E_RSF_NO_RESPONSE;
            }
            let dt = if self.cstate.in_tn3270e() { DataType::Data3270 } else { DataType::SscpLuData };
            let h = Tn3270eHeader {
                data_type: dt as u8,
                request_flag: 0,
                response_flag: 0,
                seq: self.e.xmit_seq,
            };
            buf.extend_from_slice(&h.to_bytes());
        }
        buf.extend_from_slice(data);
        let mut out = double_iacs(&buf);
        out.extend_from_slice(&[IAC, EOR]);
        self.send_raw(&out);
        if framed {
            debug!(
                "SENT TN3270E({} NO-RESPONSE {})",
                if self.cstate.in_tn3270e() { "3270-DATA" } else { "SSCP-LU-DATA" },
                self.e.xmit_seq
            );
            self.e.bump_xmit_seq();
        }
        trace!("SENT EOR");
    }

    /// Send NVT data; in the TN3270E NVT submode it travels as a record
    pub fn send_nvt(&mut self, data: &[u8]) {
        if self.cstate.in_e() && self.e.submode == Submode::Nvt {
            if let Some(h) = self.dummy_header() {
                let mut buf = h.to_vec();
                buf.extend_from_slice(data);
                let mut out = double_iacs(&buf);
                out.extend_from_slice(&[IAC, EOR]);
                self.send_raw(&out);
                return;
            }
        }
        let out = double_iacs(data);
        self.send_raw(&out);
    }

    /// Telnet BREAK (Attn in plain TN3270)
    pub fn send_break(&mut self) {
        self.send_raw(&[IAC, BRK]);
        debug!("SENT BREAK");
    }

    /// Telnet IP (Attn in bound TN3270E, Interrupt)
    pub fn send_interrupt(&mut self) {
        self.send_raw(&[IAC, IP]);
        debug!("SENT IP");
    }

    /// TN3270E SysReq: `IAC AO`, switching to the SSCP-LU submode
    pub fn send_abort(&mut self, handler: &mut dyn RecordHandler) -> Result<(), TelnetError> {
        if self.e.funcs.contains(Function::Sysreq) && self.cstate.in_e() {
            self.send_raw(&[IAC, AO]);
            debug!("SENT AO");
            if matches!(self.e.submode, Submode::Data3270 | Submode::None) {
                self.e.submode = Submode::Sscp;
                self.check_in3270(handler)?;
            }
        }
        Ok(())
    }
}

/// Double every IAC byte in `data`
pub fn double_iacs(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}
