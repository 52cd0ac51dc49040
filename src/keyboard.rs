//! Keyboard lock state machine, typeahead and editing actions
//!
//! The keyboard is "locked" whenever any [`KeyboardLock`] condition is set:
//! waiting for the host after an AID key, an operator error, not connected
//! and so on. Actions invoked while locked are queued as typeahead and run
//! one at a time once the lock clears. Everything the keyboard wants sent to
//! the host is collected as [`Outbound`] items which the controller drains.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::ansi_processor::{self, CursorKey};
use crate::ebcdic::unicode_to_ebcdic;
use crate::lib3270::codes::*;
use crate::lib3270::display::{CharSet, DbcsState, DbcsWhy, InsertRoom, ReplyMode, ScreenBuffer};
use crate::lib3270::field;
use crate::lib3270::protocol::{read_modified, HostWrite};
use crate::telnet_negotiation::ConnectionState;

// Lock bits, as they appear in traces
pub const KL_OERR_MASK: u32 = 0x000f;
pub const KL_NOT_CONNECTED: u32 = 0x0010;
pub const KL_AWAITING_FIRST: u32 = 0x0020;
pub const KL_OIA_TWAIT: u32 = 0x0040;
pub const KL_OIA_LOCKED: u32 = 0x0080;
pub const KL_DEFERRED_UNLOCK: u32 = 0x0100;
pub const KL_ENTER_INHIBIT: u32 = 0x0200;
pub const KL_SCROLLED: u32 = 0x0400;
pub const KL_OIA_MINUS: u32 = 0x0800;
pub const KL_ALL: u32 = u32::MAX;

const FLAG_NAMES: [(u32, &str); 8] = [
    (KL_NOT_CONNECTED, "NOT_CONNECTED"),
    (KL_AWAITING_FIRST, "AWAITING_FIRST"),
    (KL_OIA_TWAIT, "OIA_TWAIT"),
    (KL_OIA_LOCKED, "OIA_LOCKED"),
    (KL_DEFERRED_UNLOCK, "DEFERRED_UNLOCK"),
    (KL_ENTER_INHIBIT, "ENTER_INHIBIT"),
    (KL_SCROLLED, "SCROLLED"),
    (KL_OIA_MINUS, "OIA_MINUS"),
];

/// Why the operator's last keystroke was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorErrorKind {
    /// Typing into a protected field or onto an attribute
    Protected = 1,
    /// Non-numeric character in a numeric field (with numeric lock)
    Numeric = 2,
    /// No room left in the field
    Overflow = 3,
    /// Mixing single- and double-byte characters illegally
    Dbcs = 4,
}

impl OperatorErrorKind {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits & KL_OERR_MASK {
            1 => Some(Self::Protected),
            2 => Some(Self::Numeric),
            3 => Some(Self::Overflow),
            4 => Some(Self::Dbcs),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Protected => "PROTECTED",
            Self::Numeric => "NUMERIC",
            Self::Overflow => "OVERFLOW",
            Self::Dbcs => "DBCS",
        }
    }
}

/// Keyboard lock conditions. The keyboard is locked when any is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyboardLock {
    pub oerr: Option<OperatorErrorKind>,
    pub not_connected: bool,
    /// Waiting for the host's first write after connecting
    pub awaiting_first: bool,
    /// Waiting for the host to answer an AID
    pub twait: bool,
    pub locked: bool,
    /// A host-driven unlock is scheduled
    pub deferred_unlock: bool,
    pub enter_inhibit: bool,
    pub scrolled: bool,
    /// The last key was not valid in this state
    pub minus: bool,
}

impl KeyboardLock {
    pub fn to_bits(&self) -> u32 {
        let mut bits = self.oerr.map_or(0, OperatorErrorKind::bits);
        for (bit, set) in [
            (KL_NOT_CONNECTED, self.not_connected),
            (KL_AWAITING_FIRST, self.awaiting_first),
            (KL_OIA_TWAIT, self.twait),
            (KL_OIA_LOCKED, self.locked),
            (KL_DEFERRED_UNLOCK, self.deferred_unlock),
            (KL_ENTER_INHIBIT, self.enter_inhibit),
            (KL_SCROLLED, self.scrolled),
            (KL_OIA_MINUS, self.minus),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            oerr: OperatorErrorKind::from_bits(bits),
            not_connected: bits & KL_NOT_CONNECTED != 0,
            awaiting_first: bits & KL_AWAITING_FIRST != 0,
            twait: bits & KL_OIA_TWAIT != 0,
            locked: bits & KL_OIA_LOCKED != 0,
            deferred_unlock: bits & KL_DEFERRED_UNLOCK != 0,
            enter_inhibit: bits & KL_ENTER_INHIBIT != 0,
            scrolled: bits & KL_SCROLLED != 0,
            minus: bits & KL_OIA_MINUS != 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.to_bits() != 0
    }

    /// Locked only because of an operator error
    pub fn is_oerr_only(&self) -> bool {
        let bits = self.to_bits();
        bits != 0 && bits & !KL_OERR_MASK == 0
    }

    /// Render lock bits for traces, each name prefixed with `how`
    pub fn decode(how: &str, bits: u32) -> String {
        if bits == KL_ALL {
            return "all".to_string();
        }
        let mut parts = Vec::new();
        if bits & KL_OERR_MASK != 0 {
            let name = OperatorErrorKind::from_bits(bits).map_or("?", OperatorErrorKind::name);
            parts.push(format!("{how}OERR({name})"));
        }
        for (bit, name) in FLAG_NAMES {
            if bits & bit != 0 {
                parts.push(format!("{how}{name}"));
            }
        }
        parts.join(" ")
    }
}

impl fmt::Display for KeyboardLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::decode("", self.to_bits()))
    }
}

/// Keyboard behavior switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardOptions {
    /// Queue actions typed while the keyboard is locked
    pub typeahead: bool,
    /// Operator errors lock the keyboard (otherwise they only ring the bell)
    pub oerr_lock: bool,
    /// Only digits, minus and period may go into numeric fields
    pub numeric_lock: bool,
    /// Count trailing blanks as free space and turn leading NULs into blanks
    pub blank_fill: bool,
    /// Delay host-driven unlocks
    pub unlock_delay: bool,
    pub unlock_delay_ms: u64,
}

impl Default for KeyboardOptions {
    fn default() -> Self {
        Self {
            typeahead: true,
            oerr_lock: true,
            numeric_lock: false,
            blank_fill: false,
            unlock_delay: true,
            unlock_delay_ms: 350,
        }
    }
}

/// Keyboard actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Enter,
    Clear,
    SysReq,
    Attn,
    Interrupt,
    PF(u8),
    PA(u8),
    Reset,
    Tab,
    BackTab,
    Home,
    Left,
    Right,
    Left2,
    Right2,
    Up,
    Down,
    Newline,
    PreviousWord,
    NextWord,
    FieldEnd,
    Delete,
    BackSpace,
    Erase,
    EraseEOF,
    EraseInput,
    DeleteWord,
    DeleteField,
    Insert,
    ToggleInsert,
    ToggleReverse,
    Dup,
    FieldMark,
    CursorSelect,
    MoveCursor { row: usize, col: usize },
    Key(char),
    String(String),
    HexString(String),
    ScrollLock(bool),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Enter => "Enter",
            Action::Clear => "Clear",
            Action::SysReq => "SysReq",
            Action::Attn => "Attn",
            Action::Interrupt => "Interrupt",
            Action::PF(_) => "PF",
            Action::PA(_) => "PA",
            Action::Reset => "Reset",
            Action::Tab => "Tab",
            Action::BackTab => "BackTab",
            Action::Home => "Home",
            Action::Left => "Left",
            Action::Right => "Right",
            Action::Left2 => "Left2",
            Action::Right2 => "Right2",
            Action::Up => "Up",
            Action::Down => "Down",
            Action::Newline => "Newline",
            Action::PreviousWord => "PreviousWord",
            Action::NextWord => "NextWord",
            Action::FieldEnd => "FieldEnd",
            Action::Delete => "Delete",
            Action::BackSpace => "BackSpace",
            Action::Erase => "Erase",
            Action::EraseEOF => "EraseEOF",
            Action::EraseInput => "EraseInput",
            Action::DeleteWord => "DeleteWord",
            Action::DeleteField => "DeleteField",
            Action::Insert => "Insert",
            Action::ToggleInsert => "ToggleInsert",
            Action::ToggleReverse => "ToggleReverse",
            Action::Dup => "Dup",
            Action::FieldMark => "FieldMark",
            Action::CursorSelect => "CursorSelect",
            Action::MoveCursor { .. } => "MoveCursor",
            Action::Key(_) => "Key",
            Action::String(_) => "String",
            Action::HexString(_) => "HexString",
            Action::ScrollLock(_) => "ScrollLock",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::PF(n) | Action::PA(n) => write!(f, "{}({})", self.name(), n),
            Action::MoveCursor { row, col } => write!(f, "MoveCursor({row},{col})"),
            Action::Key(c) => write!(f, "Key(U+{:04x})", *c as u32),
            Action::String(s) | Action::HexString(s) => write!(f, "{}({:?})", self.name(), s),
            Action::ScrollLock(on) => write!(f, "ScrollLock({on})"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    /// Parse `Name` or `Name(args)`, e.g. `PF(3)`, `MoveCursor(2,10)`,
    /// `String("logon\n")`. Names are case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, args) = match s.find('(') {
            Some(i) => {
                let inner = s[i + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| format!("{s}: missing ')'"))?;
                (&s[..i], inner.trim())
            }
            None => (s, ""),
        };
        let unquote = |a: &str| {
            let a = a.trim();
            a.strip_prefix('"').and_then(|t| t.strip_suffix('"')).unwrap_or(a).to_string()
        };
        let number = |a: &str| {
            a.trim()
                .parse::<usize>()
                .map_err(|_| format!("{name}: invalid argument '{a}'"))
        };
        let action = match name.to_ascii_lowercase().as_str() {
            "enter" => Action::Enter,
            "clear" => Action::Clear,
            "sysreq" => Action::SysReq,
            "attn" => Action::Attn,
            "interrupt" => Action::Interrupt,
            "pf" => Action::PF(number(args)?.min(255) as u8),
            "pa" => Action::PA(number(args)?.min(255) as u8),
            "reset" => Action::Reset,
            "tab" => Action::Tab,
            "backtab" => Action::BackTab,
            "home" => Action::Home,
            "left" => Action::Left,
            "right" => Action::Right,
            "left2" => Action::Left2,
            "right2" => Action::Right2,
            "up" => Action::Up,
            "down" => Action::Down,
            "newline" => Action::Newline,
            "previousword" => Action::PreviousWord,
            "nextword" => Action::NextWord,
            "fieldend" => Action::FieldEnd,
            "delete" => Action::Delete,
            "backspace" => Action::BackSpace,
            "erase" => Action::Erase,
            "eraseeof" => Action::EraseEOF,
            "eraseinput" => Action::EraseInput,
            "deleteword" => Action::DeleteWord,
            "deletefield" => Action::DeleteField,
            "insert" => Action::Insert,
            "toggleinsert" => Action::ToggleInsert,
            "togglereverse" => Action::ToggleReverse,
            "dup" => Action::Dup,
            "fieldmark" => Action::FieldMark,
            "cursorselect" => Action::CursorSelect,
            "movecursor" => {
                let (row, col) = args
                    .split_once(',')
                    .ok_or_else(|| format!("{name}: needs two arguments"))?;
                Action::MoveCursor { row: number(row)?, col: number(col)? }
            }
            "key" => {
                let arg = unquote(args);
                let ch = match arg.strip_prefix("U+").or_else(|| arg.strip_prefix("u+")) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok().and_then(char::from_u32),
                    None => {
                        let mut chars = arg.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) => Some(c),
                            _ => None,
                        }
                    }
                };
                Action::Key(ch.ok_or_else(|| format!("Key: invalid argument '{arg}'"))?)
            }
            "string" => Action::String(unquote(args)),
            "hexstring" => Action::HexString(unquote(args)),
            "scrolllock" => Action::ScrollLock(!matches!(args, "false" | "off" | "0")),
            _ => return Err(format!("Unknown action: {name}")),
        };
        Ok(action)
    }
}

/// An entry in the typeahead queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    Action(Action),
    /// Single-byte character entry
    Char { ebc: u8, with_ge: bool, pasting: bool },
    /// Double-byte character entry
    WideChar([u8; 2]),
}

/// Something the keyboard wants sent to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An inbound 3270 (or SSCP-LU) record, not yet framed
    Record { aid: u8, data: Vec<u8> },
    /// NVT bytes
    Nvt(Vec<u8>),
    /// Telnet BREAK
    Break,
    /// Telnet IP
    Interrupt,
    /// TN3270E SysReq (`IAC AO`)
    Abort,
}

/// Parser states for String input escapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringState {
    Base,
    Backslash,
    BackX,
    BackE,
    BackP,
    BackPa,
    BackPf,
    Octal,
    Hex,
    Ebc,
}

/// The keyboard engine
#[derive(Debug)]
pub struct Keyboard {
    lock: KeyboardLock,
    options: KeyboardOptions,
    typeahead: VecDeque<Deferred>,
    /// Rest of a String action stopped by an AID
    pending: Option<Vec<char>>,
    insert: bool,
    reverse: bool,
    cstate: ConnectionState,
    bound: bool,
    app_cursor: bool,
    /// When DEFERRED_UNLOCK was last turned on
    unlock_delay_time: Option<Instant>,
    unlock_deadline: Option<Instant>,
    outbound: Vec<Outbound>,
    bells: u32,
}

impl Keyboard {
    pub fn new(options: KeyboardOptions) -> Self {
        Self {
            lock: KeyboardLock {
                not_connected: true,
                ..KeyboardLock::default()
            },
            options,
            typeahead: VecDeque::new(),
            pending: None,
            insert: false,
            reverse: false,
            cstate: ConnectionState::NotConnected,
            bound: false,
            app_cursor: false,
            unlock_delay_time: None,
            unlock_deadline: None,
            outbound: Vec::new(),
            bells: 0,
        }
    }

    pub fn lock(&self) -> KeyboardLock {
        self.lock
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn options(&self) -> &KeyboardOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: KeyboardOptions) {
        self.options = options;
    }

    pub fn insert_mode(&self) -> bool {
        self.insert
    }

    pub fn reverse_mode(&self) -> bool {
        self.reverse
    }

    pub fn typeahead_len(&self) -> usize {
        self.typeahead.len()
    }

    pub fn has_pending_input(&self) -> bool {
        self.pending.is_some()
    }

    /// Times the bell has rung
    pub fn bells(&self) -> u32 {
        self.bells
    }

    /// Whether the NVT side wants application cursor keys
    pub fn set_app_cursor(&mut self, on: bool) {
        self.app_cursor = on;
    }

    /// Drain everything queued for the host
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// When the deferred unlock is due, if one is scheduled
    pub fn next_deadline(&self) -> Option<Instant> {
        self.unlock_deadline
    }

    /// Track the connection state without running any lock transitions
    pub fn set_state(&mut self, state: ConnectionState, bound: bool) {
        self.cstate = state;
        self.bound = bound;
    }

    // Lock bit plumbing

    fn lock_set(&mut self, bits: u32, cause: &str) {
        debug!("Keyboard lock({}) {}", cause, KeyboardLock::decode("+", bits));
        let old = self.lock.to_bits();
        let mut n = old | bits;
        if bits & KL_OERR_MASK != 0 {
            n = (n & !KL_OERR_MASK) | (bits & KL_OERR_MASK);
        }
        if n != old {
            if (old ^ n) & KL_DEFERRED_UNLOCK != 0 {
                self.unlock_delay_time = Some(Instant::now());
            }
            self.lock = KeyboardLock::from_bits(n);
        }
    }

    fn lock_clr(&mut self, bits: u32, cause: &str) {
        let old = self.lock.to_bits();
        if old & bits != 0 {
            debug!("Keyboard unlock({}) {}", cause, KeyboardLock::decode("-", old & bits));
        }
        let n = old & !bits;
        if n != old {
            if (old ^ n) & KL_DEFERRED_UNLOCK != 0 {
                self.unlock_delay_time = None;
            }
            self.lock = KeyboardLock::from_bits(n);
        }
    }

    fn cancel_deferred_unlock(&mut self) {
        if self.lock.deferred_unlock {
            self.unlock_deadline = None;
        }
    }

    fn ring_bell(&mut self) {
        self.bells += 1;
        trace!("bell");
    }

    fn send_nvt(&mut self, bytes: Vec<u8>) {
        self.outbound.push(Outbound::Nvt(bytes));
    }

    // Typeahead

    fn enq_ta(&mut self, entry: Deferred) {
        if !self.cstate.is_connected() {
            trace!("  dropped (not connected)");
            return;
        }
        if self.lock.oerr.is_some() {
            self.ring_bell();
            trace!("  dropped (operator error)");
            return;
        }
        if self.lock.scrolled {
            self.ring_bell();
            trace!("  dropped (scrolled)");
            return;
        }
        if !self.options.typeahead {
            trace!("  dropped (no typeahead)");
            return;
        }
        self.typeahead.push_back(entry);
        trace!("  action queued (kybdlock 0x{:x})", self.lock.to_bits());
    }

    /// Run one typeahead entry if the keyboard is unlocked
    pub fn run_ta(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.is_locked() {
            return false;
        }
        let Some(entry) = self.typeahead.pop_front() else {
            return false;
        };
        match entry {
            Deferred::Action(action) => {
                trace!("typeahead: {action}");
                self.run_action(screen, action);
            }
            Deferred::Char { ebc, with_ge, pasting } => {
                self.key_character(screen, ebc, with_ge, pasting);
            }
            Deferred::WideChar(pair) => {
                self.key_wcharacter(screen, pair);
            }
        }
        true
    }

    /// Discard all typeahead; returns whether anything was queued
    pub fn flush_ta(&mut self) -> bool {
        let any = !self.typeahead.is_empty();
        self.typeahead.clear();
        any
    }

    /// Run typeahead, then pending String input, while the keyboard stays
    /// unlocked
    pub fn drain(&mut self, screen: &mut ScreenBuffer) {
        while self.run_ta(screen) {}
        if self.is_locked() || !self.cstate.is_connected() {
            return;
        }
        if let Some(chars) = self.pending.take() {
            let left = self.emulate_input(screen, &chars);
            if left > 0 {
                self.pending = Some(chars[chars.len() - left..].to_vec());
            }
        }
    }

    // State-change hooks

    /// The host connected or disconnected
    pub fn connect(&mut self, connected: bool) {
        self.cancel_deferred_unlock();
        self.lock_clr(KL_ALL, "kybd_connect");
        if connected {
            // Wait for any output or a WCC(restore) from the host
            self.lock_set(KL_AWAITING_FIRST, "kybd_connect");
        } else {
            self.lock_set(KL_NOT_CONNECTED, "kybd_connect");
            self.flush_ta();
            self.pending = None;
        }
    }

    /// The session moved into or out of 3270 mode
    pub fn in3270(&mut self, state: ConnectionState, bound: bool) {
        let prev = self.cstate;
        self.set_state(state, bound);
        self.cancel_deferred_unlock();

        match state {
            // UNBIND: wait for a BIND or data
            ConnectionState::ConnectedInitialE if prev == ConnectionState::ConnectedTn3270e => {
                self.lock_set(KL_AWAITING_FIRST, "kybd_in3270");
            }
            ConnectionState::ConnectedAnsi | ConnectionState::ConnectedNvt | ConnectionState::ConnectedSscp => {
                self.lock_clr(KL_ALL, "kybd_in3270");
            }
            _ => {
                if state == ConnectionState::ConnectedTn3270e && bound {
                    self.lock_clr(KL_ALL, "kybd_in3270");
                }
                self.lock_clr(!KL_AWAITING_FIRST, "kybd_in3270");
            }
        }
    }

    /// The host wrote to the screen
    pub fn host_write(&mut self, write: &HostWrite) {
        if self.lock.awaiting_first {
            self.lock_clr(KL_AWAITING_FIRST, "ctlr_write");
        }
        if write.restore {
            self.do_reset(false);
        } else if self.lock.twait {
            self.lock_clr(KL_OIA_TWAIT, "ctlr_write");
        }
        if write.alarm {
            self.ring_bell();
        }
    }

    /// Set or clear enter-inhibit
    pub fn inhibit(&mut self, inhibit: bool) {
        if inhibit {
            self.lock_set(KL_ENTER_INHIBIT, "kybd_inhibit");
        } else {
            self.lock_clr(KL_ENTER_INHIBIT, "kybd_inhibit");
        }
    }

    /// Fire the deferred unlock if it is due
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(deadline) = self.unlock_deadline {
            if now >= deadline {
                self.unlock_deadline = None;
                self.lock_clr(KL_DEFERRED_UNLOCK, "defer_unlock");
            }
        }
    }

    fn operator_error(&mut self, kind: OperatorErrorKind) {
        if self.options.oerr_lock {
            self.lock_set(kind.bits(), "operator_error");
            self.flush_ta();
        } else {
            self.ring_bell();
        }
    }

    /// Reset the keyboard lock. A reset from the keyboard (`explicit`)
    /// unlocks at once; one from the host may be deferred.
    pub fn do_reset(&mut self, explicit: bool) {
        // With typeahead queued, an explicit reset only flushes it
        if explicit && self.flush_ta() {
            return;
        }

        self.insert = false;
        self.lock_clr(KL_SCROLLED, "do_reset");

        if !self.cstate.is_connected() {
            return;
        }

        self.cancel_deferred_unlock();

        let stale = self
            .unlock_delay_time
            .map_or(false, |t| t.elapsed() > Duration::from_secs(1));
        if explicit || !self.options.unlock_delay || stale || self.options.unlock_delay_ms == 0 {
            self.lock_clr(KL_ALL, "do_reset");
        } else if self.lock.to_bits() & (KL_DEFERRED_UNLOCK | KL_OIA_TWAIT | KL_OIA_LOCKED | KL_AWAITING_FIRST) != 0
        {
            self.lock_clr(!KL_DEFERRED_UNLOCK, "do_reset");
            self.lock_set(KL_DEFERRED_UNLOCK, "do_reset");
            self.unlock_deadline = Some(Instant::now() + Duration::from_millis(self.options.unlock_delay_ms));
            debug!("Deferring keyboard unlock {}ms", self.options.unlock_delay_ms);
        }
    }

    /// Run one action
    pub fn run_action(&mut self, screen: &mut ScreenBuffer, action: Action) -> bool {
        trace!("action {action}");
        match action {
            Action::Enter => self.enter(screen),
            Action::Clear => self.clear(screen),
            Action::SysReq => self.sysreq(screen),
            Action::Attn => self.attn(),
            Action::Interrupt => self.interrupt(),
            Action::PF(n) => self.pf(screen, n),
            Action::PA(n) => self.pa(screen, n),
            Action::Reset => {
                self.do_reset(true);
                true
            }
            Action::Tab => self.tab(screen),
            Action::BackTab => self.backtab(screen),
            Action::Home => self.home(screen),
            Action::Left => self.left(screen),
            Action::Right => self.right(screen),
            Action::Left2 => self.left2(screen),
            Action::Right2 => self.right2(screen),
            Action::Up => self.up(screen),
            Action::Down => self.down(screen),
            Action::Newline => self.newline(screen),
            Action::PreviousWord => self.previous_word(screen),
            Action::NextWord => self.next_word(screen),
            Action::FieldEnd => self.field_end(screen),
            Action::Delete => self.delete(screen),
            Action::BackSpace => self.backspace(screen),
            Action::Erase => self.erase(screen),
            Action::EraseEOF => self.erase_eof(screen),
            Action::EraseInput => self.erase_input(screen),
            Action::DeleteWord => self.delete_word(screen),
            Action::DeleteField => self.delete_field(screen),
            Action::Insert => self.set_insert(Action::Insert, Some(true)),
            Action::ToggleInsert => self.set_insert(Action::ToggleInsert, None),
            Action::ToggleReverse => self.toggle_reverse(screen),
            Action::Dup => self.dup(screen),
            Action::FieldMark => self.field_mark(screen),
            Action::CursorSelect => self.cursor_select(screen),
            Action::MoveCursor { row, col } => self.move_cursor(screen, row, col),
            Action::Key(ch) => {
                self.key_ucharacter(screen, ch);
                true
            }
            Action::String(s) => self.string(screen, &s),
            Action::HexString(s) => self.hex_string(screen, &s),
            Action::ScrollLock(lock) => {
                self.scroll_lock(lock);
                true
            }
        }
    }

    /// Queue `action` if the keyboard is locked; true if it was queued
    fn queue_if_locked(&mut self, action: Action) -> bool {
        if self.is_locked() {
            self.enq_ta(Deferred::Action(action));
            true
        } else {
            false
        }
    }

    /// Motion keys clear an operator error instead of queueing behind it.
    /// Returns false if the action was queued.
    fn motion_allowed(&mut self, action: Action) -> bool {
        if self.is_locked() {
            if self.lock.is_oerr_only() {
                let cause = action.name();
                self.lock_clr(KL_OERR_MASK, cause);
            } else {
                self.enq_ta(Deferred::Action(action));
                return false;
            }
        }
        true
    }

    // AID keys

    fn key_aid(&mut self, screen: &mut ScreenBuffer, aid: u8) {
        if self.cstate.in_ansi() {
            if aid == AID_ENTER {
                self.send_nvt(b"\r".to_vec());
            } else if let Some(i) = PF_AIDS.iter().position(|&a| a == aid) {
                if let Some(seq) = ansi_processor::nvt_pf(i as u8 + 1) {
                    self.send_nvt(seq);
                }
            } else if let Some(i) = PA_AIDS.iter().position(|&a| a == aid) {
                if let Some(seq) = ansi_processor::nvt_pa(i as u8 + 1) {
                    self.send_nvt(seq);
                }
            }
            return;
        }

        if self.cstate.in_sscp() {
            if self.lock.minus {
                return;
            }
            match aid {
                // Handled locally
                AID_CLEAR => {}
                AID_ENTER => {
                    // SSCP-LU input goes without the AID and cursor address
                    let reply = read_modified(screen, aid, false);
                    let data = reply.get(3..).unwrap_or_default().to_vec();
                    self.outbound.push(Outbound::Record { aid, data });
                }
                _ => self.lock_set(KL_OIA_MINUS, "key_AID"),
            }
            return;
        }

        self.insert = false;
        self.lock_set(KL_OIA_TWAIT | KL_OIA_LOCKED, "key_AID");
        let data = read_modified(screen, aid, false);
        self.outbound.push(Outbound::Record { aid, data });
    }

    fn enter(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.lock.minus {
            return false;
        }
        if !self.queue_if_locked(Action::Enter) {
            self.key_aid(screen, AID_ENTER);
        }
        true
    }

    fn sysreq(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.cstate.in_ansi() {
            return false;
        }
        if self.cstate.in_e() {
            self.outbound.push(Outbound::Abort);
        } else {
            if self.lock.minus {
                return false;
            }
            if !self.queue_if_locked(Action::SysReq) {
                self.key_aid(screen, AID_SYSREQ);
            }
        }
        true
    }

    fn clear(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.lock.minus {
            return false;
        }
        if self.is_locked() && self.cstate.is_connected() {
            self.enq_ta(Deferred::Action(Action::Clear));
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(ansi_processor::nvt_clear());
            return true;
        }
        screen.clear();
        screen.set_cursor(0);
        if self.cstate.is_connected() {
            self.key_aid(screen, AID_CLEAR);
        }
        true
    }

    fn pf(&mut self, screen: &mut ScreenBuffer, n: u8) -> bool {
        if !(1..=PF_AIDS.len() as u8).contains(&n) {
            warn!("PF: Invalid argument '{n}'");
            return false;
        }
        if self.lock.minus {
            return true;
        }
        if !self.queue_if_locked(Action::PF(n)) {
            self.key_aid(screen, PF_AIDS[n as usize - 1]);
        }
        true
    }

    fn pa(&mut self, screen: &mut ScreenBuffer, n: u8) -> bool {
        if !(1..=PA_AIDS.len() as u8).contains(&n) {
            warn!("PA: Invalid argument '{n}'");
            return false;
        }
        if self.lock.minus {
            return true;
        }
        if !self.queue_if_locked(Action::PA(n)) {
            self.key_aid(screen, PA_AIDS[n as usize - 1]);
        }
        true
    }

    /// ATTN, per RFC 2355
    fn attn(&mut self) -> bool {
        if !self.cstate.in_3270() {
            return false;
        }
        if self.cstate.in_e() {
            if self.bound {
                self.outbound.push(Outbound::Interrupt);
            } else {
                self.lock_set(KL_OIA_MINUS, "Attn");
            }
        } else {
            self.outbound.push(Outbound::Break);
        }
        true
    }

    fn interrupt(&mut self) -> bool {
        if !self.cstate.in_3270() {
            return false;
        }
        self.outbound.push(Outbound::Interrupt);
        true
    }

    // Character entry

    fn ins_prep(&mut self, screen: &mut ScreenBuffer, baddr: usize, count: usize) -> Option<bool> {
        match screen.ins_prep(baddr, count, self.options.blank_fill, self.reverse) {
            InsertRoom::Ready => Some(false),
            InsertRoom::NoRoom => Some(true),
            InsertRoom::Overflow => {
                self.operator_error(OperatorErrorKind::Overflow);
                None
            }
        }
    }

    /// Plain single-byte store that also resets color and highlighting
    fn add_plain(screen: &mut ScreenBuffer, addr: usize, cc: u8) {
        screen.add(addr, cc, CharSet::Base);
        let cell = screen.cell_mut(addr);
        cell.fg = 0;
        cell.gr = 0;
    }

    /// Move off attribute bytes, jumping over auto-skip fields
    fn skip_attributes(screen: &ScreenBuffer, mut baddr: usize) -> usize {
        for _ in 0..screen.len() {
            let cell = screen.cell(baddr);
            if !cell.is_fa() {
                break;
            }
            baddr = if field::is_skip(cell.fa) {
                screen.next_unprotected(baddr)
            } else {
                screen.inc(baddr)
            };
        }
        baddr
    }

    /// Type one EBCDIC character at the cursor
    pub fn key_character(&mut self, screen: &mut ScreenBuffer, ebc: u8, with_ge: bool, pasting: bool) -> bool {
        if self.is_locked() {
            self.enq_ta(Deferred::Char { ebc, with_ge, pasting });
            return false;
        }
        let mut baddr = screen.cursor();
        let faddr = screen.find_field_attribute(baddr);
        let fa = screen.get_field_attribute(baddr);

        if screen.cell(baddr).is_fa() || field::is_protected(fa) {
            self.operator_error(OperatorErrorKind::Protected);
            return false;
        }
        if self.options.numeric_lock
            && field::is_numeric(fa)
            && !((EBC_0..=EBC_9).contains(&ebc) || ebc == EBC_MINUS || ebc == EBC_PERIOD)
        {
            self.operator_error(OperatorErrorKind::Numeric);
            return false;
        }

        // Can't put an SBCS character in a DBCS field
        if faddr.map_or(false, |f| screen.cell(f).cs == CharSet::Dbcs) {
            self.operator_error(OperatorErrorKind::Dbcs);
            return false;
        }

        // On the SI closing a subfield: type just past it
        if screen.cell(baddr).cc == EBC_SI {
            baddr = screen.inc(baddr);
            if Some(baddr) == faddr {
                self.operator_error(OperatorErrorKind::Overflow);
                return false;
            }
        }

        let mut no_room = false;
        if screen.cell(baddr).cc == EBC_SO {
            if self.insert {
                match self.ins_prep(screen, baddr, 1) {
                    Some(nr) => no_room = nr,
                    None => return false,
                }
            } else {
                // SO/SI pair becomes x/space; SO and a DBCS character
                // become x/space/SO
                let mut xaddr = screen.inc(baddr);
                let was_si = screen.cell(xaddr).cc == EBC_SI;
                Self::add_plain(screen, xaddr, EBC_SPACE);
                if !was_si {
                    xaddr = screen.inc(xaddr);
                    Self::add_plain(screen, xaddr, EBC_SO);
                }
            }
        } else {
            let (state, why) = screen.lookleft_state(baddr);
            if state.is_dbcs() {
                if state.is_right() {
                    baddr = screen.dec(baddr);
                }
                if why == DbcsWhy::Attribute {
                    if self.insert {
                        match self.ins_prep(screen, baddr, 1) {
                            Some(nr) => no_room = nr,
                            None => return false,
                        }
                    } else {
                        let xaddr = screen.inc(baddr);
                        Self::add_plain(screen, xaddr, EBC_SPACE);
                    }
                } else if self.insert {
                    // First position of the subfield: insert in front of
                    // the SO. Otherwise split the subfield around the
                    // character with SI ... SO.
                    let xaddr = screen.dec(baddr);
                    if screen.cell(xaddr).cc == EBC_SO {
                        baddr = screen.dec(baddr);
                        match self.ins_prep(screen, baddr, 1) {
                            Some(nr) => no_room = nr,
                            None => return false,
                        }
                    } else {
                        match self.ins_prep(screen, baddr, 3) {
                            Some(nr) => no_room = nr,
                            None => return false,
                        }
                        Self::add_plain(screen, baddr, EBC_SI);
                        baddr = screen.inc(baddr);
                        let so = screen.inc(baddr);
                        Self::add_plain(screen, so, EBC_SO);
                    }
                } else {
                    // Overwriting part of a subfield
                    Self::add_plain(screen, baddr, EBC_SI);
                    baddr = screen.inc(baddr);
                    let mut xaddr = screen.inc(baddr);
                    let was_si = screen.cell(xaddr).cc == EBC_SI;
                    Self::add_plain(screen, xaddr, EBC_SPACE);
                    if !was_si {
                        xaddr = screen.inc(xaddr);
                        Self::add_plain(screen, xaddr, EBC_SO);
                    }
                }
            } else if self.reverse || self.insert {
                match self.ins_prep(screen, baddr, 1) {
                    Some(nr) => no_room = nr,
                    None => return false,
                }
            }
        }

        if no_room {
            loop {
                baddr = screen.inc(baddr);
                if !screen.cell(baddr).is_fa() {
                    break;
                }
            }
        } else {
            screen.add(baddr, ebc, if with_ge { CharSet::Ge } else { CharSet::Base });
            let cell = screen.cell_mut(baddr);
            cell.fg = 0;
            cell.gr = 0;
            if !self.reverse {
                baddr = screen.inc(baddr);
            }
        }

        // Replace leading NULs with blanks
        if self.options.blank_fill && screen.formatted() {
            if let Some(faddr) = faddr {
                Self::blank_fill_back(screen, faddr, baddr);
            }
        }

        screen.mdt_set(screen.cursor());

        // Auto-skip, and never land on an attribute. DUP typed at the
        // keyboard stays put; the Dup action tabs afterwards.
        if pasting || ebc != EBC_DUP {
            baddr = Self::skip_attributes(screen, baddr);
        }
        screen.set_cursor(baddr);
        screen.dbcs_postprocess();
        true
    }

    /// Blank-fill NULs between the field start and `baddr`, giving up at a
    /// line that is all NULs
    fn blank_fill_back(screen: &mut ScreenBuffer, faddr: usize, baddr: usize) {
        let cols = screen.cols();
        let mut fill = screen.dec(baddr);
        while fill != faddr {
            // Backward line wrap
            if fill % cols == cols - 1 {
                let mut aborted = true;
                let mut scan = fill;
                while scan != faddr {
                    if screen.cell(scan).cc != EBC_NULL {
                        aborted = false;
                        break;
                    }
                    if scan % cols == 0 {
                        break;
                    }
                    scan = screen.dec(scan);
                }
                if aborted {
                    break;
                }
            }
            if screen.cell(fill).cc == EBC_NULL {
                screen.add(fill, EBC_SPACE, CharSet::Base);
            }
            fill = screen.dec(fill);
        }
    }

    /// Type one double-byte character at the cursor
    pub fn key_wcharacter(&mut self, screen: &mut ScreenBuffer, pair: [u8; 2]) -> bool {
        if self.is_locked() {
            self.enq_ta(Deferred::WideChar(pair));
            return false;
        }
        if !screen.dbcs() {
            trace!("DBCS character received when not in DBCS mode, ignoring.");
            return true;
        }
        if self.cstate.in_ansi() {
            trace!("  dropped (no DBCS translation in NVT mode)");
            return true;
        }

        let mut baddr = screen.cursor();
        let fa = screen.get_field_attribute(baddr);
        let faddr = screen.find_field_attribute(baddr);

        if screen.cell(baddr).is_fa() || field::is_protected(fa) {
            self.operator_error(OperatorErrorKind::Protected);
            return false;
        }
        if self.options.numeric_lock && field::is_numeric(fa) {
            self.operator_error(OperatorErrorKind::Numeric);
            return false;
        }

        let done = match self.place_wide(screen, &mut baddr, faddr, pair) {
            Some(done) => done,
            None => return false,
        };
        if !done {
            self.operator_error(OperatorErrorKind::Dbcs);
            return false;
        }

        if self.options.blank_fill {
            if let Some(faddr) = faddr {
                let mut xaddr = screen.inc(faddr);
                while xaddr != baddr && screen.cell(xaddr).cc == EBC_NULL {
                    screen.add(xaddr, EBC_SPACE, CharSet::Base);
                    xaddr = screen.inc(xaddr);
                }
            }
        }
        screen.mdt_set(screen.cursor());
        baddr = Self::skip_attributes(screen, baddr);
        screen.set_cursor(baddr);
        screen.dbcs_postprocess();
        true
    }

    /// Store a DBCS pair according to the DBCS state at `baddr`, leaving
    /// `baddr` at the next unmodified position. `None` means an insert
    /// overflowed; `Some(false)` means the character does not fit here.
    fn place_wide(
        &mut self,
        screen: &mut ScreenBuffer,
        baddr: &mut usize,
        faddr: Option<usize>,
        pair: [u8; 2],
    ) -> Option<bool> {
        let mut no_si = false;
        for _ in 0..screen.len() {
            let d = screen.dbcs_state(*baddr);
            match d {
                DbcsState::Right | DbcsState::RightWrap | DbcsState::Left | DbcsState::LeftWrap => {
                    if d.is_right() {
                        *baddr = screen.dec(*baddr);
                    }
                    // Overwrite the existing character
                    if self.insert {
                        self.ins_prep(screen, *baddr, 2)?;
                    }
                    let cs = screen.cell(*baddr).cs;
                    screen.add(*baddr, pair[0], cs);
                    *baddr = screen.inc(*baddr);
                    let cs = screen.cell(*baddr).cs;
                    screen.add(*baddr, pair[1], cs);
                    *baddr = screen.inc(*baddr);
                    return Some(true);
                }
                DbcsState::Sb | DbcsState::Si => {
                    if d == DbcsState::Sb {
                        *baddr = screen.dec(*baddr);
                    }
                    // Extend the subfield to the right
                    if self.insert {
                        self.ins_prep(screen, *baddr, 2)?;
                    } else {
                        // Don't overwrite a field attribute or an SO
                        let mut xaddr = screen.inc(*baddr);
                        if screen.cell(xaddr).is_fa() {
                            return Some(false);
                        }
                        if screen.cell(xaddr).cc == EBC_SO {
                            no_si = true;
                        }
                        xaddr = screen.inc(xaddr);
                        if screen.cell(xaddr).is_fa() || screen.cell(xaddr).cc == EBC_SO {
                            return Some(false);
                        }
                    }
                    let cs = screen.cell(*baddr).cs;
                    screen.add(*baddr, pair[0], cs);
                    *baddr = screen.inc(*baddr);
                    let cs = screen.cell(*baddr).cs;
                    screen.add(*baddr, pair[1], cs);
                    if !no_si {
                        *baddr = screen.inc(*baddr);
                        let cs = screen.cell(*baddr).cs;
                        screen.add(*baddr, EBC_SI, cs);
                    }
                    return Some(true);
                }
                DbcsState::Dead | DbcsState::So => return Some(false),
                DbcsState::None => {
                    let ic = faddr.map_or(false, |f| screen.cell(f).ic);
                    if ic {
                        let mut extend_left = false;
                        if self.insert {
                            self.ins_prep(screen, *baddr, 4)?;
                        } else {
                            let mut xaddr = *baddr;
                            if screen.cell(xaddr).cc == EBC_SO {
                                // Already an SO where ours would go; retry one to the right
                                *baddr = screen.inc(*baddr);
                                continue;
                            }
                            xaddr = screen.inc(xaddr);
                            if screen.cell(xaddr).is_fa() {
                                return Some(false);
                            }
                            if screen.cell(xaddr).cc == EBC_SO {
                                // Extend the following subfield to the left if there is room
                                xaddr = screen.dec(screen.dec(xaddr));
                                let e = screen.dbcs_state(xaddr);
                                if e == DbcsState::None || e == DbcsState::Sb {
                                    extend_left = true;
                                    no_si = true;
                                } else {
                                    return Some(false);
                                }
                            }
                            xaddr = screen.inc(xaddr);
                            if screen.cell(xaddr).is_fa() {
                                return Some(false);
                            }
                            if screen.cell(xaddr).cc == EBC_SO {
                                no_si = true;
                            }
                            if !no_si {
                                xaddr = screen.inc(xaddr);
                                if screen.cell(xaddr).is_fa() || screen.cell(xaddr).cc == EBC_SO {
                                    return Some(false);
                                }
                            }
                        }
                        if extend_left {
                            *baddr = screen.dec(*baddr);
                        }
                        let cs = screen.cell(*baddr).cs;
                        screen.add(*baddr, EBC_SO, cs);
                        *baddr = screen.inc(*baddr);
                        let cs = screen.cell(*baddr).cs;
                        screen.add(*baddr, pair[0], cs);
                        *baddr = screen.inc(*baddr);
                        let cs = screen.cell(*baddr).cs;
                        screen.add(*baddr, pair[1], cs);
                        if !no_si {
                            *baddr = screen.inc(*baddr);
                            let cs = screen.cell(*baddr).cs;
                            screen.add(*baddr, EBC_SI, cs);
                        }
                        return Some(true);
                    } else if screen.reply_mode() == ReplyMode::Character {
                        // Use the character attribute
                        if self.insert {
                            self.ins_prep(screen, *baddr, 2)?;
                        } else if screen.cell(screen.inc(*baddr)).is_fa() {
                            return Some(false);
                        }
                        screen.add(*baddr, pair[0], CharSet::Dbcs);
                        *baddr = screen.inc(*baddr);
                        screen.add(*baddr, pair[1], CharSet::Dbcs);
                        *baddr = screen.inc(*baddr);
                        return Some(true);
                    }
                    return Some(false);
                }
            }
        }
        Some(false)
    }

    /// Type a Unicode character: EBCDIC in 3270 mode, UTF-8 in NVT mode
    pub fn key_ucharacter(&mut self, screen: &mut ScreenBuffer, ch: char) {
        if self.is_locked() {
            self.enq_ta(Deferred::Action(Action::Key(ch)));
            return;
        }
        trace!(" -> Key(U+{:04x})", ch as u32);
        if self.cstate.in_3270() {
            if (ch as u32) < 0x20 {
                trace!("  dropped (control char)");
                return;
            }
            match unicode_to_ebcdic(ch) {
                Some(ebc) if ebc != 0 => {
                    self.key_character(screen, ebc, false, false);
                }
                _ => trace!("  dropped (no EBCDIC translation)"),
            }
        } else if self.cstate.in_ansi() {
            let mut buf = [0u8; 4];
            self.send_nvt(ch.encode_utf8(&mut buf).as_bytes().to_vec());
        } else {
            let why = match self.cstate {
                ConnectionState::NotConnected => "connected",
                ConnectionState::ConnectedInitialE => "bound",
                _ => "negotiated",
            };
            trace!("  dropped (not {why})");
        }
    }

    fn dup(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::Dup) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        if self.key_character(screen, EBC_DUP, false, false) {
            let next = screen.next_unprotected(screen.cursor());
            screen.set_cursor(next);
        }
        true
    }

    fn field_mark(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::FieldMark) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        self.key_character(screen, EBC_FM, false, false);
        true
    }

    // Cursor motion

    fn tab(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Tab) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(b"\t".to_vec());
            return true;
        }
        let next = screen.next_unprotected(screen.cursor());
        screen.set_cursor(next);
        true
    }

    fn backtab(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::BackTab) {
            return true;
        }
        if !self.cstate.in_3270() {
            return false;
        }
        let mut baddr = screen.dec(screen.cursor());
        // At the front of a field: skip its attribute
        if screen.cell(baddr).is_fa() {
            baddr = screen.dec(baddr);
        }
        let sbaddr = baddr;
        loop {
            let nbaddr = screen.inc(baddr);
            let cell = screen.cell(baddr);
            if cell.is_fa() && !field::is_protected(cell.fa) && !screen.cell(nbaddr).is_fa() {
                break;
            }
            baddr = screen.dec(baddr);
            if baddr == sbaddr {
                screen.set_cursor(0);
                return true;
            }
        }
        screen.set_cursor(screen.inc(baddr));
        true
    }

    fn home(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::Home) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(ansi_processor::nvt_home());
            return true;
        }
        if !screen.formatted() {
            screen.set_cursor(0);
            return true;
        }
        let first = screen.next_unprotected(screen.len() - 1);
        screen.set_cursor(first);
        true
    }

    /// One position left, stepping over both halves of a DBCS character
    fn do_left(screen: &mut ScreenBuffer) {
        let mut baddr = screen.dec(screen.cursor());
        let d = screen.dbcs_state(baddr);
        if d.is_right() {
            baddr = screen.dec(baddr);
        } else if d.is_left() {
            baddr = screen.dec(baddr);
            if screen.dbcs_state(baddr).is_right() {
                baddr = screen.dec(baddr);
            }
        }
        screen.set_cursor(baddr);
    }

    fn left(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Left) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(ansi_processor::nvt_cursor_key(CursorKey::Left, self.app_cursor));
            return true;
        }
        Self::do_left(screen);
        true
    }

    fn right(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Right) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(ansi_processor::nvt_cursor_key(CursorKey::Right, self.app_cursor));
            return true;
        }
        let mut baddr = screen.inc(screen.cursor());
        if screen.dbcs_state(baddr).is_right() {
            baddr = screen.inc(baddr);
        }
        screen.set_cursor(baddr);
        true
    }

    fn left2(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Left2) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        let mut baddr = screen.cursor();
        for _ in 0..2 {
            baddr = screen.dec(baddr);
            if screen.dbcs_state(baddr).is_left() {
                baddr = screen.dec(baddr);
            }
        }
        screen.set_cursor(baddr);
        true
    }

    fn right2(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Right2) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        let mut baddr = screen.cursor();
        for _ in 0..2 {
            baddr = screen.inc(baddr);
            if screen.dbcs_state(baddr).is_right() {
                baddr = screen.inc(baddr);
            }
        }
        screen.set_cursor(baddr);
        true
    }

    fn up(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Up) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(ansi_processor::nvt_cursor_key(CursorKey::Up, self.app_cursor));
            return true;
        }
        let cursor = screen.cursor();
        let cols = screen.cols();
        let baddr = if cursor < cols { cursor + screen.len() - cols } else { cursor - cols };
        screen.set_cursor(baddr);
        true
    }

    fn down(&mut self, screen: &mut ScreenBuffer) -> bool {
        if !self.motion_allowed(Action::Down) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(ansi_processor::nvt_cursor_key(CursorKey::Down, self.app_cursor));
            return true;
        }
        let baddr = (screen.cursor() + screen.cols()) % screen.len();
        screen.set_cursor(baddr);
        true
    }

    /// First unprotected position on the next line, or the next field
    fn newline(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::Newline) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(b"\n".to_vec());
            return true;
        }
        let down = (screen.cursor() + screen.cols()) % screen.len();
        let baddr = screen.address(screen.row_of(down), 0);
        let faddr = screen.find_field_attribute(baddr);
        let fa = screen.get_field_attribute(baddr);
        if faddr != Some(baddr) && !field::is_protected(fa) {
            screen.set_cursor(baddr);
        } else {
            let next = screen.next_unprotected(baddr);
            screen.set_cursor(next);
        }
        true
    }

    fn is_blank(cc: u8) -> bool {
        cc == EBC_SPACE || cc == EBC_NULL
    }

    fn previous_word(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::PreviousWord) {
            return true;
        }
        if self.cstate.in_ansi() || !screen.formatted() {
            return false;
        }
        let cursor = screen.cursor();
        let mut baddr = cursor;
        let mut prot = field::is_protected(screen.get_field_attribute(baddr));

        // Skip to before this word, if in one now
        if !prot {
            while !screen.cell(baddr).is_fa() && !Self::is_blank(screen.cell(baddr).cc) {
                baddr = screen.dec(baddr);
                if baddr == cursor {
                    return true;
                }
            }
        }
        let baddr0 = baddr;

        // Find the end of the preceding word
        loop {
            let cell = *screen.cell(baddr);
            if cell.is_fa() {
                baddr = screen.dec(baddr);
                prot = field::is_protected(screen.get_field_attribute(baddr));
            } else if !prot && !Self::is_blank(cell.cc) {
                break;
            } else {
                baddr = screen.dec(baddr);
            }
            if baddr == baddr0 {
                return true;
            }
        }

        // Go to its front
        loop {
            baddr = screen.dec(baddr);
            let cell = screen.cell(baddr);
            if cell.is_fa() || Self::is_blank(cell.cc) {
                break;
            }
        }
        screen.set_cursor(screen.inc(baddr));
        true
    }

    /// Next unprotected word
    fn nu_word(screen: &ScreenBuffer, baddr0: usize) -> Option<usize> {
        let mut baddr = baddr0;
        let mut prot = field::is_protected(screen.get_field_attribute(baddr));
        loop {
            let cell = screen.cell(baddr);
            if cell.is_fa() {
                prot = field::is_protected(cell.fa);
            } else if !prot && !Self::is_blank(cell.cc) {
                return Some(baddr);
            }
            baddr = screen.inc(baddr);
            if baddr == baddr0 {
                return None;
            }
        }
    }

    /// Next word in this field
    fn nt_word(screen: &ScreenBuffer, baddr0: usize) -> Option<usize> {
        let mut baddr = baddr0;
        let mut in_word = true;
        loop {
            let cell = screen.cell(baddr);
            if cell.is_fa() {
                return None;
            }
            if in_word {
                if Self::is_blank(cell.cc) {
                    in_word = false;
                }
            } else if !Self::is_blank(cell.cc) {
                return Some(baddr);
            }
            baddr = screen.inc(baddr);
            if baddr == baddr0 {
                return None;
            }
        }
    }

    fn next_word(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::NextWord) {
            return true;
        }
        if self.cstate.in_ansi() || !screen.formatted() {
            return false;
        }
        let cursor = screen.cursor();

        // Not in an unprotected field: go to the next unprotected word
        if screen.cell(cursor).is_fa() || field::is_protected(screen.get_field_attribute(cursor)) {
            if let Some(baddr) = Self::nu_word(screen, cursor) {
                screen.set_cursor(baddr);
            }
            return true;
        }

        if let Some(baddr) = Self::nt_word(screen, cursor) {
            screen.set_cursor(baddr);
            return true;
        }

        if !Self::is_blank(screen.cell(cursor).cc) {
            // In a word: go to just after its end
            let mut baddr = cursor;
            loop {
                let cell = screen.cell(baddr);
                if Self::is_blank(cell.cc) {
                    screen.set_cursor(baddr);
                    return true;
                } else if cell.is_fa() {
                    if let Some(next) = Self::nu_word(screen, baddr) {
                        screen.set_cursor(next);
                    }
                    return true;
                }
                baddr = screen.inc(baddr);
                if baddr == cursor {
                    return true;
                }
            }
        } else if let Some(baddr) = Self::nu_word(screen, cursor) {
            screen.set_cursor(baddr);
        }
        true
    }

    /// Just past the last non-blank in the field, or its last position when
    /// the field is full
    fn field_end(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::FieldEnd) {
            return true;
        }
        if self.cstate.in_ansi() || !screen.formatted() {
            return false;
        }
        let cursor = screen.cursor();
        let Some(faddr) = screen.find_field_attribute(cursor) else {
            return false;
        };
        if faddr == cursor || field::is_protected(screen.cell(faddr).fa) {
            return true;
        }

        let mut last_nonblank = None;
        let mut baddr = faddr;
        loop {
            baddr = screen.inc(baddr);
            let cell = screen.cell(baddr);
            if cell.is_fa() {
                break;
            }
            if !Self::is_blank(cell.cc) {
                last_nonblank = Some(baddr);
            }
        }

        let target = match last_nonblank {
            None => screen.inc(faddr),
            Some(last) => {
                let next = screen.inc(last);
                if screen.cell(next).is_fa() {
                    last
                } else {
                    next
                }
            }
        };
        screen.set_cursor(target);
        true
    }

    fn move_cursor(&mut self, screen: &mut ScreenBuffer, row: usize, col: usize) -> bool {
        if self.queue_if_locked(Action::MoveCursor { row, col }) {
            return true;
        }
        // NVT coordinates are 1-based
        let (row, col) = if self.cstate.in_3270() {
            (row, col)
        } else {
            (row.saturating_sub(1), col.saturating_sub(1))
        };
        let baddr = (row * screen.cols() + col) % screen.len();
        screen.set_cursor(baddr);
        true
    }

    // Deletion

    /// Delete the character at the cursor, shifting the rest of the field
    /// left and NUL-filling its end
    fn do_delete(&mut self, screen: &mut ScreenBuffer) -> bool {
        let mut baddr = screen.cursor();
        let fa = screen.get_field_attribute(baddr);
        if field::is_protected(fa) || screen.cell(baddr).is_fa() {
            self.operator_error(OperatorErrorKind::Protected);
            return false;
        }

        let cc = screen.cell(baddr).cc;
        let ndel = if cc == EBC_SO || cc == EBC_SI {
            // SO and SI only go together with their opposite
            let opposite = if cc == EBC_SO { EBC_SI } else { EBC_SO };
            if screen.cell(screen.inc(baddr)).cc == opposite {
                2
            } else {
                self.operator_error(OperatorErrorKind::Protected);
                return false;
            }
        } else if screen.dbcs_state(baddr).is_dbcs() {
            if screen.dbcs_state(baddr).is_right() {
                baddr = screen.dec(baddr);
            }
            2
        } else {
            1
        };

        let len = screen.len();
        let end_baddr = if screen.formatted() {
            let mut end = baddr;
            loop {
                end = screen.inc(end);
                if screen.cell(end).is_fa() || end == baddr {
                    break;
                }
            }
            screen.dec(end)
        } else {
            let cols = screen.cols();
            if baddr % cols == cols - ndel {
                return true;
            }
            baddr + (cols - baddr % cols) - 1
        };

        // Shift the remainder of the field left
        if end_baddr > baddr {
            let count = (end_baddr + 1).saturating_sub(baddr + ndel);
            if count > 0 {
                screen.wrapping_memmove(baddr, baddr + ndel, count);
            }
        } else if end_baddr != baddr {
            // The field wraps past the end of the buffer
            let head = len.saturating_sub(baddr + ndel);
            screen.wrapping_memmove(baddr, baddr + ndel, head);
            screen.wrapping_memmove(len - ndel, 0, ndel);
            if end_baddr + 1 > ndel {
                screen.wrapping_memmove(0, ndel, end_baddr + 1 - ndel);
            }
        }

        for i in 0..ndel {
            let addr = screen.offset(end_baddr, -(i as isize));
            screen.add(addr, EBC_NULL, CharSet::Base);
        }

        screen.mdt_set(screen.cursor());
        screen.dbcs_postprocess();
        true
    }

    fn delete(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::Delete) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(vec![0x7F]);
            return true;
        }
        if !self.do_delete(screen) {
            return true;
        }
        if self.reverse {
            let baddr = screen.dec(screen.cursor());
            if !screen.cell(baddr).is_fa() {
                screen.set_cursor(baddr);
            }
        }
        true
    }

    /// 3270-style backspace: cursor left, nothing erased
    fn backspace(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::BackSpace) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(vec![0x08]);
            return true;
        }
        if self.reverse {
            self.do_delete(screen);
        } else {
            Self::do_left(screen);
        }
        true
    }

    /// Destructive backspace
    fn do_erase(&mut self, screen: &mut ScreenBuffer) {
        let baddr = screen.cursor();
        let faddr = screen.find_field_attribute(baddr);
        if faddr == Some(baddr) || field::is_protected(screen.get_field_attribute(baddr)) {
            self.operator_error(OperatorErrorKind::Protected);
            return;
        }
        if faddr == Some(screen.dec(baddr)) {
            return;
        }
        Self::do_left(screen);

        // Now on an SI: move left again
        if screen.cell(screen.cursor()).cc == EBC_SI {
            screen.set_cursor(screen.dec(screen.cursor()));
        }
        // On the right half of a DBCS character: move to its left half
        if screen.lookleft_state(screen.cursor()).0.is_right() {
            screen.set_cursor(screen.dec(screen.cursor()));
        }

        if !self.do_delete(screen) {
            return;
        }

        // Erased the last character of a subfield: remove the SO/SI too
        let baddr = screen.dec(screen.cursor());
        if screen.cell(baddr).cc == EBC_SO && screen.cell(screen.cursor()).cc == EBC_SI {
            screen.set_cursor(baddr);
            self.do_delete(screen);
        }
    }

    fn erase(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::Erase) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(vec![0x7F]);
            return true;
        }
        if self.reverse {
            self.do_delete(screen);
        } else {
            self.do_erase(screen);
        }
        true
    }

    fn erase_eof(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::EraseEOF) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        let cursor = screen.cursor();
        let fa = screen.get_field_attribute(cursor);
        if field::is_protected(fa) || screen.cell(cursor).is_fa() {
            self.operator_error(OperatorErrorKind::Protected);
            return false;
        }
        let mut baddr = cursor;
        if screen.formatted() {
            // Erase to the next field attribute
            loop {
                screen.add(baddr, EBC_NULL, CharSet::Base);
                baddr = screen.inc(baddr);
                if screen.cell(baddr).is_fa() {
                    break;
                }
            }
            screen.mdt_set(cursor);
        } else {
            // Erase to the end of the screen
            loop {
                screen.add(baddr, EBC_NULL, CharSet::Base);
                baddr = screen.inc(baddr);
                if baddr == 0 {
                    break;
                }
            }
        }

        // Inside a DBCS subfield: re-create the SI
        let (d, why) = screen.lookleft_state(cursor);
        if d.is_dbcs() && why == DbcsWhy::Subfield {
            let si = if d == DbcsState::Right { screen.dec(cursor) } else { cursor };
            screen.cell_mut(si).cc = EBC_SI;
        }
        screen.dbcs_postprocess();
        true
    }

    fn erase_input(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::EraseInput) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        if !screen.formatted() {
            screen.clear();
            screen.set_cursor(0);
            return true;
        }

        let Some(sbaddr) = (0..screen.len()).find(|&a| screen.cell(a).is_fa()) else {
            return true;
        };
        let mut baddr = sbaddr;
        let mut moved = false;
        loop {
            let fa = screen.cell(baddr).fa;
            if !field::is_protected(fa) {
                screen.mdt_clear(baddr);
                loop {
                    baddr = screen.inc(baddr);
                    if !moved {
                        screen.set_cursor(baddr);
                        moved = true;
                    }
                    if screen.cell(baddr).is_fa() {
                        break;
                    }
                    screen.add(baddr, EBC_NULL, CharSet::Base);
                }
            } else {
                loop {
                    baddr = screen.inc(baddr);
                    if screen.cell(baddr).is_fa() {
                        break;
                    }
                }
            }
            if baddr == sbaddr {
                break;
            }
        }
        if !moved {
            screen.set_cursor(0);
        }
        true
    }

    /// ^W: erase back to the start of the previous word
    fn delete_word(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::DeleteWord) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(vec![0x17]);
            return true;
        }
        if !screen.formatted() {
            return false;
        }
        let cursor = screen.cursor();
        if field::is_protected(screen.get_field_attribute(cursor)) || screen.cell(cursor).is_fa() {
            self.operator_error(OperatorErrorKind::Protected);
            return false;
        }

        // Backspace over blanks to the left of the cursor, then over the word
        for want_blank in [true, false] {
            for _ in 0..screen.len() {
                let baddr = screen.dec(screen.cursor());
                let cell = screen.cell(baddr);
                if cell.is_fa() {
                    return true;
                }
                if Self::is_blank(cell.cc) != want_blank {
                    break;
                }
                self.do_erase(screen);
            }
        }
        true
    }

    /// ^U: erase the whole field and go to its start
    fn delete_field(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::DeleteField) {
            return true;
        }
        if self.cstate.in_ansi() {
            self.send_nvt(vec![0x15]);
            return true;
        }
        if !screen.formatted() {
            return false;
        }
        let cursor = screen.cursor();
        if field::is_protected(screen.get_field_attribute(cursor)) || screen.cell(cursor).is_fa() {
            self.operator_error(OperatorErrorKind::Protected);
            return false;
        }
        let mut baddr = cursor;
        while !screen.cell(baddr).is_fa() {
            baddr = screen.dec(baddr);
        }
        baddr = screen.inc(baddr);
        screen.mdt_set(cursor);
        screen.set_cursor(baddr);
        while !screen.cell(baddr).is_fa() {
            screen.add(baddr, EBC_NULL, CharSet::Base);
            baddr = screen.inc(baddr);
        }
        true
    }

    // Modes

    fn set_insert(&mut self, action: Action, on: Option<bool>) -> bool {
        if self.queue_if_locked(action) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        self.insert = on.unwrap_or(!self.insert);
        true
    }

    fn toggle_reverse(&mut self, screen: &ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::ToggleReverse) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        // Reverse input is not available with DBCS
        if !screen.dbcs() {
            self.reverse = !self.reverse;
        }
        true
    }

    /// Lock or unlock the keyboard while the display is scrolled back
    pub fn scroll_lock(&mut self, lock: bool) {
        if !self.cstate.in_3270() {
            return;
        }
        if lock {
            self.lock_set(KL_SCROLLED, "kybd_scroll_lock");
        } else {
            self.lock_clr(KL_SCROLLED, "kybd_scroll_lock");
        }
    }

    // Light pen

    fn cursor_select(&mut self, screen: &mut ScreenBuffer) -> bool {
        if self.queue_if_locked(Action::CursorSelect) {
            return true;
        }
        if self.cstate.in_ansi() {
            return false;
        }
        self.lightpen_select(screen, screen.cursor());
        true
    }

    /// Select the light-pen detectable field containing `baddr`
    pub fn lightpen_select(&mut self, screen: &mut ScreenBuffer, baddr: usize) {
        let Some(faddr) = screen.find_field_attribute(baddr) else {
            self.ring_bell();
            return;
        };
        if !field::is_selectable(screen.cell(faddr).fa) {
            self.ring_bell();
            return;
        }
        let designator = screen.inc(faddr);

        if screen.dbcs() && screen.cell(baddr).cs == CharSet::Dbcs {
            let designator2 = screen.inc(designator);
            let d1 = *screen.cell(designator);
            let d2 = *screen.cell(designator2);
            if !d1.db.is_left() && !d2.db.is_right() {
                self.ring_bell();
                return;
            }
            match (d1.cc, d2.cc) {
                (0x42, EBC_GREATER) => {
                    screen.add(designator2, EBC_QUESTION, CharSet::Dbcs);
                    screen.mdt_clear(faddr);
                }
                (0x42, EBC_QUESTION) => {
                    screen.add(designator2, EBC_GREATER, CharSet::Dbcs);
                    screen.mdt_clear(faddr);
                }
                (EBC_SPACE, EBC_SPACE) | (EBC_NULL, EBC_NULL) => {
                    screen.add(designator2, EBC_GREATER, CharSet::Dbcs);
                    screen.mdt_set(faddr);
                    self.key_aid(screen, AID_SELECT);
                }
                (0x42, EBC_AMPERSAND) => {
                    screen.mdt_set(faddr);
                    self.key_aid(screen, AID_ENTER);
                }
                _ => self.ring_bell(),
            }
            return;
        }

        match screen.cell(designator).cc {
            EBC_GREATER => {
                screen.add(designator, EBC_QUESTION, CharSet::Base);
                screen.mdt_clear(faddr);
            }
            EBC_QUESTION => {
                screen.add(designator, EBC_GREATER, CharSet::Base);
                screen.mdt_set(faddr);
            }
            EBC_SPACE | EBC_NULL => {
                screen.mdt_set(faddr);
                self.key_aid(screen, AID_SELECT);
            }
            EBC_AMPERSAND => {
                screen.mdt_set(faddr);
                self.key_aid(screen, AID_ENTER);
            }
            _ => self.ring_bell(),
        }
    }

    // String input

    fn string(&mut self, screen: &mut ScreenBuffer, s: &str) -> bool {
        if s.is_empty() {
            return true;
        }
        if self.queue_if_locked(Action::String(s.to_string())) {
            return true;
        }
        let chars: Vec<char> = s.chars().collect();
        let left = self.emulate_input(screen, &chars);
        if left > 0 {
            self.pending = Some(chars[chars.len() - left..].to_vec());
        }
        true
    }

    /// PF key from String input
    fn do_pf(&mut self, screen: &mut ScreenBuffer, n: usize) {
        if !(1..=PF_AIDS.len()).contains(&n) {
            warn!("Unknown PF key {n}");
            return;
        }
        if !self.queue_if_locked(Action::PF(n as u8)) {
            self.key_aid(screen, PF_AIDS[n - 1]);
        }
    }

    /// PA key from String input
    fn do_pa(&mut self, screen: &mut ScreenBuffer, n: usize) {
        if !(1..=PA_AIDS.len()).contains(&n) {
            warn!("Unknown PA key {n}");
            return;
        }
        if !self.queue_if_locked(Action::PA(n as u8)) {
            self.key_aid(screen, PA_AIDS[n - 1]);
        }
    }

    fn key_literal(&mut self, screen: &mut ScreenBuffer, literal: u32) {
        match char::from_u32(literal) {
            Some(ch) => self.key_ucharacter(screen, ch),
            None => warn!("String: invalid character U+{literal:04X}"),
        }
    }

    fn key_ebcdic_literal(&mut self, screen: &mut ScreenBuffer, literal: u32) {
        trace!(" String -> Key(X'{literal:02X}')");
        if literal & !0xff == 0 {
            self.key_character(screen, literal as u8, false, true);
        } else {
            self.key_wcharacter(screen, [(literal >> 8) as u8, literal as u8]);
        }
    }

    /// Feed `input` through the String escape grammar. Returns how many
    /// characters are left unprocessed: nonzero when an AID stopped input
    /// in 3270 mode, zero when everything ran or the keyboard locked.
    pub fn emulate_input(&mut self, screen: &mut ScreenBuffer, input: &[char]) -> usize {
        let mut state = StringState::Base;
        let mut literal: u32 = 0;
        let mut nc = 0;
        let mut i = 0;

        while i < input.len() {
            // It isn't possible to unlock the keyboard from a string
            if self.is_locked() {
                debug!("  keyboard locked, string dropped");
                return 0;
            }
            let remaining = input.len() - i;
            let c = input[i];

            match state {
                StringState::Base => match c {
                    '\u{8}' => {
                        self.run_action(screen, Action::Left);
                    }
                    '\u{c}' => {
                        self.run_action(screen, Action::Clear);
                        if self.cstate.in_3270() {
                            return remaining - 1;
                        }
                    }
                    '\n' => {
                        self.run_action(screen, Action::Enter);
                        if self.cstate.in_3270() {
                            return remaining - 1;
                        }
                    }
                    '\r' => {
                        self.run_action(screen, Action::Newline);
                    }
                    '\t' => {
                        self.run_action(screen, Action::Tab);
                    }
                    '\\' => state = StringState::Backslash,
                    _ => self.key_ucharacter(screen, c),
                },
                StringState::Backslash => {
                    match c {
                        'a' => {
                            warn!("String: Bell not supported");
                            state = StringState::Base;
                        }
                        'b' => {
                            self.run_action(screen, Action::Left);
                            state = StringState::Base;
                        }
                        'f' => {
                            self.run_action(screen, Action::Clear);
                            state = StringState::Base;
                            if self.cstate.in_3270() {
                                return remaining - 1;
                            }
                        }
                        'n' => {
                            self.run_action(screen, Action::Enter);
                            state = StringState::Base;
                            if self.cstate.in_3270() {
                                return remaining - 1;
                            }
                        }
                        'p' => state = StringState::BackP,
                        'r' => {
                            self.run_action(screen, Action::Newline);
                            state = StringState::Base;
                        }
                        't' => {
                            self.run_action(screen, Action::Tab);
                            state = StringState::Base;
                        }
                        'T' => {
                            self.run_action(screen, Action::BackTab);
                            state = StringState::Base;
                        }
                        'v' => {
                            warn!("String: Vertical tab not supported");
                            state = StringState::Base;
                        }
                        'u' | 'x' => state = StringState::BackX,
                        'e' => state = StringState::BackE,
                        '\\' => {
                            self.key_ucharacter(screen, c);
                            state = StringState::Base;
                        }
                        '0'..='7' => {
                            state = StringState::Octal;
                            literal = 0;
                            nc = 0;
                            continue;
                        }
                        _ => {
                            state = StringState::Base;
                            continue;
                        }
                    }
                }
                StringState::BackP => {
                    match c {
                        'a' => state = StringState::BackPa,
                        'f' => state = StringState::BackPf,
                        _ => {
                            warn!("String: Unknown character after \\p");
                            state = StringState::Base;
                        }
                    }
                    literal = 0;
                    nc = 0;
                }
                StringState::BackPf | StringState::BackPa => {
                    let max_digits = if state == StringState::BackPf { 2 } else { 1 };
                    if nc < max_digits && c.is_ascii_digit() {
                        literal = literal * 10 + c.to_digit(10).unwrap_or(0);
                        nc += 1;
                    } else if nc == 0 {
                        warn!(
                            "String: Unknown character after \\p{}",
                            if state == StringState::BackPf { "f" } else { "a" }
                        );
                        state = StringState::Base;
                    } else {
                        if state == StringState::BackPf {
                            self.do_pf(screen, literal as usize);
                        } else {
                            self.do_pa(screen, literal as usize);
                        }
                        if self.cstate.in_3270() {
                            return remaining;
                        }
                        state = StringState::Base;
                        continue;
                    }
                }
                StringState::BackX | StringState::BackE => {
                    if c.is_ascii_hexdigit() {
                        state = if state == StringState::BackX { StringState::Hex } else { StringState::Ebc };
                        literal = 0;
                        nc = 0;
                    } else {
                        warn!(
                            "String: Missing hex digits after \\{}",
                            if state == StringState::BackX { "x" } else { "e" }
                        );
                        state = StringState::Base;
                    }
                    continue;
                }
                StringState::Octal => {
                    if nc < 3 && c.is_digit(8) {
                        literal = literal * 8 + c.to_digit(8).unwrap_or(0);
                        nc += 1;
                    } else {
                        self.key_literal(screen, literal);
                        state = StringState::Base;
                        continue;
                    }
                }
                StringState::Hex | StringState::Ebc => {
                    if nc < 4 && c.is_ascii_hexdigit() {
                        literal = literal * 16 + c.to_digit(16).unwrap_or(0);
                        nc += 1;
                    } else {
                        if state == StringState::Hex {
                            self.key_literal(screen, literal);
                        } else {
                            self.key_ebcdic_literal(screen, literal);
                        }
                        state = StringState::Base;
                        continue;
                    }
                }
            }
            i += 1;
        }

        match state {
            StringState::Base => {}
            StringState::Octal | StringState::Hex => self.key_literal(screen, literal),
            StringState::Ebc => self.key_ebcdic_literal(screen, literal),
            StringState::BackPf if nc > 0 => self.do_pf(screen, literal as usize),
            StringState::BackPa if nc > 0 => self.do_pa(screen, literal as usize),
            _ => warn!("String: Missing data after \\"),
        }
        0
    }

    /// Hexadecimal input: EBCDIC in 3270 mode (`\E` marks a graphic
    /// escape), raw bytes in NVT mode
    fn hex_string(&mut self, screen: &mut ScreenBuffer, s: &str) -> bool {
        let s = s
            .split_whitespace()
            .map(|t| t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t))
            .collect::<String>();
        if s.is_empty() {
            return true;
        }
        let bytes = s.as_bytes();
        if bytes.len() % 2 != 0 {
            warn!("HexString: Odd number of characters");
            return false;
        }

        // Validate first so nothing is typed from a bad string
        let mut items: Vec<(u8, bool)> = Vec::new();
        let mut escaped = false;
        for chunk in bytes.chunks(2) {
            match chunk {
                [b'\\', b'E'] | [b'\\', b'e'] => {
                    if escaped {
                        warn!("HexString: Double \\E");
                        return false;
                    }
                    if !self.cstate.in_3270() {
                        warn!("HexString: \\E in NVT mode");
                        return false;
                    }
                    escaped = true;
                }
                [hi, lo] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                    let text = std::str::from_utf8(chunk).unwrap_or("00");
                    let value = u8::from_str_radix(text, 16).unwrap_or(0);
                    items.push((value, escaped));
                    escaped = false;
                }
                _ => {
                    warn!("HexString: Illegal character");
                    return false;
                }
            }
        }
        if escaped {
            warn!("HexString: Nothing follows \\E");
            return false;
        }

        if self.cstate.in_3270() {
            for (value, ge) in items {
                self.key_character(screen, value, ge, true);
            }
        } else if !items.is_empty() {
            self.send_nvt(items.into_iter().map(|(v, _)| v).collect());
        }
        true
    }

    /// Prepare the current input field for command entry: move to the
    /// start of an unprotected field and clear it. Returns the usable
    /// length, or 0 when there is nowhere to type.
    pub fn kybd_prime(&mut self, screen: &mut ScreenBuffer) -> usize {
        if self.is_locked() || !self.cstate.in_3270() {
            return 0;
        }

        let cursor = screen.cursor();
        let mut len: usize = 0;

        // Unformatted: use the NULs and blanks from the cursor on, leaving
        // one to delimit the command
        if !screen.formatted() {
            let mut baddr = cursor;
            while Self::is_blank(screen.cell(baddr).cc) {
                len += 1;
                baddr = screen.inc(baddr);
                if baddr == cursor {
                    break;
                }
            }
            return len.saturating_sub(1);
        }

        let fa = screen.get_field_attribute(cursor);
        let mut baddr = if screen.cell(cursor).is_fa() || field::is_protected(fa) {
            match screen.next_unprotected(cursor) {
                0 => return 0,
                next => next,
            }
        } else {
            let mut b = cursor;
            while !screen.cell(b).is_fa() {
                b = screen.dec(b);
            }
            screen.inc(b)
        };

        screen.set_cursor(baddr);
        while !screen.cell(baddr).is_fa() {
            screen.add(baddr, EBC_NULL, CharSet::Base);
            len += 1;
            baddr = screen.inc(baddr);
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebcdic::string_to_ebcdic;
    use crate::lib3270::display::ScreenSize;

    /// Protected label at 0, input field 11..=19, protected field from 20
    fn form() -> ScreenBuffer {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        screen.add_fa(0, FA_PROTECT, CharSet::Base);
        screen.add_fa(10, 0, CharSet::Base);
        screen.add_fa(20, FA_PROTECT, CharSet::Base);
        screen.set_cursor(11);
        screen
    }

    fn unlocked(options: KeyboardOptions) -> Keyboard {
        let mut kbd = Keyboard::new(options);
        kbd.set_state(ConnectionState::Connected3270, false);
        kbd.connect(true);
        kbd.host_write(&HostWrite { restore: true, alarm: false });
        assert!(!kbd.is_locked());
        kbd
    }

    fn type_text(kbd: &mut Keyboard, screen: &mut ScreenBuffer, text: &str) {
        for ch in text.chars() {
            kbd.key_ucharacter(screen, ch);
        }
    }

    #[test]
    fn test_lock_bits_round_trip_and_decode() {
        let lock = KeyboardLock {
            oerr: Some(OperatorErrorKind::Numeric),
            twait: true,
            locked: true,
            ..KeyboardLock::default()
        };
        let bits = lock.to_bits();
        assert_eq!(bits, 0x2 | KL_OIA_TWAIT | KL_OIA_LOCKED);
        assert_eq!(KeyboardLock::from_bits(bits), lock);
        assert_eq!(
            KeyboardLock::decode("+", bits),
            "+OERR(NUMERIC) +OIA_TWAIT +OIA_LOCKED"
        );
        assert_eq!(KeyboardLock::decode("-", KL_ALL), "all");
        assert!(!lock.is_oerr_only());
        assert!(KeyboardLock::from_bits(0x1).is_oerr_only());
    }

    #[test]
    fn test_connect_sets_awaiting_first() {
        let mut kbd = Keyboard::new(KeyboardOptions::default());
        assert!(kbd.lock().not_connected);
        kbd.set_state(ConnectionState::ConnectedInitial, false);
        kbd.connect(true);
        assert_eq!(kbd.lock().to_bits(), KL_AWAITING_FIRST);
    }

    #[test]
    fn test_first_host_write_clears_awaiting_first_only() {
        let mut kbd = Keyboard::new(KeyboardOptions::default());
        kbd.set_state(ConnectionState::Connected3270, false);
        kbd.connect(true);
        kbd.host_write(&HostWrite::default());
        assert_eq!(kbd.lock().to_bits(), 0);
    }

    #[test]
    fn test_typing_into_unprotected_field() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "AB");
        assert_eq!(screen.cell(11).cc, 0xC1);
        assert_eq!(screen.cell(12).cc, 0xC2);
        assert_eq!(screen.cursor(), 13);
        assert!(field::is_modified(screen.cell(10).fa));
    }

    #[test]
    fn test_protected_field_operator_error() {
        let mut screen = form();
        screen.set_cursor(5);
        let mut kbd = unlocked(KeyboardOptions::default());
        assert!(!kbd.key_character(&mut screen, 0xC1, false, false));
        assert_eq!(kbd.lock().oerr, Some(OperatorErrorKind::Protected));

        // Further typing is dropped with a bell, not queued
        kbd.key_ucharacter(&mut screen, 'X');
        assert_eq!(kbd.typeahead_len(), 0);
        assert_eq!(kbd.bells(), 1);

        // Tab clears the error and moves on
        assert!(kbd.run_action(&mut screen, Action::Tab));
        assert!(!kbd.is_locked());
        assert_eq!(screen.cursor(), 11);
    }

    #[test]
    fn test_operator_error_rings_bell_without_oerr_lock() {
        let mut screen = form();
        screen.set_cursor(5);
        let mut kbd = unlocked(KeyboardOptions {
            oerr_lock: false,
            ..KeyboardOptions::default()
        });
        kbd.key_ucharacter(&mut screen, 'A');
        assert!(!kbd.is_locked());
        assert_eq!(kbd.bells(), 1);
    }

    #[test]
    fn test_numeric_lock() {
        let mut screen = form();
        screen.add_fa(10, FA_NUMERIC, CharSet::Base);
        let mut kbd = unlocked(KeyboardOptions {
            numeric_lock: true,
            ..KeyboardOptions::default()
        });
        kbd.key_ucharacter(&mut screen, '7');
        assert_eq!(screen.cell(11).cc, 0xF7);
        kbd.key_ucharacter(&mut screen, 'x');
        assert_eq!(kbd.lock().oerr, Some(OperatorErrorKind::Numeric));
    }

    #[test]
    fn test_insert_overflow_leaves_buffer_untouched() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "ABCDEFGHI");
        let before: Vec<u8> = (11..20).map(|a| screen.cell(a).cc).collect();

        screen.set_cursor(11);
        kbd.run_action(&mut screen, Action::Insert);
        kbd.key_ucharacter(&mut screen, 'Z');
        assert_eq!(kbd.lock().oerr, Some(OperatorErrorKind::Overflow));
        let after: Vec<u8> = (11..20).map(|a| screen.cell(a).cc).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_insert_shifts_right() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "AC");
        screen.set_cursor(12);
        kbd.run_action(&mut screen, Action::ToggleInsert);
        kbd.key_ucharacter(&mut screen, 'B');
        assert_eq!(screen.field_text(11).trim_end(), "ABC");
        assert_eq!(screen.cursor(), 13);
    }

    #[test]
    fn test_enter_locks_and_sends_read_modified() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "HI");
        kbd.run_action(&mut screen, Action::Enter);
        assert!(kbd.lock().twait && kbd.lock().locked);

        let out = kbd.take_outbound();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Record { aid, data } => {
                assert_eq!(*aid, AID_ENTER);
                assert_eq!(data[0], AID_ENTER);
                assert!(data.ends_with(&string_to_ebcdic("HI")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_typeahead_drains_in_order() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions {
            unlock_delay: false,
            ..KeyboardOptions::default()
        });
        kbd.run_action(&mut screen, Action::Enter);
        kbd.take_outbound();

        type_text(&mut kbd, &mut screen, "OK");
        assert_eq!(kbd.typeahead_len(), 2);
        assert!(!kbd.run_ta(&mut screen));

        kbd.host_write(&HostWrite { restore: true, alarm: false });
        assert!(!kbd.is_locked());
        kbd.drain(&mut screen);
        assert_eq!(kbd.typeahead_len(), 0);
        assert_eq!(screen.field_text(11).trim_end(), "OK");
    }

    #[test]
    fn test_explicit_reset_with_typeahead_only_flushes() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::Enter);
        kbd.key_ucharacter(&mut screen, 'A');
        assert_eq!(kbd.typeahead_len(), 1);

        kbd.run_action(&mut screen, Action::Reset);
        assert_eq!(kbd.typeahead_len(), 0);
        assert!(kbd.is_locked());

        kbd.run_action(&mut screen, Action::Reset);
        assert!(!kbd.is_locked());
        assert!(!kbd.run_ta(&mut screen));
    }

    #[test]
    fn test_host_reset_is_deferred() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::Enter);
        kbd.host_write(&HostWrite { restore: true, alarm: false });
        assert_eq!(kbd.lock().to_bits(), KL_DEFERRED_UNLOCK);

        let deadline = kbd.next_deadline().expect("deferred unlock scheduled");
        kbd.poll_timers(deadline - Duration::from_millis(1));
        assert!(kbd.is_locked());
        kbd.poll_timers(deadline);
        assert!(!kbd.is_locked());
    }

    #[test]
    fn test_disconnect_flushes_typeahead() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::Enter);
        kbd.run_action(&mut screen, Action::Tab);
        assert_eq!(kbd.typeahead_len(), 1);
        kbd.set_state(ConnectionState::NotConnected, false);
        kbd.connect(false);
        assert_eq!(kbd.lock().to_bits(), KL_NOT_CONNECTED);
        assert_eq!(kbd.typeahead_len(), 0);
    }

    #[test]
    fn test_typeahead_disabled_drops() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions {
            typeahead: false,
            ..KeyboardOptions::default()
        });
        kbd.run_action(&mut screen, Action::Enter);
        kbd.run_action(&mut screen, Action::Home);
        assert_eq!(kbd.typeahead_len(), 0);
    }

    #[test]
    fn test_in3270_transitions() {
        let mut kbd = Keyboard::new(KeyboardOptions::default());
        kbd.set_state(ConnectionState::ConnectedInitial, false);
        kbd.connect(true);

        kbd.in3270(ConnectionState::ConnectedTn3270e, false);
        assert_eq!(kbd.lock().to_bits(), KL_AWAITING_FIRST);

        kbd.in3270(ConnectionState::ConnectedTn3270e, true);
        assert_eq!(kbd.lock().to_bits(), 0);

        kbd.in3270(ConnectionState::ConnectedInitialE, false);
        assert_eq!(kbd.lock().to_bits(), KL_AWAITING_FIRST);

        kbd.in3270(ConnectionState::ConnectedSscp, false);
        assert_eq!(kbd.lock().to_bits(), 0);
    }

    #[test]
    fn test_nvt_keys() {
        let mut screen = form();
        let mut kbd = Keyboard::new(KeyboardOptions::default());
        kbd.set_state(ConnectionState::ConnectedAnsi, false);
        kbd.connect(true);
        kbd.in3270(ConnectionState::ConnectedAnsi, false);
        assert!(!kbd.is_locked());

        kbd.run_action(&mut screen, Action::Enter);
        kbd.run_action(&mut screen, Action::PF(1));
        kbd.key_ucharacter(&mut screen, 'é');
        assert_eq!(
            kbd.take_outbound(),
            vec![
                Outbound::Nvt(b"\r".to_vec()),
                Outbound::Nvt(b"\x1bOP".to_vec()),
                Outbound::Nvt("é".as_bytes().to_vec()),
            ]
        );
        assert!(!kbd.is_locked());
    }

    #[test]
    fn test_sscp_enter_and_invalid_aid() {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        let mut kbd = Keyboard::new(KeyboardOptions::default());
        kbd.set_state(ConnectionState::ConnectedSscp, false);
        kbd.connect(true);
        kbd.in3270(ConnectionState::ConnectedSscp, false);

        type_text(&mut kbd, &mut screen, "LOGON");
        kbd.run_action(&mut screen, Action::Enter);
        let out = kbd.take_outbound();
        assert_eq!(
            out,
            vec![Outbound::Record {
                aid: AID_ENTER,
                data: string_to_ebcdic("LOGON")
            }]
        );
        assert!(!kbd.is_locked());

        kbd.run_action(&mut screen, Action::PF(3));
        assert!(kbd.lock().minus);
        assert!(kbd.take_outbound().is_empty());
    }

    #[test]
    fn test_attn_break_or_interrupt() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::Attn);
        assert_eq!(kbd.take_outbound(), vec![Outbound::Break]);

        kbd.set_state(ConnectionState::ConnectedTn3270e, true);
        kbd.run_action(&mut screen, Action::Attn);
        assert_eq!(kbd.take_outbound(), vec![Outbound::Interrupt]);

        kbd.set_state(ConnectionState::ConnectedTn3270e, false);
        kbd.run_action(&mut screen, Action::Attn);
        assert!(kbd.lock().minus);
    }

    #[test]
    fn test_string_stops_at_aid_and_resumes() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions {
            unlock_delay: false,
            ..KeyboardOptions::default()
        });
        kbd.run_action(&mut screen, Action::String("AB\\nCD".to_string()));
        assert!(kbd.is_locked());
        assert!(kbd.has_pending_input());
        assert_eq!(screen.field_text(11).trim_end(), "AB");

        kbd.host_write(&HostWrite { restore: true, alarm: false });
        kbd.drain(&mut screen);
        assert!(!kbd.has_pending_input());
        assert_eq!(screen.field_text(11).trim_end(), "ABCD");
    }

    #[test]
    fn test_string_pf_escape() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::String("\\pf12".to_string()));
        match kbd.take_outbound().as_slice() {
            [Outbound::Record { aid, .. }] => assert_eq!(*aid, PF_AIDS[11]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_string_hex_and_ebcdic_escapes() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::String("\\x41\\ec2\\101".to_string()));
        assert_eq!(screen.field_text(11).trim_end(), "ABA");
    }

    #[test]
    fn test_hex_string() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        assert!(kbd.run_action(&mut screen, Action::HexString("0xC1C2".to_string())));
        assert_eq!(screen.field_text(11).trim_end(), "AB");
        assert!(!kbd.run_action(&mut screen, Action::HexString("C1C".to_string())));
        assert!(!kbd.run_action(&mut screen, Action::HexString("ZZ".to_string())));
    }

    #[test]
    fn test_erase_eof_and_field_end() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "HELLO");
        screen.set_cursor(11);
        kbd.run_action(&mut screen, Action::FieldEnd);
        assert_eq!(screen.cursor(), 16);

        screen.set_cursor(13);
        kbd.run_action(&mut screen, Action::EraseEOF);
        assert_eq!(screen.field_text(11).trim_end(), "HE");
    }

    #[test]
    fn test_delete_and_erase() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "ABCD");
        screen.set_cursor(12);
        kbd.run_action(&mut screen, Action::Delete);
        assert_eq!(screen.field_text(11).trim_end(), "ACD");

        screen.set_cursor(13);
        kbd.run_action(&mut screen, Action::Erase);
        assert_eq!(screen.field_text(11).trim_end(), "AD");
        assert_eq!(screen.cursor(), 12);
    }

    #[test]
    fn test_delete_field_and_word() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "ONE TWO");
        kbd.run_action(&mut screen, Action::DeleteWord);
        assert_eq!(screen.field_text(11).trim_end(), "ONE");
        assert_eq!(screen.cursor(), 15);

        kbd.run_action(&mut screen, Action::DeleteField);
        assert_eq!(screen.field_text(11).trim_end(), "");
        assert_eq!(screen.cursor(), 11);
    }

    #[test]
    fn test_tab_backtab_home() {
        let mut screen = form();
        screen.add_fa(40, 0, CharSet::Base);
        screen.add_fa(50, FA_PROTECT, CharSet::Base);
        let mut kbd = unlocked(KeyboardOptions::default());

        kbd.run_action(&mut screen, Action::Tab);
        assert_eq!(screen.cursor(), 41);
        kbd.run_action(&mut screen, Action::BackTab);
        assert_eq!(screen.cursor(), 11);
        screen.set_cursor(100);
        kbd.run_action(&mut screen, Action::Home);
        assert_eq!(screen.cursor(), 11);
    }

    #[test]
    fn test_next_and_previous_word() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "AB CD");
        screen.set_cursor(11);
        kbd.run_action(&mut screen, Action::NextWord);
        assert_eq!(screen.cursor(), 14);
        kbd.run_action(&mut screen, Action::PreviousWord);
        assert_eq!(screen.cursor(), 11);
    }

    #[test]
    fn test_cursor_motion_wraps() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        screen.set_cursor(0);
        kbd.run_action(&mut screen, Action::Left);
        assert_eq!(screen.cursor(), screen.len() - 1);
        kbd.run_action(&mut screen, Action::Right);
        assert_eq!(screen.cursor(), 0);
        kbd.run_action(&mut screen, Action::Up);
        assert_eq!(screen.cursor(), screen.len() - 80);
        kbd.run_action(&mut screen, Action::Down);
        assert_eq!(screen.cursor(), 0);
        kbd.run_action(&mut screen, Action::MoveCursor { row: 2, col: 5 });
        assert_eq!(screen.cursor(), 165);
    }

    #[test]
    fn test_erase_input_clears_unprotected_fields() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "DATA");
        screen.set_cursor(100);
        kbd.run_action(&mut screen, Action::EraseInput);
        assert_eq!(screen.field_text(11).trim_end(), "");
        assert!(!field::is_modified(screen.cell(10).fa));
        assert_eq!(screen.cursor(), 11);
    }

    #[test]
    fn test_dup_tabs_to_next_field() {
        let mut screen = form();
        screen.add_fa(40, 0, CharSet::Base);
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::Dup);
        assert_eq!(screen.cell(11).cc, EBC_DUP);
        assert_eq!(screen.cursor(), 41);
    }

    #[test]
    fn test_lightpen_select_toggles_designator() {
        let mut screen = form();
        screen.add_fa(30, FA_INT_NORM_SEL, CharSet::Base);
        screen.add(31, EBC_QUESTION, CharSet::Base);
        let mut kbd = unlocked(KeyboardOptions::default());
        screen.set_cursor(32);
        kbd.run_action(&mut screen, Action::CursorSelect);
        assert_eq!(screen.cell(31).cc, EBC_GREATER);
        assert!(field::is_modified(screen.cell(30).fa));

        // Not selectable: bell
        screen.set_cursor(12);
        kbd.run_action(&mut screen, Action::CursorSelect);
        assert_eq!(kbd.bells(), 1);
    }

    #[test]
    fn test_kybd_prime() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        type_text(&mut kbd, &mut screen, "OLD");
        screen.set_cursor(5);
        assert_eq!(kbd.kybd_prime(&mut screen), 9);
        assert_eq!(screen.cursor(), 11);
        assert_eq!(screen.field_text(11).trim_end(), "");
    }

    #[test]
    fn test_kybd_prime_unformatted() {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        let mut kbd = unlocked(KeyboardOptions::default());
        screen.set_cursor(100);
        screen.cell_mut(105).cc = 0xC1;
        assert_eq!(kbd.kybd_prime(&mut screen), 4);
        assert_eq!(screen.cursor(), 100);

        // Nothing but blanks: every position but one
        screen.cell_mut(105).cc = EBC_SPACE;
        assert_eq!(kbd.kybd_prime(&mut screen), screen.len() - 1);
    }

    #[test]
    fn test_scroll_lock_blocks_typeahead() {
        let mut screen = form();
        let mut kbd = unlocked(KeyboardOptions::default());
        kbd.run_action(&mut screen, Action::ScrollLock(true));
        assert!(kbd.lock().scrolled);
        kbd.run_action(&mut screen, Action::Tab);
        assert_eq!(kbd.typeahead_len(), 0);
        assert_eq!(kbd.bells(), 1);
        kbd.run_action(&mut screen, Action::ScrollLock(false));
        assert!(!kbd.is_locked());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Enter".parse::<Action>(), Ok(Action::Enter));
        assert_eq!("pf(3)".parse::<Action>(), Ok(Action::PF(3)));
        assert_eq!(
            "MoveCursor(2, 10)".parse::<Action>(),
            Ok(Action::MoveCursor { row: 2, col: 10 })
        );
        assert_eq!(
            "String(\"logon\")".parse::<Action>(),
            Ok(Action::String("logon".to_string()))
        );
        assert_eq!("Key(U+0041)".parse::<Action>(), Ok(Action::Key('A')));
        assert!("Bogus".parse::<Action>().is_err());
        assert_eq!(Action::PF(3).to_string(), "PF(3)");
    }
}
