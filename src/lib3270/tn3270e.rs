//! TN3270E (RFC 2355) message formats
//!
//! Sub-negotiation parsing and construction, the 5-byte record header,
//! the function bitmask, LU candidate bookkeeping and the response records
//! a terminal sends back to the host. The negotiation decisions themselves
//! live with the telnet framer, which owns the option table they depend on.

use std::fmt;

use crate::telnet_negotiation::{IAC, OPT_TN3270E, SB, SE};

// Sub-negotiation operations
pub const TN3270E_OP_ASSOCIATE: u8 = 0;
pub const TN3270E_OP_CONNECT: u8 = 1;
pub const TN3270E_OP_DEVICE_TYPE: u8 = 2;
pub const TN3270E_OP_FUNCTIONS: u8 = 3;
pub const TN3270E_OP_IS: u8 = 4;
pub const TN3270E_OP_REASON: u8 = 5;
pub const TN3270E_OP_REJECT: u8 = 6;
pub const TN3270E_OP_REQUEST: u8 = 7;
pub const TN3270E_OP_SEND: u8 = 8;

/// Device-type reject reasons, indexed by reason code
pub const REASON_NAMES: [&str; 8] = [
    "CONN-PARTNER",
    "DEVICE-IN-USE",
    "INV-ASSOCIATE",
    "INV-NAME",
    "INV-DEVICE-TYPE",
    "TYPE-NAME-ERROR",
    "UNKNOWN-ERROR",
    "UNSUPPORTED-REQ",
];

/// Render a reject reason code
pub fn reason_name(code: u8) -> String {
    REASON_NAMES
        .get(code as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| "??".to_string())
}

/// Longest device type or LU name accepted from the host
pub const TN3270E_NAME_MAX: usize = 32;

// Header response flags (non-RESPONSE records)
pub const TN3270E_RSF_NO_RESPONSE: u8 = 0x00;
pub const TN3270E_RSF_ERROR_RESPONSE: u8 = 0x01;
pub const TN3270E_RSF_ALWAYS_RESPONSE: u8 = 0x02;
// Header response flags (RESPONSE records)
pub const TN3270E_RSF_POSITIVE_RESPONSE: u8 = 0x00;
pub const TN3270E_RSF_NEGATIVE_RESPONSE: u8 = 0x01;

pub const TN3270E_RQF_ERR_COND_CLEARED: u8 = 0x00;

// Response codes
pub const TN3270E_POS_DEVICE_END: u8 = 0x00;
pub const TN3270E_NEG_COMMAND_REJECT: u8 = 0x00;
pub const TN3270E_NEG_INTERVENTION_REQUIRED: u8 = 0x01;
pub const TN3270E_NEG_OPERATION_CHECK: u8 = 0x02;

/// Length of the TN3270E record header
pub const EH_SIZE: usize = 5;

/// Highest transmit sequence number before wrapping
pub const SEQ_MASK: u16 = 0x7FFF;

/// TN3270E record data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Data3270 = 0,
    ScsData = 1,
    Response = 2,
    BindImage = 3,
    Unbind = 4,
    NvtData = 5,
    Request = 6,
    SscpLuData = 7,
    PrintEoj = 8,
}

impl DataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data3270),
            1 => Some(Self::ScsData),
            2 => Some(Self::Response),
            3 => Some(Self::BindImage),
            4 => Some(Self::Unbind),
            5 => Some(Self::NvtData),
            6 => Some(Self::Request),
            7 => Some(Self::SscpLuData),
            8 => Some(Self::PrintEoj),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Data3270 => "3270-DATA",
            Self::ScsData => "SCS-DATA",
            Self::Response => "RESPONSE",
            Self::BindImage => "BIND-IMAGE",
            Self::Unbind => "UNBIND",
            Self::NvtData => "NVT-DATA",
            Self::Request => "REQUEST",
            Self::SscpLuData => "SSCP-LU-DATA",
            Self::PrintEoj => "PRINT-EOJ",
        }
    }
}

/// TN3270E functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    BindImage = 0,
    DataStreamCtl = 1,
    Responses = 2,
    ScsCtlCodes = 3,
    Sysreq = 4,
}

impl Function {
    pub const ALL: [Function; 5] = [
        Function::BindImage,
        Function::DataStreamCtl,
        Function::Responses,
        Function::ScsCtlCodes,
        Function::Sysreq,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::BindImage => "BIND-IMAGE",
            Self::DataStreamCtl => "DATA-STREAM-CTL",
            Self::Responses => "RESPONSES",
            Self::ScsCtlCodes => "SCS-CTL-CODES",
            Self::Sysreq => "SYSREQ",
        }
    }
}

/// Set of TN3270E function codes. Codes are bit positions; anything at or
/// above 32 cannot be represented and is dropped on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionSet(u32);

impl FunctionSet {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Every function this terminal implements
    pub fn supported() -> Self {
        let mut set = Self::empty();
        for f in Function::ALL {
            set.insert(f);
        }
        set
    }

    pub fn from_functions(functions: &[Function]) -> Self {
        let mut set = Self::empty();
        for &f in functions {
            set.insert(f);
        }
        set
    }

    /// Decode a list of function codes from a sub-negotiation
    pub fn from_wire(codes: &[u8]) -> Self {
        let mut bits = 0u32;
        for &c in codes {
            if c < 32 {
                bits |= 1 << c;
            }
        }
        Self(bits)
    }

    /// Encode as a list of function codes, lowest first
    pub fn to_wire(self) -> Vec<u8> {
        (0u8..32).filter(|&c| self.0 & (1 << c) != 0).collect()
    }

    pub fn contains(self, f: Function) -> bool {
        self.0 & (1 << f as u32) != 0
    }

    pub fn insert(&mut self, f: Function) {
        self.0 |= 1 << f as u32;
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FunctionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for c in self.to_wire() {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match Function::ALL.get(c as usize) {
                Some(func) => write!(f, "{}", func.name())?,
                None => write!(f, "{c}")?,
            }
        }
        Ok(())
    }
}

/// Which kind of data a negotiated TN3270E session is currently carrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Submode {
    #[default]
    None,
    Nvt,
    Data3270,
    Sscp,
}

/// The 5-byte header in front of every TN3270E record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tn3270eHeader {
    pub data_type: u8,
    pub request_flag: u8,
    pub response_flag: u8,
    pub seq: u16,
}

impl Tn3270eHeader {
    pub fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < EH_SIZE {
            return None;
        }
        Some(Self {
            data_type: record[0],
            request_flag: record[1],
            response_flag: record[2],
            seq: u16::from_be_bytes([record[3], record[4]]),
        })
    }

    pub fn to_bytes(self) -> [u8; EH_SIZE] {
        let seq = self.seq.to_be_bytes();
        [self.data_type, self.request_flag, self.response_flag, seq[0], seq[1]]
    }

    /// Trace form, e.g. `3270-DATA ALWAYS-RESPONSE 12`
    pub fn describe(&self) -> String {
        let dt = DataType::from_u8(self.data_type);
        let type_name = dt.map(|d| d.name().to_string()).unwrap_or_else(|| format!("{}", self.data_type));
        let rsp = if dt == Some(DataType::Response) {
            match self.response_flag {
                TN3270E_RSF_POSITIVE_RESPONSE => "POSITIVE-RESPONSE".to_string(),
                TN3270E_RSF_NEGATIVE_RESPONSE => "NEGATIVE-RESPONSE".to_string(),
                other => format!("{other}"),
            }
        } else {
            match self.response_flag {
                TN3270E_RSF_NO_RESPONSE => "NO-RESPONSE".to_string(),
                TN3270E_RSF_ERROR_RESPONSE => "ERROR-RESPONSE".to_string(),
                TN3270E_RSF_ALWAYS_RESPONSE => "ALWAYS-RESPONSE".to_string(),
                other => format!("{other}"),
            }
        };
        format!("{} {} {}", type_name, rsp, self.seq)
    }
}

/// TN3270E negotiation and session sub-state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tn3270eState {
    /// Functions offered, then agreed
    pub funcs: FunctionSet,
    pub negotiated: bool,
    pub submode: Submode,
    pub bound: bool,
    pub xmit_seq: u16,
    /// Response flag of the record being processed
    pub response_required: u8,
    /// Sequence number of the record being processed
    pub recv_seq: u16,
}

impl Default for Tn3270eState {
    fn default() -> Self {
        Self {
            funcs: FunctionSet::supported(),
            negotiated: false,
            submode: Submode::None,
            bound: false,
            xmit_seq: 0,
            response_required: TN3270E_RSF_NO_RESPONSE,
            recv_seq: 0,
        }
    }
}

impl Tn3270eState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the negotiated session (TN3270E option turned off)
    pub fn reset_session(&mut self) {
        self.negotiated = false;
        self.submode = Submode::None;
        self.bound = false;
    }

    /// Advance the transmit sequence number when responses are in use
    pub fn bump_xmit_seq(&mut self) {
        if self.funcs.contains(Function::Responses) {
            self.xmit_seq = (self.xmit_seq + 1) & SEQ_MASK;
        }
    }
}

/// LU names to try, in order, or a single association target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LuCandidates {
    list: Vec<String>,
    cursor: Option<usize>,
    assoc: Option<String>,
}

impl LuCandidates {
    /// Build from a comma-separated LU list, or an association name which
    /// takes precedence over the list.
    pub fn new(lu_names: Option<&str>, assoc: Option<&str>) -> Self {
        if let Some(a) = assoc.filter(|a| !a.is_empty()) {
            return Self {
                list: Vec::new(),
                cursor: None,
                assoc: Some(a.to_string()),
            };
        }
        let list: Vec<String> = lu_names
            .filter(|l| !l.is_empty())
            .map(|l| l.split(',').map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let cursor = if list.is_empty() { None } else { Some(0) };
        Self {
            list,
            cursor,
            assoc: None,
        }
    }

    /// The LU to request next, if any remain
    pub fn current(&self) -> Option<&str> {
        self.cursor.and_then(|i| self.list.get(i)).map(|s| s.as_str())
    }

    /// Move to the next candidate; past the end there is no current LU
    pub fn advance(&mut self) {
        if let Some(i) = self.cursor {
            self.cursor = if i + 1 < self.list.len() { Some(i + 1) } else { None };
        }
    }

    /// Start over from the first candidate
    pub fn rewind(&mut self) {
        self.cursor = if self.list.is_empty() { None } else { Some(0) };
    }

    /// Whether an explicit LU list was given
    pub fn has_list(&self) -> bool {
        !self.list.is_empty()
    }

    pub fn assoc(&self) -> Option<&str> {
        self.assoc.as_deref()
    }
}

/// Decoded TN3270E sub-negotiation (the bytes between `SB TN3270E` and `IAC SE`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tn3270eMessage {
    SendDeviceType,
    DeviceTypeIs { device_type: String, lu_name: Option<String> },
    DeviceTypeReject { reason: u8 },
    FunctionsRequest(FunctionSet),
    FunctionsIs(FunctionSet),
    Unknown(Vec<u8>),
}

fn take_name(bytes: &[u8]) -> String {
    let end = bytes.len().min(TN3270E_NAME_MAX);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Tn3270eMessage {
    /// Parse the payload after the option byte
    pub fn parse(payload: &[u8]) -> Self {
        match payload {
            [TN3270E_OP_SEND, TN3270E_OP_DEVICE_TYPE, ..] => Self::SendDeviceType,
            [TN3270E_OP_DEVICE_TYPE, TN3270E_OP_IS, rest @ ..] => {
                let split = rest.iter().position(|&b| b == TN3270E_OP_CONNECT);
                let (ty, lu) = match split {
                    Some(i) => (&rest[..i], Some(&rest[i + 1..])),
                    None => (rest, None),
                };
                Self::DeviceTypeIs {
                    device_type: take_name(ty),
                    lu_name: lu.map(take_name),
                }
            }
            [TN3270E_OP_DEVICE_TYPE, TN3270E_OP_REJECT, rest @ ..] => {
                // REASON <code>
                let reason = match rest {
                    [TN3270E_OP_REASON, code, ..] => *code,
                    [code, ..] => *code,
                    [] => 6,
                };
                Self::DeviceTypeReject { reason }
            }
            [TN3270E_OP_FUNCTIONS, TN3270E_OP_REQUEST, rest @ ..] => {
                Self::FunctionsRequest(FunctionSet::from_wire(rest))
            }
            [TN3270E_OP_FUNCTIONS, TN3270E_OP_IS, rest @ ..] => {
                Self::FunctionsIs(FunctionSet::from_wire(rest))
            }
            other => Self::Unknown(other.to_vec()),
        }
    }
}

/// `IAC SB TN3270E DEVICE-TYPE REQUEST <type> [ASSOCIATE <assoc> | CONNECT <lu>] IAC SE`
pub fn device_type_request(term_type: &str, lus: &LuCandidates) -> Vec<u8> {
    let mut out = vec![IAC, SB, OPT_TN3270E, TN3270E_OP_DEVICE_TYPE, TN3270E_OP_REQUEST];
    out.extend_from_slice(term_type.as_bytes());
    if let Some(assoc) = lus.assoc() {
        out.push(TN3270E_OP_ASSOCIATE);
        out.extend_from_slice(assoc.as_bytes());
    } else if let Some(lu) = lus.current() {
        out.push(TN3270E_OP_CONNECT);
        out.extend_from_slice(lu.as_bytes());
    }
    out.extend_from_slice(&[IAC, SE]);
    out
}

/// `IAC SB TN3270E FUNCTIONS <op> <codes...> IAC SE`
pub fn functions_message(op: u8, funcs: FunctionSet) -> Vec<u8> {
    let mut out = vec![IAC, SB, OPT_TN3270E, TN3270E_OP_FUNCTIONS, op];
    out.extend(funcs.to_wire());
    out.extend_from_slice(&[IAC, SE]);
    out
}

/// Append a sequence number, doubling any 0xFF byte
fn push_seq(out: &mut Vec<u8>, seq: u16) {
    for b in seq.to_be_bytes() {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
}

/// Positive response to record `seq`, IAC EOR included
pub fn positive_response(seq: u16) -> Vec<u8> {
    let mut out = vec![DataType::Response as u8, 0, TN3270E_RSF_POSITIVE_RESPONSE];
    push_seq(&mut out, seq);
    out.extend_from_slice(&[TN3270E_POS_DEVICE_END, IAC, crate::telnet_negotiation::EOR]);
    out
}

/// Negative response to record `seq`, IAC EOR included
pub fn negative_response(seq: u16, code: u8) -> Vec<u8> {
    let mut out = vec![DataType::Response as u8, 0, TN3270E_RSF_NEGATIVE_RESPONSE];
    push_seq(&mut out, seq);
    out.push(code);
    if code == IAC {
        out.push(IAC);
    }
    out.extend_from_slice(&[IAC, crate::telnet_negotiation::EOR]);
    out
}

/// "Error condition cleared" request sent after intervention-required
pub fn error_condition_cleared(xmit_seq: u16) -> Vec<u8> {
    let mut out = vec![DataType::Request as u8, TN3270E_RQF_ERR_COND_CLEARED, TN3270E_RSF_NO_RESPONSE];
    push_seq(&mut out, xmit_seq);
    out.extend_from_slice(&[IAC, crate::telnet_negotiation::EOR]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet_negotiation::EOR;

    #[test]
    fn test_function_set_wire_codes() {
        let set = FunctionSet::from_wire(&[2, 0, 40]);
        assert!(set.contains(Function::BindImage));
        assert!(set.contains(Function::Responses));
        assert!(!set.contains(Function::Sysreq));
        assert_eq!(set.to_wire(), vec![0, 2]);
        assert_eq!(set.to_string(), "BIND-IMAGE RESPONSES");
    }

    #[test]
    fn test_function_set_subset() {
        let ours = FunctionSet::from_functions(&[Function::BindImage, Function::Responses]);
        let theirs = FunctionSet::from_functions(&[Function::Responses]);
        assert!(theirs.is_subset_of(ours));
        assert!(!ours.is_subset_of(theirs));
        assert_eq!(ours.intersection(theirs), theirs);
    }

    #[test]
    fn test_header_parse_and_describe() {
        let h = Tn3270eHeader::parse(&[0, 0, 2, 0x00, 0x0C, 0xF5]).expect("header");
        assert_eq!(h.seq, 12);
        assert_eq!(h.describe(), "3270-DATA ALWAYS-RESPONSE 12");
        assert!(Tn3270eHeader::parse(&[0, 0]).is_none());
        let r = Tn3270eHeader { data_type: 2, request_flag: 0, response_flag: 1, seq: 3 };
        assert_eq!(r.describe(), "RESPONSE NEGATIVE-RESPONSE 3");
    }

    #[test]
    fn test_lu_candidates_advance_to_exhaustion() {
        let mut lus = LuCandidates::new(Some("LU1,LU2"), None);
        assert!(lus.has_list());
        assert_eq!(lus.current(), Some("LU1"));
        lus.advance();
        assert_eq!(lus.current(), Some("LU2"));
        lus.advance();
        assert_eq!(lus.current(), None);
        lus.advance();
        assert_eq!(lus.current(), None);
        lus.rewind();
        assert_eq!(lus.current(), Some("LU1"));
    }

    #[test]
    fn test_lu_candidates_association_wins() {
        let lus = LuCandidates::new(Some("LU1"), Some("PRT1"));
        assert!(!lus.has_list());
        assert_eq!(lus.assoc(), Some("PRT1"));
        assert_eq!(lus.current(), None);
    }

    #[test]
    fn test_parse_device_type_is() {
        let mut payload = vec![TN3270E_OP_DEVICE_TYPE, TN3270E_OP_IS];
        payload.extend_from_slice(b"IBM-3278-2-E");
        payload.push(TN3270E_OP_CONNECT);
        payload.extend_from_slice(b"LUX");
        assert_eq!(
            Tn3270eMessage::parse(&payload),
            Tn3270eMessage::DeviceTypeIs {
                device_type: "IBM-3278-2-E".to_string(),
                lu_name: Some("LUX".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_reject_reason() {
        let msg = Tn3270eMessage::parse(&[TN3270E_OP_DEVICE_TYPE, TN3270E_OP_REJECT, TN3270E_OP_REASON, 1]);
        assert_eq!(msg, Tn3270eMessage::DeviceTypeReject { reason: 1 });
        assert_eq!(reason_name(1), "DEVICE-IN-USE");
        assert_eq!(reason_name(42), "??");
    }

    #[test]
    fn test_device_type_request_connect() {
        let lus = LuCandidates::new(Some("LU7"), None);
        let msg = device_type_request("IBM-3278-2-E", &lus);
        let mut expected = vec![IAC, SB, OPT_TN3270E, TN3270E_OP_DEVICE_TYPE, TN3270E_OP_REQUEST];
        expected.extend_from_slice(b"IBM-3278-2-E");
        expected.push(TN3270E_OP_CONNECT);
        expected.extend_from_slice(b"LU7");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(msg, expected);
    }

    #[test]
    fn test_positive_response_doubles_iac_in_sequence() {
        assert_eq!(positive_response(0x0001), vec![2, 0, 0, 0x00, 0x01, 0x00, IAC, EOR]);
        assert_eq!(positive_response(0x01FF), vec![2, 0, 0, 0x01, 0xFF, 0xFF, 0x00, IAC, EOR]);
    }

    #[test]
    fn test_negative_response_and_clear() {
        assert_eq!(
            negative_response(5, TN3270E_NEG_INTERVENTION_REQUIRED),
            vec![2, 0, 1, 0, 5, 1, IAC, EOR]
        );
        assert_eq!(error_condition_cleared(9), vec![6, 0, 0, 0, 9, IAC, EOR]);
    }

    #[test]
    fn test_xmit_seq_wraps_only_with_responses() {
        let mut st = Tn3270eState::new();
        st.funcs = FunctionSet::empty();
        st.bump_xmit_seq();
        assert_eq!(st.xmit_seq, 0);
        st.funcs = FunctionSet::from_functions(&[Function::Responses]);
        st.xmit_seq = SEQ_MASK;
        st.bump_xmit_seq();
        assert_eq!(st.xmit_seq, 0);
    }
}
