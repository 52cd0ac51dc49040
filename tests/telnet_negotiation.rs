//! Telnet framing and option negotiation tests
//!
//! Drives the framer with host byte sequences and checks the replies it
//! queues, the mode it settles in and the records it extracts.

use proptest::prelude::*;

use tn3270r::lib3270::protocol::PdsResult;
use tn3270r::telnet_negotiation::{
    double_iacs, ConnectionState, InputStatus, NegotiatorConfig, RecordHandler, TelnetFramer, AO, DO, DONT, EOR, GA,
    IAC, NOP, OPT_BINARY, OPT_EOR, OPT_SGA, OPT_TTYPE, SB, SE, TELQUAL_IS, TELQUAL_SEND, WILL, WONT,
};

#[derive(Default)]
struct Recorder {
    records: Vec<Vec<u8>>,
    nvt: Vec<u8>,
    modes: Vec<ConnectionState>,
}

impl RecordHandler for Recorder {
    fn process_ds(&mut self, record: &[u8]) -> PdsResult {
        self.records.push(record.to_vec());
        PdsResult::OkayNoOutput
    }

    fn write_sscp_lu(&mut self, _record: &[u8]) {}

    fn process_nvt(&mut self, data: &[u8]) {
        self.nvt.extend_from_slice(data);
    }

    fn mode_changed(&mut self, state: ConnectionState, _bound: bool) {
        self.modes.push(state);
    }
}

fn framer(config: NegotiatorConfig) -> TelnetFramer {
    let mut f = TelnetFramer::new(config);
    f.set_state(ConnectionState::ConnectedInitial);
    f
}

/// The usual host opening for a plain TN3270 session
const TN3270_OPENING: [u8; 15] = [
    IAC, DO, OPT_TTYPE, IAC, DO, OPT_BINARY, IAC, WILL, OPT_BINARY, IAC, DO, OPT_EOR, IAC, WILL, OPT_EOR,
];

fn plain_3270() -> (TelnetFramer, Recorder) {
    let mut f = framer(NegotiatorConfig {
        non_tn3270e: true,
        ..NegotiatorConfig::default()
    });
    let mut h = Recorder::default();
    f.process_incoming(&TN3270_OPENING, &mut h).unwrap();
    f.take_output();
    (f, h)
}

/// Test the replies to a plain TN3270 opening and the resulting mode
#[test]
fn test_plain_tn3270_negotiation() {
    let mut f = framer(NegotiatorConfig::default());
    let mut h = Recorder::default();

    let status = f.process_incoming(&TN3270_OPENING, &mut h).unwrap();
    assert_eq!(status, InputStatus::Consumed);
    assert_eq!(
        f.take_output(),
        vec![
            IAC, WILL, OPT_TTYPE, IAC, WILL, OPT_BINARY, IAC, DO, OPT_BINARY, IAC, WILL, OPT_EOR, IAC, DO, OPT_EOR,
        ]
    );
    assert_eq!(f.state(), ConnectionState::Connected3270);
    assert_eq!(h.modes, vec![ConnectionState::Connected3270]);
    assert!(f.state().in_3270());
}

/// Test the terminal type sub-negotiation reply
#[test]
fn test_terminal_type_reply() {
    let mut f = framer(NegotiatorConfig::default());
    let mut h = Recorder::default();
    f.process_incoming(&[IAC, SB, OPT_TTYPE, TELQUAL_SEND, IAC, SE], &mut h).unwrap();

    let mut expected = vec![IAC, SB, OPT_TTYPE, TELQUAL_IS];
    expected.extend_from_slice(b"IBM-3278-2-E");
    expected.extend_from_slice(&[IAC, SE]);
    assert_eq!(f.take_output(), expected);
}

/// Test that a standard-data-stream host gets the terminal type without -E
#[test]
fn test_terminal_type_std_ds() {
    let mut f = framer(NegotiatorConfig {
        term_type: "IBM-3278-4".to_string(),
        std_ds: true,
        ..NegotiatorConfig::default()
    });
    let mut h = Recorder::default();
    f.process_incoming(&[IAC, SB, OPT_TTYPE, TELQUAL_SEND, IAC, SE], &mut h).unwrap();
    let out = f.take_output();
    assert_eq!(&out[4..out.len() - 2], b"IBM-3278-4");
}

/// Test that a WONT for an enabled option is acknowledged and drops the mode
#[test]
fn test_wont_binary_leaves_3270_mode() {
    let (mut f, mut h) = plain_3270();
    f.process_incoming(&[IAC, WONT, OPT_BINARY], &mut h).unwrap();
    assert_eq!(f.take_output(), vec![IAC, DONT, OPT_BINARY]);
    assert_eq!(f.state(), ConnectionState::ConnectedAnsi);

    // A second WONT is not answered
    f.process_incoming(&[IAC, WONT, OPT_BINARY], &mut h).unwrap();
    assert!(f.take_output().is_empty());
}

/// Test that SGA is accepted and repeated requests are not answered
#[test]
fn test_sga_loop_suppression() {
    let mut f = framer(NegotiatorConfig::default());
    let mut h = Recorder::default();
    f.process_incoming(&[IAC, DO, OPT_SGA, IAC, DO, OPT_SGA, IAC, WILL, OPT_SGA, IAC, WILL, OPT_SGA], &mut h)
        .unwrap();
    assert_eq!(f.take_output(), vec![IAC, WILL, OPT_SGA, IAC, DO, OPT_SGA]);
}

/// Test that GA, NOP and AO inside a record are ignored
#[test]
fn test_ignored_commands_inside_record() {
    let (mut f, mut h) = plain_3270();
    f.process_incoming(&[0xF1, IAC, NOP, 0xC3, IAC, GA, 0x40, IAC, AO, IAC, EOR], &mut h).unwrap();
    assert_eq!(h.records, vec![vec![0xF1, 0xC3, 0x40]]);
}

/// Test that records arriving before 3270 mode are discarded
#[test]
fn test_eor_before_3270_mode_discards_record() {
    let mut f = framer(NegotiatorConfig::default());
    let mut h = Recorder::default();
    f.process_incoming(&[IAC, DO, OPT_TTYPE], &mut h).unwrap();
    f.process_incoming(&[IAC, EOR], &mut h).unwrap();
    assert!(h.records.is_empty());
}

/// Test that NVT text from a plain telnet host reaches the NVT sink
#[test]
fn test_nvt_text_switches_to_ansi() {
    let mut f = framer(NegotiatorConfig::default());
    let mut h = Recorder::default();
    f.process_incoming(b"Welcome\r\n", &mut h).unwrap();
    assert_eq!(f.state(), ConnectionState::ConnectedAnsi);
    assert_eq!(h.nvt, b"Welcome\r\n".to_vec());

    // A doubled IAC is one literal 0xFF in NVT mode too
    f.process_incoming(&[b'a', IAC, IAC, b'b'], &mut h).unwrap();
    assert_eq!(&h.nvt[h.nvt.len() - 3..], &[b'a', 0xFF, b'b']);
}

/// Test that an outbound record with 0xFF is framed and decoded back intact
#[test]
fn test_record_iac_round_trip() {
    let (mut tx, _) = plain_3270();
    tx.send_record(&[0x7D, 0x40, 0xFF, 0x5B]);
    let wire = tx.take_output();
    assert_eq!(wire, vec![0x7D, 0x40, 0xFF, 0xFF, 0x5B, IAC, EOR]);

    let (mut rx, mut h) = plain_3270();
    rx.process_incoming(&wire, &mut h).unwrap();
    assert_eq!(h.records, vec![vec![0x7D, 0x40, 0xFF, 0x5B]]);
}

/// Test NVT output escaping
#[test]
fn test_send_nvt_doubles_iac() {
    let mut f = framer(NegotiatorConfig::default());
    f.send_nvt(&[b'x', 0xFF]);
    assert_eq!(f.take_output(), vec![b'x', 0xFF, 0xFF]);
}

proptest! {
    /// Test that any record survives framing and deframing byte-for-byte
    #[test]
    fn test_record_framing_round_trip(data in proptest::collection::vec(any::<u8>(), 1..512)) {
        let (mut tx, _) = plain_3270();
        tx.send_record(&data);
        let wire = tx.take_output();
        prop_assert_eq!(&wire[wire.len() - 2..], &[IAC, EOR]);

        let (mut rx, mut h) = plain_3270();
        rx.process_incoming(&wire, &mut h).unwrap();
        prop_assert_eq!(h.records, vec![data]);
    }

    /// Test that doubling leaves no lone IAC and only grows by the IAC count
    #[test]
    fn test_double_iacs_property(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let doubled = double_iacs(&data);
        let iacs = data.iter().filter(|&&b| b == IAC).count();
        prop_assert_eq!(doubled.len(), data.len() + iacs);
        let mut i = 0;
        while i < doubled.len() {
            if doubled[i] == IAC {
                prop_assert_eq!(doubled.get(i + 1), Some(&IAC));
                i += 2;
            } else {
                i += 1;
            }
        }
    }

    /// Test that splitting the input at any point yields the same records
    #[test]
    fn test_split_reads(data in proptest::collection::vec(any::<u8>(), 1..128), cut in 0usize..1000) {
        let (mut tx, _) = plain_3270();
        tx.send_record(&data);
        let wire = tx.take_output();
        let cut = cut % wire.len();

        let (mut rx, mut h) = plain_3270();
        rx.process_incoming(&wire[..cut], &mut h).unwrap();
        rx.process_incoming(&wire[cut..], &mut h).unwrap();
        prop_assert_eq!(h.records, vec![data]);
    }
}
