//! Keyboard Lock Tests
//!
//! Lock conditions and typeahead seen through the emulator: host writes
//! arrive as data stream records, keys arrive as actions.

use proptest::prelude::*;

use tn3270r::config::EmulatorOptions;
use tn3270r::controller::Emulator;
use tn3270r::keyboard::{Action, KeyboardLock, KeyboardOptions, OperatorErrorKind};
use tn3270r::lib3270::codes::FA_PROTECT;
use tn3270r::lib3270::display::{CharSet, ScreenBuffer, ScreenSize};
use tn3270r::telnet_negotiation::{ConnectionState, RecordHandler};

/// Erase/Write, WCC restore, SF(unprotected) at 0, IC
const UNLOCK_WITH_FIELD: [u8; 5] = [0xF5, 0x02, 0x1D, 0x00, 0x13];

fn emulator(keyboard: KeyboardOptions) -> Emulator {
    let mut emu = Emulator::new(&EmulatorOptions {
        keyboard,
        ..EmulatorOptions::default()
    });
    emu.keyboard.set_state(ConnectionState::ConnectedInitial, false);
    emu.keyboard.connect(true);
    emu.mode_changed(ConnectionState::Connected3270, false);
    emu
}

/// Test that keys typed before the host's first write are replayed after it
#[test]
fn test_keys_before_first_write_are_replayed() {
    let mut emu = emulator(KeyboardOptions::default());
    assert!(emu.keyboard.lock().awaiting_first);

    emu.run_action(Action::Key('A'));
    emu.run_action(Action::Key('B'));
    assert_eq!(emu.keyboard.typeahead_len(), 2);

    emu.process_ds(&UNLOCK_WITH_FIELD);
    assert!(!emu.keyboard.is_locked());
    emu.drain();

    assert_eq!(emu.keyboard.typeahead_len(), 0);
    assert_eq!(emu.screen.cell(1).cc, 0xC1);
    assert_eq!(emu.screen.cell(2).cc, 0xC2);
}

/// Test the deferred unlock after an AID, driven by a host write
#[test]
fn test_unlock_after_aid_is_deferred() {
    let mut emu = emulator(KeyboardOptions::default());
    emu.process_ds(&UNLOCK_WITH_FIELD);
    assert!(!emu.keyboard.is_locked());

    emu.run_action(Action::Enter);
    assert!(emu.keyboard.lock().twait);
    assert_eq!(emu.keyboard.take_outbound().len(), 1);

    emu.process_ds(&[0xF1, 0x02]);
    let lock = emu.keyboard.lock();
    assert!(lock.deferred_unlock);
    assert!(!lock.twait);

    let deadline = emu.keyboard.next_deadline().unwrap();
    emu.keyboard.poll_timers(deadline);
    assert!(!emu.keyboard.is_locked());
}

/// Test that a write without restore clears only the wait for the host
#[test]
fn test_write_without_restore_stays_locked() {
    let mut emu = emulator(KeyboardOptions {
        unlock_delay: false,
        ..KeyboardOptions::default()
    });
    emu.process_ds(&UNLOCK_WITH_FIELD);
    emu.run_action(Action::Enter);
    emu.process_ds(&[0xF1, 0x00, 0xC1]);
    let lock = emu.keyboard.lock();
    assert!(!lock.twait);
    assert!(lock.locked);
}

/// Test the operator error lock and its reset
#[test]
fn test_operator_error_then_reset() {
    let mut emu = emulator(KeyboardOptions::default());
    // Protected field everywhere
    emu.process_ds(&[0xF5, 0x02, 0x1D, FA_PROTECT, 0x13]);
    emu.run_action(Action::Key('A'));
    assert_eq!(emu.keyboard.lock().oerr, Some(OperatorErrorKind::Protected));
    assert!(emu.keyboard.lock().is_oerr_only());

    // Keys are refused while the error is showing
    emu.run_action(Action::Key('B'));
    assert_eq!(emu.keyboard.typeahead_len(), 0);

    emu.run_action(Action::Reset);
    assert!(!emu.keyboard.is_locked());
}

/// Test that leaving 3270 mode for NVT clears every lock
#[test]
fn test_nvt_mode_unlocks() {
    let mut emu = emulator(KeyboardOptions::default());
    assert!(emu.keyboard.is_locked());
    emu.mode_changed(ConnectionState::ConnectedAnsi, false);
    assert!(!emu.keyboard.is_locked());
}

fn any_size() -> impl Strategy<Value = ScreenSize> {
    prop_oneof![
        Just(ScreenSize::Model2),
        Just(ScreenSize::Model3),
        Just(ScreenSize::Model4),
        Just(ScreenSize::Model5),
    ]
}

fn any_oerr() -> impl Strategy<Value = Option<OperatorErrorKind>> {
    prop_oneof![
        Just(None),
        Just(Some(OperatorErrorKind::Protected)),
        Just(Some(OperatorErrorKind::Numeric)),
        Just(Some(OperatorErrorKind::Overflow)),
        Just(Some(OperatorErrorKind::Dbcs)),
    ]
}

proptest! {
    /// Test that buffer addresses wrap in both directions
    #[test]
    fn test_address_wraparound(size in any_size(), seed in any::<usize>()) {
        let screen = ScreenBuffer::new(size);
        let a = seed % screen.len();
        prop_assert_eq!(screen.inc(screen.dec(a)), a);
        prop_assert_eq!(screen.dec(screen.inc(a)), a);
        prop_assert!(screen.inc(a) < screen.len());
        prop_assert_eq!(screen.offset(a, screen.len() as isize), a);
        let mut b = a;
        for _ in 0..screen.len() {
            b = screen.inc(b);
        }
        prop_assert_eq!(b, a);
    }

    /// Test that lock conditions survive conversion to bits and back
    #[test]
    fn test_lock_bits_round_trip(
        oerr in any_oerr(),
        flags in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let lock = KeyboardLock {
            oerr,
            not_connected: flags[0],
            awaiting_first: flags[1],
            twait: flags[2],
            locked: flags[3],
            deferred_unlock: flags[4],
            enter_inhibit: flags[5],
            scrolled: flags[6],
            minus: flags[7],
        };
        prop_assert_eq!(KeyboardLock::from_bits(lock.to_bits()), lock);
        prop_assert_eq!(lock.is_locked(), oerr.is_some() || flags.iter().any(|&f| f));
    }

    /// Test that typeahead replays keys in the order they were pressed
    #[test]
    fn test_typeahead_order(text in "[A-Z]{1,9}") {
        let mut emu = emulator(KeyboardOptions {
            unlock_delay: false,
            ..KeyboardOptions::default()
        });
        emu.screen.add_fa(0, 0, CharSet::Base);
        emu.screen.add_fa(10, FA_PROTECT, CharSet::Base);
        emu.screen.set_cursor(1);
        for ch in text.chars() {
            emu.run_action(Action::Key(ch));
        }
        prop_assert_eq!(emu.keyboard.typeahead_len(), text.len());

        emu.process_ds(&[0xF1, 0x02]);
        emu.drain();
        prop_assert_eq!(emu.keyboard.typeahead_len(), 0);
        let typed = emu.screen.field_text(1);
        prop_assert_eq!(&typed[..text.len()], text.as_str());
    }
}
