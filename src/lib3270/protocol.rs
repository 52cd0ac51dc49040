//! 3270 Protocol Implementation
//!
//! Parsing and execution of inbound 3270 data streams (commands, orders,
//! WCC, structured fields) against a [`ScreenBuffer`], plus the inbound
//! Read Buffer / Read Modified encodings the keyboard and host reads use.

use log::{debug, trace, warn};

use super::codes::*;
use super::display::{addressing, CharSet, ReplyMode, ScreenBuffer};
use super::field::{self, ExtendedAttributes};

/// Outcome of processing one inbound record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdsResult {
    /// Record processed, nothing to send back
    OkayNoOutput,
    /// Record processed and produced an inbound reply (already AID-prefixed)
    OkayOutput(Vec<u8>),
    /// Unknown or malformed command
    BadCommand,
    /// Buffer address out of range
    BadAddress,
    /// Processing failed for another reason
    Failed,
}

impl PdsResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::BadCommand | Self::BadAddress | Self::Failed)
    }
}

/// Side effects of a host write the keyboard engine reacts to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostWrite {
    /// The WCC asked for the keyboard to be restored
    pub restore: bool,
    /// The WCC sounded the alarm
    pub alarm: bool,
}

/// 3270 data stream processor
///
/// Keeps the AID of the last attention key (reported by host-initiated
/// reads) and the side effects of the most recent writes, which the owner
/// drains with [`DataStreamProcessor::take_writes`].
#[derive(Debug)]
pub struct DataStreamProcessor {
    aid: u8,
    writes: Vec<HostWrite>,
}

impl Default for DataStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStreamProcessor {
    pub fn new() -> Self {
        Self {
            aid: AID_NO_AID,
            writes: Vec::new(),
        }
    }

    /// Record the AID of an attention key sent to the host
    pub fn set_aid(&mut self, aid: u8) {
        self.aid = aid;
    }

    pub fn aid(&self) -> u8 {
        self.aid
    }

    /// Process one 3270 record from the host
    pub fn process_ds(&mut self, screen: &mut ScreenBuffer, data: &[u8]) -> PdsResult {
        if data.is_empty() {
            return PdsResult::OkayNoOutput;
        }
        let mut parser = DataStreamParser::new(data, screen, self.aid);
        let result = parser.parse_command();
        if parser.writes.iter().any(|w| w.restore) {
            self.aid = AID_NO_AID;
        }
        self.writes.extend(parser.writes);
        if result.is_error() {
            warn!("3270 data stream rejected: {:?}", result);
        }
        result
    }

    /// Write SSCP-LU data: plain text, newline (0x15) moves to the next row.
    pub fn write_sscp_lu(&mut self, screen: &mut ScreenBuffer, data: &[u8]) {
        let mut addr = screen.cursor();
        for &b in data {
            match b {
                0x15 | 0x25 => {
                    let row = (screen.row_of(addr) + 1) % screen.rows();
                    addr = screen.address(row, 0);
                }
                _ => {
                    screen.remove_fa(addr);
                    screen.add(addr, b, CharSet::Base);
                    addr = screen.inc(addr);
                }
            }
        }
        screen.set_cursor(addr);
        self.writes.push(HostWrite { restore: true, alarm: false });
    }

    /// Drain the side effects of writes processed so far
    pub fn take_writes(&mut self) -> Vec<HostWrite> {
        std::mem::take(&mut self.writes)
    }
}

/// Encode the cursor or an SBA target with the form the buffer needs
fn push_address(out: &mut Vec<u8>, screen: &ScreenBuffer, addr: usize) {
    let (b1, b2) = addressing::encode_address(addr as u16, screen.uses_14bit_addressing());
    out.push(b1);
    out.push(b2);
}

/// Build a Read Modified (or Read Modified All) reply.
///
/// Clear and the PA keys produce a short read (the AID alone) unless
/// `all` is set.
pub fn read_modified(screen: &ScreenBuffer, aid: u8, all: bool) -> Vec<u8> {
    let mut out = vec![aid];
    let short = AidKey::from_u8(aid).map_or(false, |k| k.is_short_read());
    if short && !all {
        return out;
    }
    push_address(&mut out, screen, screen.cursor());

    let character_mode = screen.reply_mode() == ReplyMode::Character;
    let mut attrs = CharAttrs::default();

    if screen.formatted() {
        let first = (0..screen.len()).find(|&a| screen.cell(a).is_fa()).unwrap_or(0);
        let mut a = first;
        loop {
            let cell = screen.cell(a);
            if cell.is_fa() && field::is_modified(cell.fa) {
                let start = screen.inc(a);
                out.push(ORDER_SBA);
                push_address(&mut out, screen, start);
                let mut b = start;
                while !screen.cell(b).is_fa() {
                    push_data_cell(&mut out, screen, b, character_mode, &mut attrs);
                    b = screen.inc(b);
                }
            }
            a = screen.inc(a);
            if a == first {
                break;
            }
        }
    } else {
        for a in 0..screen.len() {
            push_data_cell(&mut out, screen, a, character_mode, &mut attrs);
        }
    }
    trace!("Read Modified: {} bytes", out.len());
    out
}

/// Build a Read Buffer reply: every cell, attributes as SF orders.
pub fn read_buffer(screen: &ScreenBuffer, aid: u8) -> Vec<u8> {
    let mut out = vec![aid];
    push_address(&mut out, screen, screen.cursor());
    for cell in screen.cells() {
        if cell.is_fa() {
            out.push(ORDER_SF);
            out.push(cell.fa);
        } else {
            if cell.cs == CharSet::Ge {
                out.push(ORDER_GE);
            }
            out.push(cell.cc);
        }
    }
    out
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CharAttrs {
    fg: u8,
    gr: u8,
    cs: u8,
}

fn push_data_cell(out: &mut Vec<u8>, screen: &ScreenBuffer, addr: usize, character_mode: bool, attrs: &mut CharAttrs) {
    let cell = screen.cell(addr);
    if cell.cc == EBC_NULL {
        return;
    }
    if character_mode {
        let cs = if cell.cs == CharSet::Dbcs { XA_CHARSET_DBCS } else { 0 };
        if cell.fg != attrs.fg {
            out.extend_from_slice(&[ORDER_SA, XA_FOREGROUND, cell.fg]);
            attrs.fg = cell.fg;
        }
        if cell.gr != attrs.gr {
            out.extend_from_slice(&[ORDER_SA, XA_HIGHLIGHTING, cell.gr]);
            attrs.gr = cell.gr;
        }
        if cs != attrs.cs {
            out.extend_from_slice(&[ORDER_SA, XA_CHARSET, cs]);
            attrs.cs = cs;
        }
    }
    if cell.cs == CharSet::Ge {
        out.push(ORDER_GE);
    }
    out.push(cell.cc);
}

/// Data stream parser for one record
struct DataStreamParser<'a> {
    data: &'a [u8],
    pos: usize,
    screen: &'a mut ScreenBuffer,
    aid: u8,
    writes: Vec<HostWrite>,
}

impl<'a> DataStreamParser<'a> {
    fn new(data: &'a [u8], screen: &'a mut ScreenBuffer, aid: u8) -> Self {
        Self {
            data,
            pos: 0,
            screen,
            aid,
            writes: Vec::new(),
        }
    }

    fn next_byte(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn parse_command(&mut self) -> PdsResult {
        let Some(cmd_byte) = self.next_byte() else {
            return PdsResult::OkayNoOutput;
        };
        let Some(command) = CommandCode::from_u8(cmd_byte) else {
            debug!("Unknown 3270 command 0x{cmd_byte:02X}");
            return PdsResult::BadCommand;
        };
        trace!("3270 command {:?}", command);
        match command {
            CommandCode::Write => self.process_write(false),
            CommandCode::EraseWrite | CommandCode::EraseWriteAlternate => self.process_write(true),
            CommandCode::ReadBuffer => {
                PdsResult::OkayOutput(read_buffer(self.screen, self.aid))
            }
            CommandCode::ReadModified => {
                PdsResult::OkayOutput(read_modified(self.screen, self.aid, false))
            }
            CommandCode::ReadModifiedAll => {
                PdsResult::OkayOutput(read_modified(self.screen, self.aid, true))
            }
            CommandCode::EraseAllUnprotected => {
                self.process_erase_all_unprotected();
                PdsResult::OkayNoOutput
            }
            CommandCode::WriteStructuredField => self.process_write_structured_field(),
        }
    }

    /// Process Write, Erase/Write, or Erase/Write Alternate
    fn process_write(&mut self, erase: bool) -> PdsResult {
        let Some(wcc) = self.next_byte() else {
            // A bare Write/Erase-Write carries no WCC; only the erase happens.
            if erase {
                self.screen.clear();
                self.screen.set_reply_mode(ReplyMode::Field);
            }
            return PdsResult::OkayNoOutput;
        };

        if erase {
            self.screen.clear();
            self.screen.set_reply_mode(ReplyMode::Field);
        }
        if wcc & WCC_RESET_MDT != 0 {
            self.screen.reset_all_mdt();
        }

        let n = self.screen.len();
        let mut buffer_addr = self.screen.cursor();
        let mut cursor_target: Option<usize> = None;
        let mut attrs = ExtendedAttributes::new();
        let mut last_was_data = false;

        while self.pos < self.data.len() {
            let byte = self.data[self.pos];
            self.pos += 1;
            let order = OrderCode::from_u8(byte);
            match order {
                Some(OrderCode::StartField) => {
                    let Some(attr) = self.next_byte() else {
                        return PdsResult::Failed;
                    };
                    self.screen.add_fa(buffer_addr, attr, CharSet::Base);
                    let cell = self.screen.cell_mut(buffer_addr);
                    cell.fg = 0;
                    cell.bg = 0;
                    cell.gr = 0;
                    cell.ic = false;
                    buffer_addr = (buffer_addr + 1) % n;
                }
                Some(OrderCode::StartFieldExtended) => {
                    let Some(count) = self.next_byte() else {
                        return PdsResult::Failed;
                    };
                    let mut base = 0u8;
                    let mut xa = ExtendedAttributes::new();
                    for _ in 0..count {
                        let (Some(t), Some(v)) = (self.next_byte(), self.next_byte()) else {
                            return PdsResult::Failed;
                        };
                        if t == XA_3270 {
                            base = v;
                        } else if !xa.apply(t, v) {
                            debug!("SFE: unsupported attribute type 0x{t:02X}");
                        }
                    }
                    let cs = if xa.is_dbcs_charset() {
                        CharSet::Dbcs
                    } else if xa.charset == XA_CHARSET_GE {
                        CharSet::Ge
                    } else {
                        CharSet::Base
                    };
                    self.screen.add_fa(buffer_addr, base, cs);
                    let cell = self.screen.cell_mut(buffer_addr);
                    cell.fg = xa.foreground;
                    cell.bg = xa.background;
                    cell.gr = xa.highlighting;
                    cell.ic = xa.input_control_enabled();
                    buffer_addr = (buffer_addr + 1) % n;
                }
                Some(OrderCode::SetBufferAddress) => match self.read_buffer_address() {
                    Some(addr) => buffer_addr = addr,
                    None => return PdsResult::BadAddress,
                },
                Some(OrderCode::SetAttribute) => {
                    let (Some(t), Some(v)) = (self.next_byte(), self.next_byte()) else {
                        return PdsResult::Failed;
                    };
                    if t == XA_ALL {
                        attrs = ExtendedAttributes::new();
                    } else if !attrs.apply(t, v) {
                        debug!("SA: unsupported attribute type 0x{t:02X}");
                    }
                }
                Some(OrderCode::ModifyField) => {
                    let Some(count) = self.next_byte() else {
                        return PdsResult::Failed;
                    };
                    let is_fa = self.screen.cell(buffer_addr).is_fa();
                    for _ in 0..count {
                        let (Some(t), Some(v)) = (self.next_byte(), self.next_byte()) else {
                            return PdsResult::Failed;
                        };
                        if !is_fa {
                            continue;
                        }
                        let cell = self.screen.cell_mut(buffer_addr);
                        match t {
                            XA_3270 => cell.fa = field::fa_from_host(v),
                            XA_FOREGROUND => cell.fg = v,
                            XA_BACKGROUND => cell.bg = v,
                            XA_HIGHLIGHTING => cell.gr = v,
                            XA_INPUT_CONTROL => cell.ic = v == XAI_ENABLED,
                            XA_CHARSET => {
                                cell.cs = if v == XA_CHARSET_DBCS { CharSet::Dbcs } else { CharSet::Base }
                            }
                            _ => {}
                        }
                    }
                    if is_fa {
                        buffer_addr = (buffer_addr + 1) % n;
                    }
                }
                Some(OrderCode::InsertCursor) => cursor_target = Some(buffer_addr),
                Some(OrderCode::ProgramTab) => {
                    buffer_addr = self.program_tab(buffer_addr, last_was_data);
                }
                Some(OrderCode::RepeatToAddress) => {
                    let Some(stop) = self.read_buffer_address() else {
                        return PdsResult::BadAddress;
                    };
                    let Some(mut ch) = self.next_byte() else {
                        return PdsResult::Failed;
                    };
                    let mut cs = CharSet::Base;
                    if ch == ORDER_GE {
                        let Some(ge) = self.next_byte() else {
                            return PdsResult::Failed;
                        };
                        ch = ge;
                        cs = CharSet::Ge;
                    }
                    loop {
                        self.put_char(buffer_addr, ch, cs, &attrs);
                        buffer_addr = (buffer_addr + 1) % n;
                        if buffer_addr == stop {
                            break;
                        }
                    }
                }
                Some(OrderCode::EraseUnprotectedToAddress) => {
                    let Some(stop) = self.read_buffer_address() else {
                        return PdsResult::BadAddress;
                    };
                    loop {
                        if !self.screen.is_protected_at(buffer_addr) {
                            self.screen.add(buffer_addr, EBC_NULL, CharSet::Base);
                        }
                        buffer_addr = (buffer_addr + 1) % n;
                        if buffer_addr == stop {
                            break;
                        }
                    }
                }
                Some(OrderCode::GraphicEscape) => {
                    let Some(ch) = self.next_byte() else {
                        return PdsResult::Failed;
                    };
                    self.put_char(buffer_addr, ch, CharSet::Ge, &attrs);
                    buffer_addr = (buffer_addr + 1) % n;
                }
                None => {
                    let cs = if attrs.is_dbcs_charset() { CharSet::Dbcs } else { CharSet::Base };
                    self.put_char(buffer_addr, byte, cs, &attrs);
                    buffer_addr = (buffer_addr + 1) % n;
                }
            }
            last_was_data = order.is_none();
        }

        if let Some(c) = cursor_target {
            self.screen.set_cursor(c);
        } else if erase {
            self.screen.set_cursor(0);
        }
        self.screen.dbcs_postprocess();
        self.writes.push(HostWrite {
            restore: wcc & WCC_RESTORE != 0,
            alarm: wcc & WCC_ALARM != 0,
        });
        PdsResult::OkayNoOutput
    }

    fn put_char(&mut self, addr: usize, cc: u8, cs: CharSet, attrs: &ExtendedAttributes) {
        self.screen.remove_fa(addr);
        self.screen.add(addr, cc, cs);
        let cell = self.screen.cell_mut(addr);
        cell.fg = attrs.foreground;
        cell.bg = attrs.background;
        cell.gr = attrs.highlighting;
    }

    /// Program Tab: skip to the next unprotected field, nulling the rest of
    /// the current field when the previous item was data.
    fn program_tab(&mut self, addr: usize, last_was_data: bool) -> usize {
        let cell = self.screen.cell(addr);
        let next = self.screen.inc(addr);
        if cell.is_fa() && !field::is_protected(cell.fa) && !self.screen.cell(next).is_fa() {
            return next;
        }
        if last_was_data {
            let mut a = addr;
            while !self.screen.cell(a).is_fa() {
                self.screen.add(a, EBC_NULL, CharSet::Base);
                a = self.screen.inc(a);
                if a == 0 {
                    return 0;
                }
            }
        }
        let target = self.screen.next_unprotected(addr);
        if target <= addr {
            0
        } else {
            target
        }
    }

    /// Erase All Unprotected: null every unprotected field, reset MDTs,
    /// cursor to the first unprotected field.
    fn process_erase_all_unprotected(&mut self) {
        if self.screen.formatted() {
            let n = self.screen.len();
            let mut first_input: Option<usize> = None;
            for a in 0..n {
                let cell = *self.screen.cell(a);
                if cell.is_fa() && !field::is_protected(cell.fa) {
                    self.screen.cell_mut(a).fa &= !FA_MODIFY;
                    let mut b = self.screen.inc(a);
                    if first_input.is_none() && !self.screen.cell(b).is_fa() {
                        first_input = Some(b);
                    }
                    while !self.screen.cell(b).is_fa() {
                        self.screen.add(b, EBC_NULL, CharSet::Base);
                        b = self.screen.inc(b);
                    }
                }
            }
            self.screen.set_cursor(first_input.unwrap_or(0));
        } else {
            self.screen.clear();
        }
        self.screen.dbcs_postprocess();
        self.writes.push(HostWrite { restore: true, alarm: false });
    }

    /// Process Write Structured Field
    fn process_write_structured_field(&mut self) -> PdsResult {
        let mut reply: Option<Vec<u8>> = None;
        while self.pos < self.data.len() {
            if self.pos + 2 > self.data.len() {
                return PdsResult::Failed;
            }
            let mut length = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]) as usize;
            if length == 0 {
                length = self.data.len() - self.pos;
            }
            if length < 3 || self.pos + length > self.data.len() {
                return PdsResult::Failed;
            }
            let data = self.data;
            let sf_id = data[self.pos + 2];
            let body = &data[self.pos + 3..self.pos + length];
            self.pos += length;

            match sf_id {
                SF_READ_PARTITION => {
                    if body.len() >= 2 && (body[1] == SF_RP_QUERY || body[1] == SF_RP_QLIST) {
                        reply = Some(query_reply(self.screen));
                    } else {
                        debug!("WSF: unsupported Read Partition type {:?}", body.get(1));
                    }
                }
                SF_ERASE_RESET => {
                    self.screen.clear();
                    self.screen.set_reply_mode(ReplyMode::Field);
                }
                SF_SET_REPLY_MODE => {
                    let mode = match body.get(1) {
                        Some(&SF_SRM_FIELD) => ReplyMode::Field,
                        Some(&SF_SRM_XFIELD) => ReplyMode::ExtendedField,
                        Some(&SF_SRM_CHAR) => ReplyMode::Character,
                        _ => return PdsResult::Failed,
                    };
                    debug!("WSF: reply mode {:?}", mode);
                    self.screen.set_reply_mode(mode);
                }
                SF_OUTBOUND_3270DS => {
                    // Partition byte, then an embedded command.
                    if body.len() < 2 {
                        return PdsResult::Failed;
                    }
                    let mut inner = DataStreamParser::new(&body[1..], self.screen, self.aid);
                    let result = inner.parse_command();
                    self.writes.extend(inner.writes);
                    match result {
                        PdsResult::OkayNoOutput => {}
                        PdsResult::OkayOutput(out) => reply = Some(out),
                        err => return err,
                    }
                }
                other => debug!("WSF: ignoring structured field 0x{other:02X}"),
            }
        }
        match reply {
            Some(out) => PdsResult::OkayOutput(out),
            None => PdsResult::OkayNoOutput,
        }
    }

    /// Read a buffer address (12-bit or 14-bit); None when out of range
    fn read_buffer_address(&mut self) -> Option<usize> {
        let b1 = self.next_byte()?;
        let b2 = self.next_byte()?;
        let addr = addressing::decode_address(b1, b2) as usize;
        if addr >= self.screen.len() {
            debug!("Buffer address {addr} out of range");
            None
        } else {
            Some(addr)
        }
    }
}

/// Query Reply for a Read Partition Query: summary, usable area, color,
/// highlighting, reply modes and implicit partition.
fn query_reply(screen: &ScreenBuffer) -> Vec<u8> {
    let rows = screen.rows() as u16;
    let cols = screen.cols() as u16;
    let mut out = vec![AID_STRUCTURED_FIELD];

    let mut push_sf = |body: &[u8]| {
        let len = (body.len() + 2) as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(body);
    };

    push_sf(&[0x81, QR_SUMMARY, QR_SUMMARY, QR_USABLE_AREA, QR_COLOR, QR_HIGHLIGHTING, QR_REPLY_MODES, QR_IMP_PART]);

    let mut usable = vec![0x81, QR_USABLE_AREA, 0x01, 0x00];
    usable.extend_from_slice(&cols.to_be_bytes());
    usable.extend_from_slice(&rows.to_be_bytes());
    usable.extend_from_slice(&[0x01, 0x00, 0x0A, 0x02, 0xE5, 0x00, 0x02, 0x00, 0x6F, 0x09, 0x0C]);
    usable.extend_from_slice(&((rows * cols).to_be_bytes()));
    push_sf(&usable);

    let mut color = vec![0x81, QR_COLOR, 0x00, 0x08, 0x00, 0xF4];
    for c in 0xF1..=0xF7u8 {
        color.push(c);
        color.push(c);
    }
    push_sf(&color);

    push_sf(&[0x81, QR_HIGHLIGHTING, 0x04, 0x00, 0xF0, 0xF1, 0xF1, 0xF2, 0xF2, 0xF4, 0xF4]);
    push_sf(&[0x81, QR_REPLY_MODES, SF_SRM_FIELD, SF_SRM_XFIELD, SF_SRM_CHAR]);

    let mut imp = vec![0x81, QR_IMP_PART, 0x00, 0x00, 0x0B, 0x01, 0x00, 0x00, 80, 0x00, 24];
    imp.extend_from_slice(&cols.to_be_bytes());
    imp.extend_from_slice(&rows.to_be_bytes());
    push_sf(&imp);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib3270::display::ScreenSize;

    fn screen() -> ScreenBuffer {
        ScreenBuffer::new(ScreenSize::Model2)
    }

    #[test]
    fn test_write_command_with_wcc() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        let data = [CMD_WRITE, WCC_RESTORE | WCC_ALARM, 0xC8, 0xC9];
        assert_eq!(p.process_ds(&mut s, &data), PdsResult::OkayNoOutput);
        assert_eq!(s.cell(0).cc, 0xC8);
        assert_eq!(s.cell(1).cc, 0xC9);
        assert_eq!(p.take_writes(), vec![HostWrite { restore: true, alarm: true }]);
        assert!(p.take_writes().is_empty());
    }

    #[test]
    fn test_erase_write_and_orders() {
        let mut s = screen();
        s.add(100, 0xC1, CharSet::Base);
        let mut p = DataStreamProcessor::new();
        // EW, WCC, SBA(80), SF(unprotected), IC, data
        let (b1, b2) = addressing::encode_12bit_address(80);
        let data = [CMD_ERASE_WRITE, 0x00, ORDER_SBA, b1, b2, ORDER_SF, 0x00, ORDER_IC, 0xC1];
        assert_eq!(p.process_ds(&mut s, &data), PdsResult::OkayNoOutput);
        assert_eq!(s.cell(100).cc, 0x00);
        assert!(s.cell(80).is_fa());
        assert_eq!(s.cell(81).cc, 0xC1);
        assert_eq!(s.cursor(), 81);
    }

    #[test]
    fn test_sna_command_codes_accepted() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        assert_eq!(p.process_ds(&mut s, &[SNA_CMD_ERASE_WRITE, 0x00, 0xC1]), PdsResult::OkayNoOutput);
        assert_eq!(s.cell(0).cc, 0xC1);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        assert_eq!(p.process_ds(&mut s, &[0x99]), PdsResult::BadCommand);
    }

    #[test]
    fn test_bad_address_rejected() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        // 14-bit address 0x3FFF is past the end of a 1920-cell buffer.
        let data = [CMD_WRITE, 0x00, ORDER_SBA, 0x3F, 0xFF];
        assert_eq!(p.process_ds(&mut s, &data), PdsResult::BadAddress);
    }

    #[test]
    fn test_repeat_to_address() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        let (b1, b2) = addressing::encode_12bit_address(5);
        let data = [CMD_WRITE, 0x00, ORDER_RA, b1, b2, 0x5C];
        p.process_ds(&mut s, &data);
        for a in 0..5 {
            assert_eq!(s.cell(a).cc, 0x5C);
        }
        assert_eq!(s.cell(5).cc, 0x00);
    }

    #[test]
    fn test_read_modified_sends_modified_fields() {
        let mut s = screen();
        s.add_fa(0, FA_PROTECT, CharSet::Base);
        s.add_fa(10, FA_MODIFY, CharSet::Base);
        s.add(11, 0xC1, CharSet::Base);
        s.add(12, 0xC2, CharSet::Base);
        s.add_fa(20, FA_PROTECT, CharSet::Base);
        s.set_cursor(13);
        let out = read_modified(&s, AID_ENTER, false);
        let (c1, c2) = addressing::encode_12bit_address(13);
        let (a1, a2) = addressing::encode_12bit_address(11);
        assert_eq!(out, vec![AID_ENTER, c1, c2, ORDER_SBA, a1, a2, 0xC1, 0xC2]);
    }

    #[test]
    fn test_read_modified_short_read() {
        let s = screen();
        assert_eq!(read_modified(&s, AID_CLEAR, false), vec![AID_CLEAR]);
        assert_eq!(read_modified(&s, AID_PA1, false), vec![AID_PA1]);
        assert_eq!(read_modified(&s, AID_PA1, true).len(), 3);
    }

    #[test]
    fn test_read_buffer_command_replies() {
        let mut s = ScreenBuffer::with_geometry(1, 4);
        s.add_fa(0, 0, CharSet::Base);
        s.add(1, 0xC1, CharSet::Base);
        let mut p = DataStreamProcessor::new();
        match p.process_ds(&mut s, &[CMD_READ_BUFFER]) {
            PdsResult::OkayOutput(out) => {
                assert_eq!(out[0], AID_NO_AID);
                assert_eq!(&out[3..], &[ORDER_SF, 0xC0, 0xC1, 0x00, 0x00]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_erase_all_unprotected() {
        let mut s = screen();
        s.add_fa(0, FA_PROTECT, CharSet::Base);
        s.add(1, 0xC1, CharSet::Base);
        s.add_fa(5, FA_MODIFY, CharSet::Base);
        s.add(6, 0xC2, CharSet::Base);
        s.add_fa(9, FA_PROTECT, CharSet::Base);
        let mut p = DataStreamProcessor::new();
        p.process_ds(&mut s, &[CMD_ERASE_ALL_UNPROTECTED]);
        assert_eq!(s.cell(1).cc, 0xC1);
        assert_eq!(s.cell(6).cc, 0x00);
        assert!(!field::is_modified(s.cell(5).fa));
        assert_eq!(s.cursor(), 6);
        assert_eq!(p.take_writes(), vec![HostWrite { restore: true, alarm: false }]);
    }

    #[test]
    fn test_read_partition_query() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        let data = [CMD_WRITE_STRUCTURED_FIELD, 0x00, 0x05, SF_READ_PARTITION, 0xFF, SF_RP_QUERY];
        match p.process_ds(&mut s, &data) {
            PdsResult::OkayOutput(out) => {
                assert_eq!(out[0], AID_STRUCTURED_FIELD);
                assert_eq!(&out[3..5], &[0x81, QR_SUMMARY]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_set_reply_mode() {
        let mut s = screen();
        let mut p = DataStreamProcessor::new();
        let data = [CMD_WRITE_STRUCTURED_FIELD, 0x00, 0x05, SF_SET_REPLY_MODE, 0x00, SF_SRM_CHAR];
        assert_eq!(p.process_ds(&mut s, &data), PdsResult::OkayNoOutput);
        assert_eq!(s.reply_mode(), ReplyMode::Character);
    }

    #[test]
    fn test_sscp_lu_write() {
        let mut s = ScreenBuffer::with_geometry(3, 10);
        let mut p = DataStreamProcessor::new();
        p.write_sscp_lu(&mut s, &[0xC1, 0x15, 0xC2]);
        assert_eq!(s.cell(0).cc, 0xC1);
        assert_eq!(s.cell(10).cc, 0xC2);
        assert_eq!(s.cursor(), 11);
    }
}
