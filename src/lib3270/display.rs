//! TN3270 Display Buffer Management
//!
//! The screen buffer is a flat vector of cells addressed by a linear buffer
//! address that wraps modulo `rows * cols`. Field attributes partition the
//! buffer into fields; a buffer without any attribute cell is "unformatted"
//! and editing falls back to line boundaries.
//!
//! Every scan in this module is bounded by a return to its starting address,
//! so an unformatted buffer never causes an endless loop.

use std::fmt;

use super::codes::*;
use super::field;
use crate::ebcdic::ebcdic_to_display;

use serde::{Deserialize, Serialize};

/// Standard 3270 screen sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenSize {
    /// Model 2: 24 rows x 80 columns (1920 characters)
    Model2,
    /// Model 3: 32 rows x 80 columns (2560 characters)
    Model3,
    /// Model 4: 43 rows x 80 columns (3440 characters)
    Model4,
    /// Model 5: 27 rows x 132 columns (3564 characters)
    Model5,
}

impl ScreenSize {
    /// Map a model number (2-5) to a size
    pub fn from_model(model: i64) -> Option<Self> {
        match model {
            2 => Some(Self::Model2),
            3 => Some(Self::Model3),
            4 => Some(Self::Model4),
            5 => Some(Self::Model5),
            _ => None,
        }
    }

    pub fn model_number(&self) -> u8 {
        match self {
            Self::Model2 => 2,
            Self::Model3 => 3,
            Self::Model4 => 4,
            Self::Model5 => 5,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Model2 => 24,
            Self::Model3 => 32,
            Self::Model4 => 43,
            Self::Model5 => 27,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Self::Model2 | Self::Model3 | Self::Model4 => 80,
            Self::Model5 => 132,
        }
    }

    /// Get the total buffer size (rows * cols)
    pub fn buffer_size(&self) -> usize {
        self.rows() * self.cols()
    }
}

/// Character set a cell is displayed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CharSet {
    #[default]
    Base,
    /// Graphic escape (APL) character
    Ge,
    /// Half of a double-byte character
    Dbcs,
}

/// DBCS role of a cell, recomputed by [`ScreenBuffer::dbcs_postprocess`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbcsState {
    #[default]
    None,
    /// Left half of a double-byte character
    Left,
    /// Right half of a double-byte character
    Right,
    /// Shift-out control opening a subfield
    So,
    /// Shift-in control closing a subfield
    Si,
    /// Single-byte cell directly after a subfield
    Sb,
    /// Left half in the last column, right half on the next row
    LeftWrap,
    RightWrap,
    /// Unpaired double-byte half
    Dead,
}

impl DbcsState {
    pub fn is_left(self) -> bool {
        matches!(self, Self::Left | Self::LeftWrap)
    }

    pub fn is_right(self) -> bool {
        matches!(self, Self::Right | Self::RightWrap)
    }

    pub fn is_dbcs(self) -> bool {
        self.is_left() || self.is_right()
    }
}

/// Why [`ScreenBuffer::lookleft_state`] considers a cell double-byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbcsWhy {
    None,
    /// The field's character-set attribute is DBCS
    Attribute,
    /// The cell is inside an SO/SI subfield
    Subfield,
}

/// One buffer position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenCell {
    /// Character code (EBCDIC)
    pub cc: u8,
    /// Field attribute byte, or 0 when the cell is not an attribute
    pub fa: u8,
    pub cs: CharSet,
    /// Field accepts DBCS input (input-control extended attribute)
    pub ic: bool,
    pub fg: u8,
    pub bg: u8,
    /// Highlighting
    pub gr: u8,
    pub db: DbcsState,
}

impl ScreenCell {
    pub fn is_fa(&self) -> bool {
        self.fa != 0
    }
}

/// Inbound reply mode set by the host with a Set Reply Mode structured field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    #[default]
    Field,
    ExtendedField,
    Character,
}

/// Outcome of [`ScreenBuffer::ins_prep`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertRoom {
    /// Cells were shifted right; the caller may write at the insert address
    Ready,
    /// Not enough room and reverse input is on: no error, nothing shifted
    NoRoom,
    /// Not enough room: operator overflow, nothing shifted
    Overflow,
}

/// 3270 screen buffer
#[derive(Debug, Clone)]
pub struct ScreenBuffer {
    rows: usize,
    cols: usize,
    cells: Vec<ScreenCell>,
    cursor: usize,
    reply_mode: ReplyMode,
    dbcs: bool,
}

impl ScreenBuffer {
    /// Create a buffer for a standard model
    pub fn new(size: ScreenSize) -> Self {
        Self::with_geometry(size.rows(), size.cols())
    }

    /// Create a buffer with arbitrary geometry
    pub fn with_geometry(rows: usize, cols: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Self {
            rows,
            cols,
            cells: vec![ScreenCell::default(); rows * cols],
            cursor: 0,
            reply_mode: ReplyMode::Field,
            dbcs: false,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of cells (rows * cols)
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn set_dbcs(&mut self, dbcs: bool) {
        self.dbcs = dbcs;
    }

    pub fn dbcs(&self) -> bool {
        self.dbcs
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.reply_mode
    }

    pub fn set_reply_mode(&mut self, mode: ReplyMode) {
        self.reply_mode = mode;
    }

    /// True when addresses need 14-bit encoding
    pub fn uses_14bit_addressing(&self) -> bool {
        self.len() > 0x1000
    }

    /// Advance one cell, wrapping at the end of the buffer
    pub fn inc(&self, addr: usize) -> usize {
        (addr + 1) % self.len()
    }

    /// Retreat one cell, wrapping at the start of the buffer
    pub fn dec(&self, addr: usize) -> usize {
        if addr == 0 {
            self.len() - 1
        } else {
            addr - 1
        }
    }

    /// Add a signed offset modulo the buffer size
    pub fn offset(&self, addr: usize, delta: isize) -> usize {
        let n = self.len() as isize;
        ((addr as isize + delta) % n + n) as usize % self.len()
    }

    pub fn row_of(&self, addr: usize) -> usize {
        addr / self.cols
    }

    pub fn col_of(&self, addr: usize) -> usize {
        addr % self.cols
    }

    pub fn address(&self, row: usize, col: usize) -> usize {
        (row * self.cols + col) % self.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor; out-of-range addresses wrap
    pub fn set_cursor(&mut self, addr: usize) {
        self.cursor = addr % self.len();
    }

    pub fn cell(&self, addr: usize) -> &ScreenCell {
        &self.cells[addr % self.cells.len()]
    }

    pub fn cell_mut(&mut self, addr: usize) -> &mut ScreenCell {
        let n = self.cells.len();
        &mut self.cells[addr % n]
    }

    pub fn cells(&self) -> &[ScreenCell] {
        &self.cells
    }

    /// Clear the whole buffer and home the cursor
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            *cell = ScreenCell::default();
        }
        self.cursor = 0;
    }

    /// A buffer is formatted when it contains at least one field attribute
    pub fn formatted(&self) -> bool {
        self.cells.iter().any(|c| c.is_fa())
    }

    /// Address of the attribute governing `addr` (which may be `addr` itself)
    pub fn find_field_attribute(&self, addr: usize) -> Option<usize> {
        let start = addr % self.len();
        let mut a = start;
        loop {
            if self.cells[a].is_fa() {
                return Some(a);
            }
            a = self.dec(a);
            if a == start {
                return None;
            }
        }
    }

    /// Attribute byte governing `addr`; 0 (unprotected) when unformatted
    pub fn get_field_attribute(&self, addr: usize) -> u8 {
        self.find_field_attribute(addr)
            .map(|fa| self.cells[fa].fa)
            .unwrap_or(0)
    }

    /// Whether `addr` is an attribute cell or lies in a protected field
    pub fn is_protected_at(&self, addr: usize) -> bool {
        self.cell(addr).is_fa() || field::is_protected(self.get_field_attribute(addr))
    }

    /// First cell of the next unprotected field after `addr0`, or 0 if none
    pub fn next_unprotected(&self, addr0: usize) -> usize {
        let mut next = addr0 % self.len();
        loop {
            let addr = next;
            next = self.inc(next);
            if self.cells[addr].is_fa()
                && !field::is_protected(self.cells[addr].fa)
                && !self.cells[next].is_fa()
            {
                return next;
            }
            if next == addr0 % self.len() {
                return 0;
            }
        }
    }

    /// Address of the next attribute strictly after `addr`, if any
    pub fn next_field_attribute(&self, addr: usize) -> Option<usize> {
        let start = addr % self.len();
        let mut a = self.inc(start);
        while a != start {
            if self.cells[a].is_fa() {
                return Some(a);
            }
            a = self.inc(a);
        }
        if self.cells[start].is_fa() {
            Some(start)
        } else {
            None
        }
    }

    /// Set the MDT of the field containing `addr`
    pub fn mdt_set(&mut self, addr: usize) {
        if let Some(fa) = self.find_field_attribute(addr) {
            self.cells[fa].fa |= FA_MODIFY;
        }
    }

    /// Clear the MDT of the field containing `addr`
    pub fn mdt_clear(&mut self, addr: usize) {
        if let Some(fa) = self.find_field_attribute(addr) {
            self.cells[fa].fa &= !FA_MODIFY;
        }
    }

    /// Clear every MDT in the buffer
    pub fn reset_all_mdt(&mut self) {
        for cell in &mut self.cells {
            if cell.is_fa() {
                cell.fa &= !FA_MODIFY;
            }
        }
    }

    /// Store a character, leaving any attribute byte in place
    pub fn add(&mut self, addr: usize, cc: u8, cs: CharSet) {
        let cell = self.cell_mut(addr);
        cell.cc = cc;
        cell.cs = cs;
    }

    /// Store a field attribute
    pub fn add_fa(&mut self, addr: usize, fa: u8, cs: CharSet) {
        let cell = self.cell_mut(addr);
        cell.fa = field::fa_from_host(fa);
        cell.cc = EBC_SPACE;
        cell.cs = cs;
        cell.db = DbcsState::None;
    }

    /// Remove the attribute from a cell, turning it back into a character cell
    pub fn remove_fa(&mut self, addr: usize) {
        let cell = self.cell_mut(addr);
        cell.fa = 0;
    }

    /// Reset `count` cells starting at `addr` to their blank state
    pub fn erase(&mut self, addr: usize, count: usize) {
        let mut a = addr % self.len();
        for _ in 0..count.min(self.len()) {
            self.cells[a] = ScreenCell::default();
            a = self.inc(a);
        }
    }

    /// Copy `count` cells from `from` to `to` with wraparound; overlapping
    /// ranges behave like `memmove`.
    pub fn wrapping_memmove(&mut self, to: usize, from: usize, count: usize) {
        let n = self.len();
        let count = count.min(n);
        let saved: Vec<ScreenCell> = (0..count).map(|i| self.cells[(from + i) % n]).collect();
        for (i, cell) in saved.into_iter().enumerate() {
            self.cells[(to + i) % n] = cell;
        }
    }

    /// Make room to insert `count` characters at `addr`.
    ///
    /// Scans from `addr` to the end of the field (or the end of the line when
    /// unformatted) for NULLs, counting trailing blank/underscore runs as
    /// free space when `blank_fill` is set. When enough space exists, the
    /// text between `addr` and each free run is shifted right over it.
    pub fn ins_prep(&mut self, addr: usize, count: usize, blank_fill: bool, reverse: bool) -> InsertRoom {
        let n = self.len();
        let next_faddr = match self.find_field_attribute(addr) {
            None => ((addr / self.cols + 1) * self.cols) % n,
            Some(faddr) => {
                let mut a = self.inc(faddr);
                while a != faddr && !self.cells[a].is_fa() {
                    a = self.inc(a);
                }
                a
            }
        };

        let mut xaddr = addr;
        let mut need = count;
        let mut ntb = 0usize;
        let mut tb_start: Option<usize> = None;
        while need > 0 && xaddr != next_faddr {
            let cc = self.cells[xaddr].cc;
            if cc == EBC_NULL {
                need -= 1;
            } else if blank_fill && (cc == EBC_SPACE || cc == EBC_UNDERSCORE) {
                if tb_start.is_none() {
                    tb_start = Some(xaddr);
                }
                ntb += 1;
            } else {
                tb_start = None;
                ntb = 0;
            }
            xaddr = self.inc(xaddr);
        }
        if need > ntb {
            return if reverse { InsertRoom::NoRoom } else { InsertRoom::Overflow };
        }

        let mut need = count;
        let mut xaddr = addr;
        while need > 0 && xaddr != next_faddr {
            let mut n_nulls = 0;
            let mut first_null: Option<usize> = None;
            while need > 0
                && (self.cells[xaddr].cc == EBC_NULL
                    || tb_start.map_or(false, |tb| xaddr >= tb))
            {
                need -= 1;
                n_nulls += 1;
                if first_null.is_none() {
                    first_null = Some(xaddr);
                }
                xaddr = self.inc(xaddr);
            }
            if let Some(first) = first_null {
                let copy_len = (first + n - addr) % n;
                let to = (addr + n_nulls) % n;
                if copy_len > 0 {
                    self.wrapping_memmove(to, addr, copy_len);
                }
            }
            xaddr = self.inc(xaddr);
        }
        InsertRoom::Ready
    }

    /// Stored DBCS state of a cell
    pub fn dbcs_state(&self, addr: usize) -> DbcsState {
        if self.dbcs {
            self.cell(addr).db
        } else {
            DbcsState::None
        }
    }

    /// Work out whether `addr` holds half of a double-byte character by
    /// looking left for the governing attribute or SO/SI control.
    pub fn lookleft_state(&self, addr: usize) -> (DbcsState, DbcsWhy) {
        if !self.dbcs {
            return (DbcsState::None, DbcsWhy::None);
        }
        let n = self.len();
        let addr = addr % n;
        let faddr = self.find_field_attribute(addr);

        if let Some(fa) = faddr {
            if fa != addr && self.cells[fa].cs == CharSet::Dbcs {
                let dist = (addr + n - fa - 1) % n;
                let state = if dist % 2 == 0 { DbcsState::Left } else { DbcsState::Right };
                return (state, DbcsWhy::Attribute);
            }
        }

        let stop = faddr.unwrap_or(addr);
        let mut a = addr;
        loop {
            a = self.dec(a);
            if a == stop {
                break;
            }
            match self.cells[a].cc {
                EBC_SI => break,
                EBC_SO => {
                    let dist = (addr + n - a - 1) % n;
                    let state = if dist % 2 == 0 { DbcsState::Left } else { DbcsState::Right };
                    return (state, DbcsWhy::Subfield);
                }
                _ => {}
            }
        }
        (DbcsState::None, DbcsWhy::None)
    }

    /// Recompute the DBCS state of every cell from the SO/SI controls,
    /// DBCS field attributes and DBCS character sets.
    pub fn dbcs_postprocess(&mut self) {
        if !self.dbcs {
            for cell in &mut self.cells {
                cell.db = DbcsState::None;
            }
            return;
        }
        let n = self.len();
        let start = (0..n).find(|&a| self.cells[a].is_fa()).unwrap_or(0);

        let mut in_subfield = false;
        let mut field_dbcs = false;
        let mut pending_left: Option<usize> = None;
        let mut after_si = false;
        let mut a = start;
        for _ in 0..n {
            let cell = self.cells[a];
            if cell.is_fa() {
                if let Some(left) = pending_left.take() {
                    self.cells[left].db = DbcsState::Dead;
                }
                in_subfield = false;
                field_dbcs = cell.cs == CharSet::Dbcs;
                after_si = false;
                self.cells[a].db = DbcsState::None;
            } else if !field_dbcs && cell.cc == EBC_SO && pending_left.is_none() {
                in_subfield = true;
                after_si = false;
                self.cells[a].db = DbcsState::So;
            } else if in_subfield && cell.cc == EBC_SI && pending_left.is_none() {
                in_subfield = false;
                after_si = true;
                self.cells[a].db = DbcsState::Si;
            } else if in_subfield || field_dbcs || cell.cs == CharSet::Dbcs {
                match pending_left.take() {
                    None => {
                        self.cells[a].db = DbcsState::Left;
                        pending_left = Some(a);
                    }
                    Some(left) => {
                        let wrapped = self.col_of(left) == self.cols - 1;
                        self.cells[left].db = if wrapped { DbcsState::LeftWrap } else { DbcsState::Left };
                        self.cells[a].db = if wrapped { DbcsState::RightWrap } else { DbcsState::Right };
                    }
                }
                after_si = false;
            } else {
                if let Some(left) = pending_left.take() {
                    self.cells[left].db = DbcsState::Dead;
                }
                self.cells[a].db = if after_si { DbcsState::Sb } else { DbcsState::None };
                after_si = false;
            }
            a = self.inc(a);
        }
        if let Some(left) = pending_left {
            self.cells[left].db = DbcsState::Dead;
        }
    }

    /// Scroll the whole buffer up one row (NVT mode), blanking the last row
    pub fn scroll_up(&mut self) {
        let cols = self.cols;
        self.cells.drain(0..cols);
        self.cells.extend(std::iter::repeat(ScreenCell::default()).take(cols));
    }

    /// Characters of one row, for screen dumps and tests
    pub fn row_text(&self, row: usize) -> String {
        let start = row * self.cols;
        self.cells[start..start + self.cols]
            .iter()
            .map(|c| if c.is_fa() { ' ' } else { ebcdic_to_display(c.cc) })
            .collect()
    }

    /// Contents of the field containing `addr` (attribute excluded)
    pub fn field_text(&self, addr: usize) -> String {
        let Some(fa) = self.find_field_attribute(addr) else {
            return String::new();
        };
        let mut out = String::new();
        let mut a = self.inc(fa);
        while !self.cells[a].is_fa() {
            out.push(ebcdic_to_display(self.cells[a].cc));
            a = self.inc(a);
        }
        out
    }
}

impl fmt::Display for ScreenBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for row in 0..self.rows {
            writeln!(f, "{}", self.row_text(row))?;
        }
        Ok(())
    }
}

/// Buffer address encoding and decoding utilities
pub mod addressing {
    /// Six-bit values encoded as printable EBCDIC address bytes
    const CODE_TABLE: [u8; 64] = [
        0x40, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7,
        0xC8, 0xC9, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
        0x50, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7,
        0xD8, 0xD9, 0x5A, 0x5B, 0x5C, 0x5D, 0x5E, 0x5F,
        0x60, 0x61, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7,
        0xE8, 0xE9, 0x6A, 0x6B, 0x6C, 0x6D, 0x6E, 0x6F,
        0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7,
        0xF8, 0xF9, 0x7A, 0x7B, 0x7C, 0x7D, 0x7E, 0x7F,
    ];

    /// Decode a two-byte buffer address. The top two bits of the first byte
    /// being zero selects 14-bit binary form; otherwise 12-bit coded form.
    pub fn decode_address(byte1: u8, byte2: u8) -> u16 {
        if byte1 & 0xC0 == 0 {
            (((byte1 & 0x3F) as u16) << 8) | byte2 as u16
        } else {
            (((byte1 & 0x3F) as u16) << 6) | (byte2 & 0x3F) as u16
        }
    }

    /// Encode a 12-bit address using the printable code table
    pub fn encode_12bit_address(address: u16) -> (u8, u8) {
        (
            CODE_TABLE[((address >> 6) & 0x3F) as usize],
            CODE_TABLE[(address & 0x3F) as usize],
        )
    }

    /// Encode a 14-bit binary address
    pub fn encode_14bit_address(address: u16) -> (u8, u8) {
        (((address >> 8) & 0x3F) as u8, (address & 0xFF) as u8)
    }

    /// Encode with the form appropriate to the buffer size
    pub fn encode_address(address: u16, fourteen_bit: bool) -> (u8, u8) {
        if fourteen_bit {
            encode_14bit_address(address)
        } else {
            encode_12bit_address(address)
        }
    }
}
