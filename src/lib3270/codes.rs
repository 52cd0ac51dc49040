/// TN3270 Protocol Constants and Codes
///
/// This module contains the IBM 3270 data-stream constants: command codes
/// (both the local-channel and SNA encodings), order codes, WCC bits, AID
/// values, field and extended attributes, and the EBCDIC control
/// characters the keyboard engine treats specially.
///
/// # References
/// - RFC 1576: TN3270 Current Practices
/// - RFC 2355: TN3270 Enhancements
/// - IBM 3270 Data Stream Programmer's Reference (GA23-0059)

/// 3270 Command Codes
///
/// Hosts may send either the local (CCW) or the SNA form of each command.
pub const CMD_WRITE: u8 = 0x01;              // Write
pub const CMD_ERASE_WRITE: u8 = 0x05;        // Erase/Write
pub const CMD_ERASE_WRITE_ALTERNATE: u8 = 0x0D; // Erase/Write Alternate
pub const CMD_READ_BUFFER: u8 = 0x02;        // Read Buffer
pub const CMD_READ_MODIFIED: u8 = 0x06;      // Read Modified
pub const CMD_READ_MODIFIED_ALL: u8 = 0x0E;  // Read Modified All
pub const CMD_ERASE_ALL_UNPROTECTED: u8 = 0x0F; // Erase All Unprotected
pub const CMD_WRITE_STRUCTURED_FIELD: u8 = 0x11; // Write Structured Field

pub const SNA_CMD_WRITE: u8 = 0xF1;
pub const SNA_CMD_ERASE_WRITE: u8 = 0xF5;
pub const SNA_CMD_ERASE_WRITE_ALTERNATE: u8 = 0x7E;
pub const SNA_CMD_READ_BUFFER: u8 = 0xF2;
pub const SNA_CMD_READ_MODIFIED: u8 = 0xF6;
pub const SNA_CMD_READ_MODIFIED_ALL: u8 = 0x6E;
pub const SNA_CMD_ERASE_ALL_UNPROTECTED: u8 = 0x6F;
pub const SNA_CMD_WRITE_STRUCTURED_FIELD: u8 = 0xF3;

/// 3270 Order Codes
pub const ORDER_SF: u8 = 0x1D;    // Start Field
pub const ORDER_SFE: u8 = 0x29;   // Start Field Extended
pub const ORDER_SBA: u8 = 0x11;   // Set Buffer Address
pub const ORDER_SA: u8 = 0x28;    // Set Attribute
pub const ORDER_MF: u8 = 0x2C;    // Modify Field
pub const ORDER_IC: u8 = 0x13;    // Insert Cursor
pub const ORDER_PT: u8 = 0x05;    // Program Tab
pub const ORDER_RA: u8 = 0x3C;    // Repeat to Address
pub const ORDER_EUA: u8 = 0x12;   // Erase Unprotected to Address
pub const ORDER_GE: u8 = 0x08;    // Graphic Escape

/// Write Control Character (WCC) Bits
pub const WCC_RESET: u8 = 0x40;           // Reset partition characteristics
pub const WCC_ALARM: u8 = 0x04;           // Sound alarm
pub const WCC_RESTORE: u8 = 0x02;         // Restore (unlock) keyboard
pub const WCC_RESET_MDT: u8 = 0x01;       // Reset MDT bits

/// AID (Attention Identifier) values
pub const AID_NO_AID: u8 = 0x60;
pub const AID_STRUCTURED_FIELD: u8 = 0x88;
pub const AID_ENTER: u8 = 0x7D;
pub const AID_CLEAR: u8 = 0x6D;
pub const AID_SYSREQ: u8 = 0xF0;
pub const AID_SELECT: u8 = 0x7E;          // Light-pen select
pub const AID_PA1: u8 = 0x6C;
pub const AID_PA2: u8 = 0x6E;
pub const AID_PA3: u8 = 0x6B;

/// PF1..PF24 AID values, indexed by key number - 1
pub const PF_AIDS: [u8; 24] = [
    0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0x7A, 0x7B, 0x7C,
    0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0x4A, 0x4B, 0x4C,
];

/// PA1..PA3 AID values, indexed by key number - 1
pub const PA_AIDS: [u8; 3] = [AID_PA1, AID_PA2, AID_PA3];

/// Field Attribute Byte Bits
pub const FA_PRINTABLE: u8 = 0xC0;        // Makes the stored attribute byte printable
pub const FA_PROTECT: u8 = 0x20;          // Protected field
pub const FA_NUMERIC: u8 = 0x10;          // Numeric field
pub const FA_INTENSITY: u8 = 0x0C;        // Display/intensity bits
pub const FA_INT_NORM_NSEL: u8 = 0x00;    // Normal, not selectable
pub const FA_INT_NORM_SEL: u8 = 0x04;     // Normal, light-pen selectable
pub const FA_INT_HIGH_SEL: u8 = 0x08;     // Intensified, selectable
pub const FA_INT_ZERO_NSEL: u8 = 0x0C;    // Non-display
pub const FA_RESERVED: u8 = 0x02;
pub const FA_MODIFY: u8 = 0x01;           // Modified Data Tag

/// Extended Field Attribute Types (SFE, SA, MF)
pub const XA_ALL: u8 = 0x00;
pub const XA_3270: u8 = 0xC0;
pub const XA_VALIDATION: u8 = 0xC1;
pub const XA_OUTLINING: u8 = 0xC2;
pub const XA_HIGHLIGHTING: u8 = 0x41;
pub const XA_FOREGROUND: u8 = 0x42;
pub const XA_CHARSET: u8 = 0x43;
pub const XA_BACKGROUND: u8 = 0x45;
pub const XA_TRANSPARENCY: u8 = 0x46;
pub const XA_INPUT_CONTROL: u8 = 0xFE;

/// Input control value that enables DBCS input in a field
pub const XAI_ENABLED: u8 = 0x01;

/// Character set value selecting the DBCS character set
pub const XA_CHARSET_DBCS: u8 = 0xF8;
/// Character set value selecting graphic-escape (APL) characters
pub const XA_CHARSET_GE: u8 = 0xF1;

/// Structured field identifiers
pub const SF_READ_PARTITION: u8 = 0x01;
pub const SF_ERASE_RESET: u8 = 0x03;
pub const SF_SET_REPLY_MODE: u8 = 0x09;
pub const SF_OUTBOUND_3270DS: u8 = 0x40;

/// Read Partition operation types
pub const SF_RP_QUERY: u8 = 0x02;
pub const SF_RP_QLIST: u8 = 0x03;

/// Set Reply Mode values
pub const SF_SRM_FIELD: u8 = 0x00;
pub const SF_SRM_XFIELD: u8 = 0x01;
pub const SF_SRM_CHAR: u8 = 0x02;

/// Query reply codes
pub const QR_SUMMARY: u8 = 0x80;
pub const QR_USABLE_AREA: u8 = 0x81;
pub const QR_COLOR: u8 = 0x86;
pub const QR_HIGHLIGHTING: u8 = 0x87;
pub const QR_REPLY_MODES: u8 = 0x88;
pub const QR_IMP_PART: u8 = 0xA6;

/// EBCDIC characters with keyboard significance
pub const EBC_NULL: u8 = 0x00;
pub const EBC_SO: u8 = 0x0E;
pub const EBC_SI: u8 = 0x0F;
pub const EBC_DUP: u8 = 0x1C;
pub const EBC_FM: u8 = 0x1E;
pub const EBC_SPACE: u8 = 0x40;
pub const EBC_PERIOD: u8 = 0x4B;
pub const EBC_AMPERSAND: u8 = 0x50;
pub const EBC_MINUS: u8 = 0x60;
pub const EBC_UNDERSCORE: u8 = 0x6D;
pub const EBC_GREATER: u8 = 0x6E;
pub const EBC_QUESTION: u8 = 0x6F;
pub const EBC_0: u8 = 0xF0;
pub const EBC_9: u8 = 0xF9;

/// Enum representation of 3270 command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Write = CMD_WRITE as isize,
    EraseWrite = CMD_ERASE_WRITE as isize,
    EraseWriteAlternate = CMD_ERASE_WRITE_ALTERNATE as isize,
    ReadBuffer = CMD_READ_BUFFER as isize,
    ReadModified = CMD_READ_MODIFIED as isize,
    ReadModifiedAll = CMD_READ_MODIFIED_ALL as isize,
    EraseAllUnprotected = CMD_ERASE_ALL_UNPROTECTED as isize,
    WriteStructuredField = CMD_WRITE_STRUCTURED_FIELD as isize,
}

impl CommandCode {
    /// Decode either encoding of a command byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            CMD_WRITE | SNA_CMD_WRITE => Some(Self::Write),
            CMD_ERASE_WRITE | SNA_CMD_ERASE_WRITE => Some(Self::EraseWrite),
            CMD_ERASE_WRITE_ALTERNATE | SNA_CMD_ERASE_WRITE_ALTERNATE => {
                Some(Self::EraseWriteAlternate)
            }
            CMD_READ_BUFFER | SNA_CMD_READ_BUFFER => Some(Self::ReadBuffer),
            CMD_READ_MODIFIED | SNA_CMD_READ_MODIFIED => Some(Self::ReadModified),
            CMD_READ_MODIFIED_ALL | SNA_CMD_READ_MODIFIED_ALL => Some(Self::ReadModifiedAll),
            CMD_ERASE_ALL_UNPROTECTED | SNA_CMD_ERASE_ALL_UNPROTECTED => {
                Some(Self::EraseAllUnprotected)
            }
            CMD_WRITE_STRUCTURED_FIELD | SNA_CMD_WRITE_STRUCTURED_FIELD => {
                Some(Self::WriteStructuredField)
            }
            _ => None,
        }
    }

    /// Local (CCW) encoding of the command
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Enum representation of 3270 order codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCode {
    StartField = ORDER_SF as isize,
    StartFieldExtended = ORDER_SFE as isize,
    SetBufferAddress = ORDER_SBA as isize,
    SetAttribute = ORDER_SA as isize,
    ModifyField = ORDER_MF as isize,
    InsertCursor = ORDER_IC as isize,
    ProgramTab = ORDER_PT as isize,
    RepeatToAddress = ORDER_RA as isize,
    EraseUnprotectedToAddress = ORDER_EUA as isize,
    GraphicEscape = ORDER_GE as isize,
}

impl OrderCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            ORDER_SF => Some(Self::StartField),
            ORDER_SFE => Some(Self::StartFieldExtended),
            ORDER_SBA => Some(Self::SetBufferAddress),
            ORDER_SA => Some(Self::SetAttribute),
            ORDER_MF => Some(Self::ModifyField),
            ORDER_IC => Some(Self::InsertCursor),
            ORDER_PT => Some(Self::ProgramTab),
            ORDER_RA => Some(Self::RepeatToAddress),
            ORDER_EUA => Some(Self::EraseUnprotectedToAddress),
            ORDER_GE => Some(Self::GraphicEscape),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Attention keys the keyboard engine can generate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AidKey {
    NoAid,
    Enter,
    Clear,
    SysReq,
    Select,
    Pf(u8),
    Pa(u8),
}

impl AidKey {
    /// Decode an AID byte received in (or destined for) an inbound record
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            AID_NO_AID => Some(Self::NoAid),
            AID_ENTER => Some(Self::Enter),
            AID_CLEAR => Some(Self::Clear),
            AID_SYSREQ => Some(Self::SysReq),
            AID_SELECT => Some(Self::Select),
            _ => {
                if let Some(i) = PF_AIDS.iter().position(|&a| a == value) {
                    Some(Self::Pf(i as u8 + 1))
                } else {
                    PA_AIDS.iter().position(|&a| a == value).map(|i| Self::Pa(i as u8 + 1))
                }
            }
        }
    }

    /// Encode as an AID byte. Out-of-range PF/PA numbers have no encoding.
    pub fn to_u8(self) -> Option<u8> {
        match self {
            Self::NoAid => Some(AID_NO_AID),
            Self::Enter => Some(AID_ENTER),
            Self::Clear => Some(AID_CLEAR),
            Self::SysReq => Some(AID_SYSREQ),
            Self::Select => Some(AID_SELECT),
            Self::Pf(n) if (1..=24).contains(&n) => Some(PF_AIDS[n as usize - 1]),
            Self::Pa(n) if (1..=3).contains(&n) => Some(PA_AIDS[n as usize - 1]),
            _ => None,
        }
    }

    /// True for the AIDs that only tell the host a key was pressed
    /// (no field data is sent): Clear and the PA keys.
    pub fn is_short_read(self) -> bool {
        matches!(self, Self::Clear | Self::Pa(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_code_conversion() {
        assert_eq!(CommandCode::from_u8(CMD_WRITE), Some(CommandCode::Write));
        assert_eq!(CommandCode::from_u8(SNA_CMD_WRITE), Some(CommandCode::Write));
        assert_eq!(CommandCode::from_u8(SNA_CMD_ERASE_WRITE_ALTERNATE), Some(CommandCode::EraseWriteAlternate));
        assert_eq!(CommandCode::Write.to_u8(), CMD_WRITE);
        assert_eq!(CommandCode::from_u8(0xFF), None);
    }

    #[test]
    fn test_order_code_conversion() {
        assert_eq!(OrderCode::from_u8(ORDER_SF), Some(OrderCode::StartField));
        assert_eq!(OrderCode::StartField.to_u8(), ORDER_SF);
        assert_eq!(OrderCode::from_u8(0xFF), None);
    }

    #[test]
    fn test_aid_key_conversion() {
        assert_eq!(AidKey::from_u8(AID_ENTER), Some(AidKey::Enter));
        assert_eq!(AidKey::Enter.to_u8(), Some(AID_ENTER));
        assert_eq!(AidKey::from_u8(0xF1), Some(AidKey::Pf(1)));
        assert_eq!(AidKey::from_u8(0x4C), Some(AidKey::Pf(24)));
        assert_eq!(AidKey::Pa(2).to_u8(), Some(AID_PA2));
        assert_eq!(AidKey::Pf(25).to_u8(), None);
    }

    #[test]
    fn test_field_attribute_bits() {
        let skip = FA_PROTECT | FA_NUMERIC;
        assert_eq!(skip & FA_PROTECT, FA_PROTECT);
        assert_eq!(skip & FA_NUMERIC, FA_NUMERIC);
        assert_eq!(FA_INT_ZERO_NSEL & FA_INTENSITY, FA_INTENSITY);
    }
}
