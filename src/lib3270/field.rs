//! Field attribute logic for 3270
//!
//! A field attribute (FA) occupies one buffer cell and governs every cell up
//! to the next FA. Attributes are stored with the printable bits (0xC0) set,
//! so a stored value is never zero; zero in a cell's `fa` slot means "not an
//! attribute cell".

use super::codes::*;

/// Normalize a host-supplied attribute byte into its stored form.
pub fn fa_from_host(byte: u8) -> u8 {
    (byte & !FA_PRINTABLE) | FA_PRINTABLE
}

/// Check if field is protected
pub fn is_protected(fa: u8) -> bool {
    fa & FA_PROTECT != 0
}

/// Check if field is numeric
pub fn is_numeric(fa: u8) -> bool {
    fa & FA_NUMERIC != 0
}

/// Protected and numeric together make an auto-skip field.
pub fn is_skip(fa: u8) -> bool {
    is_protected(fa) && is_numeric(fa)
}

/// Light-pen selectable (detectable) field
pub fn is_selectable(fa: u8) -> bool {
    let i = fa & FA_INTENSITY;
    i == FA_INT_NORM_SEL || i == FA_INT_HIGH_SEL
}

/// Non-display field
pub fn is_zero(fa: u8) -> bool {
    fa & FA_INTENSITY == FA_INT_ZERO_NSEL
}

/// Intensified display
pub fn is_high(fa: u8) -> bool {
    fa & FA_INTENSITY == FA_INT_HIGH_SEL
}

/// Check if Modified Data Tag (MDT) is set
pub fn is_modified(fa: u8) -> bool {
    fa & FA_MODIFY != 0
}

/// Extended attributes attached to a field or to individual characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedAttributes {
    pub foreground: u8,
    pub background: u8,
    pub highlighting: u8,
    pub charset: u8,
    pub validation: u8,
    pub outlining: u8,
    pub input_control: u8,
}

impl ExtendedAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one type/value pair from an SFE, SA or MF order.
    /// Returns false for types this terminal does not implement.
    pub fn apply(&mut self, attr_type: u8, value: u8) -> bool {
        match attr_type {
            XA_FOREGROUND => self.foreground = value,
            XA_BACKGROUND => self.background = value,
            XA_HIGHLIGHTING => self.highlighting = value,
            XA_CHARSET => self.charset = value,
            XA_VALIDATION => self.validation = value,
            XA_OUTLINING => self.outlining = value,
            XA_INPUT_CONTROL => self.input_control = value,
            XA_TRANSPARENCY => {}
            _ => return false,
        }
        true
    }

    pub fn is_dbcs_charset(&self) -> bool {
        self.charset == XA_CHARSET_DBCS
    }

    /// Field accepts DBCS input (input control enabled)
    pub fn input_control_enabled(&self) -> bool {
        self.input_control == XAI_ENABLED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fa_from_host_sets_printable_bits() {
        assert_eq!(fa_from_host(0x00), 0xC0);
        assert_eq!(fa_from_host(0x20), 0xE0);
        assert_eq!(fa_from_host(0xF1), 0xF1);
    }

    #[test]
    fn test_attribute_predicates() {
        let fa = fa_from_host(FA_PROTECT | FA_NUMERIC);
        assert!(is_protected(fa));
        assert!(is_numeric(fa));
        assert!(is_skip(fa));

        let fa = fa_from_host(FA_INT_HIGH_SEL | FA_MODIFY);
        assert!(!is_protected(fa));
        assert!(is_selectable(fa));
        assert!(is_high(fa));
        assert!(is_modified(fa));
        assert!(!is_zero(fa));

        assert!(is_zero(fa_from_host(FA_INT_ZERO_NSEL)));
        assert!(!is_selectable(fa_from_host(FA_INT_ZERO_NSEL)));
    }

    #[test]
    fn test_extended_attribute_apply() {
        let mut xa = ExtendedAttributes::new();
        assert!(xa.apply(XA_FOREGROUND, 0xF2));
        assert!(xa.apply(XA_CHARSET, XA_CHARSET_DBCS));
        assert!(xa.apply(XA_INPUT_CONTROL, XAI_ENABLED));
        assert!(!xa.apply(0x99, 0x01));
        assert_eq!(xa.foreground, 0xF2);
        assert!(xa.is_dbcs_charset());
        assert!(xa.input_control_enabled());
    }
}
