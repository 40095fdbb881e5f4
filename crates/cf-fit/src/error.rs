use std::ops::{BitAnd, BitOr, BitOrAssign};

use thiserror::Error;

/// Bit set of minimiser error conditions.
///
/// The constants reproduce the historical wire values, including three that
/// are not powers of two and overlap lower bits (`UNDERFLOW = 4196`,
/// `ERROR_PRESENT = 8392`, `INTRINSIC = 16784` instead of 4096/8192/16384).
/// Callers test with [`contains`](Self::contains) against the constant, not
/// against individual bits, so the packed encoding round-trips unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("minimiser error flags {0:#x}")]
pub struct ErrorFlags(pub u32);

impl ErrorFlags {
    pub const NONE: ErrorFlags = ErrorFlags(0);
    pub const STANDARD: ErrorFlags = ErrorFlags(1);
    pub const NULL_PASSED: ErrorFlags = ErrorFlags(2);
    pub const OBSOLETE_OP: ErrorFlags = ErrorFlags(4);
    pub const MEMORY_ALLOC: ErrorFlags = ErrorFlags(8);
    pub const MEMORY_LEAK: ErrorFlags = ErrorFlags(16);
    pub const BUSY: ErrorFlags = ErrorFlags(32);
    pub const WRONG_IDENT: ErrorFlags = ErrorFlags(64);
    pub const MISSING_INFO: ErrorFlags = ErrorFlags(128);
    pub const WRONG_PARAM: ErrorFlags = ErrorFlags(256);
    pub const NO_MEANING: ErrorFlags = ErrorFlags(512);
    pub const UNDEF_MEANING: ErrorFlags = ErrorFlags(1024);
    pub const OVERFLOW: ErrorFlags = ErrorFlags(2048);
    // Historical packed values, kept verbatim.
    pub const UNDERFLOW: ErrorFlags = ErrorFlags(4196);
    pub const ERROR_PRESENT: ErrorFlags = ErrorFlags(8392);
    pub const INTRINSIC: ErrorFlags = ErrorFlags(16784);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `flag` is set.
    pub fn contains(self, flag: ErrorFlags) -> bool {
        self.0 & flag.0 == flag.0 && flag.0 != 0
    }

    pub fn insert(&mut self, flag: ErrorFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl BitOr for ErrorFlags {
    type Output = ErrorFlags;
    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: ErrorFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ErrorFlags {
    type Output = ErrorFlags;
    fn bitand(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 & rhs.0)
    }
}

pub type Result<T> = std::result::Result<T, ErrorFlags>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historical_values_preserved() {
        assert_eq!(ErrorFlags::OVERFLOW.bits(), 2048);
        assert_eq!(ErrorFlags::UNDERFLOW.bits(), 4196);
        assert_eq!(ErrorFlags::ERROR_PRESENT.bits(), 8392);
        assert_eq!(ErrorFlags::INTRINSIC.bits(), 16784);
    }

    #[test]
    fn test_bit_operations() {
        let mut flags = ErrorFlags::NONE;
        assert!(flags.is_empty());
        flags.insert(ErrorFlags::BUSY);
        flags |= ErrorFlags::WRONG_PARAM;
        assert!(flags.contains(ErrorFlags::BUSY));
        assert!(flags.contains(ErrorFlags::WRONG_PARAM));
        assert!(!flags.contains(ErrorFlags::OVERFLOW));
        flags.clear();
        assert!(flags.is_empty());
    }

    #[test]
    fn test_packed_values_overlap_lower_bits() {
        // 4196 = 4096 | 100; the overlap is intentional wire format.
        assert!(ErrorFlags::UNDERFLOW.bits() & 0xFFF != 0);
        assert!(ErrorFlags::ERROR_PRESENT.bits() & 0xFFF != 0);
    }
}
