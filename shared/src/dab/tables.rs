//! Protection tables of EN 300 401: the 64-entry Sub-channel Size table for
//! UEP (short form) and the size factors for EEP (long form).

pub struct UepEntry {
    /// Sub-channel size in Capacity Units.
    pub size_cu: u16,
    /// Protection level 1..=5 (1 is the strongest).
    pub protection_level: u8,
    /// Audio bit rate in kbit/s.
    pub bitrate: u16,
}

#[rustfmt::skip]
pub const UEP_TABLE: [UepEntry; 64] = {
    const fn e(size_cu: u16, protection_level: u8, bitrate: u16) -> UepEntry {
        UepEntry { size_cu, protection_level, bitrate }
    }
    [
        e(16, 5, 32),  e(21, 4, 32),  e(24, 3, 32),  e(29, 2, 32),  e(35, 1, 32),
        e(24, 5, 48),  e(29, 4, 48),  e(35, 3, 48),  e(42, 2, 48),  e(52, 1, 48),
        e(29, 5, 56),  e(35, 4, 56),  e(42, 3, 56),  e(52, 2, 56),
        e(32, 5, 64),  e(42, 4, 64),  e(48, 3, 64),  e(58, 2, 64),  e(70, 1, 64),
        e(40, 5, 80),  e(52, 4, 80),  e(58, 3, 80),  e(70, 2, 80),  e(84, 1, 80),
        e(48, 5, 96),  e(58, 4, 96),  e(70, 3, 96),  e(84, 2, 96),  e(104, 1, 96),
        e(58, 5, 112), e(70, 4, 112), e(84, 3, 112), e(104, 2, 112),
        e(64, 5, 128), e(84, 4, 128), e(96, 3, 128), e(116, 2, 128), e(140, 1, 128),
        e(80, 5, 160), e(104, 4, 160), e(116, 3, 160), e(140, 2, 160), e(168, 1, 160),
        e(96, 5, 192), e(116, 4, 192), e(140, 3, 192), e(168, 2, 192), e(208, 1, 192),
        e(116, 5, 224), e(140, 4, 224), e(168, 3, 224), e(208, 2, 224), e(232, 1, 224),
        e(128, 5, 256), e(168, 4, 256), e(192, 3, 256), e(232, 2, 256), e(280, 1, 256),
        e(160, 5, 320), e(208, 4, 320), e(280, 2, 320),
        e(192, 5, 384), e(280, 3, 384), e(416, 1, 384),
    ]
};

/// EEP profile A (option 0): size in CU is `factor/8 × bitrate` per level.
pub const EEP_A_SIZE_FACTORS: [u16; 4] = [12, 8, 6, 4];

/// EEP profile B (option 1): size in CU is `factor/32 × bitrate` per level.
pub const EEP_B_SIZE_FACTORS: [u16; 4] = [27, 21, 18, 15];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_consistent() {
        for entry in &UEP_TABLE {
            assert!(entry.protection_level >= 1 && entry.protection_level <= 5);
            assert_eq!(entry.bitrate % 8, 0);
        }
        // A few known rows of the Sub-Channel Size table
        assert_eq!(UEP_TABLE[0].size_cu, 16);
        assert_eq!(UEP_TABLE[33].size_cu, 64);
        assert_eq!(UEP_TABLE[33].bitrate, 128);
        assert_eq!(UEP_TABLE[63].size_cu, 416);
        assert_eq!(UEP_TABLE[63].protection_level, 1);
    }
}
