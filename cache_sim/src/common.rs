use std::fmt;

/// mask of the lower `len` bits. saturates at the full width of `usize`.
#[inline]
pub const fn mask_with_len(len: u32) -> usize {
    if len >= usize::BITS {
        usize::MAX
    } else {
        (1usize << len).wrapping_sub(1)
    }
}

/// extracts `bin & mask`, shifted down by `shift`.
#[inline]
pub const fn extract(bin: usize, mask: usize, shift: u32) -> usize {
    (bin & mask) >> shift
}

#[inline]
pub fn word_from_le(bytes: &[u8]) -> u32 {
    let mut v: [u8; 4] = [0; 4];
    v.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(v)
}

/// merges `data` into `bytes[..4]` where `mask` is set.
#[inline]
pub fn merge_word_le(bytes: &mut [u8], data: u32, mask: u32) {
    let old = word_from_le(bytes);
    let new = (old & !mask) | (data & mask);
    bytes[..4].copy_from_slice(&new.to_le_bytes());
}

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
/// to unify displaying addresses
pub struct Addr(usize);

impl Addr {
    pub fn new(v: usize) -> Self {
        Self(v)
    }
    pub fn inner(self) -> usize {
        self.0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_with_len() {
        assert_eq!(0, mask_with_len(0));
        assert_eq!(0b1111, mask_with_len(4));
        assert_eq!(usize::MAX, mask_with_len(usize::BITS));
    }
    #[test]
    fn test_extract() {
        assert_eq!(0b101, extract(0b1101_0000, 0b0111_0000, 4));
        assert_eq!(0b11, extract(0b1011_0000, 0b0111_0000, 4));
        assert_eq!(0, extract(0xFFFF_0000, 0xFF, 0));
    }
    #[test]
    fn test_merge_word() {
        let mut buf = [0x11, 0x22, 0x33, 0x44];
        assert_eq!(0x44332211, word_from_le(&buf));
        merge_word_le(&mut buf, 0xAABBCCDD, 0x0000FF00);
        assert_eq!(0x4433CC11, word_from_le(&buf), "{buf:02x?}");
        assert_eq!([0x11, 0xCC, 0x33, 0x44], buf);
    }
    #[test]
    fn test_addr_display() {
        assert_eq!("0x0000beef", Addr::new(0xBEEF).to_string());
    }
}
