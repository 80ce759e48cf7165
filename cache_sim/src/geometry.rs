use std::fmt;

use thiserror::Error;

use crate::common::{extract, mask_with_len};

/// default block width: 64-byte blocks.
pub const BLOCK_WIDTH: u32 = 6;
/// upper bound of the total size exponent (4 GiB of cache).
pub const MAX_TOTAL_WIDTH: u32 = 32;

/// every slot must hold at least one 32-bit word.
const MIN_BLOCK_WIDTH: u32 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GeometryError {
    #[error("block width {block_width} is too small: a block must hold at least one word")]
    BlockTooSmall { block_width: u32 },
    #[error(
        "total width {total_width} is less than block width {block_width} + associativity width {associativity_width}"
    )]
    NegativeSetIndexWidth {
        total_width: u32,
        block_width: u32,
        associativity_width: u32,
    },
    #[error("total width {total_width} exceeds the maximum of {}", MAX_TOTAL_WIDTH)]
    TooLarge { total_width: u32 },
}

/// Shape of a set-associative cache, fixed once built.
///
/// An address is split from the LSB as `| tag | set index | offset |`,
/// where offset is `block_width` bits and set index is
/// `total_width - block_width - associativity_width` bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Geometry {
    total_width: u32,
    associativity_width: u32,
    block_width: u32,
    set_index_width: u32,
    offset_mask: usize,
    set_index_mask: usize,
    tag_mask: usize,
    block_number_mask: usize,
}

impl Geometry {
    pub fn new(total_width: u32, associativity_width: u32) -> Result<Self, GeometryError> {
        Self::with_block_width(total_width, associativity_width, BLOCK_WIDTH)
    }

    pub fn with_block_width(
        total_width: u32,
        associativity_width: u32,
        block_width: u32,
    ) -> Result<Self, GeometryError> {
        if block_width < MIN_BLOCK_WIDTH {
            return Err(GeometryError::BlockTooSmall { block_width });
        }
        if total_width > MAX_TOTAL_WIDTH {
            return Err(GeometryError::TooLarge { total_width });
        }
        let Some(set_index_width) = total_width
            .checked_sub(block_width)
            .and_then(|w| w.checked_sub(associativity_width))
        else {
            return Err(GeometryError::NegativeSetIndexWidth {
                total_width,
                block_width,
                associativity_width,
            });
        };
        Ok(Self {
            total_width,
            associativity_width,
            block_width,
            set_index_width,
            offset_mask: mask_with_len(block_width),
            set_index_mask: mask_with_len(set_index_width) << block_width,
            tag_mask: !mask_with_len(block_width + set_index_width),
            block_number_mask: !mask_with_len(block_width),
        })
    }

    pub fn total_width(&self) -> u32 {
        self.total_width
    }
    pub fn associativity_width(&self) -> u32 {
        self.associativity_width
    }
    pub fn block_width(&self) -> u32 {
        self.block_width
    }
    pub fn set_index_width(&self) -> u32 {
        self.set_index_width
    }
    pub fn block_size(&self) -> usize {
        1 << self.block_width
    }
    /// ways per set
    pub fn ways(&self) -> usize {
        1 << self.associativity_width
    }
    pub fn sets(&self) -> usize {
        1 << self.set_index_width
    }
    pub fn num_slots(&self) -> usize {
        1 << (self.total_width - self.block_width)
    }
    pub fn total_size(&self) -> usize {
        1 << self.total_width
    }

    #[inline]
    pub fn offset(&self, addr: usize) -> usize {
        addr & self.offset_mask
    }
    /// offset rounded down to a word boundary.
    #[inline]
    pub fn aligned_offset(&self, addr: usize) -> usize {
        self.offset(addr) & !0x3
    }
    #[inline]
    pub fn set_index(&self, addr: usize) -> usize {
        extract(addr, self.set_index_mask, self.block_width)
    }
    #[inline]
    pub fn tag(&self, addr: usize) -> usize {
        extract(addr, self.tag_mask, self.block_width + self.set_index_width)
    }
    #[inline]
    pub fn block_number(&self, addr: usize) -> usize {
        extract(addr, self.block_number_mask, self.block_width)
    }
    #[inline]
    pub fn compose_block_number(&self, tag: usize, set_index: usize) -> usize {
        (tag << self.set_index_width) | set_index
    }
    /// index into the flat slot array
    #[inline]
    pub fn slot_location(&self, addr: usize, way: usize) -> usize {
        (self.set_index(addr) << self.associativity_width) + way
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, {} sets x {} ways x {} bytes/block",
            self.total_size(),
            self.sets(),
            self.ways(),
            self.block_size()
        )
    }
}
