use thiserror::Error;

use crate::common::{mask_with_len, merge_word_le, word_from_le};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// cycles charged for each block transferred to or from memory.
pub const MEM_LATENCY: u64 = 25;
/// default memory size exponent: 32 MiB.
pub const MEMORY_WIDTH: u32 = 25;
pub const MAX_MEMORY_WIDTH: u32 = 34;

/// Block-granular storage behind a cache.
///
/// `buf.len()` is always the block size of the cache driving it. Any block
/// number is accepted; mapping it onto the actual storage is up to the
/// implementor.
pub trait BackingStore {
    fn mem_read(&mut self, block_number: usize, buf: &mut [u8]);
    fn mem_write(&mut self, block_number: usize, buf: &[u8]);
    /// cycles per block transfer
    fn latency(&self) -> u64 {
        MEM_LATENCY
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory width {memory_width} is smaller than block width {block_width}")]
    SmallerThanBlock { memory_width: u32, block_width: u32 },
    #[error("memory width {memory_width} exceeds the maximum of {}", MAX_MEMORY_WIDTH)]
    TooLarge { memory_width: u32 },
}

/// Flat, zero-initialized RAM of `2^memory_width` bytes.
///
/// Block transfers are sized by the buffer handed in, so one memory serves
/// caches of any block width. Block numbers and addresses beyond the range
/// wrap around.
pub struct Memory {
    inner: Vec<u8>,
    addr_mask: usize,
    #[cfg(feature = "stat")]
    stat: stat::MemoryStat,
}

impl Memory {
    pub fn new(memory_width: u32, block_width: u32) -> Result<Self, MemoryError> {
        if memory_width > MAX_MEMORY_WIDTH {
            return Err(MemoryError::TooLarge { memory_width });
        }
        if memory_width < block_width {
            return Err(MemoryError::SmallerThanBlock {
                memory_width,
                block_width,
            });
        }
        log::debug!("allocating {} bytes of memory", 1usize << memory_width);
        Ok(Self {
            inner: vec![0; 1 << memory_width],
            addr_mask: mask_with_len(memory_width),
            #[cfg(feature = "stat")]
            stat: Default::default(),
        })
    }
    pub fn size(&self) -> usize {
        self.inner.len()
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
    #[inline]
    fn block_start(&self, block_number: usize, len: usize) -> usize {
        block_number.wrapping_mul(len) & self.addr_mask
    }
    #[inline]
    fn word_start(&self, addr: usize) -> usize {
        addr & self.addr_mask & !0x3
    }
    /// reads a word bypassing any cache.
    pub fn read_word(&self, addr: usize) -> u32 {
        word_from_le(&self.inner[self.word_start(addr)..])
    }
    /// writes a word bypassing any cache. only bits set in `mask` change.
    pub fn write_word(&mut self, addr: usize, data: u32, mask: u32) {
        let start = self.word_start(addr);
        merge_word_le(&mut self.inner[start..], data, mask);
    }
}

impl BackingStore for Memory {
    fn mem_read(&mut self, block_number: usize, buf: &mut [u8]) {
        #[cfg(feature = "stat")]
        self.stat.on_read();
        let start = self.block_start(block_number, buf.len());
        match self.inner.get(start..start + buf.len()) {
            Some(src) => buf.copy_from_slice(src),
            None => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = self.inner[(start + i) & self.addr_mask];
                }
            }
        }
    }
    fn mem_write(&mut self, block_number: usize, buf: &[u8]) {
        #[cfg(feature = "stat")]
        self.stat.on_write();
        let start = self.block_start(block_number, buf.len());
        match self.inner.get_mut(start..start + buf.len()) {
            Some(dst) => dst.copy_from_slice(buf),
            None => {
                for (i, b) in buf.iter().enumerate() {
                    self.inner[(start + i) & self.addr_mask] = *b;
                }
            }
        }
    }
}

#[cfg(feature = "stat")]
impl AddStats for Memory {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::*;

    #[derive(Clone, Copy, Default)]
    pub struct MemoryStat {
        read: u64,
        write: u64,
    }

    impl MemoryStat {
        pub fn on_read(&mut self) {
            self.read += 1;
        }
        pub fn on_write(&mut self) {
            self.write += 1;
        }
    }

    impl Stat for MemoryStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ MemoryStat {
        fn header(&self) -> &'static str {
            "block transfers of memory (format: `# of read / # of write`)"
        }
        fn width(&self) -> usize {
            40
        }
    }

    impl fmt::Display for &'_ MemoryStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "  {:>13}:{:>11} /{:>11}", "blocks", self.read, self.write)
        }
    }
}
