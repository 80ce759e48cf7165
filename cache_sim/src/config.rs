use anyhow::Result;
use serde::Deserialize;

use crate::{
    geometry::{Geometry, BLOCK_WIDTH},
    memory::MEMORY_WIDTH,
};

/// default cache: 16 KiB, 4-way.
pub const TOTAL_WIDTH: u32 = 14;
pub const ASSOCIATIVITY_WIDTH: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub total_width: u32,
    pub associativity_width: u32,
    pub block_width: u32,
    pub memory_width: u32,
    /// seed of the replacement generator. drawn from the OS when absent.
    pub seed: Option<u64>,
    /// compare every read with an uncached reference memory
    pub check: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            total_width: TOTAL_WIDTH,
            associativity_width: ASSOCIATIVITY_WIDTH,
            block_width: BLOCK_WIDTH,
            memory_width: MEMORY_WIDTH,
            seed: None,
            check: false,
        }
    }
}

impl SimConfig {
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
    pub fn geometry(&self) -> Result<Geometry> {
        Ok(Geometry::with_block_width(
            self.total_width,
            self.associativity_width,
            self.block_width,
        )?)
    }
}
