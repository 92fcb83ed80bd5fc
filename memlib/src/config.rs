use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::error::{Result, SimError};

/// Parameters of a whole memory hierarchy, usually read from JSON
///
/// Every field is optional in the JSON, missing ones take the defaults below
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Bytes per block, the unit moved between memory and the cache
    pub block_size: u64,
    pub physical_block_count: u64,
    pub cache_set_count: u64,
    /// Lines per cache set, 1 for direct mapped
    pub associativity: u64,
    /// Bits of a virtual address, the virtual address space is `1 << virtual_address_width` bytes
    pub virtual_address_width: u32,
    pub page_size: u64,
    pub tlb_line_count: usize,
    /// Fraction of the frames to map to random pages right after construction
    pub page_table_usage: Option<f64>,
    /// Seed for the page table randomisation, random if missing
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            physical_block_count: 2048,
            cache_set_count: 64,
            associativity: 1,
            virtual_address_width: 32,
            page_size: 2048,
            tlb_line_count: 32,
            page_table_usage: None,
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// Reads a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn physical_size(&self) -> Result<u64> {
        self.block_size
            .checked_mul(self.physical_block_count)
            .ok_or_else(|| overflow("physical memory size"))
    }

    pub fn cache_size(&self) -> Result<u64> {
        self.cache_set_count
            .checked_mul(self.associativity)
            .and_then(|lines| lines.checked_mul(self.block_size))
            .ok_or_else(|| overflow("cache size"))
    }

    pub fn virtual_size(&self) -> Result<u64> {
        1u64.checked_shl(self.virtual_address_width)
            .ok_or_else(|| SimError::InvalidConfiguration(format!(
                "a virtual address width of {} bits is not supported", self.virtual_address_width
            )))
    }
}

fn overflow(what: &str) -> SimError {
    SimError::InvalidConfiguration(format!("{what} does not fit in 64 bits"))
}
