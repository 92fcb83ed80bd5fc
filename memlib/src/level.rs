use serde::{Deserialize, Serialize};
use crate::error::Result;

/// A single logical memory operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read(u64),
    Write(u64),
}

impl Access {
    pub fn address(&self) -> u64 {
        match self {
            Access::Read(address) | Access::Write(address) => *address,
        }
    }
}

/// A layer of the memory hierarchy which can be read from and written to
///
/// Each layer checks its own address range and emits its own trace messages before delegating to
/// the layer beneath it
pub trait MemoryLevel {
    /// The number of addressable bytes of this layer
    fn size(&self) -> u64;

    fn read(&mut self, address: u64) -> Result<()>;

    fn write(&mut self, address: u64) -> Result<()>;

    /// Dispatches an [`Access`] to `read` or `write`
    fn access(&mut self, access: Access) -> Result<()> {
        match access {
            Access::Read(address) => self.read(address),
            Access::Write(address) => self.write(address),
        }
    }
}
