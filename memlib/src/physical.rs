use crate::error::{check_range, Result, SimError};
use crate::level::MemoryLevel;
use crate::sink::{trace_event, SharedSink};

/// Raw physical memory, addressed in blocks
///
/// Holds no data: reads and writes only report the block they touch
pub struct PhysicalMemory {
    size: u64,
    block_size: u64,
    sink: SharedSink,
}

impl PhysicalMemory {
    /// Creates physical memory of `size` bytes. `size` must be a non-zero multiple of `block_size`
    pub fn new(size: u64, block_size: u64, sink: SharedSink) -> Result<Self> {
        if block_size == 0 || size == 0 || size % block_size != 0 {
            return Err(SimError::InvalidConfiguration(format!(
                "memory size {size} must be a non-zero multiple of the block size {block_size}"
            )));
        }
        log::debug!("physical memory: {size} bytes in blocks of {block_size}");
        Ok(Self { size, block_size, sink })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.size / self.block_size
    }
}

impl MemoryLevel for PhysicalMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, address: u64) -> Result<()> {
        check_range(address, self.size)?;
        trace_event!(self.sink, "read physical block {:#x}", address / self.block_size);
        Ok(())
    }

    fn write(&mut self, address: u64) -> Result<()> {
        check_range(address, self.size)?;
        trace_event!(self.sink, "write physical block {:#x}", address / self.block_size);
        Ok(())
    }
}
