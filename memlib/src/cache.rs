use serde::Serialize;
use crate::error::{check_range, Result, SimError};
use crate::level::MemoryLevel;
use crate::physical::PhysicalMemory;
use crate::sink::{trace_event, SharedSink};

/// One line of a cache set
///
/// `lru_counter` is an age, not a timestamp: it is reset to 0 when the line is accessed and
/// incremented whenever another line of the same set is accessed
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct CacheLine {
    pub tag: u64,
    pub valid: bool,
    pub dirty: bool,
    pub lru_counter: u64,
}

/// A physical address split into the fields the cache uses to locate it
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct AddressParts {
    pub tag: u64,
    pub set: u64,
    pub offset: u64,
}

/// A write-back, write-allocate set associative cache in front of physical memory
///
/// Sets are picked by the address modulo `size / associativity`, so every way of the cache covers
/// a contiguous slice of memory as if it was a direct mapped cache of that size, and the tag is
/// simply which of those slices the address lies in. This keeps the tag range equal to the
/// physical address range for any associativity
///
/// Replacement is LRU using per-line age counters. When several lines share the greatest age the
/// lowest way wins
pub struct SetAssociativeCache {
    physical: PhysicalMemory,
    size: u64,
    associativity: u64,
    block_size: u64,
    sets: Vec<Vec<CacheLine>>,
    sink: SharedSink,
}

impl SetAssociativeCache {
    /// Creates an empty (all lines invalid) cache of `size` bytes in front of `physical`
    ///
    /// # Arguments
    ///
    /// * `physical`: The memory behind the cache, which also fixes the block size
    /// * `size`: Capacity in bytes, must be a multiple of `associativity * block_size`
    /// * `associativity`: Lines per set
    /// * `sink`: Receives the trace messages of the cache
    ///
    /// returns: Result<SetAssociativeCache>
    pub fn new(physical: PhysicalMemory, size: u64, associativity: u64, sink: SharedSink) -> Result<Self> {
        let block_size = physical.block_size();
        if associativity == 0 || size == 0 || size % (associativity * block_size) != 0 {
            return Err(SimError::InvalidConfiguration(format!(
                "cache size {size} must be a non-zero multiple of associativity {associativity} times block size {block_size}"
            )));
        }
        let set_count = size / (associativity * block_size);
        log::debug!("cache: {size} bytes, {set_count} sets of {associativity} ways");
        Ok(Self {
            physical,
            size,
            associativity,
            block_size,
            sets: vec![vec![CacheLine::default(); associativity as usize]; set_count as usize],
            sink,
        })
    }

    /// Splits a physical address into (tag, set, offset). Does not check the address range
    pub fn decompose(&self, address: u64) -> AddressParts {
        let set_span = self.set_span();
        AddressParts {
            tag: address / set_span,
            set: (address % set_span) / self.block_size,
            offset: address % self.block_size,
        }
    }

    /// Inverse of [`decompose`](Self::decompose)
    pub fn compose(&self, tag: u64, set: u64, offset: u64) -> u64 {
        tag * self.set_span() + set * self.block_size + offset
    }

    /// Evicts every line caching a block in `[begin, end)`, writing dirty ones back
    ///
    /// Used before a physical frame changes owner so no line can alias the new owner's data
    pub fn invalidate(&mut self, begin: u64, end: u64) -> Result<()> {
        if begin > end {
            return Err(SimError::InvalidArgument(format!("invalidation range {begin:#x}..{end:#x} is reversed")));
        }
        if end > self.physical.size() {
            return Err(SimError::OutOfRange { address: end - 1, limit: self.physical.size() });
        }
        let mut address = begin - begin % self.block_size;
        while address < end {
            let parts = self.decompose(address);
            if let Some(way) = self.find(parts.set, parts.tag) {
                self.swap_out(parts.set, way)?;
            }
            address += self.block_size;
        }
        Ok(())
    }

    /// True if a valid line currently holds the block containing `address`
    pub fn holds(&self, address: u64) -> bool {
        let parts = self.decompose(address);
        self.find(parts.set, parts.tag).is_some()
    }

    /// All sets, each a slice of `associativity` lines
    pub fn sets(&self) -> &[Vec<CacheLine>] {
        &self.sets
    }

    pub fn capacity(&self) -> u64 {
        self.size
    }

    pub fn associativity(&self) -> u64 {
        self.associativity
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn set_count(&self) -> u64 {
        self.sets.len() as u64
    }

    pub fn physical(&self) -> &PhysicalMemory {
        &self.physical
    }

    // Bytes of memory covered by one way of every set
    fn set_span(&self) -> u64 {
        self.size / self.associativity
    }

    fn find(&self, set: u64, tag: u64) -> Option<usize> {
        self.sets[set as usize].iter().position(|line| line.valid && line.tag == tag)
    }

    fn access(&mut self, address: u64, write: bool) -> Result<()> {
        check_range(address, self.physical.size())?;
        let AddressParts { tag, set, .. } = self.decompose(address);
        let way = match self.find(set, tag) {
            Some(way) => {
                trace_event!(self.sink, "cache hit in set {set:#x}, way {way}");
                way
            }
            None => {
                trace_event!(self.sink, "cache miss in set {set:#x}, block must be loaded");
                self.swap_in(tag, set)?
            }
        };
        let lines = &mut self.sets[set as usize];
        if write {
            lines[way].dirty = true;
        }
        for (index, line) in lines.iter_mut().enumerate() {
            if index == way {
                line.lru_counter = 0;
            } else if line.valid {
                line.lru_counter += 1;
            }
        }
        Ok(())
    }

    /// Loads the block (tag, set) into a free way of the set, evicting the oldest line if none is
    /// free. Returns the way used
    fn swap_in(&mut self, tag: u64, set: u64) -> Result<usize> {
        let free = self.sets[set as usize].iter().position(|line| !line.valid);
        let way = match free {
            Some(way) => way,
            None => {
                trace_event!(self.sink, "cache set {set:#x} is full, a line must be evicted");
                let way = oldest_way(&self.sets[set as usize]);
                self.swap_out(set, way)?;
                way
            }
        };
        let block_address = self.compose(tag, set, 0);
        self.physical.read(block_address)?;
        trace_event!(self.sink, "loaded block with tag {tag:#x} into set {set:#x}, way {way}");
        let line = &mut self.sets[set as usize][way];
        line.tag = tag;
        line.valid = true;
        line.dirty = false;
        Ok(way)
    }

    fn swap_out(&mut self, set: u64, way: usize) -> Result<()> {
        let line = self.sets[set as usize][way];
        if !line.valid {
            return Err(SimError::InvalidState(format!("cache set {set:#x}, way {way} is not valid")));
        }
        let block = set * self.associativity + way as u64;
        if line.dirty {
            trace_event!(self.sink, "cache line {block:#x} is dirty, writing back");
            let block_address = self.compose(line.tag, set, 0);
            self.physical.write(block_address)?;
        } else {
            trace_event!(self.sink, "cache line {block:#x} is clean, no write-back needed");
        }
        let line = &mut self.sets[set as usize][way];
        line.valid = false;
        line.dirty = false;
        Ok(())
    }
}

/// The way with the greatest age. Ties go to the lowest way
fn oldest_way(lines: &[CacheLine]) -> usize {
    let mut oldest = 0;
    for (way, line) in lines.iter().enumerate() {
        if line.lru_counter > lines[oldest].lru_counter {
            oldest = way;
        }
    }
    oldest
}

impl MemoryLevel for SetAssociativeCache {
    /// The cache is addressed with physical addresses
    fn size(&self) -> u64 {
        self.physical.size()
    }

    fn read(&mut self, address: u64) -> Result<()> {
        self.access(address, false)
    }

    fn write(&mut self, address: u64) -> Result<()> {
        self.access(address, true)
    }
}
