use serde::Serialize;
use crate::error::{check_range, Result, SimError};
use crate::level::{Access, MemoryLevel};
use crate::lru::LruQueue;
use crate::sink::{trace_event, SharedSink};
use crate::virtual_memory::VirtualMemory;

/// One line of the TLB
///
/// `dirty` is the page table's dirty bit when the line was loaded. `dirty_pending` marks a write
/// made through this line which the page table hasn't seen yet
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TlbLine {
    pub virtual_page: u64,
    pub physical_frame: u64,
    pub valid: bool,
    pub dirty: bool,
    pub dirty_pending: bool,
}

/// A fully associative TLB in front of the page table, with its own LRU order over its lines
///
/// Hits translate directly and go straight to the cache. Dirty bits set through a hit only reach
/// the page table when the line is swapped out
pub struct FullyAssociativeTlb {
    virtual_memory: VirtualMemory,
    lines: Vec<TlbLine>,
    lru: LruQueue<usize>,
    sink: SharedSink,
}

impl FullyAssociativeTlb {
    pub fn new(virtual_memory: VirtualMemory, capacity: usize, sink: SharedSink) -> Result<Self> {
        if capacity == 0 {
            return Err(SimError::InvalidConfiguration("the TLB needs at least one line".to_string()));
        }
        log::debug!("tlb: {capacity} lines");
        Ok(Self {
            virtual_memory,
            lines: vec![TlbLine::default(); capacity],
            lru: LruQueue::new(),
            sink,
        })
    }

    /// Translates through the TLB and performs the access
    pub fn perform(&mut self, access: Access) -> Result<()> {
        let address = access.address();
        check_range(address, self.virtual_memory.size())?;
        let page_size = self.virtual_memory.page_size();
        let page = address / page_size;
        let offset = address % page_size;
        match self.slot_of(page) {
            Some(slot) => {
                trace_event!(self.sink, "virtual page {page:#x} is in the TLB, accessing memory directly");
                let physical_address = self.lines[slot].physical_frame * page_size + offset;
                let main_memory = self.virtual_memory.main_memory_mut();
                match access {
                    Access::Read(_) => main_memory.read(physical_address)?,
                    Access::Write(_) => {
                        main_memory.write(physical_address)?;
                        let line = &mut self.lines[slot];
                        if !(line.dirty || line.dirty_pending) {
                            line.dirty = true;
                            line.dirty_pending = true;
                        }
                    }
                }
                self.lru.touch(slot);
            }
            None => {
                trace_event!(self.sink, "virtual page {page:#x} is not in the TLB, looking up the page table");
                self.release_next_victim(page)?;
                if let Some(evicted) = self.virtual_memory.perform(access)? {
                    self.invalidate_page(evicted)?;
                }
                self.load(page)?;
            }
        }
        Ok(())
    }

    /// Swaps out every valid line, writing pending dirty bits to the page table
    pub fn flush(&mut self) -> Result<()> {
        for slot in 0..self.lines.len() {
            if self.lines[slot].valid {
                self.swap_out(slot)?;
            }
        }
        Ok(())
    }

    /// The valid line translating `page`, if any
    pub fn lookup(&self, page: u64) -> Option<&TlbLine> {
        self.slot_of(page).map(|slot| &self.lines[slot])
    }

    pub fn lines(&self) -> &[TlbLine] {
        &self.lines
    }

    /// Occupied slots from least to most recently used
    pub fn lru_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.lru.iter()
    }

    pub fn capacity(&self) -> usize {
        self.lines.len()
    }

    pub fn virtual_memory(&self) -> &VirtualMemory {
        &self.virtual_memory
    }

    fn slot_of(&self, page: u64) -> Option<usize> {
        self.lines.iter().position(|line| line.valid && line.virtual_page == page)
    }

    // A fault on `page` will evict the page table's LRU page. Its line has to go first, while its
    // page table entry still exists to receive a pending dirty bit
    fn release_next_victim(&mut self, page: u64) -> Result<()> {
        if self.virtual_memory.is_resident(page) {
            return Ok(());
        }
        if let Some(victim) = self.virtual_memory.next_victim() {
            if let Some(slot) = self.slot_of(victim) {
                trace_event!(self.sink, "virtual page {victim:#x} is about to be swapped out, dropping its TLB line");
                self.swap_out(slot)?;
            }
        }
        Ok(())
    }

    fn invalidate_page(&mut self, page: u64) -> Result<()> {
        if let Some(slot) = self.slot_of(page) {
            trace_event!(self.sink, "virtual memory swapped out page {page:#x}, invalidating its TLB line");
            self.swap_out(slot)?;
        }
        Ok(())
    }

    /// Loads the page table entry of `page` into a free line, or into the least recently used one.
    /// Returns the slot used
    fn load(&mut self, page: u64) -> Result<usize> {
        let free = self.lines.iter().position(|line| !line.valid);
        let slot = match free {
            Some(slot) => slot,
            None => {
                trace_event!(self.sink, "TLB is full, a line must be swapped out");
                let slot = self.lru.front().ok_or_else(|| SimError::InvalidState("TLB is full but has no LRU order".to_string()))?;
                self.swap_out(slot)?;
                slot
            }
        };
        if !self.virtual_memory.is_resident(page) {
            self.release_next_victim(page)?;
            if let Some(swapped) = self.virtual_memory.swap_in(page)? {
                self.invalidate_page(swapped)?;
            }
        }
        let entry = *self
            .virtual_memory
            .entry(page)
            .ok_or_else(|| SimError::InvalidState(format!("virtual page {page:#x} is not resident")))?;
        self.lines[slot] = TlbLine {
            virtual_page: page,
            physical_frame: entry.physical_frame,
            valid: true,
            dirty: entry.dirty,
            dirty_pending: false,
        };
        self.lru.push(slot);
        trace_event!(self.sink, "loaded page table entry of virtual page {page:#x} into TLB line {slot}");
        Ok(slot)
    }

    fn swap_out(&mut self, slot: usize) -> Result<()> {
        let line = *self
            .lines
            .get(slot)
            .ok_or_else(|| SimError::InvalidArgument(format!("TLB line {slot} out of range")))?;
        if !line.valid {
            return Err(SimError::InvalidState(format!("TLB line {slot} is not valid")));
        }
        let page = line.virtual_page;
        if line.dirty_pending {
            if self.virtual_memory.is_resident(page) {
                trace_event!(self.sink, "TLB line {slot} holds an unpropagated dirty bit, writing it to the page table");
                self.virtual_memory.mark_dirty(page)?;
            } else {
                log::warn!("dropping pending dirty bit of non-resident virtual page {page:#x}");
            }
        }
        let line = &mut self.lines[slot];
        line.valid = false;
        line.dirty_pending = false;
        self.lru.remove(slot);
        trace_event!(self.sink, "invalidated TLB line {slot} of virtual page {page:#x}");
        Ok(())
    }
}

impl MemoryLevel for FullyAssociativeTlb {
    /// The TLB is addressed with virtual addresses
    fn size(&self) -> u64 {
        self.virtual_memory.size()
    }

    fn read(&mut self, address: u64) -> Result<()> {
        self.perform(Access::Read(address))
    }

    fn write(&mut self, address: u64) -> Result<()> {
        self.perform(Access::Write(address))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use super::*;
    use crate::cache::SetAssociativeCache;
    use crate::physical::PhysicalMemory;
    use crate::sink::RecordingSink;

    struct Sinks {
        cache: Rc<RecordingSink>,
        page: Rc<RecordingSink>,
        tlb: Rc<RecordingSink>,
    }

    /// Blocks of 4, direct mapped 32 byte cache, pages of 16, 16 virtual pages
    fn tlb(frames: u64, capacity: usize) -> (FullyAssociativeTlb, Sinks) {
        let sinks = Sinks { cache: RecordingSink::new(), page: RecordingSink::new(), tlb: RecordingSink::new() };
        let physical = PhysicalMemory::new(frames * 16, 4, sinks.cache.clone()).unwrap();
        let cache = SetAssociativeCache::new(physical, 32, 1, sinks.cache.clone()).unwrap();
        let memory = VirtualMemory::new(cache, 256, 16, sinks.page.clone()).unwrap();
        (FullyAssociativeTlb::new(memory, capacity, sinks.tlb.clone()).unwrap(), sinks)
    }

    #[test]
    fn miss_loads_then_hits() {
        let (mut tlb, sinks) = tlb(4, 2);
        tlb.read(0x24).unwrap();
        assert!(sinks.tlb.contains("not in the TLB"));
        assert!(sinks.page.contains("page fault on virtual page 0x2"));
        let line = *tlb.lookup(2).unwrap();
        assert_eq!(line.physical_frame, tlb.virtual_memory().entry(2).unwrap().physical_frame);
        assert_eq!(tlb.lru_order().collect::<Vec<_>>(), vec![0]);
        sinks.tlb.drain();
        sinks.page.drain();
        sinks.cache.drain();
        tlb.read(0x25).unwrap();
        assert_eq!(sinks.tlb.lines(), vec!["virtual page 0x2 is in the TLB, accessing memory directly"]);
        assert!(sinks.page.is_empty());
        assert_eq!(sinks.cache.lines(), vec!["cache hit in set 0x1, way 0"]);
    }

    #[test]
    fn write_hit_defers_dirty_bit() {
        let (mut tlb, sinks) = tlb(4, 2);
        tlb.read(0x00).unwrap();
        tlb.write(0x01).unwrap();
        let line = *tlb.lookup(0).unwrap();
        assert!(line.dirty && line.dirty_pending);
        assert!(!tlb.virtual_memory().entry(0).unwrap().dirty);
        // already pending: nothing changes
        tlb.write(0x02).unwrap();
        assert_eq!(*tlb.lookup(0).unwrap(), line);

        tlb.read(0x10).unwrap();
        sinks.tlb.drain();
        // third page evicts line 0, the LRU line
        tlb.read(0x20).unwrap();
        assert!(sinks.tlb.contains("TLB is full"));
        assert!(sinks.tlb.contains("TLB line 0 holds an unpropagated dirty bit"));
        assert!(tlb.virtual_memory().entry(0).unwrap().dirty);
        assert!(tlb.lookup(0).is_none());
        assert_eq!(tlb.lookup(2).map(|l| l.valid), Some(true));
    }

    #[test]
    fn write_miss_copies_page_table_dirty_bit() {
        let (mut tlb, _) = tlb(4, 2);
        tlb.write(0x30).unwrap();
        let line = *tlb.lookup(3).unwrap();
        assert!(line.dirty);
        assert!(!line.dirty_pending);
        assert!(tlb.virtual_memory().entry(3).unwrap().dirty);
    }

    #[test]
    fn hit_refreshes_tlb_lru() {
        let (mut tlb, _) = tlb(4, 2);
        tlb.read(0x00).unwrap();
        tlb.read(0x10).unwrap();
        tlb.read(0x00).unwrap();
        assert_eq!(tlb.lru_order().collect::<Vec<_>>(), vec![1, 0]);
        tlb.read(0x20).unwrap();
        // page 1 held slot 1, which was the LRU one
        assert!(tlb.lookup(1).is_none());
        assert!(tlb.lookup(0).is_some());
        assert_eq!(tlb.lookup(2).unwrap(), &tlb.lines()[1]);
    }

    #[test]
    fn page_eviction_drops_stale_line() {
        // two frames, four TLB lines: the page table runs out first
        let (mut tlb, sinks) = tlb(2, 4);
        tlb.read(0x00).unwrap();
        tlb.write(0x10).unwrap();
        tlb.write(0x05).unwrap();
        assert!(tlb.lookup(0).unwrap().dirty_pending);
        // page 0 was faulted first, the TLB hit did not refresh the page table's LRU order
        assert_eq!(tlb.virtual_memory().next_victim(), Some(0));
        tlb.read(0x20).unwrap();
        assert!(sinks.tlb.contains("virtual page 0x0 is about to be swapped out"));
        assert!(sinks.page.contains("writing virtual page 0x0 back to secondary storage"));
        assert!(tlb.lookup(0).is_none());
        let frames: Vec<u64> = tlb.lines().iter().filter(|l| l.valid).map(|l| l.physical_frame).collect();
        let mut deduped = frames.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(frames.len(), deduped.len());
        for line in tlb.lines().iter().filter(|l| l.valid) {
            assert_eq!(tlb.virtual_memory().entry(line.virtual_page).unwrap().physical_frame, line.physical_frame);
        }
    }

    #[test]
    fn flush_propagates_everything() {
        let (mut tlb, _) = tlb(4, 2);
        tlb.read(0x00).unwrap();
        tlb.write(0x00).unwrap();
        tlb.flush().unwrap();
        assert!(tlb.lines().iter().all(|l| !l.valid));
        assert_eq!(tlb.lru_order().count(), 0);
        assert!(tlb.virtual_memory().entry(0).unwrap().dirty);
    }

    #[test]
    fn rejects_out_of_range_and_empty_tlb() {
        let (mut tlb, sinks) = tlb(4, 2);
        assert!(matches!(tlb.read(0x100), Err(SimError::OutOfRange { .. })));
        assert!(sinks.tlb.is_empty());
        let physical = PhysicalMemory::new(64, 4, RecordingSink::new()).unwrap();
        let cache = SetAssociativeCache::new(physical, 32, 1, RecordingSink::new()).unwrap();
        let memory = VirtualMemory::new(cache, 256, 16, RecordingSink::new()).unwrap();
        assert!(matches!(
            FullyAssociativeTlb::new(memory, 0, RecordingSink::new()),
            Err(SimError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn evicted_page_faults_again_instead_of_reusing_its_old_frame() {
        let (mut tlb, sinks) = tlb(2, 4);
        tlb.read(0x00).unwrap();
        tlb.read(0x10).unwrap();
        // page 2 takes over the frame of page 0
        tlb.read(0x20).unwrap();
        let reused = tlb.virtual_memory().entry(2).unwrap().physical_frame;
        assert!(tlb.lookup(0).is_none());

        sinks.page.drain();
        tlb.write(0x01).unwrap();
        assert!(sinks.page.contains("page fault on virtual page 0x0"));
        let line = *tlb.lookup(0).unwrap();
        assert_eq!(line.physical_frame, tlb.virtual_memory().entry(0).unwrap().physical_frame);
        assert_ne!(line.physical_frame, reused);
        assert!(tlb.virtual_memory().entry(0).unwrap().dirty);
        assert_eq!(tlb.lookup(2).unwrap().physical_frame, reused);
        for line in tlb.lines().iter().filter(|l| l.valid) {
            assert_eq!(tlb.virtual_memory().entry(line.virtual_page).map(|e| e.physical_frame), Some(line.physical_frame));
        }
    }
}
