use std::collections::HashMap;
use indexmap::IndexSet;
use rand::Rng;
use rand::seq::index;
use serde::Serialize;
use crate::cache::SetAssociativeCache;
use crate::error::{check_range, Result, SimError};
use crate::level::{Access, MemoryLevel};
use crate::lru::LruQueue;
use crate::sink::{trace_event, SharedSink};

/// A row of the page table. There is no valid bit, a page is resident iff it has an entry
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PageTableEntry {
    pub physical_frame: u64,
    pub dirty: bool,
}

/// Demand paged virtual memory on top of the cache
///
/// Keeps a sparse page table, the pool of free frames and a global LRU order of resident pages.
/// Secondary storage is only notional: loading or writing back a page is just a trace message
pub struct VirtualMemory {
    main_memory: SetAssociativeCache,
    size: u64,
    page_size: u64,
    frame_count: u64,
    page_table: HashMap<u64, PageTableEntry>,
    // Popped from the back, seeded high to low so frame 0 is handed out first
    free_frames: IndexSet<u64>,
    lru: LruQueue<u64>,
    sink: SharedSink,
}

impl VirtualMemory {
    /// Creates a virtual address space of `size` bytes with no resident pages
    ///
    /// # Arguments
    ///
    /// * `main_memory`: The cache standing in for main memory. Its physical size fixes the number
    /// of frames
    /// * `size`: Size of the virtual address space, a non-zero multiple of `page_size`
    /// * `page_size`: Size of a page and of a frame, must divide the physical memory size
    /// * `sink`: Receives the trace messages of the page table
    ///
    /// returns: Result<VirtualMemory>
    pub fn new(main_memory: SetAssociativeCache, size: u64, page_size: u64, sink: SharedSink) -> Result<Self> {
        if page_size == 0 || size == 0 || size % page_size != 0 {
            return Err(SimError::InvalidConfiguration(format!(
                "virtual memory size {size} must be a non-zero multiple of the page size {page_size}"
            )));
        }
        let physical_size = main_memory.size();
        if physical_size % page_size != 0 || physical_size < page_size {
            return Err(SimError::InvalidConfiguration(format!(
                "physical memory size {physical_size} must be a non-zero multiple of the page size {page_size}"
            )));
        }
        let frame_count = physical_size / page_size;
        log::debug!("virtual memory: {size} bytes, pages of {page_size}, {frame_count} frames");
        Ok(Self {
            main_memory,
            size,
            page_size,
            frame_count,
            page_table: HashMap::new(),
            free_frames: (0..frame_count).rev().collect(),
            lru: LruQueue::new(),
            sink,
        })
    }

    /// Fills a fresh page table with `fraction` of the frames, mapped to randomly chosen pages
    ///
    /// Pages enter the LRU order in the order they were picked, all clean. Fails with
    /// InvalidArgument if `fraction` is outside [0, 1] and InvalidState if any page is resident
    pub fn randomize_page_table<R: Rng + ?Sized>(&mut self, fraction: f64, rng: &mut R) -> Result<()> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(SimError::InvalidArgument(format!("page table usage {fraction} must be within [0, 1]")));
        }
        if !self.page_table.is_empty() {
            return Err(SimError::InvalidState("the page table can only be randomized when empty".to_string()));
        }
        let amount = ((fraction * self.frame_count as f64) as u64).min(self.page_count());
        let frames: Vec<u64> = self.free_frames.iter().copied().collect();
        let chosen_frames = index::sample(rng, frames.len(), amount as usize);
        let chosen_pages = index::sample(rng, self.page_count() as usize, amount as usize);
        for (page, frame_index) in chosen_pages.into_iter().zip(chosen_frames.into_iter()) {
            let frame = frames[frame_index];
            self.free_frames.swap_remove(&frame);
            self.page_table.insert(page as u64, PageTableEntry { physical_frame: frame, dirty: false });
            self.lru.push(page as u64);
        }
        trace_event!(self.sink, "randomized page table, {amount} pages resident");
        Ok(())
    }

    /// Performs a read or write and returns the page evicted to service it, if there was one
    pub fn perform(&mut self, access: Access) -> Result<Option<u64>> {
        let address = access.address();
        check_range(address, self.size)?;
        let page = address / self.page_size;
        let offset = address % self.page_size;
        let evicted = if self.page_table.contains_key(&page) {
            trace_event!(self.sink, "virtual page {page:#x} is resident");
            self.lru.touch(page);
            None
        } else {
            trace_event!(self.sink, "page fault on virtual page {page:#x}, loading from secondary storage");
            self.swap_in(page)?
        };
        let frame = self.resident_entry(page)?.physical_frame;
        let physical_address = frame * self.page_size + offset;
        match access {
            Access::Read(_) => self.main_memory.read(physical_address)?,
            Access::Write(_) => {
                self.main_memory.write(physical_address)?;
                self.mark_dirty(page)?;
            }
        }
        Ok(evicted)
    }

    /// Loads a non-resident page into a frame, evicting the least recently used page if there is
    /// no free frame. Returns the evicted page, so stale translations of it can be dropped
    pub fn swap_in(&mut self, page: u64) -> Result<Option<u64>> {
        self.check_page(page)?;
        if self.page_table.contains_key(&page) {
            return Err(SimError::InvalidState(format!("virtual page {page:#x} is already resident")));
        }
        let mut swapped = None;
        if self.free_frames.is_empty() {
            trace_event!(self.sink, "main memory is full, a page must be swapped out");
            let victim = self.lru.front().ok_or_else(|| SimError::InvalidState("no free frame and no resident page".to_string()))?;
            self.swap_out(victim)?;
            swapped = Some(victim);
        }
        let frame = self.free_frames.pop().ok_or_else(|| SimError::InvalidState("no free frame after eviction".to_string()))?;
        self.page_table.insert(page, PageTableEntry { physical_frame: frame, dirty: false });
        self.lru.push(page);
        trace_event!(self.sink, "loaded virtual page {page:#x} into frame {frame:#x}");
        Ok(swapped)
    }

    /// Evicts a resident page: its cache lines are invalidated before the frame returns to the
    /// free pool, and a dirty page is written to secondary storage
    pub fn swap_out(&mut self, page: u64) -> Result<()> {
        let entry = *self.resident_entry(page)?;
        let frame = entry.physical_frame;
        trace_event!(self.sink, "invalidating every cache line of frame {frame:#x} (virtual page {page:#x})");
        self.main_memory.invalidate(frame * self.page_size, (frame + 1) * self.page_size)?;
        if entry.dirty {
            trace_event!(self.sink, "writing virtual page {page:#x} back to secondary storage");
        }
        self.free_frames.insert(frame);
        self.lru.remove(page);
        self.page_table.remove(&page);
        Ok(())
    }

    /// Sets the dirty bit of a resident page
    pub fn mark_dirty(&mut self, page: u64) -> Result<()> {
        match self.page_table.get_mut(&page) {
            Some(entry) => {
                entry.dirty = true;
                Ok(())
            }
            None => Err(SimError::InvalidState(format!("virtual page {page:#x} is not resident"))),
        }
    }

    /// Translates without side effects. None if the page isn't resident
    pub fn translate(&self, address: u64) -> Result<Option<u64>> {
        check_range(address, self.size)?;
        Ok(self.page_table
            .get(&(address / self.page_size))
            .map(|entry| entry.physical_frame * self.page_size + address % self.page_size))
    }

    /// The page the next fault would evict, None while free frames remain
    pub fn next_victim(&self) -> Option<u64> {
        if self.free_frames.is_empty() {
            self.lru.front()
        } else {
            None
        }
    }

    pub fn is_resident(&self, page: u64) -> bool {
        self.page_table.contains_key(&page)
    }

    pub fn entry(&self, page: u64) -> Option<&PageTableEntry> {
        self.page_table.get(&page)
    }

    pub fn page_table(&self) -> &HashMap<u64, PageTableEntry> {
        &self.page_table
    }

    /// Page table entries sorted by page number
    pub fn entries(&self) -> Vec<(u64, PageTableEntry)> {
        let mut entries: Vec<_> = self.page_table.iter().map(|(page, entry)| (*page, *entry)).collect();
        entries.sort_unstable_by_key(|(page, _)| *page);
        entries
    }

    /// Free frames in ascending order
    pub fn free_frames(&self) -> Vec<u64> {
        let mut frames: Vec<_> = self.free_frames.iter().copied().collect();
        frames.sort_unstable();
        frames
    }

    pub fn is_free(&self, frame: u64) -> bool {
        self.free_frames.contains(&frame)
    }

    /// Resident pages from least to most recently used
    pub fn lru_order(&self) -> impl Iterator<Item = u64> + '_ {
        self.lru.iter()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.size / self.page_size
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn main_memory(&self) -> &SetAssociativeCache {
        &self.main_memory
    }

    pub(crate) fn main_memory_mut(&mut self) -> &mut SetAssociativeCache {
        &mut self.main_memory
    }

    fn check_page(&self, page: u64) -> Result<()> {
        if page < self.page_count() {
            Ok(())
        } else {
            Err(SimError::InvalidArgument(format!("virtual page {page:#x} out of range")))
        }
    }

    fn resident_entry(&self, page: u64) -> Result<&PageTableEntry> {
        self.page_table
            .get(&page)
            .ok_or_else(|| SimError::InvalidState(format!("virtual page {page:#x} is not resident")))
    }
}

impl MemoryLevel for VirtualMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, address: u64) -> Result<()> {
        self.perform(Access::Read(address)).map(|_| ())
    }

    fn write(&mut self, address: u64) -> Result<()> {
        self.perform(Access::Write(address)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::rc::Rc;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use super::*;
    use crate::physical::PhysicalMemory;
    use crate::sink::RecordingSink;

    /// 4 frames of 16 bytes, blocks of 4, direct mapped 32 byte cache, 16 virtual pages
    fn memory(frames: u64) -> (VirtualMemory, Rc<RecordingSink>, Rc<RecordingSink>) {
        let cache_sink = RecordingSink::new();
        let page_sink = RecordingSink::new();
        let physical = PhysicalMemory::new(frames * 16, 4, cache_sink.clone()).unwrap();
        let cache = SetAssociativeCache::new(physical, 32, 1, cache_sink.clone()).unwrap();
        let memory = VirtualMemory::new(cache, 256, 16, page_sink.clone()).unwrap();
        (memory, page_sink, cache_sink)
    }

    fn assert_frames_consistent(memory: &VirtualMemory) {
        let mapped: HashSet<u64> = memory.page_table().values().map(|e| e.physical_frame).collect();
        assert_eq!(mapped.len(), memory.page_table().len());
        for frame in 0..memory.frame_count() {
            assert_ne!(mapped.contains(&frame), memory.is_free(frame));
        }
        let mut lru: Vec<u64> = memory.lru_order().collect();
        lru.sort_unstable();
        let pages: Vec<u64> = memory.entries().into_iter().map(|(page, _)| page).collect();
        assert_eq!(lru, pages);
    }

    #[test]
    fn fault_then_resident() {
        let (mut memory, page_sink, cache_sink) = memory(4);
        memory.read(0x12).unwrap();
        assert!(page_sink.contains("page fault on virtual page 0x1"));
        assert_eq!(memory.entry(1), Some(&PageTableEntry { physical_frame: 0, dirty: false }));
        assert_eq!(memory.translate(0x12).unwrap(), Some(0x2));
        assert!(cache_sink.contains("read physical block 0x0"));
        page_sink.drain();
        memory.write(0x13).unwrap();
        assert_eq!(page_sink.lines(), vec!["virtual page 0x1 is resident"]);
        assert!(memory.entry(1).unwrap().dirty);
        assert_frames_consistent(&memory);
    }

    #[test]
    fn evicts_least_recently_used_page() {
        let (mut memory, page_sink, _) = memory(2);
        memory.write(0x00).unwrap();
        memory.read(0x10).unwrap();
        memory.read(0x05).unwrap();
        assert_eq!(memory.lru_order().collect::<Vec<_>>(), vec![1, 0]);
        assert_eq!(memory.next_victim(), Some(1));
        page_sink.drain();
        let evicted = memory.perform(Access::Read(0x20)).unwrap();
        assert_eq!(evicted, Some(1));
        assert!(!memory.is_resident(1));
        assert!(page_sink.contains("main memory is full"));
        // page 1 was clean
        assert!(!page_sink.contains("back to secondary storage"));
        assert_frames_consistent(&memory);

        page_sink.drain();
        assert_eq!(memory.perform(Access::Read(0x30)).unwrap(), Some(0));
        assert!(page_sink.contains("writing virtual page 0x0 back to secondary storage"));
        assert_frames_consistent(&memory);
    }

    #[test]
    fn eviction_invalidates_cache_lines_of_the_frame() {
        let (mut memory, _, cache_sink) = memory(2);
        memory.write(0x04).unwrap();
        memory.read(0x18).unwrap();
        let frame = memory.entry(0).unwrap().physical_frame;
        assert!(memory.main_memory().holds(frame * 16 + 4));
        memory.read(0x15).unwrap();
        cache_sink.drain();
        memory.read(0x20).unwrap();
        // the dirty line of page 0 was written back before the frame changed owner
        let lines = cache_sink.lines();
        let write_back = lines.iter().position(|l| l.starts_with("write physical block")).unwrap();
        let refill = lines.iter().position(|l| l.starts_with("read physical block")).unwrap();
        assert!(write_back < refill);
        assert_eq!(memory.entry(2).unwrap().physical_frame, frame);
        for offset in (0..16).step_by(4) {
            if memory.main_memory().holds(frame * 16 + offset) {
                // only the block just loaded for page 2 may be cached
                assert_eq!(offset, 0);
            }
        }
    }

    #[test]
    fn randomize_half_of_the_frames() {
        let (mut memory, _, _) = memory(8);
        let mut rng = StdRng::seed_from_u64(7);
        memory.randomize_page_table(0.5, &mut rng).unwrap();
        assert_eq!(memory.page_table().len(), 4);
        assert_eq!(memory.free_frames().len(), 4);
        assert!(memory.page_table().values().all(|e| !e.dirty));
        assert_frames_consistent(&memory);
        assert!(matches!(memory.randomize_page_table(0.5, &mut rng), Err(SimError::InvalidState(_))));
    }

    #[test]
    fn randomize_rejects_bad_fraction() {
        let (mut memory, _, _) = memory(4);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(memory.randomize_page_table(1.5, &mut rng), Err(SimError::InvalidArgument(_))));
        assert!(matches!(memory.randomize_page_table(-0.1, &mut rng), Err(SimError::InvalidArgument(_))));
        assert!(memory.page_table().is_empty());
    }

    #[test]
    fn structural_misuse() {
        let (mut memory, _, _) = memory(4);
        memory.read(0).unwrap();
        assert!(matches!(memory.swap_in(0), Err(SimError::InvalidState(_))));
        assert!(matches!(memory.swap_out(3), Err(SimError::InvalidState(_))));
        assert!(matches!(memory.read(256), Err(SimError::OutOfRange { .. })));
    }

    #[test]
    fn rejects_uneven_page_size() {
        let physical = PhysicalMemory::new(64, 4, RecordingSink::new()).unwrap();
        let cache = SetAssociativeCache::new(physical, 32, 1, RecordingSink::new()).unwrap();
        assert!(matches!(
            VirtualMemory::new(cache, 250, 16, RecordingSink::new()),
            Err(SimError::InvalidConfiguration(_))
        ));
    }
}
