use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use serde::Serialize;
use crate::cache::{CacheLine, SetAssociativeCache};
use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::level::{Access, MemoryLevel};
use crate::physical::PhysicalMemory;
use crate::sink::{LogSink, NullSink, SharedSink};
use crate::tlb::{FullyAssociativeTlb, TlbLine};
use crate::virtual_memory::VirtualMemory;

lazy_static! {
    static ref ACCESS_PATTERN: Regex =
        Regex::new(r"^(?P<mode>[RrWw])[\s:]+(?:0[xX])?(?P<address>[0-9a-fA-F]+)$").unwrap();
}

/// Where each layer sends its trace messages. Physical memory shares the cache's sink
#[derive(Clone)]
pub struct Sinks {
    pub tlb: SharedSink,
    pub page_table: SharedSink,
    pub cache: SharedSink,
}

impl Sinks {
    /// Discards all messages
    pub fn null() -> Self {
        Self::all(std::rc::Rc::new(NullSink))
    }

    /// Sends all messages to the `log` facade, tagged by layer
    pub fn log() -> Self {
        Self {
            tlb: LogSink::new("tlb"),
            page_table: LogSink::new("page"),
            cache: LogSink::new("cache"),
        }
    }

    /// The same sink for every layer
    pub fn all(sink: SharedSink) -> Self {
        Self {
            tlb: sink.clone(),
            page_table: sink.clone(),
            cache: sink,
        }
    }
}

/// The layer accesses enter the hierarchy through
///
/// An enum rather than `Box<dyn MemoryLevel>` so the snapshot code can still reach the concrete
/// layers
pub enum Frontend {
    Tlb(FullyAssociativeTlb),
    Direct(VirtualMemory),
}

impl MemoryLevel for Frontend {
    fn size(&self) -> u64 {
        match self {
            Frontend::Tlb(tlb) => tlb.size(),
            Frontend::Direct(memory) => memory.size(),
        }
    }

    fn read(&mut self, address: u64) -> Result<()> {
        match self {
            Frontend::Tlb(tlb) => tlb.read(address),
            Frontend::Direct(memory) => memory.read(address),
        }
    }

    fn write(&mut self, address: u64) -> Result<()> {
        match self {
            Frontend::Tlb(tlb) => tlb.write(address),
            Frontend::Direct(memory) => memory.write(address),
        }
    }
}

/// A row of the page table as displayed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PageTableRow {
    pub virtual_page: u64,
    pub physical_frame: u64,
    pub dirty: bool,
}

/// The state of every table after an access, for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub cache_sets: Vec<Vec<CacheLine>>,
    pub page_table: Vec<PageTableRow>,
    pub free_frames: Vec<u64>,
    pub page_lru: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tlb: Option<Vec<TlbLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tlb_lru: Option<Vec<usize>>,
}

/// Owns a complete hierarchy built from one configuration
///
/// Accesses go through the TLB unless the simulation was built in direct mode, in which case they
/// go straight to the page table
pub struct Simulation {
    frontend: Frontend,
    accesses: u64,
}

impl Simulation {
    /// Builds the hierarchy bottom up, randomising the page table if the configuration asks for it
    ///
    /// # Arguments
    ///
    /// * `config`: Sizing of every layer
    /// * `sinks`: Receivers of the trace messages
    /// * `use_tlb`: Whether accesses go through a TLB
    ///
    /// returns: Result<Simulation>
    pub fn new(config: &SimulationConfig, sinks: Sinks, use_tlb: bool) -> Result<Self> {
        let physical = PhysicalMemory::new(config.physical_size()?, config.block_size, sinks.cache.clone())?;
        let cache = SetAssociativeCache::new(physical, config.cache_size()?, config.associativity, sinks.cache)?;
        let mut memory = VirtualMemory::new(cache, config.virtual_size()?, config.page_size, sinks.page_table)?;
        if let Some(usage) = config.page_table_usage {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            memory.randomize_page_table(usage, &mut rng)?;
        }
        let frontend = if use_tlb {
            Frontend::Tlb(FullyAssociativeTlb::new(memory, config.tlb_line_count, sinks.tlb)?)
        } else {
            Frontend::Direct(memory)
        };
        Ok(Self { frontend, accesses: 0 })
    }

    pub fn access(&mut self, access: Access) -> Result<()> {
        self.frontend.access(access)?;
        self.accesses += 1;
        Ok(())
    }

    /// Performs accesses in order, stopping at the first failure
    pub fn run<I: IntoIterator<Item = Access>>(&mut self, accesses: I) -> Result<()> {
        for access in accesses {
            self.access(access)?;
        }
        Ok(())
    }

    /// Parses a textual trace and runs it, see [`parse_trace`]
    pub fn simulate(&mut self, trace: &str) -> Result<()> {
        self.run(parse_trace(trace)?)
    }

    /// Number of successful accesses so far
    pub fn access_count(&self) -> u64 {
        self.accesses
    }

    pub fn tlb(&self) -> Option<&FullyAssociativeTlb> {
        match &self.frontend {
            Frontend::Tlb(tlb) => Some(tlb),
            Frontend::Direct(_) => None,
        }
    }

    pub fn virtual_memory(&self) -> &VirtualMemory {
        match &self.frontend {
            Frontend::Tlb(tlb) => tlb.virtual_memory(),
            Frontend::Direct(memory) => memory,
        }
    }

    pub fn cache(&self) -> &SetAssociativeCache {
        self.virtual_memory().main_memory()
    }

    pub fn snapshot(&self) -> Snapshot {
        let memory = self.virtual_memory();
        Snapshot {
            cache_sets: self.cache().sets().to_vec(),
            page_table: memory
                .entries()
                .into_iter()
                .map(|(virtual_page, entry)| PageTableRow {
                    virtual_page,
                    physical_frame: entry.physical_frame,
                    dirty: entry.dirty,
                })
                .collect(),
            free_frames: memory.free_frames(),
            page_lru: memory.lru_order().collect(),
            tlb: self.tlb().map(|tlb| tlb.lines().to_vec()),
            tlb_lru: self.tlb().map(|tlb| tlb.lru_order().collect()),
        }
    }
}

/// Parses one access such as `R 1f`, `w 0x20` or `W:40`. Addresses are hexadecimal
///
/// # Examples
///
/// ```
/// use memlib::level::Access;
/// use memlib::simulator::parse_access;
/// assert_eq!(parse_access("W 0x1A"), Some(Access::Write(0x1a)));
/// assert_eq!(parse_access("X 10"), None);
/// ```
pub fn parse_access(line: &str) -> Option<Access> {
    let captures = ACCESS_PATTERN.captures(line.trim())?;
    let address = u64::from_str_radix(&captures["address"], 16).ok()?;
    match &captures["mode"] {
        "R" | "r" => Some(Access::Read(address)),
        _ => Some(Access::Write(address)),
    }
}

/// Parses a trace with one access per line. Blank lines and `#` comments are skipped
pub fn parse_trace(trace: &str) -> Result<Vec<Access>> {
    let mut accesses = Vec::new();
    for (index, raw) in trace.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let access = parse_access(line).ok_or_else(|| SimError::Parse {
            line: index + 1,
            content: raw.to_string(),
        })?;
        accesses.push(access);
    }
    Ok(accesses)
}
