//! # MemLib
//!
//! MemLib is a library for simulating a small memory hierarchy one access at a time
//!
//! It provides a set associative cache in front of physical memory, demand paged virtual memory
//! using that cache as main memory, and a fully associative TLB in front of the page table. Every
//! decision a layer takes is reported as a human readable message to an injected sink, and every
//! table can be inspected between accesses
//!
//! It is meant for teaching rather than speed: the layers hold no data, only the bookkeeping

/// Contains the set associative cache and its line and address types
pub mod cache;

/// Contains the JSON configuration of a whole hierarchy
pub mod config;

/// Contains the error type shared by all layers
pub mod error;

/// Contains trace file reading
pub mod io;

/// Contains the common interface of the layers and the access type
pub mod level;

/// Contains the recency queue used by the page table and the TLB
pub mod lru;

/// Contains the leaf layer
pub mod physical;

/// Contains the trace sinks the layers report to
pub mod sink;

/// Contains the simulation context tying the layers together, and trace parsing
pub mod simulator;

/// Contains the TLB
pub mod tlb;

/// Contains the page table, frame pool and page replacement
pub mod virtual_memory;
