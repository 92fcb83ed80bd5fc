use std::fmt;
use std::rc::Rc;
use clap::Parser;
use human_bytes::human_bytes;
use memlib::config::SimulationConfig;
use memlib::io::read_trace;
use memlib::level::MemoryLevel;
use memlib::sink::{NullSink, SharedSink, TraceSink};
use memlib::simulator::{Simulation, Sinks};

#[cfg(debug_assertions)]
const DEBUG_DEFAULT: bool = true;

#[cfg(not(debug_assertions))]
const DEBUG_DEFAULT: bool = false;

#[derive(Parser, Debug)]
#[command(about = String::from("Memory hierarchy simulator: TLB, page table, cache and physical memory"))]
struct Args {
    /// JSON configuration, missing fields take their defaults
    config: String,
    /// Access trace, one `R <hex address>` or `W <hex address>` per line
    trace: String,

    /// Print a JSON snapshot of every table after each access
    #[arg(short, long)]
    snapshots: bool,

    /// Bypass the TLB and access virtual memory directly
    #[arg(long)]
    direct: bool,

    /// Don't print trace messages
    #[arg(short, long)]
    quiet: bool,

    /// Send trace messages to the logger instead of stdout, shown with RUST_LOG=info
    #[arg(short, long, conflicts_with = "quiet")]
    log: bool,

    #[arg(short, long, default_value_t = DEBUG_DEFAULT)]
    debug: bool,
}

/// Prints trace messages to stdout, tagged with their layer
struct ConsoleSink {
    prefix: &'static str,
}

impl TraceSink for ConsoleSink {
    fn emit(&self, message: fmt::Arguments<'_>) {
        println!("[{}] {}", self.prefix, message);
    }
}

fn trace_sinks(args: &Args) -> Sinks {
    if args.quiet {
        return Sinks::all(Rc::new(NullSink));
    }
    if args.log {
        return Sinks::log();
    }
    let sink = |prefix| -> SharedSink { Rc::new(ConsoleSink { prefix }) };
    Sinks {
        tlb: sink("tlb"),
        page_table: sink("page"),
        cache: sink("cache"),
    }
}

fn main() -> Result<(), String> {
    env_logger::init();
    let args = Args::parse();
    let config = SimulationConfig::from_file(&args.config).map_err(|e| format!("Couldn't read the config file at path {}: {e}", args.config))?;
    let accesses = read_trace(&args.trace).map_err(|e| format!("Couldn't read the trace file at path {}: {e}", args.trace))?;
    let mut simulation = Simulation::new(&config, trace_sinks(&args), !args.direct).map_err(|e| format!("Couldn't build the simulation: {e}"))?;
    log::info!("replaying {} accesses from {}", accesses.len(), args.trace);
    if args.debug {
        #[cfg(debug_assertions)]
        println!("Running the debug binary, debug mode is enabled by default. Pass --debug=false to hide the configuration and final state");
        println!("Parsed input configuration: {config:?}");
        println!("{}", describe(&simulation));
    }
    for (step, access) in accesses.into_iter().enumerate() {
        if !args.quiet && !args.log {
            println!("--- {step}: {access:?}");
        }
        simulation.access(access).map_err(|e| format!("Access {step} ({access:?}) failed: {e}"))?;
        if args.snapshots {
            println!("{}", serde_json::to_string(&simulation.snapshot()).map_err(|e| format!("Couldn't serialise the snapshot {e}"))?);
        }
    }
    if args.debug {
        println!("Final state: {}", serde_json::to_string_pretty(&simulation.snapshot()).map_err(|e| format!("Couldn't serialise the snapshot {e}"))?);
    }
    println!("Completed {} accesses", simulation.access_count());
    Ok(())
}

/// Summarises the sizes of the hierarchy that was built
fn describe(simulation: &Simulation) -> String {
    let memory = simulation.virtual_memory();
    let cache = simulation.cache();
    let physical = cache.physical();
    let tlb = match simulation.tlb() {
        Some(tlb) => format!("{} lines", tlb.capacity()),
        None => "bypassed".to_string(),
    };
    format!(
        "Physical memory: {} ({} blocks of {} bytes)\nCache: {} ({} sets, {}-way)\nVirtual memory: {} ({} pages of {}, {} frames)\nTLB: {}",
        human_bytes(physical.size() as f64),
        physical.block_count(),
        physical.block_size(),
        human_bytes(cache.capacity() as f64),
        cache.set_count(),
        cache.associativity(),
        human_bytes(memory.size() as f64),
        memory.page_count(),
        human_bytes(memory.page_size() as f64),
        memory.frame_count(),
        tlb,
    )
}
