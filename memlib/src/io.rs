use std::fs::File;
use std::io;
use std::path::Path;
use crate::error::Result;
use crate::level::Access;
use crate::simulator::parse_trace;

/// Reads and parses an access trace file
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<Access>> {
    let file = File::open(path)?;
    // Mapping an empty file fails on some systems
    if file.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }
    // Compatibility on other systems
    #[cfg(not(unix))]
    {
        use std::io::Read;
        let mut text = String::new();
        io::BufReader::new(file).read_to_string(&mut text)?;
        parse_trace(&text)
    }
    // Memory map the file on unix systems, traces are read once front to back
    #[cfg(unix)]
    {
        use memmap2::{Advice, Mmap};
        let map = unsafe { Mmap::map(&file)? };
        map.advise(Advice::Sequential)?;
        let text = std::str::from_utf8(&map).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        parse_trace(text)
    }
}
