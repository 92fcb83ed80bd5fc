/// Errors raised by the memory hierarchy components and their loaders
///
/// Every variant except the loader ones is a contract violation by the caller: the operation that
/// returns it has not mutated any state
#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("address {address:#x} out of range (limit is {limit:#x})")]
    OutOfRange { address: u64, limit: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("couldn't parse access on line {line}: {content:?}")]
    Parse { line: usize, content: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Fails with [`SimError::OutOfRange`] unless `address < limit`
pub(crate) fn check_range(address: u64, limit: u64) -> Result<()> {
    if address < limit {
        Ok(())
    } else {
        Err(SimError::OutOfRange { address, limit })
    }
}
