use std::fmt;

/// Errors surfaced across the public allocator API.
///
/// Internal invariant violations (a handle with the in-use bit clear offered
/// for free, a subpage slot freed twice) are bugs and abort via panic rather
/// than travelling through this type.
#[derive(Debug)]
pub enum PoolError {
    /// Rejected configuration (bad pageSize/maxOrder/alignment combination).
    ConfigInvalid(String),
    /// The system allocator refused to produce a new chunk or huge region.
    OutOfMemory { requested: usize },
    /// `min_new_capacity` exceeded the buffer's `max_capacity`.
    CapacityExceeded { requested: usize, max: usize },
    /// Requested capacity is outside what the allocator can serve.
    SizeOutOfRange { requested: usize, max: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ConfigInvalid(msg) => write!(f, "invalid allocator configuration: {msg}"),
            PoolError::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            PoolError::CapacityExceeded { requested, max } => write!(
                f,
                "minNewCapacity: {requested} (expected: not greater than maxCapacity({max}))"
            ),
            PoolError::SizeOutOfRange { requested, max } => {
                write!(f, "capacity {requested} out of range (max: {max})")
            }
        }
    }
}

impl std::error::Error for PoolError {}
