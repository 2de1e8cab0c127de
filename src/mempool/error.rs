use std::fmt;

#[derive(Debug)]
pub enum PoolError {
    /// Configuration rejected at pool or attribute construction time.
    InvalidConfig(String),
    /// The process-wide pool directory has no free slot left.
    DirectoryFull,
    /// The pool (or every candidate pool in a set) has no free slot left.
    Exhausted,
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
    MovePagesFailed(std::io::Error),
    /// NUMA page placement is not available on this platform.
    NumaUnsupported,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidConfig(msg) => write!(f, "invalid pool configuration: {msg}"),
            PoolError::DirectoryFull => write!(f, "pool directory is full"),
            PoolError::Exhausted => write!(f, "pool exhausted"),
            PoolError::MapFailed(e) => write!(f, "mapping backend failed: {e}"),
            PoolError::UnmapFailed(e) => write!(f, "unmapping backend failed: {e}"),
            PoolError::MovePagesFailed(e) => write!(f, "move_pages failed: {e}"),
            PoolError::NumaUnsupported => write!(f, "NUMA page placement not supported"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::MapFailed(e) | PoolError::UnmapFailed(e) | PoolError::MovePagesFailed(e) => {
                Some(e)
            }
            PoolError::InvalidConfig(_)
            | PoolError::DirectoryFull
            | PoolError::Exhausted
            | PoolError::NumaUnsupported => None,
        }
    }
}
