//!
//! # Common components
//!

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;

/// Milliseconds since the unix epoch.
#[inline(always)]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds since the unix epoch.
#[inline(always)]
pub fn now_sec() -> i64 {
    now_ms() / 1000
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Error taxonomy of the combine core.
///
/// Callers branch on the variant: `Overflow`/`NoMemory`/`Exists` degrade a
/// write to the uncombined direct path, `NotFound` is recovered locally by
/// re-opening, `InvalidArg` is fatal for the thread that hits it, `Io` is
/// retried or surfaced per the storage policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpError {
    Overflow,
    NoMemory,
    NotFound,
    Exists,
    InvalidArg(String),
    Io(String),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "extent overflow"),
            Self::NoMemory => write!(f, "allocator exhausted"),
            Self::NotFound => write!(f, "entry not found"),
            Self::Exists => write!(f, "entry already exists"),
            Self::InvalidArg(msg) => write!(f, "invalid argument: {}", msg),
            Self::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for OpError {}

impl From<std::io::Error> for OpError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type OpResult<T> = Result<T, OpError>;
