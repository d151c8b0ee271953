//! The error type of the bad block management core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BmtError {
    #[error("block {block} is outside the {limit}-block data region")]
    OutOfRange { block: u32, limit: u32 },

    #[error("block {0} is neither a data block nor a mapped spare")]
    UnknownBlock(u32),

    #[error("{what} buffer holds {len} bytes, expected {expected}")]
    BufferSize {
        what: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("no free block left in the spare pool")]
    PoolExhausted,

    #[error("bad block mapping table is full ({0} entries)")]
    TableFull(usize),

    #[error("{count} factory-bad blocks exceed the bad block table capacity of {capacity}")]
    BbtOverflow { count: usize, capacity: usize },

    #[error("no mirror slot accepted the table image")]
    PersistFailed,

    #[error("persisted tables cannot be trusted: {0}")]
    Integrity(String),

    #[error("persisted tables have version {found}, expected {expected}")]
    VersionMismatch { found: u8, expected: u8 },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl BmtError {
    /// Whether the device must be considered failed
    ///
    /// Everything except a bad argument from the caller is fatal at this layer.
    pub fn is_device_failure(&self) -> bool {
        !matches!(
            self,
            Self::OutOfRange { .. } | Self::UnknownBlock(_) | Self::BufferSize { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BmtError>;
