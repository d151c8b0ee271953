//! Bad block management and flash translation for raw NAND flash.
//!
//! A trailing spare pool is reserved on the device. Data blocks that left the factory bad, or
//! fail later, are transparently served by blocks from that pool, and the tables describing this
//! are persisted to mirrored blocks inside the pool.

pub mod bmt;
pub mod config;
pub mod error;
pub mod format;
pub mod nand;
pub mod util;

pub use bmt::device::NandController;
pub use bmt::{BlockMapping, FlashTranslation, UpdateReason};
pub use config::{BmtConfig, Profile};
pub use error::BmtError;
