//! Sizing of the spare pool, and the search for usable blocks inside it.

use std::ops::Range;

use anyhow::ensure;

use crate::config::BmtConfig;
use crate::nand::{BadMarker, Nand};

/// Splits the device into the data region seen by upper layers and the trailing spare pool
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolGeometry {
    total_blocks: u32,
    pool_start: u32,
}

impl PoolGeometry {
    /// Reserve the last `pool_size` of `total_blocks` blocks as the spare pool
    pub fn new(total_blocks: u32, pool_size: u32) -> anyhow::Result<Self> {
        ensure!(
            pool_size > 0 && pool_size < total_blocks,
            "pool of {pool_size} blocks does not fit a {total_blocks}-block device"
        );

        Ok(Self {
            total_blocks,
            pool_start: total_blocks - pool_size,
        })
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Number of blocks addressable by upper layers
    pub fn data_blocks(&self) -> u32 {
        self.pool_start
    }

    /// First block of the spare pool
    pub fn pool_start(&self) -> u32 {
        self.pool_start
    }

    pub fn pool_size(&self) -> u32 {
        self.total_blocks - self.pool_start
    }

    /// The blocks of the spare pool, lowest first
    pub fn pool(&self) -> Range<u32> {
        self.pool_start..self.total_blocks
    }

    pub fn in_pool(&self, block: u32) -> bool {
        self.pool().contains(&block)
    }
}

/// Determine how many trailing blocks to reserve as the spare pool.
///
/// Walks down from the last block, skipping factory-bad blocks, until `pool_percent` percent of
/// the device has been counted as good. Block 0 is never part of the pool.
pub fn calc_bmt_pool_size<N: Nand>(nand: &mut N, config: &BmtConfig) -> anyhow::Result<u32> {
    let total_blocks = nand.get_layout().blocks;
    ensure!(total_blocks > 1, "device too small for a spare pool");

    let needed = u64::from(total_blocks) * u64::from(config.pool_percent) / 100;
    let needed = std::cmp::max(1, u32::try_from(needed).unwrap_or(u32::MAX));

    let mut last_block = total_blocks - 1;
    let mut good_blocks = 0;
    while last_block > 0 {
        if !nand.is_bad(last_block, BadMarker::Factory)? {
            good_blocks += 1;
            if good_blocks == needed {
                break;
            }
        }
        last_block -= 1;
    }

    Ok(total_blocks - last_block)
}

/// Whether a block carries either bad marker
pub fn is_unusable<N: Nand>(nand: &mut N, block: u32) -> anyhow::Result<bool> {
    Ok(nand.is_bad(block, BadMarker::Factory)? || nand.is_bad(block, BadMarker::Runtime)?)
}

/// Return the first of `candidates` that is neither `taken` nor marked bad
pub fn find_free_block<N, I, F>(
    nand: &mut N,
    candidates: I,
    taken: F,
) -> anyhow::Result<Option<u32>>
where
    N: Nand,
    I: IntoIterator<Item = u32>,
    F: Fn(u32) -> bool,
{
    for block in candidates {
        if taken(block) || is_unusable(nand, block)? {
            continue;
        }
        return Ok(Some(block));
    }

    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 4,
        bytes_per_page: 512,
        oob_bytes_per_page: 16,
    };

    #[test]
    fn test_pool_size_clean() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        // 8% of 1024 is 81 good blocks
        assert_eq!(calc_bmt_pool_size(&mut nand, &BmtConfig::default())?, 81);
        Ok(())
    }

    #[test]
    fn test_pool_size_skips_bad() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_factory_bad(1023)?;
        nand.set_factory_bad(1000)?;
        assert_eq!(calc_bmt_pool_size(&mut nand, &BmtConfig::default())?, 83);

        let geometry = PoolGeometry::new(1024, 83)?;
        assert_eq!(geometry.pool_start(), 941);
        assert!(geometry.in_pool(941));
        assert!(!geometry.in_pool(940));
        assert!(!geometry.in_pool(1024));
        Ok(())
    }

    #[test]
    fn test_pool_size_large_percentage() -> anyhow::Result<()> {
        let mut nand = SimNand::new(NandLayout {
            blocks: 16,
            ..TEST_LAYOUT
        });
        let config = BmtConfig {
            pool_percent: u32::MAX,
            ..Default::default()
        };

        // Everything but block 0, which is left for the caller to reject
        assert_eq!(calc_bmt_pool_size(&mut nand, &config)?, 16);
        assert!(PoolGeometry::new(16, 16).is_err());
        Ok(())
    }

    #[test]
    fn test_pool_geometry_bounds() {
        assert!(PoolGeometry::new(16, 0).is_err());
        assert!(PoolGeometry::new(16, 16).is_err());
        assert_eq!(PoolGeometry::new(16, 2).unwrap().data_blocks(), 14);
    }

    #[test]
    fn test_find_free_block() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_factory_bad(10)?;
        nand.mark_bad(11, BadMarker::Runtime)?;

        let found = find_free_block(&mut nand, 10..20, |b| b == 12)?;
        assert_eq!(found, Some(13));

        let found = find_free_block(&mut nand, (10..13).rev(), |b| b == 12)?;
        assert_eq!(found, None);
        Ok(())
    }
}
