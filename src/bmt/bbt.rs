//! The factory bad block table, built once by scanning the manufacturer's markers.

use tracing::error;

use super::pool::PoolGeometry;
use super::table::Bmt;
use crate::config::{BmtConfig, BBT_VERSION};
use crate::error::{BmtError, Result};
use crate::nand::{BadMarker, Nand};

/// The blocks of the data region that left the factory bad, in ascending order
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct InitBbt {
    badblock_table: Vec<u16>,
    capacity: usize,
    version: u8,
}

impl InitBbt {
    /// A table without bad blocks
    pub fn new(capacity: usize) -> Self {
        Self {
            badblock_table: Vec::new(),
            capacity,
            version: BBT_VERSION,
        }
    }

    /// Rebuild a table from persisted block indexes
    pub fn from_blocks(capacity: usize, blocks: Vec<u16>) -> Result<Self> {
        if blocks.len() > capacity {
            return Err(BmtError::BbtOverflow {
                count: blocks.len(),
                capacity,
            });
        }
        if blocks.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(BmtError::Integrity(
                "bad block table not strictly ascending".into(),
            ));
        }

        Ok(Self {
            badblock_table: blocks,
            capacity,
            version: BBT_VERSION,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn badblock_count(&self) -> usize {
        self.badblock_table.len()
    }

    pub fn contains(&self, block: u32) -> bool {
        u16::try_from(block).map_or(false, |x| self.badblock_table.binary_search(&x).is_ok())
    }

    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.badblock_table.iter().map(|&x| x.into())
    }
}

/// Scan the factory markers of every block of the data region.
///
/// The spare pool is not part of the scan; its bad blocks are skipped when allocating instead.
pub fn start_init_bbt<N: Nand>(
    nand: &mut N,
    geometry: PoolGeometry,
    config: &BmtConfig,
) -> Result<InitBbt> {
    let rpt = howudoin::new()
        .label("Scanning factory bad blocks")
        .set_len(u64::from(geometry.data_blocks()));

    let mut blocks = Vec::new();
    for block in 0..geometry.data_blocks() {
        if nand.is_bad(block, BadMarker::Factory)? {
            rpt.add_info(format!("block {block} is factory-bad"));
            blocks.push(block as u16);
        }
        rpt.inc();
    }

    rpt.close();

    if blocks.len() > config.max_raw_bad_blocks {
        error!(
            count = blocks.len(),
            capacity = config.max_raw_bad_blocks,
            "too many factory-bad blocks, device unusable"
        );
    }

    InitBbt::from_blocks(config.max_raw_bad_blocks, blocks)
}

/// Which blocks of the data region must be reported bad to upper layers
///
/// A block is reported bad only if it left the factory bad and has no spare block serving it.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct BadBlockLookup(Box<[bool]>);

impl BadBlockLookup {
    pub fn new(geometry: PoolGeometry, bbt: &InitBbt, bmt: &Bmt) -> Result<Self> {
        let mut bad = vec![false; geometry.data_blocks() as usize];
        for block in bbt.blocks() {
            let slot = bad.get_mut(block as usize).ok_or_else(|| {
                BmtError::Integrity(format!("factory-bad block {block} lies inside the pool"))
            })?;
            *slot = bmt.lookup(block).is_none();
        }

        Ok(Self(bad.into_boxed_slice()))
    }

    pub fn is_bad(&self, block: u32) -> bool {
        self.0.get(block as usize).copied().unwrap_or(true)
    }

    /// Number of blocks reported bad
    pub fn count(&self) -> usize {
        self.0.iter().filter(|&&x| x).count()
    }
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
    fn test_scan_excludes_pool() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        for block in [5, 200, 1023] {
            nand.set_factory_bad(block)?;
        }

        let geometry = PoolGeometry::new(1024, 82)?;
        let bbt = start_init_bbt(&mut nand, geometry, &BmtConfig::default())?;
        assert_eq!(bbt.badblock_count(), 2);
        assert_eq!(bbt.blocks().collect::<Vec<_>>(), [5, 200]);
        assert!(bbt.contains(200));
        assert!(!bbt.contains(1023));

        // Scanning again reproduces the same table
        assert_eq!(start_init_bbt(&mut nand, geometry, &BmtConfig::default())?, bbt);
        Ok(())
    }

    #[test]
    fn test_scan_overflow() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        for block in 0..4 {
            nand.set_factory_bad(block * 3)?;
        }

        let config = BmtConfig {
            max_raw_bad_blocks: 3,
            ..Default::default()
        };
        let geometry = PoolGeometry::new(1024, 82)?;
        assert!(matches!(
            start_init_bbt(&mut nand, geometry, &config),
            Err(BmtError::BbtOverflow {
                count: 4,
                capacity: 3
            })
        ));
        Ok(())
    }

    #[test]
    fn test_lookup_hides_mapped() -> Result<()> {
        let geometry = PoolGeometry::new(64, 8)?;
        let bbt = InitBbt::from_blocks(16, vec![3, 9])?;
        let mut bmt = Bmt::new(16);
        bmt.map(3, 60)?;

        let lookup = BadBlockLookup::new(geometry, &bbt, &bmt)?;
        assert!(!lookup.is_bad(3));
        assert!(lookup.is_bad(9));
        assert!(!lookup.is_bad(10));
        assert!(lookup.is_bad(56));
        assert_eq!(lookup.count(), 1);
        Ok(())
    }
}
