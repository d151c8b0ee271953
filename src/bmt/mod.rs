//! Bad block management and flash translation.
//!
//! The device is split into a data region, addressed by upper layers, and a trailing spare pool.
//! Data blocks that are (or go) bad are served by spare blocks through the mapping table, which
//! is kept in RAM and persisted to mirror blocks inside the pool.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{anyhow, bail, ensure};
use retry::{delay::NoDelay, retry};
use tracing::{debug, error, info, warn};

use crate::config::{BmtConfig, VersionPolicy, BMT_VERSION};
use crate::error::{BmtError, Result};
use crate::nand::{BadMarker, Nand, NandLayout, PageUtil, OOB_MIN_SIZE, OOB_TAG_OFFSET};

pub mod bbt;
pub mod device;
pub mod media;
pub mod pool;
pub mod table;

use bbt::{start_init_bbt, BadBlockLookup, InitBbt};
use media::{ImageError, TableImage};
use pool::{calc_bmt_pool_size, find_free_block, is_unusable, PoolGeometry};
use table::Bmt;

/// Block indexes are persisted as 16 bits
const MAX_BLOCKS: u32 = 1 << 16;

/// Why a block is being remapped
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum UpdateReason {
    /// Erasing the block failed
    EraseFail,

    /// Programming a page of the block failed; its data must be relocated
    WriteFail,

    /// The block was found bad without having a spare yet
    UnmappedBlock,
}

impl FromStr for UpdateReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "erase" => Self::EraseFail,
            "write" => Self::WriteFail,
            "unmapped" => Self::UnmappedBlock,
            _ => bail!("unknown reason `{s}` (expected erase, write or unmapped)"),
        })
    }
}

/// Where a data block currently lives
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct BlockMapping {
    /// The physical block serving the access
    pub physical: u32,

    /// The tag to store in the OOB area of pages written into the spare pool
    pub tag: u16,
}

/// A mismatch between the OOB tags found in the spare pool and the mapping table
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum TagFinding {
    /// A mapped spare carries the tag of another block
    Mismatch { block: u32, expected: u32, found: u32 },

    /// A tagged spare that no table entry points at, such as one left by an interrupted remap
    Orphan { block: u32, tag: u32 },

    Unreadable { block: u32 },
}

/// Copy of `oob` carrying `tag`, with both bad-block markers left clear
pub(crate) fn tag_oob(oob: &[u8], tag: u16) -> Vec<u8> {
    let mut oob = oob.to_vec();
    oob[BadMarker::Factory.oob_offset()] = 0xFF;
    oob[BadMarker::Runtime.oob_offset()] = 0xFF;
    oob[OOB_TAG_OFFSET..OOB_TAG_OFFSET + 2].copy_from_slice(&tag.to_le_bytes());
    oob
}

fn read_tag(oob: &[u8]) -> Option<u16> {
    let tag = u16::from_le_bytes([oob[OOB_TAG_OFFSET], oob[OOB_TAG_OFFSET + 1]]);
    (tag != u16::MAX).then_some(tag)
}

pub(crate) fn check_buffer(what: &'static str, buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(BmtError::BufferSize {
            what,
            len: buf.len(),
            expected,
        });
    }
    Ok(())
}

fn check_layout(layout: NandLayout, config: &BmtConfig) -> anyhow::Result<()> {
    ensure!(
        layout.blocks <= MAX_BLOCKS,
        "{} blocks cannot be addressed by the mapping table",
        layout.blocks
    );
    ensure!(
        media::image_size(config) <= layout.block_size(),
        "tables do not fit in one {}-byte block",
        layout.block_size()
    );
    ensure!(
        layout.oob_bytes_per_page >= OOB_MIN_SIZE,
        "OOB area of {} bytes cannot hold the block tag",
        layout.oob_bytes_per_page
    );
    ensure!(config.mirrors > 0, "at least one table mirror is needed");
    Ok(())
}

/// The flash translation layer over a raw NAND device
///
/// Owns the device and both tables. All operations take `&mut self`, so at most one is in
/// progress at any time; see [device::NandController] for sharing it between threads.
#[derive(Debug)]
pub struct FlashTranslation<N: Nand> {
    nand: N,
    config: BmtConfig,
    geometry: PoolGeometry,
    bbt: InitBbt,
    bmt: Bmt,

    /// Pool blocks holding the persisted tables
    mirrors: Vec<u32>,

    /// Incremented on every flush that changes the persisted tables
    generation: u32,

    /// Have the tables changed since they were last persisted?
    dirty: bool,

    /// Blocks retired since attach, whether or not their marker could be written
    retired: BTreeSet<u32>,

    bad_lookup: Option<BadBlockLookup>,
}

impl<N: Nand> FlashTranslation<N> {
    /// Bring up the translation layer on `nand`: size the pool, load or build the tables,
    /// persist them if needed, and build the bad block lookup.
    pub fn attach(mut nand: N, config: BmtConfig) -> Result<Self> {
        check_layout(nand.get_layout(), &config)?;
        let pool_size = calc_bmt_pool_size(&mut nand, &config)?;
        let mut ftl = Self::init_bmt(nand, pool_size, config)?;
        if ftl.dirty {
            ftl.write_bbt_or_bmt_to_flash()?;
        }
        ftl.create_badblock_table_by_bbt()?;

        info!(
            data_blocks = ftl.geometry.data_blocks(),
            pool_start = ftl.geometry.pool_start(),
            factory_bad = ftl.bbt.badblock_count(),
            mapped = ftl.bmt.mapped_count(),
            generation = ftl.generation,
            "bad block management attached"
        );
        Ok(ftl)
    }

    /// Load the newest persisted tables from the last `pool_size` blocks, or build fresh ones if
    /// none exist.
    ///
    /// Fresh tables map every factory-bad data block to the lowest free pool block, and are not
    /// persisted until [Self::write_bbt_or_bmt_to_flash].
    pub fn init_bmt(mut nand: N, pool_size: u32, config: BmtConfig) -> Result<Self> {
        let layout = nand.get_layout();
        check_layout(layout, &config)?;
        let geometry = PoolGeometry::new(layout.blocks, pool_size)?;

        if let Some((holders, image)) = load_tables(&mut nand, geometry, &config)? {
            return Self::from_image(nand, config, geometry, holders, image);
        }

        let bbt = start_init_bbt(&mut nand, geometry, &config)?;
        let mut ftl = Self {
            nand,
            config,
            geometry,
            bbt,
            bmt: Bmt::new(config.max_bmt_size),
            mirrors: Vec::new(),
            generation: 0,
            dirty: true,
            retired: BTreeSet::new(),
            bad_lookup: None,
        };

        ftl.reserve_mirrors()?;
        let bad_blocks = ftl.bbt.blocks().collect::<Vec<_>>();
        for block in bad_blocks {
            let spare = ftl.allocate_block()?;
            ftl.bmt.map(block, spare)?;
            debug!(block, spare, "factory-bad block mapped");
        }

        Ok(ftl)
    }

    fn from_image(
        nand: N,
        config: BmtConfig,
        geometry: PoolGeometry,
        mut holders: Vec<u32>,
        image: TableImage,
    ) -> Result<Self> {
        let geometry = if image.pool_start == geometry.pool_start() {
            geometry
        } else {
            warn!(
                persisted = image.pool_start,
                computed = geometry.pool_start(),
                "pool boundary moved since the tables were written, keeping the persisted one"
            );
            let total = geometry.total_blocks();
            PoolGeometry::new(total, total.saturating_sub(image.pool_start))
                .map_err(|e| BmtError::Integrity(e.to_string()))?
        };

        for entry in image.bmt.entries() {
            let mapped = u32::from(entry.mapped_index);
            if !geometry.in_pool(mapped) || holders.contains(&mapped) {
                return Err(BmtError::Integrity(format!(
                    "block {} mapped to unusable spare {mapped}",
                    entry.bad_index
                )));
            }
        }

        holders.truncate(config.mirrors);
        let mut ftl = Self {
            nand,
            config,
            geometry,
            bbt: image.bbt,
            bmt: image.bmt,
            mirrors: holders,
            generation: image.generation,
            dirty: false,
            retired: BTreeSet::new(),
            bad_lookup: None,
        };

        // Replace copies that were lost or damaged
        ftl.reserve_mirrors()?;
        Ok(ftl)
    }

    /// Claim free blocks from the top of the pool until enough mirrors exist
    fn reserve_mirrors(&mut self) -> Result<()> {
        while self.mirrors.len() < self.config.mirrors {
            let (bmt, mirrors, retired) = (&self.bmt, &self.mirrors, &self.retired);
            let free = find_free_block(&mut self.nand, self.geometry.pool().rev(), |block| {
                bmt.is_mapped_target(block)
                    || mirrors.contains(&block)
                    || retired.contains(&block)
            })?;

            match free {
                Some(block) => {
                    debug!(block, "table mirror reserved");
                    self.mirrors.push(block);
                    self.dirty = true;
                }
                None => break,
            }
        }

        if self.mirrors.is_empty() {
            error!("no pool block left to hold the tables");
            return Err(BmtError::PoolExhausted);
        }
        Ok(())
    }

    /// Find and erase the lowest free pool block. Candidates failing the erase are retired.
    fn allocate_block(&mut self) -> Result<u32> {
        loop {
            let (bmt, mirrors, retired) = (&self.bmt, &self.mirrors, &self.retired);
            let free = find_free_block(&mut self.nand, self.geometry.pool(), |block| {
                bmt.is_mapped_target(block)
                    || mirrors.contains(&block)
                    || retired.contains(&block)
            })?;

            let Some(block) = free else {
                error!("spare pool exhausted");
                return Err(BmtError::PoolExhausted);
            };

            match self.nand.erase_block(block) {
                Ok(()) => return Ok(block),
                Err(e) => {
                    warn!(block, "spare block failed to erase: {e:#}");
                    self.retire_block(block);
                }
            }
        }
    }

    /// Take `block` out of service and set its runtime bad marker.
    ///
    /// A marker that cannot be written only costs a warning: the block stays out of the free set
    /// until detach, and a later allocation that picks it again fails its erase or verify.
    fn retire_block(&mut self, block: u32) {
        warn!(block, "retiring block");
        if let Err(e) = self.nand.mark_bad(block, BadMarker::Runtime) {
            warn!(block, "cannot set bad marker: {e:#}");
        }
        if self.retired.insert(block) && self.geometry.in_pool(block) {
            self.bmt.bad_count = self.bmt.bad_count.saturating_add(1);
            self.dirty = true;
        }
    }

    /// Persist both tables to every mirror.
    ///
    /// Each mirror is written and verified, with a bounded number of retries; a mirror that
    /// keeps failing is retired and the others rewritten so all surviving copies agree. Fails
    /// only when no mirror is left.
    pub fn write_bbt_or_bmt_to_flash(&mut self) -> Result<()> {
        let mut bumped = self.dirty;
        if bumped {
            self.generation = self.generation.wrapping_add(1);
        }

        let mut image = self.encode()?;
        let mut slot = 0;
        while let Some(&block) = self.mirrors.get(slot) {
            let retries = self.config.write_retries;
            let written = retry(NoDelay.take(retries), || {
                media::write_mirror(&mut self.nand, block, &image)
            });

            match written {
                Ok(()) => slot += 1,
                Err(e) => {
                    warn!(block, "table mirror keeps failing: {e}");
                    self.mirrors.remove(slot);
                    self.retire_block(block);
                    if !bumped {
                        self.generation = self.generation.wrapping_add(1);
                        bumped = true;
                    }
                    image = self.encode()?;
                    slot = 0;
                }
            }
        }

        if self.mirrors.is_empty() {
            error!("every table mirror failed, tables not persisted");
            return Err(BmtError::PersistFailed);
        }

        self.dirty = false;
        debug!(generation = self.generation, mirrors = ?self.mirrors, "tables persisted");
        Ok(())
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        media::encode_tables(
            &self.bbt,
            &self.bmt,
            self.geometry.pool_start(),
            self.generation,
        )
    }

    /// Rebuild the lookup answering which data blocks upper layers must treat as bad
    pub fn create_badblock_table_by_bbt(&mut self) -> Result<()> {
        self.bad_lookup = Some(BadBlockLookup::new(self.geometry, &self.bbt, &self.bmt)?);
        Ok(())
    }

    /// Translate a data block to the physical block serving it
    pub fn get_mapping_block_index(&self, logical: u32) -> Result<BlockMapping> {
        let limit = self.geometry.data_blocks();
        if logical >= limit {
            return Err(BmtError::OutOfRange {
                block: logical,
                limit,
            });
        }

        Ok(BlockMapping {
            physical: self.get_mapping_block_index_by_bmt(logical),
            tag: logical as u16,
        })
    }

    /// The spare serving `index` if the mapping table has one, else `index` itself
    pub fn get_mapping_block_index_by_bmt(&self, index: u32) -> u32 {
        self.bmt.lookup(index).unwrap_or(index)
    }

    /// `index` unless it left the factory bad
    pub fn get_mapping_block_index_by_bbt(&self, index: u32) -> Option<u32> {
        (!self.bbt.contains(index)).then_some(index)
    }

    pub fn block_is_in_bmt_region(&self, physical: u32) -> bool {
        self.geometry.in_pool(physical)
    }

    /// Whether upper layers must treat data block `logical` as bad
    pub fn is_block_bad(&self, logical: u32) -> bool {
        match &self.bad_lookup {
            Some(lookup) => lookup.is_bad(logical),
            None => {
                logical >= self.geometry.data_blocks()
                    || (self.bbt.contains(logical) && self.bmt.lookup(logical).is_none())
            }
        }
    }

    /// Move the data block governing the failed physical byte `offset` onto a fresh spare.
    ///
    /// For [UpdateReason::WriteFail], the pages of the failed block preceding the failed page are
    /// copied to the spare, followed by `data`/`oob` at the failed page's position, and verified
    /// before the table is changed. The failed block is then retired and the tables persisted.
    ///
    /// Returns the new physical block. Fails with [BmtError::PoolExhausted], leaving the mapping
    /// unchanged, when no spare is left, and with [BmtError::BufferSize] before touching the
    /// device when `data` or `oob` do not match the page layout.
    pub fn update_bmt(
        &mut self,
        offset: u64,
        reason: UpdateReason,
        data: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> Result<u32> {
        let layout = self.nand.get_layout();
        if let Some(data) = data {
            check_buffer("data", data, layout.bytes_per_page)?;
        }
        if let Some(oob) = oob {
            check_buffer("oob", oob, layout.oob_bytes_per_page)?;
        }

        let total = self.geometry.total_blocks();
        let page = u32::try_from(offset / layout.bytes_per_page as u64).unwrap_or(u32::MAX);
        let failed = layout.block_of(page);
        if failed >= total {
            return Err(BmtError::OutOfRange {
                block: failed,
                limit: total,
            });
        }

        let logical = if self.geometry.in_pool(failed) {
            self.bmt
                .owner_of(failed)
                .ok_or(BmtError::UnknownBlock(failed))?
        } else {
            failed
        };
        self.bmt.check_room(logical)?;
        warn!(block = failed, logical, ?reason, "remapping block");

        let spare = match reason {
            UpdateReason::WriteFail => {
                let data = data.ok_or_else(|| anyhow!("write failure without data to relocate"))?;
                self.relocate(failed, logical, layout.page_in_block(page), data, oob)?
            }
            UpdateReason::EraseFail | UpdateReason::UnmappedBlock => self.allocate_block()?,
        };

        self.bmt.map(logical, spare)?;
        self.dirty = true;
        self.retire_block(failed);
        self.write_bbt_or_bmt_to_flash()?;
        self.create_badblock_table_by_bbt()?;

        info!(logical, spare, "block remapped");
        Ok(spare)
    }

    /// Rebuild the first `failed_page + 1` pages of `failed` on a new spare
    fn relocate(
        &mut self,
        failed: u32,
        logical: u32,
        failed_page: u32,
        data: &[u8],
        oob: Option<&[u8]>,
    ) -> Result<u32> {
        let layout = self.nand.get_layout();

        let mut pages = Vec::new();
        for index in 0..failed_page {
            let mut page = vec![0; layout.bytes_per_page];
            let mut page_oob = vec![0; layout.oob_bytes_per_page];
            self.nand
                .read_page(layout.first_page(failed) + index, &mut page, &mut page_oob)?;
            pages.push((page, page_oob));
        }
        let erased = vec![0xFF; layout.oob_bytes_per_page];
        pages.push((data.to_vec(), oob.unwrap_or(&erased).to_vec()));

        loop {
            let spare = self.allocate_block()?;
            match self.program_spare(spare, logical as u16, &pages) {
                Ok(()) => return Ok(spare),
                Err(e) => {
                    warn!(spare, "relocation failed: {e:#}");
                    self.retire_block(spare);
                }
            }
        }
    }

    fn program_spare(
        &mut self,
        spare: u32,
        tag: u16,
        pages: &[(Vec<u8>, Vec<u8>)],
    ) -> anyhow::Result<()> {
        let layout = self.nand.get_layout();
        let mut readback = vec![0; layout.bytes_per_page];
        let mut readback_oob = vec![0; layout.oob_bytes_per_page];

        for (page, (data, oob)) in (layout.first_page(spare)..).zip(pages) {
            if data.is_erased() && oob.is_erased() {
                continue;
            }

            self.nand.write_page(page, data, &tag_oob(oob, tag))?;
            self.nand.read_page(page, &mut readback, &mut readback_oob)?;
            ensure!(
                readback == *data && read_tag(&readback_oob) == Some(tag),
                "page {page} read back differently"
            );
        }

        Ok(())
    }

    /// Compare the OOB tags of the pool's data-carrying blocks against the mapping table
    pub fn audit_pool_tags(&mut self) -> Result<Vec<TagFinding>> {
        let mut findings = Vec::new();
        for block in self.geometry.pool() {
            if self.mirrors.contains(&block)
                || self.retired.contains(&block)
                || is_unusable(&mut self.nand, block)?
            {
                continue;
            }

            let tag = match self.first_tag(block) {
                Ok(Some(tag)) => u32::from(tag),
                Ok(None) => continue,
                Err(e) => {
                    warn!(block, "cannot read pool block: {e:#}");
                    findings.push(TagFinding::Unreadable { block });
                    continue;
                }
            };

            match self.bmt.owner_of(block) {
                Some(owner) if owner == tag => {}
                Some(owner) => findings.push(TagFinding::Mismatch {
                    block,
                    expected: owner,
                    found: tag,
                }),
                None => findings.push(TagFinding::Orphan { block, tag }),
            }
        }

        Ok(findings)
    }

    /// The tag of the first tagged page of `block`
    fn first_tag(&mut self, block: u32) -> anyhow::Result<Option<u16>> {
        let layout = self.nand.get_layout();
        let mut data = vec![0; layout.bytes_per_page];
        let mut oob = vec![0; layout.oob_bytes_per_page];

        for page in layout.first_page(block)..layout.first_page(block + 1) {
            self.nand.read_page(page, &mut data, &mut oob)?;
            if let Some(tag) = read_tag(&oob) {
                return Ok(Some(tag));
            }
        }

        Ok(None)
    }

    pub fn config(&self) -> &BmtConfig {
        &self.config
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    pub fn bbt(&self) -> &InitBbt {
        &self.bbt
    }

    pub fn bmt(&self) -> &Bmt {
        &self.bmt
    }

    /// The blocks currently holding the persisted tables
    pub fn mirrors(&self) -> &[u32] {
        &self.mirrors
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Detach, handing back the raw device
    pub fn into_inner(self) -> N {
        self.nand
    }
}

/// Scan the pool, from the top, for the newest valid copy of the tables.
///
/// Returns the blocks holding that copy along with it. Fails if copies exist but none can be
/// trusted.
fn load_tables<N: Nand>(
    nand: &mut N,
    geometry: PoolGeometry,
    config: &BmtConfig,
) -> Result<Option<(Vec<u32>, TableImage)>> {
    let mut newest: Option<TableImage> = None;
    let mut holders = Vec::new();
    let mut version = None;
    let mut corrupt = None;

    for block in geometry.pool().rev() {
        if is_unusable(nand, block)? {
            continue;
        }

        let image = match media::read_mirror(nand, block, config) {
            Ok(x) => x,
            Err(e) => {
                warn!(block, "cannot read pool block: {e:#}");
                continue;
            }
        };

        match image {
            Ok(image) => match &newest {
                Some(current) if *current == image => holders.push(block),
                Some(current) if current.generation >= image.generation => {
                    debug!(block, generation = image.generation, "stale table copy");
                }
                _ => {
                    holders = vec![block];
                    newest = Some(image);
                }
            },
            Err(ImageError::Blank) => {}
            Err(ImageError::Version(found)) => {
                warn!(block, found, "table copy has another format version");
                version = Some(found);
            }
            Err(ImageError::Corrupt(reason)) => {
                warn!(block, "damaged table copy: {reason}");
                corrupt = Some(format!("block {block}: {reason}"));
            }
        }
    }

    if let Some(image) = newest {
        return Ok(Some((holders, image)));
    }

    if let Some(reason) = corrupt {
        error!("no table copy can be trusted");
        return Err(BmtError::Integrity(reason));
    }

    if let Some(found) = version {
        match config.version_policy {
            VersionPolicy::Fail => {
                return Err(BmtError::VersionMismatch {
                    found,
                    expected: BMT_VERSION,
                })
            }
            VersionPolicy::Rebuild => warn!(found, "discarding tables of another version"),
        }
    }

    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::SimNand;

    pub const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 4,
        bytes_per_page: 2048,
        oob_bytes_per_page: 64,
    };

    /// The 1024-block device with blocks 5, 200 and 1023 bad from the factory
    fn scenario_nand() -> SimNand {
        let mut nand = SimNand::new(TEST_LAYOUT);
        for block in [5, 200, 1023] {
            nand.set_factory_bad(block).unwrap();
        }
        nand
    }

    fn block_offset(block: u32) -> u64 {
        u64::from(TEST_LAYOUT.first_page(block)) * TEST_LAYOUT.bytes_per_page as u64
    }

    fn mirror_contents(ftl: &mut FlashTranslation<SimNand>) -> Vec<Vec<u8>> {
        let size = TEST_LAYOUT.block_size();
        ftl.mirrors
            .clone()
            .into_iter()
            .map(|block| media::read_block_prefix(&mut ftl.nand, block, size).unwrap())
            .collect()
    }

    fn check_invariants(ftl: &mut FlashTranslation<SimNand>) {
        let mut targets = Vec::new();
        for block in ftl.bbt.blocks().collect::<Vec<_>>() {
            let physical = ftl.get_mapping_block_index(block).unwrap().physical;
            assert!(ftl.block_is_in_bmt_region(physical));
            assert!(!is_unusable(&mut ftl.nand, physical).unwrap());
        }
        for entry in ftl.bmt.entries() {
            assert!(!targets.contains(&entry.mapped_index));
            assert!(!ftl.mirrors.contains(&entry.mapped_index.into()));
            targets.push(entry.mapped_index);
        }
    }

    #[test]
    fn test_scenario_attach() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;

        assert_eq!(ftl.geometry().pool_start(), 942);
        assert_eq!(ftl.geometry().data_blocks(), 942);
        assert_eq!(ftl.bbt().badblock_count(), 2);
        assert_eq!(ftl.bmt().mapped_count(), 2);
        assert_eq!(ftl.mirrors(), [1022, 1021]);
        assert_eq!(ftl.generation(), 1);

        let a = ftl.get_mapping_block_index(5)?;
        let b = ftl.get_mapping_block_index(200)?;
        assert_ne!(a.physical, b.physical);
        assert!((942..1023).contains(&a.physical));
        assert!((942..1023).contains(&b.physical));
        assert_eq!(b.tag, 200);

        assert_eq!(ftl.get_mapping_block_index(6)?.physical, 6);
        assert_eq!(ftl.get_mapping_block_index_by_bbt(5), None);
        assert_eq!(ftl.get_mapping_block_index_by_bbt(6), Some(6));
        assert_eq!(ftl.get_mapping_block_index_by_bmt(5), a.physical);
        assert!(!ftl.is_block_bad(5));

        assert!(matches!(
            ftl.get_mapping_block_index(942),
            Err(BmtError::OutOfRange {
                block: 942,
                limit: 942
            })
        ));

        check_invariants(&mut ftl);
        Ok(())
    }

    #[test]
    fn test_write_fail_overwrites_entry() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        let old = ftl.get_mapping_block_index(200)?.physical;

        let data = vec![0x5Au8; TEST_LAYOUT.bytes_per_page];
        let offset = block_offset(old) + TEST_LAYOUT.bytes_per_page as u64;
        let new = ftl.update_bmt(offset, UpdateReason::WriteFail, Some(&data), None)?;

        assert_ne!(new, old);
        assert_eq!(ftl.get_mapping_block_index(200)?.physical, new);
        assert_eq!(ftl.bmt().mapped_count(), 2);
        assert_eq!(ftl.bmt().bad_count, 1);
        assert!(ftl.nand.is_bad(old, BadMarker::Runtime)?);

        // The data landed at the failed page's position, tagged with the logical block
        let mut page = vec![0; TEST_LAYOUT.bytes_per_page];
        let mut oob = vec![0; TEST_LAYOUT.oob_bytes_per_page];
        ftl.nand
            .read_page(TEST_LAYOUT.first_page(new) + 1, &mut page, &mut oob)?;
        assert_eq!(page, data);
        assert_eq!(read_tag(&oob), Some(200));

        check_invariants(&mut ftl);
        Ok(())
    }

    #[test]
    fn test_write_fail_copies_preceding_pages() -> Result<()> {
        let mut ftl = FlashTranslation::attach(SimNand::new(TEST_LAYOUT), BmtConfig::default())?;
        let first = vec![0x11u8; TEST_LAYOUT.bytes_per_page];
        let oob = vec![0xFFu8; TEST_LAYOUT.oob_bytes_per_page];
        ftl.nand.write_page(TEST_LAYOUT.first_page(7), &first, &oob)?;

        let third = vec![0x33u8; TEST_LAYOUT.bytes_per_page];
        let offset = block_offset(7) + 2 * TEST_LAYOUT.bytes_per_page as u64;
        let spare = ftl.update_bmt(offset, UpdateReason::WriteFail, Some(&third), None)?;

        let mut page = vec![0; TEST_LAYOUT.bytes_per_page];
        let mut page_oob = vec![0; TEST_LAYOUT.oob_bytes_per_page];
        ftl.nand
            .read_page(TEST_LAYOUT.first_page(spare), &mut page, &mut page_oob)?;
        assert_eq!(page, first);
        ftl.nand
            .read_page(TEST_LAYOUT.first_page(spare) + 1, &mut page, &mut page_oob)?;
        assert!(page.is_erased());
        ftl.nand
            .read_page(TEST_LAYOUT.first_page(spare) + 2, &mut page, &mut page_oob)?;
        assert_eq!(page, third);

        assert!(ftl.audit_pool_tags()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_relocation_skips_failing_spare() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        // 943 is the lowest pool block of a clean device
        nand.wear_out(943)?;
        let mut ftl = FlashTranslation::attach(nand, BmtConfig::default())?;
        assert_eq!(ftl.geometry().pool_start(), 943);

        let data = vec![0x42u8; TEST_LAYOUT.bytes_per_page];
        let spare = ftl.update_bmt(block_offset(10), UpdateReason::WriteFail, Some(&data), None)?;
        assert_eq!(spare, 944);
        assert!(ftl.nand.is_bad(943, BadMarker::Runtime)?);
        assert_eq!(ftl.bmt().bad_count, 1);
        Ok(())
    }

    #[test]
    fn test_flush_idempotent() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        ftl.write_bbt_or_bmt_to_flash()?;
        let before = mirror_contents(&mut ftl);
        let generation = ftl.generation();

        ftl.write_bbt_or_bmt_to_flash()?;
        assert_eq!(mirror_contents(&mut ftl), before);
        assert_eq!(ftl.generation(), generation);
        assert_eq!(before[0], before[1]);
        Ok(())
    }

    #[test]
    fn test_reattach_round_trip() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        ftl.update_bmt(block_offset(300), UpdateReason::EraseFail, None, None)?;
        ftl.update_bmt(block_offset(301), UpdateReason::UnmappedBlock, None, None)?;

        let bbt = ftl.bbt().clone();
        let bmt = ftl.bmt().clone();
        let generation = ftl.generation();
        let mirrors = ftl.mirrors().to_vec();

        // Simulated reboot, through a saved image
        let mut image = Vec::new();
        ftl.into_inner().save(&mut image)?;
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.load(&mut &image[..])?;

        let ftl = FlashTranslation::attach(nand, BmtConfig::default())?;
        assert_eq!(ftl.bbt(), &bbt);
        assert_eq!(ftl.bmt(), &bmt);
        assert_eq!(ftl.bmt().mapped_count(), 4);
        assert_eq!(ftl.generation(), generation);
        assert_eq!(ftl.mirrors(), mirrors);
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion() -> Result<()> {
        let layout = NandLayout {
            blocks: 64,
            ..TEST_LAYOUT
        };
        let mut ftl = FlashTranslation::attach(SimNand::new(layout), BmtConfig::default())?;
        let free = ftl.geometry().pool_size() as usize - ftl.mirrors().len();
        assert!(free > 0);

        let offset = |block: u32| u64::from(layout.first_page(block)) * layout.bytes_per_page as u64;
        let mut spares = Vec::new();
        for block in 0..free as u32 {
            spares.push(ftl.update_bmt(offset(block), UpdateReason::UnmappedBlock, None, None)?);
        }

        let bmt = ftl.bmt().clone();
        assert!(matches!(
            ftl.update_bmt(offset(free as u32), UpdateReason::UnmappedBlock, None, None),
            Err(BmtError::PoolExhausted)
        ));
        assert_eq!(ftl.bmt(), &bmt);

        for (block, spare) in (0..).zip(spares) {
            assert_eq!(ftl.get_mapping_block_index(block)?.physical, spare);
        }
        Ok(())
    }

    #[test]
    fn test_pool_block_failure() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        let spare = ftl.get_mapping_block_index(5)?.physical;

        // A failing spare is replaced under the same data block
        let new = ftl.update_bmt(block_offset(spare), UpdateReason::EraseFail, None, None)?;
        assert_eq!(ftl.get_mapping_block_index(5)?.physical, new);
        assert_eq!(ftl.bmt().owner_of(spare), None);

        // A pool block serving nothing cannot fail on behalf of anyone
        assert!(matches!(
            ftl.update_bmt(block_offset(1000), UpdateReason::EraseFail, None, None),
            Err(BmtError::UnknownBlock(1000))
        ));
        check_invariants(&mut ftl);
        Ok(())
    }

    #[test]
    fn test_mirror_fallback() -> Result<()> {
        let ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        let bmt = ftl.bmt().clone();
        let mirrors = ftl.mirrors().to_vec();
        let mut nand = ftl.into_inner();

        nand.corrupt(TEST_LAYOUT.first_page(mirrors[0]), media::HEADER_SIZE + 1)?;
        let mut ftl = FlashTranslation::attach(nand, BmtConfig::default())?;
        assert_eq!(ftl.bmt(), &bmt);

        // The damaged copy was rewritten
        assert_eq!(ftl.mirrors().len(), 2);
        let contents = mirror_contents(&mut ftl);
        assert_eq!(contents[0], contents[1]);

        let mut nand = ftl.into_inner();
        for block in mirrors {
            nand.corrupt(TEST_LAYOUT.first_page(block), media::HEADER_SIZE + 1)?;
        }
        assert!(matches!(
            FlashTranslation::attach(nand, BmtConfig::default()),
            Err(BmtError::Integrity(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mirror_retirement() -> Result<()> {
        let ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        let mut nand = ftl.into_inner();
        nand.wear_out(1022)?;

        let mut ftl = FlashTranslation::attach(nand, BmtConfig::default())?;
        ftl.write_bbt_or_bmt_to_flash()?;
        assert_eq!(ftl.mirrors(), [1021]);
        assert_eq!(ftl.bmt().bad_count, 1);
        assert!(ftl.nand.is_bad(1022, BadMarker::Runtime)?);

        // The next attach finds the surviving copy and reserves a new second mirror
        let ftl = FlashTranslation::attach(ftl.into_inner(), BmtConfig::default())?;
        assert_eq!(ftl.bmt().bad_count, 1);
        assert_eq!(ftl.mirrors(), [1021, 1020]);

        let mut nand = ftl.into_inner();
        nand.wear_out(1021)?;
        nand.wear_out(1020)?;
        let mut ftl = FlashTranslation::attach(nand, BmtConfig::default())?;
        assert!(matches!(
            ftl.write_bbt_or_bmt_to_flash(),
            Err(BmtError::PersistFailed)
        ));
        Ok(())
    }

    #[test]
    fn test_version_policy() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        for block in ftl.mirrors().to_vec() {
            let size = TEST_LAYOUT.block_size();
            let mut image = media::read_block_prefix(&mut ftl.nand, block, size)?;
            image[4] = 0;
            media::write_mirror(&mut ftl.nand, block, &image)?;
        }
        let nand = ftl.into_inner();

        let strict = BmtConfig {
            version_policy: VersionPolicy::Fail,
            ..Default::default()
        };
        assert!(matches!(
            FlashTranslation::attach(nand.clone(), strict),
            Err(BmtError::VersionMismatch {
                found: 0,
                expected: BMT_VERSION
            })
        ));

        let ftl = FlashTranslation::attach(nand, BmtConfig::default())?;
        assert_eq!(ftl.generation(), 1);
        assert_eq!(ftl.bmt().mapped_count(), 2);
        Ok(())
    }

    #[test]
    fn test_audit_finds_orphan() -> Result<()> {
        let mut ftl = FlashTranslation::attach(scenario_nand(), BmtConfig::default())?;
        assert!(ftl.audit_pool_tags()?.is_empty());

        // A remap that wrote its data but never reached the table flush
        let data = vec![0u8; TEST_LAYOUT.bytes_per_page];
        let oob = tag_oob(&vec![0xFF; TEST_LAYOUT.oob_bytes_per_page], 77);
        ftl.nand.write_page(TEST_LAYOUT.first_page(1000), &data, &oob)?;

        let spare = ftl.get_mapping_block_index(5)?.physical;
        let oob = tag_oob(&vec![0xFF; TEST_LAYOUT.oob_bytes_per_page], 6);
        ftl.nand.write_page(TEST_LAYOUT.first_page(spare), &data, &oob)?;

        let findings = ftl.audit_pool_tags()?;
        assert!(findings.contains(&TagFinding::Orphan {
            block: 1000,
            tag: 77
        }));
        assert!(findings.contains(&TagFinding::Mismatch {
            block: spare,
            expected: 5,
            found: 6
        }));
        assert_eq!(findings.len(), 2);
        Ok(())
    }

    #[test]
    fn test_repeated_failure_until_exhaustion() -> Result<()> {
        let layout = NandLayout {
            blocks: 64,
            ..TEST_LAYOUT
        };
        let mut ftl = FlashTranslation::attach(SimNand::new(layout), BmtConfig::default())?;
        let offset = |block: u32| u64::from(layout.first_page(block)) * layout.bytes_per_page as u64;
        let free = ftl.geometry().pool_size() - ftl.mirrors().len() as u32;

        // Block 0 keeps failing on whatever spare serves it
        let mut physical = 0;
        for retired in 0..free {
            physical = ftl.update_bmt(offset(physical), UpdateReason::EraseFail, None, None)?;
            assert_eq!(ftl.bmt().mapped_count(), 1);
            assert_eq!(u32::from(ftl.bmt().bad_count), retired);
        }

        let data = vec![0x3Cu8; layout.bytes_per_page];
        let oob = vec![0xFFu8; layout.oob_bytes_per_page];
        ftl.write_page(0, &data, &oob)?;

        let generation = ftl.generation();
        assert!(matches!(
            ftl.update_bmt(offset(physical), UpdateReason::EraseFail, None, None),
            Err(BmtError::PoolExhausted)
        ));
        assert_eq!(ftl.get_mapping_block_index(0)?.physical, physical);
        assert_eq!(ftl.generation(), generation);

        let mut page = vec![0; layout.bytes_per_page];
        let mut page_oob = vec![0; layout.oob_bytes_per_page];
        ftl.read_page(0, &mut page, &mut page_oob)?;
        assert_eq!(page, data);
        Ok(())
    }

    #[test]
    fn test_buffer_size_checked_first() -> Result<()> {
        let mut ftl = FlashTranslation::attach(SimNand::new(TEST_LAYOUT), BmtConfig::default())?;
        let generation = ftl.generation();

        assert!(matches!(
            ftl.update_bmt(0, UpdateReason::WriteFail, Some(&[0x42; 100]), None),
            Err(BmtError::BufferSize {
                what: "data",
                len: 100,
                expected: 2048
            })
        ));
        let data = vec![0x42u8; TEST_LAYOUT.bytes_per_page];
        assert!(matches!(
            ftl.update_bmt(0, UpdateReason::WriteFail, Some(&data), Some(&[0xFF; 3])),
            Err(BmtError::BufferSize { what: "oob", .. })
        ));

        let oob = vec![0xFFu8; TEST_LAYOUT.oob_bytes_per_page];
        assert!(ftl.write_page(0, &data[..100], &oob).is_err());

        // No spare was consumed or retired
        assert_eq!(ftl.bmt().mapped_count(), 0);
        assert_eq!(ftl.bmt().bad_count, 0);
        assert_eq!(ftl.generation(), generation);
        for block in ftl.geometry().pool() {
            assert!(!is_unusable(&mut ftl.nand, block)?);
        }
        Ok(())
    }

    /// Keeps its bad markers in the OOB only, so marking a dead block fails
    #[derive(Debug)]
    struct OobMarked(SimNand);

    impl Nand for OobMarked {
        fn get_layout(&self) -> NandLayout {
            self.0.get_layout()
        }

        fn read_page(
            &mut self,
            page: u32,
            data: &mut [u8],
            oob: &mut [u8],
        ) -> anyhow::Result<crate::nand::EccStatus> {
            self.0.read_page(page, data, oob)
        }

        fn write_page(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()> {
            self.0.write_page(page, data, oob)
        }

        fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
            self.0.erase_block(block)
        }
    }

    #[test]
    fn test_unmarkable_block_still_remapped() -> Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.wear_out(12)?;
        let mut ftl = FlashTranslation::attach(OobMarked(nand), BmtConfig::default())?;
        assert_eq!(ftl.geometry().pool_start(), 943);

        let spare = ftl.update_bmt(block_offset(12), UpdateReason::EraseFail, None, None)?;
        assert_eq!(spare, 943);
        assert!(!ftl.nand.is_bad(12, BadMarker::Runtime)?);

        // A dead spare without a marker is not handed out again
        ftl.nand.0.wear_out(943)?;
        let spare = ftl.update_bmt(block_offset(943), UpdateReason::EraseFail, None, None)?;
        assert_eq!(spare, 944);
        assert_eq!(ftl.bmt().bad_count, 1);
        let other = ftl.update_bmt(block_offset(13), UpdateReason::UnmappedBlock, None, None)?;
        assert_eq!(other, 945);

        let ftl = FlashTranslation::attach(ftl.into_inner(), BmtConfig::default())?;
        assert_eq!(ftl.get_mapping_block_index(12)?.physical, 944);
        assert_eq!(ftl.get_mapping_block_index(13)?.physical, 945);
        assert_eq!(ftl.bmt().bad_count, 1);
        Ok(())
    }

    #[derive(Debug)]
    struct Unreachable(NandLayout);

    impl Nand for Unreachable {
        fn get_layout(&self) -> NandLayout {
            self.0
        }

        fn read_page(
            &mut self,
            _page: u32,
            _data: &mut [u8],
            _oob: &mut [u8],
        ) -> anyhow::Result<crate::nand::EccStatus> {
            bail!("device not reachable")
        }

        fn write_page(&mut self, _page: u32, _data: &[u8], _oob: &[u8]) -> anyhow::Result<()> {
            bail!("device not reachable")
        }

        fn erase_block(&mut self, _block: u32) -> anyhow::Result<()> {
            bail!("device not reachable")
        }
    }

    #[test]
    fn test_unsupported_layouts() {
        let huge = NandLayout {
            blocks: u32::MAX,
            ..TEST_LAYOUT
        };
        assert!(matches!(
            FlashTranslation::attach(Unreachable(huge), BmtConfig::default()),
            Err(BmtError::Io(_))
        ));

        let narrow_oob = NandLayout {
            oob_bytes_per_page: 2,
            ..TEST_LAYOUT
        };
        assert!(matches!(
            FlashTranslation::attach(Unreachable(narrow_oob), BmtConfig::default()),
            Err(BmtError::Io(_))
        ));
    }

    #[test]
    fn test_parse_reason() {
        assert_eq!("write".parse::<UpdateReason>().unwrap(), UpdateReason::WriteFail);
        assert!("read".parse::<UpdateReason>().is_err());
    }
}
