//! The translated device: [FlashTranslation] as a [Nand] over the data region, and a locked
//! controller for byte-addressed access from several threads.
//!
//! Every access goes through the mapping table. Pages written into the spare pool carry the tag
//! of the data block they belong to. Program and erase failures are remapped on the spot, so
//! upper layers only see them when the spare pool is exhausted.

use std::sync::Mutex;

use anyhow::{anyhow, ensure};
use tracing::{debug, warn};

use super::{check_buffer, tag_oob, BlockMapping, FlashTranslation, UpdateReason};
use crate::error::BmtError;
use crate::nand::{BadMarker, EccStatus, Nand, NandLayout};

impl<N: Nand> FlashTranslation<N> {
    /// Translate a data-region page into a physical page
    fn physical_page(&self, page: u32) -> Result<(u32, BlockMapping), BmtError> {
        let layout = self.nand.get_layout();
        let mapping = self.get_mapping_block_index(layout.block_of(page))?;
        let physical = layout.first_page(mapping.physical) + layout.page_in_block(page);
        Ok((physical, mapping))
    }

    fn block_offset(&self, physical: u32) -> u64 {
        let layout = self.nand.get_layout();
        u64::from(layout.first_page(physical)) * layout.bytes_per_page as u64
    }
}

impl<N: Nand> Nand for FlashTranslation<N> {
    fn get_layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.geometry.data_blocks(),
            ..self.nand.get_layout()
        }
    }

    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> anyhow::Result<EccStatus> {
        let (physical, _) = self.physical_page(page)?;
        let status = self.nand.read_page(physical, data, oob)?;
        if let EccStatus::Corrected(bitflips) = status {
            debug!(page, physical, bitflips, "corrected read");
        }
        Ok(status)
    }

    fn write_page(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        let layout = self.nand.get_layout();
        check_buffer("data", data, layout.bytes_per_page)?;
        check_buffer("oob", oob, layout.oob_bytes_per_page)?;

        let (physical, mapping) = self.physical_page(page)?;
        let oob = if self.block_is_in_bmt_region(mapping.physical) {
            tag_oob(oob, mapping.tag)
        } else {
            oob.to_vec()
        };

        if let Err(e) = self.nand.write_page(physical, data, &oob) {
            warn!(page, physical, "program failed: {e:#}");
            let offset = u64::from(physical) * layout.bytes_per_page as u64;
            self.update_bmt(offset, UpdateReason::WriteFail, Some(data), Some(&oob))?;
        }

        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        let mapping = self.get_mapping_block_index(block)?;
        if let Err(e) = self.nand.erase_block(mapping.physical) {
            warn!(block, physical = mapping.physical, "erase failed: {e:#}");
            // The spare comes out of allocation already erased
            let offset = self.block_offset(mapping.physical);
            self.update_bmt(offset, UpdateReason::EraseFail, None, None)?;
        }

        Ok(())
    }

    /// Both markers report the translated view: a block is bad only if nothing serves it.
    fn is_bad(&mut self, block: u32, _marker: BadMarker) -> anyhow::Result<bool> {
        let limit = self.geometry.data_blocks();
        if block >= limit {
            return Err(BmtError::OutOfRange { block, limit }.into());
        }
        Ok(self.is_block_bad(block))
    }

    /// Retire the physical block currently serving `block` and give it a fresh spare.
    fn mark_bad(&mut self, block: u32, _marker: BadMarker) -> anyhow::Result<()> {
        let mapping = self.get_mapping_block_index(block)?;
        let offset = self.block_offset(mapping.physical);
        self.update_bmt(offset, UpdateReason::UnmappedBlock, None, None)?;
        Ok(())
    }
}

/// A [FlashTranslation] behind one operation lock
///
/// Each call holds the lock for the whole operation, remapping and table persistence included.
pub struct NandController<N: Nand> {
    inner: Mutex<FlashTranslation<N>>,
}

impl<N: Nand> NandController<N> {
    pub fn new(ftl: FlashTranslation<N>) -> Self {
        Self {
            inner: Mutex::new(ftl),
        }
    }

    /// Run `op` with exclusive access to the translation layer
    pub fn with<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut FlashTranslation<N>) -> anyhow::Result<T>,
    {
        let mut ftl = self
            .inner
            .lock()
            .map_err(|_| anyhow!("NAND controller poisoned by a panicked operation"))?;
        op(&mut ftl)
    }

    /// Layout of the data region
    pub fn layout(&self) -> anyhow::Result<NandLayout> {
        self.with(|ftl| Ok(ftl.get_layout()))
    }

    /// Read `buf.len()` bytes from byte `offset` of the data region
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        self.with(|ftl| {
            let layout = ftl.get_layout();
            let page_size = layout.bytes_per_page as u64;
            let mut page_buf = vec![0; layout.bytes_per_page];
            let mut oob = vec![0; layout.oob_bytes_per_page];

            let mut pos = offset;
            let mut buf = &mut buf[..];
            while !buf.is_empty() {
                let page = u32::try_from(pos / page_size)?;
                let skip = (pos % page_size) as usize;
                let len = std::cmp::min(buf.len(), layout.bytes_per_page - skip);

                ftl.read_page(page, &mut page_buf, &mut oob)?;
                let (head, rest) = std::mem::take(&mut buf).split_at_mut(len);
                head.copy_from_slice(&page_buf[skip..skip + len]);

                buf = rest;
                pos += len as u64;
            }
            Ok(())
        })
    }

    /// Program whole pages starting at the page-aligned byte `offset`
    pub fn write(&self, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        self.with(|ftl| {
            let layout = ftl.get_layout();
            let page_size = layout.bytes_per_page;
            ensure!(
                offset % page_size as u64 == 0 && buf.len() % page_size == 0,
                "writes must cover whole pages"
            );

            let oob = vec![0xFF; layout.oob_bytes_per_page];
            let first = u32::try_from(offset / page_size as u64)?;
            for (page, chunk) in (first..).zip(buf.chunks(page_size)) {
                ftl.write_page(page, chunk, &oob)?;
            }
            Ok(())
        })
    }

    /// Erase the blocks covering `len` bytes from the block-aligned byte `offset`
    pub fn erase(&self, offset: u64, len: u64) -> anyhow::Result<()> {
        self.with(|ftl| {
            let block_size = ftl.get_layout().block_size() as u64;
            ensure!(
                offset % block_size == 0 && len % block_size == 0,
                "erases must cover whole blocks"
            );

            let first = u32::try_from(offset / block_size)?;
            let count = u32::try_from(len / block_size)?;
            for block in first..first + count {
                ftl.erase_block(block)?;
            }
            Ok(())
        })
    }

    /// Is the block containing byte `offset` bad?
    pub fn block_isbad(&self, offset: u64) -> anyhow::Result<bool> {
        self.with(|ftl| {
            let block_size = ftl.get_layout().block_size() as u64;
            ftl.is_bad(u32::try_from(offset / block_size)?, BadMarker::Runtime)
        })
    }

    /// Give the block containing byte `offset` a fresh spare
    pub fn block_markbad(&self, offset: u64) -> anyhow::Result<()> {
        self.with(|ftl| {
            let block_size = ftl.get_layout().block_size() as u64;
            ftl.mark_bad(u32::try_from(offset / block_size)?, BadMarker::Runtime)
        })
    }

    pub fn into_inner(self) -> anyhow::Result<FlashTranslation<N>> {
        self.inner
            .into_inner()
            .map_err(|_| anyhow!("NAND controller poisoned by a panicked operation"))
    }
}
