//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_bytes_per_page: usize,
}

impl NandLayout {
    /// Number of main-area bytes in one block
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    /// Index of the first page of `block`
    pub fn first_page(&self, block: u32) -> u32 {
        block * self.pages_per_block
    }

    /// The block containing `page`
    pub fn block_of(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    /// Offset of `page` within its block
    pub fn page_in_block(&self, page: u32) -> u32 {
        page % self.pages_per_block
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTESxOOB"
///
/// Without an explicit OOB size, the usual 1/32 of the page size is assumed.
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let fields = s.split('x').collect::<Vec<_>>();
        let (blocks, pages_per_block, bytes_per_page, oob) = match fields[..] {
            [blocks, pages, bytes] => (blocks, pages, bytes, None),
            [blocks, pages, bytes, oob] => (blocks, pages, bytes, Some(oob)),
            _ => bail!("expected #x#x# or #x#x#x#"),
        };
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let oob_bytes_per_page = match oob {
            Some(oob) => oob.parse()?,
            None => bytes_per_page / 32,
        };

        ensure!(
            oob_bytes_per_page >= OOB_MIN_SIZE,
            "OOB area must hold at least {OOB_MIN_SIZE} bytes"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_bytes_per_page,
        })
    }
}

/// Smallest OOB area that can carry both bad-block markers and the block tag
pub const OOB_MIN_SIZE: usize = 4;

/// Offset in the OOB area of the 2-byte little-endian block tag on pages written into the spare
/// pool
pub const OOB_TAG_OFFSET: usize = 2;

/// The two kinds of bad-block marker kept in the OOB area of a block's first page
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BadMarker {
    /// The manufacturer's marker, present from the factory
    Factory,

    /// Set when a block is retired at runtime by the mapping table
    Runtime,
}

impl BadMarker {
    /// The OOB byte holding this marker
    pub fn oob_offset(self) -> usize {
        match self {
            Self::Factory => 0,
            Self::Runtime => 1,
        }
    }
}

/// The outcome of a page read that returned data
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum EccStatus {
    /// No bitflips
    Clean,

    /// The ECC engine corrected this many bitflips
    Corrected(u32),
}

/// Returned (inside `anyhow::Error`) when a page read fails ECC correction
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
#[error("uncorrectable ECC error in page {page}")]
pub struct EccError {
    pub page: u32,
}

/// Represents a NAND flash device, addressed by absolute page and block indexes
pub trait Nand {
    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Read one page and its OOB area
    ///
    /// `data` must be page-sized and `oob` must be OOB-sized. An uncorrectable read fails with an
    /// [EccError].
    fn read_page(&mut self, page: u32, data: &mut [u8], oob: &mut [u8])
        -> anyhow::Result<EccStatus>;

    /// Program one page and its OOB area
    ///
    /// Pages of a block must be programmed in increasing order; programming a page makes it and
    /// all skipped pages nonwritable until the block is erased.
    fn write_page(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase_block(&mut self, block: u32) -> anyhow::Result<()>;

    /// Check one of the bad-block markers of `block`
    ///
    /// A marker page that cannot be read counts as bad.
    fn is_bad(&mut self, block: u32, marker: BadMarker) -> anyhow::Result<bool> {
        let layout = self.get_layout();
        ensure!(block < layout.blocks, "block {block} out of range");

        let mut data = vec![0; layout.bytes_per_page];
        let mut oob = vec![0; layout.oob_bytes_per_page];
        Ok(
            match self.read_page(layout.first_page(block), &mut data, &mut oob) {
                Ok(_) => oob[marker.oob_offset()] != 0xFF,
                Err(_) => true,
            },
        )
    }

    /// Set one of the bad-block markers of `block`
    fn mark_bad(&mut self, block: u32, marker: BadMarker) -> anyhow::Result<()> {
        let layout = self.get_layout();

        // The block is being retired; an erase failure changes nothing.
        let _ = self.erase_block(block);

        let data = vec![0xFF; layout.bytes_per_page];
        let mut oob = vec![0xFF; layout.oob_bytes_per_page];
        oob[marker.oob_offset()] = 0x00;
        self.write_page(layout.first_page(block), &data, &oob)
    }
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// Raw bytes of all written pages, each page followed by its OOB (can only append to this)
    data: Vec<u8>,

    /// Bytes per page, main area only
    page_size: usize,

    /// Bytes of OOB per page
    oob_size: usize,

    /// How many pages in this block
    page_count: u32,

    /// Does the block carry the factory bad marker?
    factory_bad: bool,

    /// Does the block carry the runtime bad marker?
    runtime_bad: bool,

    /// Injected fault: every erase and program of this block fails
    worn_out: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    fn sim_block(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }

    /// Give `block` a factory bad marker, as if it shipped defective
    pub fn set_factory_bad(&mut self, block: u32) -> anyhow::Result<()> {
        self.sim_block(block)?.factory_bad = true;
        Ok(())
    }

    /// Make every later erase or program of `block` fail
    pub fn wear_out(&mut self, block: u32) -> anyhow::Result<()> {
        self.sim_block(block)?.worn_out = true;
        Ok(())
    }

    /// Flip the bits of one already-written byte of a page's main area
    pub fn corrupt(&mut self, page: u32, offset: usize) -> anyhow::Result<()> {
        let layout = self.layout;
        let block = self.sim_block(layout.block_of(page))?;
        let index = block.raw_page_size() * layout.page_in_block(page) as usize + offset;
        let byte = block
            .data
            .get_mut(index)
            .ok_or(anyhow::anyhow!("page {page} not written"))?;
        *byte ^= 0xFF;
        Ok(())
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// The stream holds every page followed by its OOB, as written by [SimNand::save]; bad
    /// markers are recovered from the OOB of each block's first page.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        for block in self.blocks.iter_mut() {
            let mut buf = vec![0; block.raw_page_size() * block.page_count as usize];
            read.read_exact(&mut buf)?;

            let first_oob = &buf[block.page_size..block.raw_page_size()];
            block.factory_bad = first_oob[BadMarker::Factory.oob_offset()] != 0xFF;
            block.runtime_bad = first_oob[BadMarker::Runtime.oob_offset()] != 0xFF;

            // Trailing erased pages are still writable
            while !buf.is_empty() && buf[buf.len() - block.raw_page_size()..].is_erased() {
                buf.truncate(buf.len() - block.raw_page_size());
            }
            block.data = buf;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        for block in self.blocks.iter() {
            let mut buf = block.data.clone();
            buf.resize(block.raw_page_size() * block.page_count as usize, 0xFF);

            let first_oob = &mut buf[block.page_size..block.raw_page_size()];
            if block.factory_bad {
                first_oob[BadMarker::Factory.oob_offset()] = 0x00;
            }
            if block.runtime_bad {
                first_oob[BadMarker::Runtime.oob_offset()] = 0x00;
            }

            write.write_all(&buf)?;
        }

        Ok(())
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_size: layout.bytes_per_page,
            oob_size: layout.oob_bytes_per_page,
            page_count: layout.pages_per_block,
            factory_bad: false,
            runtime_bad: false,
            worn_out: false,
        }
    }

    fn raw_page_size(&self) -> usize {
        self.page_size + self.oob_size
    }

    fn write_page(&mut self, index: u32, content: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(oob.len() == self.oob_size, "oob not OOB-sized");
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(!self.worn_out, "program failed");

        let begin = index as usize * self.raw_page_size();

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() || !oob.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
            self.data.extend_from_slice(oob);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8], oob: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(oob.len() == self.oob_size, "oob not OOB-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.raw_page_size();
        let end = begin + self.raw_page_size();

        if let Some(page) = self.data.get(begin..end) {
            let (page_data, page_oob) = page.split_at(self.page_size);
            content.copy_from_slice(page_data);
            oob.copy_from_slice(page_oob);
        } else {
            content.fill(0xFF);
            oob.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> anyhow::Result<EccStatus> {
        let layout = self.layout;
        self.sim_block(layout.block_of(page))?
            .read_page(layout.page_in_block(page), data, oob)?;
        Ok(EccStatus::Clean)
    }

    fn write_page(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        let layout = self.layout;
        self.sim_block(layout.block_of(page))?
            .write_page(layout.page_in_block(page), data, oob)
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        let block = self.sim_block(block)?;
        ensure!(!block.worn_out, "erase failed");
        block.data.clear();

        Ok(())
    }

    fn is_bad(&mut self, block: u32, marker: BadMarker) -> anyhow::Result<bool> {
        let block = self.sim_block(block)?;
        Ok(match marker {
            BadMarker::Factory => block.factory_bad,
            BadMarker::Runtime => block.runtime_bad,
        })
    }

    fn mark_bad(&mut self, block: u32, marker: BadMarker) -> anyhow::Result<()> {
        let block = self.sim_block(block)?;
        match marker {
            BadMarker::Factory => block.factory_bad = true,
            BadMarker::Runtime => block.runtime_bad = true,
        }
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_bytes_per_page: 8,
};

#[test]
fn test_parse_layout() {
    let layout: NandLayout = "1024x64x2048".parse().unwrap();
    assert_eq!(layout.oob_bytes_per_page, 64);
    assert_eq!(layout.block_size(), 128 * 1024);

    let layout: NandLayout = "8x16x256x8".parse().unwrap();
    assert_eq!(layout, TEST_LAYOUT);

    assert!("8x16".parse::<NandLayout>().is_err());
    assert!("8x16x64x2".parse::<NandLayout>().is_err());
}

#[test]
fn test_sim_block_range() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.erase_block(0).is_ok());
    assert!(nand.erase_block(TEST_LAYOUT.blocks - 1).is_ok());
    assert!(nand.erase_block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(!nand.is_bad(0, BadMarker::Factory).unwrap());
    nand.mark_bad(0, BadMarker::Runtime).unwrap();
    assert!(nand.is_bad(0, BadMarker::Runtime).unwrap());
    assert!(!nand.is_bad(0, BadMarker::Factory).unwrap());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let oob_in = [0xFF, 0xFF, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF];
    let mut data_out = data_in.clone();
    let mut oob_out = [0u8; 8];

    nand.write_page(2, &data_in, &oob_in).unwrap();
    assert!(nand.write_page(1, &data_in, &oob_in).is_err());

    nand.read_page(1, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());
    assert!(oob_out.is_erased());

    nand.read_page(2, &mut data_out, &mut oob_out).unwrap();
    assert_eq!(data_out, data_in);
    assert_eq!(oob_out, oob_in);

    nand.erase_block(0).unwrap();
    nand.read_page(2, &mut data_out, &mut oob_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_worn_out() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.wear_out(1).unwrap();

    let data = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let oob = vec![0xFFu8; TEST_LAYOUT.oob_bytes_per_page];
    assert!(nand.erase_block(1).is_err());
    assert!(nand.write_page(TEST_LAYOUT.first_page(1), &data, &oob).is_err());
    assert!(nand.write_page(TEST_LAYOUT.first_page(2), &data, &oob).is_ok());
}

#[test]
fn test_sim_save_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.set_factory_bad(3).unwrap();
    nand.mark_bad(5, BadMarker::Runtime).unwrap();

    let data = vec![0x55u8; TEST_LAYOUT.bytes_per_page];
    let oob = vec![0xFFu8; TEST_LAYOUT.oob_bytes_per_page];
    nand.write_page(TEST_LAYOUT.first_page(1) + 3, &data, &oob).unwrap();

    let mut image = Vec::new();
    nand.save(&mut image).unwrap();

    let mut loaded = SimNand::new(TEST_LAYOUT);
    loaded.load(&mut &image[..]).unwrap();

    assert!(loaded.is_bad(3, BadMarker::Factory).unwrap());
    assert!(loaded.is_bad(5, BadMarker::Runtime).unwrap());
    assert!(!loaded.is_bad(1, BadMarker::Factory).unwrap());

    let mut data_out = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut oob_out = vec![0u8; TEST_LAYOUT.oob_bytes_per_page];
    loaded
        .read_page(TEST_LAYOUT.first_page(1) + 3, &mut data_out, &mut oob_out)
        .unwrap();
    assert_eq!(data_out, data);

    // Trailing erased pages stay writable after loading
    assert!(loaded
        .write_page(TEST_LAYOUT.first_page(1) + 4, &data, &oob)
        .is_ok());
}
