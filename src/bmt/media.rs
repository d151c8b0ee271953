//! This module contains the on-flash format of the persisted tables, and the code to read and
//! write it to mirror blocks.
//!
//! A mirror block holds a BBT image at byte 0, immediately followed by a BMT image, then zero
//! padding up to the end of the block. Each image is a fixed-size little-endian header followed
//! by a payload sized for the table's full capacity:
//!
//! ```text
//! +-----------+---------+----------+-------+----------+-----------+------------+------------+-----+
//! | signature | version | reserved | count | capacity | bad_count | pool_start | generation | crc |
//! |    4      |    1    |    1     |   2   |    2     |     2     |     4      |     4      |  4  |
//! +-----------+---------+----------+-------+----------+-----------+------------+------------+-----+
//! | payload: capacity * u16 (BBT) or capacity * (u16 bad, u16 mapped) (BMT), unused slots zero  |
//! +----------------------------------------------------------------------------------------------+
//! ```
//!
//! The CRC covers the header up to the CRC field, then the payload.

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use super::bbt::InitBbt;
use super::table::{Bmt, BmtEntry};
use crate::config::{BmtConfig, BBT_VERSION, BMT_VERSION};
use crate::nand::{Nand, PageUtil};

pub const TABLE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const BBT_SIGNATURE: [u8; 4] = *b"RBBT";
const BMT_SIGNATURE: [u8; 4] = *b"RBMT";

pub const HEADER_SIZE: usize = 24;
const CRC_SIZE: usize = std::mem::size_of::<u32>();

/// The raw header in front of each table image
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ImageHeader {
    signature: [u8; 4],
    version: u8,
    reserved: u8,
    count: u16,
    capacity: u16,
    bad_count: u16,
    pool_start: u32,
    generation: u32,
    crc: u32,
}

impl ImageHeader {
    /// Serialize the header, filling in the CRC over the header and `payload`
    fn seal(mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.crc = 0;
        let bytes = self.to_bytes()?;

        let mut digest = TABLE_CRC.digest();
        digest.update(&bytes[..HEADER_SIZE - CRC_SIZE]);
        digest.update(payload);
        self.crc = digest.finalize();

        let mut bytes = self.to_bytes()?;
        bytes.extend_from_slice(payload);
        Ok(bytes)
    }

    /// Parse a header and check it against its payload
    fn open(bytes: &[u8], signature: [u8; 4], version: u8) -> Result<Self, ImageError> {
        let header = bytes
            .get(..HEADER_SIZE)
            .and_then(|x| Self::from_bytes((x, 0)).ok())
            .map(|(_, header)| header)
            .ok_or(ImageError::Blank)?;

        if header.signature != signature {
            return Err(ImageError::Blank);
        }
        if header.version != version {
            return Err(ImageError::Version(header.version));
        }

        let mut digest = TABLE_CRC.digest();
        digest.update(&bytes[..HEADER_SIZE - CRC_SIZE]);
        let payload_len = header.payload_len(signature);
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + payload_len)
            .ok_or(ImageError::Corrupt("image truncated".into()))?;
        digest.update(payload);

        if digest.finalize() != header.crc {
            return Err(ImageError::Corrupt("CRC mismatch".into()));
        }
        if header.count > header.capacity {
            return Err(ImageError::Corrupt("count exceeds capacity".into()));
        }

        Ok(header)
    }

    fn payload_len(&self, signature: [u8; 4]) -> usize {
        entry_size(signature) * self.capacity as usize
    }
}

fn entry_size(signature: [u8; 4]) -> usize {
    if signature == BMT_SIGNATURE {
        4
    } else {
        2
    }
}

/// Why a block does not hold usable tables
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ImageError {
    /// No table was ever written here
    Blank,

    /// A table of another format version
    Version(u8),

    /// A table that fails verification
    Corrupt(String),
}

/// Both tables, as loaded from one mirror block
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct TableImage {
    pub bbt: InitBbt,
    pub bmt: Bmt,
    pub pool_start: u32,
    pub generation: u32,
}

/// Number of bytes of a mirror block occupied by the tables of the given configuration
pub fn image_size(config: &BmtConfig) -> usize {
    2 * HEADER_SIZE + 2 * config.max_raw_bad_blocks + 4 * config.max_bmt_size
}

/// Serialize both tables into one mirror image
pub fn encode_tables(
    bbt: &InitBbt,
    bmt: &Bmt,
    pool_start: u32,
    generation: u32,
) -> anyhow::Result<Vec<u8>> {
    let mut payload = BytesMut::with_capacity(2 * bbt.capacity());
    for block in bbt.blocks() {
        payload.put_u16_le(block as u16);
    }
    payload.put_bytes(0, 2 * (bbt.capacity() - bbt.badblock_count()));

    let mut image = ImageHeader {
        signature: BBT_SIGNATURE,
        version: bbt.version(),
        reserved: 0,
        count: bbt.badblock_count().try_into()?,
        capacity: bbt.capacity().try_into()?,
        bad_count: 0,
        pool_start,
        generation,
        crc: 0,
    }
    .seal(&payload)?;

    let mut payload = BytesMut::with_capacity(4 * bmt.capacity());
    for entry in bmt.entries() {
        payload.put_u16_le(entry.bad_index);
        payload.put_u16_le(entry.mapped_index);
    }
    payload.put_bytes(0, 4 * (bmt.capacity() - bmt.mapped_count()));

    image.extend(
        ImageHeader {
            signature: BMT_SIGNATURE,
            version: bmt.version(),
            reserved: 0,
            count: bmt.mapped_count().try_into()?,
            capacity: bmt.capacity().try_into()?,
            bad_count: bmt.bad_count,
            pool_start,
            generation,
            crc: 0,
        }
        .seal(&payload)?,
    );

    Ok(image)
}

/// Parse and verify a mirror image
pub fn decode_tables(bytes: &[u8], config: &BmtConfig) -> Result<TableImage, ImageError> {
    let bbt_header = ImageHeader::open(bytes, BBT_SIGNATURE, BBT_VERSION)?;
    if bbt_header.capacity as usize != config.max_raw_bad_blocks {
        return Err(ImageError::Corrupt("bad block table capacity mismatch".into()));
    }

    let mut payload = &bytes[HEADER_SIZE..];
    let blocks = (0..bbt_header.count).map(|_| payload.get_u16_le()).collect();
    let bbt = InitBbt::from_blocks(config.max_raw_bad_blocks, blocks)
        .map_err(|e| ImageError::Corrupt(e.to_string()))?;

    let bytes = &bytes[HEADER_SIZE + bbt_header.payload_len(BBT_SIGNATURE)..];
    let bmt_header = ImageHeader::open(bytes, BMT_SIGNATURE, BMT_VERSION)?;
    if bmt_header.capacity as usize != config.max_bmt_size {
        return Err(ImageError::Corrupt("mapping table capacity mismatch".into()));
    }
    if (bmt_header.pool_start, bmt_header.generation)
        != (bbt_header.pool_start, bbt_header.generation)
    {
        return Err(ImageError::Corrupt("tables from different flushes".into()));
    }

    let mut payload = &bytes[HEADER_SIZE..];
    let entries = (0..bmt_header.count)
        .map(|_| BmtEntry {
            bad_index: payload.get_u16_le(),
            mapped_index: payload.get_u16_le(),
        })
        .collect::<Vec<_>>();

    for entry in &entries {
        if u32::from(entry.mapped_index) < bmt_header.pool_start {
            return Err(ImageError::Corrupt(format!(
                "block {} mapped outside the pool",
                entry.bad_index
            )));
        }
    }

    let bmt = Bmt::from_entries(config.max_bmt_size, bmt_header.bad_count, entries)
        .map_err(|e| ImageError::Corrupt(e.to_string()))?;

    Ok(TableImage {
        bbt,
        bmt,
        pool_start: bbt_header.pool_start,
        generation: bbt_header.generation,
    })
}

/// Read the first `len` bytes of a block
pub fn read_block_prefix<N: Nand>(nand: &mut N, block: u32, len: usize) -> anyhow::Result<Vec<u8>> {
    let layout = nand.get_layout();
    let pages = len.div_ceil(layout.bytes_per_page);
    anyhow::ensure!(
        pages <= layout.pages_per_block as usize,
        "{len} bytes do not fit in one block"
    );

    let mut bytes = vec![0; pages * layout.bytes_per_page];
    let mut oob = vec![0; layout.oob_bytes_per_page];
    for (page, chunk) in (layout.first_page(block)..).zip(bytes.chunks_mut(layout.bytes_per_page))
    {
        nand.read_page(page, chunk, &mut oob)?;
    }

    bytes.truncate(len);
    Ok(bytes)
}

/// Write a table image into a mirror block: erase, program the image padded with zeroes to the
/// whole block, then read every page back and compare.
pub fn write_mirror<N: Nand>(nand: &mut N, block: u32, image: &[u8]) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    anyhow::ensure!(
        image.len() <= layout.block_size(),
        "table image larger than a block"
    );

    let mut padded = image.to_vec();
    padded.resize(layout.block_size(), 0u8);
    let oob = vec![0xFF; layout.oob_bytes_per_page];

    nand.erase_block(block)?;
    for (page, chunk) in (layout.first_page(block)..).zip(padded.chunks(layout.bytes_per_page)) {
        nand.write_page(page, chunk, &oob)?;
    }

    let readback = read_block_prefix(nand, block, padded.len())?;
    anyhow::ensure!(readback == padded, "mirror block {block} read back differently");

    Ok(())
}

/// Read the tables from a candidate mirror block
pub fn read_mirror<N: Nand>(
    nand: &mut N,
    block: u32,
    config: &BmtConfig,
) -> anyhow::Result<Result<TableImage, ImageError>> {
    let bytes = read_block_prefix(nand, block, image_size(config))?;
    if bytes[..HEADER_SIZE].is_erased() {
        return Ok(Err(ImageError::Blank));
    }
    Ok(decode_tables(&bytes, config))
}
