//! This module implements logic to write raw blobs to NAND flash.

use crate::bmt::pool::is_unusable;
use crate::nand::{BadMarker, Nand, PageUtil};
use crate::util::ReadExt;

use std::io::Read;

use tracing::warn;

/// Scan a block to confirm that its contents match the provided slice.
///
/// The provided slice should be no longer than the block contents. If it is shorter, the remaining
/// bytes are "don't care."
///
/// The return value is the number of pages of the block that match (and therefore the index of the
/// page where write can start), or None if there is no partial match and the block must be erased.
fn check_raw_block<N: Nand>(nand: &mut N, block: u32, mut data: &[u8]) -> Option<u32> {
    let layout = nand.get_layout();
    let mut page_content = vec![0; layout.bytes_per_page];
    let mut oob = vec![0; layout.oob_bytes_per_page];

    let mut data_correct_upto: Option<u32> = None;
    for page in 0..layout.pages_per_block {
        if data_correct_upto.is_none() && data.is_empty() {
            // No data mismatch found and no further data to compare
            return Some(page);
        }

        if nand
            .read_page(layout.first_page(block) + page, &mut page_content, &mut oob)
            .is_err()
        {
            // Read errors are considered "needs erase"
            return None;
        }

        // Still comparing data?
        if data_correct_upto.is_none() {
            let cmp_len = std::cmp::min(page_content.len(), data.len());
            if page_content[..cmp_len] == data[..cmp_len] {
                data = &data[cmp_len..];
            } else {
                // A mismatch means we're now looking for erased pages; if all others are erased,
                // this becomes the return value.
                data_correct_upto = Some(page);
            }
        }

        // A non-erased page after a data mismatch means an erase is required
        if data_correct_upto.is_some() && !page_content.is_erased() {
            return None;
        }
    }

    match data_correct_upto {
        None if data.is_empty() => Some(layout.pages_per_block),
        x => x,
    }
}

/// Update the specified block's contents, resuming from a partial write if possible.
///
/// The provided slice should be no longer than the block contents. If it is shorter, the remaining
/// bytes are "don't care."
fn update_raw_block<N: Nand>(nand: &mut N, block: u32, data: &[u8]) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let start_page = match check_raw_block(nand, block, data) {
        None => {
            nand.erase_block(block)?;
            0
        }
        Some(x) => x,
    };

    let oob = vec![0xFF; layout.oob_bytes_per_page];
    let first_page = layout.first_page(block);
    let pages = data
        .chunks(layout.bytes_per_page)
        .skip(start_page as usize);
    for (page, chunk) in (start_page..).zip(pages) {
        // Pad a short final page
        let mut content = chunk.to_vec();
        content.resize(layout.bytes_per_page, 0xFF);
        nand.write_page(first_page + page, &content, &oob)?;
    }

    Ok(())
}

/// Write a raw blob to the NAND flash device.
///
/// This operation is idempotent; if the image is already written, no erase/writes will occur.
///
/// The `skip_bad` parameter will cause bad blocks to be skipped over. If this is `false`,
/// encountering a bad block is an error. A block that keeps failing is marked bad; on a translated
/// device that gives it a fresh spare, and it is used again.
pub fn write_raw_image<N: Nand, R: Read>(
    nand: &mut N,
    image: &mut R,
    skip_bad: bool,
) -> anyhow::Result<()> {
    let layout = nand.get_layout();

    let mut data = Vec::with_capacity(layout.block_size());
    let mut block: u32 = 0;
    loop {
        data.clear();
        image.read_to_vec(&mut data, layout.block_size())?;
        if data.is_empty() {
            // EOF encountered means the write is complete
            break Ok(());
        }

        'find_block_and_write: loop {
            anyhow::ensure!(block < layout.blocks, "image does not fit on the device");

            if !is_unusable(nand, block)? {
                // Give 5 attempts to update it
                for _ in 0..5 {
                    match update_raw_block(nand, block, &data) {
                        Ok(()) => break 'find_block_and_write,
                        Err(e) => {
                            warn!(block, "block update failed: {e:#}");
                            nand.erase_block(block)?;
                        }
                    }
                }

                // Block must have gone bad
                nand.mark_bad(block, BadMarker::Runtime)?;
                if !is_unusable(nand, block)? {
                    // Replaced underneath us
                    continue;
                }
            }

            // Block is bad; if we can't tolerate it, bail. Otherwise, loop to find a good one.
            anyhow::ensure!(skip_bad, "unhandled bad block {block} encountered");
            block += 1;
        }

        block += 1;
    }
}
