//! The bad block mapping table: which bad blocks are served by which spare pool blocks.

use std::collections::BTreeMap;

use crate::config::BMT_VERSION;
use crate::error::{BmtError, Result};

/// One remapping: `bad_index` is served by `mapped_index` in the spare pool
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct BmtEntry {
    pub bad_index: u16,
    pub mapped_index: u16,
}

/// A bounded table of [BmtEntry]s, keyed by `bad_index`
///
/// Neither a `bad_index` nor a `mapped_index` can appear twice.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Bmt {
    entries: BTreeMap<u16, u16>,
    capacity: usize,
    version: u8,

    /// Spare pool blocks retired at runtime
    pub bad_count: u16,
}

impl Bmt {
    /// An empty table of the current version
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Default::default(),
            capacity,
            version: BMT_VERSION,
            bad_count: 0,
        }
    }

    /// Rebuild a table from persisted entries, rejecting duplicated indexes
    pub fn from_entries<I>(capacity: usize, bad_count: u16, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = BmtEntry>,
    {
        let mut table = Self::new(capacity);
        table.bad_count = bad_count;

        for entry in entries {
            if table.entries.contains_key(&entry.bad_index) {
                return Err(BmtError::Integrity(format!(
                    "block {} mapped twice",
                    entry.bad_index
                )));
            }
            table.insert(entry)?;
        }

        Ok(table)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Number of live entries
    pub fn mapped_count(&self) -> usize {
        self.entries.len()
    }

    /// The spare block serving `bad_index`, if it is mapped
    pub fn lookup(&self, bad_index: u32) -> Option<u32> {
        let bad_index = u16::try_from(bad_index).ok()?;
        self.entries.get(&bad_index).map(|&x| x.into())
    }

    /// The bad block served by spare block `mapped_index`, if any
    pub fn owner_of(&self, mapped_index: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|&(_, &mapped)| u32::from(mapped) == mapped_index)
            .map(|(&bad, _)| bad.into())
    }

    /// Is `block` the target of any entry?
    pub fn is_mapped_target(&self, block: u32) -> bool {
        self.owner_of(block).is_some()
    }

    /// Would mapping `bad_index` need a new entry, and is there room for it?
    pub fn check_room(&self, bad_index: u32) -> Result<()> {
        let key = to_index(bad_index)?;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            return Err(BmtError::TableFull(self.capacity));
        }
        Ok(())
    }

    /// Map `bad_index` to `mapped_index`, overwriting any previous mapping of `bad_index`
    ///
    /// Returns the previously mapped spare block.
    pub fn map(&mut self, bad_index: u32, mapped_index: u32) -> Result<Option<u32>> {
        self.insert(BmtEntry {
            bad_index: to_index(bad_index)?,
            mapped_index: to_index(mapped_index)?,
        })
    }

    fn insert(&mut self, entry: BmtEntry) -> Result<Option<u32>> {
        self.check_room(entry.bad_index.into())?;

        if let Some(owner) = self.owner_of(entry.mapped_index.into()) {
            if owner != u32::from(entry.bad_index) {
                return Err(BmtError::Integrity(format!(
                    "spare block {} already serves block {owner}",
                    entry.mapped_index
                )));
            }
        }

        Ok(self
            .entries
            .insert(entry.bad_index, entry.mapped_index)
            .map(|x| x.into()))
    }

    /// All entries, ordered by `bad_index`
    pub fn entries(&self) -> impl Iterator<Item = BmtEntry> + '_ {
        self.entries
            .iter()
            .map(|(&bad_index, &mapped_index)| BmtEntry {
                bad_index,
                mapped_index,
            })
    }
}

/// Block indexes are persisted as 16 bits
fn to_index(block: u32) -> Result<u16> {
    u16::try_from(block)
        .map_err(|_| BmtError::Integrity(format!("block {block} not representable in the table")))
}

#[test]
fn test_map_and_overwrite() -> Result<()> {
    let mut bmt = Bmt::new(4);
    assert_eq!(bmt.map(200, 1000)?, None);
    assert_eq!(bmt.map(5, 942)?, None);
    assert_eq!(bmt.mapped_count(), 2);

    // Remapping a block replaces its entry instead of adding one
    assert_eq!(bmt.map(200, 1001)?, Some(1000));
    assert_eq!(bmt.mapped_count(), 2);
    assert_eq!(bmt.lookup(200), Some(1001));
    assert_eq!(bmt.owner_of(1001), Some(200));
    assert!(!bmt.is_mapped_target(1000));
    assert_eq!(bmt.lookup(6), None);
    Ok(())
}

#[test]
fn test_capacity() -> Result<()> {
    let mut bmt = Bmt::new(2);
    bmt.map(1, 100)?;
    bmt.map(2, 101)?;
    assert!(matches!(bmt.map(3, 102), Err(BmtError::TableFull(2))));

    // Overwriting an existing key still works on a full table
    bmt.map(2, 102)?;
    assert_eq!(bmt.lookup(2), Some(102));
    Ok(())
}

#[test]
fn test_unique_targets() {
    let mut bmt = Bmt::new(8);
    bmt.map(1, 100).unwrap();
    assert!(matches!(bmt.map(2, 100), Err(BmtError::Integrity(_))));

    let dup = [
        BmtEntry {
            bad_index: 7,
            mapped_index: 100,
        },
        BmtEntry {
            bad_index: 7,
            mapped_index: 101,
        },
    ];
    assert!(Bmt::from_entries(8, 0, dup).is_err());
}
