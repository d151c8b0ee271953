//! Tunables of the bad block management core.
//!
//! The table capacities depend on the controller family the flash is attached to; everything
//! else has a sensible default for both.

use std::str::FromStr;

use anyhow::bail;

/// On-media format version of the bad block mapping table
pub const BMT_VERSION: u8 = 1;

/// On-media format version of the factory bad block table
pub const BBT_VERSION: u8 = 1;

/// Controller families, which differ in how large the persisted tables are
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum Profile {
    /// Parallel NAND controllers
    #[default]
    General,

    /// EN75XX SPI-NAND controllers, with smaller tables
    En75xx,
}

impl Profile {
    /// Capacity of the bad block mapping table
    pub fn max_bmt_size(self) -> usize {
        match self {
            Self::General => 500,
            Self::En75xx => 250,
        }
    }

    /// Capacity of the factory bad block table
    pub fn max_raw_bad_block_size(self) -> usize {
        match self {
            Self::General => 1000,
            Self::En75xx => 250,
        }
    }
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "general" => Ok(Self::General),
            "en75xx" => Ok(Self::En75xx),
            _ => bail!("unknown profile `{s}` (expected `general` or `en75xx`)"),
        }
    }
}

/// What to do when the only persisted tables found carry a different format version
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VersionPolicy {
    /// Treat the flash as unformatted and build fresh tables
    #[default]
    Rebuild,

    /// Refuse to attach
    Fail,
}

/// Configuration for [crate::bmt::FlashTranslation]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct BmtConfig {
    /// Capacity of the bad block mapping table
    pub max_bmt_size: usize,

    /// Capacity of the factory bad block table
    pub max_raw_bad_blocks: usize,

    /// Percentage of the device's blocks that must be good blocks inside the spare pool
    pub pool_percent: u32,

    /// How many copies of the tables are kept in the spare pool
    pub mirrors: usize,

    /// How many times a mirror write is retried before the slot is retired
    pub write_retries: usize,

    pub version_policy: VersionPolicy,
}

impl BmtConfig {
    /// The configuration used by a given controller family
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            max_bmt_size: profile.max_bmt_size(),
            max_raw_bad_blocks: profile.max_raw_bad_block_size(),
            pool_percent: 8,
            mirrors: 2,
            write_retries: 3,
            version_policy: VersionPolicy::default(),
        }
    }
}

impl Default for BmtConfig {
    fn default() -> Self {
        Self::for_profile(Profile::default())
    }
}

#[test]
fn test_profiles() -> anyhow::Result<()> {
    let general = BmtConfig::for_profile("general".parse()?);
    assert_eq!(general, BmtConfig::default());
    assert_eq!(general.max_bmt_size, 500);
    assert_eq!(general.max_raw_bad_blocks, 1000);

    let en75xx = BmtConfig::for_profile("EN75XX".parse()?);
    assert_eq!(en75xx.max_bmt_size, 250);
    assert_eq!(en75xx.max_raw_bad_blocks, 250);

    assert!("mt6573".parse::<Profile>().is_err());
    Ok(())
}
