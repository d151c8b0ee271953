//! A tool to inspect and exercise the bad block management on a NAND device.
//!
//! Meant to be used interactively, either on a simulated NAND image or on a real Linux MTD device,
//! to check what the translation layer sees and does.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::prelude::*;

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use nand_bmt::nand::mtd::MtdNand;
use nand_bmt::{
    bmt::{bbt::start_init_bbt, pool, FlashTranslation, UpdateReason},
    config::{BmtConfig, Profile, VersionPolicy},
    format::raw::write_raw_image,
    nand::{Nand, NandLayout, SimNand},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES[xOOB]
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> anyhow::Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Args, Debug)]
struct TableOptions {
    /// Controller family, selecting the table capacities (general or en75xx)
    #[clap(long, default_value = "general")]
    profile: Profile,

    /// Refuse to attach when the persisted tables have another format version
    #[clap(long)]
    strict_version: bool,
}

impl TableOptions {
    fn config(&self) -> BmtConfig {
        let mut config = BmtConfig::for_profile(self.profile);
        if self.strict_version {
            config.version_policy = VersionPolicy::Fail;
        }
        config
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn execute(self, cmd: Command, config: BmtConfig) -> Result<Self> {
        Ok(match self {
            Self::Sim(nand) => Self::Sim(cmd.execute(nand, config)?),

            #[cfg(target_os = "linux")]
            Self::Mtd(nand) => Self::Mtd(cmd.execute(nand, config)?),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Size the spare pool and list the factory-bad blocks; this is a read-only operation
    Scan,

    /// Attach and print the tables, building and persisting them if the device has none
    Show,

    /// Print the physical block serving a data block
    Map {
        /// The data block to look up
        block: u32,
    },

    /// Report a failure on a data block, remapping it onto a fresh spare
    Fail {
        /// The data block that failed
        block: u32,

        /// What failed: erase, write or unmapped
        #[clap(long, default_value = "unmapped")]
        reason: UpdateReason,

        /// The page of the block that failed to program
        #[clap(long, default_value_t = 0)]
        page: u32,
    },

    /// Cross-check the OOB tags of the spare pool against the mapping table
    Audit,

    /// Write a raw image through the translation layer
    RawWrite {
        /// The path to the image to write to NAND
        path: PathBuf,

        /// Whether to skip over (thereby tolerating) any bad blocks encountered
        #[clap(long)]
        skip_bad: bool,
    },
}

impl Command {
    fn execute<N: Nand>(self, mut nand: N, config: BmtConfig) -> Result<N> {
        if let Command::Scan = self {
            let pool_size = pool::calc_bmt_pool_size(&mut nand, &config)?;
            let geometry = pool::PoolGeometry::new(nand.get_layout().blocks, pool_size)?;
            let bbt = start_init_bbt(&mut nand, geometry, &config)?;

            println!("pool: {pool_size} blocks from {}", geometry.pool_start());
            println!("factory-bad: {:?}", bbt.blocks().collect::<Vec<_>>());
            return Ok(nand);
        }

        let mut ftl = FlashTranslation::attach(nand, config)?;
        match self {
            Command::Scan => unreachable!(),

            Command::Show => {
                let geometry = ftl.geometry();
                println!(
                    "data blocks: {}, pool: {}..{}",
                    geometry.data_blocks(),
                    geometry.pool_start(),
                    geometry.total_blocks()
                );
                println!(
                    "mirrors: {:?}, generation {}",
                    ftl.mirrors(),
                    ftl.generation()
                );
                println!("factory-bad: {:?}", ftl.bbt().blocks().collect::<Vec<_>>());
                println!("retired spares: {}", ftl.bmt().bad_count);
                for entry in ftl.bmt().entries() {
                    println!("{:5} => {:5}", entry.bad_index, entry.mapped_index);
                }
            }

            Command::Map { block } => {
                let mapping = ftl.get_mapping_block_index(block)?;
                println!("{block} => {}", mapping.physical);
            }

            Command::Fail {
                block,
                reason,
                page,
            } => {
                let physical = ftl.get_mapping_block_index(block)?.physical;
                let layout = ftl.nand().get_layout();
                anyhow::ensure!(page < layout.pages_per_block, "page {page} out of range");

                // Relocate whatever the failed page currently holds
                let mut data = vec![0xFF; layout.bytes_per_page];
                let mut oob = vec![0xFF; layout.oob_bytes_per_page];
                let page_index = layout.first_page(block) + page;
                if ftl.read_page(page_index, &mut data, &mut oob).is_err() {
                    data.fill(0xFF);
                    oob.fill(0xFF);
                }

                let offset = u64::from(layout.first_page(physical) + page)
                    * layout.bytes_per_page as u64;
                let spare = ftl.update_bmt(offset, reason, Some(&data), Some(&oob))?;
                println!("{block} => {spare} (was {physical})");
            }

            Command::Audit => {
                let findings = ftl.audit_pool_tags()?;
                for finding in &findings {
                    println!("{finding:?}");
                }
                println!("{} findings", findings.len());
            }

            Command::RawWrite { path, skip_bad } => {
                let mut image = File::open(path)?;
                write_raw_image(&mut ftl, &mut image, skip_bad)?;
            }
        };

        Ok(ftl.into_inner())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    tables: TableOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn init_logging() {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let nand = nand.execute(args.cmd, args.tables.config())?;
    args.nand.cleanup(nand)?;
    Ok(())
}
