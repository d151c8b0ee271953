//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{BadMarker, EccError, EccStatus, Nand, NandLayout, OOB_MIN_SIZE};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some((mtd_dev, _)) = line.split_once(':') {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the /dev/mtdX offset of a page
    fn page_offset(&self, page: u32) -> anyhow::Result<u64> {
        ensure!(
            self.layout.block_of(page) < self.layout.blocks,
            "page {page} out of range"
        );
        Ok(u64::from(page) * self.layout.bytes_per_page as u64)
    }

    fn block_offset(&self, block: u32) -> anyhow::Result<u64> {
        ensure!(block < self.layout.blocks, "block {block} out of range");
        Ok(u64::from(block) * self.layout.block_size() as u64)
    }
}

impl Nand for MtdNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        oob: &mut [u8],
    ) -> anyhow::Result<EccStatus> {
        ensure!(data.len() == self.layout.bytes_per_page, "data not page-sized");
        ensure!(oob.len() == self.layout.oob_bytes_per_page, "oob not OOB-sized");
        let offset = self.page_offset(page)?;

        // The driver reports uncorrectable pages as EBADMSG
        match self.file.read_exact_at(data, offset) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(nix::libc::EBADMSG) => {
                return Err(EccError { page }.into())
            }
            Err(e) => return Err(e.into()),
        }

        let mut req = ioctl::mtd_oob_buf64 {
            start: offset,
            pad: 0,
            length: oob.len() as u32,
            usr_ptr: oob.as_mut_ptr() as u64,
        };
        unsafe {
            ioctl::memreadoob64(self.file.as_raw_fd(), &mut req)?;
        }

        Ok(EccStatus::Clean)
    }

    fn write_page(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        ensure!(data.len() == self.layout.bytes_per_page, "data not page-sized");
        ensure!(oob.len() == self.layout.oob_bytes_per_page, "oob not OOB-sized");

        let mut req = ioctl::mtd_write_req {
            start: self.page_offset(page)?,
            len: data.len() as u64,
            ooblen: oob.len() as u64,
            usr_data: data.as_ptr() as u64,
            usr_oob: oob.as_ptr() as u64,
            mode: ioctl::MTD_OPS_PLACE_OOB,
            padding: [0; 7],
        };
        unsafe {
            ioctl::memwrite(self.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.block_offset(block)?.try_into()?,
            length: self.layout.block_size().try_into()?,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    /// The factory marker is the kernel's own bad block table; the runtime marker lives in the OOB
    fn is_bad(&mut self, block: u32, marker: BadMarker) -> anyhow::Result<bool> {
        match marker {
            BadMarker::Factory => {
                let block_base = self.block_offset(block)?;
                let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
                Ok(bad != 0)
            }
            BadMarker::Runtime => {
                let layout = self.layout;
                let mut data = vec![0; layout.bytes_per_page];
                let mut oob = vec![0; layout.oob_bytes_per_page];
                Ok(
                    match self.read_page(layout.first_page(block), &mut data, &mut oob) {
                        Ok(_) => oob[marker.oob_offset()] != 0xFF,
                        Err(_) => true,
                    },
                )
            }
        }
    }

    fn mark_bad(&mut self, block: u32, marker: BadMarker) -> anyhow::Result<()> {
        match marker {
            BadMarker::Factory => {
                let block_base = self.block_offset(block)?;
                unsafe {
                    ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
                }
                Ok(())
            }
            BadMarker::Runtime => {
                let layout = self.layout;
                let _ = self.erase_block(block);

                let data = vec![0xFF; layout.bytes_per_page];
                let mut oob = vec![0xFF; layout.oob_bytes_per_page];
                oob[marker.oob_offset()] = 0x00;
                self.write_page(layout.first_page(block), &data, &oob)
            }
        }
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{NandLayout, OOB_MIN_SIZE};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// OOB bytes are placed exactly where given, data is ECC-protected
    pub const MTD_OPS_PLACE_OOB: u8 = 0;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );
            ensure!(
                self.oobsize as usize >= OOB_MIN_SIZE,
                "MTD device has no usable OOB area"
            );

            Ok(NandLayout {
                blocks: self.size / self.erasesize,
                pages_per_block: self.erasesize / self.writesize,
                bytes_per_page: self.writesize as usize,
                oob_bytes_per_page: self.oobsize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_oob_buf64 {
        pub start: u64,
        pub pad: u32,
        pub length: u32,
        pub usr_ptr: u64,
    }
    ioctl_readwrite!(memreadoob64, MTD_IOC_MAGIC, 22, mtd_oob_buf64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);
}
