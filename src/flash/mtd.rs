//! Flash abstraction layer implementation over the Linux MTD subsystem, for SPI-NOR partitions

use super::{Flash, FlashGeometry};

use anyhow::{bail, ensure, Context};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NOR flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdFlash {
    file: File,
    geometry: FlashGeometry,
}

impl MtdFlash {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        log::debug!("opened {} as {geometry:?}", path.display());
        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its partition name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Partition names are quoted in /proc/mtd
        let quoted = format!("\"{name}\"");

        let proc_mtd = BufReader::new(File::open("/proc/mtd")?);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&quoted) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD partition {quoted} could not be found");
    }

    fn check_range(&self, addr: u32, len: usize) -> anyhow::Result<u64> {
        let len = u32::try_from(len)?;
        ensure!(
            self.geometry.contains(addr, len),
            "range {addr:#x}+{len:#x} out of bounds"
        );
        Ok(u64::from(addr))
    }
}

impl Flash for MtdFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&self, addr: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.check_range(addr, content.len())?;
        Ok(self.file.read_exact_at(content, offset)?)
    }

    fn erase(&mut self, addr: u32, len: u32) -> anyhow::Result<()> {
        let sector_size = self.geometry.sector_size;
        ensure!(
            addr % sector_size == 0 && len % sector_size == 0,
            "erase {addr:#x}+{len:#x} not sector-aligned"
        );
        self.check_range(addr, len as usize)?;

        let erase_info = ioctl::erase_info_user {
            start: addr,
            length: len,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn write(&mut self, addr: u32, content: &[u8]) -> anyhow::Result<()> {
        let page_size = self.geometry.page_size;
        let offset = self.check_range(addr, content.len())?;
        ensure!(
            (addr % page_size) as usize + content.len() <= page_size as usize,
            "write at {addr:#x} crosses a page boundary"
        );
        Ok(self.file.write_all_at(content, offset)?)
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::FlashGeometry;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// SPI-NOR parts are byte-programmable, so MTD reports a writesize of 1; program in the
    /// conventional 256-byte page units instead.
    const NOR_PAGE_SIZE: u32 = 256;

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

    impl TryInto<FlashGeometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<FlashGeometry> {
            if self.writesize == 1 {
                self.writesize = NOR_PAGE_SIZE;
            }

            ensure!(self.erasesize != 0, "MTD reports zero erasesize");
            ensure!(self.writesize != 0, "MTD reports zero writesize");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(FlashGeometry {
                sectors: self.size / self.erasesize,
                sector_size: self.erasesize,
                page_size: self.writesize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[cfg(test)]
    fn info(size: u32, erasesize: u32, writesize: u32) -> mtd_info_user {
        mtd_info_user {
            r#type: 3,
            flags: 0,
            size,
            erasesize,
            writesize,
            oobsize: 0,
            padding: 0,
        }
    }

    #[test]
    fn test_geometry_from_info() -> anyhow::Result<()> {
        let geometry: FlashGeometry = info(0x0200_0000, 0x10000, 1).try_into()?;
        assert_eq!(geometry.sectors, 0x200);
        assert_eq!(geometry.page_size, NOR_PAGE_SIZE);

        let bad: anyhow::Result<FlashGeometry> = info(0x0200_0000, 0x10000, 0).try_into();
        assert!(bad.is_err());
        let bad: anyhow::Result<FlashGeometry> = info(0x0200_0000, 0, 256).try_into();
        assert!(bad.is_err());

        Ok(())
    }
}
