//! Abstractions and code to access NOR (QSPI) flash

use std::io::{Read, Write};
use std::ops::Range;
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// The value every byte of flash reads back as after an erase
pub const ERASED_BYTE: u8 = 0xFF;

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == ERASED_BYTE)
    }
}

/// A pub-fields struct describing the data layout of a NOR flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashGeometry {
    pub sectors: u32,
    pub sector_size: u32,
    pub page_size: u32,
}

impl FlashGeometry {
    /// Total size of the device in bytes
    pub fn size(&self) -> u64 {
        u64::from(self.sectors) * u64::from(self.sector_size)
    }

    /// Is `addr..addr+len` entirely inside the device?
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        u64::from(addr) + u64::from(len) <= self.size()
    }
}

/// Parse strings like "SECTORSxSECTOR_BYTESxPAGE_BYTES"
impl FromStr for FlashGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [sectors, sector_size, page_size]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let geometry = FlashGeometry {
            sectors: sectors.parse()?,
            sector_size: sector_size.parse()?,
            page_size: page_size.parse()?,
        };

        ensure!(geometry.page_size > 0, "page size must be nonzero");
        ensure!(geometry.sector_size > 0, "sector size must be nonzero");
        ensure!(
            geometry.sector_size % geometry.page_size == 0,
            "sector size not multiple of page size"
        );
        ensure!(
            geometry.size() <= u64::from(u32::MAX) + 1,
            "flash larger than 32-bit address space"
        );

        Ok(geometry)
    }
}

/// Represents a NOR flash device, addressed by absolute byte offset
pub trait Flash {
    /// Get the layout of the flash
    fn geometry(&self) -> FlashGeometry;

    /// Read `content.len()` bytes starting at `addr`
    fn read(&self, addr: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Erase `len` bytes starting at `addr`, setting them all to [ERASED_BYTE]
    ///
    /// Both `addr` and `len` must be multiples of the sector size.
    fn erase(&mut self, addr: u32, len: u32) -> anyhow::Result<()>;

    /// Program `content` at `addr`
    ///
    /// The content must not be longer than a page and must not cross a page boundary, but may
    /// be shorter than a page. Programming can only clear bits, so the target should have been
    /// erased first.
    fn write(&mut self, addr: u32, content: &[u8]) -> anyhow::Result<()>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn geometry(&self) -> FlashGeometry {
        (**self).geometry()
    }
    fn read(&self, addr: u32, content: &mut [u8]) -> anyhow::Result<()> {
        (**self).read(addr, content)
    }
    fn erase(&mut self, addr: u32, len: u32) -> anyhow::Result<()> {
        (**self).erase(addr, len)
    }
    fn write(&mut self, addr: u32, content: &[u8]) -> anyhow::Result<()> {
        (**self).write(addr, content)
    }
}

/// Ways a [SimFlash] can be told to misbehave, for exercising failure paths
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// Erases touching the range return an error
    EraseError,

    /// Writes touching the range return an error
    WriteError,

    /// Writes touching the range report success but leave flash untouched
    DropWrite,

    /// Writes touching the range report success but store every byte inverted
    FlipBits,
}

/// A simulated in-memory NOR flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimFlash {
    data: Vec<u8>,
    geometry: FlashGeometry,
    faults: Vec<(Range<u32>, Fault)>,

    /// Every successful (or silently faulted) write, as `(addr, len)`
    write_log: Vec<(u32, usize)>,

    /// Every successful erase, as `(addr, len)`
    erase_log: Vec<(u32, u32)>,
}

impl SimFlash {
    /// Create a fully-erased SimFlash with the specified geometry
    pub fn new(geometry: FlashGeometry) -> Self {
        let size = usize::try_from(geometry.size()).expect("simulated flash too large");
        Self {
            data: vec![ERASED_BYTE; size],
            geometry,
            faults: Vec::new(),
            write_log: Vec::new(),
            erase_log: Vec::new(),
        }
    }

    /// Initialize the flash contents from a type implementing `Read` (such as a dump file).
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        read.read_exact(&mut self.data)?;
        Ok(())
    }

    /// Write the contents of the simulated flash out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        write.write_all(&self.data)?;
        Ok(())
    }

    /// Make every later operation touching `range` misbehave as described by `fault`
    pub fn inject_fault(&mut self, range: Range<u32>, fault: Fault) {
        self.faults.push((range, fault));
    }

    /// Make the flash behave again
    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    /// Return and reset the log of `(addr, len)` writes
    pub fn take_write_log(&mut self) -> Vec<(u32, usize)> {
        std::mem::take(&mut self.write_log)
    }

    /// Return and reset the log of `(addr, len)` erases
    pub fn take_erase_log(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.erase_log)
    }

    /// Direct access to the raw contents, bypassing all flash rules
    pub fn raw_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.data[range]
    }

    fn fault_for(&self, addr: u32, len: u32, kinds: &[Fault]) -> Option<Fault> {
        let end = addr.saturating_add(len);
        self.faults
            .iter()
            .find(|(range, fault)| kinds.contains(fault) && range.start < end && addr < range.end)
            .map(|&(_, fault)| fault)
    }

    fn span(&self, addr: u32, len: usize) -> anyhow::Result<Range<usize>> {
        let len32 = u32::try_from(len)?;
        ensure!(
            self.geometry.contains(addr, len32),
            "range {addr:#x}+{len:#x} out of bounds"
        );
        let begin = addr as usize;
        Ok(begin..begin + len)
    }
}

impl Flash for SimFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&self, addr: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let span = self.span(addr, content.len())?;
        content.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> anyhow::Result<()> {
        let sector_size = self.geometry.sector_size;
        ensure!(addr % sector_size == 0, "erase at {addr:#x} not sector-aligned");
        ensure!(len % sector_size == 0, "erase length {len:#x} not sector-sized");
        let span = self.span(addr, len as usize)?;

        if self.fault_for(addr, len, &[Fault::EraseError]).is_some() {
            bail!("simulated erase failure at {addr:#x}");
        }

        self.data[span].fill(ERASED_BYTE);
        self.erase_log.push((addr, len));
        Ok(())
    }

    fn write(&mut self, addr: u32, content: &[u8]) -> anyhow::Result<()> {
        let page_size = self.geometry.page_size as usize;
        ensure!(!content.is_empty(), "empty write");
        ensure!(content.len() <= page_size, "write larger than a page");
        ensure!(
            addr as usize % page_size + content.len() <= page_size,
            "write at {addr:#x} crosses a page boundary"
        );
        let span = self.span(addr, content.len())?;

        let kinds = [Fault::WriteError, Fault::DropWrite, Fault::FlipBits];
        let fault = self.fault_for(addr, content.len() as u32, &kinds);
        if fault == Some(Fault::WriteError) {
            bail!("simulated write failure at {addr:#x}");
        }
        self.write_log.push((addr, content.len()));

        // NOR programming can only clear bits
        let target = &mut self.data[span];
        match fault {
            Some(Fault::DropWrite) => (),
            Some(Fault::FlipBits) => target
                .iter_mut()
                .zip(content)
                .for_each(|(t, &c)| *t &= !c),
            _ => target.iter_mut().zip(content).for_each(|(t, &c)| *t &= c),
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: FlashGeometry = FlashGeometry {
    sectors: 64,
    sector_size: 4096,
    page_size: 128,
};

#[test]
fn test_geometry_parse() {
    let geometry: FlashGeometry = "64x4096x128".parse().unwrap();
    assert_eq!(geometry, TEST_GEOMETRY);
    assert_eq!(geometry.size(), 256 * 1024);

    assert!("64x4096".parse::<FlashGeometry>().is_err());
    assert!("64x4000x128".parse::<FlashGeometry>().is_err());
    assert!("64x0x128".parse::<FlashGeometry>().is_err());
    assert!("64x4096x0".parse::<FlashGeometry>().is_err());
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_GEOMETRY);

    let mut buf = [0u8; 16];
    flash.read(0x1000, &mut buf)?;
    assert!(buf.is_erased());

    flash.write(0x1000, &[0xA5; 16])?;
    flash.read(0x1000, &mut buf)?;
    assert_eq!(buf, [0xA5; 16]);

    // Programming without an erase can only clear bits
    flash.write(0x1000, &[0x5A; 16])?;
    flash.read(0x1000, &mut buf)?;
    assert_eq!(buf, [0x00; 16]);

    flash.erase(0x1000, 0x1000)?;
    flash.read(0x1000, &mut buf)?;
    assert!(buf.is_erased());

    Ok(())
}

#[test]
fn test_sim_rules() {
    let mut flash = SimFlash::new(TEST_GEOMETRY);

    assert!(flash.write(0, &[0u8; 129]).is_err());
    assert!(flash.write(100, &[0u8; 64]).is_err());
    assert!(flash.write(100, &[0u8; 28]).is_ok());
    assert!(flash.erase(0x800, 0x1000).is_err());
    assert!(flash.erase(0, 0x800).is_err());
    assert!(flash.erase(0x3F000, 0x2000).is_err());

    let mut buf = [0u8; 2];
    assert!(flash.read(0x3FFFF, &mut buf).is_err());
}

#[test]
fn test_sim_faults() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_GEOMETRY);
    flash.inject_fault(0x2000..0x3000, Fault::DropWrite);
    flash.inject_fault(0x3000..0x4000, Fault::EraseError);

    flash.write(0x2000, &[0u8; 4])?;
    let mut buf = [0u8; 4];
    flash.read(0x2000, &mut buf)?;
    assert!(buf.is_erased());

    assert!(flash.erase(0x3000, 0x1000).is_err());
    assert!(flash.erase(0x2000, 0x1000).is_ok());

    flash.clear_faults();
    assert!(flash.erase(0x3000, 0x1000).is_ok());
    assert_eq!(flash.take_erase_log(), [(0x2000, 0x1000), (0x3000, 0x1000)]);
    assert_eq!(flash.take_write_log(), [(0x2000, 4)]);

    Ok(())
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut flash = SimFlash::new(TEST_GEOMETRY);
    flash.load(&mut std::io::repeat(0x55u8))?;

    let mut dump = Vec::new();
    flash.save(&mut dump)?;
    assert_eq!(dump.len() as u64, TEST_GEOMETRY.size());
    assert!(dump.iter().all(|&x| x == 0x55));

    Ok(())
}
