//! A bench tool for the boot configuration store and the image update path.
//!
//! It works against a flash dump file (simulated) or, on Linux, a real SPI-NOR MTD partition, so
//! a board's QSPI contents can be inspected, repaired and updated by hand.

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use ab_bootcfg::{
    checksum::IMAGE_CRC,
    config::FlashMap,
    flash::{Flash, FlashGeometry, SimFlash},
    record::ImageId,
    store::{read_copies, InitReport},
    update::UpdateService,
};
#[cfg(target_os = "linux")]
use ab_bootcfg::flash::mtd::MtdFlash;

fn parse_hex(s: &str) -> Result<u32> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

#[derive(Args, Debug)]
#[group(required = true)]
struct FlashOptions {
    /// Name of the MTD partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the flash dump to use
    #[clap(long, group = "flash-options", requires = "sim_geometry")]
    sim_path: Option<PathBuf>,

    /// Geometry of the flash to simulate, as SECTORSxSECTOR_BYTESxPAGE_BYTES
    #[clap(long)]
    sim_geometry: Option<FlashGeometry>,

    /// Write back the flash dump when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl FlashOptions {
    fn open(&self) -> Result<FlashImpl> {
        let flashimpl = if let Some(geometry) = self.sim_geometry {
            let mut sim = SimFlash::new(geometry);
            if let Some(path) = &self.sim_path {
                let mut dump =
                    File::open(path).with_context(|| format!("opening {}", path.display()))?;
                sim.load(&mut dump)?;
            }

            FlashImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = if let Some(name) = &self.mtd_name {
                    MtdFlash::open_named(name)?
                } else if let Some(dev) = &self.mtd_dev {
                    MtdFlash::open(dev)?
                } else {
                    unreachable!()
                };

                FlashImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(flashimpl)
    }

    fn cleanup(&self, flash: FlashImpl) -> Result<()> {
        if self.sim_write {
            if let (Some(path), FlashImpl::Sim(sim)) = (&self.sim_path, flash) {
                sim.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum FlashImpl {
    Sim(SimFlash),

    #[cfg(target_os = "linux")]
    Mtd(MtdFlash),
}

impl Flash for FlashImpl {
    fn geometry(&self) -> FlashGeometry {
        match self {
            Self::Sim(flash) => flash.geometry(),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.geometry(),
        }
    }

    fn read(&self, addr: u32, content: &mut [u8]) -> Result<()> {
        match self {
            Self::Sim(flash) => flash.read(addr, content),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.read(addr, content),
        }
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        match self {
            Self::Sim(flash) => flash.erase(addr, len),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.erase(addr, len),
        }
    }

    fn write(&mut self, addr: u32, content: &[u8]) -> Result<()> {
        match self {
            Self::Sim(flash) => flash.write(addr, content),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.write(addr, content),
        }
    }
}

/// Where the boot records live. The defaults are the standard QSPI map.
#[derive(Args, Debug)]
struct MapOptions {
    /// Offset of the primary boot record
    #[clap(long, value_parser = parse_hex, default_value = "0x100000")]
    primary_offset: u32,

    /// Offset of the backup boot record
    #[clap(long, value_parser = parse_hex, default_value = "0x120000")]
    backup_offset: u32,

    /// Size of the erase region holding each record
    #[clap(long, value_parser = parse_hex, default_value = "0x20000")]
    record_region_size: u32,

    /// Size reserved for each image slot
    #[clap(long, value_parser = parse_hex, default_value = "0xD80000")]
    max_image_size: u32,
}

impl From<&MapOptions> for FlashMap {
    fn from(value: &MapOptions) -> Self {
        Self {
            primary_offset: value.primary_offset,
            backup_offset: value.backup_offset,
            record_region_size: value.record_region_size,
            max_image_size: value.max_image_size,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print both copies of the boot record; this is a read-only operation
    Show,

    /// Bring the record store up, repairing or initializing the copies as needed
    Init,

    /// Change the bootable flags and/or the requested image
    SetState {
        /// Whether image A may be booted
        #[clap(long)]
        a_bootable: Option<bool>,

        /// Whether image B may be booted
        #[clap(long)]
        b_bootable: Option<bool>,

        /// The image to boot next
        #[clap(long)]
        request: Option<ImageId>,
    },

    /// Erase an image slot
    EraseImage {
        /// A or B
        image: ImageId,
    },

    /// Erase an image slot and stream a file into it, then check its CRC
    WriteImage {
        /// A or B
        image: ImageId,

        /// The image file to write
        path: PathBuf,

        /// Feed the file to the writer in chunks of this many bytes
        #[clap(long, default_value_t = 1460)]
        chunk_size: u64,

        /// Once verified, mark the image bootable and request it
        #[clap(long)]
        activate: bool,
    },

    /// Check the CRC-32 of an image slot
    VerifyImage {
        /// A or B
        image: ImageId,

        /// Number of bytes to check
        #[clap(value_parser = parse_hex)]
        length: u32,

        /// The expected CRC-32
        #[clap(value_parser = parse_hex)]
        crc: u32,
    },
}

fn print_report(report: &InitReport) {
    println!("Boot records: {:?}", report.outcome);
    if let Some(error) = &report.primary_fault {
        println!("  primary: {error:#}");
    }
    if let Some(error) = &report.backup_fault {
        println!("  backup: {error:#}");
    }
    for error in &report.repair_errors {
        println!("  repair failed: {error:#}");
    }
}

impl Command {
    fn execute(self, flash: &mut FlashImpl, map: FlashMap) -> Result<()> {
        if let Command::Show = self {
            let (primary, backup) = read_copies(&*flash, &map);
            for (name, copy) in [("Primary", primary), ("Backup", backup)] {
                match copy {
                    Ok(record) => println!("{name}:\n{record}\n"),
                    Err(error) => println!("{name}: {error:#}\n"),
                }
            }
            return Ok(());
        }

        let (mut service, report) = UpdateService::start(&mut *flash, map)?;
        print_report(&report);

        match self {
            Command::Show => unreachable!(),

            Command::Init => println!("{}", service.record()),

            Command::SetState {
                a_bootable,
                b_bootable,
                request,
            } => {
                let state = service.record().state;
                service.update_persistent_state(
                    a_bootable.unwrap_or(state.image_a_bootable),
                    b_bootable.unwrap_or(state.image_b_bootable),
                    request.unwrap_or(state.requested_image),
                )?;
                println!("{}", service.boot_status());
            }

            Command::EraseImage { image } => service.erase_image_region(image)?,

            Command::WriteImage {
                image,
                path,
                chunk_size,
                activate,
            } => {
                ensure!(chunk_size > 0, "chunk size must be nonzero");
                let mut file =
                    File::open(&path).with_context(|| format!("opening {}", path.display()))?;

                service.erase_image_region(image)?;
                service.begin_image_write(image)?;

                let mut digest = IMAGE_CRC.digest();
                let mut length: u32 = 0;
                let mut chunk = Vec::new();
                loop {
                    chunk.clear();
                    (&mut file).take(chunk_size).read_to_end(&mut chunk)?;
                    let is_final = (chunk.len() as u64) < chunk_size;

                    digest.update(&chunk);
                    service.write_image_chunk(&chunk, is_final)?;
                    length = length
                        .checked_add(u32::try_from(chunk.len())?)
                        .context("image larger than 4 GiB")?;

                    if is_final {
                        break;
                    }
                }

                let crc = digest.finalize();
                service.verify_image_crc(image, length, crc)?;
                println!("Image {image}: {length} bytes, CRC {crc:#010X}");

                if activate {
                    let state = service.record().state;
                    let (a_bootable, b_bootable) = match image {
                        ImageId::A => (true, state.image_b_bootable),
                        ImageId::B => (state.image_a_bootable, true),
                    };
                    service.update_persistent_state(a_bootable, b_bootable, image)?;
                    println!("{}", service.boot_status());
                }
            }

            Command::VerifyImage { image, length, crc } => {
                service.verify_image_crc(image, length, crc)?;
                println!("Image {image}: CRC {crc:#010X} OK");
            }
        }

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash to use
    #[clap(flatten)]
    flash: FlashOptions,

    #[clap(flatten)]
    map: MapOptions,

    /// Log more detail
    #[clap(short, long)]
    verbose: bool,

    /// The command to run against this flash
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let level = match args.verbose {
        true => LevelFilter::Debug,
        false => LevelFilter::Info,
    };
    SimpleLogger::new().with_level(level).init()?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let map = FlashMap::from(&args.map);
    let mut flash = args.flash.open()?;
    args.cmd.execute(&mut flash, map)?;
    args.flash.cleanup(flash)?;
    Ok(())
}
