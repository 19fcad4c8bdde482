//! The two integrity checks used on flash: the additive checksum that protects a boot record,
//! and the IEEE CRC-32 that updater clients send alongside an image.

use crate::flash::Flash;

use crc::{Crc, CRC_32_ISO_HDLC};

/// Reflected CRC-32 with the IEEE 802.3 polynomial, as computed by zlib, `crc32(1)` and friends
pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// How many bytes are read from flash at a time while computing a CRC
const READ_CHUNK: usize = 8192;

/// Compute a record checksum over 32-bit words, the checksum word itself being zero.
///
/// The result is chosen so that the wrapping sum of all words, checksum included, is
/// `0xFFFFFFFF`.
pub fn record_checksum<I: IntoIterator<Item = u32>>(words: I) -> u32 {
    let sum = words.into_iter().fold(0u32, u32::wrapping_add);
    u32::MAX.wrapping_sub(sum)
}

/// CRC-32 of an in-memory buffer
pub fn crc32(bytes: &[u8]) -> u32 {
    IMAGE_CRC.checksum(bytes)
}

/// CRC-32 of `len` bytes of flash starting at `offset`, read in bounded chunks
pub fn flash_crc32<F: Flash + ?Sized>(flash: &F, offset: u32, len: u32) -> anyhow::Result<u32> {
    let chunks = (len as usize).div_ceil(READ_CHUNK);
    let rpt = howudoin::new()
        .label("Computing image CRC")
        .set_len(u64::try_from(chunks).ok());

    let mut digest = IMAGE_CRC.digest();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut addr = offset;
    let mut remaining = len as usize;
    while remaining > 0 {
        let buf = &mut buf[..remaining.min(READ_CHUNK)];
        flash.read(addr, buf)?;
        digest.update(buf);

        // `buf` is never longer than READ_CHUNK, so this cannot truncate. A range ending at the
        // very top of the address space wraps after its last chunk.
        addr = addr.wrapping_add(buf.len() as u32);
        remaining -= buf.len();
        rpt.inc();
    }

    rpt.close();
    Ok(digest.finalize())
}

#[test]
fn test_crc32_check_value() {
    assert_eq!(crc32(b"123456789"), 0xCBF43926);
    assert_eq!(crc32(b""), 0);
}

#[test]
fn test_record_checksum() {
    let words = [0x4D554241, 1, 4, 0, 0x01010000, 0x200000, 0xF80000, 0x1E00000];
    let checksum = record_checksum(words);
    assert_eq!(checksum, 0xAEB1BDB9);

    // All words including the checksum wrap around to all-ones
    let total = words
        .iter()
        .fold(checksum, |acc, &word| acc.wrapping_add(word));
    assert_eq!(total, u32::MAX);

    assert_eq!(record_checksum([]), u32::MAX);
    assert_eq!(record_checksum([u32::MAX, 1]), u32::MAX);
}

#[test]
fn test_flash_crc32_matches_buffer() -> anyhow::Result<()> {
    use crate::flash::{SimFlash, TEST_GEOMETRY};

    let mut flash = SimFlash::new(TEST_GEOMETRY);
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 7 + i / 13) as u8).collect();
    flash.raw_mut(0x1000..0x1000 + payload.len()).copy_from_slice(&payload);

    // Spans several read chunks and ends mid-chunk
    assert_eq!(
        flash_crc32(&flash, 0x1000, payload.len() as u32)?,
        crc32(&payload)
    );
    assert_eq!(flash_crc32(&flash, 0x1000, 0)?, crc32(&[]));

    Ok(())
}

#[test]
fn test_flash_crc32_at_top_of_address_space() -> anyhow::Result<()> {
    use crate::flash::{FlashGeometry, ERASED_BYTE};

    /// A blank 4 GiB part that only supports reads
    struct BlankFlash;

    impl Flash for BlankFlash {
        fn geometry(&self) -> FlashGeometry {
            FlashGeometry {
                sectors: 0x10000,
                sector_size: 0x10000,
                page_size: 256,
            }
        }

        fn read(&self, addr: u32, content: &mut [u8]) -> anyhow::Result<()> {
            anyhow::ensure!(
                u64::from(addr) + content.len() as u64 <= self.geometry().size(),
                "read past end"
            );
            content.fill(ERASED_BYTE);
            Ok(())
        }

        fn erase(&mut self, _addr: u32, _len: u32) -> anyhow::Result<()> {
            anyhow::bail!("read-only")
        }

        fn write(&mut self, _addr: u32, _content: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("read-only")
        }
    }

    // Two chunks, the second ending on the last byte of the device
    let len = 10_000u32;
    assert_eq!(
        flash_crc32(&BlankFlash, u32::MAX - (len - 1), len)?,
        crc32(&vec![ERASED_BYTE; len as usize])
    );

    Ok(())
}
