//! Check a flashed image against the CRC-32 the updater sent along with it

use crate::checksum::flash_crc32;
use crate::flash::Flash;
use crate::record::{BootRecord, ImageId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    /// The image on flash is not the one that was sent. This is an expected outcome; the caller
    /// decides what to do about the slot.
    #[error("image CRC mismatch: computed {computed:#010X}, expected {expected:#010X}")]
    ChecksumMismatch { computed: u32, expected: u32 },

    #[error("reading image from flash")]
    FlashReadFailed(#[source] anyhow::Error),
}

/// Compute the CRC-32 over the first `length` bytes of an image slot and compare it to
/// `expected`.
///
/// The slot's offset is taken from `record`, not from any fixed map.
pub fn verify_image<F: Flash + ?Sized>(
    flash: &F,
    record: &BootRecord,
    image: ImageId,
    length: u32,
    expected: u32,
) -> Result<(), VerifyError> {
    let offset = record.image_offset(image);
    let computed = flash_crc32(flash, offset, length).map_err(VerifyError::FlashReadFailed)?;

    if computed != expected {
        log::warn!(
            "image {image} at {offset:#x}+{length:#x}: CRC {computed:#010X}, expected {expected:#010X}"
        );
        return Err(VerifyError::ChecksumMismatch { computed, expected });
    }

    log::info!("image {image} at {offset:#x}+{length:#x}: CRC {computed:#010X} OK");
    Ok(())
}

#[test]
fn test_verify_image() -> anyhow::Result<()> {
    use crate::checksum::crc32;
    use crate::flash::{SimFlash, TEST_GEOMETRY};

    let record = BootRecord::new(0x4000, 0x14000, 0x24000);
    let image = b"not much of a firmware image, but it has a CRC";

    let mut flash = SimFlash::new(TEST_GEOMETRY);
    flash
        .raw_mut(0x14000..0x14000 + image.len())
        .copy_from_slice(image);
    let len = image.len() as u32;
    let crc = crc32(image);

    verify_image(&flash, &record, ImageId::B, len, crc)?;

    // Same length, wrong slot
    match verify_image(&flash, &record, ImageId::A, len, crc) {
        Err(VerifyError::ChecksumMismatch { computed, expected }) => {
            assert_eq!(computed, crc32(&vec![0xFF; image.len()]));
            assert_eq!(expected, crc);
        }
        other => panic!("unexpected result {other:?}"),
    }

    // Beyond the end of flash
    assert!(matches!(
        verify_image(&flash, &record, ImageId::B, 0x40000, crc),
        Err(VerifyError::FlashReadFailed(_))
    ));

    Ok(())
}
