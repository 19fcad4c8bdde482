//! The operations a firmware-update front end needs, over one flash device.
//!
//! [UpdateService] owns the flash and everything that keeps state about it: the record store,
//! the slot eraser and the streaming writer. A typical update goes
//! [erase](UpdateService::erase_image_region) → [begin](UpdateService::begin_image_write) →
//! [chunks](UpdateService::write_image_chunk) → [verify](UpdateService::verify_image_crc) →
//! [update_persistent_state](UpdateService::update_persistent_state).

use crate::config::FlashMap;
use crate::erase::{EraseError, EraseState, RegionEraser};
use crate::flash::Flash;
use crate::record::{BootRecord, ImageId, PersistentState};
use crate::store::{InitReport, RecordStore, StoreError, StoreState};
use crate::verify::{verify_image, VerifyError};
use crate::writer::{StreamWriter, WriteError};

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Erase(#[from] EraseError),

    #[error("image {0} must be erased before it is written")]
    SlotNotErased(ImageId),

    #[error("image {image} would grow to {size:#x} bytes, the slot holds {max:#x}")]
    ImageTooLarge { image: ImageId, size: u64, max: u32 },

    #[error("flash map does not fit the device")]
    InvalidMap(#[source] anyhow::Error),
}

/// A snapshot of what the boot ROM will see
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootStatus {
    pub state: PersistentState,
    pub store_state: StoreState,
}

impl fmt::Display for BootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (records {:?})", self.state, self.store_state)
    }
}

/// The image currently being streamed in
#[derive(Debug, Copy, Clone)]
struct WriteTarget {
    image: ImageId,
    offset: u32,
}

#[derive(Debug)]
pub struct UpdateService<F: Flash> {
    flash: F,
    store: RecordStore,
    eraser: RegionEraser,
    writer: StreamWriter,
    target: Option<WriteTarget>,
}

impl<F: Flash> UpdateService<F> {
    /// Take over `flash`, bringing the boot record store up (and repairing it if need be)
    pub fn start(mut flash: F, map: FlashMap) -> Result<(Self, InitReport), UpdateError> {
        map.check(flash.geometry()).map_err(UpdateError::InvalidMap)?;

        let (store, report) = RecordStore::initialize(&mut flash, map);
        let service = Self {
            flash,
            store,
            eraser: RegionEraser::new(),
            writer: StreamWriter::new(),
            target: None,
        };
        Ok((service, report))
    }

    pub fn record(&self) -> &BootRecord {
        self.store.current()
    }

    pub fn store_state(&self) -> StoreState {
        self.store.state()
    }

    pub fn requested_boot_image(&self) -> ImageId {
        self.record().state.requested_image
    }

    /// Flash offset of an image slot, as the current record has it
    pub fn image_offset(&self, image: ImageId) -> u32 {
        self.record().image_offset(image)
    }

    pub fn boot_status(&self) -> BootStatus {
        BootStatus {
            state: self.record().state,
            store_state: self.store.state(),
        }
    }

    pub fn update_persistent_state(
        &mut self,
        image_a_bootable: bool,
        image_b_bootable: bool,
        requested_image: ImageId,
    ) -> Result<(), UpdateError> {
        self.store.update_persistent_state(
            &mut self.flash,
            image_a_bootable,
            image_b_bootable,
            requested_image,
        )?;
        Ok(())
    }

    /// Start (or keep going with) an erase of `image`, to be driven by [Self::erase_step]
    pub fn request_erase(&mut self, image: ImageId) -> Result<(), UpdateError> {
        if matches!(self.target, Some(target) if target.image == image) {
            log::warn!("erasing image {image} while it is being written");
            self.writer.abort();
            self.target = None;
        }

        let offset = self.image_offset(image);
        let size = self.store.map().max_image_size;
        self.eraser.request(image, offset, size, self.flash.geometry())?;
        Ok(())
    }

    /// Erase one more sector of the slot requested with [Self::request_erase]
    pub fn erase_step(&mut self) -> Result<EraseState, UpdateError> {
        Ok(self.eraser.step(&mut self.flash)?)
    }

    pub fn erase_progress(&self) -> u8 {
        self.eraser.progress_percent()
    }

    /// Erase a whole image slot before returning
    pub fn erase_image_region(&mut self, image: ImageId) -> Result<(), UpdateError> {
        self.request_erase(image)?;
        self.eraser.run_to_completion(&mut self.flash)?;
        Ok(())
    }

    /// Start streaming a new image into a freshly erased slot
    pub fn begin_image_write(&mut self, image: ImageId) -> Result<(), UpdateError> {
        if !self.eraser.take_erased(image) {
            return Err(UpdateError::SlotNotErased(image));
        }

        let offset = self.image_offset(image);
        log::info!("writing image {image} at {offset:#x}");
        self.writer.begin(offset);
        self.target = Some(WriteTarget { image, offset });
        Ok(())
    }

    /// Append the next chunk of the image being written
    pub fn write_image_chunk(&mut self, bytes: &[u8], is_final: bool) -> Result<(), UpdateError> {
        let (Some(target), Some(next)) = (self.target, self.writer.next_offset()) else {
            return Err(WriteError::NoSession.into());
        };
        self.write_image_chunk_at(next - target.offset, bytes, is_final)
    }

    /// Like [Self::write_image_chunk], for callers that track the position themselves. The
    /// position still has to be where the previous chunk ended.
    pub fn write_image_chunk_at(
        &mut self,
        offset_in_image: u32,
        bytes: &[u8],
        is_final: bool,
    ) -> Result<(), UpdateError> {
        let Some(target) = self.target else {
            return Err(WriteError::NoSession.into());
        };

        let max = self.store.map().max_image_size;
        let size = u64::from(offset_in_image) + bytes.len() as u64;
        if size > u64::from(max) {
            self.writer.abort();
            self.target = None;
            return Err(UpdateError::ImageTooLarge {
                image: target.image,
                size,
                max,
            });
        }

        let result = self.writer.write(
            &mut self.flash,
            target.offset + offset_in_image,
            bytes,
            is_final,
        );
        if !self.writer.is_active() {
            self.target = None;
        }
        if let Err(error) = &result {
            log::error!("writing image {}: {error}", target.image);
        } else if is_final {
            log::info!(
                "image {} written, {} bytes",
                target.image,
                self.writer.written()
            );
        }

        result.map_err(UpdateError::from)
    }

    /// Check the first `length` bytes of `image` against `expected_crc32`
    pub fn verify_image_crc(
        &self,
        image: ImageId,
        length: u32,
        expected_crc32: u32,
    ) -> Result<(), UpdateError> {
        verify_image(&self.flash, self.record(), image, length, expected_crc32)?;
        Ok(())
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Give the flash back
    pub fn into_flash(self) -> F {
        self.flash
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::checksum::crc32;
    use crate::config::TEST_MAP;
    use crate::flash::{SimFlash, TEST_GEOMETRY};
    use crate::store::InitOutcome;

    fn service() -> UpdateService<SimFlash> {
        let (service, report) =
            UpdateService::start(SimFlash::new(TEST_GEOMETRY), TEST_MAP).unwrap();
        assert!(report.is_cold_start());
        service
    }

    #[test]
    fn test_end_to_end() -> anyhow::Result<()> {
        let mut service = service();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i ^ (i >> 7)) as u8).collect();
        let crc = crc32(&payload);

        service.erase_image_region(ImageId::B)?;
        service.begin_image_write(ImageId::B)?;
        service.write_image_chunk(&payload[..3000], false)?;
        service.write_image_chunk(&payload[3000..7321], false)?;
        service.write_image_chunk(&payload[7321..], true)?;

        let mut stored = vec![0u8; payload.len()];
        service
            .flash()
            .read(service.image_offset(ImageId::B), &mut stored)?;
        assert_eq!(stored, payload);

        service.verify_image_crc(ImageId::B, 10_000, crc)?;
        match service.verify_image_crc(ImageId::B, 10_000, crc ^ 0x8000_0000) {
            Err(UpdateError::Verify(VerifyError::ChecksumMismatch { computed, expected })) => {
                assert_eq!(computed, crc);
                assert_eq!(expected, crc ^ 0x8000_0000);
            }
            other => panic!("unexpected result {other:?}"),
        }

        service.update_persistent_state(true, true, ImageId::B)?;
        assert_eq!(service.requested_boot_image(), ImageId::B);

        // Survives a restart
        let (service, report) = UpdateService::start(service.into_flash(), TEST_MAP)?;
        assert_eq!(report.outcome, InitOutcome::Consistent);
        assert_eq!(service.requested_boot_image(), ImageId::B);
        assert_eq!(service.boot_status().store_state, StoreState::Consistent);

        Ok(())
    }

    #[test]
    fn test_write_needs_erase() -> anyhow::Result<()> {
        let mut service = service();

        assert!(matches!(
            service.begin_image_write(ImageId::A),
            Err(UpdateError::SlotNotErased(ImageId::A))
        ));
        assert!(matches!(
            service.write_image_chunk(&[0; 16], true),
            Err(UpdateError::Write(WriteError::NoSession))
        ));

        service.erase_image_region(ImageId::A)?;
        assert!(matches!(
            service.begin_image_write(ImageId::B),
            Err(UpdateError::SlotNotErased(ImageId::B))
        ));
        service.begin_image_write(ImageId::A)?;
        service.write_image_chunk(&[0x42; 300], true)?;

        // One erase, one image
        assert!(matches!(
            service.begin_image_write(ImageId::A),
            Err(UpdateError::SlotNotErased(ImageId::A))
        ));

        Ok(())
    }

    #[test]
    fn test_stepwise_erase() -> anyhow::Result<()> {
        let mut service = service();

        service.request_erase(ImageId::A)?;
        let mut steps = 0;
        while let EraseState::InProgress { .. } = service.erase_step()? {
            steps += 1;
            assert!(service.erase_progress() < 100);
        }
        assert_eq!(steps + 1, TEST_MAP.max_image_size / TEST_GEOMETRY.sector_size);
        assert_eq!(service.erase_progress(), 100);

        service.begin_image_write(ImageId::A)?;
        Ok(())
    }

    #[test]
    fn test_image_too_large() -> anyhow::Result<()> {
        let mut service = service();
        let max = TEST_MAP.max_image_size as usize;

        service.erase_image_region(ImageId::A)?;
        service.begin_image_write(ImageId::A)?;
        service.write_image_chunk(&vec![0x11; max - 10], false)?;
        assert!(matches!(
            service.write_image_chunk(&[0x22; 11], true),
            Err(UpdateError::ImageTooLarge {
                image: ImageId::A,
                size: 0x10001,
                ..
            })
        ));
        assert!(matches!(
            service.write_image_chunk(&[0x22; 10], true),
            Err(UpdateError::Write(WriteError::NoSession))
        ));

        Ok(())
    }

    #[test]
    fn test_positioned_chunks() -> anyhow::Result<()> {
        let mut service = service();

        service.erase_image_region(ImageId::B)?;
        service.begin_image_write(ImageId::B)?;
        service.write_image_chunk_at(0, &[1; 100], false)?;
        assert!(matches!(
            service.write_image_chunk_at(150, &[2; 50], true),
            Err(UpdateError::Write(WriteError::ContiguityViolation { .. }))
        ));

        Ok(())
    }

    #[test]
    fn test_bad_map() {
        let map = FlashMap {
            primary_offset: 0x800,
            ..TEST_MAP
        };
        assert!(matches!(
            UpdateService::start(SimFlash::new(TEST_GEOMETRY), map),
            Err(UpdateError::InvalidMap(_))
        ));
    }
}
