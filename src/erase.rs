//! Erasing an image slot, one sector at a time.
//!
//! A slot is many megabytes and erasing it takes seconds, so the erase is broken into steps that
//! a caller can interleave with other work (e.g. servicing a network connection) while reporting
//! how far along it is.

use crate::flash::{Flash, FlashGeometry};
use crate::record::ImageId;

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EraseError {
    #[error("failed to erase sector at {offset:#x}")]
    FlashEraseFailed {
        offset: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("image slot at {offset:#x} is not sector-aligned")]
    Misaligned { offset: u32 },

    #[error("image slot {offset:#x}+{len:#x} does not fit in flash")]
    OutOfBounds { offset: u32, len: u64 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EraseState {
    Idle,
    InProgress {
        image: ImageId,
        sectors_done: u32,
        total: u32,
    },
    Completed {
        image: ImageId,
    },
}

pub struct RegionEraser {
    state: EraseState,
    offset: u32,
    sector_size: u32,
    rpt: Option<howudoin::Tx>,
}

impl fmt::Debug for RegionEraser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionEraser")
            .field("state", &self.state)
            .field("offset", &self.offset)
            .field("sector_size", &self.sector_size)
            .finish_non_exhaustive()
    }
}

impl Default for RegionEraser {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionEraser {
    pub fn new() -> Self {
        Self {
            state: EraseState::Idle,
            offset: 0,
            sector_size: 0,
            rpt: None,
        }
    }

    pub fn state(&self) -> EraseState {
        self.state
    }

    /// Prepare to erase `size` bytes (rounded up to whole sectors) of `image` at `offset`.
    ///
    /// An erase of the same image that is already under way carries on where it is; anything
    /// else starts over.
    pub fn request(
        &mut self,
        image: ImageId,
        offset: u32,
        size: u32,
        geometry: FlashGeometry,
    ) -> Result<(), EraseError> {
        if matches!(self.state, EraseState::InProgress { image: i, .. } if i == image) {
            return Ok(());
        }

        let sector_size = geometry.sector_size;
        if offset % sector_size != 0 {
            return Err(EraseError::Misaligned { offset });
        }
        let total = size.div_ceil(sector_size);
        let len = u64::from(total) * u64::from(sector_size);
        if u64::from(offset) + len > geometry.size() {
            return Err(EraseError::OutOfBounds { offset, len });
        }

        if let Some(rpt) = self.rpt.take() {
            rpt.close();
        }

        log::info!("erasing image {image}: {total} sectors at {offset:#x}");
        self.offset = offset;
        self.sector_size = sector_size;
        self.state = if total == 0 {
            EraseState::Completed { image }
        } else {
            let label = match image {
                ImageId::A => "Erasing image A",
                ImageId::B => "Erasing image B",
            };
            self.rpt = Some(howudoin::new().label(label).set_len(Some(u64::from(total))));
            EraseState::InProgress {
                image,
                sectors_done: 0,
                total,
            }
        };

        Ok(())
    }

    /// Erase the next sector, if an erase is under way. Returns the state afterwards.
    ///
    /// A failed sector abandons the erase; it has to be requested again.
    pub fn step<F: Flash + ?Sized>(&mut self, flash: &mut F) -> Result<EraseState, EraseError> {
        let EraseState::InProgress {
            image,
            sectors_done,
            total,
        } = self.state
        else {
            return Ok(self.state);
        };

        let offset = self.offset + sectors_done * self.sector_size;
        if let Err(source) = flash.erase(offset, self.sector_size) {
            log::error!("erasing image {image} failed at {offset:#x}: {source:#}");
            self.state = EraseState::Idle;
            if let Some(rpt) = self.rpt.take() {
                rpt.close();
            }
            return Err(EraseError::FlashEraseFailed { offset, source });
        }

        if let Some(rpt) = &self.rpt {
            rpt.inc();
        }

        let sectors_done = sectors_done + 1;
        self.state = if sectors_done == total {
            log::info!("image {image} erased");
            if let Some(rpt) = self.rpt.take() {
                rpt.close();
            }
            EraseState::Completed { image }
        } else {
            EraseState::InProgress {
                image,
                sectors_done,
                total,
            }
        };

        Ok(self.state)
    }

    /// Step until the erase in progress, if any, is complete
    pub fn run_to_completion<F: Flash + ?Sized>(&mut self, flash: &mut F) -> Result<(), EraseError> {
        while let EraseState::InProgress { .. } = self.step(flash)? {}
        Ok(())
    }

    /// How far the current erase has come, 0 to 100
    pub fn progress_percent(&self) -> u8 {
        match self.state {
            EraseState::Idle => 0,
            EraseState::InProgress {
                sectors_done,
                total,
                ..
            } => (u64::from(sectors_done) * 100 / u64::from(total)) as u8,
            EraseState::Completed { .. } => 100,
        }
    }

    /// Has `image` been completely erased, and not written since?
    pub fn is_erased(&self, image: ImageId) -> bool {
        self.state == EraseState::Completed { image }
    }

    /// Claim a completed erase of `image` for writing. Every erase can only be claimed once.
    pub fn take_erased(&mut self, image: ImageId) -> bool {
        if self.is_erased(image) {
            self.state = EraseState::Idle;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::flash::{Fault, PageUtil, SimFlash, TEST_GEOMETRY};

    #[test]
    fn test_erase_steps() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        flash.raw_mut(0x4000..0x14000).fill(0x12);

        let mut eraser = RegionEraser::new();
        assert_eq!(eraser.progress_percent(), 0);
        eraser.request(ImageId::B, 0x4000, 0x10000, TEST_GEOMETRY)?;

        let state = eraser.step(&mut flash)?;
        assert_eq!(
            state,
            EraseState::InProgress {
                image: ImageId::B,
                sectors_done: 1,
                total: 16
            }
        );
        assert_eq!(eraser.progress_percent(), 6);
        assert!(!eraser.is_erased(ImageId::B));

        // Asking again does not start over
        eraser.request(ImageId::B, 0x4000, 0x10000, TEST_GEOMETRY)?;
        assert_eq!(eraser.progress_percent(), 6);

        eraser.run_to_completion(&mut flash)?;
        assert_eq!(eraser.state(), EraseState::Completed { image: ImageId::B });
        assert_eq!(eraser.progress_percent(), 100);
        assert!(eraser.is_erased(ImageId::B));
        assert!(!eraser.is_erased(ImageId::A));

        let erases = flash.take_erase_log();
        assert_eq!(erases.len(), 16);
        assert!(erases.iter().all(|&(_, len)| len == 0x1000));

        let mut slot = vec![0u8; 0x10000];
        flash.read(0x4000, &mut slot)?;
        assert!(slot.is_erased());

        assert!(eraser.take_erased(ImageId::B));
        assert!(!eraser.take_erased(ImageId::B));
        assert_eq!(eraser.state(), EraseState::Idle);

        Ok(())
    }

    #[test]
    fn test_partial_sector_rounds_up() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let mut eraser = RegionEraser::new();

        eraser.request(ImageId::A, 0x8000, 0x1800, TEST_GEOMETRY)?;
        eraser.run_to_completion(&mut flash)?;
        assert_eq!(flash.take_erase_log(), [(0x8000, 0x1000), (0x9000, 0x1000)]);

        Ok(())
    }

    #[test]
    fn test_erase_failure() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        flash.inject_fault(0x6000..0x7000, Fault::EraseError);

        let mut eraser = RegionEraser::new();
        eraser.request(ImageId::A, 0x4000, 0x10000, TEST_GEOMETRY)?;
        assert!(matches!(
            eraser.run_to_completion(&mut flash),
            Err(EraseError::FlashEraseFailed { offset: 0x6000, .. })
        ));
        assert_eq!(eraser.state(), EraseState::Idle);
        assert!(!eraser.is_erased(ImageId::A));

        Ok(())
    }

    #[test]
    fn test_bad_requests() {
        let mut eraser = RegionEraser::new();
        assert!(matches!(
            eraser.request(ImageId::A, 0x4800, 0x1000, TEST_GEOMETRY),
            Err(EraseError::Misaligned { offset: 0x4800 })
        ));
        assert!(matches!(
            eraser.request(ImageId::A, 0x3F000, 0x2000, TEST_GEOMETRY),
            Err(EraseError::OutOfBounds { .. })
        ));
        assert_eq!(eraser.state(), EraseState::Idle);
    }
}
