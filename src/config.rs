//! Where things live in flash.

use crate::flash::FlashGeometry;
use crate::record::{BootRecord, RECORD_SIZE};

use anyhow::ensure;

/// A pub-fields struct describing the fixed layout of the boot flash.
///
/// The two record copies live at fixed offsets known to the boot ROM. The image offsets here
/// only seed the compiled-in default record; once a record exists on flash, the offsets it
/// carries are the ones used.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashMap {
    /// Offset of the primary copy of the boot record
    pub primary_offset: u32,

    /// Offset of the backup copy of the boot record
    pub backup_offset: u32,

    /// Size of the region erased around each record copy
    pub record_region_size: u32,

    pub image_a_offset: u32,
    pub image_b_offset: u32,
    pub recovery_image_offset: u32,

    /// Size reserved for each image slot
    pub max_image_size: u32,
}

impl Default for FlashMap {
    /// The standard QSPI map: persistent registers at 1 MiB, image A at 2 MiB
    fn default() -> Self {
        Self {
            primary_offset: 0x0010_0000,
            backup_offset: 0x0012_0000,
            record_region_size: 0x0002_0000,
            image_a_offset: 0x0020_0000,
            image_b_offset: 0x00F8_0000,
            recovery_image_offset: 0x01E0_0000,
            max_image_size: 0x00D8_0000,
        }
    }
}

impl FlashMap {
    /// The record used when neither copy on flash can be trusted
    pub fn default_record(&self) -> BootRecord {
        BootRecord::new(
            self.image_a_offset,
            self.image_b_offset,
            self.recovery_image_offset,
        )
    }

    /// Confirm that this map makes sense on a device of the given geometry
    pub fn check(&self, geometry: FlashGeometry) -> anyhow::Result<()> {
        let sector_size = geometry.sector_size;

        ensure!(
            geometry.page_size as usize >= RECORD_SIZE,
            "page size {} smaller than a boot record",
            geometry.page_size
        );
        ensure!(
            self.record_region_size != 0 && self.record_region_size % sector_size == 0,
            "record region size {:#x} not a multiple of the sector size {sector_size:#x}",
            self.record_region_size
        );

        for (name, offset) in [
            ("primary record", self.primary_offset),
            ("backup record", self.backup_offset),
        ] {
            ensure!(
                offset % sector_size == 0,
                "{name} offset {offset:#x} not sector-aligned"
            );
            ensure!(
                geometry.contains(offset, self.record_region_size),
                "{name} region at {offset:#x} beyond end of flash"
            );
        }

        let (low, high) = if self.primary_offset < self.backup_offset {
            (self.primary_offset, self.backup_offset)
        } else {
            (self.backup_offset, self.primary_offset)
        };
        ensure!(
            u64::from(low) + u64::from(self.record_region_size) <= u64::from(high),
            "primary and backup record regions overlap"
        );

        for (name, offset) in [
            ("image A", self.image_a_offset),
            ("image B", self.image_b_offset),
        ] {
            ensure!(
                offset % sector_size == 0,
                "{name} offset {offset:#x} not sector-aligned"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_MAP: FlashMap = FlashMap {
    primary_offset: 0x0000,
    backup_offset: 0x1000,
    record_region_size: 0x1000,
    image_a_offset: 0x4000,
    image_b_offset: 0x14000,
    recovery_image_offset: 0x24000,
    max_image_size: 0x10000,
};

#[test]
fn test_default_map_record() {
    assert_eq!(FlashMap::default().default_record(), BootRecord::default());
}

#[test]
fn test_map_check() {
    use crate::flash::TEST_GEOMETRY;

    assert!(TEST_MAP.check(TEST_GEOMETRY).is_ok());

    let overlapping = FlashMap {
        backup_offset: 0x0000,
        ..TEST_MAP
    };
    assert!(overlapping.check(TEST_GEOMETRY).is_err());

    let unaligned = FlashMap {
        backup_offset: 0x1800,
        ..TEST_MAP
    };
    assert!(unaligned.check(TEST_GEOMETRY).is_err());

    // The standard map needs more than the test flash has
    assert!(FlashMap::default().check(TEST_GEOMETRY).is_err());
}
