//! The redundant boot record store.
//!
//! Two copies of the [BootRecord] are kept at fixed flash offsets. At startup both are read and
//! checked; a copy that is missing or damaged is rewritten from the other one, and if neither
//! can be trusted, the compiled-in default is written to both. Every record write is read back
//! and validated before it is believed.

use crate::config::FlashMap;
use crate::flash::{Flash, ERASED_BYTE};
use crate::record::{BootRecord, ImageId, PersistentState, RecordError, RECORD_SIZE};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to erase record region at {offset:#x}")]
    FlashEraseFailed {
        offset: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to program record at {offset:#x}")]
    FlashWriteFailed {
        offset: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read record at {offset:#x}")]
    FlashReadFailed {
        offset: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("record at {offset:#x} is corrupt")]
    RecordCorrupt {
        offset: u32,
        #[source]
        source: RecordError,
    },

    /// The record was written without error, but what came back does not match
    #[error("record at {offset:#x} did not read back as written")]
    WriteVerifyFailed {
        offset: u32,
        #[source]
        source: Option<RecordError>,
    },

    /// The primary copy is up to date, the backup copy is not
    #[error("backup record could not be updated")]
    BackupWriteFailed(#[source] Box<StoreError>),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Health of the two copies on flash, as far as this store knows
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreState {
    /// Both copies are valid and hold the current record
    Consistent,

    /// At most one copy holds the current record
    Degraded,
}

/// What [RecordStore::initialize] found and did
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitOutcome {
    /// Both copies valid and equal, nothing written
    Consistent,

    /// The primary copy was used and the backup rewritten from it
    RepairedBackup,

    /// The backup copy was used and the primary rewritten from it
    RepairedPrimary,

    /// Neither copy was usable, the default record was written to both
    ColdStart,
}

#[derive(Debug)]
pub struct InitReport {
    pub outcome: InitOutcome,

    /// Why the primary copy was rejected, if it was
    pub primary_fault: Option<StoreError>,

    /// Why the backup copy was rejected, if it was
    pub backup_fault: Option<StoreError>,

    /// Repair writes that did not succeed. None of these are fatal.
    pub repair_errors: Vec<StoreError>,
}

impl InitReport {
    pub fn is_cold_start(&self) -> bool {
        self.outcome == InitOutcome::ColdStart
    }
}

/// The exact bytes of a copy that validated, with what they decode to
type StoredRecord = ([u8; RECORD_SIZE], BootRecord);

fn read_stored<F: Flash + ?Sized>(flash: &F, offset: u32) -> Result<StoredRecord, StoreError> {
    let mut buf = [0u8; RECORD_SIZE];
    flash
        .read(offset, &mut buf)
        .map_err(|source| StoreError::FlashReadFailed { offset, source })?;
    let record =
        BootRecord::decode(&buf).map_err(|source| StoreError::RecordCorrupt { offset, source })?;
    Ok((buf, record))
}

/// Read and validate the record stored at `offset`
pub fn read_record<F: Flash + ?Sized>(flash: &F, offset: u32) -> Result<BootRecord, StoreError> {
    read_stored(flash, offset).map(|(_, record)| record)
}

/// Read both copies without repairing anything
pub fn read_copies<F: Flash + ?Sized>(
    flash: &F,
    map: &FlashMap,
) -> (
    Result<BootRecord, StoreError>,
    Result<BootRecord, StoreError>,
) {
    (
        read_record(flash, map.primary_offset),
        read_record(flash, map.backup_offset),
    )
}

/// Erase the region at `offset`, program `record` at its start, and make sure it reads back
fn write_record<F: Flash + ?Sized>(
    flash: &mut F,
    offset: u32,
    region_size: u32,
    record: &BootRecord,
) -> Result<(), StoreError> {
    let encoded = record.encode()?;
    write_bytes(flash, offset, region_size, &encoded)
}

fn write_bytes<F: Flash + ?Sized>(
    flash: &mut F,
    offset: u32,
    region_size: u32,
    encoded: &[u8],
) -> Result<(), StoreError> {
    flash
        .erase(offset, region_size)
        .map_err(|source| StoreError::FlashEraseFailed { offset, source })?;

    // One full page: the record followed by erased bytes
    let mut page = vec![ERASED_BYTE; flash.geometry().page_size as usize];
    page[..encoded.len()].copy_from_slice(encoded);
    flash
        .write(offset, &page)
        .map_err(|source| StoreError::FlashWriteFailed { offset, source })?;

    let mut readback = [0u8; RECORD_SIZE];
    flash
        .read(offset, &mut readback)
        .map_err(|source| StoreError::FlashReadFailed { offset, source })?;
    if readback[..] != encoded[..] {
        return Err(StoreError::WriteVerifyFailed {
            offset,
            source: BootRecord::decode(&readback).err(),
        });
    }

    Ok(())
}

/// Rewrite one copy during initialization, keeping the failure for the report
fn repair<F: Flash + ?Sized>(
    flash: &mut F,
    offset: u32,
    region_size: u32,
    encoded: &[u8],
    errors: &mut Vec<StoreError>,
) {
    if let Err(error) = write_bytes(flash, offset, region_size, encoded) {
        log::error!("repairing boot record at {offset:#x}: {error}");
        errors.push(error);
    }
}

/// Owns the current boot record and keeps both copies on flash in step with it
#[derive(Debug)]
pub struct RecordStore {
    map: FlashMap,
    current: BootRecord,
    state: StoreState,
}

impl RecordStore {
    /// Read both copies, settle on a current record and repair whatever needs repairing.
    ///
    /// This never fails: the worst case is a cold start from the map's default record, which
    /// is reported in the returned [InitReport] along with any repair that did not succeed.
    pub fn initialize<F: Flash + ?Sized>(flash: &mut F, map: FlashMap) -> (Self, InitReport) {
        let primary = read_stored(&*flash, map.primary_offset);
        let backup = read_stored(&*flash, map.backup_offset);
        let region_size = map.record_region_size;
        let mut repair_errors = Vec::new();

        // Copies are only in step when their bytes (and so their checksums) are identical
        let (outcome, current) = match (&primary, &backup) {
            (Ok((p_raw, p)), Ok((b_raw, _))) if p_raw == b_raw => (InitOutcome::Consistent, *p),
            (Ok((p_raw, p)), _) => {
                log::warn!("backup boot record unusable or stale, restoring it from primary");
                repair(&mut *flash, map.backup_offset, region_size, p_raw, &mut repair_errors);
                (InitOutcome::RepairedBackup, *p)
            }
            (Err(_), Ok((b_raw, b))) => {
                log::warn!("primary boot record unusable, restoring it from backup");
                repair(&mut *flash, map.primary_offset, region_size, b_raw, &mut repair_errors);
                (InitOutcome::RepairedPrimary, *b)
            }
            (Err(_), Err(_)) => {
                log::warn!("no usable boot record, writing defaults to both copies");
                let default = map.default_record();
                match default.encode() {
                    Ok(encoded) => {
                        for offset in [map.primary_offset, map.backup_offset] {
                            repair(&mut *flash, offset, region_size, &encoded, &mut repair_errors);
                        }
                    }
                    Err(error) => repair_errors.push(error.into()),
                }
                (InitOutcome::ColdStart, default)
            }
        };

        if let Err(error) = &primary {
            log::warn!("primary boot record: {error}");
        }
        if let Err(error) = &backup {
            log::warn!("backup boot record: {error}");
        }

        let state = if repair_errors.is_empty() {
            StoreState::Consistent
        } else {
            StoreState::Degraded
        };
        log::info!("boot record ({outcome:?}, {state:?}):\n{current}");

        let store = Self {
            map,
            current,
            state,
        };
        let report = InitReport {
            outcome,
            primary_fault: primary.err(),
            backup_fault: backup.err(),
            repair_errors,
        };
        (store, report)
    }

    pub fn current(&self) -> &BootRecord {
        &self.current
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn map(&self) -> &FlashMap {
        &self.map
    }

    /// Write `record` to both copies, primary first.
    ///
    /// If the primary copy does not verify, the current record is left as it was. If only the
    /// backup copy fails, `record` still becomes current (the primary holds it) and
    /// [StoreError::BackupWriteFailed] is returned; the next initialization restores the
    /// backup.
    pub fn commit<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        record: BootRecord,
    ) -> Result<(), StoreError> {
        let region_size = self.map.record_region_size;

        if let Err(error) = write_record(flash, self.map.primary_offset, region_size, &record) {
            log::error!("writing primary boot record: {error}");
            self.state = StoreState::Degraded;
            return Err(error);
        }

        self.current = record;

        if let Err(error) = write_record(flash, self.map.backup_offset, region_size, &record) {
            log::error!("writing backup boot record: {error}");
            self.state = StoreState::Degraded;
            return Err(StoreError::BackupWriteFailed(Box::new(error)));
        }

        self.state = StoreState::Consistent;
        log::debug!("committed boot record {:#010X}", record.checksum());
        Ok(())
    }

    /// Change the bootable flags and the requested image, keeping everything else.
    ///
    /// Asking for the state that is already current does not touch flash.
    pub fn update_persistent_state<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        image_a_bootable: bool,
        image_b_bootable: bool,
        requested_image: ImageId,
    ) -> Result<(), StoreError> {
        let state = PersistentState {
            image_a_bootable,
            image_b_bootable,
            requested_image,
            ..self.current.state
        };
        if state == self.current.state {
            log::debug!("persistent state unchanged, not writing");
            return Ok(());
        }

        log::info!("updating persistent state: {state}");
        self.commit(flash, self.current.with_state(state))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::TEST_MAP;
    use crate::flash::{Fault, SimFlash, TEST_GEOMETRY};

    const PRIMARY: u32 = TEST_MAP.primary_offset;
    const BACKUP: u32 = TEST_MAP.backup_offset;

    fn sample_record() -> BootRecord {
        TEST_MAP.default_record().with_state(PersistentState {
            image_a_bootable: false,
            image_b_bootable: true,
            requested_image: ImageId::B,
            last_booted_image: ImageId::A,
        })
    }

    fn seed(flash: &mut SimFlash, offset: u32, record: &BootRecord) {
        write_record(flash, offset, TEST_MAP.record_region_size, record).unwrap();
    }

    fn smash(flash: &mut SimFlash, offset: u32) {
        let offset = offset as usize;
        flash.raw_mut(offset + 20..offset + 24).fill(0x00);
    }

    #[test]
    fn test_consistent() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let record = sample_record();
        seed(&mut flash, PRIMARY, &record);
        seed(&mut flash, BACKUP, &record);
        flash.take_erase_log();

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::Consistent);
        assert_eq!(store.state(), StoreState::Consistent);
        assert_eq!(*store.current(), record);
        assert!(flash.take_erase_log().is_empty());

        Ok(())
    }

    #[test]
    fn test_cold_start() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert!(report.is_cold_start());
        assert!(matches!(
            report.primary_fault,
            Some(StoreError::RecordCorrupt {
                source: RecordError::Erased,
                ..
            })
        ));
        assert!(report.repair_errors.is_empty());
        assert_eq!(*store.current(), TEST_MAP.default_record());

        assert_eq!(read_record(&flash, PRIMARY)?, TEST_MAP.default_record());
        assert_eq!(read_record(&flash, BACKUP)?, TEST_MAP.default_record());

        Ok(())
    }

    #[test]
    fn test_repair_backup() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let record = sample_record();
        seed(&mut flash, PRIMARY, &record);
        seed(&mut flash, BACKUP, &record);
        smash(&mut flash, BACKUP);

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedBackup);
        assert!(report.primary_fault.is_none());
        assert!(report.backup_fault.is_some());
        assert_eq!(store.state(), StoreState::Consistent);
        assert_eq!(*store.current(), record);
        assert_eq!(read_record(&flash, BACKUP)?, record);

        Ok(())
    }

    #[test]
    fn test_repair_primary() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let record = sample_record();
        seed(&mut flash, BACKUP, &record);
        flash.raw_mut(0..4).copy_from_slice(b"JUNK");

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedPrimary);
        assert_eq!(*store.current(), record);
        assert_eq!(read_record(&flash, PRIMARY)?, record);

        Ok(())
    }

    #[test]
    fn test_disagreeing_copies_follow_primary() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        seed(&mut flash, PRIMARY, &sample_record());
        seed(&mut flash, BACKUP, &TEST_MAP.default_record());

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedBackup);
        assert!(report.backup_fault.is_none());
        assert_eq!(*store.current(), sample_record());
        assert_eq!(read_record(&flash, BACKUP)?, sample_record());

        Ok(())
    }

    #[test]
    fn test_copies_differing_only_in_bytes_are_reconciled() -> anyhow::Result<()> {
        use crate::record::{DekuContainerWrite, RawBootRecord};

        let stored = |flash: &SimFlash, offset: u32| {
            let mut buf = [0u8; RECORD_SIZE];
            flash.read(offset, &mut buf).map(|()| buf)
        };

        // Same decoded record, but A-bootable stored as 2 with its own checksum
        let mut raw = RawBootRecord::from(TEST_MAP.default_record());
        raw.image_a_bootable = 0x02;
        raw.fix_checksum();
        let odd = raw.to_bytes()?;
        assert_eq!(BootRecord::decode(&odd)?, TEST_MAP.default_record());

        let mut flash = SimFlash::new(TEST_GEOMETRY);
        seed(&mut flash, PRIMARY, &TEST_MAP.default_record());
        let backup = BACKUP as usize;
        flash.raw_mut(backup..backup + RECORD_SIZE).copy_from_slice(&odd);

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedBackup);
        assert!(report.backup_fault.is_none());
        assert_eq!(*store.current(), TEST_MAP.default_record());
        assert_eq!(stored(&flash, BACKUP)?, stored(&flash, PRIMARY)?);

        // The primary's bytes are copied as they are, so the next start finds nothing to do
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        seed(&mut flash, BACKUP, &TEST_MAP.default_record());
        flash.raw_mut(0..RECORD_SIZE).copy_from_slice(&odd);

        let (_, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedBackup);
        assert_eq!(stored(&flash, BACKUP)?[..], odd[..]);

        flash.take_erase_log();
        let (_, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::Consistent);
        assert!(flash.take_erase_log().is_empty());

        Ok(())
    }

    #[test]
    fn test_failed_repair_is_not_fatal() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        seed(&mut flash, PRIMARY, &sample_record());
        flash.inject_fault(BACKUP..BACKUP + 0x1000, Fault::EraseError);

        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedBackup);
        assert!(matches!(
            report.repair_errors[..],
            [StoreError::FlashEraseFailed { offset: BACKUP, .. }]
        ));
        assert_eq!(store.state(), StoreState::Degraded);
        assert_eq!(*store.current(), sample_record());

        Ok(())
    }

    #[test]
    fn test_commit_primary_failure_keeps_current() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let (mut store, _) = RecordStore::initialize(&mut flash, TEST_MAP);
        let before = *store.current();

        flash.inject_fault(PRIMARY..PRIMARY + 0x1000, Fault::DropWrite);
        let result = store.commit(&mut flash, sample_record());
        assert!(matches!(
            result,
            Err(StoreError::WriteVerifyFailed {
                offset: PRIMARY,
                source: Some(RecordError::Erased),
            })
        ));
        assert_eq!(*store.current(), before);
        assert_eq!(store.state(), StoreState::Degraded);

        // The backup was never touched
        assert_eq!(read_record(&flash, BACKUP)?, before);

        Ok(())
    }

    #[test]
    fn test_commit_detects_corrupted_write() {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let (mut store, _) = RecordStore::initialize(&mut flash, TEST_MAP);

        flash.inject_fault(PRIMARY..PRIMARY + 0x1000, Fault::FlipBits);
        assert!(matches!(
            store.commit(&mut flash, sample_record()),
            Err(StoreError::WriteVerifyFailed { .. })
        ));
        assert_eq!(*store.current(), TEST_MAP.default_record());
    }

    #[test]
    fn test_commit_backup_failure() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let (mut store, _) = RecordStore::initialize(&mut flash, TEST_MAP);

        flash.inject_fault(BACKUP..BACKUP + 0x1000, Fault::WriteError);
        let result = store.commit(&mut flash, sample_record());
        match result {
            Err(StoreError::BackupWriteFailed(inner)) => assert!(matches!(
                *inner,
                StoreError::FlashWriteFailed { offset: BACKUP, .. }
            )),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(*store.current(), sample_record());
        assert_eq!(store.state(), StoreState::Degraded);
        assert_eq!(read_record(&flash, PRIMARY)?, sample_record());

        // The next startup heals the backup from the primary
        flash.clear_faults();
        let (store, report) = RecordStore::initialize(&mut flash, TEST_MAP);
        assert_eq!(report.outcome, InitOutcome::RepairedBackup);
        assert_eq!(*store.current(), sample_record());
        assert_eq!(read_record(&flash, BACKUP)?, sample_record());

        Ok(())
    }

    #[test]
    fn test_commit() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let (mut store, _) = RecordStore::initialize(&mut flash, TEST_MAP);
        flash.take_write_log();

        store.commit(&mut flash, sample_record())?;
        assert_eq!(store.state(), StoreState::Consistent);
        assert_eq!(read_record(&flash, PRIMARY)?, sample_record());
        assert_eq!(read_record(&flash, BACKUP)?, sample_record());

        // One whole-page program per copy, primary first
        let page = TEST_GEOMETRY.page_size as usize;
        assert_eq!(flash.take_write_log(), [(PRIMARY, page), (BACKUP, page)]);

        Ok(())
    }

    #[test]
    fn test_unchanged_state_is_not_written() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let (mut store, _) = RecordStore::initialize(&mut flash, TEST_MAP);
        flash.take_erase_log();

        store.update_persistent_state(&mut flash, true, true, ImageId::A)?;
        assert!(flash.take_erase_log().is_empty());

        store.update_persistent_state(&mut flash, true, false, ImageId::A)?;
        assert_eq!(flash.take_erase_log().len(), 2);
        assert!(!read_record(&flash, BACKUP)?.state.image_b_bootable);

        Ok(())
    }

    #[test]
    fn test_update_keeps_last_booted() -> anyhow::Result<()> {
        let mut flash = SimFlash::new(TEST_GEOMETRY);
        let mut record = TEST_MAP.default_record();
        record.state.last_booted_image = ImageId::B;
        seed(&mut flash, PRIMARY, &record);
        seed(&mut flash, BACKUP, &record);

        let (mut store, _) = RecordStore::initialize(&mut flash, TEST_MAP);
        store.update_persistent_state(&mut flash, false, true, ImageId::B)?;

        let stored = read_record(&flash, PRIMARY)?;
        assert_eq!(stored.state.last_booted_image, ImageId::B);
        assert_eq!(stored.state.requested_image, ImageId::B);
        assert_eq!(stored.image_a_offset, record.image_a_offset);

        Ok(())
    }
}
