//! Turn a stream of arbitrarily sized chunks into page-bounded flash writes.
//!
//! Chunks arrive with no alignment guarantee (e.g. from a network socket). Whole pages are
//! programmed as soon as they are available and the remainder is held until the next chunk
//! arrives. The final chunk flushes whatever is left as one short write; nothing is padded.

use crate::flash::Flash;

use bytes::{Buf, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("no image write in progress")]
    NoSession,

    #[error("chunk at {actual:#x} does not follow the previous one (expected {expected:#x})")]
    ContiguityViolation { expected: u32, actual: u32 },

    #[error("flash write failed at {offset:#x}")]
    FlashWriteFailed {
        offset: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("chunk of {len} bytes at {offset:#x} runs off the end of the address space")]
    AddressOverflow { offset: u32, len: usize },
}

/// The state of one streamed write. Lives only in memory: an interrupted transfer has to be
/// restarted from the beginning.
#[derive(Debug, Default)]
pub struct StreamWriter {
    /// Accepted bytes not yet written to flash
    pending: BytesMut,

    /// Flash offset of the first byte in `pending`
    flush_offset: u32,

    /// Where the next chunk has to start, or None outside of a session
    next_offset: Option<u32>,

    written: u64,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session at an absolute flash offset, dropping anything left from before
    pub fn begin(&mut self, offset: u32) {
        if self.is_active() {
            log::warn!("discarding unfinished write session at {:#x}", self.flush_offset);
        }

        self.pending.clear();
        self.flush_offset = offset;
        self.next_offset = Some(offset);
        self.written = 0;
    }

    pub fn is_active(&self) -> bool {
        self.next_offset.is_some()
    }

    /// Where the next chunk is expected to start
    pub fn next_offset(&self) -> Option<u32> {
        self.next_offset
    }

    /// Number of bytes held back, waiting for the rest of their page
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of bytes accepted during the current (or last) session
    pub fn written(&self) -> u64 {
        self.written
    }

    /// End the session without flushing
    pub fn abort(&mut self) {
        self.pending.clear();
        self.next_offset = None;
    }

    /// Accept `data`, which must start exactly where the previous chunk ended.
    ///
    /// Any error ends the session; the slot has to be erased and the transfer restarted.
    pub fn write<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        offset: u32,
        data: &[u8],
        is_final: bool,
    ) -> Result<(), WriteError> {
        let expected = self.next_offset.ok_or(WriteError::NoSession)?;
        if offset != expected {
            self.abort();
            return Err(WriteError::ContiguityViolation {
                expected,
                actual: offset,
            });
        }

        let Some(end) = u32::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
        else {
            self.abort();
            return Err(WriteError::AddressOverflow {
                offset,
                len: data.len(),
            });
        };

        self.pending.extend_from_slice(data);
        self.next_offset = Some(end);
        self.written += data.len() as u64;

        let page_size = flash.geometry().page_size;
        loop {
            // Distance to the next page boundary: a whole page, unless the session began mid-page
            let room = (page_size - self.flush_offset % page_size) as usize;
            let len = if self.pending.len() >= room {
                room
            } else if is_final && !self.pending.is_empty() {
                self.pending.len()
            } else {
                break;
            };

            if let Err(source) = flash.write(self.flush_offset, &self.pending[..len]) {
                let offset = self.flush_offset;
                self.abort();
                return Err(WriteError::FlashWriteFailed { offset, source });
            }

            self.pending.advance(len);
            self.flush_offset += len as u32;
        }

        if is_final {
            log::debug!("write session finished at {end:#x}, {} bytes", self.written);
            self.next_offset = None;
        }

        Ok(())
    }
}
