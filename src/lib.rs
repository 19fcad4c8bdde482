//! A/B boot configuration for systems that boot from NOR (QSPI) flash.
//!
//! The boot ROM picks one of two firmware images according to a small record kept, twice, at
//! fixed flash offsets. This crate keeps that record trustworthy across power loss and
//! corruption, and provides what an updater needs to replace the image that is not running:
//! slot erase, streamed page-bounded writes, and CRC-32 verification.

pub mod checksum;
pub mod config;
pub mod erase;
pub mod flash;
pub mod record;
pub mod store;
pub mod update;
pub mod verify;
pub mod writer;
