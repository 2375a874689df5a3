//! A tiny fixed-capacity file system for on-chip EEPROMs.
//!
//! Twenty numbered slots stand in for file names; a packed table in the
//! first 80 device bytes records where each slot's payload sits, and
//! all payloads stay densely packed in slot order. The whole device is
//! mirrored into RAM, mutations rewrite the mirror and flush it back,
//! and a single lock serializes every operation so cooperating tasks
//! can share one [`EepromFs`]. On a workstation the
//! [`device::FileEeprom`] adapter substitutes a regular file for the
//! hardware.

pub mod device;
pub mod fs;

pub use device::{DeviceError, Eeprom, FileEeprom};
pub use fs::{EepromFs, Handle, Status, FIRST_FILE_ADDR, MAX_FILES};
