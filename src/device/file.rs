//! Host-emulated EEPROM backed by a fixed-size regular file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{DeviceError, Eeprom};

/// A regular file standing in for the on-chip EEPROM.
///
/// The file must hold exactly `size` bytes. Whenever an access finds it
/// missing or the wrong length, the device mass-erases itself (the file
/// is recreated full of `0xFF`) and the access fails with
/// [`DeviceError::SizeMismatch`], which the file system reports as an
/// invalid table — the same recovery path a factory-fresh chip takes.
#[derive(Debug)]
pub struct FileEeprom {
    path: PathBuf,
    size: u32,
}

impl FileEeprom {
    /// Geometry of the original host harness.
    pub const DEFAULT_SIZE: u32 = 2048;
    pub const DEFAULT_PATH: &'static str = "nonvolatile.bin";

    pub fn new(path: impl AsRef<Path>, size: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            size,
        }
    }

    /// Opens the backing file after verifying it has exactly the
    /// advertised size. A bad file is erased so the next attempt finds
    /// a blank device.
    fn open_checked(&mut self) -> Result<File, DeviceError> {
        let found = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                debug!(path = %self.path.display(), "backing file missing, erasing");
                self.mass_erase()?;
                return Err(DeviceError::SizeMismatch {
                    expected: self.size,
                    found: 0,
                });
            }
        };
        if found != u64::from(self.size) {
            debug!(
                path = %self.path.display(),
                found,
                expected = self.size,
                "backing file has wrong size, erasing"
            );
            self.mass_erase()?;
            return Err(DeviceError::SizeMismatch {
                expected: self.size,
                found: found.min(u64::from(u32::MAX)) as u32,
            });
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(file)
    }
}

impl Eeprom for FileEeprom {
    fn init(&mut self) -> Result<(), DeviceError> {
        trace!(path = %self.path.display(), size = self.size, "file eeprom ready");
        Ok(())
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<u32, DeviceError> {
        let mut file = self.open_checked()?;
        let len = dst.len().min(self.size.saturating_sub(offset) as usize);
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.read_exact(&mut dst[..len])?;
        Ok(len as u32)
    }

    fn program(&mut self, src: &[u8], offset: u32) -> Result<(), DeviceError> {
        let mut file = self.open_checked()?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(src)?;
        file.flush()?;
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), DeviceError> {
        trace!(path = %self.path.display(), "mass erase");
        let mut file = File::create(&self.path)?;
        file.write_all(&vec![0xFF; self.size as usize])?;
        file.flush()?;
        Ok(())
    }
}

#[test]
fn test_missing_file_erased_on_first_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nonvolatile.bin");
    let mut dev = FileEeprom::new(&path, 256);
    let mut buf = [0u8; 256];
    let err = dev.read(&mut buf, 0).unwrap_err();
    assert!(matches!(err, DeviceError::SizeMismatch { found: 0, .. }));
    // the failed access left a blank device behind
    let contents = std::fs::read(&path).unwrap();
    assert_eq!(contents.len(), 256);
    assert!(contents.iter().all(|&b| b == 0xFF));
    // and the retry succeeds
    assert_eq!(dev.read(&mut buf, 0).unwrap(), 256);
    assert!(buf.iter().all(|&b| b == 0xFF));
}

#[test]
fn test_wrong_size_file_erased() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nonvolatile.bin");
    std::fs::write(&path, b"too short").unwrap();
    let mut dev = FileEeprom::new(&path, 64);
    let err = dev.program(&[0u8; 4], 0).unwrap_err();
    assert!(matches!(err, DeviceError::SizeMismatch { found: 9, .. }));
    assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF; 64]);
}

#[test]
fn test_program_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nonvolatile.bin");
    let mut dev = FileEeprom::new(&path, 128);
    dev.mass_erase().unwrap();
    dev.program(b"calibration=42??", 16).unwrap();
    let mut buf = [0u8; 16];
    dev.read(&mut buf, 16).unwrap();
    assert_eq!(&buf, b"calibration=42??");
    // neighbors untouched
    let mut head = [0u8; 16];
    dev.read(&mut head, 0).unwrap();
    assert!(head.iter().all(|&b| b == 0xFF));
}
