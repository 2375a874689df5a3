//! The file-system core: a fixed table of twenty slots over a small
//! byte-addressable device, with all payloads kept densely packed in
//! slot order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::device::{DeviceError, Eeprom, WORD_SIZE};

mod handle;
mod image;
pub mod table;

pub use handle::Handle;
pub use table::{FileEntry, FIRST_FILE_ADDR, MAX_FILES, TABLE_BYTES};

use handle::{FileWindow, HandleTable};
use image::DiskImage;
use table::FileTable;

/// Outcome code of the most recent operation.
///
/// Errors are values here: every public operation records its outcome
/// before returning, and callers inspect it through
/// [`EepromFs::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    Ok,
    /// Slot id out of range, or a payload longer than an entry can
    /// describe.
    BadParams,
    /// Operation targeted an inactive slot.
    FileNotFound,
    /// Write would exceed capacity, or a shift would cross the device
    /// end.
    InsufficientStorage,
    /// The RAM mirror could not be allocated.
    InsufficientMemory,
    /// The device rejected a program call.
    WriteError,
    /// Operation invoked before the device and mirror were ready.
    NotInitialized,
    /// Mutation attempted without arming writes first.
    WriteProtected,
    /// The persisted table is structurally inconsistent, or the
    /// backing store had the wrong size.
    InvalidTable,
    /// A payload byte is neither printable ASCII nor NUL.
    NonAscii,
    /// A printable byte follows a NUL inside a payload.
    UnexpectedNulls,
    /// A device offset or length was not a multiple of the word size.
    WordAlignment,
    /// Device init or mass erase failed.
    DeviceApi,
    Internal,
}

impl Status {
    /// Short uppercase rendering for operator-facing output.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadParams => "BAD PARAMS",
            Status::FileNotFound => "NOT FOUND",
            Status::InsufficientStorage => "OUT OF MEMORY",
            Status::InsufficientMemory => "INSUFFICIENT RAM",
            Status::WriteError => "WRITE ERROR",
            Status::NotInitialized => "HW UNINITIALIZED",
            Status::WriteProtected => "WRITE PREVENTED",
            Status::InvalidTable => "INVALID FS TABLE",
            Status::NonAscii => "BAD FILE DATA",
            Status::UnexpectedNulls => "UNEXPECTED NULLS",
            Status::WordAlignment => "WORD MISALIGNMENT",
            Status::DeviceApi => "API ERROR",
            Status::Internal => "INTERNAL ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct Core<D: Eeprom> {
    device: D,
    image: DiskImage,
    table: FileTable,
    active: BTreeSet<u8>,
    handles: HandleTable,
    status: Status,
    hw_initialized: bool,
    ready: bool,
    write_enabled: bool,
    valid_table: bool,
    eeprom_size: u32,
    bytes_used: u32,
}

/// The file system facade. One instance owns one device; cooperating
/// threads share it by reference, and every public operation runs as a
/// critical section behind a single lock.
pub struct EepromFs<D: Eeprom> {
    core: Mutex<Core<D>>,
}

impl<D: Eeprom> EepromFs<D> {
    /// Builds the facade over `device`: initializes the hardware,
    /// allocates the RAM mirror, and validates the persisted table.
    /// Construction itself never fails; a degraded outcome (device
    /// init failure, undersized device, invalid table) is left in
    /// [`status`](Self::status), and an invalid table is recoverable
    /// through [`format`](Self::format).
    pub fn new(device: D) -> Self {
        let mut core = Core {
            device,
            image: DiskImage::empty(),
            table: FileTable::new(),
            active: BTreeSet::new(),
            handles: HandleTable::default(),
            status: Status::NotInitialized,
            hw_initialized: false,
            ready: false,
            write_enabled: false,
            valid_table: false,
            eeprom_size: 0,
            bytes_used: 0,
        };
        core.ready = core.init();
        Self {
            core: Mutex::new(core),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core<D>> {
        // state consistency is tracked by valid_table/status, not by
        // lock poisoning
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arms the single-shot write fuse. Every mutating call consumes
    /// it, so each write, delete, or format needs its own arming
    /// immediately beforehand.
    pub fn enable_write(&self) {
        self.lock().write_enabled = true;
    }

    /// Device capacity in bytes. Also disarms the write fuse.
    pub fn total_capacity(&self) -> u32 {
        let mut core = self.lock();
        core.write_enabled = false;
        core.eeprom_size
    }

    /// Bytes used by the table plus all active payloads. On an invalid
    /// table this reports 0, records `InvalidTable`, and zeroes the
    /// internal accounting.
    pub fn used_capacity(&self) -> u32 {
        let mut core = self.lock();
        if !core.valid_table {
            core.status = Status::InvalidTable;
            core.bytes_used = 0;
        }
        core.bytes_used
    }

    /// Number of active files. On an invalid table the active set is
    /// cleared and `InvalidTable` recorded.
    pub fn active_file_count(&self) -> u32 {
        let mut core = self.lock();
        if !core.valid_table {
            core.status = Status::InvalidTable;
            core.active.clear();
        }
        core.active.len() as u32
    }

    /// Snapshot of `(slot, size)` for every active file.
    pub fn active_files(&self) -> BTreeMap<u8, u16> {
        let core = self.lock();
        core.active
            .iter()
            .map(|&slot| (slot, core.table.get(slot).size))
            .collect()
    }

    /// Outcome of the most recent operation.
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Opens the file in `slot`, returning a handle that stays valid
    /// across relocations. Opening an already-open slot shares the
    /// underlying manager; every open needs a matching
    /// [`close`](Self::close).
    pub fn open(&self, slot: u8) -> Option<Handle> {
        self.lock().open(slot)
    }

    /// Releases one reference to `slot`'s handle; the manager is
    /// dropped with the last one.
    pub fn close(&self, slot: u8) {
        self.lock().handles.close(slot);
    }

    /// Runs `f` over the handle's current payload bytes while holding
    /// the lock, so no concurrent writer can relocate the window
    /// mid-read. Returns `None` if the handle's slot is no longer
    /// open.
    pub fn with_data<R>(&self, handle: &Handle, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let core = self.lock();
        let window = core.handles.window(handle.slot())?;
        let start = usize::from(window.start);
        Some(f(&core.image.as_bytes()[start..start + usize::from(window.len)]))
    }

    /// Writes `data` as the new contents of `slot`, creating the file
    /// or replacing it in place. Requires a prior
    /// [`enable_write`](Self::enable_write).
    pub fn write_file(&self, slot: u8, data: &[u8]) -> bool {
        self.lock().write_file(slot, data)
    }

    /// Deletes the file in `slot` and reclaims its space. Requires a
    /// prior [`enable_write`](Self::enable_write).
    pub fn delete_file(&self, slot: u8) -> bool {
        self.lock().delete_file(slot)
    }

    /// Erases the whole device, writes an empty table, and
    /// revalidates. Requires a prior
    /// [`enable_write`](Self::enable_write). This is the recovery path
    /// for an invalid table.
    pub fn format(&self) -> bool {
        self.lock().format()
    }
}

impl<D: Eeprom> Core<D> {
    fn init(&mut self) -> bool {
        if self.device.init().is_err() {
            self.status = Status::DeviceApi;
            return false;
        }
        self.hw_initialized = true;
        self.eeprom_size = self.device.size();
        if self.eeprom_size <= FIRST_FILE_ADDR {
            self.status = Status::InsufficientStorage;
            return false;
        }
        match DiskImage::allocate(self.eeprom_size) {
            Ok(image) => self.image = image,
            Err(_) => {
                self.status = Status::InsufficientMemory;
                return false;
            }
        }
        self.valid_table = self.validate();
        // a degraded table still leaves the facade usable for format
        true
    }

    /// Pulls the whole device into the mirror, returning the number of
    /// bytes read.
    fn pull(&mut self) -> u32 {
        if !self.hw_initialized {
            self.status = Status::NotInitialized;
            return 0;
        }
        if self.eeprom_size % WORD_SIZE != 0 {
            self.status = Status::WordAlignment;
            return 0;
        }
        match self.device.read(self.image.as_bytes_mut(), 0) {
            Ok(count) => {
                self.status = Status::Ok;
                count
            }
            Err(err) => {
                self.status = match err {
                    DeviceError::SizeMismatch { .. } => Status::InvalidTable,
                    DeviceError::Api => Status::DeviceApi,
                    DeviceError::Io(_) => Status::Internal,
                };
                0
            }
        }
    }

    /// Writes `len` image bytes starting at `offset` through to the
    /// device.
    fn flush(&mut self, offset: u32, len: u32) -> bool {
        if !self.hw_initialized {
            self.status = Status::NotInitialized;
            return false;
        }
        if offset % WORD_SIZE != 0 || len % WORD_SIZE != 0 {
            self.status = Status::WordAlignment;
            return false;
        }
        if offset + len > self.eeprom_size || (offset + len) as usize > self.image.len() {
            self.status = Status::InsufficientStorage;
            return false;
        }
        let bytes = &self.image.as_bytes()[offset as usize..(offset + len) as usize];
        match self.device.program(bytes, offset) {
            Ok(()) => {
                self.status = Status::Ok;
                true
            }
            Err(err) => {
                self.status = match err {
                    DeviceError::SizeMismatch { .. } => Status::InvalidTable,
                    DeviceError::Api => Status::DeviceApi,
                    DeviceError::Io(_) => Status::WriteError,
                };
                false
            }
        }
    }

    /// Serializes the table into the image prefix and flushes the
    /// entire image. Every mutation ends here; the device only ever
    /// holds complete states.
    fn flush_image(&mut self) -> bool {
        self.sync_table();
        self.flush(0, self.eeprom_size)
    }

    fn sync_table(&mut self) {
        let prefix = &mut self.image.as_bytes_mut()[..TABLE_BYTES];
        self.table.pack_into(prefix);
    }

    /// Reloads the device and checks the table and every payload.
    /// Failure leaves `bytes_used` zeroed and the table flagged
    /// invalid.
    fn validate(&mut self) -> bool {
        self.status = Status::InvalidTable;
        self.valid_table = false;
        self.active.clear();
        self.bytes_used = FIRST_FILE_ADDR;

        if self.pull() != self.eeprom_size {
            if self.status == Status::Ok {
                // a short read with no device error still invalidates
                // the table
                self.status = Status::InvalidTable;
            }
            self.bytes_used = 0;
            return false;
        }
        self.status = Status::InvalidTable;
        self.table = FileTable::unpack_from(&self.image.as_bytes()[..TABLE_BYTES]);

        let mut last_end = FIRST_FILE_ADDR;
        for slot in 0..MAX_FILES as u8 {
            let entry = self.table.get(slot);
            if entry.start_address == 0 && entry.size != 0 {
                self.bytes_used = 0;
                return false;
            }
            if entry.is_inactive() {
                continue;
            }
            if u32::from(entry.start_address) < last_end || entry.end() > self.eeprom_size {
                self.bytes_used = 0;
                return false;
            }
            self.active.insert(slot);
            last_end = entry.end();
            self.bytes_used += u32::from(entry.size);
        }

        // payloads must be printable ASCII, optionally NUL-padded at
        // the end only
        for &slot in &self.active {
            let entry = self.table.get(slot);
            let start = usize::from(entry.start_address);
            let mut nul_seen = false;
            for &byte in &self.image.as_bytes()[start..start + usize::from(entry.size)] {
                if byte == 0 {
                    nul_seen = true;
                } else if !(0x20..=0x7E).contains(&byte) {
                    self.status = Status::NonAscii;
                    self.bytes_used = 0;
                    return false;
                } else if nul_seen {
                    self.status = Status::UnexpectedNulls;
                    self.bytes_used = 0;
                    return false;
                }
            }
        }

        trace!(
            files = self.active.len(),
            bytes_used = self.bytes_used,
            "table validated"
        );
        self.status = Status::Ok;
        self.valid_table = true;
        true
    }

    fn open(&mut self, slot: u8) -> Option<Handle> {
        if !self.valid_table {
            self.status = Status::InvalidTable;
            return None;
        }
        if usize::from(slot) >= MAX_FILES {
            self.status = Status::BadParams;
            return None;
        }
        if !self.active.contains(&slot) {
            self.status = Status::FileNotFound;
            return None;
        }
        let entry = self.table.get(slot);
        Some(self.handles.open(
            slot,
            FileWindow {
                start: entry.start_address,
                len: entry.size,
            },
        ))
    }

    fn refresh_handle(&mut self, slot: u8) {
        let entry = self.table.get(slot);
        self.handles.refresh(
            slot,
            FileWindow {
                start: entry.start_address,
                len: entry.size,
            },
        );
    }

    /// Moves one file's payload by `distance` bytes and retargets its
    /// entry and handle.
    fn shift_file(&mut self, slot: u8, distance: i32) -> Result<(), Status> {
        let entry = self.table.get(slot);
        self.image.shift(
            usize::from(entry.start_address),
            usize::from(entry.size),
            distance as isize,
        )?;
        self.table.set(
            slot,
            FileEntry {
                start_address: (i32::from(entry.start_address) + distance) as u16,
                size: entry.size,
            },
        );
        self.refresh_handle(slot);
        Ok(())
    }

    fn write_file(&mut self, slot: u8, data: &[u8]) -> bool {
        if !self.valid_table {
            self.status = Status::InvalidTable;
            return false;
        }
        if !self.ready {
            self.status = Status::NotInitialized;
            return false;
        }
        if !self.write_enabled {
            self.status = Status::WriteProtected;
            return false;
        }
        if usize::from(slot) >= MAX_FILES || data.len() > usize::from(u16::MAX) {
            self.status = Status::BadParams;
            return false;
        }
        // disarm before the work so a follow-up call needs fresh arming
        self.write_enabled = false;

        if self.active.contains(&slot) {
            self.overwrite(slot, data)
        } else {
            self.insert(slot, data)
        }
    }

    /// Places a new file according to its slot's position among the
    /// active ids, shifting every later payload right to make room.
    fn insert(&mut self, slot: u8, data: &[u8]) -> bool {
        let len = data.len() as u32;
        if len + self.bytes_used > self.eeprom_size {
            self.status = Status::InsufficientStorage;
            return false;
        }

        let start = match self.active.range(..slot).next_back() {
            Some(&prev) => self.table.get(prev).end(),
            None => FIRST_FILE_ADDR,
        };
        // later files move first, tail to head, so nothing collides
        let movers: Vec<u8> = self.active.range(slot..).rev().copied().collect();
        for mover in movers {
            if let Err(status) = self.shift_file(mover, len as i32) {
                self.status = status;
                return false;
            }
        }

        trace!(slot, start, len, "inserting file");
        self.table.set(
            slot,
            FileEntry {
                start_address: start as u16,
                size: len as u16,
            },
        );
        self.image.as_bytes_mut()[start as usize..start as usize + data.len()]
            .copy_from_slice(data);
        self.active.insert(slot);
        self.bytes_used += len;
        self.refresh_handle(slot);
        self.flush_image()
    }

    /// Replaces an existing file's contents, shifting every later
    /// payload by the size delta.
    fn overwrite(&mut self, slot: u8, data: &[u8]) -> bool {
        let len = data.len() as u32;
        let old = self.table.get(slot);
        if self.bytes_used - u32::from(old.size) + len > self.eeprom_size {
            self.status = Status::InsufficientStorage;
            return false;
        }

        // erase first so a shrink leaves no stale tail bytes behind
        self.image
            .fill(usize::from(old.start_address), usize::from(old.size), 0xFF);

        let delta = len as i32 - i32::from(old.size);
        if delta < 0 {
            let movers: Vec<u8> = self.active.range(slot + 1..).copied().collect();
            for mover in movers {
                if let Err(status) = self.shift_file(mover, delta) {
                    self.status = status;
                    return false;
                }
            }
        } else if delta > 0 {
            let movers: Vec<u8> = self.active.range(slot + 1..).rev().copied().collect();
            for mover in movers {
                if let Err(status) = self.shift_file(mover, delta) {
                    self.status = status;
                    return false;
                }
            }
        }

        trace!(slot, start = old.start_address, len, delta, "replacing file");
        self.table.set(
            slot,
            FileEntry {
                start_address: old.start_address,
                size: len as u16,
            },
        );
        self.image.as_bytes_mut()
            [usize::from(old.start_address)..usize::from(old.start_address) + data.len()]
            .copy_from_slice(data);
        self.bytes_used = (i64::from(self.bytes_used) + i64::from(delta)) as u32;
        self.refresh_handle(slot);
        self.flush_image()
    }

    fn delete_file(&mut self, slot: u8) -> bool {
        if !self.valid_table {
            self.status = Status::InvalidTable;
            return false;
        }
        if !self.ready {
            self.status = Status::NotInitialized;
            return false;
        }
        if !self.write_enabled {
            self.status = Status::WriteProtected;
            return false;
        }
        if usize::from(slot) >= MAX_FILES {
            self.status = Status::BadParams;
            return false;
        }
        self.write_enabled = false;

        if !self.active.contains(&slot) {
            self.status = Status::FileNotFound;
            return false;
        }

        let entry = self.table.get(slot);
        if entry.size == 0 {
            // pathological active-but-empty entry: demote quietly
            self.table.set(slot, FileEntry::default());
            self.active.remove(&slot);
            self.refresh_handle(slot);
            return true;
        }

        debug!(slot, size = entry.size, "deleting file");
        self.image
            .fill(usize::from(entry.start_address), usize::from(entry.size), 0xFF);
        self.bytes_used -= u32::from(entry.size);
        self.table.set(slot, FileEntry::default());
        self.refresh_handle(slot);

        // close the gap: everything after the victim slides left
        let movers: Vec<u8> = self.active.range(slot + 1..).copied().collect();
        for mover in movers {
            if let Err(status) = self.shift_file(mover, -i32::from(entry.size)) {
                self.status = status;
                return false;
            }
        }
        self.active.remove(&slot);
        self.flush_image()
    }

    fn format(&mut self) -> bool {
        if !self.hw_initialized {
            self.status = Status::NotInitialized;
            return false;
        }
        if !self.write_enabled {
            self.status = Status::WriteProtected;
            return false;
        }
        self.write_enabled = false;

        debug!("formatting device");
        if !self.erase_all() {
            return false;
        }
        self.valid_table = self.validate();
        self.valid_table
    }

    /// Mass-erases the device and writes out an all-inactive table.
    fn erase_all(&mut self) -> bool {
        if self.device.mass_erase().is_err() {
            self.status = Status::DeviceApi;
            return false;
        }
        self.bytes_used = FIRST_FILE_ADDR;
        self.table.clear();
        self.sync_table();
        let written = self.flush(0, TABLE_BYTES as u32);
        if !written {
            self.bytes_used = 0;
        }
        written
    }
}

#[cfg(test)]
use crate::device::FileEeprom;

#[cfg(test)]
const TEST_SIZE: u32 = 2048;

#[cfg(test)]
fn test_fs(dir: &tempfile::TempDir) -> EepromFs<FileEeprom> {
    EepromFs::new(FileEeprom::new(dir.path().join("nonvolatile.bin"), TEST_SIZE))
}

/// Printable payload of exactly `len` bytes, ending in one NUL.
#[cfg(test)]
fn text_payload(len: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = (0..len - 1).map(|i| b' ' + (i % 95) as u8).collect();
    buf.push(0);
    buf
}

/// Parses one table entry straight out of the backing file, checking
/// the persisted layout rather than the in-memory state.
#[cfg(test)]
fn stored_entry(dir: &tempfile::TempDir, slot: usize) -> (u16, u16) {
    let raw = std::fs::read(dir.path().join("nonvolatile.bin")).unwrap();
    let at = slot * table::ENTRY_BYTES;
    (
        u16::from_le_bytes([raw[at], raw[at + 1]]),
        u16::from_le_bytes([raw[at + 2], raw[at + 3]]),
    )
}

/// Builds a backing file by hand: zeroed table, `0xFF` payload region,
/// then the given entries and payload bytes.
#[cfg(test)]
fn raw_device(
    dir: &tempfile::TempDir,
    entries: &[(usize, u16, u16)],
    payloads: &[(usize, &[u8])],
) {
    let mut raw = vec![0xFFu8; TEST_SIZE as usize];
    raw[..TABLE_BYTES].fill(0);
    for &(slot, start, size) in entries {
        let at = slot * table::ENTRY_BYTES;
        raw[at..at + 2].copy_from_slice(&start.to_le_bytes());
        raw[at + 2..at + 4].copy_from_slice(&size.to_le_bytes());
    }
    for &(at, bytes) in payloads {
        raw[at..at + bytes.len()].copy_from_slice(bytes);
    }
    std::fs::write(dir.path().join("nonvolatile.bin"), raw).unwrap();
}

#[test]
fn test_fresh_device_needs_format() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::InvalidTable);
    assert_eq!(fs.used_capacity(), 0);
    assert_eq!(fs.active_file_count(), 0);

    fs.enable_write();
    assert!(fs.format());
    assert_eq!(fs.status(), Status::Ok);
    assert_eq!(fs.active_file_count(), 0);
    assert_eq!(fs.used_capacity(), FIRST_FILE_ADDR);
    assert_eq!(fs.total_capacity(), TEST_SIZE);
}

#[test]
fn test_insert_overwrite_delete_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    fs.enable_write();
    assert!(fs.format());

    // first file lands right after the table
    fs.enable_write();
    assert!(fs.write_file(0, b"Hello, World!\0"));
    assert_eq!(stored_entry(&dir, 0), (80, 14));
    assert_eq!(fs.used_capacity(), 94);

    // appending to a later slot goes after the last file
    let p2 = text_payload(80);
    fs.enable_write();
    assert!(fs.write_file(2, &p2));
    assert_eq!(stored_entry(&dir, 0), (80, 14));
    assert_eq!(stored_entry(&dir, 2), (94, 80));
    assert_eq!(fs.used_capacity(), 174);

    // a slot between two active ones pushes the tail right
    let p1 = text_payload(56);
    fs.enable_write();
    assert!(fs.write_file(1, &p1));
    assert_eq!(stored_entry(&dir, 0), (80, 14));
    assert_eq!(stored_entry(&dir, 1), (94, 56));
    assert_eq!(stored_entry(&dir, 2), (150, 80));
    assert_eq!(fs.used_capacity(), 230);
    assert_eq!(
        fs.active_files(),
        BTreeMap::from([(0u8, 14u16), (1, 56), (2, 80)])
    );

    // same-length replacement leaves the layout alone
    fs.enable_write();
    assert!(fs.write_file(0, b"Puppy kibble!\0"));
    assert_eq!(stored_entry(&dir, 0), (80, 14));
    assert_eq!(stored_entry(&dir, 2), (150, 80));
    assert_eq!(fs.used_capacity(), 230);
    let h0 = fs.open(0).unwrap();
    assert_eq!(
        fs.with_data(&h0, |b| b.to_vec()).unwrap(),
        b"Puppy kibble!\0"
    );
    fs.close(0);

    // deleting the first file slides everything left, retargeting the
    // open handle for slot 1
    let h1 = fs.open(1).unwrap();
    fs.enable_write();
    assert!(fs.delete_file(0));
    assert_eq!(stored_entry(&dir, 0), (0, 0));
    assert_eq!(stored_entry(&dir, 1), (80, 56));
    assert_eq!(stored_entry(&dir, 2), (136, 80));
    assert_eq!(fs.used_capacity(), 216);
    assert_eq!(fs.with_data(&h1, |b| b.to_vec()).unwrap(), p1);

    // a new slot-0 write pushes slot 1 right again; the handle follows
    let p0 = text_payload(30);
    fs.enable_write();
    assert!(fs.write_file(0, &p0));
    assert_eq!(stored_entry(&dir, 1), (110, 56));
    assert_eq!(fs.with_data(&h1, |b| b.to_vec()).unwrap(), p1);
    assert_eq!(fs.with_data(&h1, |b| b.len()).unwrap(), 56);
    fs.close(1);
}

#[test]
fn test_grow_and_shrink_in_the_middle() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    fs.enable_write();
    assert!(fs.format());
    for (slot, len) in [(3u8, 20usize), (5, 30), (9, 40)] {
        fs.enable_write();
        assert!(fs.write_file(slot, &text_payload(len)));
    }
    assert_eq!(stored_entry(&dir, 5), (100, 30));
    assert_eq!(stored_entry(&dir, 9), (130, 40));

    // grow the middle file: only the tail moves
    fs.enable_write();
    assert!(fs.write_file(5, &text_payload(50)));
    assert_eq!(stored_entry(&dir, 3), (80, 20));
    assert_eq!(stored_entry(&dir, 5), (100, 50));
    assert_eq!(stored_entry(&dir, 9), (150, 40));
    assert_eq!(fs.used_capacity(), 80 + 20 + 50 + 40);

    // shrink it back down
    fs.enable_write();
    assert!(fs.write_file(5, &text_payload(10)));
    assert_eq!(stored_entry(&dir, 5), (100, 10));
    assert_eq!(stored_entry(&dir, 9), (110, 40));
    assert_eq!(fs.used_capacity(), 80 + 20 + 10 + 40);

    // the vacated region holds erased bytes, nothing leaks
    let raw = std::fs::read(dir.path().join("nonvolatile.bin")).unwrap();
    assert!(raw[150..2048].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_reload_sees_identical_state() {
    let dir = tempfile::tempdir().unwrap();
    let p3 = text_payload(33);
    let p7 = text_payload(120);
    {
        let fs = test_fs(&dir);
        fs.enable_write();
        assert!(fs.format());
        fs.enable_write();
        assert!(fs.write_file(7, &p7));
        fs.enable_write();
        assert!(fs.write_file(3, &p3));
    }
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::Ok);
    assert_eq!(fs.active_files(), BTreeMap::from([(3u8, 33u16), (7, 120)]));
    assert_eq!(fs.used_capacity(), 80 + 33 + 120);
    let h7 = fs.open(7).unwrap();
    assert_eq!(fs.with_data(&h7, |b| b.to_vec()).unwrap(), p7);
    fs.close(7);
}

#[test]
fn test_out_of_range_slot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    fs.enable_write();
    assert!(fs.format());

    fs.enable_write();
    assert!(!fs.write_file(MAX_FILES as u8, b"nope\0"));
    assert_eq!(fs.status(), Status::BadParams);
    assert_eq!(fs.active_file_count(), 0);
    // a bounds failure happens before the fuse is consumed
    assert!(fs.write_file(0, b"ok\0"));
}

#[test]
fn test_capacity_overflow_by_one_byte() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    fs.enable_write();
    assert!(fs.format());

    let max = (TEST_SIZE - FIRST_FILE_ADDR) as usize;
    fs.enable_write();
    assert!(!fs.write_file(0, &text_payload(max + 1)));
    assert_eq!(fs.status(), Status::InsufficientStorage);
    assert_eq!(fs.used_capacity(), FIRST_FILE_ADDR);
    assert_eq!(fs.active_file_count(), 0);

    fs.enable_write();
    assert!(fs.write_file(0, &text_payload(max)));
    assert_eq!(fs.used_capacity(), TEST_SIZE);
}

#[test]
fn test_write_fuse_is_single_shot() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    fs.enable_write();
    assert!(fs.format());

    assert!(!fs.write_file(0, b"unarmed\0"));
    assert_eq!(fs.status(), Status::WriteProtected);

    fs.enable_write();
    assert!(fs.write_file(0, b"armed\0"));
    assert!(!fs.write_file(1, b"stale\0"));
    assert_eq!(fs.status(), Status::WriteProtected);
    assert_eq!(fs.active_file_count(), 1);

    // a capacity query disarms too
    fs.enable_write();
    let _ = fs.total_capacity();
    assert!(!fs.delete_file(0));
    assert_eq!(fs.status(), Status::WriteProtected);

    // a failed delete still consumes the arming
    fs.enable_write();
    assert!(!fs.delete_file(9));
    assert_eq!(fs.status(), Status::FileNotFound);
    assert!(!fs.delete_file(0));
    assert_eq!(fs.status(), Status::WriteProtected);
}

#[test]
fn test_corrupt_tables_are_rejected_until_format() {
    let dir = tempfile::tempdir().unwrap();
    // entry claims start=0 with a size: structurally corrupt
    raw_device(&dir, &[(4, 0, 12)], &[]);
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::InvalidTable);
    assert_eq!(fs.used_capacity(), 0);
    assert!(fs.open(4).is_none());
    assert_eq!(fs.status(), Status::InvalidTable);

    fs.enable_write();
    assert!(!fs.write_file(0, b"blocked\0"));
    assert_eq!(fs.status(), Status::InvalidTable);

    fs.enable_write();
    assert!(fs.format());
    assert_eq!(fs.status(), Status::Ok);
    assert_eq!(fs.used_capacity(), FIRST_FILE_ADDR);
}

#[test]
fn test_overlapping_entries_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    raw_device(
        &dir,
        &[(0, 80, 20), (1, 90, 10)],
        &[(80, b"aaaaaaaaaaaaaaaaaaa\0")],
    );
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::InvalidTable);

    // out-of-bounds end is just as bad
    raw_device(&dir, &[(0, 2040, 16)], &[]);
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::InvalidTable);
}

#[test]
fn test_validator_rejects_bad_payload_bytes() {
    let dir = tempfile::tempdir().unwrap();
    raw_device(&dir, &[(0, 80, 4)], &[(80, &[0x01, b'a', 0, 0])]);
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::NonAscii);

    raw_device(&dir, &[(0, 80, 4)], &[(80, &[b'a', 0, b'b', 0])]);
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::UnexpectedNulls);

    // trailing NUL run is fine
    raw_device(&dir, &[(0, 80, 4)], &[(80, &[b'a', b'b', 0, 0])]);
    let fs = test_fs(&dir);
    assert_eq!(fs.status(), Status::Ok);
}

#[test]
fn test_open_close_reference_counting() {
    let dir = tempfile::tempdir().unwrap();
    let fs = test_fs(&dir);
    fs.enable_write();
    assert!(fs.format());
    fs.enable_write();
    assert!(fs.write_file(6, b"shared\0"));

    let first = fs.open(6).unwrap();
    let second = fs.open(6).unwrap();
    fs.close(6);
    // one reference remains, both handles still resolve
    assert_eq!(fs.with_data(&first, |b| b.to_vec()).unwrap(), b"shared\0");
    assert_eq!(fs.with_data(&second, |b| b.len()).unwrap(), 7);
    fs.close(6);
    assert!(fs.with_data(&first, |b| b.len()).is_none());

    assert!(fs.open(11).is_none());
    assert_eq!(fs.status(), Status::FileNotFound);
    assert!(fs.open(MAX_FILES as u8).is_none());
    assert_eq!(fs.status(), Status::BadParams);
}

#[cfg(test)]
struct FlakyDevice {
    data: Vec<u8>,
    fail_program: bool,
    fail_init: bool,
}

#[cfg(test)]
impl FlakyDevice {
    fn formatted(size: u32) -> Self {
        let mut data = vec![0xFFu8; size as usize];
        data[..TABLE_BYTES.min(size as usize)].fill(0);
        Self {
            data,
            fail_program: false,
            fail_init: false,
        }
    }
}

#[cfg(test)]
impl Eeprom for FlakyDevice {
    fn init(&mut self) -> Result<(), DeviceError> {
        if self.fail_init {
            return Err(DeviceError::Api);
        }
        Ok(())
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<u32, DeviceError> {
        let offset = offset as usize;
        let len = dst.len().min(self.data.len() - offset);
        dst[..len].copy_from_slice(&self.data[offset..offset + len]);
        Ok(len as u32)
    }

    fn program(&mut self, src: &[u8], offset: u32) -> Result<(), DeviceError> {
        if self.fail_program {
            return Err(DeviceError::Io(std::io::Error::other("nack")));
        }
        let offset = offset as usize;
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), DeviceError> {
        self.data.fill(0xFF);
        Ok(())
    }
}

#[test]
fn test_program_failure_fails_the_mutation() {
    let mut device = FlakyDevice::formatted(512);
    device.fail_program = true;
    let fs = EepromFs::new(device);
    assert_eq!(fs.status(), Status::Ok);

    fs.enable_write();
    assert!(!fs.write_file(0, b"doomed\0"));
    assert_eq!(fs.status(), Status::WriteError);
}

#[test]
fn test_device_init_failure_degrades_facade() {
    let mut device = FlakyDevice::formatted(512);
    device.fail_init = true;
    let fs = EepromFs::new(device);
    assert_eq!(fs.status(), Status::DeviceApi);

    fs.enable_write();
    assert!(!fs.write_file(0, b"nope\0"));
    // the table never validated, so mutations report that first
    assert_eq!(fs.status(), Status::InvalidTable);
}

#[test]
fn test_undersized_device_is_unusable() {
    let fs = EepromFs::new(FlakyDevice::formatted(80));
    assert_eq!(fs.status(), Status::InsufficientStorage);
    assert_eq!(fs.total_capacity(), 80);
    fs.enable_write();
    assert!(!fs.write_file(0, b"x\0"));
    assert_eq!(fs.status(), Status::InvalidTable);
}
