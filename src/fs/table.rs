//! The fixed-slot file table persisted in the first bytes of the
//! device.

use packed_struct::prelude::*;

/// Number of file slots. Slots are the sole namespace; there are no
/// file names.
pub const MAX_FILES: usize = 20;

/// Packed size of one table entry.
pub const ENTRY_BYTES: usize = 4;

/// The table occupies this many bytes at the start of the device.
pub const TABLE_BYTES: usize = MAX_FILES * ENTRY_BYTES;

/// First byte a payload may occupy.
pub const FIRST_FILE_ADDR: u32 = TABLE_BYTES as u32;

/// One slot's persisted entry. A slot is inactive iff both fields are
/// zero; `start_address == 0` with a non-zero `size` marks a corrupt
/// table.
#[derive(PackedStruct, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct FileEntry {
    pub start_address: u16,
    pub size: u16,
}

impl FileEntry {
    pub fn is_inactive(&self) -> bool {
        self.start_address == 0 && self.size == 0
    }

    pub fn end(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.size)
    }
}

/// The structured view of the table. Serialized into the image prefix
/// on every flush and parsed back from it on every load, so the packed
/// little-endian layout never leaks past this module.
#[derive(Debug)]
pub(crate) struct FileTable {
    entries: [FileEntry; MAX_FILES],
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            entries: [FileEntry::default(); MAX_FILES],
        }
    }

    pub fn get(&self, slot: u8) -> FileEntry {
        self.entries[usize::from(slot)]
    }

    pub fn set(&mut self, slot: u8, entry: FileEntry) {
        self.entries[usize::from(slot)] = entry;
    }

    pub fn clear(&mut self) {
        self.entries = [FileEntry::default(); MAX_FILES];
    }

    /// Serializes every entry into `prefix`, which must be the first
    /// [`TABLE_BYTES`] of the image.
    pub fn pack_into(&self, prefix: &mut [u8]) {
        for (i, entry) in self.entries.iter().enumerate() {
            // infallible for a fixed-layout struct
            let packed = entry.pack().unwrap();
            prefix[i * ENTRY_BYTES..(i + 1) * ENTRY_BYTES].copy_from_slice(&packed);
        }
    }

    pub fn unpack_from(prefix: &[u8]) -> Self {
        let mut table = Self::new();
        for (i, entry) in table.entries.iter_mut().enumerate() {
            *entry =
                FileEntry::unpack_from_slice(&prefix[i * ENTRY_BYTES..(i + 1) * ENTRY_BYTES])
                    .unwrap();
        }
        table
    }
}

#[test]
fn test_entry_packs_little_endian() {
    let entry = FileEntry {
        start_address: 0x1234,
        size: 0xABCD,
    };
    assert_eq!(entry.pack().unwrap(), [0x34, 0x12, 0xCD, 0xAB]);
    let back = FileEntry::unpack_from_slice(&[0x34, 0x12, 0xCD, 0xAB]).unwrap();
    assert_eq!(back, entry);
}

#[test]
fn test_table_round_trip() {
    let mut table = FileTable::new();
    table.set(
        0,
        FileEntry {
            start_address: 80,
            size: 14,
        },
    );
    table.set(
        19,
        FileEntry {
            start_address: 94,
            size: 300,
        },
    );
    let mut prefix = [0u8; TABLE_BYTES];
    table.pack_into(&mut prefix);
    let parsed = FileTable::unpack_from(&prefix);
    assert_eq!(parsed.get(0), table.get(0));
    assert_eq!(parsed.get(19), table.get(19));
    assert!(parsed.get(7).is_inactive());
}

#[test]
fn test_entry_classification() {
    assert!(FileEntry::default().is_inactive());
    let corrupt = FileEntry {
        start_address: 0,
        size: 5,
    };
    assert!(!corrupt.is_inactive());
    let active = FileEntry {
        start_address: 80,
        size: 5,
    };
    assert_eq!(active.end(), 85);
}
