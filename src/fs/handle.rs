//! Reference-counted, relocation-tracking file handles.
//!
//! Callers hold an opaque [`Handle`] naming a slot; every dereference
//! goes through the facade, which looks up the slot's current payload
//! window here. Mutations that move or resize a file refresh the
//! window, so a handle opened before a relocation stays valid after it.

use std::collections::BTreeMap;

/// A task's reference to an open file. Obtained from `open`, returned
/// to the system with `close`. Handles for the same slot alias: every
/// holder observes the same live payload window.
#[derive(Debug)]
pub struct Handle {
    slot: u8,
}

impl Handle {
    pub fn slot(&self) -> u8 {
        self.slot
    }
}

/// Current location of a slot's payload inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileWindow {
    pub start: u16,
    pub len: u16,
}

#[derive(Debug)]
struct Manager {
    refs: u32,
    window: FileWindow,
}

/// Per-slot managers for every file some task currently has open.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    managers: BTreeMap<u8, Manager>,
}

impl HandleTable {
    /// Registers one more reader of `slot`. The first open creates the
    /// manager; later opens share it.
    pub fn open(&mut self, slot: u8, window: FileWindow) -> Handle {
        self.managers
            .entry(slot)
            .and_modify(|m| m.refs += 1)
            .or_insert(Manager { refs: 1, window });
        Handle { slot }
    }

    /// Drops one reference; the manager dies with the last one.
    pub fn close(&mut self, slot: u8) {
        if let Some(manager) = self.managers.get_mut(&slot) {
            if manager.refs > 0 {
                manager.refs -= 1;
            }
            if manager.refs == 0 {
                self.managers.remove(&slot);
            }
        }
    }

    /// Retargets the slot's window after its entry changed. A slot
    /// nobody has open is a no-op.
    pub fn refresh(&mut self, slot: u8, window: FileWindow) {
        if let Some(manager) = self.managers.get_mut(&slot) {
            manager.window = window;
        }
    }

    pub fn window(&self, slot: u8) -> Option<FileWindow> {
        self.managers.get(&slot).map(|m| m.window)
    }
}

#[test]
fn test_handles_alias_and_refcount() {
    let mut handles = HandleTable::default();
    let window = FileWindow { start: 80, len: 14 };
    let first = handles.open(3, window);
    let second = handles.open(3, window);
    assert_eq!(first.slot(), second.slot());
    handles.close(3);
    assert_eq!(handles.window(3), Some(window));
    handles.close(3);
    assert_eq!(handles.window(3), None);
}

#[test]
fn test_refresh_moves_the_window() {
    let mut handles = HandleTable::default();
    let _handle = handles.open(1, FileWindow { start: 94, len: 56 });
    handles.refresh(1, FileWindow { start: 80, len: 56 });
    assert_eq!(handles.window(1), Some(FileWindow { start: 80, len: 56 }));
    // unmanaged slots are ignored
    handles.refresh(9, FileWindow { start: 0, len: 0 });
    assert_eq!(handles.window(9), None);
}
