//! The volatile mirror of the entire device.

use std::collections::TryReserveError;

use super::table::FIRST_FILE_ADDR;
use super::Status;

/// RAM copy of the device contents. The backing store is a `Vec<u32>`
/// because the device transfers whole words and requires word-aligned
/// buffers; byte views are produced over the word storage.
#[derive(Debug)]
pub(crate) struct DiskImage {
    words: Vec<u32>,
    len: usize,
}

impl DiskImage {
    /// A zero-length image, the state before the device geometry is
    /// known.
    pub fn empty() -> Self {
        Self {
            words: Vec::new(),
            len: 0,
        }
    }

    /// Allocates a mirror for a `size`-byte device. Allocation failure
    /// is reported rather than aborting, so the facade can surface it
    /// as a status.
    pub fn allocate(size: u32) -> Result<Self, TryReserveError> {
        let size = size as usize;
        let word_count = size.div_ceil(4);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count)?;
        words.resize(word_count, 0);
        Ok(Self { words, len: size })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        // a u32 buffer is always a valid byte buffer
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    /// Overwrites `len` bytes starting at `start` with `byte`.
    pub fn fill(&mut self, start: usize, len: usize, byte: u8) {
        self.as_bytes_mut()[start..start + len].fill(byte);
    }

    /// Moves `size` bytes starting at `head` by `distance` bytes
    /// (positive moves toward the end of the image). Vacated positions
    /// are filled with `0xFF` so no payload bytes linger. The copy runs
    /// from the tail when moving right and from the head when moving
    /// left, so overlapping source and destination never corrupt the
    /// data.
    pub fn shift(&mut self, head: usize, size: usize, distance: isize) -> Result<(), Status> {
        if size == 0 || distance == 0 {
            return Ok(());
        }
        if head > self.len || head + size > self.len {
            return Err(Status::Internal);
        }
        if distance > 0 {
            let tail = head + size - 1;
            if tail + distance as usize >= self.len {
                return Err(Status::InsufficientStorage);
            }
        } else {
            let magnitude = distance.unsigned_abs();
            if head < magnitude || head - magnitude < FIRST_FILE_ADDR as usize {
                return Err(Status::Internal);
            }
        }

        let bytes = self.as_bytes_mut();
        if distance > 0 {
            for i in (0..size).rev() {
                let src = head + i;
                let dst = src.wrapping_add_signed(distance);
                bytes[dst] = bytes[src];
                bytes[src] = 0xFF;
            }
        } else {
            for i in 0..size {
                let src = head + i;
                let dst = src.wrapping_add_signed(distance);
                bytes[dst] = bytes[src];
                bytes[src] = 0xFF;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn patterned_image() -> DiskImage {
    let mut image = DiskImage::allocate(128).unwrap();
    image.fill(0, 128, 0xFF);
    image.as_bytes_mut()[80..90].copy_from_slice(b"0123456789");
    image
}

#[test]
fn test_shift_right_backfills_with_erased_bytes() {
    let mut image = patterned_image();
    image.shift(80, 10, 6).unwrap();
    assert_eq!(&image.as_bytes()[86..96], b"0123456789");
    assert_eq!(&image.as_bytes()[80..86], &[0xFF; 6]);
}

#[test]
fn test_shift_left_restores_position() {
    let mut image = patterned_image();
    image.shift(80, 10, 20).unwrap();
    image.shift(100, 10, -20).unwrap();
    assert_eq!(&image.as_bytes()[80..90], b"0123456789");
    assert_eq!(&image.as_bytes()[90..110], &[0xFF; 20]);
}

#[test]
fn test_shift_overlapping_distance() {
    // distance smaller than the block, both directions
    let mut image = patterned_image();
    image.shift(80, 10, 3).unwrap();
    assert_eq!(&image.as_bytes()[83..93], b"0123456789");
    image.shift(83, 10, -3).unwrap();
    assert_eq!(&image.as_bytes()[80..90], b"0123456789");
}

#[test]
fn test_shift_past_end_is_rejected() {
    let mut image = patterned_image();
    let err = image.shift(80, 10, 48).unwrap_err();
    assert_eq!(err, Status::InsufficientStorage);
    // a rejected shift leaves the image untouched
    assert_eq!(&image.as_bytes()[80..90], b"0123456789");
}

#[test]
fn test_shift_into_table_region_is_rejected() {
    let mut image = patterned_image();
    let err = image.shift(80, 10, -1).unwrap_err();
    assert_eq!(err, Status::Internal);
}

#[test]
fn test_byte_views_cover_whole_device() {
    let image = DiskImage::allocate(2048).unwrap();
    assert_eq!(image.len(), 2048);
    assert_eq!(image.as_bytes().len(), 2048);
    assert_eq!(DiskImage::empty().as_bytes().len(), 0);
}
