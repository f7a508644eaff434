// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-mapped device files
//!
//! UIO register windows and u-dma-buf buffer memory are both plain files
//! that are mapped with `mmap`. Unsafe code is confined to this module and to
//! the slice views in [`crate::buffer`].

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{Result, ToyNetError};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;

/// Shared mapping of a device file
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    label: String,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("label", &self.label)
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively; mmap'd memory is
// process-wide, so moving the owner between threads keeps it valid.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - register access is volatile and bounds-checked; buffer views
// are handed out only through DmaRegion, which owns disjoint sub-ranges.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `size` bytes of `path` starting at `offset`.
    ///
    /// `sync` opens the file with `O_SYNC`, which u-dma-buf uses to select an
    /// uncached mapping.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or mapped.
    pub fn map(path: &Path, size: usize, offset: u64, sync: bool) -> Result<Self> {
        if size == 0 {
            return Err(ToyNetError::load(format!(
                "{}: refusing to map an empty region",
                path.display()
            )));
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if sync {
            #[allow(clippy::cast_possible_wrap)]
            options.custom_flags(rustix::fs::OFlags::SYNC.bits() as i32);
        }
        let file = options
            .open(path)
            .map_err(|e| ToyNetError::load(format!("Cannot open {}: {e}", path.display())))?;

        // SAFETY: fd was just opened read/write; size is non-zero; MAP_SHARED
        // because the memory is shared with the device; the file is kept in
        // the struct for the lifetime of the mapping and unmapped in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| ToyNetError::load(format!("mmap {} failed: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| ToyNetError::load(format!("mmap {} returned null", path.display())))?;

        tracing::debug!("Mapped {} ({size:#x} bytes at {ptr:p})", path.display());

        Ok(Self {
            ptr,
            size,
            _file: file,
            label: path.display().to_string(),
        })
    }

    /// Read a 32-bit register
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped region size.
    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: ptr valid for self.size bytes; offset+4 <= size; u32 aligned.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    /// Write a 32-bit register
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped region size.
    pub fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: ptr valid for self.size bytes; offset+4 <= size; u32 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value);
        }
    }

    /// Base pointer of the mapping
    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Path the mapping was created from
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in map(); Drop runs once.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {}", self.label);
    }
}

/// Read a sysfs attribute holding a decimal or `0x`-prefixed hex number.
///
/// # Errors
///
/// Returns error if the attribute is missing or not a number.
pub fn read_sysfs_number(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ToyNetError::load(format!("Cannot read {}: {e}", path.display())))?;
    parse_number(text.trim())
        .ok_or_else(|| ToyNetError::load(format!("{}: not a number: {:?}", path.display(), text.trim())))
}

fn parse_number(text: &str) -> Option<u64> {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .map_or_else(|| text.parse().ok(), |hex| u64::from_str_radix(hex, 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(parse_number("0x1000"), Some(4096));
        assert_eq!(parse_number("4096"), Some(4096));
        assert_eq!(parse_number("0x7f000000"), Some(0x7f00_0000));
        assert_eq!(parse_number("bogus"), None);
    }

    #[test]
    fn sysfs_attribute_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0x00010000").unwrap();
        assert_eq!(read_sysfs_number(file.path()).unwrap(), 0x1_0000);
    }

    #[test]
    fn map_regular_file_roundtrip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        let region = MappedRegion::map(file.path(), 4096, 0, false).unwrap();
        region.write32(8, 0xDEAD_BEEF);
        assert_eq!(region.read32(8), 0xDEAD_BEEF);
        assert_eq!(region.size(), 4096);
    }

    #[test]
    fn empty_map_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(MappedRegion::map(file.path(), 0, 0, false).is_err());
    }
}
