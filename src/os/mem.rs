use std::{
    fs::{self, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
    ptr::{self, NonNull},
};

use libc::{
    madvise, mmap, munmap, MADV_DONTNEED, MADV_NORMAL, MADV_REMOVE, MAP_FAILED, MAP_PRIVATE,
    MAP_SHARED, PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;

use crate::{
    config::MapFileMode,
    util::{hint::cold, num::round_up},
};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// Advice we hand to `madvise()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Remove,
    DontNeed,
}

impl Advice {
    fn as_raw(self) -> libc::c_int {
        match self {
            Advice::Normal => MADV_NORMAL,
            Advice::Remove => MADV_REMOVE,
            Advice::DontNeed => MADV_DONTNEED,
        }
    }
}

/// A read/write mapping of a file. The file is created (replacing one left
/// over from a process with the same pid), sized, and then either
/// unlinked or kept depending on the [`MapFileMode`]. Unmapped on drop; a kept
/// file is removed on drop too.
pub struct MapFile {
    ptr: NonNull<u8>,
    size: usize,
    path: PathBuf,
    linked: bool,
}

// SAFETY: `MapFile` owns its mapping outright, the same way a `Box<[u8]>`
//         would own its allocation.
unsafe impl Send for MapFile {}
unsafe impl Sync for MapFile {}

impl MapFile {
    /// Map `size` bytes (rounded up to whole pages) of the file at `path`.
    ///
    /// # Errors
    /// - If the file can't be created, or sized, or mapped
    pub fn open(path: &Path, size: usize, mode: MapFileMode) -> io::Result<MapFile> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attempted to map 0 bytes",
            ));
        }
        let size = round_up(size, *PAGE_SIZE);
        let file = match create_new(path) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // left over from an earlier process with the same pid
                log::debug!("replacing stale {}", path.display());
                fs::remove_file(path)?;
                create_new(path)?
            }
            result => result?,
        };
        if let Err(err) = file.set_len(size as u64) {
            let _ = fs::remove_file(path);
            return Err(err);
        }

        let linked = mode == MapFileMode::Shared;
        if !linked {
            fs::remove_file(path)?;
        }

        let flags = if mode.is_shared() {
            MAP_SHARED
        } else {
            MAP_PRIVATE
        };
        // SAFETY:
        // - We pass a null hint, so the kernel picks the address
        // - `file` is open read/write for the duration of the call, and the
        //   mapping keeps its own reference to it after we close the fd
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == MAP_FAILED {
            return cold(|| {
                let err = io::Error::last_os_error();
                if linked {
                    let _ = fs::remove_file(path);
                }
                Err(err)
            });
        }
        // `mmap()` never hands out the zero page on success
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap() returned null"))?;

        Ok(MapFile {
            ptr,
            size,
            path: path.to_owned(),
            linked,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Is `addr` inside this mapping?
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        (start..start + self.size).contains(&addr)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The mapping is `size` bytes, readable, and lives as long as
        //         `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As for `as_slice()`, and `&mut self` makes this unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// `madvise()` the byte range `offset..offset + len`. Failures are not
    /// interesting to the caller (e.g. `MADV_REMOVE` on a private mapping), so
    /// they're only logged.
    pub fn advise(&self, offset: usize, len: usize, advice: Advice) {
        if len == 0 || offset.checked_add(len).map_or(true, |end| end > self.size) {
            log::warn!("madvise() range {offset}+{len} outside of {}", self.path.display());
            return;
        }
        // SAFETY: The range is inside our mapping (checked above), and
        //         `offset` is page aligned by every caller.
        let result = unsafe { madvise(self.ptr.as_ptr().add(offset).cast(), len, advice.as_raw()) };
        if result != 0 {
            log::trace!(
                "madvise({advice:?}) on {} failed: {}",
                self.path.display(),
                io::Error::last_os_error()
            );
        }
    }
}

fn create_new(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
}

impl Drop for MapFile {
    fn drop(&mut self) {
        // SAFETY:
        // - `ptr` came from `mmap()` and is page-aligned
        // - `size` is exactly what we mapped, and nobody else unmaps it
        unsafe {
            munmap(self.ptr.as_ptr().cast(), self.size);
        }
        if self.linked {
            if let Err(err) = fs::remove_file(&self.path) {
                log::debug!("could not remove {}: {err}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zeroed_and_page_sized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeroed");
        let map = MapFile::open(&path, 100, MapFileMode::SharedUnlinked).unwrap();
        assert_eq!(map.len(), *PAGE_SIZE);
        assert!(map.as_slice().iter().all(|&b| b == 0));
        assert!(!path.exists());
    }

    #[test]
    fn kept_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept");
        let mut map = MapFile::open(&path, *PAGE_SIZE * 2, MapFileMode::Shared).unwrap();
        map.as_mut_slice()[10] = 42;
        assert!(path.exists());
        assert!(map.contains(map.as_ptr() as usize + 10));
        assert!(!map.contains(map.as_ptr() as usize + map.len()));
        drop(map);
        assert!(!path.exists());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn files_that_cannot_be_sized_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("too-big");
        // past what an `off_t` can hold
        assert!(MapFile::open(&path, 1 << 63, MapFileMode::Shared).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn zero_sized_mappings_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MapFile::open(&dir.path().join("x"), 0, MapFileMode::Private).is_err());
    }
}
