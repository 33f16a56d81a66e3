//! Named shared-memory region used by `ffado-ring` to hold the slot array.
//!
//! Generalises the teacher crate's file-backed `Mmap`/`MmapMut` split (see
//! `lithos-mmap`) from an anonymous scratch-file convention to the spec's
//! "named, page-lockable, `N*B`-byte region" abstraction: exactly one party
//! creates and sizes the region, any number of others open it by the same
//! name.

use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Access mode a region is mapped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create shared region '{name}'")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open shared region '{name}'")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to size shared region '{name}' to {size} bytes")]
    Resize {
        name: String,
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to map shared region '{name}'")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to {action} shared region '{name}' in memory")]
    PageLock { name: String, action: &'static str },

    #[error("region of {size} bytes has no block at offset {offset} of length {length}")]
    OutOfBounds {
        size: usize,
        offset: usize,
        length: usize,
    },

    #[error("cannot write into a region mapped read-only")]
    ReadOnlyViolation,
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Mapping::ReadOnly(m) => m.as_ptr(),
            Mapping::ReadWrite(m) => m.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Mapping::ReadOnly(m) => m.len(),
            Mapping::ReadWrite(m) => m.len(),
        }
    }
}

/// A named region of `size` bytes, mapped either read-only or read-write.
///
/// `block`/`block_mut` hand out lifetime-bound slices into the mapping; they
/// carry no ownership of their own, so a caller cannot outlive the region.
pub struct SharedMemory {
    /// Name this region was created/opened under, kept for error messages and
    /// `unlink`.
    name: String,
    /// Access mode this mapping was opened with; governs whether `block_mut`
    /// is permitted.
    access: Access,
    /// Backing file; never read after mapping, held only to keep the
    /// descriptor (and therefore the mapping) alive.
    _file: File,
    /// The live `mmap2` mapping, read-only or read-write.
    mapping: Mapping,
    /// Whether `lock_in_memory(true)` is currently in effect.
    locked: bool,
}

impl SharedMemory {
    /// Creates the backing file at `name`, sizes it to `size` bytes, and maps
    /// it according to `access`. Per the spec's lifecycle, the caller is
    /// responsible for `name` not already being in use by a live region.
    pub fn create(name: impl AsRef<Path>, size: u64, access: Access) -> Result<Self, ShmError> {
        let name_s = name.as_ref().display().to_string();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&name)
            .map_err(|source| ShmError::Create {
                name: name_s.clone(),
                source,
            })?;
        file.set_len(size).map_err(|source| ShmError::Resize {
            name: name_s.clone(),
            size,
            source,
        })?;

        let mapping = Self::map(&file, access, &name_s)?;
        tracing::debug!(name = %name_s, size, access = ?access, "created shared memory region");
        Ok(Self {
            name: name_s,
            access,
            _file: file,
            mapping,
            locked: false,
        })
    }

    /// Opens an existing region by name, mapping it according to `access`.
    pub fn open(name: impl AsRef<Path>, access: Access) -> Result<Self, ShmError> {
        let name_s = name.as_ref().display().to_string();
        let mut opts = OpenOptions::new();
        opts.read(true);
        if access == Access::ReadWrite {
            opts.write(true);
        }
        let file = opts.open(&name).map_err(|source| ShmError::Open {
            name: name_s.clone(),
            source,
        })?;
        let mapping = Self::map(&file, access, &name_s)?;
        tracing::debug!(name = %name_s, access = ?access, "opened shared memory region");
        Ok(Self {
            name: name_s,
            access,
            _file: file,
            mapping,
            locked: false,
        })
    }

    fn map(file: &File, access: Access, name: &str) -> Result<Mapping, ShmError> {
        match access {
            Access::ReadOnly => {
                // SAFETY: the file was just opened/created by us and is not
                // concurrently truncated by this process.
                let m = unsafe { Mmap::map(file) }.map_err(|source| ShmError::Map {
                    name: name.to_string(),
                    source,
                })?;
                Ok(Mapping::ReadOnly(m))
            }
            Access::ReadWrite => {
                // SAFETY: see above.
                let m = unsafe { MmapMut::map_mut(file) }.map_err(|source| ShmError::Map {
                    name: name.to_string(),
                    source,
                })?;
                Ok(Mapping::ReadWrite(m))
            }
        }
    }

    /// Total size of the mapped region, in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Returns a read-only view of `length` bytes starting at `offset`.
    pub fn block(&self, offset: usize, length: usize) -> Result<&[u8], ShmError> {
        self.bounds_check(offset, length)?;
        let base = self.mapping.as_ptr();
        // SAFETY: `bounds_check` verified `offset..offset+length` lies within
        // the mapping, and the returned slice's lifetime is tied to `&self`.
        Ok(unsafe { std::slice::from_raw_parts(base.add(offset), length) })
    }

    /// Returns a mutable view of `length` bytes starting at `offset`.
    ///
    /// Fails with [`ShmError::ReadOnlyViolation`] if this region was mapped
    /// [`Access::ReadOnly`].
    ///
    /// Takes `&self`, not `&mut self`: the whole point of a named shared
    /// region is concurrent mutable access from parties Rust's borrow
    /// checker cannot see (another process, or another thread coordinating
    /// through an external reservation lock). Callers are responsible for
    /// not handing out overlapping blocks without that external
    /// synchronization; this method only guarantees the slice lies within
    /// the mapping.
    pub fn block_mut(&self, offset: usize, length: usize) -> Result<&mut [u8], ShmError> {
        if self.access != Access::ReadWrite {
            return Err(ShmError::ReadOnlyViolation);
        }
        let Mapping::ReadWrite(ref mmap) = self.mapping else {
            return Err(ShmError::ReadOnlyViolation);
        };
        let end = offset.checked_add(length).filter(|&e| e <= mmap.len());
        if end.is_none() {
            return Err(ShmError::OutOfBounds {
                size: mmap.len(),
                offset,
                length,
            });
        }
        // SAFETY: bounds were checked above against the mapping's length; the
        // caller accepts responsibility for external synchronization per the
        // doc comment above.
        let base = mmap.as_ptr() as *mut u8;
        Ok(unsafe { std::slice::from_raw_parts_mut(base.add(offset), length) })
    }

    fn bounds_check(&self, offset: usize, length: usize) -> Result<usize, ShmError> {
        let size = self.len();
        match offset.checked_add(length) {
            Some(end) if end <= size => Ok(end),
            _ => Err(ShmError::OutOfBounds {
                size,
                offset,
                length,
            }),
        }
    }

    /// Locks (or unlocks) the mapped region in physical memory via
    /// `mlock`/`munlock`, preventing page faults from perturbing realtime
    /// audio threads.
    pub fn lock_in_memory(&mut self, lock: bool) -> Result<(), ShmError> {
        if lock == self.locked {
            return Ok(());
        }
        let ptr = self.mapping.as_ptr() as *const libc::c_void;
        let len = self.mapping.len();
        // SAFETY: `ptr`/`len` describe the live mapping owned by `self`.
        let rc = if lock {
            unsafe { libc::mlock(ptr, len) }
        } else {
            unsafe { libc::munlock(ptr, len) }
        };
        if rc != 0 {
            return Err(ShmError::PageLock {
                name: self.name.clone(),
                action: if lock { "lock" } else { "unlock" },
            });
        }
        self.locked = lock;
        tracing::debug!(name = %self.name, lock, "adjusted page-lock state of shared region");
        Ok(())
    }

    pub fn is_locked_in_memory(&self) -> bool {
        self.locked
    }

    /// Removes the backing file, releasing the name for reuse.
    ///
    /// Only the creator ("master" in `ffado-ring` terms) should call this;
    /// slaves simply drop their mapping.
    pub fn unlink(name: impl AsRef<Path>) -> io::Result<()> {
        std::fs::remove_file(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/ffado_shm_test_{tag}_{ts}")
    }

    #[test]
    fn create_then_open_round_trip() {
        let path = temp_path("roundtrip");
        {
            let region = SharedMemory::create(&path, 4096, Access::ReadWrite).unwrap();
            let block = region.block_mut(0, 4).unwrap();
            block.copy_from_slice(b"FFAD");
        }
        {
            let region = SharedMemory::open(&path, Access::ReadOnly).unwrap();
            assert_eq!(region.block(0, 4).unwrap(), b"FFAD");
        }
        let _ = SharedMemory::unlink(&path);
    }

    #[test]
    fn out_of_bounds_block_is_rejected() {
        let path = temp_path("oob");
        let region = SharedMemory::create(&path, 16, Access::ReadWrite).unwrap();
        assert!(matches!(
            region.block(10, 10),
            Err(ShmError::OutOfBounds { .. })
        ));
        let _ = SharedMemory::unlink(&path);
    }

    #[test]
    fn writing_to_read_only_region_fails() {
        let path = temp_path("ro");
        {
            let _ = SharedMemory::create(&path, 16, Access::ReadWrite).unwrap();
        }
        let region = SharedMemory::open(&path, Access::ReadOnly).unwrap();
        assert!(matches!(
            region.block_mut(0, 4),
            Err(ShmError::ReadOnlyViolation)
        ));
        let _ = SharedMemory::unlink(&path);
    }
}
