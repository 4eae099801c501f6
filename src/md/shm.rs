//! # Shared-Memory Backing
//!
//! Metadata buffers can live in named shared-memory objects so a restart
//! finds them warm. Objects are named `ftl_<uuid>_<label>` under the
//! shared-memory directory (`/dev/shm`, or the hugetlbfs mountpoint in
//! huge mode), opened mode 0600, sized up to the filesystem block size and
//! locked into memory.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use uuid::Uuid;

use crate::core::buf::DmaBuffer;

const SHM_MODE: u32 = 0o600;

/// Default shared-memory directory.
pub const SHM_DIR: &str = "/dev/shm";

/// Default hugetlbfs mountpoint.
pub const SHM_HUGE_DIR: &str = "/dev/hugepages";

/// Object path for a device label.
pub fn object_path(dir: &Path, uuid: &Uuid, label: &str) -> PathBuf {
    dir.join(format!("ftl_{}_{}", uuid.as_hyphenated(), label))
}

/// A live shared-memory object backing one metadata buffer.
#[derive(Debug)]
pub struct ShmBacking {
    path: PathBuf,
    _file: File,
    len: usize,
    locked: bool,
    /// Present when the object already existed and was not truncated, in
    /// which case its contents are a warm copy from a previous run.
    pub reused: bool,
}

impl ShmBacking {
    /// Open or create the object and map it.
    ///
    /// `new` truncates any existing object; without it, an existing
    /// object must match `len_bytes` (after block-size rounding) or the
    /// open fails, which prevents attaching to a mismatched leftover.
    pub fn open(
        dir: &Path,
        uuid: &Uuid,
        label: &str,
        len_bytes: usize,
        new: bool,
    ) -> io::Result<(ShmBacking, DmaBuffer)> {
        let path = object_path(dir, uuid, label);

        if new {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(SHM_MODE)
            .open(&path)?;

        let meta = file.metadata()?;
        if meta.permissions().mode() & 0o777 != SHM_MODE {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "shared-memory object has unexpected mode",
            ));
        }

        let blksize = meta.blksize().max(1) as usize;
        let rounded = len_bytes.div_ceil(blksize) * blksize;

        let existing = meta.len() as usize;
        let reused = if existing == 0 {
            file.set_len(rounded as u64)?;
            false
        } else if existing == rounded {
            !new
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared-memory object size mismatch",
            ));
        };

        let map = unsafe { MmapMut::map_mut(&file)? };
        let buffer = DmaBuffer::from_mapping(map);

        let mut backing = ShmBacking {
            path,
            _file: file,
            len: rounded,
            locked: false,
            reused,
        };
        backing.lock_pages(&buffer);
        Ok((backing, buffer))
    }

    /// Pin the mapped pages in memory. Lock failures (typically
    /// RLIMIT_MEMLOCK) degrade to a warning; the mapping stays usable.
    fn lock_pages(&mut self, buffer: &DmaBuffer) {
        let (ptr, len) = buffer.raw_parts();
        let rc = unsafe { libc::mlock(ptr.cast(), len) };
        if rc == 0 {
            self.locked = true;
        } else {
            log::warn!(
                "mlock of shared-memory object {} failed: {}",
                self.path.display(),
                io::Error::last_os_error()
            );
        }
    }

    /// Unpin the pages before tearing the mapping down.
    pub fn unlock_pages(&mut self, buffer: &DmaBuffer) {
        if !self.locked {
            return;
        }
        let (ptr, len) = buffer.raw_parts();
        unsafe {
            libc::munlock(ptr.cast(), len);
        }
        self.locked = false;
    }

    /// Mapped object size in bytes, after rounding.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove the object name. The mapping itself dies with the buffer.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!(
                    "unlink of shared-memory object {} failed: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Remove a named object without opening it. Used by recovery to drop
/// stale buffers before allocating its own working set.
pub fn unlink_object(dir: &Path, uuid: &Uuid, label: &str) -> io::Result<()> {
    match std::fs::remove_file(object_path(dir, uuid, label)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_map_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();

        let (backing, mut buf) = ShmBacking::open(dir.path(), &uuid, "l2p_l1", 8192, true).unwrap();
        assert!(!backing.reused);
        assert!(backing.len() >= 8192);
        buf.as_mut_slice()[0] = 0xEE;
        buf.flush_range(0, 1).unwrap();
        drop(buf);

        let (backing, buf) = ShmBacking::open(dir.path(), &uuid, "l2p_l1", 8192, false).unwrap();
        assert!(backing.reused);
        assert_eq!(buf.as_slice()[0], 0xEE);

        backing.unlink();
        assert!(!object_path(dir.path(), &uuid, "l2p_l1").exists());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();

        let (_backing, _buf) = ShmBacking::open(dir.path(), &uuid, "band_md", 4096, true).unwrap();
        let err = ShmBacking::open(dir.path(), &uuid, "band_md", 1 << 20, false);
        assert!(err.is_err());
    }

    #[test]
    fn test_unlink_object_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        unlink_object(dir.path(), &uuid, "nothing").unwrap();
    }
}
