//! Named shared-memory files.
//!
//! A segment is identified by a `(namespace, name)` pair. The namespace is a
//! directory, normally the tmpfs mounted at `/dev/shm`, so a segment file is
//! RAM-backed and every process that maps it sees the same pages. Nothing in
//! here is global: callers always pass the namespace explicitly.

use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// Directory in which segment files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    dir: PathBuf,
}

impl ShmNamespace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `/dev/shm` when the host has it, otherwise the process temp dir.
    pub fn system() -> Self {
        let dev_shm = Path::new("/dev/shm");
        if dev_shm.is_dir() {
            Self::new(dev_shm)
        } else {
            Self::new(std::env::temp_dir())
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a segment name to its backing file path.
    ///
    /// # Errors
    /// `InvalidInput` if the name is empty or contains `/` or NUL.
    pub fn path_of(&self, name: &str) -> io::Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self::system()
    }
}

fn validate_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid segment name {name:?}"),
        ));
    }
    Ok(())
}

/// A read-write shared mapping of a segment file.
///
/// The mapping stays valid after the file is unlinked; the pages are freed
/// once the last process unmaps them.
pub struct ShmFile {
    _file: File,
    mmap: MmapMut,
    path: PathBuf,
}

impl ShmFile {
    /// Create a new segment file of `size_bytes` and map it read-write.
    ///
    /// Fails with `AlreadyExists` if another producer got there first, which
    /// lets the caller fall back to [`ShmFile::open`].
    pub fn create_new(ns: &ShmNamespace, name: &str, size_bytes: u64) -> io::Result<Self> {
        let path = ns.path_of(name)?;
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if let Err(e) = file.set_len(size_bytes) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        // SAFETY: the file was just created by us and sized above. Other
        // processes may map it concurrently; all shared access goes through
        // atomics or the ring protocol.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            path,
        })
    }

    /// Open an existing segment file and map it read-write.
    pub fn open(ns: &ShmNamespace, name: &str) -> io::Result<Self> {
        let path = ns.path_of(name)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment {} is empty", path.display()),
            ));
        }

        // SAFETY: see `create_new`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            path,
        })
    }

    /// Remove the segment file from the namespace. Existing mappings survive.
    pub fn unlink(ns: &ShmNamespace, name: &str) -> io::Result<()> {
        std::fs::remove_file(ns.path_of(name)?)
    }

    /// Return raw pointer to start of the mapped data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_ns(tag: &str) -> ShmNamespace {
        let dir = std::env::temp_dir().join(format!("lithos_mmap_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        ShmNamespace::new(dir)
    }

    #[test]
    fn create_then_open_shares_pages() {
        let ns = scratch_ns("share");
        let mut a = ShmFile::create_new(&ns, "seg", 4096).unwrap();
        let mut b = ShmFile::open(&ns, "seg").unwrap();
        assert_eq!(a.len(), 4096);
        assert_eq!(b.len(), 4096);

        unsafe { a.as_mut_ptr().add(100).write(0xAB) };
        let seen = unsafe { b.as_mut_ptr().add(100).read() };
        assert_eq!(seen, 0xAB);

        ShmFile::unlink(&ns, "seg").unwrap();
        let _ = std::fs::remove_dir_all(ns.dir());
    }

    #[test]
    fn create_new_refuses_existing_name() {
        let ns = scratch_ns("excl");
        let _a = ShmFile::create_new(&ns, "seg", 64).unwrap();
        let err = ShmFile::create_new(&ns, "seg", 64).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        let _ = std::fs::remove_dir_all(ns.dir());
    }

    #[test]
    fn open_missing_is_not_found() {
        let ns = scratch_ns("missing");
        let err = ShmFile::open(&ns, "nope").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let _ = std::fs::remove_dir_all(ns.dir());
    }

    #[test]
    fn names_are_validated() {
        let ns = ShmNamespace::new("/tmp");
        for bad in ["", "a/b", "x\0y"] {
            let err = ns.path_of(bad).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        assert_eq!(ns.path_of("md_bus").unwrap(), Path::new("/tmp/md_bus"));
    }
}
