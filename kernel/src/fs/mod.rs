//! Virtual filesystem layer
//!
//! A fixed-capacity mount table routes paths to filesystems by
//! longest-prefix match on the mount point; the matched prefix and one
//! leading `/` are stripped before the filesystem sees the path. File
//! handles own their filesystem context behind [`FileOps`] and are
//! closed exactly once, on drop. A small integer-FD table sits on top.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub mod blockdev;
pub mod devfs;
pub mod ext2;
pub mod fstab;
pub mod ustar;

/// Capacity of the mount table.
const MAX_MOUNTS: usize = 8;

/// Capacity of the FD table.
const MAX_FDS: usize = 32;

/// Read capability of an open file; the implementor owns whatever
/// filesystem state the reads need.
pub trait FileOps: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`; returns the
    /// number of bytes read (0 past end of file).
    fn read(&self, buf: &mut [u8], offset: usize) -> KernelResult<usize>;
}

/// An open file: read ops plus the size reported at open. Dropping the
/// handle is the close.
pub struct FileHandle {
    ops: Box<dyn FileOps>,
    size: usize,
}

impl FileHandle {
    pub fn new(ops: Box<dyn FileOps>, size: usize) -> Self {
        Self { ops, size }
    }

    pub fn read(&self, buf: &mut [u8], offset: usize) -> KernelResult<usize> {
        self.ops.read(buf, offset)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A mounted filesystem: resolves mount-relative paths to open files.
pub trait Filesystem: Send + Sync {
    /// Open `path` (relative to the mount point, no leading `/`).
    fn open(&self, path: &str) -> Option<FileHandle>;

    /// Filesystem type name for diagnostics.
    fn fs_name(&self) -> &'static str;
}

struct MountEntry {
    point: String,
    fs: Box<dyn Filesystem>,
}

/// The mount table; global instance below, local instances in tests.
pub struct MountTable {
    mounts: Vec<MountEntry>,
}

impl MountTable {
    pub const fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Record a mounted filesystem at `point`. The filesystem arrives
    /// already constructed; a failed construction never reaches the
    /// table, so a failed mount leaves no slot behind.
    pub fn mount(&mut self, point: &str, fs: Box<dyn Filesystem>) -> KernelResult<()> {
        if self.mounts.len() >= MAX_MOUNTS {
            return Err(KernelError::ResourceExhausted { resource: "mount" });
        }
        if self.mounts.iter().any(|m| m.point == point) {
            return Err(KernelError::AlreadyMounted);
        }
        log::info!("[VFS] mounted {} ({})", point, fs.fs_name());
        self.mounts.push(MountEntry {
            point: String::from(point),
            fs,
        });
        Ok(())
    }

    /// Drop the mount at exactly `point` (unmount).
    pub fn unmount(&mut self, point: &str) -> KernelResult<()> {
        let index = self
            .mounts
            .iter()
            .position(|m| m.point == point)
            .ok_or(KernelError::NotFound { resource: "mount" })?;
        self.mounts.remove(index);
        log::info!("[VFS] unmounted {}", point);
        Ok(())
    }

    /// Longest-prefix match; returns the entry and the relative path
    /// with the prefix and a single leading `/` stripped.
    fn resolve<'p>(&self, path: &'p str) -> Option<(&MountEntry, &'p str)> {
        let mut best: Option<&MountEntry> = None;
        for mount in &self.mounts {
            if path.starts_with(mount.point.as_str())
                && best.is_none_or(|b| mount.point.len() > b.point.len())
            {
                best = Some(mount);
            }
        }
        best.map(|m| {
            let rel = &path[m.point.len()..];
            (m, rel.strip_prefix('/').unwrap_or(rel))
        })
    }

    pub fn open(&self, path: &str) -> Option<FileHandle> {
        let (mount, rel) = self.resolve(path)?;
        mount.fs.open(rel)
    }
}

static MOUNTS: Mutex<MountTable> = Mutex::new(MountTable::new());

/// Mount a filesystem in the global table.
pub fn mount(point: &str, fs: Box<dyn Filesystem>) -> KernelResult<()> {
    MOUNTS.lock().mount(point, fs)
}

/// Unmount from the global table.
pub fn unmount(point: &str) -> KernelResult<()> {
    MOUNTS.lock().unmount(point)
}

/// Open a path through the global mount table.
pub fn open(path: &str) -> Option<FileHandle> {
    MOUNTS.lock().open(path)
}

/// Open, read `min(size, buf.len())` bytes from offset 0, close.
pub fn read_all(path: &str, buf: &mut [u8]) -> KernelResult<usize> {
    let handle = open(path).ok_or(KernelError::NotFound { resource: "file" })?;
    let want = handle.size().min(buf.len());
    handle.read(&mut buf[..want], 0)
}

/// Dump a directory blob as ext2-style records `{inode(4) rec_len(2)
/// name_len(1) ... name}` and return the number of entries printed.
pub fn list_dir(path: &str) -> KernelResult<usize> {
    let handle = open(path).ok_or(KernelError::NotFound { resource: "file" })?;
    let size = if handle.size() > 0 { handle.size() } else { 4096 };
    let mut buf = alloc::vec![0u8; size];
    let read = handle.read(&mut buf, 0)?;
    if read == 0 {
        crate::println!("vfs: {} appears empty", path);
        return Ok(0);
    }

    crate::println!("vfs: listing {} ({} bytes):", path, read);
    let mut count = 0;
    for entry in dir_entries(&buf[..read]) {
        crate::println!("  {}", entry);
        count += 1;
    }
    Ok(count)
}

/// Iterate the names in an ext2-style directory blob.
pub fn dir_entries(blob: &[u8]) -> impl Iterator<Item = &str> {
    DirEntryIter { blob, offset: 0 }
}

struct DirEntryIter<'a> {
    blob: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for DirEntryIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        loop {
            if self.offset + 8 > self.blob.len() {
                return None;
            }
            let at = self.offset;
            let inode = u32::from_le_bytes([
                self.blob[at],
                self.blob[at + 1],
                self.blob[at + 2],
                self.blob[at + 3],
            ]);
            let rec_len = u16::from_le_bytes([self.blob[at + 4], self.blob[at + 5]]) as usize;
            let name_len = self.blob[at + 6] as usize;
            if inode == 0 || rec_len < 8 {
                return None;
            }
            self.offset += rec_len;
            if at + 8 + name_len > self.blob.len() {
                return None;
            }
            let name = core::str::from_utf8(&self.blob[at + 8..at + 8 + name_len]).ok();
            match name {
                Some(name) if !name.is_empty() => return Some(name),
                _ => continue,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Integer FD layer
// ---------------------------------------------------------------------------

struct FdEntry {
    handle: FileHandle,
    size: usize,
}

static FDS: Mutex<[Option<FdEntry>; MAX_FDS]> = Mutex::new([const { None }; MAX_FDS]);

/// Open a path into the FD table; the slot caches the open size.
pub fn fd_open(path: &str) -> KernelResult<usize> {
    let handle = open(path).ok_or(KernelError::NotFound { resource: "file" })?;
    let size = handle.size();
    let mut fds = FDS.lock();
    for (fd, slot) in fds.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(FdEntry { handle, size });
            return Ok(fd);
        }
    }
    // No slot; the handle drops (and closes) here.
    Err(KernelError::ResourceExhausted {
        resource: "file descriptor",
    })
}

/// Read through an FD.
pub fn fd_read(fd: usize, buf: &mut [u8], offset: usize) -> KernelResult<usize> {
    let fds = FDS.lock();
    let entry = fds
        .get(fd)
        .and_then(|slot| slot.as_ref())
        .ok_or(KernelError::NotFound {
            resource: "file descriptor",
        })?;
    entry.handle.read(buf, offset)
}

/// Cached size of an open FD.
pub fn fd_size(fd: usize) -> KernelResult<usize> {
    let fds = FDS.lock();
    fds.get(fd)
        .and_then(|slot| slot.as_ref())
        .map(|entry| entry.size)
        .ok_or(KernelError::NotFound {
            resource: "file descriptor",
        })
}

/// Close an FD; the drop closes the handle.
pub fn fd_close(fd: usize) -> KernelResult<()> {
    let mut fds = FDS.lock();
    let slot = fds.get_mut(fd).ok_or(KernelError::NotFound {
        resource: "file descriptor",
    })?;
    if slot.take().is_none() {
        return Err(KernelError::NotFound {
            resource: "file descriptor",
        });
    }
    Ok(())
}
