//! Virtual File System
//!
//! Every fd a guest holds points at a [`Descriptor`]: a regular file, a
//! directory, a pipe or a console sink. Two directory backends exist, an
//! in-memory tree that the host fully owns and a read-only view of a native
//! directory resolved through a lookup cache. A zip archive unpacks into a
//! read-only memory tree. The syscall bridge never knows which backend an fd
//! belongs to.
//!
//! Operations that might touch slow storage return a [`Completion`], which
//! is ready immediately when the answer is already in memory.

pub mod archive;
pub mod cache;
pub mod memory;
pub mod native;

pub use archive::ArchiveError;
pub use cache::{CacheView, NativeCache, NativeEntry};
pub use memory::{MemoryDirectory, MemoryFile, MemoryFs};
pub use native::NativeFs;

use crate::kernel::task::Completion;
use crate::kernel::wasm::{Advice, Dirent, Errno, FdFlags, Fdstat, Filestat, Filetype, OFlags, Whence, rights};

/// How `path_open` should treat the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub create: bool,
    pub directory: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub write: bool,
    pub append: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the raw `path_open` arguments
    pub fn from_wasi(oflags: OFlags, rights_base: u64, fdflags: FdFlags) -> Self {
        Self {
            create: oflags.contains(OFlags::CREAT),
            directory: oflags.contains(OFlags::DIRECTORY),
            exclusive: oflags.contains(OFlags::EXCL),
            truncate: oflags.contains(OFlags::TRUNC),
            write: rights_base & rights::FD_WRITE != 0,
            append: fdflags.contains(FdFlags::APPEND),
        }
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn directory(mut self, directory: bool) -> Self {
        self.directory = directory;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// Result of a path-relative open
pub type OpenResult = Result<Box<dyn Descriptor>, Errno>;

/// An open resource in a guest's fd table
///
/// Defaults describe a resource that supports nothing; each backend
/// overrides what it can do.
pub trait Descriptor: Send {
    fn filetype(&self) -> Filetype;

    fn fdstat(&self) -> Fdstat {
        Fdstat::new(self.filetype())
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        Err(Errno::Badf)
    }

    /// Read up to `len` bytes at the current position
    fn read(&mut self, _len: usize) -> Completion<'_, Result<Vec<u8>, Errno>> {
        Completion::ready(Err(Errno::Badf))
    }

    /// Read up to `len` bytes at `offset` without moving the position
    fn pread(&mut self, _len: usize, _offset: u64) -> Completion<'_, Result<Vec<u8>, Errno>> {
        Completion::ready(Err(Errno::Badf))
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Badf)
    }

    fn pwrite(&mut self, _data: &[u8], _offset: u64) -> Result<usize, Errno> {
        Err(Errno::Badf)
    }

    fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<u64, Errno> {
        Err(Errno::Badf)
    }

    fn advise(&mut self, _offset: u64, _len: u64, _advice: Advice) -> Result<(), Errno> {
        Err(Errno::Badf)
    }

    /// Directory entry at position `cookie`, or `None` past the end
    fn readdir_single(&mut self, _cookie: u64) -> Completion<'_, Result<Option<Dirent>, Errno>> {
        Completion::ready(Err(Errno::Notdir))
    }

    fn path_open(&mut self, _path: &str, _options: OpenOptions) -> Completion<'_, OpenResult> {
        Completion::ready(Err(Errno::Notdir))
    }

    fn path_filestat(&mut self, _path: &str) -> Completion<'_, Result<Filestat, Errno>> {
        Completion::ready(Err(Errno::Notdir))
    }

    fn create_directory(&mut self, _path: &str) -> Result<(), Errno> {
        Err(Errno::Notdir)
    }

    /// Name under which this descriptor was preopened
    fn preopen_name(&self) -> Option<&str> {
        None
    }
}

/// A directory granted to the guest before it starts
///
/// Delegates everything to the wrapped directory and answers prestat
/// queries with its guest-visible name.
pub struct Preopen {
    name: String,
    dir: Box<dyn Descriptor>,
}

impl Preopen {
    pub fn new(name: impl Into<String>, dir: Box<dyn Descriptor>) -> Self {
        Self {
            name: name.into(),
            dir,
        }
    }
}

impl Descriptor for Preopen {
    fn filetype(&self) -> Filetype {
        self.dir.filetype()
    }

    fn fdstat(&self) -> Fdstat {
        self.dir.fdstat()
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        self.dir.filestat()
    }

    fn advise(&mut self, offset: u64, len: u64, advice: Advice) -> Result<(), Errno> {
        self.dir.advise(offset, len, advice)
    }

    fn readdir_single(&mut self, cookie: u64) -> Completion<'_, Result<Option<Dirent>, Errno>> {
        self.dir.readdir_single(cookie)
    }

    fn path_open(&mut self, path: &str, options: OpenOptions) -> Completion<'_, OpenResult> {
        self.dir.path_open(path, options)
    }

    fn path_filestat(&mut self, path: &str) -> Completion<'_, Result<Filestat, Errno>> {
        self.dir.path_filestat(path)
    }

    fn create_directory(&mut self, path: &str) -> Result<(), Errno> {
        self.dir.create_directory(path)
    }

    fn preopen_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// One child of a directory, before it is turned into a [`Dirent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub filetype: Filetype,
    pub ino: u64,
}

impl DirEntry {
    pub fn to_dirent(&self, cookie: u64) -> Dirent {
        Dirent {
            next: cookie + 1,
            ino: self.ino,
            filetype: self.filetype,
            name: self.name.clone(),
        }
    }
}

/// Put a listing into enumeration order: directories first, then files,
/// each group by name.
pub fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.sort_by_key(|e| !e.filetype.is_dir());
}

/// Entry at `cookie` in an already sorted listing
pub fn entry_at(entries: &[DirEntry], cookie: u64) -> Option<Dirent> {
    usize::try_from(cookie)
        .ok()
        .and_then(|index| entries.get(index))
        .map(|entry| entry.to_dirent(cookie))
}

/// Split a guest path into normal components.
///
/// `.` and empty segments vanish, `..` pops; climbing above the directory
/// the path is relative to is refused.
pub fn split_path(path: &str) -> Result<Vec<&str>, Errno> {
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Errno::Notcapable);
                }
            }
            name => parts.push(name),
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, filetype: Filetype) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            filetype,
            ino: 0,
        }
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_path("./a//b/").unwrap(), vec!["a", "b"]);
        assert_eq!(split_path("a/../b").unwrap(), vec!["b"]);
        assert!(split_path(".").unwrap().is_empty());
        assert_eq!(split_path("../etc"), Err(Errno::Notcapable));
    }

    #[test]
    fn test_directories_sort_first() {
        let mut entries = vec![
            entry("b.txt", Filetype::RegularFile),
            entry("zeta", Filetype::Directory),
            entry("a.txt", Filetype::RegularFile),
            entry("alpha", Filetype::Directory),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_entry_at_cookie() {
        let entries = vec![entry("sub", Filetype::Directory)];
        let dirent = entry_at(&entries, 0).unwrap();
        assert_eq!(dirent.name, "sub");
        assert_eq!(dirent.next, 1);
        assert_eq!(entry_at(&entries, 1), None);
    }

    #[test]
    fn test_open_options_from_wasi() {
        let options = OpenOptions::from_wasi(
            OFlags(OFlags::CREAT.0 | OFlags::EXCL.0),
            rights::FD_WRITE,
            FdFlags::APPEND,
        );
        assert_eq!(
            options,
            OpenOptions::new().create(true).exclusive(true).write(true).append(true)
        );
    }
}
