//! In-memory filesystem implementation
//!
//! Directories and files are host-owned buffers shared between every
//! descriptor opened on them, so a write through one fd is visible through
//! the next `path_open` of the same path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{sort_entries, entry_at, split_path, DirEntry, Descriptor, OpenOptions, OpenResult};
use crate::kernel::task::Completion;
use crate::kernel::wasm::{rights, Advice, Dirent, Errno, FdFlags, Fdstat, Filestat, Filetype, Whence};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn inode<T>(node: &Arc<T>) -> u64 {
    Arc::as_ptr(node) as *const () as usize as u64
}

/// A file's contents
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
    readonly: bool,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            readonly: false,
        }
    }

    pub fn readonly(data: Vec<u8>) -> Self {
        Self {
            data,
            readonly: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn truncate(&mut self) -> Result<(), Errno> {
        if self.readonly {
            return Err(Errno::Perm);
        }
        self.data.clear();
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        self.data[start..end].to_vec()
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<usize, Errno> {
        let start = usize::try_from(offset).map_err(|_| Errno::Overflow)?;
        let end = start.checked_add(bytes.len()).ok_or(Errno::Overflow)?;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// A directory's children
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: BTreeMap<String, MemoryNode>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<MemoryNode> {
        self.entries.get(name).cloned()
    }

    pub fn insert(&mut self, name: impl Into<String>, node: MemoryNode) {
        self.entries.insert(name.into(), node);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn listing(&self) -> Vec<DirEntry> {
        let mut entries: Vec<DirEntry> = self
            .entries
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                filetype: node.filetype(),
                ino: node.ino(),
            })
            .collect();
        sort_entries(&mut entries);
        entries
    }
}

/// A stored file or directory
#[derive(Debug, Clone)]
pub enum MemoryNode {
    File(Arc<Mutex<MemoryFile>>),
    Directory(Arc<Mutex<MemoryDirectory>>),
}

impl MemoryNode {
    pub fn file(file: MemoryFile) -> Self {
        MemoryNode::File(Arc::new(Mutex::new(file)))
    }

    pub fn directory() -> Self {
        MemoryNode::Directory(Arc::new(Mutex::new(MemoryDirectory::new())))
    }

    pub fn filetype(&self) -> Filetype {
        match self {
            MemoryNode::File(_) => Filetype::RegularFile,
            MemoryNode::Directory(_) => Filetype::Directory,
        }
    }

    fn ino(&self) -> u64 {
        match self {
            MemoryNode::File(file) => inode(file),
            MemoryNode::Directory(dir) => inode(dir),
        }
    }

    fn filestat(&self) -> Filestat {
        match self {
            MemoryNode::File(file) => {
                Filestat::new(Filetype::RegularFile, inode(file), lock(file).data.len() as u64)
            }
            MemoryNode::Directory(dir) => Filestat::new(Filetype::Directory, inode(dir), 0),
        }
    }

    fn open(&self, options: OpenOptions) -> OpenResult {
        match self {
            MemoryNode::Directory(dir) => {
                if options.write {
                    return Err(Errno::Isdir);
                }
                Ok(Box::new(MemoryDirDescriptor { dir: dir.clone() }))
            }
            MemoryNode::File(file) => {
                if options.directory {
                    return Err(Errno::Notdir);
                }
                {
                    let mut contents = lock(file);
                    if options.write && contents.readonly {
                        return Err(Errno::Perm);
                    }
                    if options.truncate {
                        contents.truncate()?;
                    }
                }
                Ok(Box::new(MemoryFileDescriptor {
                    file: file.clone(),
                    position: 0,
                    writable: options.write,
                    append: options.append,
                }))
            }
        }
    }
}

/// Walk `parts` below `dir`, creating missing directories when `create` is set
fn walk_dirs(
    dir: &Arc<Mutex<MemoryDirectory>>,
    parts: &[&str],
    create: bool,
) -> Result<Arc<Mutex<MemoryDirectory>>, Errno> {
    let mut current = dir.clone();
    for part in parts {
        let next = {
            let mut guard = lock(&current);
            match guard.get(part) {
                Some(MemoryNode::Directory(child)) => child,
                Some(MemoryNode::File(_)) => return Err(Errno::Notdir),
                None if create => {
                    let child = Arc::new(Mutex::new(MemoryDirectory::new()));
                    guard.insert(*part, MemoryNode::Directory(child.clone()));
                    child
                }
                None => return Err(Errno::Noent),
            }
        };
        current = next;
    }
    Ok(current)
}

fn lookup(dir: &Arc<Mutex<MemoryDirectory>>, path: &str) -> Result<MemoryNode, Errno> {
    let parts = split_path(path)?;
    let Some((leaf, parents)) = parts.split_last() else {
        return Ok(MemoryNode::Directory(dir.clone()));
    };
    let parent = walk_dirs(dir, parents, false)?;
    let node = lock(&parent).get(leaf);
    node.ok_or(Errno::Noent)
}

/// Handle on an in-memory tree
///
/// Cloning shares the tree. Hosts use the helpers to seed content before a
/// guest starts; the guest reaches it through [`MemoryFs::descriptor`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    root: Arc<Mutex<MemoryDirectory>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a file, making parent directories as needed
    pub fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> Result<(), Errno> {
        self.insert_file(path, MemoryFile::new(contents.into()))
    }

    pub fn write_readonly_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> Result<(), Errno> {
        self.insert_file(path, MemoryFile::readonly(contents.into()))
    }

    fn insert_file(&self, path: &str, file: MemoryFile) -> Result<(), Errno> {
        let parts = split_path(path)?;
        let (leaf, parents) = parts.split_last().ok_or(Errno::Isdir)?;
        let parent = walk_dirs(&self.root, parents, true)?;
        let mut guard = lock(&parent);
        if let Some(MemoryNode::Directory(_)) = guard.get(leaf) {
            return Err(Errno::Isdir);
        }
        guard.insert(*leaf, MemoryNode::file(file));
        Ok(())
    }

    pub fn create_dir_all(&self, path: &str) -> Result<(), Errno> {
        let parts = split_path(path)?;
        walk_dirs(&self.root, &parts, true).map(|_| ())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, Errno> {
        match lookup(&self.root, path)? {
            MemoryNode::File(file) => Ok(lock(&file).data.clone()),
            MemoryNode::Directory(_) => Err(Errno::Isdir),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        lookup(&self.root, path).is_ok()
    }

    /// A directory descriptor on the root of the tree
    pub fn descriptor(&self) -> Box<dyn Descriptor> {
        Box::new(MemoryDirDescriptor {
            dir: self.root.clone(),
        })
    }
}

/// Open directory in a memory tree
pub struct MemoryDirDescriptor {
    dir: Arc<Mutex<MemoryDirectory>>,
}

impl Descriptor for MemoryDirDescriptor {
    fn filetype(&self) -> Filetype {
        Filetype::Directory
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        Ok(Filestat::new(Filetype::Directory, inode(&self.dir), 0))
    }

    fn advise(&mut self, _offset: u64, _len: u64, _advice: Advice) -> Result<(), Errno> {
        Ok(())
    }

    fn readdir_single(&mut self, cookie: u64) -> Completion<'_, Result<Option<Dirent>, Errno>> {
        let listing = lock(&self.dir).listing();
        Completion::ready(Ok(entry_at(&listing, cookie)))
    }

    fn path_open(&mut self, path: &str, options: OpenOptions) -> Completion<'_, OpenResult> {
        Completion::ready(open_path(&self.dir, path, options))
    }

    fn path_filestat(&mut self, path: &str) -> Completion<'_, Result<Filestat, Errno>> {
        Completion::ready(lookup(&self.dir, path).map(|node| node.filestat()))
    }

    fn create_directory(&mut self, path: &str) -> Result<(), Errno> {
        let parts = split_path(path)?;
        let (leaf, parents) = parts.split_last().ok_or(Errno::Exist)?;
        let parent = walk_dirs(&self.dir, parents, false)?;
        let mut guard = lock(&parent);
        if guard.get(leaf).is_some() {
            return Err(Errno::Exist);
        }
        guard.insert(*leaf, MemoryNode::directory());
        Ok(())
    }
}

fn open_path(dir: &Arc<Mutex<MemoryDirectory>>, path: &str, options: OpenOptions) -> OpenResult {
    let parts = split_path(path)?;
    let Some((leaf, parents)) = parts.split_last() else {
        return MemoryNode::Directory(dir.clone()).open(options);
    };
    let parent = walk_dirs(dir, parents, options.create)?;
    let node = {
        let mut guard = lock(&parent);
        match guard.get(leaf) {
            Some(_) if options.exclusive => return Err(Errno::Exist),
            Some(node) => node,
            None if !options.create => return Err(Errno::Noent),
            None => {
                let node = if options.directory {
                    MemoryNode::directory()
                } else {
                    MemoryNode::file(MemoryFile::default())
                };
                guard.insert(*leaf, node.clone());
                node
            }
        }
    };
    node.open(options)
}

/// Open regular file in a memory tree
pub struct MemoryFileDescriptor {
    file: Arc<Mutex<MemoryFile>>,
    position: u64,
    writable: bool,
    append: bool,
}

impl Descriptor for MemoryFileDescriptor {
    fn filetype(&self) -> Filetype {
        Filetype::RegularFile
    }

    fn fdstat(&self) -> Fdstat {
        let mut stat = Fdstat::new(Filetype::RegularFile);
        if self.append {
            stat.flags = FdFlags::APPEND;
        }
        if !self.writable {
            stat.rights_base &= !rights::FD_WRITE;
        }
        stat
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        Ok(MemoryNode::File(self.file.clone()).filestat())
    }

    fn read(&mut self, len: usize) -> Completion<'_, Result<Vec<u8>, Errno>> {
        let bytes = lock(&self.file).read_at(self.position, len);
        self.position += bytes.len() as u64;
        Completion::ready(Ok(bytes))
    }

    fn pread(&mut self, len: usize, offset: u64) -> Completion<'_, Result<Vec<u8>, Errno>> {
        Completion::ready(Ok(lock(&self.file).read_at(offset, len)))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Errno> {
        if !self.writable {
            return Err(Errno::Badf);
        }
        let mut file = lock(&self.file);
        if file.readonly {
            return Err(Errno::Badf);
        }
        if self.append {
            self.position = file.data.len() as u64;
        }
        let written = file.write_at(self.position, data)?;
        self.position += written as u64;
        Ok(written)
    }

    fn pwrite(&mut self, data: &[u8], offset: u64) -> Result<usize, Errno> {
        if !self.writable {
            return Err(Errno::Badf);
        }
        let mut file = lock(&self.file);
        if file.readonly {
            return Err(Errno::Badf);
        }
        file.write_at(offset, data)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Errno> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position,
            Whence::End => lock(&self.file).data.len() as u64,
        };
        let target = i64::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(offset))
            .ok_or(Errno::Overflow)?;
        if target < 0 {
            return Err(Errno::Inval);
        }
        self.position = target as u64;
        Ok(self.position)
    }

    fn advise(&mut self, _offset: u64, _len: u64, _advice: Advice) -> Result<(), Errno> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &mut dyn Descriptor, path: &str, options: OpenOptions) -> OpenResult {
        dir.path_open(path, options).now().unwrap()
    }

    fn read_all(file: &mut dyn Descriptor) -> Vec<u8> {
        file.read(usize::MAX >> 1).now().unwrap().unwrap()
    }

    #[test]
    fn test_write_then_reopen_and_read() {
        let fs = MemoryFs::new();
        let mut root = fs.descriptor();

        let mut file = open(&mut *root, "greeting.txt", OpenOptions::new().create(true).write(true)).unwrap();
        assert_eq!(file.write(b"hello").unwrap(), 5);
        drop(file);

        let mut fresh = open(&mut *root, "greeting.txt", OpenOptions::new()).unwrap();
        let bytes = fresh.read(5).now().unwrap().unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_create_synthesizes_intermediate_dirs() {
        let fs = MemoryFs::new();
        let mut root = fs.descriptor();

        open(&mut *root, "a/b/c.txt", OpenOptions::new().create(true).write(true)).unwrap();
        assert!(fs.exists("a/b"));
        let stat = root.path_filestat("a/b").now().unwrap().unwrap();
        assert_eq!(stat.filetype, Filetype::Directory);

        let dir = open(&mut *root, "x/y", OpenOptions::new().create(true).directory(true)).unwrap();
        assert_eq!(dir.filetype(), Filetype::Directory);
    }

    #[test]
    fn test_missing_without_create() {
        let fs = MemoryFs::new();
        let mut root = fs.descriptor();
        assert_eq!(open(&mut *root, "nope", OpenOptions::new()).err(), Some(Errno::Noent));
        assert_eq!(open(&mut *root, "no/such/dir", OpenOptions::new()).err(), Some(Errno::Noent));
    }

    #[test]
    fn test_exclusive_on_existing() {
        let fs = MemoryFs::new();
        fs.write_file("f", "x").unwrap();
        let mut root = fs.descriptor();
        let result = open(&mut *root, "f", OpenOptions::new().create(true).exclusive(true));
        assert_eq!(result.err(), Some(Errno::Exist));
    }

    #[test]
    fn test_kind_mismatch() {
        let fs = MemoryFs::new();
        fs.write_file("file", "x").unwrap();
        fs.create_dir_all("dir").unwrap();
        let mut root = fs.descriptor();

        let result = open(&mut *root, "file", OpenOptions::new().directory(true));
        assert_eq!(result.err(), Some(Errno::Notdir));
        let result = open(&mut *root, "dir", OpenOptions::new().write(true));
        assert_eq!(result.err(), Some(Errno::Isdir));
        let result = open(&mut *root, "file/inner", OpenOptions::new());
        assert_eq!(result.err(), Some(Errno::Notdir));
    }

    #[test]
    fn test_readonly_file() {
        let fs = MemoryFs::new();
        fs.write_readonly_file("ro", "keep").unwrap();
        let mut root = fs.descriptor();

        let result = open(&mut *root, "ro", OpenOptions::new().write(true));
        assert_eq!(result.err(), Some(Errno::Perm));
        let result = open(&mut *root, "ro", OpenOptions::new().truncate(true));
        assert_eq!(result.err(), Some(Errno::Perm));

        let mut file = open(&mut *root, "ro", OpenOptions::new()).unwrap();
        assert_eq!(file.write(b"x"), Err(Errno::Badf));
        assert_eq!(read_all(&mut *file), b"keep");
    }

    #[test]
    fn test_truncate_and_append() {
        let fs = MemoryFs::new();
        fs.write_file("log", "old contents").unwrap();
        let mut root = fs.descriptor();

        let mut file = open(&mut *root, "log", OpenOptions::new().write(true).truncate(true)).unwrap();
        file.write(b"one").unwrap();
        drop(file);

        let mut file = open(&mut *root, "log", OpenOptions::new().write(true).append(true)).unwrap();
        file.seek(0, Whence::Set).unwrap();
        file.write(b"two").unwrap();
        assert_eq!(fs.read_file("log").unwrap(), b"onetwo");
        assert!(file.fdstat().flags.contains(FdFlags::APPEND));
    }

    #[test]
    fn test_seek_and_pread() {
        let fs = MemoryFs::new();
        fs.write_file("data", "0123456789").unwrap();
        let mut root = fs.descriptor();
        let mut file = open(&mut *root, "data", OpenOptions::new()).unwrap();

        assert_eq!(file.seek(4, Whence::Set), Ok(4));
        assert_eq!(file.read(3).now().unwrap().unwrap(), b"456");
        assert_eq!(file.seek(-2, Whence::End), Ok(8));
        assert_eq!(file.seek(-20, Whence::Cur), Err(Errno::Inval));
        assert_eq!(file.pread(2, 1).now().unwrap().unwrap(), b"12");
        assert_eq!(file.seek(0, Whence::Cur), Ok(8));
        assert!(file.read(4).now().unwrap().unwrap() == b"89");
        assert!(read_all(&mut *file).is_empty());
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let fs = MemoryFs::new();
        let mut root = fs.descriptor();
        let mut file = open(&mut *root, "sparse", OpenOptions::new().create(true).write(true)).unwrap();
        file.pwrite(b"z", 3).unwrap();
        assert_eq!(fs.read_file("sparse").unwrap(), vec![0, 0, 0, b'z']);
        assert_eq!(file.filestat().unwrap().size, 4);
    }

    #[test]
    fn test_readdir_lists_directories_first() {
        let fs = MemoryFs::new();
        fs.write_file("a.txt", "a").unwrap();
        fs.create_dir_all("sub").unwrap();
        let mut root = fs.descriptor();

        let first = root.readdir_single(0).now().unwrap().unwrap().unwrap();
        assert_eq!(first.name, "sub");
        assert_eq!(first.filetype, Filetype::Directory);
        let second = root.readdir_single(first.next).now().unwrap().unwrap().unwrap();
        assert_eq!(second.name, "a.txt");
        assert_eq!(root.readdir_single(second.next).now().unwrap().unwrap(), None);
    }

    #[test]
    fn test_create_directory() {
        let fs = MemoryFs::new();
        let mut root = fs.descriptor();
        root.create_directory("made").unwrap();
        assert_eq!(root.create_directory("made"), Err(Errno::Exist));
        assert_eq!(root.create_directory("missing/child"), Err(Errno::Noent));
        assert!(fs.exists("made"));
    }
}
