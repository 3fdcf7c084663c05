//! Native-backed filesystem
//!
//! Exposes a host directory to guests, read-only. Lookups and listings go
//! through the shared [`NativeCache`]; file contents are loaded on the first
//! read of each descriptor and kept until it is closed.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use super::cache::{CacheView, NativeCache, NativeEntry};
use super::{entry_at, Descriptor, OpenOptions, OpenResult};
use crate::kernel::task::Completion;
use crate::kernel::wasm::{rights, Advice, Dirent, Errno, Fdstat, Filestat, Filetype, Whence};

/// A read-only view of a granted host directory
#[derive(Debug, Clone)]
pub struct NativeFs {
    cache: Arc<NativeCache>,
}

impl NativeFs {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            cache: NativeCache::new(root)?,
        })
    }

    pub fn cache(&self) -> &Arc<NativeCache> {
        &self.cache
    }

    /// Warm the lookup cache, see [`NativeCache::hydrate`]
    pub fn hydrate(&self, includes: &[String]) -> Result<usize, Errno> {
        self.cache.hydrate(includes)
    }

    /// A directory descriptor on the granted root
    pub fn descriptor(&self) -> Box<dyn Descriptor> {
        Box::new(NativeDirDescriptor::new(CacheView::new(self.cache.clone())))
    }
}

fn open_entry(view: &CacheView, entry: NativeEntry, options: OpenOptions) -> OpenResult {
    if options.exclusive && options.create {
        return Err(Errno::Exist);
    }
    match entry.filetype {
        Filetype::Directory => {
            if options.write {
                return Err(Errno::Isdir);
            }
            Ok(Box::new(NativeDirDescriptor::new(view.narrow(&entry))))
        }
        Filetype::RegularFile => {
            if options.directory {
                return Err(Errno::Notdir);
            }
            if options.write || options.truncate {
                return Err(Errno::Rofs);
            }
            Ok(Box::new(NativeFileDescriptor::new(entry)))
        }
        _ => Err(Errno::Notsup),
    }
}

/// Open directory of the native tree
pub struct NativeDirDescriptor {
    view: CacheView,
}

impl NativeDirDescriptor {
    pub fn new(view: CacheView) -> Self {
        Self { view }
    }

    pub fn view(&self) -> &CacheView {
        &self.view
    }
}

impl Descriptor for NativeDirDescriptor {
    fn filetype(&self) -> Filetype {
        Filetype::Directory
    }

    fn fdstat(&self) -> Fdstat {
        let mut stat = Fdstat::new(Filetype::Directory);
        stat.rights_base &= !rights::FD_WRITE;
        stat
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        match self.view.lookup("") {
            Some(entry) => Ok(entry.filestat()),
            None => Err(Errno::Noent),
        }
    }

    fn advise(&mut self, _offset: u64, _len: u64, _advice: Advice) -> Result<(), Errno> {
        Ok(())
    }

    fn readdir_single(&mut self, cookie: u64) -> Completion<'_, Result<Option<Dirent>, Errno>> {
        self.view
            .children()
            .map(move |listing| listing.map(|entries| entry_at(&entries, cookie)))
    }

    fn path_open(&mut self, path: &str, options: OpenOptions) -> Completion<'_, OpenResult> {
        let view = self.view.clone();
        self.view.resolve(path).map(move |resolved| match resolved {
            Ok(entry) => open_entry(&view, entry, options),
            Err(Errno::Noent) if options.create => Err(Errno::Rofs),
            Err(errno) => Err(errno),
        })
    }

    fn path_filestat(&mut self, path: &str) -> Completion<'_, Result<Filestat, Errno>> {
        self.view
            .resolve(path)
            .map(|resolved| resolved.map(|entry| entry.filestat()))
    }

    fn create_directory(&mut self, _path: &str) -> Result<(), Errno> {
        Err(Errno::Rofs)
    }
}

/// Open regular file of the native tree
pub struct NativeFileDescriptor {
    entry: NativeEntry,
    contents: Option<Arc<Vec<u8>>>,
    position: u64,
}

impl NativeFileDescriptor {
    pub fn new(entry: NativeEntry) -> Self {
        Self {
            entry,
            contents: None,
            position: 0,
        }
    }

    fn slice(contents: &[u8], offset: u64, len: usize) -> Vec<u8> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(contents.len());
        let end = start.saturating_add(len).min(contents.len());
        contents[start..end].to_vec()
    }

    fn load(entry: &NativeEntry) -> Result<Arc<Vec<u8>>, Errno> {
        log::trace!("loading {}", entry.path.display());
        fs::read(&entry.path)
            .map(Arc::new)
            .map_err(|e| Errno::from_io(&e))
    }

    /// Read at `offset`, loading the file first if this is the first access
    fn read_at(&mut self, offset: u64, len: usize) -> Completion<'_, Result<Vec<u8>, Errno>> {
        if let Some(contents) = &self.contents {
            return Completion::ready(Ok(Self::slice(contents, offset, len)));
        }
        Completion::pending(async move {
            let contents = Self::load(&self.entry)?;
            let bytes = Self::slice(&contents, offset, len);
            self.contents = Some(contents);
            Ok(bytes)
        })
    }

    fn len(&self) -> u64 {
        match &self.contents {
            Some(contents) => contents.len() as u64,
            None => self.entry.size,
        }
    }
}

impl Descriptor for NativeFileDescriptor {
    fn filetype(&self) -> Filetype {
        Filetype::RegularFile
    }

    fn fdstat(&self) -> Fdstat {
        let mut stat = Fdstat::new(Filetype::RegularFile);
        stat.rights_base &= !rights::FD_WRITE;
        stat
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        let mut stat = self.entry.filestat();
        stat.size = self.len();
        Ok(stat)
    }

    fn read(&mut self, len: usize) -> Completion<'_, Result<Vec<u8>, Errno>> {
        let offset = self.position;
        if let Some(contents) = &self.contents {
            let bytes = Self::slice(contents, offset, len);
            self.position += bytes.len() as u64;
            return Completion::ready(Ok(bytes));
        }
        Completion::pending(async move {
            let contents = Self::load(&self.entry)?;
            let bytes = Self::slice(&contents, offset, len);
            self.contents = Some(contents);
            self.position += bytes.len() as u64;
            Ok(bytes)
        })
    }

    fn pread(&mut self, len: usize, offset: u64) -> Completion<'_, Result<Vec<u8>, Errno>> {
        self.read_at(offset, len)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Errno> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position,
            Whence::End => self.len(),
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
    use futures::executor::block_on;

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello native").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), "inner").unwrap();
        dir
    }

    #[test]
    fn test_enumerate_one_cookie_at_a_time() {
        let tree = repo();
        let native = NativeFs::open(tree.path()).unwrap();
        let mut root = native.descriptor();

        let mut names = Vec::new();
        let mut cookie = 0;
        while let Some(dirent) = block_on(root.readdir_single(cookie)).unwrap() {
            names.push((dirent.name.clone(), dirent.filetype));
            cookie = dirent.next;
        }
        assert_eq!(
            names,
            vec![
                ("sub".to_string(), Filetype::Directory),
                ("a.txt".to_string(), Filetype::RegularFile),
            ]
        );
        assert_eq!(cookie, 2);
        // Past the end stays empty
        assert_eq!(block_on(root.readdir_single(5)).unwrap(), None);
    }

    #[test]
    fn test_read_loads_lazily() {
        let tree = repo();
        let native = NativeFs::open(tree.path()).unwrap();
        let mut root = native.descriptor();

        let mut file = block_on(root.path_open("a.txt", OpenOptions::new())).unwrap();
        let first = file.read(5);
        assert!(!first.is_ready());
        assert_eq!(block_on(first).unwrap(), b"hello");

        let second = file.read(100);
        assert!(second.is_ready());
        assert_eq!(block_on(second).unwrap(), b" native");
        assert_eq!(file.seek(-6, Whence::End), Ok(6));
        assert_eq!(block_on(file.pread(3, 0)).unwrap(), b"hel");
        assert_eq!(file.filestat().unwrap().size, 12);
    }

    #[test]
    fn test_descend_into_subdirectory() {
        let tree = repo();
        let native = NativeFs::open(tree.path()).unwrap();
        let mut root = native.descriptor();

        let mut sub = block_on(root.path_open("sub", OpenOptions::new().directory(true))).unwrap();
        let stat = block_on(sub.path_filestat("inner.txt")).unwrap();
        assert_eq!(stat.filetype, Filetype::RegularFile);
        assert_eq!(stat.size, 5);

        let mut inner = block_on(sub.path_open("inner.txt", OpenOptions::new())).unwrap();
        assert_eq!(block_on(inner.read(64)).unwrap(), b"inner");
    }

    #[test]
    fn test_read_only() {
        let tree = repo();
        let native = NativeFs::open(tree.path()).unwrap();
        let mut root = native.descriptor();

        let write = block_on(root.path_open("a.txt", OpenOptions::new().write(true)));
        assert_eq!(write.err(), Some(Errno::Rofs));
        let create = block_on(root.path_open("new.txt", OpenOptions::new().create(true)));
        assert_eq!(create.err(), Some(Errno::Rofs));
        let missing = block_on(root.path_open("new.txt", OpenOptions::new()));
        assert_eq!(missing.err(), Some(Errno::Noent));
        assert_eq!(root.create_directory("made"), Err(Errno::Rofs));

        let mut file = block_on(root.path_open("a.txt", OpenOptions::new())).unwrap();
        assert_eq!(file.write(b"x"), Err(Errno::Badf));
    }

    #[test]
    fn test_repeated_lookups_touch_host_once() {
        let tree = repo();
        let native = NativeFs::open(tree.path()).unwrap();
        let mut root = native.descriptor();

        for _ in 0..5 {
            block_on(root.path_filestat("sub/inner.txt")).unwrap();
        }
        assert_eq!(native.cache().native_calls(), 2);
    }
}
