//! Lookup cache for native-backed directories
//!
//! Resolving a guest path against the host filesystem costs one native call
//! per path segment. The cache memoizes every resolved entry and directory
//! listing under its path relative to the granted root, so the number of
//! native traversals is bounded by the number of distinct paths ever
//! touched, not by the number of syscalls issued against them.
//!
//! A [`CacheView`] is the cache seen from one directory: relative lookups
//! are joined onto its prefix, and descending into a subdirectory yields a
//! narrower view over the same shared store.
//!
//! Entries are never invalidated. If the native directory changes while a
//! cache is alive, lookups may return stale handles.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{sort_entries, split_path, DirEntry};
use crate::kernel::task::Completion;
use crate::kernel::wasm::{Errno, Filestat, Filetype};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A resolved native file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEntry {
    /// Path relative to the granted root, `/`-separated, empty for the root
    pub key: String,
    /// Where it lives on the host
    pub path: PathBuf,
    pub filetype: Filetype,
    pub size: u64,
}

impl NativeEntry {
    fn from_metadata(key: String, path: PathBuf, meta: &fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let filetype = if file_type.is_symlink() {
            Filetype::SymbolicLink
        } else if file_type.is_dir() {
            Filetype::Directory
        } else if file_type.is_file() {
            Filetype::RegularFile
        } else {
            Filetype::Unknown
        };
        Self {
            key,
            path,
            filetype,
            size: if filetype == Filetype::RegularFile { meta.len() } else { 0 },
        }
    }

    /// Stable inode number derived from the relative path
    pub fn ino(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        hasher.finish()
    }

    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    pub fn filestat(&self) -> Filestat {
        Filestat::new(self.filetype, self.ino(), self.size)
    }

    fn dir_entry(&self) -> DirEntry {
        DirEntry {
            name: self.name().to_string(),
            filetype: self.filetype,
            ino: self.ino(),
        }
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Shared store of resolved entries for one granted root
#[derive(Debug)]
pub struct NativeCache {
    root: PathBuf,
    entries: Mutex<HashMap<String, NativeEntry>>,
    listings: Mutex<HashMap<String, Arc<Vec<DirEntry>>>>,
    native_calls: AtomicUsize,
}

impl NativeCache {
    /// Bind a cache to `root`, which must be a directory
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let root = root.into();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", root.display()),
            ));
        }
        let mut entries = HashMap::new();
        entries.insert(
            String::new(),
            NativeEntry {
                key: String::new(),
                path: root.clone(),
                filetype: Filetype::Directory,
                size: 0,
            },
        );
        Ok(Arc::new(Self {
            root,
            entries: Mutex::new(entries),
            listings: Mutex::new(HashMap::new()),
            native_calls: AtomicUsize::new(0),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// How many times the host filesystem has actually been consulted
    pub fn native_calls(&self) -> usize {
        self.native_calls.load(Ordering::Relaxed)
    }

    /// Number of memoized entries, root included
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, key: &str) -> Option<NativeEntry> {
        lock(&self.entries).get(key).cloned()
    }

    fn cached_listing(&self, key: &str) -> Option<Arc<Vec<DirEntry>>> {
        lock(&self.listings).get(key).cloned()
    }

    /// Resolve `parts` one segment at a time, consulting the host only for
    /// segments not seen before.
    fn resolve_parts(&self, parts: &[String]) -> Result<NativeEntry, Errno> {
        let mut current = self.cached("").ok_or(Errno::Noent)?;
        for part in parts {
            if current.filetype != Filetype::Directory {
                return Err(Errno::Notdir);
            }
            let key = join_key(&current.key, part);
            current = match self.cached(&key) {
                Some(entry) => entry,
                None => {
                    let path = current.path.join(part);
                    self.native_calls.fetch_add(1, Ordering::Relaxed);
                    let meta = fs::symlink_metadata(&path).map_err(|e| Errno::from_io(&e))?;
                    let entry = NativeEntry::from_metadata(key.clone(), path, &meta);
                    lock(&self.entries).insert(key, entry.clone());
                    entry
                }
            };
        }
        Ok(current)
    }

    /// Read and memoize the listing of the directory at `key`
    fn load_listing(&self, key: &str) -> Result<Arc<Vec<DirEntry>>, Errno> {
        if let Some(listing) = self.cached_listing(key) {
            return Ok(listing);
        }
        let parts: Vec<String> = split_path(key)?.into_iter().map(str::to_string).collect();
        let dir = self.resolve_parts(&parts)?;
        if dir.filetype != Filetype::Directory {
            return Err(Errno::Notdir);
        }

        self.native_calls.fetch_add(1, Ordering::Relaxed);
        let read_dir = fs::read_dir(&dir.path).map_err(|e| Errno::from_io(&e))?;
        let mut children = Vec::new();
        for item in read_dir {
            let item = item.map_err(|e| Errno::from_io(&e))?;
            let name = item.file_name().to_string_lossy().into_owned();
            let meta = item.metadata().map_err(|e| Errno::from_io(&e))?;
            children.push(NativeEntry::from_metadata(
                join_key(key, &name),
                item.path(),
                &meta,
            ));
        }

        let mut listing: Vec<DirEntry> = children.iter().map(NativeEntry::dir_entry).collect();
        sort_entries(&mut listing);
        let listing = Arc::new(listing);

        let mut entries = lock(&self.entries);
        for child in children {
            entries.entry(child.key.clone()).or_insert(child);
        }
        drop(entries);
        lock(&self.listings).insert(key.to_string(), listing.clone());
        Ok(listing)
    }

    /// Walk the tree ahead of time so guests start with a warm cache.
    ///
    /// With an empty `includes` everything is visited; otherwise only the
    /// directories on the way to, or below, one of the given relative paths.
    /// Returns the number of directories listed.
    pub fn hydrate(&self, includes: &[String]) -> Result<usize, Errno> {
        let includes: Vec<String> = includes
            .iter()
            .map(|inc| split_path(inc).map(|parts| parts.join("/")))
            .collect::<Result<_, _>>()?;
        let wanted = |key: &str| {
            includes.is_empty()
                || includes.iter().any(|inc| {
                    inc.is_empty()
                        || key == inc
                        || key.starts_with(&format!("{}/", inc))
                        || inc.starts_with(&format!("{}/", key))
                })
        };

        let mut pending = vec![String::new()];
        let mut visited = 0;
        while let Some(key) = pending.pop() {
            let listing = self.load_listing(&key)?;
            visited += 1;
            for child in listing.iter().filter(|c| c.filetype == Filetype::Directory) {
                let child_key = join_key(&key, &child.name);
                if wanted(&child_key) {
                    pending.push(child_key);
                }
            }
        }
        log::debug!("hydrated {} directories under {}", visited, self.root.display());
        Ok(visited)
    }
}

/// The cache as seen from one directory
#[derive(Debug, Clone)]
pub struct CacheView {
    cache: Arc<NativeCache>,
    prefix: String,
}

impl CacheView {
    pub fn new(cache: Arc<NativeCache>) -> Self {
        Self {
            cache,
            prefix: String::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn cache(&self) -> &Arc<NativeCache> {
        &self.cache
    }

    /// A view rooted at a resolved subdirectory
    pub fn narrow(&self, entry: &NativeEntry) -> CacheView {
        Self {
            cache: self.cache.clone(),
            prefix: entry.key.clone(),
        }
    }

    fn full_parts(&self, rel: &str) -> Result<Vec<String>, Errno> {
        let mut parts: Vec<String> = split_path(&self.prefix)?.into_iter().map(str::to_string).collect();
        for part in split_path(rel)? {
            parts.push(part.to_string());
        }
        Ok(parts)
    }

    /// Cached entry for `rel`, without touching the host
    pub fn lookup(&self, rel: &str) -> Option<NativeEntry> {
        let parts = self.full_parts(rel).ok()?;
        self.cache.cached(&parts.join("/"))
    }

    /// Resolve `rel` below this view; ready when already memoized
    pub fn resolve(&self, rel: &str) -> Completion<'static, Result<NativeEntry, Errno>> {
        let parts = match self.full_parts(rel) {
            Ok(parts) => parts,
            Err(errno) => return Completion::ready(Err(errno)),
        };
        if let Some(entry) = self.cache.cached(&parts.join("/")) {
            return Completion::ready(Ok(entry));
        }
        let cache = self.cache.clone();
        Completion::pending(async move { cache.resolve_parts(&parts) })
    }

    /// Sorted listing of this view's directory
    pub fn children(&self) -> Completion<'static, Result<Arc<Vec<DirEntry>>, Errno>> {
        if let Some(listing) = self.cache.cached_listing(&self.prefix) {
            return Completion::ready(Ok(listing));
        }
        let cache = self.cache.clone();
        let key = self.prefix.clone();
        Completion::pending(async move { cache.load_listing(&key) })
    }
}
