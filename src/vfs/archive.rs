//! Read-only memory trees unpacked from zip archives
//!
//! A repository snapshot can arrive as archive bytes instead of a host
//! directory. The archive is unpacked once into a [`MemoryFs`] whose files
//! are all read-only; every guest granted the tree shares it.
//!
//! macOS resource forks (`__MACOSX/`) and editor swap files (`*.crswap`)
//! are skipped.

use std::io::{Cursor, Read};

use zip::ZipArchive;
use zip::result::ZipError;

use super::MemoryFs;
use crate::kernel::wasm::Errno;

/// Errors that can occur while unpacking an archive
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid zip archive: {0}")]
    Zip(#[from] ZipError),

    #[error("failed to read archive entry '{name}': {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot place archive entry '{name}': {errno}")]
    Entry { name: String, errno: Errno },
}

/// Whether an archive entry belongs in the tree
pub fn keep_entry(name: &str) -> bool {
    !name.starts_with("__MACOSX") && !name.ends_with(".crswap")
}

impl MemoryFs {
    /// Unpack zip `bytes` into a fresh read-only tree
    pub fn from_zip(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let fs = MemoryFs::new();
        let mut skipped = 0;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            if !keep_entry(&name) {
                skipped += 1;
                continue;
            }

            let placed = if entry.is_dir() {
                fs.create_dir_all(&name)
            } else {
                let mut contents = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut contents)
                    .map_err(|source| ArchiveError::Read {
                        name: name.clone(),
                        source,
                    })?;
                fs.write_readonly_file(&name, contents)
            };
            placed.map_err(|errno| ArchiveError::Entry { name, errno })?;
        }

        log::debug!("unpacked {} archive entries ({} skipped)", archive.len() - skipped, skipped);
        Ok(fs)
    }
}
