//! Filesystem helpers for the cache directory tree.
//!
//! The on-disk layout is one directory per partition under the versioned
//! cache directory, with one file per entry named by the hex key hash:
//!
//! ```text
//! <base>/
//!   Version N/
//!     <partition>/
//!       <lowercase-hex-hash>
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::trace;

/// Directory entry kinds recognized by [`traverse_directory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// Regular files.
    File,
    /// Subdirectories.
    Directory,
}

/// The OS page granularity, cached after the first query.
pub(crate) fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as u64 }
    })
}

/// Round `n` up to the next multiple of the OS page size.
pub(crate) fn round_up_to_page(n: u64) -> u64 {
    let page = page_size();
    n.div_ceil(page) * page
}

/// Create a directory and all of its parents.
pub(crate) fn make_all_directories(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Size of a file in bytes, or 0 when it cannot be inspected.
pub(crate) fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Delete a file, ignoring failures.
pub(crate) fn delete_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        trace!(path = %path.display(), error = %err, "delete failed");
    }
}

/// Delete a directory if it is empty, ignoring failures.
pub(crate) fn delete_empty_directory(path: &Path) {
    let _ = fs::remove_dir(path);
}

/// Enumerate the names of entries of `kind` directly under `path`.
///
/// A missing or unreadable directory yields nothing. Entries whose names are
/// not valid UTF-8 are skipped; the engine only ever creates ASCII names.
pub(crate) fn traverse_directory(path: &Path, kind: EntryKind, mut f: impl FnMut(&str)) {
    let Ok(entries) = fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let matches = match kind {
            EntryKind::File => file_type.is_file(),
            EntryKind::Directory => file_type.is_dir(),
        };
        if !matches {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            f(name);
        }
    }
}

/// Walk every cache file: each partition directory under `root`, then each
/// file inside it. The callback receives the file name and the partition
/// directory path.
pub(crate) fn traverse_cache_files(root: &Path, mut f: impl FnMut(&str, &Path)) {
    traverse_directory(root, EntryKind::Directory, |partition| {
        let partition_path = root.join(partition);
        traverse_directory(&partition_path, EntryKind::File, |file_name| {
            f(file_name, &partition_path);
        });
    });
}
