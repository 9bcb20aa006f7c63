//! Deterministic directory traversal for archive inputs.
//!
//! Entries come back in file-name order so the same inputs always produce
//! the same archive layout.

use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Exclude patterns (substring of the file name)
    pub exclude_patterns: Vec<String>,
}

/// One entry to place in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Full path on disk
    pub path: PathBuf,

    /// Path inside the archive: the input's rootless path plus the relative path
    pub archive_path: PathBuf,

    /// File size in bytes (0 for directories)
    pub size: u64,

    pub is_dir: bool,
}

/// Walk one archive input (a file or a directory tree).
///
/// # Returns
/// * `Ok(Vec<EntryInfo>)` - The input itself followed by its descendants
/// * `Err(io::Error)` - If the input or a descendant cannot be read
pub fn walk_input(input: &Path, options: &WalkOptions) -> std::io::Result<Vec<EntryInfo>> {
    let base = archive_base(input)?;

    let walker = WalkDir::new(input)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    let mut entries = Vec::new();
    let mut iter = walker.into_iter();
    while let Some(entry) = iter.next() {
        let entry = entry?;

        if entry.depth() > 0 && should_exclude(&entry, &options.exclude_patterns) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        let relative = entry.path().strip_prefix(input).unwrap_or(entry.path());
        let archive_path = if relative.as_os_str().is_empty() {
            base.clone()
        } else {
            base.join(relative)
        };
        let metadata = entry.metadata()?;
        entries.push(EntryInfo {
            path: entry.path().to_path_buf(),
            archive_path,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
        });
    }

    Ok(entries)
}

/// Archive name of an input: its full path without the root, as `tar` stores
/// absolute members (`/srv/a/uploads` becomes `srv/a/uploads`).
pub fn archive_base(input: &Path) -> std::io::Result<PathBuf> {
    let invalid = || {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} cannot be stored in an archive", input.display()),
        )
    };

    let mut base = PathBuf::new();
    for component in input.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return Err(invalid()),
            Component::Normal(part) => base.push(part),
        }
    }
    if base.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(base)
}

/// Calculate total size of all files under an input
pub fn calculate_total_size(input: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    Ok(walk_input(input, options)?.iter().map(|e| e.size).sum())
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
