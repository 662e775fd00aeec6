//! Source files: discovery, decompression and the processed-file marker
//!
//! A pattern is `<dir>/<regex>`. The regex is matched against bare file
//! names, unanchored. Directories and dot-files are never returned, so a
//! file renamed by [`dot_rename`] drops out of the next run.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{LoadError, Result};

/// Decompressed, buffered line source for one file
pub type GzipLines = BufReader<MultiGzDecoder<File>>;

/// Prefix that marks a file as processed
pub const PROCESSED_MARKER: char = '.';

/// Split `pattern` into the directory to list and the file name regex.
pub fn split_pattern(pattern: &str) -> (PathBuf, &str) {
    match pattern.rsplit_once('/') {
        Some(("", regex)) => (PathBuf::from("/"), regex),
        Some((dir, regex)) => (PathBuf::from(dir), regex),
        None => (PathBuf::from("."), pattern),
    }
}

/// List files under the pattern's directory whose names match its regex,
/// sorted by name.
pub fn discover(pattern: &str) -> Result<Vec<PathBuf>> {
    let (dir, file_regex) = split_pattern(pattern);
    if file_regex.is_empty() {
        warn!(
            "File pattern '{}' is a bare directory; every file in {} will be processed",
            pattern,
            dir.display()
        );
    }

    let matcher = Regex::new(file_regex).map_err(|e| LoadError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let entries = std::fs::read_dir(&dir).map_err(|source| LoadError::Discovery {
        dir: dir.clone(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::Discovery {
            dir: dir.clone(),
            source,
        })?;

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            debug!("Skipping non UTF-8 file name {:?}", entry.file_name());
            continue;
        };
        if name.starts_with(PROCESSED_MARKER) || !matcher.is_match(name) {
            continue;
        }

        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            continue;
        }
        files.push(entry.path());
    }

    files.sort();
    debug!(dir = %dir.display(), count = files.len(), "Discovered source files");
    Ok(files)
}

/// Open a gzip file for line-by-line reading
pub fn open_gzip(path: &Path) -> std::io::Result<GzipLines> {
    let file = File::open(path)?;
    Ok(BufReader::new(MultiGzDecoder::new(file)))
}

/// Rename `dir/name` to `dir/.name` and return the new path
pub fn dot_rename(path: &Path) -> std::io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;

    let mut dotted = std::ffi::OsString::from(PROCESSED_MARKER.to_string());
    dotted.push(name);
    let target = path.with_file_name(dotted);

    std::fs::rename(path, &target)?;
    Ok(target)
}
