//! Unit directory contents.

use docflow_protocol::defaults::{AUDIT_LOG_FILE_NAME, MANIFEST_FILE_NAME};
use std::io;
use std::path::Path;
use walkdir::WalkDir;

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Content files of a unit, relative to its directory, `/`-separated, sorted.
///
/// Hidden entries (`.superseded/`, temp files) and the store's own files
/// are not content.
pub fn list_unit_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory walk failed"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if rel == MANIFEST_FILE_NAME || rel == AUDIT_LOG_FILE_NAME {
            continue;
        }
        files.push(rel);
    }
    files.sort();
    Ok(files)
}
