//! Atomic file writes for the cache directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Suffix marker for in-flight temporary files.
pub const TEMP_MARKER: &str = ".tmp.";

/// Write `bytes` to `path` via a temporary sibling and rename.
///
/// Parent directories are created as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("cache");
    let tmp_path = path.with_file_name(format!(
        "{}{}{}",
        file_name,
        TEMP_MARKER,
        std::process::id()
    ));

    let written = File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });

    if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

/// Whether a file name belongs to an in-flight temporary write.
pub fn is_temp_file(name: &str) -> bool {
    name.contains(TEMP_MARKER)
}
