//! Query-tool extension discovery.
//!
//! Resolution order, first existing file wins:
//! 1. Explicitly configured path (`OsqueryExtensionPath`)
//! 2. Bundled resource next to the app bundle (`../Resources/<name>`)
//! 3. Alongside the running executable
//! 4. Standard install location
//! 5. Development-relative source paths
//!
//! If nothing exists the extension tier is unavailable and the engine runs
//! simple-tier only.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

/// File name of the bundled extension.
pub const EXTENSION_FILE_NAME: &str = "macadmins_extension.ext";

/// Standard install location for the extension.
pub const STANDARD_EXTENSION_PATH: &str = "/usr/local/reportmate/macadmins_extension.ext";

/// Ordered list of fallback locations for the extension file.
#[derive(Debug, Clone)]
pub struct ExtensionLocator {
    candidates: Vec<PathBuf>,
}

impl ExtensionLocator {
    /// Locator using the real executable location and standard paths.
    pub fn system() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf));
        Self::for_executable_dir(exe_dir.as_deref())
    }

    /// Locator for a given executable directory (None if unknown).
    pub fn for_executable_dir(exe_dir: Option<&Path>) -> Self {
        let mut candidates = Vec::new();
        if let Some(dir) = exe_dir {
            candidates.push(dir.join("../Resources").join(EXTENSION_FILE_NAME));
            candidates.push(dir.join(EXTENSION_FILE_NAME));
        }
        candidates.push(PathBuf::from(STANDARD_EXTENSION_PATH));
        candidates.push(PathBuf::from("extensions").join(EXTENSION_FILE_NAME));
        candidates.push(PathBuf::from("../extensions").join(EXTENSION_FILE_NAME));
        candidates.push(PathBuf::from("resources").join(EXTENSION_FILE_NAME));
        ExtensionLocator { candidates }
    }

    /// Locator with an explicit candidate list.
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        ExtensionLocator { candidates }
    }

    /// Locator that never finds anything (extension tier disabled).
    pub fn none() -> Self {
        ExtensionLocator {
            candidates: Vec::new(),
        }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Resolve the extension path, preferring an explicitly configured one.
    pub fn locate(&self, configured: Option<&Path>) -> Option<PathBuf> {
        let explicit = configured.filter(|p| !p.as_os_str().is_empty());
        for candidate in explicit.into_iter().chain(self.candidates.iter().map(PathBuf::as_path)) {
            trace!(path = %candidate.display(), "checking extension candidate");
            if candidate.is_file() {
                debug!(path = %candidate.display(), "resolved query extension");
                return Some(candidate.to_path_buf());
            }
        }
        debug!("no query extension found; simple tier only");
        None
    }
}

impl Default for ExtensionLocator {
    fn default() -> Self {
        Self::system()
    }
}
