//! Host platform services
//!
//! The loader and the file output never talk to the environment directly;
//! everything platform-specific funnels through this module: the current
//! executable name (used to select the matching `<process>` section),
//! executable-name adjustment, the user's home directory, and the path
//! separator.

use std::env;
use std::path::{PathBuf, MAIN_SEPARATOR};

/// Name of the currently running executable, without any directory prefix.
///
/// Returns an empty string when the executable path cannot be determined;
/// in that case no `<process>` section will ever match, which degrades to
/// an empty configuration rather than a failure.
pub fn current_process_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}

/// Adjust a configured process base name to the platform's executable
/// naming convention.
#[cfg(windows)]
pub fn executable_name(base_name: &str) -> String {
    if base_name.to_ascii_lowercase().ends_with(".exe") {
        base_name.to_string()
    } else {
        format!("{}.exe", base_name)
    }
}

/// Adjust a configured process base name to the platform's executable
/// naming convention.
#[cfg(not(windows))]
pub fn executable_name(base_name: &str) -> String {
    base_name.to_string()
}

/// Whether two executable names refer to the same program. Windows
/// filesystems are case-preserving but case-insensitive.
#[cfg(windows)]
pub fn process_names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Whether two executable names refer to the same program.
#[cfg(not(windows))]
pub fn process_names_equal(a: &str, b: &str) -> bool {
    a == b
}

/// The user's home directory, falling back to the current directory when
/// the home cannot be determined.
pub fn user_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// The platform's path separator character.
pub fn path_separator() -> char {
    MAIN_SEPARATOR
}
