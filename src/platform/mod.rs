use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface so call
/// sites stay free of `#[cfg]` blocks.
pub trait Platform {
    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory.
    /// Unix: `~/.signdeck`, Windows: `%APPDATA%\signdeck`.
    fn data_dir() -> PathBuf;
}

/// `SIGNDECK_DATA_DIR` wins over the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("SIGNDECK_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
