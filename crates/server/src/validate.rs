//! Submission validation.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::ApiError;

/// Paths under these prefixes are never accepted as audio sources, before
/// or after symlink resolution.
pub const BLOCKED_PATH_PREFIXES: &[&str] =
    &["/etc", "/proc", "/sys", "/dev", "/boot", "/sbin", "/bin", "/lib"];

/// Accepted audio container extensions, case-insensitive.
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "ogg", "mp4", "webm"];

/// Validate a submitted audio path and return it with symlinks resolved.
pub fn validate_audio_path(raw: &str) -> Result<PathBuf, ApiError> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(ApiError::InvalidArgument(format!(
            "audio path must be absolute: {raw}"
        )));
    }
    if is_blocked(path) {
        return Err(ApiError::InvalidArgument(format!(
            "audio path is inside a protected system directory: {raw}"
        )));
    }

    match path.extension().and_then(OsStr::to_str) {
        Some(ext) if AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {}
        _ => {
            return Err(ApiError::InvalidArgument(format!(
                "unsupported audio file extension: {raw}"
            )))
        }
    }

    let resolved = path.canonicalize().map_err(|_| {
        ApiError::InvalidArgument(format!("audio file not found: {raw}"))
    })?;
    if is_blocked(&resolved) {
        return Err(ApiError::InvalidArgument(format!(
            "audio path resolves into a protected system directory: {raw}"
        )));
    }

    let metadata = std::fs::metadata(&resolved)
        .map_err(|_| ApiError::InvalidArgument(format!("audio file not found: {raw}")))?;
    if !metadata.is_file() {
        return Err(ApiError::InvalidArgument(format!(
            "audio path is not a regular file: {raw}"
        )));
    }

    Ok(resolved)
}

/// Reject translation targets outside the supported set.
pub fn validate_translation_target(target: &str) -> Result<(), ApiError> {
    if scribe_engine::ALLOWED_TARGETS.contains(&target) {
        return Ok(());
    }
    Err(ApiError::InvalidArgument(format!(
        "unsupported translation target: {target}"
    )))
}

fn is_blocked(path: &Path) -> bool {
    BLOCKED_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}
