//! Lexical path handling for sandbox-internal paths.

use crate::error::{Error, Result};

/// Resolve `path` to an absolute, normalised sandbox path.
///
/// Relative paths are taken from `work_dir`. `.` and `..` are resolved
/// lexically; nothing here consults the environment.
pub fn normalize(path: &str, work_dir: &str) -> Result<String> {
    if path.starts_with('~') {
        return Err(Error::path_not_allowed(
            path,
            "home-relative paths are not supported",
        ));
    }
    if path.starts_with("\\\\") || is_drive_path(path) {
        return Err(Error::path_not_allowed(path, "Windows paths are not supported"));
    }

    let joined = if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() {
        work_dir.to_string()
    } else {
        format!("{}/{}", work_dir.trim_end_matches('/'), path)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::path_not_allowed(path, "escapes the sandbox root"));
                }
            }
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// `C:`, `C:\...` or `C:/...`. A name like `a:b` is an ordinary file name.
fn is_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes.get(2), None | Some(b'\\') | Some(b'/'))
}

/// Check a normalised path against allowed prefixes. No prefixes means
/// everything is allowed.
pub fn check_allowed(path: &str, allowed: &[String]) -> Result<()> {
    if allowed.is_empty() || allowed.iter().any(|prefix| is_under(path, prefix)) {
        return Ok(());
    }
    Err(Error::path_not_allowed(
        path,
        format!("is outside the allowed paths ({})", allowed.join(", ")),
    ))
}

/// True if `path` equals `prefix` or lies below it, segment-wise.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
