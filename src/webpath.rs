//! Lexical helpers for `/`-separated web paths.
//!
//! Destination paths and publish URIs are virtual paths on the CDN, not
//! filesystem paths, so they are manipulated as plain strings with `/`
//! separators regardless of platform.

/// Cleans a path by purely lexical processing: collapses repeated
/// slashes, eliminates `.` components, and resolves `..` where possible.
///
/// Returns `"."` for an empty result, mirroring the conventional
/// behavior of path cleanup routines.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|c| *c != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
                // ".." at the root of a rooted path is dropped.
            }
            comp => out.push(comp),
        }
    }

    let mut cleaned = String::new();
    if rooted {
        cleaned.push('/');
    }
    cleaned.push_str(&out.join("/"));

    if cleaned.is_empty() {
        ".".to_string()
    } else {
        cleaned
    }
}

/// Joins path elements with `/`, ignoring empty elements, and cleans the
/// result. Returns an empty string if every element is empty.
pub fn join(parts: &[&str]) -> String {
    let joined: Vec<&str> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
    if joined.is_empty() {
        return String::new();
    }
    clean(&joined.join("/"))
}

/// Returns all but the last element of the path. The result is cleaned;
/// if the path is empty or contains no slash, returns `"."`.
pub fn dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => clean(&path[..idx + 1]),
        None => ".".to_string(),
    }
}

/// Returns the last element of the path. Trailing slashes are removed
/// first. Returns `"."` for an empty path and `"/"` if the path consists
/// entirely of slashes.
pub fn base(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(idx) => trimmed[idx + 1..].to_string(),
        None => trimmed.to_string(),
    }
}
