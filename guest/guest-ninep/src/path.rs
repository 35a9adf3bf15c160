//! Path handling for walk requests.
//!
//! Walks happen one component at a time, so paths must already be in
//! canonical form: no `.` or `..` steps, no empty components. An
//! optional leading slash is accepted and means the same as no slash;
//! everything is relative to the attach root.

use alloc::vec::Vec;

/// Whether `path` can be turned into a walk without rewriting.
///
/// The empty path is canonical (it names the root and walks zero
/// steps). Trailing slashes, doubled slashes, and `.`/`..` components
/// are not.
#[must_use]
pub fn path_canonical(path: &str) -> bool {
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return true;
    }
    path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// The walk steps of a canonical path, in order. Empty for the root.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Vec::new();
    }
    path.split('/').collect()
}
