//! FileInfo, digest utilities and APT index-file extraction.

mod fileinfo;
mod parser;

pub use fileinfo::{copy_with_file_info, FileInfo};
pub use parser::{extract_file_info, is_supported, support_by_hash, Fields};

/// Whether `p` is a clean relative POSIX path: non-empty, not
/// absolute, and free of empty, `.` and `..` components.
pub(crate) fn is_clean_path(p: &str) -> bool {
    !p.is_empty() && p.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}
