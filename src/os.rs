//! Thin wrapper around the OS-level file primitives the spec treats as an
//! external collaborator (open/read/write/close/attributes/enumerate/delete).
//!
//! This is deliberately not abstracted behind a `Platform` trait the way a
//! multi-target filesystem layer would be: the spec only asks for "OS file
//! primitives", not cross-platform parity, so a direct `std::fs` wrapper is
//! the idiomatic amount of indirection.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::IoError;

/// Attributes used by candidate-path resolution in the file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttributes {
    pub exists: bool,
    pub is_dir: bool,
    pub is_dot: bool,
}

pub fn get_file_attributes(path: &str) -> FileAttributes {
    let is_dot = matches!(
        Path::new(path).file_name().and_then(|n| n.to_str()),
        Some(".") | Some("..")
    );
    match fs::metadata(path) {
        Ok(meta) => FileAttributes {
            exists: true,
            is_dir: meta.is_dir(),
            is_dot,
        },
        Err(_) => FileAttributes {
            exists: false,
            is_dir: false,
            is_dot,
        },
    }
}

/// Opaque handle to an opened OS file.
pub struct OpenFile {
    file: File,
}

pub fn open_for_read(path: &str) -> Result<OpenFile, IoError> {
    File::open(path)
        .map(|file| OpenFile { file })
        .map_err(|_| IoError::FailedOpening)
}

pub fn open_for_write(path: &str) -> Result<OpenFile, IoError> {
    File::create(path)
        .map(|file| OpenFile { file })
        .map_err(|_| IoError::FailedOpening)
}

pub fn file_size(open: &OpenFile) -> u64 {
    open.file.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Read up to `buf.len()` bytes into `buf`, reporting `(bytes_read, eof)`.
pub fn read_bytes(open: &mut OpenFile, buf: &mut [u8]) -> Result<(usize, bool), IoError> {
    match open.file.read(buf) {
        Ok(0) => Ok((0, true)),
        Ok(n) => Ok((n, false)),
        Err(_) => Err(IoError::FailedReading),
    }
}

pub fn write_bytes(open: &mut OpenFile, buf: &[u8]) -> Result<(), IoError> {
    open.file.write_all(buf).map_err(|_| IoError::FailedWriting)
}

pub fn close(_open: OpenFile) {
    // Dropping `OpenFile` closes the underlying descriptor.
}

/// Resolve `path` to an absolute, lexically-normalized form for reporting.
pub fn absolute_path(path: &str) -> String {
    match fs::canonicalize(path) {
        Ok(abs) => abs.to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

/// Ensure the directory containing `path` exists, creating it (and parents)
/// if necessary.
pub fn carve_directory_path(path: &str) -> Result<(), IoError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            return fs::create_dir_all(parent).map_err(|_| IoError::FailedCreatingDir);
        }
    }
    Ok(())
}

pub fn enumerate_files(directory: &str) -> Vec<String> {
    fs::read_dir(directory)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect()
}

pub fn delete_directory(directory: &str) -> bool {
    fs::remove_dir_all(directory).is_ok()
}

pub fn delete_file(path: &str) -> bool {
    fs::remove_file(path).is_ok()
}

/// Join `root` and `path` the way the source's candidate-path builder does:
/// no separator is inserted if `root` already ends with one.
pub fn join_candidate(root: &str, path: &str) -> String {
    if root.ends_with('/') || root.ends_with(std::path::MAIN_SEPARATOR) {
        format!("{root}{path}")
    } else {
        format!("{root}{}{path}", std::path::MAIN_SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_candidate_avoids_double_separator() {
        let sep = std::path::MAIN_SEPARATOR;
        assert_eq!(join_candidate("root", "file.ply"), format!("root{sep}file.ply"));
        assert_eq!(
            join_candidate(&format!("root{sep}"), "file.ply"),
            format!("root{sep}file.ply")
        );
    }

    #[test]
    fn missing_file_has_no_attributes() {
        let attrs = get_file_attributes("/does/not/exist/anywhere.ply");
        assert!(!attrs.exists);
    }
}
