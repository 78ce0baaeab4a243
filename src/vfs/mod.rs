//! Virtual File System adapter
//!
//! The kernel does not own storage. It consumes whatever hierarchical store
//! the host hands it through the `FileSystem` trait: the supervisor answers
//! filesystem syscalls with it and flattens it into every new process.
//!
//! `MemoryFs` is the in-memory implementation. Sandboxes use one as the
//! local mirror that `write-virtual-entry` messages populate.

pub mod memory;
pub mod path;

pub use memory::MemoryFs;

use serde::{Deserialize, Serialize};
use std::io;

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub kind: EntryKind,
    pub size: u64,
}

/// One node of a flattened tree
///
/// Directories carry no content. Files carry their bytes so the supervisor
/// can move them into the process without another lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub kind: EntryKind,
    pub content: Option<Vec<u8>>,
}

/// The storage collaborator
pub trait FileSystem {
    /// Read a whole file
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Create or replace a file; the parent directory must exist
    fn write_file(&mut self, path: &str, content: &[u8]) -> io::Result<()>;

    /// List the direct children of a directory
    fn list_files(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    /// Create one directory; the parent must exist
    fn create_dir(&mut self, path: &str) -> io::Result<()>;

    /// Remove a file, or a directory with everything below it
    fn remove(&mut self, path: &str) -> io::Result<()>;

    /// Get file metadata
    fn stat(&self, path: &str) -> io::Result<Metadata>;

    /// Every node except the root, pre-order, directories before the files
    /// they contain
    fn flatten_tree(&self) -> Vec<TreeEntry>;

    /// Check if path exists
    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }
}

/// Convenience wrapper for reading a file as UTF-8
pub fn read_to_string<F: FileSystem + ?Sized>(fs: &F, path: &str) -> io::Result<String> {
    let bytes = fs.read_file(path)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Create a directory and any missing ancestors
pub fn create_dir_all<F: FileSystem + ?Sized>(fs: &mut F, dir: &str) -> io::Result<()> {
    let dir = path::normalize(dir);
    if dir == "/" {
        return Ok(());
    }

    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match fs.stat(&current) {
            Ok(meta) if meta.kind.is_dir() => continue,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("Not a directory: {}", current),
                ));
            }
            Err(_) => fs.create_dir(&current)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dir_all_is_idempotent() {
        let mut fs = MemoryFs::new();
        create_dir_all(&mut fs, "/a/b/c").unwrap();
        create_dir_all(&mut fs, "/a/b/c").unwrap();
        assert!(fs.stat("/a/b").unwrap().kind.is_dir());
        assert!(fs.exists("/a/b/c"));
    }

    #[test]
    fn test_create_dir_all_through_file_fails() {
        let mut fs = MemoryFs::new();
        fs.write_file("/f", b"x").unwrap();
        assert!(create_dir_all(&mut fs, "/f/sub").is_err());
    }

    #[test]
    fn test_read_to_string() {
        let mut fs = MemoryFs::new();
        fs.write_file("/hello.txt", b"hi").unwrap();
        assert_eq!(read_to_string(&fs, "/hello.txt").unwrap(), "hi");

        fs.write_file("/bin.dat", &[0xff, 0xfe]).unwrap();
        let err = read_to_string(&fs, "/bin.dat").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
