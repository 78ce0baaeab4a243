//! In-memory filesystem implementation
//!
//! Simple, fast, ephemeral. The supervisor can run on one directly, and
//! every sandbox keeps one as its local mirror of the host tree.

use super::path::{dirname, normalize};
use super::{DirEntry, EntryKind, FileSystem, Metadata, TreeEntry};
use std::collections::BTreeMap;
use std::io;

/// A stored file or directory
#[derive(Clone)]
enum Node {
    File(Vec<u8>),
    Directory,
}

impl Node {
    fn kind(&self) -> EntryKind {
        match self {
            Node::File(_) => EntryKind::File,
            Node::Directory => EntryKind::Directory,
        }
    }
}

/// In-memory filesystem
#[derive(Clone)]
pub struct MemoryFs {
    /// All files and directories, keyed by normalized path. Sorted so that
    /// listings and tree walks are deterministic.
    nodes: BTreeMap<String, Node>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        // Root directory always exists
        nodes.insert("/".to_string(), Node::Directory);
        Self { nodes }
    }

    /// Ensure the parent directory exists
    fn ensure_parent(&self, path: &str) -> io::Result<()> {
        if path == "/" {
            return Ok(());
        }
        let parent = dirname(path);
        match self.nodes.get(&parent) {
            Some(Node::Directory) => Ok(()),
            Some(Node::File(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Not a directory: {}", parent),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Parent directory not found: {}", parent),
            )),
        }
    }

    /// Direct children of a directory path, in name order
    fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        let prefix = child_prefix(dir);
        let plen = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(p, _)| p.starts_with(&prefix))
            .filter(move |(p, _)| {
                let rest = &p[plen..];
                !rest.is_empty() && !rest.contains('/')
            })
    }

    fn walk(&self, dir: &str, out: &mut Vec<TreeEntry>) {
        let (dirs, files): (Vec<_>, Vec<_>) = self
            .children(dir)
            .partition(|(_, node)| matches!(node, Node::Directory));

        for (path, _) in dirs {
            out.push(TreeEntry {
                path: path.clone(),
                kind: EntryKind::Directory,
                content: None,
            });
            self.walk(path, out);
        }

        for (path, node) in files {
            if let Node::File(data) = node {
                out.push(TreeEntry {
                    path: path.clone(),
                    kind: EntryKind::File,
                    content: Some(data.clone()),
                });
            }
        }
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let path = normalize(path);
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Directory) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Is a directory: {}", path),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("File not found: {}", path),
            )),
        }
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> io::Result<()> {
        let path = normalize(path);

        if let Some(Node::Directory) = self.nodes.get(&path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Is a directory: {}", path),
            ));
        }

        self.ensure_parent(&path)?;
        self.nodes.insert(path, Node::File(content.to_vec()));
        Ok(())
    }

    fn list_files(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = normalize(path);

        match self.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Not a directory: {}", path),
                ));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Directory not found: {}", path),
                ));
            }
        }

        Ok(self
            .children(&path)
            .map(|(p, node)| DirEntry {
                name: p[child_prefix(&path).len()..].to_string(),
                kind: node.kind(),
            })
            .collect())
    }

    fn create_dir(&mut self, path: &str) -> io::Result<()> {
        let path = normalize(path);

        if self.nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Path already exists: {}", path),
            ));
        }

        self.ensure_parent(&path)?;
        self.nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        let path = normalize(path);

        if path == "/" {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "Cannot remove root directory",
            ));
        }

        match self.nodes.remove(&path) {
            Some(Node::File(_)) => Ok(()),
            Some(Node::Directory) => {
                let prefix = format!("{}/", path);
                self.nodes.retain(|p, _| !p.starts_with(&prefix));
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Path not found: {}", path),
            )),
        }
    }

    fn stat(&self, path: &str) -> io::Result<Metadata> {
        let path = normalize(path);

        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(Metadata {
                kind: EntryKind::File,
                size: data.len() as u64,
            }),
            Some(Node::Directory) => Ok(Metadata {
                kind: EntryKind::Directory,
                size: 0,
            }),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Path not found: {}", path),
            )),
        }
    }

    fn flatten_tree(&self) -> Vec<TreeEntry> {
        let mut out = Vec::new();
        self.walk("/", &mut out);
        out
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_file_ops() {
        let mut fs = MemoryFs::new();

        fs.write_file("/test.txt", b"hello world").unwrap();
        assert_eq!(fs.read_file("/test.txt").unwrap(), b"hello world");

        fs.write_file("/test.txt", b"replaced").unwrap();
        assert_eq!(fs.read_file("/test.txt").unwrap(), b"replaced");
        assert_eq!(fs.stat("/test.txt").unwrap().size, 8);
    }

    #[test]
    fn test_write_requires_parent() {
        let mut fs = MemoryFs::new();
        let err = fs.write_file("/missing/file.txt", b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        fs.create_dir("/missing").unwrap();
        fs.write_file("/missing/file.txt", b"x").unwrap();
    }

    #[test]
    fn test_list_files_direct_children_only() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/app").unwrap();
        fs.create_dir("/app/lib").unwrap();
        fs.write_file("/app/main.js", b"").unwrap();
        fs.write_file("/app/lib/util.js", b"").unwrap();
        fs.write_file("/apple.txt", b"").unwrap();

        let entries = fs.list_files("/app").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["lib", "main.js"]);
        assert_eq!(entries[0].kind, EntryKind::Directory);

        let root: Vec<_> = fs
            .list_files("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(root, vec!["app", "apple.txt"]);
    }

    #[test]
    fn test_remove_directory_recursively() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/tmp").unwrap();
        fs.create_dir("/tmp/a").unwrap();
        fs.write_file("/tmp/a/x", b"1").unwrap();
        fs.write_file("/tmpfile", b"keep").unwrap();

        fs.remove("/tmp").unwrap();
        assert!(!fs.exists("/tmp"));
        assert!(!fs.exists("/tmp/a/x"));
        assert!(fs.exists("/tmpfile"));
        assert!(fs.remove("/").is_err());
    }

    #[test]
    fn test_flatten_tree_directories_before_contents() {
        let mut fs = MemoryFs::new();
        fs.write_file("/z.txt", b"z").unwrap();
        fs.create_dir("/b").unwrap();
        fs.write_file("/b/file", b"f").unwrap();
        fs.create_dir("/b/inner").unwrap();
        fs.write_file("/b/inner/deep", b"d").unwrap();
        fs.create_dir("/a").unwrap();

        let tree = fs.flatten_tree();
        let paths: Vec<_> = tree.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/a", "/b", "/b/inner", "/b/inner/deep", "/b/file", "/z.txt"]
        );

        // Every entry's parent appears before it
        for (i, entry) in tree.iter().enumerate() {
            let parent = dirname(&entry.path);
            if parent != "/" {
                let pos = paths.iter().position(|p| *p == parent).unwrap();
                assert!(pos < i, "{} emitted before its parent", entry.path);
            }
        }

        assert_eq!(tree[3].content.as_deref(), Some(&b"d"[..]));
        assert!(tree[0].content.is_none());
    }
}
