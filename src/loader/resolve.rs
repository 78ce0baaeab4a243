//! Specifier resolution
//!
//! First match wins:
//! 1. built-in name (reserved prefix stripped)
//! 2. absolute path
//! 3. relative path (`./`, `../`) against the requiring module's directory
//! 4. bare name, searched in the `node_modules` of each ancestor directory,
//!    nearest first
//!
//! File probing: the exact path, then each of `EXTENSIONS` appended, then
//! for a directory its `package.json` `main`, then `index` + extension.

use super::builtins::BuiltinModule;
use super::error::{ModuleError, ModuleResult};
use crate::vfs::{self, FileSystem, path};

/// Probed in this order
pub const EXTENSIONS: [&str; 4] = [".js", ".mjs", ".cjs", ".json"];

/// Per-ancestor dependency folder
pub const DEPENDENCY_DIR: &str = "node_modules";

/// Where a specifier points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Builtin(BuiltinModule),
    /// Absolute path of a module file
    File(String),
}

pub fn resolve<F: FileSystem + ?Sized>(fs: &F, specifier: &str, from_dir: &str) -> ModuleResult<Resolved> {
    if let Some(builtin) = BuiltinModule::parse(specifier) {
        return Ok(Resolved::Builtin(builtin));
    }

    let not_found = || ModuleError::NotFound {
        specifier: specifier.to_string(),
        from: from_dir.to_string(),
    };

    if specifier.starts_with('/') {
        return probe(fs, &path::normalize(specifier))
            .map(Resolved::File)
            .ok_or_else(not_found);
    }

    if is_relative(specifier) {
        return probe(fs, &path::join(from_dir, specifier))
            .map(Resolved::File)
            .ok_or_else(not_found);
    }

    for dir in path::ancestors(from_dir) {
        // `a/node_modules/node_modules` is never a search location
        if path::basename(&dir) == DEPENDENCY_DIR {
            continue;
        }
        let candidate = path::join(&path::join(&dir, DEPENDENCY_DIR), specifier);
        if let Some(found) = probe(fs, &candidate) {
            return Ok(Resolved::File(found));
        }
    }
    Err(not_found())
}

fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

fn is_file<F: FileSystem + ?Sized>(fs: &F, p: &str) -> bool {
    fs.stat(p).map(|m| !m.kind.is_dir()).unwrap_or(false)
}

fn is_dir<F: FileSystem + ?Sized>(fs: &F, p: &str) -> bool {
    fs.stat(p).map(|m| m.kind.is_dir()).unwrap_or(false)
}

/// Exact file, then extensions
fn probe_file<F: FileSystem + ?Sized>(fs: &F, p: &str) -> Option<String> {
    if is_file(fs, p) {
        return Some(p.to_string());
    }
    EXTENSIONS
        .iter()
        .map(|ext| format!("{}{}", p, ext))
        .find(|candidate| is_file(fs, candidate))
}

fn probe_index<F: FileSystem + ?Sized>(fs: &F, dir: &str) -> Option<String> {
    EXTENSIONS
        .iter()
        .map(|ext| path::join(dir, &format!("index{}", ext)))
        .find(|candidate| is_file(fs, candidate))
}

/// The package's declared entry point, if it names an existing file
fn package_main<F: FileSystem + ?Sized>(fs: &F, dir: &str) -> Option<String> {
    let manifest = vfs::read_to_string(fs, &path::join(dir, "package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest).ok()?;
    let main = manifest.get("main")?.as_str()?;
    let entry = path::join(dir, main);
    probe_file(fs, &entry).or_else(|| if is_dir(fs, &entry) { probe_index(fs, &entry) } else { None })
}

/// Full probe of one candidate path
pub fn probe<F: FileSystem + ?Sized>(fs: &F, p: &str) -> Option<String> {
    if let Some(found) = probe_file(fs, p) {
        return Some(found);
    }
    if is_dir(fs, p) {
        return package_main(fs, p).or_else(|| probe_index(fs, p));
    }
    None
}
