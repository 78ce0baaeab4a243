//! POSIX-style path helpers over plain strings
//!
//! Virtual paths are always `/`-separated and never touch the host's
//! `std::path` rules.

/// Collapse `.`, `..` and repeated separators; relative input is rooted at `/`
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolve `rel` against `base`; an absolute `rel` ignores `base`
pub fn join(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        normalize(rel)
    } else {
        normalize(&format!("{}/{}", base, rel))
    }
}

/// Parent directory; the root is its own parent
pub fn dirname(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last path component
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Extension including the dot, or "" when there is none
pub fn extname(path: &str) -> &str {
    let base = basename(path);
    match base.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &base[idx..],
    }
}

/// Every ancestor directory from `dir` up to and including `/`
pub fn ancestors(dir: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = normalize(dir);
    loop {
        out.push(current.clone());
        if current == "/" {
            break;
        }
        current = dirname(&current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/app/src", "./lib.js"), "/app/src/lib.js");
        assert_eq!(join("/app/src", "../pkg"), "/app/pkg");
        assert_eq!(join("/app/src", "/etc/x"), "/etc/x");
    }

    #[test]
    fn test_dirname_basename_extname() {
        assert_eq!(dirname("/a/b/c.js"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
        assert_eq!(basename("/a/b/c.js"), "c.js");
        assert_eq!(extname("/a/b/c.test.js"), ".js");
        assert_eq!(extname("/a/.hidden"), "");
        assert_eq!(extname("/a/noext"), "");
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/a/b"), vec!["/a/b", "/a", "/"]);
        assert_eq!(ancestors("/"), vec!["/"]);
    }
}
