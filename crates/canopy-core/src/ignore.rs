//! Gitignore-style rule matching.
//!
//! Each directory may carry an ignore file; rules accumulate from the mount
//! root down, with deeper files taking precedence. A rule decided by a
//! deeper file is never overridden by a shallower one.

use crate::path::RelativePath;
use std::sync::Arc;

/// A compiled rule from one line of an ignore file.
#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: String,
    /// True if this rule negates (starts with `!`).
    negated: bool,
    /// True if this rule only matches directories (ends with `/`).
    dir_only: bool,
    /// True if this pattern is anchored to the ignore file's directory
    /// (contains a `/` that is not at the end).
    anchored: bool,
}

impl IgnoreRule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut pattern = line.to_string();
        let mut negated = false;
        let mut dir_only = false;

        if let Some(stripped) = pattern.strip_prefix('!') {
            negated = true;
            pattern = stripped.to_string();
        }
        if let Some(stripped) = pattern.strip_suffix('/') {
            dir_only = true;
            pattern = stripped.to_string();
        }

        let anchored = pattern.contains('/');
        if let Some(stripped) = pattern.strip_prefix('/') {
            pattern = stripped.to_string();
        }
        if pattern.is_empty() {
            return None;
        }

        Some(IgnoreRule {
            pattern,
            negated,
            dir_only,
            anchored,
        })
    }

    fn matches(&self, rel: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            glob_match(&self.pattern, rel)
        } else {
            // Unanchored patterns match the basename at any depth.
            let basename = rel.rsplit('/').next().unwrap_or(rel);
            glob_match(&self.pattern, basename) || glob_match(&self.pattern, rel)
        }
    }
}

/// The parsed contents of one ignore file.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFile {
    rules: Vec<IgnoreRule>,
}

impl IgnoreFile {
    pub fn parse(contents: &[u8]) -> Self {
        let text = String::from_utf8_lossy(contents);
        IgnoreFile {
            rules: text.lines().filter_map(IgnoreRule::parse).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The decision of this file for `rel` (a path relative to the file's
    /// directory), or `None` if no rule matches. The last matching rule wins.
    fn decide(&self, rel: &str, is_dir: bool) -> Option<bool> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(rel, is_dir))
            .map(|rule| !rule.negated)
    }
}

/// A stack of ignore files accumulated while walking down from the root.
///
/// Shared via `Arc` so that concurrent subtree walks can hold onto the stack
/// independently of their parents.
pub struct IgnoreStack {
    parent: Option<Arc<IgnoreStack>>,
    /// Directory (mount-relative) this ignore file was loaded from.
    base: RelativePath,
    file: IgnoreFile,
}

impl IgnoreStack {
    pub fn empty() -> Arc<Self> {
        Arc::new(IgnoreStack {
            parent: None,
            base: RelativePath::root(),
            file: IgnoreFile::default(),
        })
    }

    /// Push the ignore file of the directory at `base` onto the stack.
    pub fn push(self: &Arc<Self>, base: RelativePath, file: IgnoreFile) -> Arc<IgnoreStack> {
        Arc::new(IgnoreStack {
            parent: Some(Arc::clone(self)),
            base,
            file,
        })
    }

    /// Whether `path` (mount-relative) is excluded by the accumulated rules.
    pub fn is_ignored(&self, path: &RelativePath, is_dir: bool) -> bool {
        let mut level = Some(self);
        while let Some(stack) = level {
            if let Some(rel) = relative_to(stack.base.as_str(), path.as_str()) {
                if let Some(decision) = stack.file.decide(rel, is_dir) {
                    return decision;
                }
            }
            level = stack.parent.as_deref();
        }
        false
    }
}

/// Strip `base` from the front of `path`, or `None` if `path` is not inside.
fn relative_to<'a>(base: &str, path: &'a str) -> Option<&'a str> {
    if base.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(base)?;
    rest.strip_prefix('/')
}

/// Gitignore-flavored glob matching: `*` and `?` do not cross `/`, while
/// `**` matches any number of path components.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t)
}

fn glob_match_inner(p: &[char], t: &[char]) -> bool {
    let Some(&first) = p.first() else {
        return t.is_empty();
    };
    match first {
        '*' if p.get(1) == Some(&'*') => {
            let mut rest = &p[2..];
            while rest.first() == Some(&'*') {
                rest = &rest[1..];
            }
            for i in 0..=t.len() {
                if glob_match_inner(rest, &t[i..]) {
                    return true;
                }
                // "a/**/b" also matches "a/b": allow the separator after
                // `**` to be swallowed along with zero components.
                if rest.first() == Some(&'/') && glob_match_inner(&rest[1..], &t[i..]) {
                    return true;
                }
            }
            false
        }
        '*' => {
            for i in 0..=t.len() {
                if glob_match_inner(&p[1..], &t[i..]) {
                    return true;
                }
                if i < t.len() && t[i] == '/' {
                    return false;
                }
            }
            false
        }
        '?' => !t.is_empty() && t[0] != '/' && glob_match_inner(&p[1..], &t[1..]),
        c => t.first() == Some(&c) && glob_match_inner(&p[1..], &t[1..]),
    }
}
