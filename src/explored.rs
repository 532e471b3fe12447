//! Explored-path set — tracks which directories a single recursive
//! operation has already listed, so a symlink loop or a server-side cycle
//! cannot make the worker explore forever.
//!
//! Grounded on the habit elsewhere in this codebase of keeping small owned
//! collections on the operation rather than reaching for an external set
//! crate (`FtpPool`/`TransferQueue` are both hand-rolled over
//! `HashMap`/`VecDeque`). A sorted `Vec` with binary search is kept rather
//! than swapped for `BTreeSet`, which would not expose the
//! length-then-bytes ordering the two cycle-detection kinds below rely on.

use crate::path::ServerPathSyntax;

/// Two distinct ways a recursive directory walk can loop back on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// The same path was already explored earlier in this same operation —
    /// a symlink (or server alias) pointing back into already-visited
    /// territory.
    AlreadyExplored,
    /// The candidate path is an ancestor of (or identical to) a path
    /// already on the current descent stack — a direct self-reference.
    SelfReferential,
}

/// Sorted-by-`(length, bytes)` set of explored paths for one operation.
/// Sorting by length first makes the "is this a prefix of something
/// shorter we already hold" self-reference check a cheap adjacent scan
/// instead of an `O(n)` substring search.
pub struct ExploredPathSet {
    syntax: ServerPathSyntax,
    paths: Vec<String>,
}

fn sort_key(syntax: ServerPathSyntax, p: &str) -> (usize, String) {
    let normalized = match syntax {
        ServerPathSyntax::Unix => p.to_string(),
        _ => p.to_ascii_lowercase(),
    };
    (normalized.len(), normalized)
}

impl ExploredPathSet {
    pub fn new(syntax: ServerPathSyntax) -> Self {
        Self {
            syntax,
            paths: Vec::new(),
        }
    }

    fn position(&self, path: &str) -> Result<usize, usize> {
        let key = sort_key(self.syntax, path);
        self.paths
            .binary_search_by_key(&key, |p| sort_key(self.syntax, p))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.position(path).is_ok()
    }

    /// Insert `path`, returning `false` if it (or an equivalent under the
    /// dialect's case rule) was already present.
    pub fn insert(&mut self, path: &str) -> bool {
        match self.position(path) {
            Ok(_) => false,
            Err(idx) => {
                self.paths.insert(idx, path.to_string());
                true
            }
        }
    }

    /// Classify whether a CWD-then-PWD round trip closed a cycle, one of
    /// two kinds: (1) the server's `PWD` reply resolved to a strict,
    /// shorter prefix of the path the worker actually requested —
    /// a symlink (or other alias) the server resolved upward past where it
    /// was asked to go; (2) the resolved path is one this operation has
    /// already explored in full. Ordinary recursive descent into a fresh
    /// subdirectory resolves to exactly the path requested and is never
    /// flagged — only an exact match against a prior listing, or a PWD
    /// reply shorter than the request, counts.
    pub fn check_cycle(&self, requested: &str, resolved: &str) -> Option<CycleKind> {
        if !crate::path::is_same(self.syntax, requested, resolved)
            && crate::path::is_prefix_of(self.syntax, resolved, requested)
        {
            return Some(CycleKind::SelfReferential);
        }
        if self.contains(resolved) {
            return Some(CycleKind::AlreadyExplored);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut set = ExploredPathSet::new(ServerPathSyntax::Unix);
        assert!(set.insert("/pub"));
        assert!(set.contains("/pub"));
        assert!(!set.insert("/pub"));
    }

    #[test]
    fn windows_paths_compare_case_insensitively() {
        let mut set = ExploredPathSet::new(ServerPathSyntax::Windows);
        set.insert("C:\\Pub");
        assert!(set.contains("c:\\pub"));
    }

    #[test]
    fn revisiting_an_already_explored_resolved_path_is_a_cycle() {
        let mut set = ExploredPathSet::new(ServerPathSyntax::Unix);
        set.insert("/pub/sub");
        assert_eq!(set.check_cycle("/pub/sub", "/pub/sub"), Some(CycleKind::AlreadyExplored));
    }

    #[test]
    fn pwd_resolving_to_a_shorter_ancestor_is_self_referential() {
        let set = ExploredPathSet::new(ServerPathSyntax::Unix);
        // CWD "/a/link/deep" but the server's PWD reports only "/a" —
        // the link resolved upward past where the worker asked to go.
        assert_eq!(set.check_cycle("/a/link/deep", "/a"), Some(CycleKind::SelfReferential));
    }

    #[test]
    fn ordinary_descent_into_a_fresh_subdirectory_is_not_a_cycle() {
        let mut set = ExploredPathSet::new(ServerPathSyntax::Unix);
        set.insert("/pub");
        // Exploring "/pub/sub" right after "/pub" resolves to exactly what
        // was requested and must not trip the ancestor-prefix check.
        assert_eq!(set.check_cycle("/pub/sub", "/pub/sub"), None);
    }

    #[test]
    fn unrelated_sibling_paths_are_not_a_cycle() {
        let mut set = ExploredPathSet::new(ServerPathSyntax::Unix);
        set.insert("/pub/one");
        assert_eq!(set.check_cycle("/pub/two", "/pub/two"), None);
    }
}
