//! Listing cache — the one component that is a true cross-operation
//! singleton, guarded by a mutex rather than threaded through per-operation
//! `Context`s like everything else.
//!
//! Grounded on the `TRANSFER_PROGRESS` global
//! (`lazy_static! { static ref ...: StdMutex<HashMap<...>> }` in
//! `sorng-ftp::ftp::mod`) for the "global singleton behind a std `Mutex`"
//! shape, generalized from a progress map to a listing cache with an LRU
//! eviction policy and an explicit invalidation contract.

use crate::parser::types::FileData;
use std::collections::HashMap;
use std::sync::Mutex;

/// Identifies one cached directory listing. Two listings of the same path
/// with a different `LIST` command or TLS posture are not interchangeable
/// — a server can legally answer `MLSD` and `LIST` differently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub list_command: String,
    pub tls: bool,
}

struct CacheEntry {
    entries: Vec<FileData>,
    last_used: u64,
}

/// Byte-budgeted, LRU-by-counter listing cache.
pub struct ListingCache {
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<CacheKey, CacheEntry>,
    max_bytes: usize,
    used_bytes: usize,
    counter: u64,
}

fn approx_size(entries: &[FileData]) -> usize {
    entries
        .iter()
        .map(|e| e.name.len() + e.permissions.as_ref().map(String::len).unwrap_or(0) + 96)
        .sum()
}

impl ListingCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                max_bytes,
                used_bytes: 0,
                counter: 0,
            }),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Vec<FileData>> {
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let counter = inner.counter;
        let entry = inner.map.get_mut(key)?;
        entry.last_used = counter;
        Some(entry.entries.clone())
    }

    /// Insert a freshly-fetched listing, or overwrite a stale one. Evicts
    /// the least-recently-used entries until the new one fits the budget.
    pub fn insert_or_update(&self, key: CacheKey, entries: Vec<FileData>) {
        let size = approx_size(&entries);
        let mut inner = self.inner.lock().unwrap();
        inner.counter += 1;
        let counter = inner.counter;

        if let Some(old) = inner.map.remove(&key) {
            inner.used_bytes = inner.used_bytes.saturating_sub(approx_size(&old.entries));
        }

        while inner.used_bytes + size > inner.max_bytes && !inner.map.is_empty() {
            let victim = inner
                .map
                .iter()
                .min_by_key(|(_, v)| v.last_used)
                .map(|(k, _)| k.clone());
            if let Some(victim_key) = victim {
                if let Some(removed) = inner.map.remove(&victim_key) {
                    inner.used_bytes = inner.used_bytes.saturating_sub(approx_size(&removed.entries));
                }
            } else {
                break;
            }
        }

        inner.used_bytes += size;
        inner.map.insert(
            key,
            CacheEntry {
                entries,
                last_used: counter,
            },
        );
    }

    /// Drop every cached listing at or below `path` (component-prefix,
    /// dialect-aware) for one server. Called after any `Delete`,
    /// `ChangeAttrs`, or `Upload` operation touches that subtree — those
    /// operations must never read a stale cached listing afterward.
    pub fn invalidate_path(
        &self,
        user: &str,
        host: &str,
        port: u16,
        path: &str,
        syntax: crate::path::ServerPathSyntax,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<CacheKey> = inner
            .map
            .keys()
            .filter(|k| {
                k.user == user
                    && k.host == host
                    && k.port == port
                    && crate::path::is_prefix_of(syntax, path, &k.path)
            })
            .cloned()
            .collect();
        for key in victims {
            if let Some(removed) = inner.map.remove(&key) {
                inner.used_bytes = inner.used_bytes.saturating_sub(approx_size(&removed.entries));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListingCache {
    fn default() -> Self {
        // 8 MiB default budget; generous enough for a few thousand large
        // directories without letting a pathological server run unbounded.
        Self::new(8 * 1024 * 1024)
    }
}

/// Marker so callers can express "skip the cache for this lookup, but
/// still invalidate on write" without a boolean flag that reads
/// ambiguously at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    UseCache,
    Bypass,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::types::{EntryKind, ValidDataMask};
    use crate::path::ServerPathSyntax;

    fn entry(name: &str) -> FileData {
        FileData {
            name: name.to_string(),
            kind: EntryKind::File,
            size: 1,
            modified: None,
            permissions: None,
            owner: None,
            group: None,
            link_target: None,
            link_count: None,
            plugin_data: None,
            valid_data_mask: ValidDataMask::empty(),
        }
    }

    fn key(path: &str) -> CacheKey {
        CacheKey {
            user: "anon".into(),
            host: "ftp.example.com".into(),
            port: 21,
            path: path.into(),
            list_command: "LIST".into(),
            tls: false,
        }
    }

    #[test]
    fn lookup_returns_what_was_inserted() {
        let cache = ListingCache::new(1024 * 1024);
        cache.insert_or_update(key("/pub"), vec![entry("a.txt")]);
        let hit = cache.lookup(&key("/pub")).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].name, "a.txt");
    }

    #[test]
    fn miss_on_different_list_command() {
        let cache = ListingCache::new(1024 * 1024);
        cache.insert_or_update(key("/pub"), vec![entry("a.txt")]);
        let mut k = key("/pub");
        k.list_command = "MLSD".into();
        assert!(cache.lookup(&k).is_none());
    }

    #[test]
    fn invalidate_path_drops_subtree_entries_only() {
        let cache = ListingCache::new(1024 * 1024);
        cache.insert_or_update(key("/pub"), vec![entry("a.txt")]);
        cache.insert_or_update(key("/pub/sub"), vec![entry("b.txt")]);
        cache.insert_or_update(key("/other"), vec![entry("c.txt")]);
        cache.invalidate_path("anon", "ftp.example.com", 21, "/pub", ServerPathSyntax::Unix);
        assert!(cache.lookup(&key("/pub")).is_none());
        assert!(cache.lookup(&key("/pub/sub")).is_none());
        assert!(cache.lookup(&key("/other")).is_some());
    }

    #[test]
    fn eviction_respects_byte_budget() {
        let cache = ListingCache::new(1);
        cache.insert_or_update(key("/a"), vec![entry("x")]);
        cache.insert_or_update(key("/b"), vec![entry("y")]);
        assert!(cache.len() <= 1);
    }
}
