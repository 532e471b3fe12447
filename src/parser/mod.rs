//! Listing parser engine — autodetection over a catalog of
//! compiled per-server rules, turning raw `LIST`/`MLSD` output into
//! [`FileData`] rows.
//!
//! Grounded on `sorng-ftp::ftp::parser`, which matched UNIX,
//! Windows, and MLSD with three hand-written regexes tried in sequence.
//! This generalizes that into a data-driven catalog (`catalog.rs`) of
//! `ServerType` rows plus a shared column-mapping evaluator, so recognising
//! another dialect is a catalog entry, not new matching code.

pub mod catalog;
pub mod custom;
pub mod rules;
pub mod types;

use crate::path::MAX_PATH_LEN;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use types::{Column, DateStyle, EntryKind, FileData, ServerType, ValidDataMask};

lazy_static! {
    /// Compiled-regex cache keyed by `ServerType::name` — rule patterns are
    /// `const` data, compiling them once per process is enough.
    static ref COMPILED: Mutex<HashMap<&'static str, Regex>> = Mutex::new(HashMap::new());
}

fn compiled(server_type: &ServerType) -> Regex {
    let mut cache = COMPILED.lock().unwrap();
    cache
        .entry(server_type.name)
        .or_insert_with(|| Regex::new(server_type.pattern).expect("bundled catalog pattern must compile"))
        .clone()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No catalog entry's pattern matched a majority of non-empty lines.
    UnrecognisedFormat,
    /// A name or path exceeded the engine's path budget.
    PathTooLong,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnrecognisedFormat => write!(f, "listing format not recognised"),
            ParseError::PathTooLong => write!(f, "name exceeds the path budget"),
        }
    }
}

/// Try every catalog entry against a sample of non-trivial lines and return
/// the first whose pattern matches at least one of them. An empty listing
/// (or one consisting solely of a dialect's empty-directory sentinel)
/// cannot be autodetected from content alone and returns `None` — the
/// caller should keep the server's previously-detected type, if any.
pub fn autodetect(raw: &str) -> Option<&'static ServerType> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.iter().any(|l| looks_like_mlsd(l)) {
        return Some(&catalog::MLSD);
    }

    for candidate in catalog::CATALOG {
        if candidate.empty_dir_sentinel.map(|s| lines.iter().any(|l| *l == s)).unwrap_or(false) {
            return Some(candidate);
        }
        let re = compiled(candidate);
        if lines.iter().any(|l| re.is_match(l)) {
            return Some(candidate);
        }
    }
    None
}

fn looks_like_mlsd(line: &str) -> bool {
    line.contains("type=") && line.contains(';') && line.contains(' ')
}

/// Parse a full listing body under the given (already-detected) server
/// type, skipping `.`/`..` and any empty-directory sentinel line.
pub fn parse_listing(raw: &str, server_type: &ServerType, now: DateTime<Utc>) -> Result<Vec<FileData>, ParseError> {
    if server_type.name == catalog::MLSD.name {
        return parse_mlsd_listing(raw);
    }

    let re = compiled(server_type);
    let mut out = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if server_type
            .empty_dir_sentinel
            .map(|s| line == s)
            .unwrap_or(false)
        {
            continue;
        }
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let Some(entry) = build_entry(&caps, server_type, now)? else {
            continue;
        };
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        out.push(entry);
    }
    Ok(out)
}

fn build_entry(
    caps: &regex::Captures,
    server_type: &ServerType,
    now: DateTime<Utc>,
) -> Result<Option<FileData>, ParseError> {
    let mut name = String::new();
    let mut size: u64 = 0;
    let mut permissions: Option<String> = None;
    let mut owner: Option<String> = None;
    let mut group: Option<String> = None;
    let mut link_count: Option<u32> = None;
    let mut link_target: Option<String> = None;
    let mut modified: Option<DateTime<Utc>> = None;
    let mut mask = ValidDataMask::empty();
    let mut is_dir_from_windows = false;

    for (idx, column) in server_type.columns.iter().enumerate() {
        let Some(m) = caps.get(idx + 1) else { continue };
        let text = m.as_str();
        match column {
            Column::Permissions => {
                permissions = Some(text.to_string());
                mask |= ValidDataMask::PERMISSIONS;
            }
            Column::LinkCount => {
                link_count = text.parse().ok();
                if link_count.is_some() {
                    mask |= ValidDataMask::LINK_COUNT;
                }
            }
            Column::Owner => {
                owner = Some(text.to_string());
                mask |= ValidDataMask::OWNER;
            }
            Column::Group => {
                group = Some(text.to_string());
                mask |= ValidDataMask::GROUP;
            }
            Column::Size => {
                if let Ok(v) = text.parse() {
                    size = v;
                    mask |= ValidDataMask::SIZE | ValidDataMask::BYTE_SIZE_IS_EXACT;
                }
            }
            Column::DateTime => {
                if let Some(dt) = rules::parse_date(text, server_type.date_style, now) {
                    modified = Some(dt);
                    mask |= ValidDataMask::DATE | ValidDataMask::TIME;
                }
            }
            Column::Date | Column::Time => {
                // Paired date/time columns (Windows layout) are recombined
                // below once both captures are known.
            }
            Column::Name => {
                let (nm, target) = split_symlink_target(text);
                if nm.len() > MAX_PATH_LEN {
                    return Err(ParseError::PathTooLong);
                }
                name = nm.to_string();
                if let Some(t) = target {
                    link_target = Some(t.to_string());
                    mask |= ValidDataMask::LINK_TARGET;
                }
            }
            Column::SymlinkTarget => {
                link_target = Some(text.to_string());
                mask |= ValidDataMask::LINK_TARGET;
            }
            Column::WindowsSizeOrDir => {
                if text == "<DIR>" {
                    is_dir_from_windows = true;
                } else if let Ok(v) = text.parse() {
                    size = v;
                    mask |= ValidDataMask::SIZE | ValidDataMask::BYTE_SIZE_IS_EXACT;
                }
            }
            Column::Skip => {}
        }
    }

    // Windows layout carries Date+Time as two separate captures; recombine
    // them now that both groups are available.
    if server_type.columns.contains(&Column::Date) && server_type.columns.contains(&Column::Time) {
        let date_idx = server_type.columns.iter().position(|c| *c == Column::Date).unwrap();
        let time_idx = server_type.columns.iter().position(|c| *c == Column::Time).unwrap();
        if let (Some(d), Some(t)) = (caps.get(date_idx + 1), caps.get(time_idx + 1)) {
            let combined = format!("{} {}", d.as_str(), t.as_str());
            if let Some(dt) = rules::parse_date(&combined, server_type.date_style, now) {
                modified = Some(dt);
                mask |= ValidDataMask::DATE | ValidDataMask::TIME;
            }
        }
    }

    if name.is_empty() {
        return Ok(None);
    }

    let kind = if is_dir_from_windows {
        EntryKind::Directory
    } else if let Some(p) = &permissions {
        match p.chars().next() {
            Some('d') => EntryKind::Directory,
            Some('l') => EntryKind::Link,
            Some(_) => EntryKind::File,
            None => EntryKind::Unknown,
        }
    } else if server_type.path_syntax == crate::path::ServerPathSyntax::Vms {
        EntryKind::File
    } else {
        EntryKind::Unknown
    };

    Ok(Some(FileData {
        name,
        kind,
        size,
        modified,
        permissions,
        owner,
        group,
        link_target,
        link_count,
        plugin_data: None,
        valid_data_mask: mask,
    }))
}

fn split_symlink_target(text: &str) -> (&str, Option<&str>) {
    match text.find(" -> ") {
        Some(idx) => (&text[..idx], Some(&text[idx + 4..])),
        None => (text, None),
    }
}

fn parse_mlsd_listing(raw: &str) -> Result<Vec<FileData>, ParseError> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(entry) = parse_mlsd_line(line)? {
            if entry.name != "." && entry.name != ".." {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

fn parse_mlsd_line(line: &str) -> Result<Option<FileData>, ParseError> {
    let (facts_part, name) = match line.rfind("; ") {
        Some(idx) => (&line[..idx], line[idx + 2..].to_string()),
        None => match line.rfind(' ') {
            Some(idx) => (&line[..idx], line[idx + 1..].to_string()),
            None => return Ok(None),
        },
    };
    if name.len() > MAX_PATH_LEN {
        return Err(ParseError::PathTooLong);
    }

    let mut facts: HashMap<String, String> = HashMap::new();
    for fact in facts_part.split(';') {
        let fact = fact.trim();
        if fact.is_empty() {
            continue;
        }
        if let Some((k, v)) = fact.split_once('=') {
            facts.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }

    let mut mask = ValidDataMask::empty();
    let kind = match facts.get("type").map(String::as_str) {
        Some("dir") | Some("cdir") | Some("pdir") => EntryKind::Directory,
        Some("file") => EntryKind::File,
        Some("OS.unix=symlink") => EntryKind::Link,
        _ => EntryKind::Unknown,
    };

    let size = facts.get("size").and_then(|s| s.parse().ok()).unwrap_or(0);
    if facts.contains_key("size") {
        mask |= ValidDataMask::SIZE | ValidDataMask::BYTE_SIZE_IS_EXACT;
    }

    let modified = facts
        .get("modify")
        .and_then(|m| rules::parse_date(m, DateStyle::Mlsd, Utc::now()));
    if modified.is_some() {
        mask |= ValidDataMask::DATE | ValidDataMask::TIME;
    }

    let permissions = facts.get("unix.mode").or_else(|| facts.get("perm")).cloned();
    if permissions.is_some() {
        mask |= ValidDataMask::PERMISSIONS;
    }

    Ok(Some(FileData {
        name,
        kind,
        size,
        modified,
        permissions,
        owner: facts.get("unix.owner").cloned(),
        group: facts.get("unix.group").cloned(),
        link_target: None,
        link_count: None,
        plugin_data: Some(serde_json::to_value(&facts).unwrap_or(serde_json::Value::Null)),
        valid_data_mask: mask,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap()
    }

    #[test]
    fn detects_and_parses_unix_listing() {
        let raw = "drwxr-xr-x   3 user group     4096 Jan 15 09:30 sub\n\
                    -rw-r--r--   1 user group      512 Feb  1 10:00 readme.txt";
        let st = autodetect(raw).unwrap();
        assert_eq!(st.name, "UNIX");
        let entries = parse_listing(raw, st, now()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].name, "readme.txt");
        assert_eq!(entries[1].size, 512);
    }

    #[test]
    fn unix_symlink_extracts_target() {
        let raw = "lrwxrwxrwx   1 user group       11 Mar  3 08:00 shortcut -> /real/path";
        let st = autodetect(raw).unwrap();
        let entries = parse_listing(raw, st, now()).unwrap();
        assert!(entries[0].is_link());
        assert_eq!(entries[0].link_target.as_deref(), Some("/real/path"));
    }

    #[test]
    fn dots_are_never_surfaced() {
        let raw = "drwxr-xr-x   2 a b 4096 Jan  1 00:00 .\n\
                    drwxr-xr-x   2 a b 4096 Jan  1 00:00 ..\n\
                    -rw-r--r--   1 a b    1 Jan  1 00:00 real";
        let st = autodetect(raw).unwrap();
        let entries = parse_listing(raw, st, now()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "real");
    }

    #[test]
    fn windows_dir_and_file_are_distinguished() {
        let raw = "03-15-24  02:30PM       <DIR>          sub\n\
                    03-15-24  02:30PM             4096     file.txt";
        let st = autodetect(raw).unwrap();
        assert_eq!(st.name, "Windows/IIS");
        let entries = parse_listing(raw, st, now()).unwrap();
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].size, 4096);
    }

    #[test]
    fn mlsd_line_parses_facts() {
        let raw = "type=file;size=1234;modify=20240315142233; archive.zip";
        let st = autodetect(raw).unwrap();
        assert_eq!(st.name, "MLSD");
        let entries = parse_listing(raw, st, now()).unwrap();
        assert_eq!(entries[0].name, "archive.zip");
        assert_eq!(entries[0].size, 1234);
        assert!(entries[0].modified.is_some());
    }

    #[test]
    fn openvms_empty_directory_sentinel_is_not_an_error() {
        let raw = "Total of 0 files, 0/0 blocks";
        let st = autodetect(raw).unwrap();
        assert_eq!(st.name, "OpenVMS");
        let entries = parse_listing(raw, st, now()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn openvms_listing_parses_bracket_versioned_names() {
        let raw = "README.TXT;1        12   15-MAR-2024 10:00";
        let st = &catalog::OPENVMS;
        let entries = parse_listing(raw, st, now()).unwrap();
        assert_eq!(entries[0].name, "README.TXT;1");
        assert_eq!(entries[0].size, 12);
    }

    #[test]
    fn unrecognisable_garbage_does_not_autodetect() {
        assert!(autodetect("####not a listing####").is_none());
    }
}
