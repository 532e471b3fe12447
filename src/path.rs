//! Path & name utilities — server-type-aware path append,
//! compare, prefix-test, and name validation.
//!
//! Every server dialect the parser catalog can recognise has a matching
//! `ServerPathSyntax`; the listing-parser autodetection (`parser::catalog`)
//! and the `ServerType` records agree on which syntax goes with which type.

use serde::{Deserialize, Serialize};

/// Maximum length (bytes) of a single path the engine will build.
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerPathSyntax {
    /// `/foo/bar`, case-sensitive.
    Unix,
    /// `[dir.sub]file.txt`, case-insensitive, version-aware.
    Vms,
    /// IBM OS/400 QSYS.LIB — `lib/file.mbr`-style member addressing.
    Os400,
    /// `lib.sublib\file`, dotted MVS dataset qualifiers.
    Mvs,
    /// `\foo\bar`, case-insensitive.
    Windows,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    TooLong,
    InvalidSyntax(String),
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::TooLong => write!(f, "path exceeds maximum length"),
            PathError::InvalidSyntax(s) => write!(f, "invalid path syntax: {}", s),
        }
    }
}

pub type PathResult<T> = Result<T, PathError>;

/// Append `component` to `path` applying the separator/root rules of `syntax`.
pub fn append(syntax: ServerPathSyntax, path: &str, component: &str) -> PathResult<String> {
    if component.is_empty() {
        return Ok(path.to_string());
    }
    let result = match syntax {
        ServerPathSyntax::Unix | ServerPathSyntax::Os400 => {
            if path.is_empty() || path == "/" {
                format!("/{}", component)
            } else if path.ends_with('/') {
                format!("{}{}", path, component)
            } else {
                format!("{}/{}", path, component)
            }
        }
        ServerPathSyntax::Windows => {
            if path.is_empty() {
                component.to_string()
            } else if path.ends_with('\\') {
                format!("{}{}", path, component)
            } else {
                format!("{}\\{}", path, component)
            }
        }
        ServerPathSyntax::Vms => append_vms(path, component)?,
        ServerPathSyntax::Mvs => {
            if path.is_empty() {
                component.to_string()
            } else {
                format!("{}.{}", path, component)
            }
        }
    };
    if result.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong);
    }
    Ok(result)
}

/// VMS paths look like `DISK:[DIR.SUB]FILE.TXT;1`. Appending a directory
/// component extends the bracketed chain; appending to `..` would pop a
/// level (not handled here — VMS `..` semantics are server-resolved).
fn append_vms(path: &str, component: &str) -> PathResult<String> {
    if path.is_empty() {
        return Ok(format!("[{}]", component));
    }
    if let Some(close) = path.rfind(']') {
        let (head, _tail) = path.split_at(close);
        if head.ends_with('[') {
            Ok(format!("{}{}]", head, component))
        } else {
            Ok(format!("{}.{}]", head, component))
        }
    } else {
        Err(PathError::InvalidSyntax(path.to_string()))
    }
}

/// Compare two paths under the dialect's case rules.
pub fn is_same(syntax: ServerPathSyntax, a: &str, b: &str) -> bool {
    match syntax {
        ServerPathSyntax::Unix => a == b,
        ServerPathSyntax::Vms | ServerPathSyntax::Os400 | ServerPathSyntax::Windows => {
            a.eq_ignore_ascii_case(b)
        }
        ServerPathSyntax::Mvs => a.eq_ignore_ascii_case(b),
    }
}

/// Whether `prefix` is a path-component prefix of `p` (not merely a string
/// prefix — `/ab` is not a prefix of `/abc`).
pub fn is_prefix_of(syntax: ServerPathSyntax, prefix: &str, p: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let sep = separator(syntax);
    let norm_prefix = prefix.trim_end_matches(sep);
    if norm_prefix.is_empty() {
        return true; // root
    }
    let case_eq = |x: &str, y: &str| match syntax {
        ServerPathSyntax::Unix => x == y,
        _ => x.eq_ignore_ascii_case(y),
    };
    if case_eq(norm_prefix, p.trim_end_matches(sep)) {
        return true;
    }
    let with_sep = format!("{}{}", norm_prefix, sep);
    if syntax == ServerPathSyntax::Unix {
        p.starts_with(&with_sep)
    } else {
        p.to_lowercase().starts_with(&with_sep.to_lowercase())
    }
}

fn separator(syntax: ServerPathSyntax) -> char {
    match syntax {
        ServerPathSyntax::Windows => '\\',
        _ => '/',
    }
}

/// The only gate before sending CWD/STOR for a user- or mask-produced
/// component name.
pub fn may_be_valid_name(syntax: ServerPathSyntax, name: &str, is_dir: bool) -> bool {
    if name.is_empty() || name.len() > MAX_PATH_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    match syntax {
        ServerPathSyntax::Unix => !name.contains('/') && !name.contains('\0'),
        ServerPathSyntax::Windows => !name.contains(['\\', '/', ':', '*', '?', '"', '<', '>', '|']),
        ServerPathSyntax::Vms => {
            !is_dir || (!name.contains(['[', ']', ':']) && !name.contains(' '))
        }
        ServerPathSyntax::Os400 => !name.contains(['/', ' ']) && name.len() <= 10,
        ServerPathSyntax::Mvs => !name.contains([' ', '/']),
    }
}

/// Split `path` into `(parent, leaf)`. The leaf is empty if `path` has no
/// separator under the dialect's syntax.
pub fn cut_last_component(syntax: ServerPathSyntax, path: &str) -> (String, String) {
    let sep = separator(syntax);
    match path.rfind(sep) {
        Some(idx) => {
            let parent = if idx == 0 {
                sep.to_string()
            } else {
                path[..idx].to_string()
            };
            (parent, path[idx + 1..].to_string())
        }
        None => (String::new(), path.to_string()),
    }
}

/// Strip an IBM OS/400 QSYS.LIB member suffix, e.g. `FILE.MBR` -> `FILE`.
pub fn strip_as400_member_suffix(name: &str) -> &str {
    name.strip_suffix(".MBR")
        .or_else(|| name.strip_suffix(".mbr"))
        .unwrap_or(name)
}

/// Split a name into `(stem, extension)` on the rightmost dot. Directories
/// have no extension when `dirs_have_extension` is false.
pub fn split_name_extension(name: &str, is_dir: bool, dirs_have_extension: bool) -> (&str, Option<&str>) {
    if is_dir && !dirs_have_extension {
        return (name, None);
    }
    match name.rfind('.') {
        Some(0) => (name, None), // dotfile, e.g. ".bashrc" has no extension
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_append_and_root() {
        assert_eq!(append(ServerPathSyntax::Unix, "/", "pub").unwrap(), "/pub");
        assert_eq!(
            append(ServerPathSyntax::Unix, "/pub", "readme.txt").unwrap(),
            "/pub/readme.txt"
        );
    }

    #[test]
    fn vms_append_into_bracket() {
        assert_eq!(append(ServerPathSyntax::Vms, "", "DIR").unwrap(), "[DIR]");
        assert_eq!(
            append(ServerPathSyntax::Vms, "[DIR]", "SUB").unwrap(),
            "[DIR.SUB]"
        );
    }

    #[test]
    fn windows_case_insensitive_compare() {
        assert!(is_same(ServerPathSyntax::Windows, "C:\\Foo", "c:\\foo"));
        assert!(!is_same(ServerPathSyntax::Unix, "/Foo", "/foo"));
    }

    #[test]
    fn prefix_does_not_match_partial_component() {
        assert!(!is_prefix_of(ServerPathSyntax::Unix, "/ab", "/abc"));
        assert!(is_prefix_of(ServerPathSyntax::Unix, "/ab", "/ab/c"));
        assert!(is_prefix_of(ServerPathSyntax::Unix, "/", "/ab/c"));
    }

    #[test]
    fn name_validity_rejects_separators_and_dots() {
        assert!(!may_be_valid_name(ServerPathSyntax::Unix, "..", false));
        assert!(!may_be_valid_name(ServerPathSyntax::Unix, "a/b", false));
        assert!(may_be_valid_name(ServerPathSyntax::Unix, "readme.txt", false));
    }

    #[test]
    fn cut_last_component_splits_leaf() {
        let (parent, leaf) = cut_last_component(ServerPathSyntax::Unix, "/pub/sub/file.txt");
        assert_eq!(parent, "/pub/sub");
        assert_eq!(leaf, "file.txt");
    }

    #[test]
    fn extension_split_respects_dotfiles() {
        assert_eq!(split_name_extension(".bashrc", false, true), (".bashrc", None));
        assert_eq!(
            split_name_extension("archive.tar.gz", false, true),
            ("archive.tar", Some("gz"))
        );
        assert_eq!(split_name_extension("subdir", true, false), ("subdir", None));
    }
}
