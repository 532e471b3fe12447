//! Data model for the listing parser engine.

use crate::path::ServerPathSyntax;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Which `FileData` fields a given listing line actually carried.
    /// Not every server format reports every field (OpenVMS has no
    /// permission bits, Windows `<DIR>` lines have no owner/group, …);
    /// callers must consult this mask instead of assuming every field is
    /// populated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ValidDataMask: u16 {
        const SIZE        = 0b0000_0000_0001;
        const DATE        = 0b0000_0000_0010;
        const TIME        = 0b0000_0000_0100;
        const PERMISSIONS = 0b0000_0000_1000;
        const OWNER       = 0b0000_0001_0000;
        const GROUP       = 0b0000_0010_0000;
        const LINK_TARGET = 0b0000_0100_0000;
        const LINK_COUNT  = 0b0000_1000_0000;
        const BYTE_SIZE_IS_EXACT = 0b0001_0000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Link,
    Unknown,
}

/// One parsed listing line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
    pub link_count: Option<u32>,
    /// Anything the compiled rule captured that doesn't map to a typed
    /// field — the engine equivalent of the raw `facts` map MLSD lines
    /// carry in the original parser.
    pub plugin_data: Option<serde_json::Value>,
    pub valid_data_mask: ValidDataMask,
}

impl FileData {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_link(&self) -> bool {
        self.kind == EntryKind::Link
    }

    pub fn has(&self, field: ValidDataMask) -> bool {
        self.valid_data_mask.contains(field)
    }
}

/// One positional capture-group -> field mapping in a compiled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Column {
    Permissions,
    LinkCount,
    Owner,
    Group,
    Size,
    /// Combined date+time group, format determined by `DateStyle`.
    DateTime,
    Date,
    Time,
    Name,
    /// `-> target` suffix on a Unix symlink name.
    SymlinkTarget,
    /// Windows `<DIR>` literal vs. a numeric size in the same column.
    WindowsSizeOrDir,
    /// Ignored capture (kept for column alignment, not surfaced).
    Skip,
}

/// How the `DateTime`/`Date`/`Time` columns should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateStyle {
    /// `Mon dd HH:MM`, year omitted — resolve against "now", preferring
    /// the past when the naive date would otherwise lie in the future.
    UnixNoYear,
    /// `Mon dd  yyyy`, no time of day.
    UnixYearOnly,
    /// `Mon dd HH:MM`, German month abbreviations.
    UnixNoYearGerman,
    /// `MM-DD-YY  hh:mmAM/PM` (classic Windows/IIS).
    WindowsAmPm,
    /// `MM-DD-YY  HH:MM` (24-hour Windows/IIS variant).
    Windows24Hour,
    /// `DD-MMM-YYYY HH:MM` (OpenVMS).
    Vms,
    /// `YYYYMMDDHHMMSS` (MLSD `modify=` fact).
    Mlsd,
}

/// One bundled server dialect: a compiled rule plus the column mapping
/// and date style needed to turn a regex match into a `FileData`.
#[derive(Debug, Clone)]
pub struct ServerType {
    pub name: &'static str,
    pub path_syntax: ServerPathSyntax,
    pub pattern: &'static str,
    pub columns: &'static [Column],
    pub date_style: DateStyle,
    /// Text OpenVMS (and some others) emit for a genuinely empty directory
    /// instead of a normal file listing — must not be mis-parsed as an error.
    pub empty_dir_sentinel: Option<&'static str>,
}
