//! Bundled server-type catalog for listing autodetection.
//!
//! A `ServerType` is data (a regex pattern + column mapping + date style),
//! not code — adding one of the many other dialects a full catalog would
//! carry (AIX, Filezilla, Netprezenz, MVS PO/dataset, OS/2, VxWorks, z/VM,
//! OS/400 QSYS.LIB, Tandem, Xbox 360, MOXA, …) is a matter of appending
//! another `ServerType` row here, not touching the engine in `mod.rs`.
//! This catalog carries the five dialects needed to exercise every
//! rule-engine code path: permission-bit lines, two date-locale families,
//! the Windows `<DIR>`-vs-size column ambiguity, and OpenVMS's
//! bracketed-version naming plus its empty-directory sentinel text.

use crate::parser::types::{Column, DateStyle, ServerType};
use crate::path::ServerPathSyntax;

pub const UNIX: ServerType = ServerType {
    name: "UNIX",
    path_syntax: ServerPathSyntax::Unix,
    // drwxr-xr-x   3 user     group        4096 Jan 15 09:30 name[ -> target]
    pattern: r"(?x)
        ^([\-dlcbps][rwxsStT\-]{9})\s+
        (\d+)\s+
        (\S+)\s+
        (\S+)\s+
        (\d+)\s+
        ([A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+
        (.+)$
    ",
    columns: &[
        Column::Permissions,
        Column::LinkCount,
        Column::Owner,
        Column::Group,
        Column::Size,
        Column::DateTime,
        Column::Name,
    ],
    date_style: DateStyle::UnixNoYear,
    empty_dir_sentinel: None,
};

pub const UNIX_GERMAN: ServerType = ServerType {
    name: "UNIX (German months)",
    path_syntax: ServerPathSyntax::Unix,
    pattern: r"(?x)
        ^([\-dlcbps][rwxsStT\-]{9})\s+
        (\d+)\s+
        (\S+)\s+
        (\S+)\s+
        (\d+)\s+
        ([A-Za-zä]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+
        (.+)$
    ",
    columns: &[
        Column::Permissions,
        Column::LinkCount,
        Column::Owner,
        Column::Group,
        Column::Size,
        Column::DateTime,
        Column::Name,
    ],
    date_style: DateStyle::UnixNoYearGerman,
    empty_dir_sentinel: None,
};

pub const WINDOWS: ServerType = ServerType {
    name: "Windows/IIS",
    path_syntax: ServerPathSyntax::Windows,
    // 03-15-24  02:30PM       <DIR>          name
    // 03-15-24  02:30PM             4096     name
    pattern: r"(?x)
        ^(\d{2}-\d{2}-\d{2})\s+
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+
        (<DIR>|\d+)\s+
        (.+)$
    ",
    columns: &[
        Column::Date,
        Column::Time,
        Column::WindowsSizeOrDir,
        Column::Name,
    ],
    date_style: DateStyle::WindowsAmPm,
    empty_dir_sentinel: None,
};

pub const OPENVMS: ServerType = ServerType {
    name: "OpenVMS",
    path_syntax: ServerPathSyntax::Vms,
    // README.TXT;1        12   15-MAR-2024 10:00
    pattern: r"(?x)
        ^(\S+;\d+)\s+
        (\d+)\s+
        (\d{1,2}-[A-Za-z]{3}-\d{4}\s+\d{1,2}:\d{2})$
    ",
    columns: &[Column::Name, Column::Size, Column::DateTime],
    date_style: DateStyle::Vms,
    // Prior to the listing-engine fix this novelty documents, an empty
    // VMS directory returned an error reply instead of this sentinel line.
    empty_dir_sentinel: Some("Total of 0 files, 0/0 blocks"),
};

pub const MLSD: ServerType = ServerType {
    name: "MLSD",
    path_syntax: ServerPathSyntax::Unix,
    // handled structurally in mod.rs (semicolon-delimited fact list), this
    // entry exists so autodetection can select it by content sniffing
    // rather than regex match.
    pattern: r"^type=\S+;.*;\s+\S+$",
    columns: &[Column::Skip],
    date_style: DateStyle::Mlsd,
    empty_dir_sentinel: None,
};

/// All bundled dialects, tried in this order during autodetection. MLSD is
/// preferred whenever the server advertises it — `mod.rs` short-circuits
/// there and only falls through to this table for raw `LIST` output.
pub const CATALOG: &[&ServerType] = &[&UNIX, &UNIX_GERMAN, &WINDOWS, &OPENVMS];
