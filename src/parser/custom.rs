//! `.STR` server-type definition documents — the user-editable parser
//! import/export format described in spec.md's external-interfaces section.
//!
//! `catalog.rs`'s `ServerType` deliberately pins its pattern to a
//! `&'static str` so `mod.rs`'s compiled-regex cache can key on it for the
//! life of the process; a server type loaded from a document at runtime
//! can't satisfy that lifetime, so it gets this smaller, owned-`String`
//! counterpart instead. The two are siblings, not a hierarchy — nothing
//! here feeds back into the bundled catalog.

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub id: String,
}

/// One server-type definition as a user would edit and save it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomServerType {
    pub name: String,
    pub autodetect_condition: Option<String>,
    pub columns: Vec<ColumnSpec>,
    pub rules: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrFormatError {
    MissingTypeName,
    EmptyName,
    MissingColumnsSection,
    DuplicateColumnId(String),
    NameColumnMissing,
    MissingRulesSection,
    UncompilableRules(String),
    UncompilableCondition(String),
}

impl std::fmt::Display for StrFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrFormatError::MissingTypeName => write!(f, "document must start with 'Type Name:'"),
            StrFormatError::EmptyName => write!(f, "type name must not be empty"),
            StrFormatError::MissingColumnsSection => write!(f, "missing or empty 'Columns:' section"),
            StrFormatError::DuplicateColumnId(id) => write!(f, "duplicate column id '{}'", id),
            StrFormatError::NameColumnMissing => write!(f, "column 0 must be 'name'"),
            StrFormatError::MissingRulesSection => write!(f, "missing 'Rules for Parsing:' line"),
            StrFormatError::UncompilableRules(e) => write!(f, "rules do not compile: {}", e),
            StrFormatError::UncompilableCondition(e) => write!(f, "autodetect condition does not compile: {}", e),
        }
    }
}

impl std::error::Error for StrFormatError {}

fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        Some(s[1..s.len() - 1].to_string())
    } else {
        None
    }
}

fn skip_blank(lines: &[&str], idx: &mut usize) {
    while *idx < lines.len() && lines[*idx].trim().is_empty() {
        *idx += 1;
    }
}

/// Parse a `.STR` document, validating column-id uniqueness, the
/// mandatory `name` column at index 0, a non-empty type name, and that
/// both the autodetect condition (if present) and the parsing rules
/// compile as regexes.
pub fn import(text: &str) -> Result<CustomServerType, StrFormatError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut idx = 0;

    skip_blank(&lines, &mut idx);
    let name = match lines.get(idx).map(|l| l.trim()) {
        Some(line) if line.starts_with("Type Name:") => {
            idx += 1;
            line["Type Name:".len()..].trim().to_string()
        }
        _ => return Err(StrFormatError::MissingTypeName),
    };
    if name.is_empty() {
        return Err(StrFormatError::EmptyName);
    }

    skip_blank(&lines, &mut idx);
    let mut autodetect_condition = None;
    if let Some(line) = lines.get(idx).map(|l| l.trim()) {
        if let Some(rest) = line.strip_prefix("Autodetect Condition:") {
            let rest = rest.trim().trim_end_matches(',');
            let cond = unquote(rest).ok_or_else(|| {
                StrFormatError::UncompilableCondition("condition is not a quoted string".to_string())
            })?;
            Regex::new(&cond).map_err(|e| StrFormatError::UncompilableCondition(e.to_string()))?;
            autodetect_condition = Some(cond);
            idx += 1;
        }
    }

    skip_blank(&lines, &mut idx);
    if lines.get(idx).map(|l| l.trim()) != Some("Columns:") {
        return Err(StrFormatError::MissingColumnsSection);
    }
    idx += 1;

    let mut columns = Vec::new();
    while let Some(line) = lines.get(idx) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        let id = unquote(trimmed).ok_or(StrFormatError::MissingColumnsSection)?;
        columns.push(ColumnSpec { id });
        idx += 1;
    }
    if columns.is_empty() {
        return Err(StrFormatError::MissingColumnsSection);
    }

    let mut seen = std::collections::HashSet::new();
    for c in &columns {
        if !seen.insert(c.id.to_ascii_lowercase()) {
            return Err(StrFormatError::DuplicateColumnId(c.id.clone()));
        }
    }
    if !columns[0].id.eq_ignore_ascii_case("name") {
        return Err(StrFormatError::NameColumnMissing);
    }

    skip_blank(&lines, &mut idx);
    let rules = match lines.get(idx).map(|l| l.trim()) {
        Some(line) if line.starts_with("Rules for Parsing:") => {
            unquote(line["Rules for Parsing:".len()..].trim()).ok_or(StrFormatError::MissingRulesSection)?
        }
        _ => return Err(StrFormatError::MissingRulesSection),
    };
    Regex::new(&rules).map_err(|e| StrFormatError::UncompilableRules(e.to_string()))?;

    Ok(CustomServerType {
        name,
        autodetect_condition,
        columns,
        rules,
    })
}

/// Render a `CustomServerType` back to its `.STR` text shape. Column
/// widths are not modelled here and therefore never round-trip — spec.md
/// excludes them from export explicitly.
pub fn export(doc: &CustomServerType) -> String {
    let mut out = format!("Type Name: {}\n\n", doc.name);
    if let Some(cond) = &doc.autodetect_condition {
        out.push_str(&format!("Autodetect Condition: \"{}\",\n\n", cond));
    }
    out.push_str("Columns:\n");
    for c in &doc.columns {
        out.push_str(&format!("\"{}\"\n", c.id));
    }
    out.push('\n');
    out.push_str(&format!("Rules for Parsing: \"{}\"\n", doc.rules));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CustomServerType {
        CustomServerType {
            name: "Netprezenz".to_string(),
            autodetect_condition: Some(r"^\d{3}-".to_string()),
            columns: vec![
                ColumnSpec { id: "name".to_string() },
                ColumnSpec { id: "ext".to_string() },
                ColumnSpec { id: "size".to_string() },
                ColumnSpec { id: "date".to_string() },
            ],
            rules: r"^(\S+)\s+(\d+)\s+(.+)$".to_string(),
        }
    }

    #[test]
    fn export_then_import_reproduces_the_original() {
        let original = sample();
        let doc = export(&original);
        let reimported = import(&doc).unwrap();
        assert_eq!(reimported, original);
    }

    #[test]
    fn import_without_autodetect_condition_is_fine() {
        let mut original = sample();
        original.autodetect_condition = None;
        let doc = export(&original);
        let reimported = import(&doc).unwrap();
        assert_eq!(reimported, original);
    }

    #[test]
    fn duplicate_column_ids_are_rejected() {
        let doc = "Type Name: Broken\n\nColumns:\n\"name\"\n\"name\"\n\nRules for Parsing: \"(.+)\"\n";
        assert_eq!(
            import(doc),
            Err(StrFormatError::DuplicateColumnId("name".to_string()))
        );
    }

    #[test]
    fn first_column_must_be_name() {
        let doc = "Type Name: Broken\n\nColumns:\n\"ext\"\n\"size\"\n\nRules for Parsing: \"(.+)\"\n";
        assert_eq!(import(doc), Err(StrFormatError::NameColumnMissing));
    }

    #[test]
    fn empty_type_name_is_rejected() {
        let doc = "Type Name: \n\nColumns:\n\"name\"\n\nRules for Parsing: \"(.+)\"\n";
        assert_eq!(import(doc), Err(StrFormatError::EmptyName));
    }

    #[test]
    fn uncompilable_rules_are_rejected() {
        let doc = "Type Name: Broken\n\nColumns:\n\"name\"\n\nRules for Parsing: \"(unclosed\"\n";
        assert!(matches!(import(doc), Err(StrFormatError::UncompilableRules(_))));
    }

    #[test]
    fn missing_columns_section_is_rejected() {
        let doc = "Type Name: Broken\n\nRules for Parsing: \"(.+)\"\n";
        assert_eq!(import(doc), Err(StrFormatError::MissingColumnsSection));
    }
}
