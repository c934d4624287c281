//! Identifier validation for builder-generated SQL.
//!
//! Only names matching `[A-Za-z_][A-Za-z0-9_]*`, optionally qualified once
//! (`table.column`), may be rendered into statement text.

fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check a table or column name, allowing one `.` qualifier.
pub fn is_valid_identifier(s: &str) -> bool {
    match s.split_once('.') {
        Some((qualifier, name)) => is_plain_identifier(qualifier) && is_plain_identifier(name),
        None => is_plain_identifier(s),
    }
}

/// Check a select-list entry: an identifier, `*`, or `qualifier.*`.
pub fn is_valid_select_field(s: &str) -> bool {
    if s == "*" {
        return true;
    }
    match s.strip_suffix(".*") {
        Some(qualifier) => is_plain_identifier(qualifier),
        None => is_valid_identifier(s),
    }
}
