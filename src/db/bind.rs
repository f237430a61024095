//! Parameter binding rules.
//!
//! Statements are written with either positional (`?`) or named (`:name`)
//! placeholders, never both. Before a statement reaches the driver:
//! - named placeholders are rewritten to positional ones,
//! - [`Value::Raw`] values are spliced into the SQL text verbatim and removed
//!   from the bound parameter list.
//!
//! Placeholders inside quoted strings, quoted identifiers and comments are
//! left alone.

use crate::error::{DbError, DbResult};
use crate::models::Value;

/// Values supplied for one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Bindings {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Bindings {
    pub fn none() -> Self {
        Self::Positional(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Positional(v) => v.len(),
            Self::Named(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Bindings {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Vec<Value>> for Bindings {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl From<Vec<(String, Value)>> for Bindings {
    fn from(values: Vec<(String, Value)>) -> Self {
        Self::Named(values)
    }
}

impl From<Vec<(&str, Value)>> for Bindings {
    fn from(values: Vec<(&str, Value)>) -> Self {
        Self::Named(values.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// A statement ready for the driver: positional placeholders only, no raw values.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Prepared {
    /// Check whether this statement returns rows.
    pub fn is_query(&self) -> bool {
        returns_rows(&self.sql)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder<'a> {
    Positional,
    Named(&'a str),
}

/// Check whether a statement returns a result set, from its leading keyword.
pub fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "WITH" | "VALUES" | "TABLE"
    )
}

/// Rewrite a statement and its bindings into driver form.
pub fn prepare(sql: &str, bindings: &Bindings) -> DbResult<Prepared> {
    let placeholders = scan(sql);

    let has_positional = placeholders
        .iter()
        .any(|(_, _, p)| matches!(p, Placeholder::Positional));
    let has_named = placeholders
        .iter()
        .any(|(_, _, p)| matches!(p, Placeholder::Named(_)));

    if has_positional && has_named {
        return Err(DbError::invalid_input(
            "Statement mixes positional (?) and named (:name) placeholders; use one style",
        ));
    }

    let mut out = String::with_capacity(sql.len());
    let mut params = Vec::with_capacity(bindings.len());
    let mut cursor = 0;

    match bindings {
        Bindings::Positional(values) => {
            if has_named {
                return Err(DbError::invalid_input(
                    "Statement uses named placeholders but positional values were bound",
                ));
            }
            if values.len() != placeholders.len() {
                return Err(DbError::invalid_input(format!(
                    "Statement has {} placeholders but {} values were bound",
                    placeholders.len(),
                    values.len()
                )));
            }
            for ((start, end, _), value) in placeholders.iter().zip(values) {
                out.push_str(&sql[cursor..*start]);
                splice(&mut out, &mut params, value);
                cursor = *end;
            }
        }
        Bindings::Named(values) => {
            if has_positional {
                return Err(DbError::invalid_input(
                    "Statement uses positional placeholders but named values were bound",
                ));
            }
            for (start, end, placeholder) in &placeholders {
                let Placeholder::Named(name) = placeholder else {
                    continue;
                };
                let value = values
                    .iter()
                    .find(|(k, _)| k.trim_start_matches(':') == *name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| {
                        DbError::invalid_input(format!("No value bound for :{}", name))
                    })?;
                out.push_str(&sql[cursor..*start]);
                splice(&mut out, &mut params, value);
                cursor = *end;
            }
        }
    }

    out.push_str(&sql[cursor..]);
    Ok(Prepared { sql: out, params })
}

fn splice(out: &mut String, params: &mut Vec<Value>, value: &Value) {
    match value {
        Value::Raw(expression) => out.push_str(expression),
        other => {
            out.push('?');
            params.push(other.clone());
        }
    }
}

/// Locate placeholders outside quotes and comments as (start, end, kind).
fn scan(sql: &str) -> Vec<(usize, usize, Placeholder<'_>)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        // Doubled quote is an escaped quote
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b'?' => {
                found.push((i, i + 1, Placeholder::Positional));
                i += 1;
            }
            b':' => {
                let prev_is_colon = i > 0 && bytes[i - 1] == b':';
                let next_starts_ident = bytes
                    .get(i + 1)
                    .is_some_and(|c| c.is_ascii_alphabetic() || *c == b'_');
                if !prev_is_colon && next_starts_ident {
                    let start = i;
                    i += 1;
                    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                    {
                        i += 1;
                    }
                    found.push((start, i, Placeholder::Named(&sql[start + 1..i])));
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    found
}
