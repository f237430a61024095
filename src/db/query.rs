//! Fluent SQL builder.
//!
//! Builds MySQL statements with backtick-quoted identifiers and `?`
//! placeholders. The builder never talks to a driver; terminal operations
//! live on [`TableQuery`](super::database::TableQuery), which renders a
//! [`Statement`] and runs it on a borrowed connection.

use crate::error::{DbError, DbResult};
use crate::models::Value;

/// A rendered statement and its positional values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    conjunction: Conjunction,
    sql: String,
    values: Vec<Value>,
}

/// Operators accepted by [`QueryBuilder::where_op`].
const OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "IS", "IS NOT", "REGEXP",
];

#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    table: String,
    prefix: String,
    columns: Vec<String>,
    joins: Vec<String>,
    conditions: Vec<Condition>,
    groups: Vec<String>,
    orders: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            prefix: String::new(),
            columns: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            groups: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Set the table-name prefix. Rebinding is allowed at any time.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
    }

    /// Prefixed and quoted table name.
    pub fn table_name(&self) -> String {
        quote_ident(&format!("{}{}", self.prefix, self.table))
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns
            .extend(columns.iter().map(|c| quote_ident(c)));
        self
    }

    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_condition(Conjunction::And, column, "=", value.into())
    }

    pub fn or_where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.push_condition(Conjunction::Or, column, "=", value.into())
    }

    /// Comparison with an explicit operator; unknown operators are rejected.
    pub fn where_op(self, column: &str, op: &str, value: impl Into<Value>) -> DbResult<Self> {
        let op = op.trim().to_ascii_uppercase();
        if !OPERATORS.contains(&op.as_str()) {
            return Err(DbError::invalid_input(format!(
                "Unsupported comparison operator '{}'",
                op
            )));
        }
        Ok(self.push_condition(Conjunction::And, column, &op, value.into()))
    }

    /// `column IN (...)`; an empty list matches nothing.
    pub fn where_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        let sql = if values.is_empty() {
            "0 = 1".to_string()
        } else {
            format!("{} IN ({})", quote_ident(column), placeholders(values.len()))
        };
        self.conditions.push(Condition {
            conjunction: Conjunction::And,
            sql,
            values,
        });
        self
    }

    /// Free-form condition with positional placeholders.
    pub fn where_raw(mut self, sql: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(Condition {
            conjunction: Conjunction::And,
            sql: format!("({})", sql.into()),
            values,
        });
        self
    }

    pub fn join(mut self, table: &str, on: &str) -> Self {
        self.joins.push(format!(
            "INNER JOIN {} ON {}",
            quote_ident(&format!("{}{}", self.prefix, table)),
            on
        ));
        self
    }

    pub fn left_join(mut self, table: &str, on: &str) -> Self {
        self.joins.push(format!(
            "LEFT JOIN {} ON {}",
            quote_ident(&format!("{}{}", self.prefix, table)),
            on
        ));
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        let dir = match order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        self.orders.push(format!("{} {}", quote_ident(column), dir));
        self
    }

    pub fn group(mut self, column: &str) -> Self {
        self.groups.push(quote_ident(column));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn has_conditions(&self) -> bool {
        !self.conditions.is_empty()
    }

    pub fn to_select(&self) -> Statement {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        self.render_select(&columns, true)
    }

    /// `SELECT COUNT(*) AS aggregate`, ignoring order and paging.
    pub fn to_count(&self) -> Statement {
        self.render_select("COUNT(*) AS `aggregate`", false)
    }

    pub fn to_sum(&self, column: &str) -> Statement {
        self.render_select(
            &format!("SUM({}) AS `aggregate`", quote_ident(column)),
            false,
        )
    }

    pub fn to_exists(&self) -> Statement {
        let mut statement = self.render_select("1", false);
        statement.sql.push_str(" LIMIT 1");
        statement
    }

    /// `UPDATE ... SET`; delta values render as `col = col + ?`.
    pub fn to_update(&self, assignments: &[(String, Value)]) -> DbResult<Statement> {
        if assignments.is_empty() {
            return Err(DbError::invalid_input("UPDATE needs at least one column"));
        }

        let mut values = Vec::with_capacity(assignments.len());
        let sets: Vec<String> = assignments
            .iter()
            .map(|(column, value)| {
                let quoted = quote_ident(column);
                values.push(value.clone());
                match value {
                    Value::Delta(_) => format!("{quoted} = {quoted} + ?"),
                    _ => format!("{quoted} = ?"),
                }
            })
            .collect();

        let mut sql = format!("UPDATE {} SET {}", self.table_name(), sets.join(", "));
        self.render_where(&mut sql, &mut values);
        self.render_order_limit(&mut sql);
        Ok(Statement { sql, values })
    }

    /// Bulk update keyed by `key`, one CASE expression per column.
    ///
    /// Every record must carry the key column; columns missing from a
    /// record keep their current value.
    pub fn to_updates(&self, key: &str, records: &[Vec<(String, Value)>]) -> DbResult<Statement> {
        if records.is_empty() {
            return Err(DbError::invalid_input("Bulk update needs at least one record"));
        }

        let mut keys = Vec::with_capacity(records.len());
        let mut columns: Vec<&str> = Vec::new();
        for record in records {
            let key_value = record
                .iter()
                .find(|(c, _)| c == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    DbError::invalid_input(format!("Bulk update record is missing key '{}'", key))
                })?;
            keys.push(key_value);
            for (column, _) in record {
                if column != key && !columns.contains(&column.as_str()) {
                    columns.push(column);
                }
            }
        }
        if columns.is_empty() {
            return Err(DbError::invalid_input("Bulk update has no columns to set"));
        }

        let quoted_key = quote_ident(key);
        let mut values = Vec::new();
        let mut sets = Vec::with_capacity(columns.len());
        for column in &columns {
            let quoted = quote_ident(column);
            let mut case = format!("{quoted} = CASE {quoted_key}");
            for (record, key_value) in records.iter().zip(&keys) {
                if let Some((_, value)) = record.iter().find(|(c, _)| c == column) {
                    case.push_str(" WHEN ? THEN ?");
                    values.push(key_value.clone());
                    values.push(value.clone());
                }
            }
            case.push_str(&format!(" ELSE {quoted} END"));
            sets.push(case);
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} IN ({})",
            self.table_name(),
            sets.join(", "),
            quoted_key,
            placeholders(keys.len())
        );
        values.extend(keys);
        if self.has_conditions() {
            // Grouped so OR criteria cannot widen the key filter
            sql.push_str(" AND (");
            self.render_conditions(&mut sql, &mut values);
            sql.push(')');
        }
        Ok(Statement { sql, values })
    }

    pub fn to_delete(&self) -> Statement {
        let mut values = Vec::new();
        let mut sql = format!("DELETE FROM {}", self.table_name());
        self.render_where(&mut sql, &mut values);
        self.render_order_limit(&mut sql);
        Statement { sql, values }
    }

    pub fn to_insert(&self, record: &[(String, Value)]) -> DbResult<Statement> {
        if record.is_empty() {
            return Err(DbError::invalid_input("INSERT needs at least one column"));
        }
        let columns: Vec<String> = record.iter().map(|(c, _)| quote_ident(c)).collect();
        Ok(Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table_name(),
                columns.join(", "),
                placeholders(record.len())
            ),
            values: record.iter().map(|(_, v)| v.clone()).collect(),
        })
    }

    /// Multi-row insert; every record must list the same columns in the same order.
    pub fn to_batch_insert(&self, records: &[Vec<(String, Value)>]) -> DbResult<Statement> {
        let first = records
            .first()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| DbError::invalid_input("Batch insert needs at least one record"))?;
        let columns: Vec<&str> = first.iter().map(|(c, _)| c.as_str()).collect();

        let mut values = Vec::with_capacity(columns.len() * records.len());
        let mut groups = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let same_columns = record.len() == columns.len()
                && record.iter().zip(&columns).all(|((c, _), expected)| c == expected);
            if !same_columns {
                return Err(DbError::invalid_input(format!(
                    "Batch insert record {} has different columns than the first record",
                    idx
                )));
            }
            values.extend(record.iter().map(|(_, v)| v.clone()));
            groups.push(format!("({})", placeholders(columns.len())));
        }

        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        Ok(Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.table_name(),
                quoted.join(", "),
                groups.join(", ")
            ),
            values,
        })
    }

    fn push_condition(mut self, conjunction: Conjunction, column: &str, op: &str, value: Value) -> Self {
        let quoted = quote_ident(column);
        let condition = match (&value, op) {
            (Value::Null, "=" | "IS") => Condition {
                conjunction,
                sql: format!("{quoted} IS NULL"),
                values: Vec::new(),
            },
            (Value::Null, "!=" | "<>" | "IS NOT") => Condition {
                conjunction,
                sql: format!("{quoted} IS NOT NULL"),
                values: Vec::new(),
            },
            _ => Condition {
                conjunction,
                sql: format!("{quoted} {op} ?"),
                values: vec![value],
            },
        };
        self.conditions.push(condition);
        self
    }

    fn render_select(&self, columns: &str, with_paging: bool) -> Statement {
        let mut values = Vec::new();
        let mut sql = format!("SELECT {} FROM {}", columns, self.table_name());
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        self.render_where(&mut sql, &mut values);
        if !self.groups.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.groups.join(", "));
        }
        if with_paging {
            self.render_order_limit(&mut sql);
            if let Some(offset) = self.offset {
                if self.limit.is_none() {
                    // MySQL has no OFFSET without LIMIT
                    sql.push_str(&format!(" LIMIT {}", u64::MAX));
                }
                sql.push_str(&format!(" OFFSET {}", offset));
            }
        }
        Statement { sql, values }
    }

    fn render_where(&self, sql: &mut String, values: &mut Vec<Value>) {
        if self.has_conditions() {
            sql.push_str(" WHERE ");
            self.render_conditions(sql, values);
        }
    }

    fn render_conditions(&self, sql: &mut String, values: &mut Vec<Value>) {
        for (idx, condition) in self.conditions.iter().enumerate() {
            if idx > 0 {
                sql.push_str(match condition.conjunction {
                    Conjunction::And => " AND ",
                    Conjunction::Or => " OR ",
                });
            }
            sql.push_str(&condition.sql);
            values.extend(condition.values.iter().cloned());
        }
    }

    fn render_order_limit(&self, sql: &mut String) {
        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.orders.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
    }
}

/// Backtick-quote an identifier, `table.column` style included.
///
/// Expressions (anything with parentheses or spaces) and `*` pass through.
pub fn quote_ident(name: &str) -> String {
    let name = name.trim();
    if name == "*" || name.contains('(') || name.contains(' ') {
        return name.to_string();
    }
    name.split('.')
        .map(|part| {
            if part == "*" {
                part.to_string()
            } else {
                format!("`{}`", part.trim_matches('`').replace('`', "``"))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
