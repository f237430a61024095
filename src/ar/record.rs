//! A loaded (or not yet stored) row of a [`Model`].

use crate::ar::dao::key_text;
use crate::ar::rules::validate;
use crate::ar::{Dao, FieldError, Model};
use crate::error::DbError;
use crate::models::{Delta, Row, Value};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

pub struct Record<M: Model> {
    dao: Dao<M>,
    model: M,
    /// Column values as last loaded or written.
    snapshot: Option<Row>,
    primary: Option<JsonValue>,
    exists: bool,
    deltas: BTreeMap<String, Delta>,
    errors: Vec<FieldError>,
}

impl<M: Model> Record<M> {
    pub(crate) fn new(dao: Dao<M>, model: M) -> Self {
        Self {
            dao,
            model,
            snapshot: None,
            primary: None,
            exists: false,
            deltas: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn loaded(dao: Dao<M>, model: M, snapshot: Row) -> Self {
        let primary = snapshot
            .get(M::PRIMARY_KEY)
            .filter(|key| !key.is_null())
            .cloned();
        Self {
            dao,
            model,
            snapshot: Some(snapshot),
            primary,
            exists: true,
            deltas: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Whether the row is known to be stored.
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn primary_value(&self) -> Option<&JsonValue> {
        self.primary.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Row> {
        self.snapshot.as_ref()
    }

    /// Queue a relative increase of `field`, written as `field = field + n`.
    ///
    /// Pending deltas on the same field add up. While one is pending, the
    /// model's own value for that field is not written.
    pub fn incr(&mut self, field: &str, by: impl Into<Delta>) -> &mut Self {
        let by = by.into();
        self.deltas
            .entry(field.to_string())
            .and_modify(|pending| *pending = pending.merge(by))
            .or_insert(by);
        self
    }

    pub fn decr(&mut self, field: &str, by: impl Into<Delta>) -> &mut Self {
        let negated = match by.into() {
            Delta::Int(v) => Delta::Int(v.saturating_neg()),
            Delta::Float(v) => Delta::Float(-v),
        };
        self.incr(field, negated)
    }

    pub fn pending_delta(&self, field: &str) -> Option<Delta> {
        self.deltas.get(field).copied()
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// First recorded error message.
    pub fn error(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Validate and write. Stored records write only changed columns, and
    /// nothing at all when no column changed; new records are inserted and
    /// adopt the generated id.
    ///
    /// Returns `false` with errors recorded instead of failing.
    pub async fn save(&mut self) -> bool {
        self.errors.clear();

        let fields = match self.fields() {
            Ok(fields) => fields,
            Err(err) => return self.fail("save", err),
        };

        let failures = validate(&M::rules(), &fields);
        if !failures.is_empty() {
            debug!(
                table = M::TABLE,
                errors = failures.len(),
                "Active record failed validation"
            );
            self.errors = failures;
            return false;
        }

        if self.exists {
            self.update_changed(fields).await
        } else {
            self.insert(fields).await
        }
    }

    async fn update_changed(&mut self, fields: Row) -> bool {
        let Some(primary) = self.primary.clone() else {
            return self.fail(
                "update",
                DbError::invalid_input(format!("{} record has no primary key value", M::TABLE)),
            );
        };

        let snapshot = self.snapshot.clone().unwrap_or_default();
        let (changes, next) = diff(
            &fields,
            &snapshot,
            &self.deltas,
            M::json_fields(),
            M::PRIMARY_KEY,
        );
        if changes.is_empty() {
            debug!(table = M::TABLE, key = %key_text(&primary), "Nothing changed, skipping save");
            return true;
        }

        let result = self
            .dao
            .master()
            .table(M::TABLE)
            .where_eq(M::PRIMARY_KEY, Value::from_json(&primary))
            .update(changes)
            .await;

        match result {
            Ok(_) => {
                self.dao.invalidate(&primary).await;
                self.snapshot = Some(next);
                self.sync_model(&[]);
                self.deltas.clear();
                true
            }
            Err(err) => self.fail("update", err),
        }
    }

    async fn insert(&mut self, fields: Row) -> bool {
        let mut record = Vec::with_capacity(fields.len());
        let mut next = Row::new();
        for (column, value) in &fields {
            let value = match self.deltas.get(column) {
                Some(delta) => delta.apply(value),
                None => value.clone(),
            };
            if column == M::PRIMARY_KEY && is_blank_key(&value) {
                continue;
            }
            record.push((column.clone(), bind_value(column, &value, M::json_fields())));
            next.insert(column.clone(), value);
        }

        let result = self.dao.master().table(M::TABLE).insert(record).await;
        match result {
            Ok(generated) => {
                let primary = match next.get(M::PRIMARY_KEY) {
                    Some(key) if !is_blank_key(key) => key.clone(),
                    _ => generated_key(&generated),
                };
                self.dao.invalidate(&primary).await;

                next.insert(M::PRIMARY_KEY.to_string(), primary.clone());
                self.primary = (!primary.is_null()).then_some(primary);
                self.snapshot = Some(next);
                self.exists = true;
                self.sync_model(&[M::PRIMARY_KEY]);
                self.deltas.clear();
                true
            }
            Err(err) => self.fail("insert", err),
        }
    }

    /// Delete the stored row and drop its cache entry.
    pub async fn delete(&mut self) -> bool {
        self.errors.clear();

        let primary = match (&self.primary, self.exists) {
            (Some(primary), true) => primary.clone(),
            _ => {
                return self.fail(
                    "delete",
                    DbError::invalid_input(format!("{} record is not stored", M::TABLE)),
                );
            }
        };

        let result = self
            .dao
            .master()
            .table(M::TABLE)
            .where_eq(M::PRIMARY_KEY, Value::from_json(&primary))
            .delete()
            .await;

        match result {
            Ok(_) => {
                self.dao.invalidate(&primary).await;
                self.exists = false;
                self.snapshot = None;
                true
            }
            Err(err) => self.fail("delete", err),
        }
    }

    /// The model as a column map.
    fn fields(&self) -> Result<Row, DbError> {
        match serde_json::to_value(&self.model) {
            Ok(JsonValue::Object(fields)) => Ok(fields),
            Ok(_) => Err(DbError::internal(format!(
                "{} model does not serialize to an object",
                M::TABLE
            ))),
            Err(e) => Err(DbError::internal(format!(
                "Cannot serialize {} model: {}",
                M::TABLE,
                e
            ))),
        }
    }

    /// Copy the snapshot's values for `columns` and every delta column back
    /// into the model. Left unchanged if the result does not deserialize.
    fn sync_model(&mut self, columns: &[&str]) {
        let (Some(snapshot), Ok(mut fields)) = (&self.snapshot, self.fields()) else {
            return;
        };

        let columns = columns
            .iter()
            .map(|c| c.to_string())
            .chain(self.deltas.keys().cloned());
        for column in columns {
            if let Some(value) = snapshot.get(&column) {
                fields.insert(column, value.clone());
            }
        }

        match serde_json::from_value(JsonValue::Object(fields)) {
            Ok(model) => self.model = model,
            Err(e) => debug!(table = M::TABLE, error = %e, "Model not refreshed after save"),
        }
    }

    fn fail(&mut self, action: &str, err: DbError) -> bool {
        warn!(
            table = M::TABLE,
            key = ?self.primary,
            error = %err,
            "Active record {} failed",
            action
        );
        self.errors.push(FieldError::general(err.to_string()));
        false
    }
}

/// Columns of `fields` that differ from `snapshot`, plus every pending delta,
/// and the snapshot as it will be after the write.
///
/// A delta is applied to the snapshot value once per call and written as a
/// relative change. The primary key column is never part of the change set.
pub fn diff(
    fields: &Row,
    snapshot: &Row,
    deltas: &BTreeMap<String, Delta>,
    json_fields: &[&str],
    primary_key: &str,
) -> (Vec<(String, Value)>, Row) {
    let mut changes = Vec::new();
    let mut next = snapshot.clone();

    for (column, value) in fields {
        if column == primary_key || deltas.contains_key(column) {
            continue;
        }
        if snapshot.get(column).is_some_and(|old| same_value(old, value)) {
            continue;
        }
        changes.push((column.clone(), bind_value(column, value, json_fields)));
        next.insert(column.clone(), value.clone());
    }

    for (column, delta) in deltas {
        if column == primary_key {
            continue;
        }
        let applied = delta.apply(snapshot.get(column).unwrap_or(&JsonValue::Null));
        changes.push((column.clone(), Value::Delta(*delta)));
        next.insert(column.clone(), applied);
    }

    (changes, next)
}

/// Equal JSON, with numbers compared by value (`1` equals `1.0`).
fn same_value(old: &JsonValue, new: &JsonValue) -> bool {
    match (old, new) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a == b || a.as_f64() == b.as_f64(),
        _ => old == new,
    }
}

fn bind_value(column: &str, value: &JsonValue, json_fields: &[&str]) -> Value {
    if !value.is_null() && json_fields.contains(&column) {
        Value::Json(value.clone())
    } else {
        Value::from_json(value)
    }
}

fn is_blank_key(key: &JsonValue) -> bool {
    match key {
        JsonValue::Null => true,
        JsonValue::Number(n) => n.as_u64() == Some(0),
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

fn generated_key(id: &str) -> JsonValue {
    if id.is_empty() {
        return JsonValue::Null;
    }
    id.parse::<u64>()
        .map(JsonValue::from)
        .unwrap_or_else(|_| JsonValue::String(id.to_string()))
}

impl<M: Model> Deref for Record<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M: Model> DerefMut for Record<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.model
    }
}

impl<M: Model> std::fmt::Debug for Record<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("table", &M::TABLE)
            .field("primary", &self.primary)
            .field("exists", &self.exists)
            .field("deltas", &self.deltas)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_diff_keeps_only_changed_columns() {
        let snapshot = row(json!({"id": 1, "a": 1, "b": 2}));
        let fields = row(json!({"id": 1, "a": 1, "b": 3}));
        let (changes, next) = diff(&fields, &snapshot, &BTreeMap::new(), &[], "id");
        assert_eq!(changes, vec![("b".to_string(), Value::Int(3))]);
        assert_eq!(next.get("b"), Some(&json!(3)));
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        let snapshot = row(json!({"id": 1, "a": 1, "price": 2.0}));
        let fields = row(json!({"id": 1, "a": 1, "price": 2}));
        let (changes, _) = diff(&fields, &snapshot, &BTreeMap::new(), &[], "id");
        assert!(changes.is_empty());
    }

    #[test]
    fn test_diff_applies_delta_to_snapshot() {
        let snapshot = row(json!({"id": 1, "views": 10}));
        let fields = row(json!({"id": 1, "views": 10}));
        let deltas = BTreeMap::from([("views".to_string(), Delta::Int(5))]);
        let (changes, next) = diff(&fields, &snapshot, &deltas, &[], "id");
        assert_eq!(changes, vec![("views".to_string(), Value::Delta(Delta::Int(5)))]);
        assert_eq!(next.get("views"), Some(&json!(15)));
    }

    #[test]
    fn test_diff_encodes_json_columns() {
        let snapshot = row(json!({"id": 1, "meta": {"a": 1}}));
        let fields = row(json!({"id": 1, "meta": ["x"]}));
        let (changes, _) = diff(&fields, &snapshot, &BTreeMap::new(), &["meta"], "id");
        assert_eq!(changes, vec![("meta".to_string(), Value::Json(json!(["x"])))]);
    }

    #[test]
    fn test_generated_key() {
        assert_eq!(generated_key("42"), json!(42));
        assert_eq!(generated_key("abc"), json!("abc"));
        assert_eq!(generated_key(""), JsonValue::Null);
        assert!(is_blank_key(&json!(0)));
        assert!(!is_blank_key(&json!(3)));
    }
}
