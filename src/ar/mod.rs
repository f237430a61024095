//! Active records: cached, validated row projections over a [`Database`].
//!
//! A [`Model`] is a plain serde struct bound to one table. [`Dao`] reads and
//! queries it (reads go to the SLAVE actor and through the cache), and each
//! loaded row becomes a [`Record`] that remembers a snapshot of what was
//! loaded so `save()` only writes the columns that changed.
//!
//! Absence is never an error: lookups return [`Lookup::NotFound`], and write
//! failures are recorded on the record instead of being returned.
//!
//! [`Database`]: crate::db::Database

pub mod dao;
pub mod record;
pub mod rules;

pub use dao::Dao;
pub use record::Record;
pub use rules::{FieldError, FieldRule, Kind, Rule};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A struct mapped onto one table.
///
/// Fields are (de)serialized by column name; `#[serde(default)]` on the
/// struct lets partial rows load.
pub trait Model: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {
    /// Table name without prefix.
    const TABLE: &'static str;

    const PRIMARY_KEY: &'static str = "id";

    fn rules() -> Vec<FieldRule> {
        Vec::new()
    }

    /// Columns stored as JSON text and decoded into structured values on load.
    fn json_fields() -> &'static [&'static str] {
        &[]
    }
}

/// Result of a single-record lookup.
#[derive(Debug)]
pub enum Lookup<M: Model> {
    Found(Record<M>),
    NotFound(Missing),
}

impl<M: Model> Lookup<M> {
    pub fn exists(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn record(&self) -> Option<&Record<M>> {
        match self {
            Self::Found(record) => Some(record),
            Self::NotFound(_) => None,
        }
    }

    pub fn into_record(self) -> Option<Record<M>> {
        match self {
            Self::Found(record) => Some(record),
            Self::NotFound(_) => None,
        }
    }

    /// Field value from the loaded snapshot; `None` when not found.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.record()
            .and_then(|record| record.snapshot())
            .and_then(|snapshot| snapshot.get(field))
    }

    /// Read failure message, if the lookup failed rather than missed.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Found(_) => None,
            Self::NotFound(missing) => missing.error(),
        }
    }
}

/// The not-found variant of a lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Missing {
    pub table: String,
    /// Primary key searched for, when the lookup was by key.
    pub key: Option<JsonValue>,
    error: Option<String>,
}

impl Missing {
    pub fn new(table: impl Into<String>, key: Option<JsonValue>) -> Self {
        Self {
            table: table.into(),
            key,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// One page of [`Dao::list`].
#[derive(Debug)]
pub struct Page<M: Model> {
    pub items: Vec<Record<M>>,
    /// Page actually served, after clamping.
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl<M: Model> Page<M> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Clamp a requested page into `[1, total_pages]` and compute its offset.
///
/// Returns `(total_pages, page, offset)`. An empty result set has zero pages
/// and serves page 1.
pub fn paginate(total: u64, page: u64, page_size: u64) -> (u64, u64, u64) {
    let page_size = page_size.max(1);
    let total_pages = total.div_ceil(page_size);
    let page = page.clamp(1, total_pages.max(1));
    (total_pages, page, (page - 1) * page_size)
}
