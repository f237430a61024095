//! Table-level access for a [`Model`].

use crate::ar::{Lookup, Missing, Model, Page, Record, paginate};
use crate::cache::Cache;
use crate::db::{Database, QueryBuilder, Registry};
use crate::error::{DbError, DbResult};
use crate::models::{Actor, Row, Value};
use futures_util::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Up to this many matching rows, `random()` reads every primary key at once.
pub const RANDOM_SCAN_LIMIT: u64 = 1000;
/// Keys fetched per sampled page above the scan limit.
pub const RANDOM_PAGE_SIZE: u64 = 20;
/// Sampled pages fetched in parallel.
pub const RANDOM_CONCURRENCY: usize = 50;
/// Lifetime of a cached primary-key universe.
pub const RANDOM_CACHE_TTL: Duration = Duration::from_secs(60);

pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(3600);

/// Reads and bulk writes for one model.
///
/// Reads use the SLAVE database and, for primary-key lookups, the cache.
/// Writes use the MASTER database, so they join a nested transaction when
/// one is active.
pub struct Dao<M> {
    master: Arc<Database>,
    slave: Arc<Database>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for Dao<M> {
    fn clone(&self) -> Self {
        Self {
            master: Arc::clone(&self.master),
            slave: Arc::clone(&self.slave),
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
            _model: PhantomData,
        }
    }
}

impl<M: Model> Dao<M> {
    pub fn new(master: Arc<Database>, slave: Arc<Database>, cache: Arc<dyn Cache>) -> Self {
        Self {
            master,
            slave,
            cache,
            ttl: DEFAULT_RECORD_TTL,
            _model: PhantomData,
        }
    }

    /// Bind to both actors of a registered data source.
    pub async fn from_registry(
        registry: &Registry,
        name: &str,
        cache: Arc<dyn Cache>,
    ) -> DbResult<Self> {
        let master = registry.database(name, Actor::Master).await?;
        let slave = registry.database(name, Actor::Slave).await?;
        Ok(Self::new(master, slave, cache))
    }

    /// Cache lifetime of loaded records.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn master(&self) -> &Arc<Database> {
        &self.master
    }

    pub fn slave(&self) -> &Arc<Database> {
        &self.slave
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Empty criteria on this model's table.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(M::TABLE)
    }

    /// `AR_{DB}_{TABLE}_{PK}_{value}`.
    pub fn cache_key(&self, key: &JsonValue) -> String {
        format!(
            "AR_{}_{}_{}_{}",
            self.master.name(),
            M::TABLE,
            M::PRIMARY_KEY,
            key_text(key)
        )
    }

    /// Wrap a model that has not been stored yet.
    pub fn new_record(&self, model: M) -> Record<M> {
        Record::new(self.clone(), model)
    }

    /// Insert a model; check `has_error()` on the result.
    pub async fn create(&self, model: M) -> Record<M> {
        let mut record = self.new_record(model);
        record.save().await;
        record
    }

    /// Primary-key lookup through the cache, reading the SLAVE on a miss.
    pub async fn ar(&self, key: impl Into<Value>) -> Lookup<M> {
        let key = key.into().to_json();
        let cache_key = self.cache_key(&key);

        if let Some(JsonValue::Object(row)) = self.cache.get(&cache_key).await {
            match self.load(row) {
                Ok(record) => return Lookup::Found(record),
                Err(err) => {
                    debug!(key = %cache_key, error = %err, "Dropping undecodable cache entry");
                    self.cache.delete(&cache_key).await;
                }
            }
        }

        let criteria = self.query().where_eq(M::PRIMARY_KEY, Value::from_json(&key));
        match self.slave.query(criteria).first().await {
            Ok(Some(row)) => match self.load(row.clone()) {
                Ok(record) => {
                    self.cache
                        .set(&cache_key, JsonValue::Object(row), self.ttl)
                        .await;
                    Lookup::Found(record)
                }
                Err(err) => self.missing(Some(key), err),
            },
            Ok(None) => Lookup::NotFound(Missing::new(M::TABLE, Some(key))),
            Err(err) => self.missing(Some(key), err),
        }
    }

    /// Primary-key lookup on the MASTER, bypassing the cache in both directions.
    ///
    /// Inside a nested transaction this sees the transaction's own writes.
    pub async fn ar_master(&self, key: impl Into<Value>) -> Lookup<M> {
        let key = key.into().to_json();
        let criteria = self.query().where_eq(M::PRIMARY_KEY, Value::from_json(&key));
        match self.master.query(criteria).first().await {
            Ok(Some(row)) => match self.load(row) {
                Ok(record) => Lookup::Found(record),
                Err(err) => self.missing(Some(key), err),
            },
            Ok(None) => Lookup::NotFound(Missing::new(M::TABLE, Some(key))),
            Err(err) => self.missing(Some(key), err),
        }
    }

    /// First row matching `criteria`.
    pub async fn first(&self, criteria: QueryBuilder) -> Lookup<M> {
        match self.slave.query(criteria).first().await {
            Ok(Some(row)) => match self.load(row) {
                Ok(record) => Lookup::Found(record),
                Err(err) => self.missing(None, err),
            },
            Ok(None) => Lookup::NotFound(Missing::new(M::TABLE, None)),
            Err(err) => self.missing(None, err),
        }
    }

    pub async fn all(&self, criteria: QueryBuilder) -> DbResult<Vec<Record<M>>> {
        let rows = self.slave.query(criteria).get().await?;
        rows.into_iter().map(|row| self.load(row)).collect()
    }

    /// One page of matching rows. Out-of-range pages are clamped to the
    /// nearest valid one.
    pub async fn list(&self, criteria: QueryBuilder, page: u64, page_size: u64) -> DbResult<Page<M>> {
        let page_size = page_size.max(1);
        let total = self.count(criteria.clone()).await?;
        let (total_pages, page, offset) = paginate(total, page, page_size);

        let items = if total == 0 {
            Vec::new()
        } else {
            self.all(criteria.limit(page_size).offset(offset)).await?
        };

        Ok(Page {
            items,
            page,
            page_size,
            total,
            total_pages,
        })
    }

    pub async fn count(&self, criteria: QueryBuilder) -> DbResult<u64> {
        self.slave.query(criteria).count().await
    }

    pub async fn sum(&self, criteria: QueryBuilder, column: &str) -> DbResult<f64> {
        self.slave.query(criteria).sum(column).await
    }

    /// Up to `n` distinct random rows matching `criteria`, without `ORDER BY RAND()`.
    pub async fn random(&self, criteria: QueryBuilder, n: usize) -> DbResult<Vec<Record<M>>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let universe = self.random_universe(&criteria, n).await?;
        let chosen: Vec<JsonValue> = {
            let mut rng = rand::thread_rng();
            universe.choose_multiple(&mut rng, n).cloned().collect()
        };
        if chosen.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = self
            .all(
                self.query()
                    .where_in(M::PRIMARY_KEY, chosen.iter().map(Value::from_json)),
            )
            .await?;
        // IN lookups come back in storage order
        let rank: HashMap<String, usize> = chosen
            .iter()
            .enumerate()
            .map(|(idx, key)| (key_text(key), idx))
            .collect();
        records.sort_by_key(|record| {
            record
                .primary_value()
                .and_then(|key| rank.get(&key_text(key)).copied())
                .unwrap_or(usize::MAX)
        });
        Ok(records)
    }

    /// Primary keys to sample from, cached for [`RANDOM_CACHE_TTL`].
    ///
    /// Small result sets are read whole. Larger ones read a random subset of
    /// fixed-size pages, at most [`RANDOM_CONCURRENCY`] queries in flight.
    async fn random_universe(&self, criteria: &QueryBuilder, n: usize) -> DbResult<Vec<JsonValue>> {
        let cache_key = self.random_cache_key(criteria);
        if let Some(JsonValue::Array(keys)) = self.cache.get(&cache_key).await {
            return Ok(keys);
        }

        let total = self.count(criteria.clone()).await?;
        let keys = if total <= RANDOM_SCAN_LIMIT {
            self.slave
                .query(criteria.clone())
                .pluck(M::PRIMARY_KEY)
                .await?
        } else {
            let pages = total.div_ceil(RANDOM_PAGE_SIZE);
            let wanted = (n as u64)
                .div_ceil(RANDOM_PAGE_SIZE)
                .saturating_mul(2)
                .max(RANDOM_CONCURRENCY as u64)
                .min(pages);
            let picked: Vec<u64> = {
                let mut rng = rand::thread_rng();
                rand::seq::index::sample(&mut rng, pages as usize, wanted as usize)
                    .into_iter()
                    .map(|page| page as u64)
                    .collect()
            };
            debug!(
                table = M::TABLE,
                total,
                pages = picked.len(),
                "Sampling primary keys from random pages"
            );

            let batches: Vec<DbResult<Vec<JsonValue>>> = stream::iter(picked)
                .map(|page| {
                    let builder = criteria
                        .clone()
                        .limit(RANDOM_PAGE_SIZE)
                        .offset(page * RANDOM_PAGE_SIZE);
                    async move { self.slave.query(builder).pluck(M::PRIMARY_KEY).await }
                })
                .buffer_unordered(RANDOM_CONCURRENCY)
                .collect()
                .await;

            let mut keys = Vec::new();
            for batch in batches {
                keys.extend(batch?);
            }
            keys
        };

        let mut seen = HashSet::new();
        let keys: Vec<JsonValue> = keys
            .into_iter()
            .filter(|key| !key.is_null() && seen.insert(key_text(key)))
            .collect();

        self.cache
            .set(&cache_key, JsonValue::Array(keys.clone()), RANDOM_CACHE_TTL)
            .await;
        Ok(keys)
    }

    fn random_cache_key(&self, criteria: &QueryBuilder) -> String {
        let statement = criteria.to_count();
        let mut hasher = DefaultHasher::new();
        statement.sql.hash(&mut hasher);
        for value in &statement.values {
            value.to_json().to_string().hash(&mut hasher);
        }
        format!(
            "AR_{}_{}_RANDOM_{:016x}",
            self.master.name(),
            M::TABLE,
            hasher.finish()
        )
    }

    /// Update every matching row; cached records of the affected keys are dropped.
    pub async fn update<K, V>(
        &self,
        criteria: QueryBuilder,
        assignments: impl IntoIterator<Item = (K, V)>,
    ) -> DbResult<u64>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let keys = self
            .master
            .query(criteria.clone())
            .pluck(M::PRIMARY_KEY)
            .await?;
        let affected = self.master.query(criteria).update(assignments).await?;
        for key in &keys {
            self.invalidate(key).await;
        }
        Ok(affected)
    }

    /// Delete every matching row; cached records of the affected keys are dropped.
    pub async fn delete(&self, criteria: QueryBuilder) -> DbResult<u64> {
        let keys = self
            .master
            .query(criteria.clone())
            .pluck(M::PRIMARY_KEY)
            .await?;
        let affected = self.master.query(criteria).delete().await?;
        for key in &keys {
            self.invalidate(key).await;
        }
        Ok(affected)
    }

    pub(crate) async fn invalidate(&self, key: &JsonValue) {
        if key.is_null() {
            return;
        }
        self.cache.delete(&self.cache_key(key)).await;
    }

    /// Build a record from a fetched row; the row becomes its snapshot.
    pub(crate) fn load(&self, mut row: Row) -> DbResult<Record<M>> {
        for field in M::json_fields() {
            if let Some(JsonValue::String(text)) = row.get(*field) {
                if let Ok(decoded) = serde_json::from_str::<JsonValue>(text) {
                    row.insert((*field).to_string(), decoded);
                }
            }
        }

        let model: M = serde_json::from_value(JsonValue::Object(row.clone())).map_err(|e| {
            DbError::internal(format!("Cannot load {} row: {}", M::TABLE, e))
        })?;
        Ok(Record::loaded(self.clone(), model, row))
    }

    fn missing(&self, key: Option<JsonValue>, err: DbError) -> Lookup<M> {
        warn!(table = M::TABLE, key = ?key, error = %err, "Active record lookup failed");
        Lookup::NotFound(Missing::new(M::TABLE, key).with_error(err.to_string()))
    }
}

impl<M> std::fmt::Debug for Dao<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dao")
            .field("master", &self.master.label())
            .field("slave", &self.slave.label())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Key text used in cache keys; strings are not quoted.
pub(crate) fn key_text(key: &JsonValue) -> String {
    match key {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
