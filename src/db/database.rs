//! Database facades.
//!
//! A [`Database`] owns the driver pool of one data source in one role and is
//! the only way to obtain an execution context. The [`Registry`] caches one
//! facade per (name, actor), plus per override key when callers isolate
//! facades per request.
//!
//! # Borrowing
//!
//! On a MASTER facade, when the task's nested-transaction coordinator is
//! active, `borrow()` returns the coordinator's transaction for this data
//! source (starting and registering one on first use) instead of a fresh
//! connection. Everything else gets a new single-use [`Connection`].
//!
//! A joined lease locks the shared transaction only while one of its
//! statements runs. A source that fails to join records an error on the
//! coordinator, so `finish()` rolls the whole cycle back.

use crate::config::PoolOptions;
use crate::db::bind::Bindings;
use crate::db::connection::Connection;
use crate::db::driver::Connector;
use crate::db::mysql::MySqlConnector;
use crate::db::nested::{Coordinator, SharedTransaction};
use crate::db::pool::{DriverPool, PoolStats, SimplePool, SinglePool};
use crate::db::query::{Order, QueryBuilder, Statement};
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{Actor, DataSource, Row, Value};
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// An execution context handed out by [`Database::borrow`].
pub enum Lease {
    /// Fresh context owning its own driver.
    Connection(Connection),
    /// Handle on the coordinator's transaction for this data source.
    Joined(JoinedLease),
}

impl Lease {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }

    /// Set the statement to run.
    pub fn raw(&mut self, sql: impl Into<String>, bindings: impl Into<Bindings>) -> &mut Self {
        match self {
            Self::Connection(conn) => {
                conn.raw(sql, bindings);
            }
            Self::Joined(joined) => joined.raw(sql.into(), bindings.into()),
        }
        self
    }

    /// Set a statement rendered by the query builder.
    pub fn statement(&mut self, statement: Statement) -> &mut Self {
        self.raw(statement.sql, Bindings::Positional(statement.values))
    }

    /// Set and run a statement in one step.
    pub async fn exec(
        &mut self,
        sql: impl Into<String>,
        bindings: impl Into<Bindings>,
    ) -> DbResult<&mut Self> {
        self.raw(sql, bindings);
        self.execute().await
    }

    /// Run the pending statement.
    pub async fn execute(&mut self) -> DbResult<&mut Self> {
        match self {
            Self::Connection(conn) => {
                conn.execute().await?;
            }
            Self::Joined(joined) => joined.execute().await?,
        }
        Ok(self)
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        match self {
            Self::Connection(conn) => conn.ping().await,
            Self::Joined(joined) => joined.shared.lock().await.ping().await,
        }
    }

    /// Start a builder chain on a table, run through this lease.
    pub fn table(&mut self, name: &str) -> TableQuery<'_> {
        let prefix = self.prefix().to_string();
        TableQuery {
            target: Target::Lease(self),
            builder: QueryBuilder::new(name).prefix(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            Self::Connection(conn) => conn.prefix(),
            Self::Joined(joined) => &joined.prefix,
        }
    }

    /// Generated id of the last insert; empty when none or when the statement failed.
    pub fn last_insert_id(&self) -> &str {
        match self {
            Self::Connection(conn) => conn.last_insert_id(),
            Self::Joined(joined) => &joined.last_insert_id,
        }
    }

    pub fn row_count(&self) -> u64 {
        match self {
            Self::Connection(conn) => conn.row_count(),
            Self::Joined(joined) => joined.row_count,
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Connection(conn) => conn.rows(),
            Self::Joined(joined) => &joined.rows,
        }
    }

    pub fn take_rows(&mut self) -> Vec<Row> {
        match self {
            Self::Connection(conn) => conn.take_rows(),
            Self::Joined(joined) => std::mem::take(&mut joined.rows),
        }
    }

    /// Whether the driver has gone back to the pool. A joined transaction
    /// keeps its driver until the coordinator finishes.
    pub fn is_released(&self) -> bool {
        match self {
            Self::Connection(conn) => conn.is_released(),
            Self::Joined(joined) => joined
                .shared
                .try_lock()
                .map(|tx| tx.is_released())
                .unwrap_or(false),
        }
    }

    pub fn in_transaction(&self) -> bool {
        match self {
            Self::Connection(conn) => conn.in_transaction(),
            Self::Joined(joined) => joined
                .shared
                .try_lock()
                .map(|tx| tx.in_transaction())
                .unwrap_or(true),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(conn) => f.debug_tuple("Connection").field(conn).finish(),
            Self::Joined(joined) => f.debug_tuple("Joined").field(joined).finish(),
        }
    }
}

/// A borrow of a coordinated transaction.
///
/// The transaction is locked only while a statement runs, so any number of
/// leases on the same data source can be alive in one task, and the
/// coordinator can finish while they are. Results are copied out of the
/// transaction after each run.
pub struct JoinedLease {
    shared: SharedTransaction,
    prefix: String,
    statement: Option<(String, Bindings)>,
    executed: bool,
    last_insert_id: String,
    row_count: u64,
    rows: Vec<Row>,
}

impl JoinedLease {
    fn new(shared: SharedTransaction, prefix: &str) -> Self {
        Self {
            shared,
            prefix: prefix.to_string(),
            statement: None,
            executed: false,
            last_insert_id: String::new(),
            row_count: 0,
            rows: Vec::new(),
        }
    }

    fn raw(&mut self, sql: String, bindings: Bindings) {
        self.statement = Some((sql, bindings));
        self.executed = false;
    }

    async fn execute(&mut self) -> DbResult<()> {
        let (sql, bindings) = self
            .statement
            .clone()
            .ok_or_else(|| DbError::invalid_input("No statement to execute"))?;
        if self.executed {
            return Err(DbError::reuse(sql));
        }
        self.executed = true;

        let result = {
            let mut tx = self.shared.lock().await;
            // One data source may serve schemas with different prefixes
            tx.set_prefix(&self.prefix);
            match tx.exec(sql, bindings).await {
                Ok(conn) => Ok((
                    conn.take_rows(),
                    conn.row_count(),
                    conn.last_insert_id().to_string(),
                )),
                Err(err) => Err(err),
            }
        };

        match result {
            Ok((rows, row_count, last_insert_id)) => {
                self.rows = rows;
                self.row_count = row_count;
                self.last_insert_id = last_insert_id;
                Ok(())
            }
            Err(err) => {
                self.rows = Vec::new();
                self.row_count = 0;
                self.last_insert_id = String::new();
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for JoinedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedLease")
            .field("prefix", &self.prefix)
            .field("executed", &self.executed)
            .field("row_count", &self.row_count)
            .finish_non_exhaustive()
    }
}

/// Metadata of an executed write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Written {
    pub rows_affected: u64,
    /// Empty when the statement generated no id.
    pub last_insert_id: String,
}

pub struct Database {
    source: DataSource,
    connector: Arc<dyn Connector>,
    pool: RwLock<Arc<dyn DriverPool>>,
}

impl Database {
    pub fn new(source: DataSource, connector: Arc<dyn Connector>) -> Self {
        let pool = build_pool(&source, &connector, source.pool_options.clone());
        Self {
            source,
            connector,
            pool: RwLock::new(pool),
        }
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn actor(&self) -> Actor {
        self.source.actor
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn prefix(&self) -> &str {
        &self.source.prefix
    }

    /// `name/actor`, used in logs and as the pool name.
    pub fn label(&self) -> String {
        format!("{}/{}", self.source.name, self.source.actor)
    }

    /// The current pool. Rebuilds swap it; drivers borrowed from an old pool
    /// still go back to that pool.
    pub fn pool(&self) -> Arc<dyn DriverPool> {
        match self.pool.read() {
            Ok(pool) => Arc::clone(&pool),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool().stats()
    }

    /// Borrow a fresh context, bypassing any nested transaction.
    pub async fn connect(&self) -> DbResult<Connection> {
        let pool = self.pool();
        let driver = pool.borrow().await?;
        Ok(Connection::new(
            driver,
            pool,
            self.label(),
            self.source.prefix.clone(),
        ))
    }

    /// Obtain an execution context for one unit of work.
    pub async fn borrow(&self) -> DbResult<Lease> {
        if self.source.actor == Actor::Master {
            if let Some(coordinator) = Coordinator::current().filter(Coordinator::is_begin) {
                return self.join(&coordinator).await;
            }
        }
        Ok(Lease::Connection(self.connect().await?))
    }

    async fn join(&self, coordinator: &Coordinator) -> DbResult<Lease> {
        let key = self.source.dsn();
        let shared = match coordinator.connection(&key) {
            Some(shared) => shared,
            None => match self.begin_joined().await {
                Ok(tx) => coordinator.register(&key, tx),
                Err(err) => {
                    // A data source that never joined still fails the whole cycle
                    coordinator.add_error(&key, err.to_string());
                    return Err(err);
                }
            },
        };
        Ok(Lease::Joined(JoinedLease::new(shared, &self.source.prefix)))
    }

    async fn begin_joined(&self) -> DbResult<Transaction> {
        Transaction::begin(self.connect().await?).await
    }

    /// Start a builder chain; each terminal operation borrows its own context.
    pub fn table(&self, name: &str) -> TableQuery<'_> {
        TableQuery {
            target: Target::Database(self),
            builder: QueryBuilder::new(name).prefix(self.source.prefix.clone()),
        }
    }

    /// Bind a prebuilt builder to this database; the table prefix is applied here.
    pub fn query(&self, builder: QueryBuilder) -> TableQuery<'_> {
        TableQuery {
            target: Target::Database(self),
            builder: builder.prefix(self.source.prefix.clone()),
        }
    }

    /// Run a statement and hand back the executed context for reading results.
    pub async fn raw(&self, sql: &str, bindings: impl Into<Bindings>) -> DbResult<Lease> {
        let mut lease = self.borrow().await?;
        lease.exec(sql, bindings).await?;
        Ok(lease)
    }

    /// Run a write statement.
    pub async fn exec(&self, sql: &str, bindings: impl Into<Bindings>) -> DbResult<Written> {
        let lease = self.raw(sql, bindings).await?;
        Ok(Written {
            rows_affected: lease.row_count(),
            last_insert_id: lease.last_insert_id().to_string(),
        })
    }

    /// Run `f` inside an explicit transaction: commit on `Ok`, roll back and
    /// return the error on `Err`.
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = Transaction::begin(self.connect().await?).await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        transaction_id = %tx.id(),
                        error = %rollback_err,
                        "Rollback after failed transaction body also failed"
                    );
                }
                Err(err)
            }
        }
    }

    pub async fn ping(&self) -> DbResult<()> {
        let mut conn = self.connect().await?;
        conn.ping().await
    }

    /// Replace the pool if the effective limits differ. Returns whether it was rebuilt.
    pub async fn configure_pool(&self, options: PoolOptions) -> DbResult<bool> {
        options.validate().map_err(DbError::config)?;

        let old = {
            let mut pool = match self.pool.write() {
                Ok(pool) => pool,
                Err(poisoned) => poisoned.into_inner(),
            };
            if pool.options().same_limits(&options) {
                return Ok(false);
            }
            let fresh = build_pool(&self.source, &self.connector, options.clone());
            std::mem::replace(&mut *pool, fresh)
        };

        info!(
            data_source = %self.label(),
            max_open = options.max_open_or_default(),
            max_idle = options.max_idle_or_default(),
            max_lifetime = ?options.max_lifetime_or_default(),
            wait_timeout = ?options.wait_timeout_or_default(),
            "Driver pool rebuilt"
        );
        old.close().await;
        Ok(true)
    }

    pub async fn set_max_open(&self, max_open: u32) -> DbResult<bool> {
        let mut options = self.pool().options().clone();
        options.max_open = Some(max_open);
        self.configure_pool(options).await
    }

    pub async fn set_max_idle(&self, max_idle: u32) -> DbResult<bool> {
        let mut options = self.pool().options().clone();
        options.max_idle = Some(max_idle);
        self.configure_pool(options).await
    }

    /// Zero keeps drivers forever.
    pub async fn set_max_lifetime(&self, max_lifetime: Duration) -> DbResult<bool> {
        let mut options = self.pool().options().clone();
        options.max_lifetime_secs = Some(max_lifetime.as_secs());
        self.configure_pool(options).await
    }

    /// Zero waits forever.
    pub async fn set_wait_timeout(&self, wait_timeout: Duration) -> DbResult<bool> {
        let mut options = self.pool().options().clone();
        options.wait_timeout_secs = Some(wait_timeout.as_secs());
        self.configure_pool(options).await
    }

    pub async fn close(&self) {
        self.pool().close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.source.name)
            .field("actor", &self.source.actor)
            .field("target", &self.connector.describe())
            .finish_non_exhaustive()
    }
}

fn build_pool(
    source: &DataSource,
    connector: &Arc<dyn Connector>,
    options: PoolOptions,
) -> Arc<dyn DriverPool> {
    let name = format!("{}/{}", source.name, source.actor);
    if source.pooled {
        Arc::new(SimplePool::new(name, Arc::clone(connector), options))
    } else {
        Arc::new(SinglePool::new(name, Arc::clone(connector), options))
    }
}

enum Target<'a> {
    Database(&'a Database),
    Connection(&'a mut Connection),
    Lease(&'a mut Lease),
}

/// Builder chain bound to where it will run.
pub struct TableQuery<'a> {
    target: Target<'a>,
    builder: QueryBuilder,
}

struct Fetched {
    rows: Vec<Row>,
    row_count: u64,
    last_insert_id: String,
}

impl<'a> TableQuery<'a> {
    pub(crate) fn on_connection(conn: &'a mut Connection, table: &str, prefix: &str) -> Self {
        Self {
            target: Target::Connection(conn),
            builder: QueryBuilder::new(table).prefix(prefix),
        }
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.builder = self.builder.select(columns);
        self
    }

    pub fn where_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.builder = self.builder.where_eq(column, value);
        self
    }

    pub fn or_where_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.builder = self.builder.or_where_eq(column, value);
        self
    }

    pub fn where_op(mut self, column: &str, op: &str, value: impl Into<Value>) -> DbResult<Self> {
        self.builder = self.builder.where_op(column, op, value)?;
        Ok(self)
    }

    pub fn where_in<V: Into<Value>>(
        mut self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.builder = self.builder.where_in(column, values);
        self
    }

    pub fn where_raw(mut self, sql: impl Into<String>, values: Vec<Value>) -> Self {
        self.builder = self.builder.where_raw(sql, values);
        self
    }

    pub fn join(mut self, table: &str, on: &str) -> Self {
        self.builder = self.builder.join(table, on);
        self
    }

    pub fn left_join(mut self, table: &str, on: &str) -> Self {
        self.builder = self.builder.left_join(table, on);
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        self.builder = self.builder.order(column, order);
        self
    }

    pub fn group(mut self, column: &str) -> Self {
        self.builder = self.builder.group(column);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.builder = self.builder.limit(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.builder = self.builder.offset(offset);
        self
    }

    pub async fn get(self) -> DbResult<Vec<Row>> {
        let statement = self.builder.to_select();
        Ok(run(self.target, statement).await?.rows)
    }

    pub async fn first(mut self) -> DbResult<Option<Row>> {
        self.builder = self.builder.limit(1);
        Ok(self.get().await?.into_iter().next())
    }

    /// First column of the first row.
    pub async fn value(mut self, column: &str) -> DbResult<Option<JsonValue>> {
        self.builder = self.builder.select(&[column]).limit(1);
        let rows = self.get().await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, v)| v)))
    }

    /// One column across all rows.
    pub async fn pluck(mut self, column: &str) -> DbResult<Vec<JsonValue>> {
        self.builder = self.builder.select(&[column]);
        let rows = self.get().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().map(|(_, v)| v))
            .collect())
    }

    pub async fn count(self) -> DbResult<u64> {
        let statement = self.builder.to_count();
        let fetched = run(self.target, statement).await?;
        Ok(aggregate(&fetched.rows).map(|v| v.max(0.0) as u64).unwrap_or(0))
    }

    /// SUM of a column; 0 when no rows match.
    pub async fn sum(self, column: &str) -> DbResult<f64> {
        let statement = self.builder.to_sum(column);
        let fetched = run(self.target, statement).await?;
        Ok(aggregate(&fetched.rows).unwrap_or(0.0))
    }

    pub async fn exists(self) -> DbResult<bool> {
        let statement = self.builder.to_exists();
        Ok(!run(self.target, statement).await?.rows.is_empty())
    }

    /// Update matching rows; returns affected rows.
    pub async fn update<K, V>(self, assignments: impl IntoIterator<Item = (K, V)>) -> DbResult<u64>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let assignments: Vec<(String, Value)> = assignments
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let statement = self.builder.to_update(&assignments)?;
        Ok(run(self.target, statement).await?.row_count)
    }

    /// Bulk update keyed by `key`; see [`QueryBuilder::to_updates`].
    pub async fn updates(self, key: &str, records: &[Vec<(String, Value)>]) -> DbResult<u64> {
        let statement = self.builder.to_updates(key, records)?;
        Ok(run(self.target, statement).await?.row_count)
    }

    pub async fn delete(self) -> DbResult<u64> {
        let statement = self.builder.to_delete();
        Ok(run(self.target, statement).await?.row_count)
    }

    /// Insert one row; returns the generated id (empty when none).
    pub async fn insert<K, V>(self, record: impl IntoIterator<Item = (K, V)>) -> DbResult<String>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let record: Vec<(String, Value)> = record
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let statement = self.builder.to_insert(&record)?;
        Ok(run(self.target, statement).await?.last_insert_id)
    }

    pub async fn batch_insert(self, records: &[Vec<(String, Value)>]) -> DbResult<u64> {
        let statement = self.builder.to_batch_insert(records)?;
        Ok(run(self.target, statement).await?.row_count)
    }
}

async fn run(target: Target<'_>, statement: Statement) -> DbResult<Fetched> {
    match target {
        Target::Database(db) => {
            let mut lease = db.borrow().await?;
            run_on_lease(&mut lease, statement).await
        }
        Target::Connection(conn) => run_on(conn, statement).await,
        Target::Lease(lease) => run_on_lease(lease, statement).await,
    }
}

async fn run_on_lease(lease: &mut Lease, statement: Statement) -> DbResult<Fetched> {
    match lease {
        Lease::Connection(conn) => run_on(conn, statement).await,
        Lease::Joined(_) => {
            lease.statement(statement);
            lease.execute().await?;
            Ok(Fetched {
                rows: lease.take_rows(),
                row_count: lease.row_count(),
                last_insert_id: lease.last_insert_id().to_string(),
            })
        }
    }
}

async fn run_on(conn: &mut Connection, statement: Statement) -> DbResult<Fetched> {
    conn.statement(statement);
    conn.execute().await?;
    Ok(Fetched {
        rows: conn.take_rows(),
        row_count: conn.row_count(),
        last_insert_id: conn.last_insert_id().to_string(),
    })
}

/// Numeric `aggregate` column of the first row. DECIMAL sums arrive as strings.
fn aggregate(rows: &[Row]) -> Option<f64> {
    match rows.first()?.get("aggregate")? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Builds connectors for data sources; swapped out for dry runs and tests.
pub type ConnectorFactory = Arc<dyn Fn(&DataSource) -> DbResult<Arc<dyn Connector>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DatabaseKey {
    name: String,
    actor: Actor,
    override_key: Option<String>,
}

/// Process-wide cache of facades.
pub struct Registry {
    sources: HashMap<(String, Actor), DataSource>,
    factory: ConnectorFactory,
    databases: TokioRwLock<HashMap<DatabaseKey, Arc<Database>>>,
}

impl Registry {
    /// Registry backed by MySQL connections.
    pub fn new(sources: Vec<DataSource>) -> Self {
        Self::with_connector_factory(
            sources,
            Arc::new(|source: &DataSource| -> DbResult<Arc<dyn Connector>> {
                Ok(Arc::new(MySqlConnector::new(source)?))
            }),
        )
    }

    pub fn with_connector_factory(sources: Vec<DataSource>, factory: ConnectorFactory) -> Self {
        let sources = sources
            .into_iter()
            .map(|s| ((s.name.clone(), s.actor), s))
            .collect();
        Self {
            sources,
            factory,
            databases: TokioRwLock::new(HashMap::new()),
        }
    }

    /// Configured logical database names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().map(|(n, _)| n.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Settings for a role; a SLAVE without its own entry uses the master's.
    pub fn source(&self, name: &str, actor: Actor) -> DbResult<DataSource> {
        if let Some(source) = self.sources.get(&(name.to_string(), actor)) {
            return Ok(source.clone());
        }
        if actor == Actor::Slave {
            if let Some(master) = self.sources.get(&(name.to_string(), Actor::Master)) {
                return Ok(master.with_actor(Actor::Slave));
            }
        }
        Err(DbError::config(format!(
            "Unknown data source '{}' ({})",
            name, actor
        )))
    }

    pub async fn database(&self, name: &str, actor: Actor) -> DbResult<Arc<Database>> {
        self.get_or_create(DatabaseKey {
            name: name.to_string(),
            actor,
            override_key: None,
        })
        .await
    }

    /// Facade isolated under `override_key`, e.g. one per request.
    pub async fn database_with_override(
        &self,
        name: &str,
        actor: Actor,
        override_key: &str,
    ) -> DbResult<Arc<Database>> {
        self.get_or_create(DatabaseKey {
            name: name.to_string(),
            actor,
            override_key: Some(override_key.to_string()),
        })
        .await
    }

    async fn get_or_create(&self, key: DatabaseKey) -> DbResult<Arc<Database>> {
        {
            let databases = self.databases.read().await;
            if let Some(db) = databases.get(&key) {
                return Ok(Arc::clone(db));
            }
        }

        let mut databases = self.databases.write().await;
        // Double-check after acquiring write lock
        if let Some(db) = databases.get(&key) {
            return Ok(Arc::clone(db));
        }

        let source = self.source(&key.name, key.actor)?;
        let connector = (self.factory)(&source)?;
        debug!(
            database = %key.name,
            actor = %key.actor,
            override_key = ?key.override_key,
            target = %connector.describe(),
            "Creating database facade"
        );
        let db = Arc::new(Database::new(source, connector));
        databases.insert(key, Arc::clone(&db));
        Ok(db)
    }

    /// Close and forget every facade created under `override_key`.
    pub async fn release_override(&self, override_key: &str) {
        let released: Vec<Arc<Database>> = {
            let mut databases = self.databases.write().await;
            let keys: Vec<DatabaseKey> = databases
                .keys()
                .filter(|k| k.override_key.as_deref() == Some(override_key))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| databases.remove(k)).collect()
        };
        for db in released {
            db.close().await;
        }
    }

    pub async fn database_count(&self) -> usize {
        self.databases.read().await.len()
    }

    /// Close all facades. Later lookups create fresh ones.
    pub async fn close_all(&self) {
        let databases: Vec<(DatabaseKey, Arc<Database>)> = {
            let mut databases = self.databases.write().await;
            databases.drain().collect()
        };

        for (key, db) in databases {
            info!(database = %key.name, actor = %key.actor, "Closing database");
            db.close().await;
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}
