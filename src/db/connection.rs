//! Execution contexts.
//!
//! A [`Connection`] binds one borrowed [`PhysicalDriver`] to one unit of
//! work. Outside a transaction it is single-use: the first `execute()`
//! caches the result metadata and hands the driver straight back to the
//! pool, and a second `execute()` is a [`DbError::Reuse`].
//!
//! Lost connections are retried once (reconnect, then run again) unless the
//! context is inside a transaction, where a reconnect would silently drop
//! the server-side transaction.

use crate::db::bind::{prepare, Bindings, Prepared};
use crate::db::database::TableQuery;
use crate::db::driver::PhysicalDriver;
use crate::db::nested::Coordinator;
use crate::db::pool::DriverPool;
use crate::db::query::Statement;
use crate::error::{DbError, DbResult};
use crate::models::{Outcome, Row};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Who holds the physical driver right now.
#[derive(Debug)]
enum DriverSlot {
    Owned(PhysicalDriver),
    /// Returned to (or discarded by) the pool; any further use is an error.
    Released,
}

pub struct Connection {
    slot: DriverSlot,
    pool: Arc<dyn DriverPool>,
    /// `name/actor`, for logs.
    label: String,
    prefix: String,
    statement: Option<(String, Bindings)>,
    executed: bool,
    exceptional: bool,
    in_transaction: bool,
    last_insert_id: String,
    row_count: u64,
    rows: Vec<Row>,
}

impl Connection {
    pub(crate) fn new(
        driver: PhysicalDriver,
        pool: Arc<dyn DriverPool>,
        label: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            slot: DriverSlot::Owned(driver),
            pool,
            label: label.into(),
            prefix: prefix.into(),
            statement: None,
            executed: false,
            exceptional: false,
            in_transaction: false,
            last_insert_id: String::new(),
            row_count: 0,
            rows: Vec::new(),
        }
    }

    /// Set the statement to run. Inside a transaction this re-arms the context.
    pub fn raw(&mut self, sql: impl Into<String>, bindings: impl Into<Bindings>) -> &mut Self {
        self.statement = Some((sql.into(), bindings.into()));
        if self.in_transaction {
            self.executed = false;
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
        let (sql, bindings) = self
            .statement
            .clone()
            .ok_or_else(|| DbError::invalid_input("No statement to execute"))?;

        if self.executed {
            return Err(DbError::reuse(sql));
        }
        if matches!(self.slot, DriverSlot::Released) {
            return Err(DbError::released("execute"));
        }

        let prepared = prepare(&sql, &bindings)?;
        self.executed = true;

        let coordinator = Coordinator::current().filter(Coordinator::is_begin);
        let point = coordinator.as_ref().map(|c| c.add_point(&prepared));

        let started = Instant::now();
        let result = self.run_with_reconnect(&prepared).await;

        // Runs on every outcome, failures included
        debug!(
            data_source = %self.label,
            sql = %prepared.sql,
            params = prepared.params.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            in_transaction = self.in_transaction,
            ok = result.is_ok(),
            "Executed statement"
        );

        match result {
            Ok(outcome) => {
                self.last_insert_id = outcome
                    .last_insert_id
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                self.row_count = outcome.rows_affected;
                self.rows = outcome.rows;
                if !self.in_transaction {
                    self.release();
                }
                Ok(self)
            }
            Err(err) => {
                self.last_insert_id = String::new();
                self.row_count = 0;
                self.rows = Vec::new();
                self.exceptional = true;
                if let (Some(coordinator), Some(point)) = (coordinator, point) {
                    coordinator.add_error(&point, err.to_string());
                }
                if !self.in_transaction {
                    self.discard();
                }
                Err(err.with_sql(&prepared.sql))
            }
        }
    }

    async fn run_with_reconnect(&mut self, prepared: &Prepared) -> DbResult<Outcome> {
        let in_transaction = self.in_transaction;
        let label = self.label.clone();
        let driver = self.driver("execute")?;

        match driver.instance().run(prepared).await {
            Err(err) if err.is_disconnect() && !in_transaction => {
                warn!(
                    data_source = %label,
                    driver_id = driver.id(),
                    error = %err,
                    "Lost connection, reconnecting once"
                );
                driver.reconnect().await?;
                driver.instance().run(prepared).await
            }
            other => other,
        }
    }

    /// Check the driver is alive, reconnecting once outside a transaction.
    pub async fn ping(&mut self) -> DbResult<()> {
        let in_transaction = self.in_transaction;
        let label = self.label.clone();
        let driver = self.driver("ping")?;
        match driver.ping().await {
            Err(err) if err.is_disconnect() && !in_transaction => {
                warn!(data_source = %label, error = %err, "Ping lost connection, reconnecting once");
                driver.reconnect().await?;
                driver.ping().await
            }
            other => other,
        }
    }

    /// Start a builder chain on a table, run through this context.
    pub fn table(&mut self, name: &str) -> TableQuery<'_> {
        let prefix = self.prefix.clone();
        TableQuery::on_connection(self, name, &prefix)
    }

    /// The borrowed driver, or a [`DbError::Released`] naming the attempted operation.
    pub fn driver(&mut self, operation: &str) -> DbResult<&mut PhysicalDriver> {
        match &mut self.slot {
            DriverSlot::Owned(driver) => Ok(driver),
            DriverSlot::Released => Err(DbError::released(operation)),
        }
    }

    /// Return the driver to the pool now.
    pub fn release(&mut self) {
        if let Some(driver) = self.take_driver() {
            self.pool.give_back(driver);
        }
    }

    /// Close the driver instead of returning it.
    pub fn discard(&mut self) {
        if let Some(driver) = self.take_driver() {
            self.pool.discard(driver);
        }
    }

    pub(crate) fn take_driver(&mut self) -> Option<PhysicalDriver> {
        match std::mem::replace(&mut self.slot, DriverSlot::Released) {
            DriverSlot::Owned(driver) => Some(driver),
            DriverSlot::Released => None,
        }
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
        self.executed = false;
    }

    pub(crate) fn mark_exceptional(&mut self) {
        self.exceptional = true;
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: &str) {
        if self.prefix != prefix {
            self.prefix = prefix.to_string();
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Generated id of the last insert; empty when none or when the statement failed.
    pub fn last_insert_id(&self) -> &str {
        &self.last_insert_id
    }

    /// Affected rows for writes, fetched rows for queries; 0 after a failure.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn is_exceptional(&self) -> bool {
        self.exceptional
    }

    pub fn is_released(&self) -> bool {
        matches!(self.slot, DriverSlot::Released)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(driver) = self.take_driver() else {
            return;
        };
        if self.exceptional || self.in_transaction {
            self.pool.discard(driver);
        } else {
            self.pool.give_back(driver);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("slot", &self.slot)
            .field("prefix", &self.prefix)
            .field("executed", &self.executed)
            .field("exceptional", &self.exceptional)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}
