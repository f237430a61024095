//! Transaction contexts.
//!
//! A [`Transaction`] is a [`Connection`] that issued `BEGIN` when it was
//! created and keeps its driver until `commit()` or `rollback()`. It can run
//! any number of statements in between. Dropping an open transaction closes
//! the driver instead of returning it, which makes the server roll back.

use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use std::ops::{Deref, DerefMut};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Transaction {
    id: String,
    conn: Connection,
    open: bool,
}

impl Transaction {
    /// Start a transaction on a freshly borrowed connection.
    pub(crate) async fn begin(mut conn: Connection) -> DbResult<Self> {
        conn.set_in_transaction(true);
        let id = generate_transaction_id();

        let started = match conn.driver("begin") {
            Ok(driver) => driver.instance().begin().await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            conn.mark_exceptional();
            return Err(err);
        }

        info!(
            transaction_id = %id,
            data_source = %conn.label(),
            "Transaction started"
        );
        Ok(Self {
            id,
            conn,
            open: true,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Commit and hand the driver back. A failed commit discards the driver.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.finish(true).await
    }

    /// Roll back and hand the driver back. A failed rollback discards the driver.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.finish(false).await
    }

    async fn finish(&mut self, commit: bool) -> DbResult<()> {
        let action = if commit { "commit" } else { "rollback" };
        if !self.open {
            return Err(DbError::transaction(
                format!("Cannot {} a finished transaction", action),
                self.id.clone(),
            ));
        }
        self.open = false;

        let result = match self.conn.driver(action) {
            Ok(driver) if commit => driver.instance().commit().await,
            Ok(driver) => driver.instance().rollback().await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) if !self.conn.is_exceptional() => {
                self.conn.set_in_transaction(false);
                self.conn.release();
            }
            Ok(()) => self.conn.discard(),
            Err(err) => {
                warn!(
                    transaction_id = %self.id,
                    data_source = %self.conn.label(),
                    error = %err,
                    "Transaction {} failed, discarding driver",
                    action
                );
                self.conn.discard();
            }
        }

        if result.is_ok() {
            info!(
                transaction_id = %self.id,
                data_source = %self.conn.label(),
                "Transaction {}",
                if commit { "committed" } else { "rolled back" }
            );
        }
        result
    }
}

impl Deref for Transaction {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            // The inner connection discards the driver; the server rolls back
            warn!(
                transaction_id = %self.id,
                data_source = %self.conn.label(),
                "Transaction dropped without commit or rollback"
            );
        }
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::db::bind::Bindings;
    use crate::db::pool::{DriverPool, SimplePool};
    use crate::db::scripted::ScriptedConnector;
    use std::sync::Arc;

    async fn begin(connector: &ScriptedConnector) -> (Transaction, Arc<dyn DriverPool>) {
        let pool: Arc<dyn DriverPool> = Arc::new(SimplePool::new(
            "main/master",
            Arc::new(connector.clone()),
            PoolOptions::default(),
        ));
        let driver = pool.borrow().await.unwrap();
        let conn = Connection::new(driver, Arc::clone(&pool), "main/master", "");
        (Transaction::begin(conn).await.unwrap(), pool)
    }

    #[tokio::test]
    async fn test_runs_many_statements_then_commits() {
        let connector = ScriptedConnector::new();
        let (mut tx, pool) = begin(&connector).await;
        assert!(tx.id().starts_with("tx_"));

        tx.exec("UPDATE a SET x = 1", Bindings::none()).await.unwrap();
        tx.exec("UPDATE b SET y = 2", Bindings::none()).await.unwrap();
        assert!(!tx.is_released());
        assert_eq!(pool.stats().returned, 0);

        tx.commit().await.unwrap();
        assert!(tx.is_released());
        assert_eq!(connector.begins(), 1);
        assert_eq!(connector.commits(), 1);
        assert_eq!(pool.stats().returned, 1);
    }

    #[tokio::test]
    async fn test_no_reconnect_inside_transaction() {
        let connector = ScriptedConnector::new();
        let (mut tx, _pool) = begin(&connector).await;
        connector.fail_disconnects(1);

        let err = tx.exec("SELECT 1", Bindings::none()).await.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_rollback_after_error_discards() {
        let connector = ScriptedConnector::new();
        let (mut tx, pool) = begin(&connector).await;
        connector.fail_next("Duplicate entry '1' for key 'PRIMARY'");

        assert!(tx.exec("INSERT INTO a VALUES (1)", Bindings::none()).await.is_err());
        tx.rollback().await.unwrap();
        assert_eq!(connector.rollbacks(), 1);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_finish_twice_is_error() {
        let connector = ScriptedConnector::new();
        let (mut tx, _pool) = begin(&connector).await;
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.rollback().await,
            Err(DbError::Transaction { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_discards() {
        let connector = ScriptedConnector::new();
        let (mut tx, pool) = begin(&connector).await;
        connector.fail_commits(true);
        assert!(tx.commit().await.is_err());
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_drop_open_transaction_discards() {
        let connector = ScriptedConnector::new();
        let (tx, pool) = begin(&connector).await;
        drop(tx);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().returned, 0);
    }
}
