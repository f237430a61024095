//! Nested transaction coordination.
//!
//! A [`Coordinator`] lives in a tokio task-local for the duration of a
//! [`scope`]. Once `begin()` is called, every MASTER borrow made by that task
//! joins one [`Transaction`] per distinct data source, and `finish()`
//! commits all of them, or rolls all of them back if any statement failed.
//!
//! ```text
//! INACTIVE --begin()--> ACTIVE --finish()/cancel()--> FINISHED
//!                          ^                              |
//!                          +---------- begin() -----------+   (not after cancel)
//! ```
//!
//! Tasks spawned from inside a scope do not inherit its coordinator.

use crate::db::bind::Prepared;
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{NestedState, Value};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

tokio::task_local! {
    static COORDINATOR: Coordinator;
}

/// A transaction shared by every borrow of one data source inside a scope.
pub type SharedTransaction = Arc<TokioMutex<Transaction>>;

/// One statement executed while the coordinator was active.
///
/// Logical only; no SQL `SAVEPOINT` is issued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub id: String,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointError {
    /// Point id, or the data source key when joining, committing or rolling
    /// back that source failed.
    pub point: String,
    pub message: String,
}

/// Outcome of [`Coordinator::finish`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinishReport {
    pub commit: usize,
    pub rollback: usize,
    pub points: Vec<Point>,
    pub errors: Vec<PointError>,
}

impl FinishReport {
    pub fn is_committed(&self) -> bool {
        self.rollback == 0 && self.errors.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    state: NestedState,
    cancelled: bool,
    points: Vec<Point>,
    connections: Vec<(String, SharedTransaction)>,
    errors: Vec<PointError>,
}

/// Handle to the task's coordinator; clones share state.
#[derive(Clone, Default)]
pub struct Coordinator {
    inner: Arc<Mutex<Inner>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The coordinator of the current [`scope`], if any.
    pub fn current() -> Option<Coordinator> {
        COORDINATOR.try_with(Coordinator::clone).ok()
    }

    /// Activate coordination. Fails after `cancel()`.
    ///
    /// Calling `begin()` while already active keeps the running cycle.
    pub fn begin(&self) -> DbResult<()> {
        let mut inner = self.lock();
        if inner.cancelled {
            return Err(DbError::transaction(
                "Nested transaction was cancelled and cannot begin again",
                "nested",
            ));
        }
        if inner.state.is_active() {
            debug!("Nested transaction already active");
            return Ok(());
        }
        inner.state = NestedState::Active;
        inner.points.clear();
        inner.connections.clear();
        inner.errors.clear();
        info!("Nested transaction started");
        Ok(())
    }

    pub fn is_begin(&self) -> bool {
        self.lock().state.is_active()
    }

    pub fn is_end(&self) -> bool {
        self.lock().state.is_finished()
    }

    pub fn state(&self) -> NestedState {
        self.lock().state
    }

    /// Record an executed statement; returns the point id.
    pub fn add_point(&self, statement: &Prepared) -> String {
        let id = format!("sp_{}", uuid::Uuid::new_v4().simple());
        self.lock().points.push(Point {
            id: id.clone(),
            sql: statement.sql.clone(),
            params: statement.params.clone(),
        });
        id
    }

    /// Record a failed statement. Other data sources are not touched until finish.
    pub fn add_error(&self, point: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(point = %point, error = %message, "Statement failed inside nested transaction");
        self.lock().errors.push(PointError {
            point: point.to_string(),
            message,
        });
    }

    pub fn points(&self) -> Vec<Point> {
        self.lock().points.clone()
    }

    pub fn errors(&self) -> Vec<PointError> {
        self.lock().errors.clone()
    }

    /// Number of data sources joined so far.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// The transaction already joined for a data source key.
    pub fn connection(&self, key: &str) -> Option<SharedTransaction> {
        self.lock()
            .connections
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, tx)| Arc::clone(tx))
    }

    /// Join a transaction under `key`. If one was registered first, that one
    /// is kept and `transaction` is dropped (its driver is discarded).
    pub fn register(&self, key: &str, transaction: Transaction) -> SharedTransaction {
        let mut inner = self.lock();
        if let Some((_, existing)) = inner.connections.iter().find(|(k, _)| k == key) {
            return Arc::clone(existing);
        }
        let shared = Arc::new(TokioMutex::new(transaction));
        inner.connections.push((key.to_string(), Arc::clone(&shared)));
        debug!(data_source = %key, "Joined nested transaction");
        shared
    }

    /// Commit every joined transaction, or roll back all of them if any
    /// statement failed. Every connection is attempted; failures are logged
    /// and reported, never thrown.
    pub async fn finish(&self) -> FinishReport {
        let (connections, points, errors) = {
            let mut inner = self.lock();
            if !inner.state.is_active() {
                return FinishReport::default();
            }
            inner.state = NestedState::Finished;
            (
                std::mem::take(&mut inner.connections),
                std::mem::take(&mut inner.points),
                inner.errors.clone(),
            )
        };

        let rollback_all = !errors.is_empty();
        let mut report = FinishReport {
            points,
            errors,
            ..Default::default()
        };

        for (key, shared) in connections {
            let mut tx = shared.lock().await;
            let result = if rollback_all {
                tx.rollback().await
            } else {
                tx.commit().await
            };
            match result {
                Ok(()) if rollback_all => report.rollback += 1,
                Ok(()) => report.commit += 1,
                Err(err) => {
                    error!(
                        data_source = %key,
                        error = %err,
                        rollback = rollback_all,
                        "Nested transaction flush failed"
                    );
                    report.errors.push(PointError {
                        point: key,
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            commit = report.commit,
            rollback = report.rollback,
            points = report.points.len(),
            errors = report.errors.len(),
            "Nested transaction finished"
        );
        report
    }

    /// Roll back everything now and refuse any later `begin()`.
    pub async fn cancel(&self) -> FinishReport {
        let (connections, points, errors) = {
            let mut inner = self.lock();
            inner.cancelled = true;
            let was_active = inner.state.is_active();
            inner.state = NestedState::Finished;
            if !was_active {
                return FinishReport::default();
            }
            (
                std::mem::take(&mut inner.connections),
                std::mem::take(&mut inner.points),
                inner.errors.clone(),
            )
        };

        let mut report = FinishReport {
            points,
            errors,
            ..Default::default()
        };
        for (key, shared) in connections {
            match shared.lock().await.rollback().await {
                Ok(()) => report.rollback += 1,
                Err(err) => {
                    error!(data_source = %key, error = %err, "Nested transaction rollback failed");
                    report.errors.push(PointError {
                        point: key,
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(rollback = report.rollback, "Nested transaction cancelled");
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Coordinator")
            .field("state", &inner.state)
            .field("cancelled", &inner.cancelled)
            .field("points", &inner.points.len())
            .field("connections", &inner.connections.len())
            .field("errors", &inner.errors.len())
            .finish()
    }
}

/// Run `future` with its own coordinator.
///
/// A coordinator still active when the future completes is finished
/// (committed, or rolled back if errors were recorded). If the future is
/// dropped before completing, the finish runs on a spawned task.
pub async fn scope<F: Future>(future: F) -> F::Output {
    let coordinator = Coordinator::new();
    let mut guard = FinishGuard {
        coordinator: coordinator.clone(),
        armed: true,
    };

    let output = COORDINATOR.scope(coordinator.clone(), future).await;
    guard.armed = false;

    if coordinator.is_begin() {
        warn!("Nested transaction still active at scope exit, finishing");
        coordinator.finish().await;
    }
    output
}

/// Forces the finish when a scope's future is dropped early.
///
/// The finish is spawned on the current runtime; if the runtime is shutting
/// down it may never run, and the joined drivers are closed with their
/// transactions instead.
struct FinishGuard {
    coordinator: Coordinator,
    armed: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.armed || !self.coordinator.is_begin() {
            return;
        }

        let coordinator = self.coordinator.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let report = coordinator.finish().await;
                    warn!(
                        commit = report.commit,
                        rollback = report.rollback,
                        "Nested transaction finished via Drop - the scope was abandoned"
                    );
                });
            }
            Err(_) => {
                warn!("No runtime to finish abandoned nested transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(sql: &str) -> Prepared {
        Prepared {
            sql: sql.to_string(),
            params: vec![Value::Int(1)],
        }
    }

    #[tokio::test]
    async fn test_current_only_inside_scope() {
        assert!(Coordinator::current().is_none());
        let seen = scope(async { Coordinator::current().is_some() }).await;
        assert!(seen);
    }

    #[tokio::test]
    async fn test_state_machine() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.state(), NestedState::Inactive);

        coordinator.begin().unwrap();
        assert!(coordinator.is_begin());
        coordinator.add_point(&statement("UPDATE a SET x = ?"));
        assert_eq!(coordinator.points().len(), 1);

        let report = coordinator.finish().await;
        assert!(coordinator.is_end());
        assert_eq!(report.points.len(), 1);
        assert!(report.is_committed());

        // A finished coordinator can start a new cycle
        coordinator.begin().unwrap();
        assert!(coordinator.points().is_empty());
    }

    #[tokio::test]
    async fn test_begin_after_cancel_fails() {
        let coordinator = Coordinator::new();
        coordinator.begin().unwrap();
        coordinator.cancel().await;
        assert!(coordinator.is_end());
        assert!(matches!(
            coordinator.begin(),
            Err(DbError::Transaction { .. })
        ));
    }

    #[tokio::test]
    async fn test_errors_reported_on_finish() {
        let coordinator = Coordinator::new();
        coordinator.begin().unwrap();
        let point = coordinator.add_point(&statement("INSERT INTO a VALUES (?)"));
        coordinator.add_error(&point, "Duplicate entry");

        let report = coordinator.finish().await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].point, point);
        assert!(!report.is_committed());
    }

    #[tokio::test]
    async fn test_finish_when_inactive_is_empty() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.finish().await, FinishReport::default());
        assert!(!coordinator.is_end());
    }

    #[tokio::test]
    async fn test_scope_finishes_forgotten_coordinator() {
        let handle = scope(async {
            let coordinator = Coordinator::current().unwrap();
            coordinator.begin().unwrap();
            coordinator
        })
        .await;
        assert!(handle.is_end());
    }
}
