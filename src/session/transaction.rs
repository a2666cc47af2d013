// src/session/transaction.rs

//! Per-session transaction state and completion callbacks.

use crate::connection::ConnectionEngine;
use crate::core::commands::{Command, TransactionId, TransactionInfo, TransactionType, Xid};
use crate::core::errors::{ClientError, Result, Suppressed};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    LocalActive,
    Committing,
    RollingBack,
    /// An externally managed transaction is in progress.
    InDistributedTransaction,
}

/// Result of asking to defer a session close until the distributed
/// transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseDeferral {
    /// No distributed transaction is active; close now.
    NotDistributed,
    Registered,
    AlreadyPending,
}

/// How an externally managed transaction finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedOutcome {
    Committed,
    RolledBack,
}

/// Callbacks run when the current transaction completes.
///
/// Registrations last for one transaction; the list is emptied on completion.
#[async_trait]
pub trait Synchronization: Send + Sync {
    async fn before_end(&self) -> Result<()> {
        Ok(())
    }

    async fn after_commit(&self) -> Result<()>;

    async fn after_rollback(&self) -> Result<()>;
}

#[derive(Debug)]
struct TxInner {
    state: TransactionState,
    transaction_id: Option<TransactionId>,
}

pub struct TransactionContext {
    connection: Arc<ConnectionEngine>,
    inner: Mutex<TxInner>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    close_sync_registered: AtomicBool,
}

impl TransactionContext {
    pub(crate) fn new(connection: Arc<ConnectionEngine>) -> Self {
        Self {
            connection,
            inner: Mutex::new(TxInner {
                state: TransactionState::None,
                transaction_id: None,
            }),
            synchronizations: Mutex::new(Vec::new()),
            close_sync_registered: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner.lock().transaction_id.clone()
    }

    pub fn is_in_local_transaction(&self) -> bool {
        self.inner
            .lock()
            .transaction_id
            .as_ref()
            .is_some_and(TransactionId::is_local)
    }

    pub fn is_in_distributed_transaction(&self) -> bool {
        self.state() == TransactionState::InDistributedTransaction
    }

    /// Starts a local transaction unless one is already active.
    ///
    /// Inside a distributed transaction this does nothing: that transaction is
    /// owned by an external coordinator and is never begun implicitly.
    pub async fn begin(&self) -> Result<()> {
        let transaction_id = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::None => {}
                TransactionState::InDistributedTransaction | TransactionState::LocalActive => {
                    return Ok(());
                }
                TransactionState::Committing | TransactionState::RollingBack => {
                    return Err(ClientError::IllegalState(
                        "transaction is completing".to_string(),
                    ));
                }
            }
            let id = self.connection.next_local_transaction_id()?;
            inner.state = TransactionState::LocalActive;
            inner.transaction_id = Some(id.clone());
            id
        };

        debug!("Beginning local transaction {}", transaction_id);
        let begin = self.info(transaction_id, TransactionType::Begin);
        if let Err(e) = self.connection.oneway(begin).await {
            self.reset();
            return Err(e);
        }
        Ok(())
    }

    /// Commits the active local transaction. Does nothing when none is active.
    pub async fn commit(&self) -> Result<()> {
        let Some(transaction_id) = self.enter_completion(TransactionState::Committing)? else {
            return Ok(());
        };

        if let Err(e) = self.before_end().await {
            // A synchronization refused to end the transaction; undo it.
            let mut suppressed = Suppressed::new();
            suppressed.absorb(
                "rollback after a refused commit",
                self.finish_rollback(transaction_id).await,
            );
            return Err(e);
        }

        debug!("Committing transaction {}", transaction_id);
        let commit = self.info(transaction_id, TransactionType::CommitOnePhase);
        let result = self.connection.sync_request(commit, Duration::ZERO).await;
        self.reset();
        match result {
            Ok(_) => self.fire(DistributedOutcome::Committed).await,
            Err(e) => {
                let mut suppressed = Suppressed::new();
                suppressed.absorb(
                    "rollback callbacks after a failed commit",
                    self.fire(DistributedOutcome::RolledBack).await,
                );
                Err(e)
            }
        }
    }

    /// Rolls back the active local transaction. Does nothing when none is active.
    pub async fn rollback(&self) -> Result<()> {
        let Some(transaction_id) = self.enter_completion(TransactionState::RollingBack)? else {
            return Ok(());
        };
        let mut suppressed = Suppressed::new();
        suppressed.absorb("ending transaction before rollback", self.before_end().await);
        self.finish_rollback(transaction_id)
            .await
            .and(suppressed.into_result())
    }

    async fn finish_rollback(&self, transaction_id: TransactionId) -> Result<()> {
        debug!("Rolling back transaction {}", transaction_id);
        let rollback = self.info(transaction_id, TransactionType::Rollback);
        let result = self.connection.sync_request(rollback, Duration::ZERO).await;
        self.reset();
        let fired = self.fire(DistributedOutcome::RolledBack).await;
        result.and(fired)
    }

    /// Associates the session with an externally managed transaction branch.
    pub async fn begin_distributed(&self, xid: Xid) -> Result<()> {
        let transaction_id = {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::None {
                return Err(ClientError::IllegalState(
                    "a transaction is already in progress".to_string(),
                ));
            }
            let id = TransactionId::Xa(xid);
            inner.state = TransactionState::InDistributedTransaction;
            inner.transaction_id = Some(id.clone());
            id
        };

        let begin = self.info(transaction_id, TransactionType::Begin);
        if let Err(e) = self.connection.sync_request(begin, Duration::ZERO).await {
            self.reset();
            return Err(e);
        }
        Ok(())
    }

    /// Completes the externally managed transaction and runs the matching callbacks.
    pub async fn end_distributed(&self, outcome: DistributedOutcome) -> Result<()> {
        let transaction_id = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.transaction_id) {
                (TransactionState::InDistributedTransaction, Some(id)) => id.clone(),
                _ => {
                    return Err(ClientError::IllegalState(
                        "not in a distributed transaction".to_string(),
                    ));
                }
            }
        };

        let mut suppressed = Suppressed::new();
        suppressed.absorb("ending distributed transaction", self.before_end().await);
        let kind = match outcome {
            DistributedOutcome::Committed => TransactionType::CommitOnePhase,
            DistributedOutcome::RolledBack => TransactionType::Rollback,
        };
        let result = self
            .connection
            .sync_request(self.info(transaction_id, kind), Duration::ZERO)
            .await;
        self.reset();
        let outcome = if result.is_ok() {
            outcome
        } else {
            DistributedOutcome::RolledBack
        };
        let fired = self.fire(outcome).await;
        result.map(|_| ()).and(fired).and(suppressed.into_result())
    }

    pub fn add_synchronization(&self, sync: Arc<dyn Synchronization>) {
        self.synchronizations.lock().push(sync);
    }

    pub fn remove_synchronization(&self, sync: &Arc<dyn Synchronization>) {
        self.synchronizations
            .lock()
            .retain(|s| !Arc::ptr_eq(s, sync));
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    /// Registers `sync` to run when the distributed transaction ends.
    ///
    /// The state check and the registration happen under the state lock, so
    /// a concurrent [`end_distributed`](Self::end_distributed) either sees the
    /// callback or has already left the distributed state. Only the first
    /// caller registers until [`clear_close_sync`](Self::clear_close_sync).
    pub(crate) fn defer_close(&self, sync: Arc<dyn Synchronization>) -> CloseDeferral {
        let inner = self.inner.lock();
        if inner.state != TransactionState::InDistributedTransaction {
            return CloseDeferral::NotDistributed;
        }
        if self
            .close_sync_registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return CloseDeferral::AlreadyPending;
        }
        self.synchronizations.lock().push(sync);
        CloseDeferral::Registered
    }

    pub(crate) fn clear_close_sync(&self) {
        self.close_sync_registered.store(false, Ordering::Release);
    }

    pub fn is_close_pending(&self) -> bool {
        self.close_sync_registered.load(Ordering::Acquire)
    }

    fn enter_completion(&self, next: TransactionState) -> Result<Option<TransactionId>> {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::InDistributedTransaction => Err(ClientError::IllegalState(
                "cannot complete a distributed transaction locally".to_string(),
            )),
            TransactionState::Committing | TransactionState::RollingBack => Err(
                ClientError::IllegalState("transaction is already completing".to_string()),
            ),
            TransactionState::None => Ok(None),
            TransactionState::LocalActive => {
                inner.state = next;
                Ok(inner.transaction_id.clone())
            }
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = TransactionState::None;
        inner.transaction_id = None;
    }

    fn info(&self, transaction_id: TransactionId, kind: TransactionType) -> Command {
        Command::new(TransactionInfo {
            connection_id: self.connection.id().clone(),
            transaction_id,
            kind,
        })
    }

    async fn before_end(&self) -> Result<()> {
        let syncs = self.synchronizations.lock().clone();
        for sync in syncs {
            sync.before_end().await?;
        }
        Ok(())
    }

    /// Runs and clears every registered synchronization.
    async fn fire(&self, outcome: DistributedOutcome) -> Result<()> {
        let syncs = std::mem::take(&mut *self.synchronizations.lock());
        let mut suppressed = Suppressed::new();
        for sync in syncs {
            let result = match outcome {
                DistributedOutcome::Committed => sync.after_commit().await,
                DistributedOutcome::RolledBack => sync.after_rollback().await,
            };
            suppressed.absorb("transaction synchronization", result);
        }
        suppressed.into_result()
    }
}
