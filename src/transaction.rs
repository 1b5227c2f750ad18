//! Admission of transactions against one connection.
//!
//! Most controllers can only work on a fixed number of requests at a time,
//! often just one. A [`TransactionManager`] is created with that budget and
//! runs submitted work in strict submission order as slots free up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::errors::{Error, Result};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Admission state of a [`Transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Started, not yet admitted
    Queued,
    /// Admitted, occupying one slot of the budget
    Running,
    /// Ended by its owner
    Ended,
    /// Ended with a failure, or never admitted because of one
    Failed(Error),
}

impl TransactionState {
    fn is_completed(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }
}

struct QueuedWork {
    id: u64,
    work: Work,
    state: Arc<watch::Sender<TransactionState>>,
}

struct Inner {
    budget: usize,
    running: usize,
    worklog: VecDeque<QueuedWork>,
    shutdown: bool,
    next_id: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    // running + queued, observed by `close_graceful`
    load: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_load(&self, inner: &Inner) {
        self.load.send_replace(inner.running + inner.worklog.len());
    }

    /// Free one slot and admit as much queued work as the budget allows.
    fn release_slot(&self, mut inner: MutexGuard<'_, Inner>) {
        inner.running = inner.running.saturating_sub(1);
        let mut admitted = Vec::new();
        while inner.running < inner.budget {
            let Some(next) = inner.worklog.pop_front() else {
                break;
            };
            inner.running += 1;
            next.state.send_replace(TransactionState::Running);
            trace!(id = next.id, "Admitted queued transaction");
            admitted.push(next.work);
        }
        self.publish_load(&inner);
        drop(inner);

        for work in admitted {
            work();
        }
    }
}

/// Bounds the number of concurrently running transactions of one connection.
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("TransactionManager")
            .field("budget", &inner.budget)
            .field("running", &inner.running)
            .field("queued", &inner.worklog.len())
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}

impl fmt::Display for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        write!(
            f,
            "running {}/{}, queued {}",
            inner.running,
            inner.budget,
            inner.worklog.len()
        )
    }
}

impl TransactionManager {
    /// Create a manager admitting at most `budget` transactions at once.
    /// # Errors
    ///
    /// Will return `Error::InvalidConfig` if `budget` is zero.
    pub fn new(budget: usize) -> Result<Self> {
        if budget == 0 {
            return Err(Error::InvalidConfig(
                "the concurrency budget must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    budget,
                    running: 0,
                    worklog: VecDeque::new(),
                    shutdown: false,
                    next_id: 0,
                }),
                load: watch::Sender::new(0),
            }),
        })
    }

    /// Start a new transaction in the queued state.
    ///
    /// Never blocks. After [`close`](Self::close) the transaction is returned
    /// already failed with `Error::AdmissionClosed`.
    pub fn start_transaction(&self) -> Transaction {
        let mut inner = self.shared.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let state = if inner.shutdown {
            TransactionState::Failed(Error::AdmissionClosed)
        } else {
            TransactionState::Queued
        };
        drop(inner);

        trace!(id, "Started transaction");
        Transaction {
            id,
            submitted: false,
            manager: self.clone(),
            state: Arc::new(watch::Sender::new(state)),
        }
    }

    /// Size of the concurrency budget
    pub fn budget(&self) -> usize {
        self.shared.lock().budget
    }

    /// Number of transactions currently running
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Number of submitted transactions waiting for a slot
    pub fn queued(&self) -> usize {
        self.shared.lock().worklog.len()
    }

    /// `true` once [`close`](Self::close) or [`close_graceful`](Self::close_graceful) was called
    pub fn is_closed(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Shut down: queued work is dropped and its transactions fail with
    /// `Error::AdmissionClosed`. Running transactions are left to end on their own.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        inner.shutdown = true;
        let dropped: Vec<QueuedWork> = inner.worklog.drain(..).collect();
        self.shared.publish_load(&inner);
        drop(inner);

        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping queued transactions on shutdown");
        }
        for queued in dropped {
            queued
                .state
                .send_replace(TransactionState::Failed(Error::AdmissionClosed));
        }
    }

    /// Stop accepting transactions and wait up to `max_wait` for running and
    /// queued ones to finish.
    ///
    /// Returns `false` if work was still outstanding when `max_wait` elapsed;
    /// whatever is still queued at that point is dropped as by [`close`](Self::close).
    pub async fn close_graceful(&self, max_wait: Duration) -> bool {
        self.shared.lock().shutdown = true;

        let mut load = self.shared.load.subscribe();
        let drained = timeout(max_wait, load.wait_for(|outstanding| *outstanding == 0))
            .await
            .is_ok();
        if !drained {
            warn!(manager = %self, "Transactions still outstanding after graceful shutdown timeout");
        }
        self.close();
        drained
    }
}

/// One unit of work admitted under a [`TransactionManager`]'s budget.
///
/// Dropping a running transaction ends it (and logs a warning), so a
/// forgotten `end_request` cannot starve the queue. Dropping a queued one
/// withdraws its work.
pub struct Transaction {
    id: u64,
    submitted: bool,
    manager: TransactionManager,
    state: Arc<watch::Sender<TransactionState>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Transaction {
    /// Id of the transaction, unique per manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current admission state
    pub fn state(&self) -> TransactionState {
        self.state.borrow().clone()
    }

    /// `true` once the transaction ended or failed
    pub fn is_completed(&self) -> bool {
        self.state.borrow().is_completed()
    }

    /// Register `work` to be invoked once the transaction is admitted.
    ///
    /// With a free slot `work` runs right away on the calling task; otherwise
    /// it runs on whichever task ends the transaction that frees the slot.
    /// # Errors
    ///
    /// Will return `Error::AlreadySubmitted` on a second submit, the failure of
    /// a failed transaction, or `Error::TransactionEnded` for an ended one.
    pub fn submit<W>(&mut self, work: W) -> Result<()>
    where
        W: FnOnce() + Send + 'static,
    {
        if self.submitted {
            return Err(Error::AlreadySubmitted(self.id));
        }
        let mut inner = self.manager.shared.lock();
        match self.state() {
            TransactionState::Queued => {}
            TransactionState::Failed(err) => return Err(err),
            _ => return Err(Error::TransactionEnded(self.id)),
        }
        if inner.shutdown {
            drop(inner);
            self.state
                .send_replace(TransactionState::Failed(Error::AdmissionClosed));
            return Err(Error::AdmissionClosed);
        }
        self.submitted = true;

        if inner.running < inner.budget {
            inner.running += 1;
            self.state.send_replace(TransactionState::Running);
            self.manager.shared.publish_load(&inner);
            drop(inner);
            trace!(id = self.id, "Running transaction");
            work();
        } else {
            inner.worklog.push_back(QueuedWork {
                id: self.id,
                work: Box::new(work),
                state: Arc::clone(&self.state),
            });
            self.manager.shared.publish_load(&inner);
            trace!(id = self.id, queued = inner.worklog.len(), "Queued transaction");
        }
        Ok(())
    }

    /// Wait until the transaction has been admitted.
    ///
    /// If `max_wait` elapses first the transaction is withdrawn from the queue
    /// and fails with `Error::AdmissionTimeout`.
    /// # Errors
    ///
    /// Will return the failure of the transaction if it failed before admission.
    pub async fn wait_admitted(&self, max_wait: Duration) -> Result<()> {
        let mut watcher = self.state.subscribe();
        let admitted = timeout(
            max_wait,
            watcher.wait_for(|state| *state != TransactionState::Queued),
        )
        .await
        .is_ok();

        if !admitted {
            let inner = self.manager.shared.lock();
            // admission may have raced the timer
            if self.state() == TransactionState::Queued {
                self.withdraw(inner);
                let err = Error::AdmissionTimeout {
                    id: self.id,
                    waited: max_wait,
                };
                warn!(id = self.id, ?max_wait, "Transaction was not admitted in time");
                self.state.send_replace(TransactionState::Failed(err.clone()));
                return Err(err);
            }
        }

        match self.state() {
            TransactionState::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Submit an empty unit of work and wait for its admission.
    ///
    /// For async callers that hold the slot by holding the transaction.
    /// # Errors
    ///
    /// See [`submit`](Self::submit) and [`wait_admitted`](Self::wait_admitted).
    pub async fn admit(&mut self, max_wait: Duration) -> Result<()> {
        self.submit(|| {})?;
        self.wait_admitted(max_wait).await
    }

    /// Wait until the transaction has ended.
    /// # Errors
    ///
    /// Will return the failure the transaction ended with, or
    /// `Error::AdmissionTimeout` if it did not end within `max_wait`.
    pub async fn await_completion(&self, max_wait: Duration) -> Result<()> {
        let mut watcher = self.state.subscribe();
        if timeout(max_wait, watcher.wait_for(TransactionState::is_completed))
            .await
            .is_err()
        {
            return Err(Error::AdmissionTimeout {
                id: self.id,
                waited: max_wait,
            });
        }
        match self.state() {
            TransactionState::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Mark the transaction as ended, freeing its slot for the next queued one.
    /// # Errors
    ///
    /// Will return `Error::TransactionEnded` if the transaction already ended.
    pub fn end_request(&self) -> Result<()> {
        self.finish(TransactionState::Ended)
    }

    /// Like [`end_request`](Self::end_request), recording `reason` as the outcome.
    /// # Errors
    ///
    /// Will return `Error::TransactionEnded` if the transaction already ended.
    pub fn fail_request(&self, reason: Error) -> Result<()> {
        debug!(id = self.id, %reason, "Failing transaction");
        self.finish(TransactionState::Failed(reason))
    }

    fn finish(&self, outcome: TransactionState) -> Result<()> {
        let inner = self.manager.shared.lock();
        match self.state() {
            TransactionState::Running => {
                self.state.send_replace(outcome);
                trace!(id = self.id, "Ended transaction");
                self.manager.shared.release_slot(inner);
                Ok(())
            }
            TransactionState::Queued => {
                // never admitted, nothing to release
                self.withdraw(inner);
                self.state.send_replace(outcome);
                Ok(())
            }
            TransactionState::Ended | TransactionState::Failed(_) => {
                warn!(id = self.id, "end_request called on a completed transaction");
                Err(Error::TransactionEnded(self.id))
            }
        }
    }

    fn withdraw(&self, mut inner: MutexGuard<'_, Inner>) {
        let before = inner.worklog.len();
        inner.worklog.retain(|queued| queued.id != self.id);
        if inner.worklog.len() != before {
            trace!(id = self.id, "Withdrew queued transaction");
            self.manager.shared.publish_load(&inner);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.state() {
            TransactionState::Running => {
                warn!(
                    id = self.id,
                    "Transaction dropped without end_request, releasing its slot"
                );
                let _ = self.end_request();
            }
            TransactionState::Queued if self.submitted => {
                let inner = self.manager.shared.lock();
                self.withdraw(inner);
            }
            _ => {}
        }
    }
}
