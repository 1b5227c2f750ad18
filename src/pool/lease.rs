use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::MutexGuard;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::{PoolInner, PooledConnection, Release, Session};
use crate::connection::{ConnectionFactory, Transport};
use crate::errors::{Error, Result};
use crate::exchange::{CompletionHandle, ExchangeRegistry};
use crate::transaction::TransactionManager;

/// Shared between a lease and its expiry timer
#[derive(Debug)]
pub(super) struct LeaseState {
    pub(super) id: u64,
    pub(super) closed: AtomicBool,
    pub(super) invalid: AtomicBool,
}

/// Exclusive, time-bounded right to use a pooled connection.
///
/// Dropping the lease returns the connection to the pool. If the lease was
/// [invalidated](Self::invalidate), or any operation through it failed, the
/// connection is torn down instead and the next caller gets a fresh one.
/// A lease held longer than the pool's `max_lease_duration` is force-closed;
/// using it afterwards fails with `Error::LeaseClosed`.
pub struct Lease<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    connection: Arc<PooledConnection<F>>,
    session: Arc<Session<F>>,
    state: Arc<LeaseState>,
    created_at: Instant,
    max_duration: Duration,
    expiry: Option<AbortHandle>,
}

impl<F: ConnectionFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.state.id)
            .field("endpoint", &self.connection.endpoint)
            .field("closed", &self.is_closed())
            .field("invalid", &self.is_invalid())
            .field("max_duration", &self.max_duration)
            .finish()
    }
}

impl<F: ConnectionFactory> Lease<F> {
    pub(super) fn new(
        pool: Arc<PoolInner<F>>,
        connection: Arc<PooledConnection<F>>,
        session: Arc<Session<F>>,
        id: u64,
    ) -> Self {
        let state = Arc::new(LeaseState {
            id,
            closed: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
        });
        let max_duration = pool.config.max_lease_duration;
        let expiry = Handle::try_current().ok().map(|runtime| {
            let pool = Arc::clone(&pool);
            let connection = Arc::clone(&connection);
            let state = Arc::clone(&state);
            runtime
                .spawn(async move {
                    sleep(max_duration).await;
                    pool.release(&connection, &state, Release::Expired);
                })
                .abort_handle()
        });

        Self {
            pool,
            connection,
            session,
            state,
            created_at: Instant::now(),
            max_duration,
            expiry,
        }
    }

    /// Retract a lease nobody received, without returning it to the pool
    pub(super) fn disarm(mut self) {
        self.state.closed.store(true, Ordering::Release);
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }

    /// Pool-wide unique id of this lease
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Endpoint the leased connection belongs to
    pub fn endpoint(&self) -> &str {
        &self.connection.endpoint
    }

    /// When the lease was granted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long the lease may be held
    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Time left before the lease is force-closed
    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.created_at.elapsed())
    }

    /// `true` once the lease was closed or force-closed
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Mark the connection as suspect; it is torn down when the lease ends.
    ///
    /// On a lease that was already force-closed the connection is torn down
    /// right away, even if it has been handed to the next caller meanwhile.
    pub fn invalidate(&self) {
        // SeqCst pairs with `release`: one of the two sides sees the other's flag
        if self.state.invalid.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(endpoint = %self.connection.endpoint, lease = self.state.id, "Lease invalidated");
        if self.state.closed.load(Ordering::SeqCst) {
            self.pool.poison_session(&self.connection, &self.session);
        }
    }

    /// `true` if the connection will be torn down when the lease ends
    pub fn is_invalid(&self) -> bool {
        self.state.invalid.load(Ordering::Acquire)
    }

    /// Return the connection to the pool
    pub fn close(self) {
        drop(self);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            warn!(
                endpoint = %self.connection.endpoint,
                lease = self.state.id,
                "Lease used after it was closed"
            );
            return Err(Error::LeaseClosed(self.connection.endpoint.clone()));
        }
        Ok(())
    }

    fn poison<T>(&self, outcome: Result<T>) -> Result<T> {
        if let Err(err) = &outcome {
            if matches!(err, Error::LeaseClosed(_)) {
                return outcome;
            }
            debug!(endpoint = %self.connection.endpoint, %err, "Operation failed, invalidating lease");
            self.invalidate();
        }
        outcome
    }

    /// Admission control of the leased connection
    /// # Errors
    ///
    /// Will return `Error::LeaseClosed` if the lease has ended.
    pub fn transactions(&self) -> Result<&TransactionManager> {
        self.ensure_open()?;
        Ok(&self.session.transactions)
    }

    /// Pending exchanges of the leased connection.
    ///
    /// Clone the registry to feed responses from a reader task.
    /// # Errors
    ///
    /// Will return `Error::LeaseClosed` if the lease has ended.
    pub fn exchanges(&self) -> Result<&ExchangeRegistry> {
        self.ensure_open()?;
        Ok(&self.session.exchanges)
    }

    /// Direct access to the driver's transport
    /// # Errors
    ///
    /// Will return `Error::LeaseClosed` if the lease has ended.
    pub async fn transport(&self) -> Result<MutexGuard<'_, F::Transport>> {
        self.ensure_open()?;
        Ok(self.session.transport.lock().await)
    }

    /// Ask the driver whether the transport is still usable
    /// # Errors
    ///
    /// Will return `Error::LeaseClosed` if the lease has ended.
    pub async fn is_connected(&self) -> Result<bool> {
        let transport = self.transport().await?;
        Ok(self.pool.factory.is_connected(&transport))
    }

    /// Send a frame that expects no response
    /// # Errors
    ///
    /// Will return `Error` if the lease has ended or the transport failed.
    /// Any failure invalidates the lease.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let outcome = async {
            self.ensure_open()?;
            self.session.transport.lock().await.send(frame).await
        }
        .await;
        self.poison(outcome)
    }

    /// Run one request/response round trip under a fresh correlation key.
    ///
    /// `encode` receives the key and returns the frame to send. The call first
    /// waits for a transaction slot, then for the matching response, never
    /// longer than the lease's remaining time. The response wait is further
    /// capped by the pool's `exchange_timeout`.
    ///```rust,no_run
    /// # tokio_test::block_on(async {
    /// use bytes::Bytes;
    /// use plccore::{connection::tcp::TcpConnectionFactory, LeasePool};
    ///
    /// let pool = LeasePool::new(TcpConnectionFactory::new().with_default_port(102))?;
    /// let lease = pool.acquire("192.168.10.72", None).await?;
    /// let response = lease
    ///     .request(|key| Bytes::from((key as u16).to_be_bytes().to_vec()))
    ///     .await?;
    /// # Ok::<(), plccore::errors::Error>(())
    /// # });
    /// ```
    /// # Errors
    ///
    /// Will return `Error` if the lease ended, no slot or key was free in time,
    /// sending failed or the response did not arrive. Any failure invalidates
    /// the lease.
    pub async fn request<E>(&self, encode: E) -> Result<Bytes>
    where
        E: FnOnce(u64) -> Bytes,
    {
        self.round_trip(
            |exchanges, timeout| exchanges.register_next(timeout),
            encode,
        )
        .await
    }

    /// Send an already-encoded frame and wait for its response.
    ///
    /// The correlation key is read from the frame by the driver.
    /// # Errors
    ///
    /// Same as [`request`](Self::request), plus `Error::MissingCorrelationKey`
    /// or `Error::DuplicateKey` if the frame's key is unusable.
    pub async fn exchange(&self, frame: Bytes) -> Result<Bytes> {
        let Some(key) = self.pool.factory.correlation_key(&frame) else {
            return self.poison(Err(Error::MissingCorrelationKey));
        };
        self.round_trip(
            move |exchanges, timeout| exchanges.register(key, timeout),
            move |_| frame,
        )
        .await
    }

    /// Route an inbound frame to the exchange waiting for it.
    ///
    /// Returns `false` if nobody waits for the frame's key.
    /// # Errors
    ///
    /// Will return `Error::LeaseClosed` if the lease has ended, or
    /// `Error::MissingCorrelationKey` for a frame without key, which also
    /// invalidates the lease.
    pub fn dispatch(&self, frame: Bytes) -> Result<bool> {
        self.ensure_open()?;
        let Some(key) = self.pool.factory.correlation_key(&frame) else {
            return self.poison(Err(Error::MissingCorrelationKey));
        };
        Ok(self.session.exchanges.resolve(&key, frame))
    }

    async fn round_trip<R, E>(&self, register: R, encode: E) -> Result<Bytes>
    where
        R: FnOnce(&ExchangeRegistry, Duration) -> Result<CompletionHandle>,
        E: FnOnce(u64) -> Bytes,
    {
        let outcome = async {
            self.ensure_open()?;
            let mut transaction = self.session.transactions.start_transaction();
            transaction.admit(self.remaining()).await?;

            // the response must arrive while the lease is still ours
            let deadline = self.pool.config.exchange_timeout.min(self.remaining());
            let outcome = async {
                let handle = register(&self.session.exchanges, deadline)?;
                let key = *handle.key();
                let sent = self.session.transport.lock().await.send(encode(key)).await;
                if let Err(err) = sent {
                    self.session.exchanges.fail(&key, err.clone());
                    return Err(err);
                }
                handle.await
            }
            .await;

            let finished = match &outcome {
                Ok(_) => transaction.end_request(),
                Err(err) => transaction.fail_request(err.clone()),
            };
            if let Err(err) = finished {
                debug!(id = transaction.id(), %err, "Transaction ended elsewhere");
            }
            outcome
        }
        .await;
        self.poison(outcome)
    }
}

impl<F: ConnectionFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
        self.pool
            .release(&self.connection, &self.state, Release::Closed);
    }
}
