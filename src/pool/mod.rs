//! Shared, leased connections to named endpoints.
//!
//! The pool keeps at most one physical connection per endpoint. Callers take
//! turns using it through exclusive, time-bounded [`Lease`]s; callers that
//! find the connection leased queue up and are served in arrival order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::connection::{Authentication, ConnectionFactory};
use crate::errors::{Error, Result};
use crate::exchange::{ExchangeRegistry, KeySequence};
use crate::transaction::TransactionManager;

mod lease;

pub use lease::Lease;
use lease::LeaseState;

// Maximum time a lease may be held before it is force-closed
const MAX_LEASE_DURATION: Duration = Duration::from_secs(4);
// Maximum time to wait for a lease
const MAX_WAIT: Duration = Duration::from_secs(20);
// Maximum time to wait for a correlated response
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(4);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables of a [`LeasePool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long a lease may be held before it is force-closed
    pub max_lease_duration: Duration,
    /// How long `acquire` waits for a lease by default
    pub max_wait: Duration,
    /// Transactions allowed in flight per connection; fixed once a connection exists
    pub concurrency: usize,
    /// Deadline of every correlated exchange
    pub exchange_timeout: Duration,
    /// Source of fresh correlation keys for every connection
    pub key_sequence: KeySequence,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_lease_duration: MAX_LEASE_DURATION,
            max_wait: MAX_WAIT,
            concurrency: 1,
            exchange_timeout: EXCHANGE_TIMEOUT,
            key_sequence: KeySequence::default(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        let zero = [
            ("max_lease_duration", self.max_lease_duration),
            ("max_wait", self.max_wait),
            ("exchange_timeout", self.exchange_timeout),
        ]
        .into_iter()
        .find(|(_, value)| value.is_zero());
        if let Some((name, _)) = zero {
            return Err(Error::InvalidConfig(format!("{name} must not be zero")));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "the concurrency budget must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters describing what a pool has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical connections opened, reconnects included
    pub connections_opened: u64,
    /// Connections torn down (poisoned, failed, reconnected or closed with the pool)
    pub connections_closed: u64,
    /// Connections dropped from the pool because a caller gave up waiting on them
    pub connections_discarded: u64,
    /// Leases handed out
    pub leases_granted: u64,
    /// Leases returned by their holder
    pub leases_closed: u64,
    /// Leases force-closed after exceeding their maximum duration
    pub leases_expired: u64,
    /// `acquire` calls that gave up waiting
    pub wait_timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connections_discarded: AtomicU64,
    leases_granted: AtomicU64,
    leases_closed: AtomicU64,
    leases_expired: AtomicU64,
    wait_timeouts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            leases_granted: self.leases_granted.load(Ordering::Relaxed),
            leases_closed: self.leases_closed.load(Ordering::Relaxed),
            leases_expired: self.leases_expired.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Why a lease stopped being usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Closed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Ready,
    Closed,
}

/// Everything that lives exactly as long as one physical connection.
struct Session<F: ConnectionFactory> {
    transport: tokio::sync::Mutex<F::Transport>,
    transactions: TransactionManager,
    exchanges: ExchangeRegistry,
}

impl<F: ConnectionFactory> Session<F> {
    fn new(transport: F::Transport, config: &PoolConfig) -> Result<Self> {
        Ok(Self {
            transport: tokio::sync::Mutex::new(transport),
            transactions: TransactionManager::new(config.concurrency)?,
            exchanges: ExchangeRegistry::with_sequence(config.key_sequence),
        })
    }
}

struct Waiter<F: ConnectionFactory> {
    id: u64,
    sender: oneshot::Sender<Result<Lease<F>>>,
}

struct ConnectionState<F: ConnectionFactory> {
    phase: Phase,
    session: Option<Arc<Session<F>>>,
    active: Option<u64>,
    waiters: VecDeque<Waiter<F>>,
    discarded: bool,
}

struct PooledConnection<F: ConnectionFactory> {
    endpoint: String,
    authentication: Option<Authentication>,
    state: Mutex<ConnectionState<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(
        endpoint: &str,
        authentication: Option<Authentication>,
        waiters: VecDeque<Waiter<F>>,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            authentication,
            state: Mutex::new(ConnectionState {
                phase: Phase::Connecting,
                session: None,
                active: None,
                waiters,
                discarded: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState<F>> {
        lock(&self.state)
    }

    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.waiters.len();
        state.waiters.retain(|waiter| waiter.id != id);
        state.waiters.len() != before
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    // lock order: `connections` before any connection's state
    connections: Mutex<HashMap<String, Arc<PooledConnection<F>>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue `waiter` on the connection for `endpoint`, creating it if needed.
    fn enqueue(
        self: &Arc<Self>,
        endpoint: &str,
        authentication: Option<&Authentication>,
        waiter: Waiter<F>,
    ) -> Result<Arc<PooledConnection<F>>> {
        let mut connections = lock(&self.connections);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        if let Some(connection) = connections.get(endpoint) {
            let connection = Arc::clone(connection);
            connection.lock().waiters.push_back(waiter);
            drop(connections);
            trace!(endpoint, "Queued lease request");
            self.dispatch(&connection);
            return Ok(connection);
        }

        let connection = Arc::new(PooledConnection::new(
            endpoint,
            authentication.cloned(),
            VecDeque::from([waiter]),
        ));
        connections.insert(endpoint.to_string(), Arc::clone(&connection));
        drop(connections);

        self.spawn_connect(Arc::clone(&connection));
        Ok(connection)
    }

    /// Open the physical connection in the background so that the result
    /// reaches every waiter even if the caller that triggered it gives up.
    fn spawn_connect(self: &Arc<Self>, connection: Arc<PooledConnection<F>>) {
        let Ok(runtime) = Handle::try_current() else {
            let err = Error::Connection("No runtime available to open the connection on".to_string());
            for waiter in self.remove(&connection) {
                let _ = waiter.sender.send(Err(err.clone()));
            }
            return;
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            debug!(endpoint = %connection.endpoint, "Opening connection");
            let opened = pool
                .factory
                .open(&connection.endpoint, connection.authentication.as_ref())
                .await
                .and_then(|transport| Session::new(transport, &pool.config));
            pool.on_connected(&connection, opened).await;
        });
    }

    async fn on_connected(
        self: &Arc<Self>,
        connection: &Arc<PooledConnection<F>>,
        opened: Result<Session<F>>,
    ) {
        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                let err = match err {
                    Error::Connection(_) => err,
                    other => Error::Connection(other.to_string()),
                };
                warn!(endpoint = %connection.endpoint, %err, "Could not open connection");
                let waiters = self.remove(connection);
                for waiter in waiters {
                    let _ = waiter.sender.send(Err(err.clone()));
                }
                return;
            }
        };

        let orphaned = {
            let mut state = connection.lock();
            if state.phase == Phase::Closed {
                // torn down while connecting
                Some(session)
            } else {
                state.phase = Phase::Ready;
                state.session = Some(Arc::new(session));
                None
            }
        };
        if let Some(session) = orphaned {
            let mut transport = session.transport.into_inner();
            if let Err(err) = self.factory.close(&mut transport).await {
                debug!(endpoint = %connection.endpoint, %err, "Error closing orphaned connection");
            }
            return;
        }

        Counters::bump(&self.counters.connections_opened);
        debug!(endpoint = %connection.endpoint, "Connection ready");
        self.dispatch(connection);
    }

    fn still_connected(&self, session: &Session<F>) -> bool {
        match session.transport.try_lock() {
            Ok(transport) => self.factory.is_connected(&transport),
            // in use by a lease that was force-closed, assume it is fine
            Err(_) => true,
        }
    }

    /// Hand the connection to the next waiter if it is idle.
    fn dispatch(self: &Arc<Self>, connection: &Arc<PooledConnection<F>>) {
        loop {
            let (waiter, session, lease_id) = {
                let mut state = connection.lock();
                if state.phase != Phase::Ready || state.active.is_some() {
                    return;
                }
                while state
                    .waiters
                    .front()
                    .is_some_and(|waiter| waiter.sender.is_closed())
                {
                    state.waiters.pop_front();
                }
                if state.waiters.is_empty() {
                    return;
                }
                let Some(session) = state.session.clone() else {
                    return;
                };

                if !self.still_connected(&session) {
                    state.phase = Phase::Connecting;
                    state.session = None;
                    drop(state);
                    debug!(endpoint = %connection.endpoint, "Transport disconnected, reconnecting");
                    self.retire(
                        session,
                        Error::ConnectionInvalidated(connection.endpoint.clone()),
                    );
                    self.spawn_connect(Arc::clone(connection));
                    return;
                }

                let Some(waiter) = state.waiters.pop_front() else {
                    return;
                };
                let lease_id = self.next_id();
                state.active = Some(lease_id);
                (waiter, session, lease_id)
            };

            let lease = Lease::new(Arc::clone(self), Arc::clone(connection), session, lease_id);
            match waiter.sender.send(Ok(lease)) {
                Ok(()) => {
                    Counters::bump(&self.counters.leases_granted);
                    debug!(endpoint = %connection.endpoint, lease = lease_id, "Granted lease");
                    return;
                }
                Err(returned) => {
                    // the waiter gave up in the meantime, move on to the next one
                    if let Ok(lease) = returned {
                        lease.disarm();
                    }
                    let mut state = connection.lock();
                    if state.active == Some(lease_id) {
                        state.active = None;
                    }
                }
            }
        }
    }

    /// End a lease. Returns `false` if it had already ended.
    fn release(
        self: &Arc<Self>,
        connection: &Arc<PooledConnection<F>>,
        lease: &LeaseState,
        reason: Release,
    ) -> bool {
        if lease
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        match reason {
            Release::Closed => {
                Counters::bump(&self.counters.leases_closed);
                trace!(endpoint = %connection.endpoint, lease = lease.id, "Lease closed");
            }
            Release::Expired => {
                Counters::bump(&self.counters.leases_expired);
                warn!(
                    endpoint = %connection.endpoint,
                    lease = lease.id,
                    "Lease exceeded its maximum duration and was force-closed"
                );
            }
        }

        let invalid = lease.invalid.load(Ordering::SeqCst);
        let teardown = {
            let mut state = connection.lock();
            if state.active == Some(lease.id) {
                state.active = None;
            }
            invalid || state.discarded
        };

        if teardown {
            if invalid {
                debug!(endpoint = %connection.endpoint, "Lease was invalidated, tearing down connection");
            }
            self.teardown(
                connection,
                Error::ConnectionInvalidated(connection.endpoint.clone()),
            );
        } else {
            self.dispatch(connection);
        }
        true
    }

    /// Tear the connection down for a failure seen after its lease ended,
    /// unless it has moved on to a different session meanwhile.
    fn poison_session(
        self: &Arc<Self>,
        connection: &Arc<PooledConnection<F>>,
        session: &Arc<Session<F>>,
    ) {
        let current = connection
            .lock()
            .session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if current {
            debug!(endpoint = %connection.endpoint, "Failure after lease expiry, tearing down connection");
            self.teardown(
                connection,
                Error::ConnectionInvalidated(connection.endpoint.clone()),
            );
        }
    }

    /// Take the connection out of the map and mark it closed. Returns its waiters.
    fn remove(&self, connection: &Arc<PooledConnection<F>>) -> VecDeque<Waiter<F>> {
        let mut connections = lock(&self.connections);
        if connections
            .get(&connection.endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            connections.remove(&connection.endpoint);
        }
        let mut state = connection.lock();
        state.phase = Phase::Closed;
        mem::take(&mut state.waiters)
    }

    /// Close the connection for good; its waiters move on to a fresh one.
    fn teardown(self: &Arc<Self>, connection: &Arc<PooledConnection<F>>, reason: Error) {
        let (waiters, session) = {
            let mut connections = lock(&self.connections);
            let mut state = connection.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            if connections
                .get(&connection.endpoint)
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                connections.remove(&connection.endpoint);
            }
            (mem::take(&mut state.waiters), state.session.take())
        };

        if let Some(session) = session {
            self.retire(session, reason);
        }
        self.rehome(connection, waiters);
    }

    /// Account for a caller that gave up waiting. `holder` is the connection
    /// it was still queued on, `None` if it was in transit between connections.
    fn give_up(
        self: &Arc<Self>,
        endpoint: &str,
        max_wait: Duration,
        holder: Option<Arc<PooledConnection<F>>>,
    ) {
        let Some(holder) = holder else {
            debug!(endpoint, ?max_wait, "Gave up waiting for a lease while being moved to a fresh connection");
            return;
        };
        Counters::bump(&self.counters.wait_timeouts);
        warn!(endpoint, ?max_wait, "Gave up waiting for a lease");
        self.discard(&holder);
    }

    /// Drop a connection a caller gave up waiting on. Whoever holds it keeps it
    /// until the lease ends; the remaining waiters move on to a fresh one.
    fn discard(self: &Arc<Self>, connection: &Arc<PooledConnection<F>>) {
        Counters::bump(&self.counters.connections_discarded);
        warn!(endpoint = %connection.endpoint, "Discarding connection after lease wait timeout");

        let waiters = {
            let mut connections = lock(&self.connections);
            let mut state = connection.lock();
            if state.phase == Phase::Closed {
                return;
            }
            if state.active.is_none() {
                drop(state);
                drop(connections);
                self.teardown(
                    connection,
                    Error::ConnectionInvalidated(connection.endpoint.clone()),
                );
                return;
            }
            state.discarded = true;
            if connections
                .get(&connection.endpoint)
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                connections.remove(&connection.endpoint);
            }
            mem::take(&mut state.waiters)
        };
        self.rehome(connection, waiters);
    }

    /// Queue `waiters`, in order, on a live connection for the same endpoint.
    fn rehome(self: &Arc<Self>, old: &Arc<PooledConnection<F>>, waiters: VecDeque<Waiter<F>>) {
        let waiters: VecDeque<Waiter<F>> = waiters
            .into_iter()
            .filter(|waiter| !waiter.sender.is_closed())
            .collect();
        if waiters.is_empty() {
            return;
        }

        let mut connections = lock(&self.connections);
        if self.closed.load(Ordering::Acquire) {
            drop(connections);
            for waiter in waiters {
                let _ = waiter.sender.send(Err(Error::PoolClosed));
            }
            return;
        }
        debug!(endpoint = %old.endpoint, count = waiters.len(), "Moving waiters to a fresh connection");

        if let Some(current) = connections.get(&old.endpoint) {
            let current = Arc::clone(current);
            {
                let mut state = current.lock();
                // they have been waiting longer than anyone queued here
                for waiter in waiters.into_iter().rev() {
                    state.waiters.push_front(waiter);
                }
            }
            drop(connections);
            self.dispatch(&current);
            return;
        }

        let fresh = Arc::new(PooledConnection::new(
            &old.endpoint,
            old.authentication.clone(),
            waiters,
        ));
        connections.insert(old.endpoint.clone(), Arc::clone(&fresh));
        drop(connections);
        self.spawn_connect(fresh);
    }

    /// Fail everything pending on `session` and close its transport.
    fn retire(self: &Arc<Self>, session: Arc<Session<F>>, reason: Error) {
        Counters::bump(&self.counters.connections_closed);
        session.exchanges.invalidate_all(&reason);
        session.transactions.close();
        self.spawn_close(session);
    }

    /// Close the session's transport in the background, once nobody uses it.
    fn spawn_close(self: &Arc<Self>, session: Arc<Session<F>>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No runtime available, dropping transport without closing it");
            return;
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            let mut transport = session.transport.lock().await;
            if let Err(err) = pool.factory.close(&mut transport).await {
                debug!(%err, "Error while closing connection");
            }
        });
    }
}

/// Pool of named, shared connections handed out through exclusive leases.
///
/// Cloning the pool is cheap; all clones share the same connections.
pub struct LeasePool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for LeasePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for LeasePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasePool")
            .field("config", &self.inner.config)
            .field("connections", &lock(&self.inner.connections).len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builder for a [`LeasePool`], starting from [`PoolConfig::default`]
pub struct PoolBuilder<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
}

impl<F: ConnectionFactory> fmt::Debug for PoolBuilder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    /// Maximum time a lease may be held before it is force-closed
    pub fn max_lease_duration(mut self, duration: Duration) -> Self {
        self.config.max_lease_duration = duration;
        self
    }

    /// Default maximum time `acquire` waits for a lease
    pub fn max_wait(mut self, duration: Duration) -> Self {
        self.config.max_wait = duration;
        self
    }

    /// Number of transactions allowed in flight per connection
    pub fn concurrency(mut self, budget: usize) -> Self {
        self.config.concurrency = budget;
        self
    }

    /// Deadline of every correlated exchange
    pub fn exchange_timeout(mut self, duration: Duration) -> Self {
        self.config.exchange_timeout = duration;
        self
    }

    /// Correlation keys handed out per connection
    pub fn key_sequence(mut self, sequence: KeySequence) -> Self {
        self.config.key_sequence = sequence;
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the pool
    /// # Errors
    ///
    /// Will return `Error::InvalidConfig` for a zero duration or a zero concurrency budget.
    pub fn build(self) -> Result<LeasePool<F>> {
        self.config.validate()?;
        Ok(LeasePool {
            inner: Arc::new(PoolInner {
                factory: self.factory,
                config: self.config,
                connections: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        })
    }
}

impl<F: ConnectionFactory> LeasePool<F> {
    /// Create a pool with the default configuration
    ///```rust
    /// # tokio_test::block_on(async {
    /// use plccore::{connection::tcp::TcpConnectionFactory, LeasePool};
    ///
    /// let pool = LeasePool::new(TcpConnectionFactory::new().with_default_port(102))?;
    /// assert_eq!(pool.connection_count(), 0);
    /// # Ok::<(), plccore::errors::Error>(())
    /// # });
    /// ```
    /// # Errors
    ///
    /// Will not fail with the default configuration.
    pub fn new(factory: F) -> Result<Self> {
        Self::builder(factory).build()
    }

    /// Start configuring a pool around `factory`
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder {
            factory,
            config: PoolConfig::default(),
        }
    }

    /// Acquire a lease on `endpoint`, waiting at most the configured `max_wait`.
    ///
    /// See [`acquire_timeout`](Self::acquire_timeout).
    /// # Errors
    ///
    /// Will return `Error` if no lease could be acquired.
    pub async fn acquire(
        &self,
        endpoint: &str,
        authentication: Option<&Authentication>,
    ) -> Result<Lease<F>> {
        self.acquire_timeout(endpoint, authentication, self.inner.config.max_wait)
            .await
    }

    /// Acquire a lease on `endpoint`, waiting at most `max_wait`.
    ///
    /// The connection is opened on first use and reopened if the driver
    /// reports it disconnected. Callers are served in the order they asked.
    /// # Errors
    ///
    /// Will return `Error::LeaseWaitTimeout` if `max_wait` elapsed (the
    /// connection is then discarded as suspect), `Error::Connection` if the
    /// connection could not be opened, or `Error::PoolClosed`.
    pub async fn acquire_timeout(
        &self,
        endpoint: &str,
        authentication: Option<&Authentication>,
        max_wait: Duration,
    ) -> Result<Lease<F>> {
        let id = self.inner.next_id();
        let (sender, mut receiver) = oneshot::channel();
        let connection = self
            .inner
            .enqueue(endpoint, authentication, Waiter { id, sender })?;

        match timeout(max_wait, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_dropped)) => Err(Error::PoolClosed),
            Err(_elapsed) => {
                // the waiter may have been moved on to a fresh connection meanwhile
                let holder = if connection.remove_waiter(id) {
                    Some(connection)
                } else {
                    let current = lock(&self.inner.connections).get(endpoint).cloned();
                    current.filter(|current| current.remove_waiter(id))
                };
                if holder.is_none() {
                    // served or failed while the timer fired
                    if let Ok(outcome) = receiver.try_recv() {
                        return outcome;
                    }
                }
                self.inner.give_up(endpoint, max_wait, holder);
                Err(Error::LeaseWaitTimeout {
                    endpoint: endpoint.to_string(),
                    waited: max_wait,
                })
            }
        }
    }

    /// Tear down every connection. Queued callers fail with `Error::PoolClosed`,
    /// later calls to `acquire` as well. Leases still held stop working once
    /// their transport is closed; a transport a caller is using right now is
    /// closed in the background when they let go of it.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let connections: Vec<_> = lock(&self.inner.connections)
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        let mut sessions = Vec::new();
        for connection in connections {
            let (waiters, session) = {
                let mut state = connection.lock();
                state.phase = Phase::Closed;
                (mem::take(&mut state.waiters), state.session.take())
            };
            for waiter in waiters {
                let _ = waiter.sender.send(Err(Error::PoolClosed));
            }
            let Some(session) = session else {
                continue;
            };
            Counters::bump(&self.inner.counters.connections_closed);
            session.exchanges.invalidate_all(&Error::PoolClosed);
            session.transactions.close();
            sessions.push((connection, session));
        }

        for (connection, session) in sessions {
            let busy = match session.transport.try_lock() {
                Ok(mut transport) => {
                    if let Err(err) = self.inner.factory.close(&mut transport).await {
                        debug!(endpoint = %connection.endpoint, %err, "Error while closing connection");
                    }
                    false
                }
                Err(_) => true,
            };
            if busy {
                debug!(endpoint = %connection.endpoint, "Transport in use, closing it once released");
                self.inner.spawn_close(session);
            }
        }
        debug!("Connection pool closed");
    }

    /// `true` once [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the pool's counters
    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot()
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The driver's connection factory
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Number of endpoints with a pooled connection
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// `true` if a connection for `endpoint` is pooled
    pub fn contains(&self, endpoint: &str) -> bool {
        lock(&self.inner.connections).contains_key(endpoint)
    }

    /// Number of callers queued for a lease on `endpoint`
    pub fn waiting(&self, endpoint: &str) -> usize {
        let connection = lock(&self.inner.connections).get(endpoint).cloned();
        connection.map_or(0, |connection| connection.lock().waiters.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::connection::Transport;

    #[derive(Debug, Default)]
    struct Tally {
        opened: AtomicUsize,
        refuse: AtomicBool,
    }

    #[derive(Debug, Clone, Default)]
    struct StubFactory {
        tally: Arc<Tally>,
    }

    impl StubFactory {
        fn opened(&self) -> usize {
            self.tally.opened.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct StubTransport {
        connected: bool,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(&mut self, _frame: Bytes) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        type Transport = StubTransport;

        async fn open(
            &self,
            endpoint: &str,
            _authentication: Option<&Authentication>,
        ) -> Result<StubTransport> {
            if self.tally.refuse.load(Ordering::SeqCst) {
                return Err(Error::Connection(format!("{endpoint} refused")));
            }
            self.tally.opened.fetch_add(1, Ordering::SeqCst);
            Ok(StubTransport { connected: true })
        }

        async fn close(&self, transport: &mut StubTransport) -> Result<()> {
            transport.connected = false;
            Ok(())
        }

        fn is_connected(&self, transport: &StubTransport) -> bool {
            transport.connected
        }

        fn correlation_key(&self, frame: &[u8]) -> Option<u64> {
            frame.first().map(|key| u64::from(*key))
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = LeasePool::builder(StubFactory::default())
            .concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = LeasePool::builder(StubFactory::default())
            .max_wait(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidConfig("max_wait must not be zero".to_string())
        );
    }

    #[test]
    fn defaults() {
        let config = PoolConfig::default();

        assert_eq!(config.max_lease_duration, Duration::from_secs(4));
        assert_eq!(config.max_wait, Duration::from_secs(20));
        assert_eq!(config.concurrency, 1);
        assert_eq!(
            (config.key_sequence.min(), config.key_sequence.max()),
            (1, 0xFFFF)
        );
    }

    #[test_log::test(tokio::test)]
    async fn returned_lease_is_reused() {
        let factory = StubFactory::default();
        let pool = LeasePool::new(factory.clone()).unwrap();

        let lease = pool.acquire("dev-A", None).await.unwrap();
        assert_eq!(lease.endpoint(), "dev-A");
        lease.close();
        let lease = pool.acquire("dev-A", None).await.unwrap();
        drop(lease);

        assert_eq!(factory.opened(), 1);
        assert!(pool.contains("dev-A"));
        let stats = pool.stats();
        assert_eq!((stats.leases_granted, stats.leases_closed), (2, 2));
    }

    #[test_log::test(tokio::test)]
    async fn disconnected_transport_is_reopened() {
        let factory = StubFactory::default();
        let pool = LeasePool::new(factory.clone()).unwrap();

        let lease = pool.acquire("dev-A", None).await.unwrap();
        lease.transport().await.unwrap().connected = false;
        lease.close();

        let lease = pool.acquire("dev-A", None).await.unwrap();
        assert!(lease.is_connected().await.unwrap());
        assert_eq!(factory.opened(), 2);
        assert_eq!(pool.stats().connections_closed, 1);
    }

    #[test_log::test(tokio::test)]
    async fn refused_connection_is_not_pooled() {
        let factory = StubFactory::default();
        factory.tally.refuse.store(true, Ordering::SeqCst);
        let pool = LeasePool::new(factory.clone()).unwrap();

        let err = pool.acquire("dev-A", None).await.unwrap_err();
        assert_eq!(err, Error::Connection("dev-A refused".to_string()));
        assert!(!pool.contains("dev-A"));

        factory.tally.refuse.store(false, Ordering::SeqCst);
        assert!(pool.acquire("dev-A", None).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn abandoned_waiter_is_skipped() {
        let pool = LeasePool::new(StubFactory::default()).unwrap();
        let first = pool.acquire("dev-A", None).await.unwrap();

        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("dev-A", None).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.waiting("dev-A"), 1);
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        let next = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("dev-A", None).await.map(|lease| lease.id()) })
        };
        tokio::task::yield_now().await;
        first.close();

        assert!(next.await.unwrap().is_ok());
        assert_eq!(pool.stats().leases_granted, 2);
        assert_eq!(pool.waiting("dev-A"), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn held_lease_expires() {
        let factory = StubFactory::default();
        let pool = LeasePool::builder(factory.clone())
            .max_lease_duration(Duration::from_secs(1))
            .build()
            .unwrap();

        let lease = pool.acquire("dev-A", None).await.unwrap();
        assert_eq!(lease.max_duration(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(lease.is_closed());
        assert_eq!(
            lease.transactions().unwrap_err(),
            Error::LeaseClosed("dev-A".to_string())
        );
        // a use after close is the caller's mistake, not a connection failure
        assert!(lease.send(Bytes::new()).await.is_err());
        assert!(!lease.is_invalid());
        assert!(pool.contains("dev-A"));

        let next = pool.acquire("dev-A", None).await.unwrap();
        drop(lease);
        assert!(!next.is_closed());

        let stats = pool.stats();
        assert_eq!((stats.leases_expired, stats.leases_closed), (1, 0));
        assert_eq!(factory.opened(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn failure_after_expiry_still_poisons() {
        let factory = StubFactory::default();
        let pool = LeasePool::builder(factory.clone())
            .max_lease_duration(Duration::from_secs(1))
            .build()
            .unwrap();

        let lease = pool.acquire("dev-A", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(lease.is_closed());
        assert!(pool.contains("dev-A"));

        lease.invalidate();
        assert!(!pool.contains("dev-A"));
        assert_eq!(pool.stats().connections_closed, 1);

        let _next = pool.acquire("dev-A", None).await.unwrap();
        assert_eq!(factory.opened(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn waiter_in_transit_is_not_counted_as_discard() {
        let pool = LeasePool::new(StubFactory::default()).unwrap();
        let lease = pool.acquire("dev-A", None).await.unwrap();

        pool.inner.give_up("dev-A", Duration::from_millis(50), None);
        assert_eq!(
            pool.stats(),
            PoolStats {
                connections_opened: 1,
                leases_granted: 1,
                ..PoolStats::default()
            }
        );
        assert!(pool.contains("dev-A"));

        let holder = lock(&pool.inner.connections).get("dev-A").cloned();
        pool.inner.give_up("dev-A", Duration::from_millis(50), holder);
        let stats = pool.stats();
        assert_eq!((stats.wait_timeouts, stats.connections_discarded), (1, 1));
        assert!(!pool.contains("dev-A"));
        drop(lease);
    }
}
