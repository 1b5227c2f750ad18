//! Correlation of asynchronous responses with the requests that caused them.
//!
//! A request is pushed onto the wire tagged with a key the sender picked. The
//! matching response shows up later, decoded by the driver, and is handed to
//! [`ExchangeRegistry::resolve`], which completes the [`CompletionHandle`] the
//! sender is awaiting. Every pending exchange carries a deadline; when it
//! elapses the handle fails with [`Error::ExchangeTimeout`] and the key is freed.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::errors::{Error, Result};

/// Identifier a protocol uses to pair a response with its request.
pub trait CorrelationKey: Hash + Eq + Clone + Debug + Send + 'static {}

impl<T> CorrelationKey for T where T: Hash + Eq + Clone + Debug + Send + 'static {}

/// Monotonically increasing key source with explicit wraparound.
///
/// Keys run from `min` to `max` and then start over at `min`, so a reserved
/// zero is never produced when `min` is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySequence {
    min: u64,
    max: u64,
    next: u64,
}

impl KeySequence {
    /// Create a sequence covering `min..=max`
    /// # Errors
    ///
    /// Will return `Error::InvalidConfig` if `min` is larger than `max`.
    pub fn new(min: u64, max: u64) -> Result<Self> {
        if min > max {
            return Err(Error::InvalidConfig(format!(
                "correlation key range {min}..={max} is empty"
            )));
        }
        Ok(Self { min, max, next: min })
    }

    /// Smallest key of the sequence
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Largest key of the sequence
    pub fn max(&self) -> u64 {
        self.max
    }

    fn advance(&mut self) -> u64 {
        let key = self.next;
        self.next = if key >= self.max { self.min } else { key + 1 };
        key
    }

    /// Next key for which `taken` is false. At most `in_use + 1` keys are examined.
    fn next_free(&mut self, in_use: usize, taken: impl Fn(u64) -> bool) -> Result<u64> {
        let span = u128::from(self.max - self.min) + 1;
        let attempts = span.min(in_use as u128 + 1);
        for _ in 0..attempts {
            let key = self.advance();
            if !taken(key) {
                return Ok(key);
            }
            trace!(key, "Skipping correlation key still pending");
        }
        Err(Error::KeySpaceExhausted)
    }
}

impl Default for KeySequence {
    fn default() -> Self {
        Self {
            min: 1,
            max: u64::from(u16::MAX),
            next: 1,
        }
    }
}

struct Pending<P> {
    sender: oneshot::Sender<Result<P>>,
    deadline: Instant,
    timeout: Duration,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl<P> Pending<P> {
    fn complete(self, outcome: Result<P>) -> bool {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.sender.send(outcome).is_ok()
    }
}

struct Inner<K, P> {
    pending: HashMap<K, Pending<P>>,
    generation: u64,
    sequence: KeySequence,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of the outstanding exchanges of one connection.
///
/// Cloning the registry yields another handle onto the same set of exchanges,
/// which is how a driver's inbound path gets hold of it.
pub struct ExchangeRegistry<K = u64, P = Bytes> {
    inner: Arc<Mutex<Inner<K, P>>>,
}

impl<K, P> Clone for ExchangeRegistry<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P> Debug for ExchangeRegistry<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ExchangeRegistry")
            .field("pending", &inner.pending.len())
            .field("sequence", &inner.sequence)
            .finish()
    }
}

impl<K: CorrelationKey, P: Send + 'static> Default for ExchangeRegistry<K, P> {
    fn default() -> Self {
        Self::with_sequence(KeySequence::default())
    }
}

impl<K: CorrelationKey, P: Send + 'static> ExchangeRegistry<K, P> {
    /// Create an empty registry using the default key sequence `1..=0xFFFF`
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry drawing fresh keys from `sequence`
    pub fn with_sequence(sequence: KeySequence) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
                generation: 0,
                sequence,
            })),
        }
    }

    /// Register an exchange under `key` that fails once `timeout` has elapsed.
    ///
    /// The returned handle resolves to the response payload.
    /// # Errors
    ///
    /// Will return `Error::DuplicateKey` if `key` is still pending.
    pub fn register(&self, key: K, timeout: Duration) -> Result<CompletionHandle<K, P>> {
        let mut inner = lock(&self.inner);
        if inner.pending.contains_key(&key) {
            return Err(Error::DuplicateKey(format!("{key:?}")));
        }
        Ok(self.insert(&mut inner, key, timeout))
    }

    fn insert(
        &self,
        inner: &mut Inner<K, P>,
        key: K,
        timeout: Duration,
    ) -> CompletionHandle<K, P> {
        let (sender, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        inner.generation += 1;
        let generation = inner.generation;

        // Without a runtime only `sweep_expired` enforces the deadline.
        let timer = Handle::try_current().ok().map(|runtime| {
            let registry = Arc::downgrade(&self.inner);
            let key = key.clone();
            runtime
                .spawn(async move {
                    sleep_until(deadline).await;
                    expire(&registry, &key, generation);
                })
                .abort_handle()
        });

        trace!(?key, ?timeout, "Registered exchange");
        inner.pending.insert(
            key.clone(),
            Pending {
                sender,
                deadline,
                timeout,
                generation,
                timer,
            },
        );

        CompletionHandle { key, receiver }
    }

    /// Complete the exchange registered under `key` with `payload`.
    ///
    /// Returns `false` if no exchange is pending for `key`. Such a response is
    /// unsolicited, late or duplicated; it is dropped and reported, never fatal.
    pub fn resolve(&self, key: &K, payload: P) -> bool {
        let pending = lock(&self.inner).pending.remove(key);
        match pending {
            Some(pending) => {
                if !pending.complete(Ok(payload)) {
                    debug!(?key, "Response arrived after its caller stopped waiting");
                }
                true
            }
            None => {
                warn!(?key, "Dropping unsolicited response");
                false
            }
        }
    }

    /// Fail the exchange registered under `key`, e.g. because its response could not be decoded.
    pub fn fail(&self, key: &K, reason: Error) -> bool {
        let pending = lock(&self.inner).pending.remove(key);
        match pending {
            Some(pending) => {
                debug!(?key, %reason, "Failing exchange");
                pending.complete(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Fail every pending exchange with `reason`. Returns how many were failed.
    pub fn invalidate_all(&self, reason: &Error) -> usize {
        let drained: Vec<_> = lock(&self.inner).pending.drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            pending.complete(Err(reason.clone()));
        }
        if count > 0 {
            debug!(count, %reason, "Invalidated pending exchanges");
        }
        count
    }

    /// Fail every exchange whose deadline has passed. Returns how many expired.
    ///
    /// Equivalent to the per-exchange timers and usable where no runtime drives them.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut inner = lock(&self.inner);
            let keys: Vec<K> = inner
                .pending
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| inner.pending.remove(&key).map(|p| (key, p)))
                .collect()
        };
        let count = expired.len();
        for (key, pending) in expired {
            fail_timed_out(key, pending);
        }
        count
    }

    /// `true` while an exchange is pending under `key`
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).pending.contains_key(key)
    }

    /// Number of pending exchanges
    pub fn len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// `true` if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Send + 'static> ExchangeRegistry<u64, P> {
    /// Register an exchange under the next free key of the sequence.
    ///
    /// Keys still pending are skipped, so a key is never reused before its
    /// previous exchange was resolved, failed or timed out.
    /// # Errors
    ///
    /// Will return `Error::KeySpaceExhausted` if every key of the sequence is pending.
    pub fn register_next(&self, timeout: Duration) -> Result<CompletionHandle<u64, P>> {
        let mut inner = lock(&self.inner);
        let in_use = inner.pending.len();
        let Inner {
            pending, sequence, ..
        } = &mut *inner;
        let key = sequence.next_free(in_use, |key| pending.contains_key(&key))?;
        Ok(self.insert(&mut inner, key, timeout))
    }
}

fn expire<K: CorrelationKey, P>(registry: &Weak<Mutex<Inner<K, P>>>, key: &K, generation: u64) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let pending = {
        let mut inner = lock(&inner);
        match inner.pending.get(key) {
            Some(pending) if pending.generation == generation => inner.pending.remove(key),
            _ => None,
        }
    };
    if let Some(mut pending) = pending {
        // this task is the timer, nothing left to abort
        pending.timer = None;
        fail_timed_out(key.clone(), pending);
    }
}

fn fail_timed_out<K: CorrelationKey, P>(key: K, pending: Pending<P>) {
    debug!(?key, timeout = ?pending.timeout, "Exchange timed out");
    let timeout = pending.timeout;
    pending.complete(Err(Error::ExchangeTimeout {
        key: format!("{key:?}"),
        timeout,
    }));
}

/// Awaitable completion of one registered exchange.
///
/// Resolves to the response payload, or to the error the exchange was failed
/// with. Awaiting never holds a registry lock.
pub struct CompletionHandle<K = u64, P = Bytes> {
    key: K,
    receiver: oneshot::Receiver<Result<P>>,
}

impl<K: Debug, P> Debug for CompletionHandle<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("key", &self.key)
            .finish()
    }
}

impl<K, P> CompletionHandle<K, P> {
    /// Correlation key the exchange was registered under
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Unpin, P> Future for CompletionHandle<K, P> {
    type Output = Result<P>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(Error::ExchangeAbandoned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn resolve_fulfills_only_the_matching_handle() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let first = registry.register(1, DEADLINE).unwrap();
        let second = registry.register(2, DEADLINE).unwrap();

        assert!(registry.resolve(&2, Bytes::from_static(b"two")));
        assert_eq!(second.await.unwrap(), Bytes::from_static(b"two"));

        assert!(registry.contains(&1));
        assert!(registry.resolve(&1, Bytes::from_static(b"one")));
        assert_eq!(first.await.unwrap(), Bytes::from_static(b"one"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_key_is_dropped() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let handle = registry.register(7, DEADLINE).unwrap();

        assert!(!registry.resolve(&8, Bytes::new()));
        // a second response for an already resolved key is just as unsolicited
        assert!(registry.resolve(&7, Bytes::new()));
        assert!(!registry.resolve(&7, Bytes::new()));
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let _pending = registry.register(3, DEADLINE).unwrap();

        assert_eq!(
            registry.register(3, DEADLINE).unwrap_err(),
            Error::DuplicateKey("3".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_exchange_times_out() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let handle = registry.register(42, DEADLINE).unwrap();
        let started = Instant::now();

        let err = handle.await.unwrap_err();

        assert_eq!(
            err,
            Error::ExchangeTimeout {
                key: "42".to_string(),
                timeout: DEADLINE
            }
        );
        assert!(started.elapsed() >= DEADLINE);
        assert!(!registry.contains(&42));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_touch_other_exchanges() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let short = registry.register(1, DEADLINE).unwrap();
        let long = registry.register(2, DEADLINE * 10).unwrap();

        assert!(short.await.unwrap_err().is_timeout());
        assert!(registry.contains(&2));

        assert!(registry.resolve(&2, Bytes::from_static(b"late but fine")));
        assert_eq!(long.await.unwrap(), Bytes::from_static(b"late but fine"));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_key_can_be_reused_without_stale_timer() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let first = registry.register(5, DEADLINE).unwrap();
        registry.resolve(&5, Bytes::new());
        first.await.unwrap();

        tokio::time::sleep(DEADLINE / 2).await;
        let second = registry.register(5, DEADLINE).unwrap();
        // the first exchange's deadline passes here, the second must survive it
        tokio::time::sleep(DEADLINE * 3 / 4).await;
        assert!(registry.contains(&5));

        registry.resolve(&5, Bytes::from_static(b"ok"));
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn invalidate_all_fails_every_exchange() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let handles: Vec<_> = (1..=3)
            .map(|key| registry.register(key, DEADLINE).unwrap())
            .collect();
        let reason = Error::ConnectionInvalidated("dev-A".to_string());

        assert_eq!(registry.invalidate_all(&reason), 3);
        for handle in handles {
            assert_eq!(handle.await.unwrap_err(), reason);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn fail_reaches_a_single_exchange() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let broken = registry.register(1, DEADLINE).unwrap();
        let _fine = registry.register(2, DEADLINE).unwrap();

        assert!(registry.fail(&1, Error::Operation("bad frame".to_string())));
        assert!(!registry.fail(&1, Error::Operation("bad frame".to_string())));
        assert_eq!(
            broken.await.unwrap_err(),
            Error::Operation("bad frame".to_string())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_expires_without_a_runtime() {
        let registry: ExchangeRegistry<&'static str, u8> = ExchangeRegistry::new();
        let _expired = registry.register("gone", Duration::ZERO).unwrap();
        let _alive = registry.register("alive", Duration::from_secs(60)).unwrap();

        assert_eq!(registry.sweep_expired(), 1);
        assert!(!registry.contains(&"gone"));
        assert!(registry.contains(&"alive"));
    }

    #[tokio::test]
    async fn dropped_registry_abandons_handles() {
        let registry: ExchangeRegistry = ExchangeRegistry::new();
        let handle = registry.register(1, Duration::from_secs(60)).unwrap();
        drop(registry);

        assert_eq!(handle.await.unwrap_err(), Error::ExchangeAbandoned);
    }

    #[tokio::test]
    async fn register_next_skips_pending_keys_and_wraps() {
        let registry: ExchangeRegistry =
            ExchangeRegistry::with_sequence(KeySequence::new(1, 3).unwrap());

        let one = registry.register_next(DEADLINE).unwrap();
        let two = registry.register_next(DEADLINE).unwrap();
        assert_eq!((*one.key(), *two.key()), (1, 2));

        registry.resolve(&1, Bytes::new());
        let three = registry.register_next(DEADLINE).unwrap();
        // 3 is the maximum, so the sequence wraps to 1 and skips the pending 2
        let wrapped = registry.register_next(DEADLINE).unwrap();
        assert_eq!((*three.key(), *wrapped.key()), (3, 1));

        assert_eq!(
            registry.register_next(DEADLINE).unwrap_err(),
            Error::KeySpaceExhausted
        );
    }

    #[test]
    fn key_sequence_never_yields_reserved_zero() {
        let mut sequence = KeySequence::new(1, 2).unwrap();
        let keys: Vec<u64> = (0..5).map(|_| sequence.advance()).collect();

        assert_eq!(keys, vec![1, 2, 1, 2, 1]);
        assert!(KeySequence::new(4, 3).is_err());
    }
}
