use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, RedisOptions};
use crate::connection::{Connection, ConnectionStatus, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{Error, Result};
use crate::reply::Reply;

/// A bounded multiset of connections sharing one frozen options record.
///
/// Capacity is enforced with a FIFO semaphore: when every slot is rented,
/// callers queue behind prior waiters and are admitted in arrival order.
/// Rented connections come back through [`PooledConnection`]'s drop; a
/// connection that failed while rented is discarded instead of re-queued, so
/// `outstanding rentals + idle connections` never exceeds `max_pool_size`.
#[derive(Debug)]
pub struct ConnectionPool {
    name: String,
    options: Arc<RedisOptions>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Validate and freeze `options`, then build an empty pool around them.
    pub fn new(name: impl Into<String>, options: RedisOptions) -> Result<Arc<Self>> {
        options.validate()?;
        options.freeze();
        let name = name.into();
        tracing::debug!(pool = %name, capacity = options.max_pool_size(), "pool created");
        Ok(Arc::new(Self {
            permits: Arc::new(Semaphore::new(options.max_pool_size())),
            options: Arc::new(options),
            idle: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            name,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Arc<RedisOptions> {
        &self.options
    }

    fn idle_queue(&self) -> MutexGuard<'_, VecDeque<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow a connection slot, waiting up to `timeout` for one to free up.
    ///
    /// The returned rental prefers an idle connection; with none available a
    /// fresh unconnected one is handed out and connects lazily on first use.
    pub async fn rent(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            acquired = tokio::time::timeout(timeout, acquire) => match acquired {
                Ok(Ok(permit)) => permit,
                // The semaphore is never closed; both failure shapes mean we
                // did not get a slot in time.
                Ok(Err(_)) | Err(_) => {
                    tracing::debug!(pool = %self.name, ?timeout, "rent timed out");
                    return Err(Error::PoolTimeout);
                }
            },
        };

        let conn = match self.idle_queue().pop_front() {
            Some(conn) => {
                tracing::trace!(pool = %self.name, id = conn.id(), "reusing idle connection");
                conn
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pool = %self.name, id, "allocating connection slot");
                Connection::new(id, Arc::clone(&self.options))
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn put_back(&self, conn: Connection) {
        self.idle_queue().push_back(conn);
    }
}

/// An exclusive loan of one pooled connection.
///
/// Dropping the rental returns the connection: back onto the idle queue when
/// it is still usable (`Ready`, or `New` if it never connected), discarded
/// when it failed. The capacity permit is released either way.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn status(&self) -> ConnectionStatus {
        self.conn
            .as_ref()
            .map(Connection::status)
            .unwrap_or(ConnectionStatus::Closed)
    }

    /// Direct access to the rented connection.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::ConnectionBroken)
    }

    /// Connect now if this rental handed out a fresh slot.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        let conn = self.connection()?;
        if conn.status() == ConnectionStatus::New {
            conn.connect(Instant::now() + DEFAULT_CONNECT_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Issue one command, lazily connecting first when needed.
    pub async fn issue<B: AsRef<[u8]>>(
        &mut self,
        args: &[B],
        cancel: &CancellationToken,
    ) -> Result<Reply> {
        self.ensure_connected().await?;
        self.connection()?.issue(args, cancel).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match conn.status() {
                ConnectionStatus::Ready | ConnectionStatus::New => {
                    self.pool.put_back(conn);
                }
                status => {
                    tracing::debug!(
                        pool = %self.pool.name,
                        id = conn.id(),
                        ?status,
                        "discarding returned connection"
                    );
                    conn.dispose();
                }
            }
        }
        // `_permit` drops afterwards, releasing the slot.
    }
}

/// Named pools, lazily created on first rent.
///
/// Options are registered up front under a name; the pool itself only comes
/// into existence when someone rents from it, guarded so concurrent first
/// renters agree on a single instance.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    options: DashMap<String, RedisOptions>,
    pools: DashMap<String, Arc<ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register options under `name`. The first registration wins; later
    /// calls against the same name are ignored.
    pub fn add(&self, name: impl Into<String>, options: RedisOptions) {
        self.options.entry(name.into()).or_insert(options);
    }

    /// The pool for `name`, creating it (and freezing its options) on first
    /// use.
    pub fn pool(&self, name: &str) -> Result<Arc<ConnectionPool>> {
        if let Some(existing) = self.pools.get(name) {
            return Ok(Arc::clone(&existing));
        }
        let options = self
            .options
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Config(ConfigError::UnknownName(name.to_string())))?;
        match self.pools.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                let pool = ConnectionPool::new(name, options)?;
                slot.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    pub async fn rent(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection> {
        self.pool(name)?.rent(timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    fn pool_with_capacity(n: usize) -> Arc<ConnectionPool> {
        let mut options = RedisOptions::new(Endpoint::new("127.0.0.1", 6379));
        options.set_max_pool_size(n).unwrap();
        ConnectionPool::new("test", options).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rent_times_out_when_exhausted() {
        let pool = pool_with_capacity(1);
        let cancel = CancellationToken::new();
        let _held = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();

        let started = Instant::now();
        let err = pool
            .rent(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolTimeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn returned_connections_are_reused_fifo() {
        let pool = pool_with_capacity(2);
        let cancel = CancellationToken::new();

        let first = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        let first_id = first.conn.as_ref().unwrap().id();
        drop(first);

        // The same (still-New) connection comes back out.
        let again = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(again.conn.as_ref().unwrap().id(), first_id);
    }

    #[tokio::test]
    async fn failed_connections_are_discarded_not_requeued() {
        let pool = pool_with_capacity(1);
        let cancel = CancellationToken::new();

        let rental = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        let failed_id = rental.conn.as_ref().unwrap().id();
        rental.conn.as_ref().unwrap().mark_failed();
        drop(rental);

        assert!(pool.idle_queue().is_empty());
        let fresh = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        assert_ne!(fresh.conn.as_ref().unwrap().id(), failed_id);
    }

    #[tokio::test]
    async fn capacity_invariant_holds_across_churn() {
        let pool = pool_with_capacity(3);
        let cancel = CancellationToken::new();

        let a = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        let b = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        let c = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(pool.permits.available_permits(), 0);
        drop(a);
        drop(b);
        drop(c);

        assert_eq!(pool.permits.available_permits(), 3);
        assert_eq!(pool.idle_queue().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let pool = pool_with_capacity(1);
        let cancel = CancellationToken::new();
        let held = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();

        let first = tokio::spawn({
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            async move { pool.rent(Duration::from_secs(5), &cancel).await }
        });
        // Let the first waiter enqueue before the second arrives.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = tokio::spawn({
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            async move { pool.rent(Duration::from_secs(5), &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        drop(held);
        let first_rental = first.await.unwrap().unwrap();
        // Only one permit exists, so the second waiter must still be queued.
        assert!(!second.is_finished());

        drop(first_rental);
        let _second_rental = second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_rent_stops_waiting() {
        let pool = pool_with_capacity(1);
        let cancel = CancellationToken::new();
        let _held = pool.rent(Duration::from_secs(1), &cancel).await.unwrap();

        let waiting_cancel = CancellationToken::new();
        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let token = waiting_cancel.clone();
            async move { pool.rent(Duration::from_secs(60), &token).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        waiting_cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Canceled));
        // The canceled waiter holds no permit.
        assert_eq!(pool.permits.available_permits(), 0);
        drop(_held);
        assert_eq!(pool.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn pool_options_freeze_on_creation() {
        let pool = pool_with_capacity(2);
        assert!(pool.options().is_frozen());
    }

    #[tokio::test]
    async fn registry_creates_one_pool_per_name() {
        let registry = PoolRegistry::new();
        registry.add(
            "cache",
            RedisOptions::new(Endpoint::new("127.0.0.1", 6379)),
        );
        // Second registration under the same name is ignored.
        let mut other = RedisOptions::new(Endpoint::new("127.0.0.1", 9999));
        other.set_max_pool_size(1).unwrap();
        registry.add("cache", other);

        let a = registry.pool("cache").unwrap();
        let b = registry.pool("cache").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.options().max_pool_size(), crate::config::DEFAULT_MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn unknown_pool_name_is_an_error() {
        let registry = PoolRegistry::new();
        let cancel = CancellationToken::new();
        let err = registry
            .rent("nope", Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownName(_))
        ));
    }

    #[tokio::test]
    async fn invalid_options_surface_at_pool_creation() {
        let registry = PoolRegistry::new();
        // No endpoint configured: validation happens when the pool is first
        // created, not when the options are registered.
        registry.add("broken", RedisOptions::default());
        let err = registry.pool("broken").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::MissingEndpoint)
        ));
    }
}
