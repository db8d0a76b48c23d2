//! Lane pool: one independently owned connection per worker lane
//!
//! Unlike a shared pool that hands connections back and forth, a lane pool
//! opens exactly one handle per lane up front and gives each lane sole
//! ownership of it. Nothing is shared between lanes, so there is no
//! contention and no head-of-line blocking on a common connection. When the
//! lanes finish, their handles are returned and closed together.

use super::error::ResilienceError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Factory trait for creating and closing connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection for the given lane
    async fn create(&self, lane: usize) -> Result<T, ResilienceError>;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

/// A connection bound to a single lane
#[derive(Debug)]
pub struct LaneHandle<T> {
    /// Zero-based lane index
    pub lane: usize,
    /// The connection owned by that lane
    pub conn: T,
}

/// Opens and closes lane-scoped connections
///
/// # Example
/// ```no_run
/// use pump_core_resilience::{ConnectionFactory, LanePool, ResilienceError};
/// use std::sync::Arc;
///
/// struct Client;
/// struct ClientFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<Client> for ClientFactory {
///     async fn create(&self, _lane: usize) -> Result<Client, ResilienceError> {
///         Ok(Client)
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = LanePool::new(Arc::new(ClientFactory));
/// let handles = pool.open(4).await?;
/// assert_eq!(handles.len(), 4);
///
/// // ... each lane works with its own handle ...
///
/// pool.close(handles.into_iter().map(|h| h.conn).collect()).await;
/// # Ok(())
/// # }
/// ```
pub struct LanePool<T> {
    factory: Arc<dyn ConnectionFactory<T>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl<T: Send + 'static> LanePool<T> {
    /// Create a pool backed by the given factory
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>) -> Self {
        Self {
            factory,
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Open one connection per lane
    ///
    /// If any lane fails to connect, the connections already opened are
    /// closed before the error is returned.
    pub async fn open(&self, lanes: usize) -> Result<Vec<LaneHandle<T>>, ResilienceError> {
        if lanes == 0 {
            return Err(ResilienceError::EmptyPool);
        }

        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            match self.factory.create(lane).await {
                Ok(conn) => {
                    self.opened.fetch_add(1, Ordering::Relaxed);
                    debug!(lane, "Opened lane connection");
                    handles.push(LaneHandle { lane, conn });
                }
                Err(e) => {
                    warn!(lane, error = %e, "Failed to open lane connection, rolling back");
                    self.close(handles.into_iter().map(|h| h.conn).collect())
                        .await;
                    return Err(e);
                }
            }
        }

        Ok(handles)
    }

    /// Close connections returned by the lanes
    pub async fn close(&self, conns: Vec<T>) {
        let count = conns.len();
        futures::future::join_all(conns.into_iter().map(|c| self.factory.close(c))).await;
        self.closed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let opened = self.opened.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);
        PoolStats {
            opened,
            closed,
            outstanding: opened.saturating_sub(closed),
        }
    }
}

/// Lane pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened over the pool's lifetime
    pub opened: usize,
    /// Connections closed over the pool's lifetime
    pub closed: usize,
    /// Connections currently held by lanes
    pub outstanding: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestConnection {
        lane: usize,
    }

    struct TestConnectionFactory {
        fail_on_lane: Option<usize>,
        closed: Arc<AtomicUsize>,
    }

    impl TestConnectionFactory {
        fn new(fail_on_lane: Option<usize>) -> Self {
            Self {
                fail_on_lane,
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestConnectionFactory {
        async fn create(&self, lane: usize) -> Result<TestConnection, ResilienceError> {
            if self.fail_on_lane == Some(lane) {
                return Err(ResilienceError::ConnectionCreation(format!(
                    "lane {} refused",
                    lane
                )));
            }
            Ok(TestConnection { lane })
        }

        async fn close(&self, _conn: TestConnection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_open_one_handle_per_lane() {
        let pool = LanePool::new(Arc::new(TestConnectionFactory::new(None)));
        let handles = pool.open(3).await.unwrap();

        assert_eq!(handles.len(), 3);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(h.lane, i);
            assert_eq!(h.conn.lane, i);
        }

        let stats = pool.stats();
        assert_eq!(stats.opened, 3);
        assert_eq!(stats.outstanding, 3);
    }

    #[tokio::test]
    async fn test_close_returns_all_handles() {
        let factory = Arc::new(TestConnectionFactory::new(None));
        let closed = factory.closed.clone();
        let pool = LanePool::new(factory);

        let handles = pool.open(4).await.unwrap();
        pool.close(handles.into_iter().map(|h| h.conn).collect()).await;

        assert_eq!(closed.load(Ordering::SeqCst), 4);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_failed_lane_rolls_back_opened_handles() {
        let factory = Arc::new(TestConnectionFactory::new(Some(2)));
        let closed = factory.closed.clone();
        let pool = LanePool::new(factory);

        let result = pool.open(4).await;
        assert!(matches!(result, Err(ResilienceError::ConnectionCreation(_))));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_zero_lanes_rejected() {
        let pool = LanePool::new(Arc::new(TestConnectionFactory::new(None)));
        let result = tokio_test::block_on(pool.open(0));
        assert_eq!(result.unwrap_err(), ResilienceError::EmptyPool);
    }
}
