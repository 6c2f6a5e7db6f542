use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::PoolConfig;
use crate::destination::Destination;
use crate::error::Error;
use crate::pool::{Checkout, Grant, PoolStatus, Pooled, SlotState, Waiter};
use crate::registry::ManagedPool;
use crate::transport::{AsyncConnection, AsyncTransportFactory, WireRequest, WireResponse};
use crate::util::lock_unpoisoned;

type Conn = Box<dyn AsyncConnection>;

#[derive(Debug)]
struct AsyncWaiter {
    sender: oneshot::Sender<Grant<Conn>>,
}

impl Waiter<Conn> for AsyncWaiter {
    fn wake(self, grant: Grant<Conn>) -> Result<(), Grant<Conn>> {
        self.sender.send(grant)
    }

    fn close(self) {
        drop(self.sender);
    }
}

struct PoolInner {
    destination: Destination,
    connect_timeout: Duration,
    transport: Arc<dyn AsyncTransportFactory>,
    state: Mutex<SlotState<Conn, AsyncWaiter>>,
}

impl PoolInner {
    fn restore(&self, grant: Grant<Conn>) {
        lock_unpoisoned(&self.state).restore(grant);
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            destination: self.destination.to_string(),
        }
    }
}

/// Async counterpart of the blocking slot pool. Waiters park on a oneshot
/// channel and are woken strictly in arrival order; the state mutex is never
/// held across an await point.
#[derive(Clone)]
pub struct AsyncSlotPool {
    inner: Arc<PoolInner>,
}

impl AsyncSlotPool {
    pub fn new(
        destination: Destination,
        config: PoolConfig,
        transport: Arc<dyn AsyncTransportFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                destination,
                connect_timeout: config.connect_timeout,
                transport,
                state: Mutex::new(SlotState::new(&config)),
            }),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// Checks out a connection. Dropping the returned future while it waits
    /// is safe: a connection routed to it in the meantime goes back to the
    /// pool.
    pub async fn acquire(&self) -> Result<AsyncPooledConnection, Error> {
        let receiver = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match state.checkout() {
                Checkout::Reuse(pooled) => return Ok(self.guard(pooled, true)),
                Checkout::Create => None,
                Checkout::Wait => {
                    let (sender, receiver) = oneshot::channel();
                    state.retain_waiters(|waiter| !waiter.sender.is_closed());
                    state.push_waiter(AsyncWaiter { sender });
                    Some(receiver)
                }
                Checkout::Closed => return Err(self.inner.closed_error()),
                Checkout::Exhausted => {
                    return Err(Error::PoolExhausted {
                        destination: self.inner.destination.to_string(),
                        max_size: state.max_size(),
                    });
                }
            }
        };

        let grant = match receiver {
            Some(receiver) => {
                let mut pending = PendingGrant {
                    receiver: Some(receiver),
                    pool: Arc::clone(&self.inner),
                };
                pending.wait().await?
            }
            None => Grant::Create,
        };
        self.fulfil(grant).await
    }

    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<AsyncPooledConnection, Error> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(Error::AcquireTimeout {
                destination: self.inner.destination.to_string(),
                timeout_ms: timeout.as_millis(),
            }),
        }
    }

    pub fn close(&self) {
        let drained = lock_unpoisoned(&self.inner.state).close();
        debug!(
            destination = %self.inner.destination,
            idle_closed = drained,
            "connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.inner.state).is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        lock_unpoisoned(&self.inner.state).status()
    }

    async fn fulfil(&self, grant: Grant<Conn>) -> Result<AsyncPooledConnection, Error> {
        match grant {
            Grant::Reuse(pooled) => Ok(self.guard(pooled, true)),
            Grant::Create => {
                let reservation = Reservation {
                    pool: Some(Arc::clone(&self.inner)),
                };
                let connected = self
                    .inner
                    .transport
                    .connect(&self.inner.destination, self.inner.connect_timeout)
                    .await;
                match connected {
                    Ok(conn) => {
                        let id = {
                            let mut state = lock_unpoisoned(&self.inner.state);
                            if state.is_closed() {
                                drop(conn);
                                drop(state);
                                drop(reservation);
                                return Err(self.inner.closed_error());
                            }
                            state.next_connection_id()
                        };
                        reservation.keep();
                        debug!(
                            destination = %self.inner.destination,
                            connection_id = id,
                            "opened connection"
                        );
                        Ok(self.guard(Pooled { id, conn }, false))
                    }
                    Err(error) => {
                        drop(reservation);
                        Err(Error::connect(error, &self.inner.destination.to_string()))
                    }
                }
            }
        }
    }

    fn guard(&self, pooled: Pooled<Conn>, reused: bool) -> AsyncPooledConnection {
        AsyncPooledConnection {
            pool: Arc::clone(&self.inner),
            pooled: Some(pooled),
            reused,
            failed: false,
        }
    }
}

impl ManagedPool for AsyncSlotPool {
    fn close(&self) {
        AsyncSlotPool::close(self);
    }

    fn status(&self) -> PoolStatus {
        AsyncSlotPool::status(self)
    }
}

impl std::fmt::Debug for AsyncSlotPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncSlotPool")
            .field("destination", &self.inner.destination)
            .field("status", &self.status())
            .finish()
    }
}

/// Receiving end of a queued acquire. If the acquiring future is dropped,
/// the channel is closed and any grant that already arrived is restored.
struct PendingGrant {
    receiver: Option<oneshot::Receiver<Grant<Conn>>>,
    pool: Arc<PoolInner>,
}

impl PendingGrant {
    async fn wait(&mut self) -> Result<Grant<Conn>, Error> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(self.pool.closed_error());
        };
        let received = receiver.await;
        self.receiver = None;
        received.map_err(|_| self.pool.closed_error())
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        if let Ok(grant) = receiver.try_recv() {
            self.pool.restore(grant);
        }
    }
}

/// A slot reserved for a connection that is still being opened.
struct Reservation {
    pool: Option<Arc<PoolInner>>,
}

impl Reservation {
    fn keep(mut self) {
        self.pool = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.restore(Grant::Create);
        }
    }
}

pub struct AsyncPooledConnection {
    pool: Arc<PoolInner>,
    pooled: Option<Pooled<Conn>>,
    reused: bool,
    failed: bool,
}

impl AsyncPooledConnection {
    pub fn connection_id(&self) -> u64 {
        self.pooled.as_ref().map_or(0, |pooled| pooled.id)
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn destination(&self) -> &Destination {
        &self.pool.destination
    }

    /// Sends one request. A send that errors or is cancelled midway leaves
    /// the connection marked for closing.
    pub async fn send(
        &mut self,
        request: &WireRequest,
        timeout: Duration,
    ) -> io::Result<WireResponse> {
        let Some(pooled) = self.pooled.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        self.failed = true;
        let response = pooled.conn.send(request, timeout).await?;
        self.failed = false;
        Ok(response)
    }

    pub fn discard(mut self) {
        self.failed = true;
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        let reusable = !self.failed && pooled.conn.is_reusable();
        lock_unpoisoned(&self.pool.state).checkin(pooled, reusable);
    }
}

impl std::fmt::Debug for AsyncPooledConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncPooledConnection")
            .field("destination", &self.pool.destination)
            .field("connection_id", &self.connection_id())
            .field("reused", &self.reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::{HeaderMap, StatusCode};
    use tokio::sync::Notify;

    use super::AsyncSlotPool;
    use crate::config::{BlockingPolicy, PoolConfig};
    use crate::destination::Destination;
    use crate::error::ErrorCode;
    use crate::transport::{AsyncConnection, AsyncTransportFactory, WireRequest, WireResponse};

    #[derive(Default)]
    struct CountingTransport {
        opened: AtomicUsize,
    }

    struct EchoConnection;

    impl AsyncConnection for EchoConnection {
        fn send<'a>(
            &'a mut self,
            _request: &'a WireRequest,
            _timeout: Duration,
        ) -> BoxFuture<'a, io::Result<WireResponse>> {
            Box::pin(async {
                Ok(WireResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                })
            })
        }

        fn is_reusable(&self) -> bool {
            true
        }
    }

    impl AsyncTransportFactory for CountingTransport {
        fn connect<'a>(
            &'a self,
            _destination: &'a Destination,
            _timeout: Duration,
        ) -> BoxFuture<'a, io::Result<Box<dyn AsyncConnection>>> {
            Box::pin(async move {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(EchoConnection) as Box<dyn AsyncConnection>)
            })
        }
    }

    #[derive(Default)]
    struct GatedTransport {
        entered: Notify,
        release: Notify,
    }

    impl AsyncTransportFactory for GatedTransport {
        fn connect<'a>(
            &'a self,
            _destination: &'a Destination,
            _timeout: Duration,
        ) -> BoxFuture<'a, io::Result<Box<dyn AsyncConnection>>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(Box::new(EchoConnection) as Box<dyn AsyncConnection>)
            })
        }
    }

    fn pool(max_size: usize, policy: BlockingPolicy) -> (AsyncSlotPool, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let pool = AsyncSlotPool::new(
            Destination::parse("http://pool.test/").expect("destination"),
            PoolConfig::default()
                .with_max_size(max_size)
                .with_blocking_policy(policy),
            transport.clone(),
        );
        (pool, transport)
    }

    async fn wait_for_waiters(pool: &AsyncSlotPool, count: usize) {
        for _ in 0..500 {
            if pool.status().waiting == count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} waiters, status {:?}", pool.status());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connection_is_reused_after_release() {
        let (pool, transport) = pool(1, BlockingPolicy::FailFast);
        let first = pool.acquire().await.expect("acquire");
        let id = first.connection_id();
        drop(first);
        let second = pool.acquire().await.expect("acquire");
        assert!(second.is_reused());
        assert_eq!(second.connection_id(), id);
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fail_fast_does_not_suspend() {
        let (pool, _) = pool(1, BlockingPolicy::FailFast);
        let _held = pool.acquire().await.expect("acquire");
        let error = pool.acquire().await.expect_err("exhausted");
        assert_eq!(error.code(), ErrorCode::PoolExhausted);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waiters_resume_in_fifo_order() {
        let (pool, _) = pool(1, BlockingPolicy::Block);
        let held = pool.acquire().await.expect("acquire");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for index in 0..4 {
            let worker = pool.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let connection = worker.acquire().await.expect("queued acquire");
                order.lock().expect("order lock").push(index);
                drop(connection);
            }));
            wait_for_waiters(&pool, index + 1).await;
        }

        drop(held);
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2, 3]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_waiter_does_not_leak_the_grant() {
        let (pool, transport) = pool(1, BlockingPolicy::Block);
        let held = pool.acquire().await.expect("acquire");
        let error = pool
            .acquire_timeout(Duration::from_millis(20))
            .await
            .expect_err("timed out");
        assert_eq!(error.code(), ErrorCode::AcquireTimeout);

        drop(held);
        let status = pool.status();
        assert_eq!((status.live, status.idle), (1, 1));
        let again = pool.acquire().await.expect("acquire after timeout");
        assert!(again.is_reused());
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_fails_pending_and_future_acquires() {
        let (pool, _) = pool(1, BlockingPolicy::Block);
        let held = pool.acquire().await.expect("acquire");
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        wait_for_waiters(&pool, 1).await;

        pool.close();
        let error = waiter.await.expect("task").expect_err("closed");
        assert_eq!(error.code(), ErrorCode::PoolClosed);
        assert_eq!(
            pool.acquire().await.expect_err("closed").code(),
            ErrorCode::PoolClosed
        );
        drop(held);
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_during_connect_discards_the_new_connection() {
        let transport = Arc::new(GatedTransport::default());
        let pool = AsyncSlotPool::new(
            Destination::parse("http://pool.test/").expect("destination"),
            PoolConfig::default().with_max_size(1),
            transport.clone(),
        );

        let acquiring = {
            let worker = pool.clone();
            tokio::spawn(async move {
                worker
                    .acquire()
                    .await
                    .map(|connection| connection.connection_id())
            })
        };
        transport.entered.notified().await;
        pool.close();
        transport.release.notify_one();

        let error = acquiring
            .await
            .expect("task")
            .expect_err("pool closed while connecting");
        assert_eq!(error.code(), ErrorCode::PoolClosed);
        let status = pool.status();
        assert_eq!((status.live, status.idle, status.closed), (0, 0, true));
    }
}
