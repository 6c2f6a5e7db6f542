use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::PoolConfig;
use crate::destination::Destination;
use crate::error::Error;
use crate::pool::{Checkout, Grant, PoolStatus, Pooled, SlotState, Waiter};
use crate::registry::ManagedPool;
use crate::transport::{Connection, TransportFactory, WireRequest, WireResponse};
use crate::util::lock_unpoisoned;

type Conn = Box<dyn Connection>;

#[derive(Debug)]
enum WaiterSlot {
    Waiting,
    Ready(Grant<Conn>),
    Closed,
    Abandoned,
}

#[derive(Debug)]
struct BlockingWaiter {
    slot: Mutex<WaiterSlot>,
    condvar: Condvar,
}

impl BlockingWaiter {
    fn new() -> Self {
        Self {
            slot: Mutex::new(WaiterSlot::Waiting),
            condvar: Condvar::new(),
        }
    }
}

impl Waiter<Conn> for Arc<BlockingWaiter> {
    fn wake(self, grant: Grant<Conn>) -> Result<(), Grant<Conn>> {
        let mut slot = lock_unpoisoned(&self.slot);
        if matches!(*slot, WaiterSlot::Abandoned) {
            return Err(grant);
        }
        *slot = WaiterSlot::Ready(grant);
        self.condvar.notify_one();
        Ok(())
    }

    fn close(self) {
        let mut slot = lock_unpoisoned(&self.slot);
        if matches!(*slot, WaiterSlot::Waiting) {
            *slot = WaiterSlot::Closed;
        }
        self.condvar.notify_one();
    }
}

struct PoolInner {
    destination: Destination,
    connect_timeout: Duration,
    transport: Arc<dyn TransportFactory>,
    state: Mutex<SlotState<Conn, Arc<BlockingWaiter>>>,
}

/// Bounded set of connections to one destination, shared between threads.
/// Cloning is cheap and every clone refers to the same slots.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    pub fn new(
        destination: Destination,
        config: PoolConfig,
        transport: Arc<dyn TransportFactory>,
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

    /// Checks out a connection. Under `BlockingPolicy::Block` this parks the
    /// thread until a slot frees up, with no upper bound.
    pub fn acquire(&self) -> Result<PooledConnection, Error> {
        self.acquire_until(None)
    }

    /// Like `acquire`, but gives up with `Error::AcquireTimeout` once
    /// `timeout` has passed without a slot.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection, Error> {
        self.acquire_until(Some((Instant::now() + timeout, timeout)))
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

    fn acquire_until(
        &self,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<PooledConnection, Error> {
        let waiter = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match state.checkout() {
                Checkout::Reuse(pooled) => return Ok(self.guard(pooled, true)),
                Checkout::Create => None,
                Checkout::Wait => {
                    let waiter = Arc::new(BlockingWaiter::new());
                    state.push_waiter(Arc::clone(&waiter));
                    Some(waiter)
                }
                Checkout::Closed => return Err(self.closed_error()),
                Checkout::Exhausted => {
                    return Err(Error::PoolExhausted {
                        destination: self.inner.destination.to_string(),
                        max_size: state.max_size(),
                    });
                }
            }
        };

        let grant = match waiter {
            Some(waiter) => self.wait_for_grant(&waiter, deadline)?,
            None => Grant::Create,
        };
        self.fulfil(grant)
    }

    fn wait_for_grant(
        &self,
        waiter: &Arc<BlockingWaiter>,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Grant<Conn>, Error> {
        let mut slot = lock_unpoisoned(&waiter.slot);
        loop {
            match std::mem::replace(&mut *slot, WaiterSlot::Waiting) {
                WaiterSlot::Ready(grant) => return Ok(grant),
                WaiterSlot::Closed => return Err(self.closed_error()),
                WaiterSlot::Waiting | WaiterSlot::Abandoned => {}
            }

            slot = match deadline {
                None => match waiter.condvar.wait(slot) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Some((deadline_at, timeout)) => {
                    let now = Instant::now();
                    if now >= deadline_at {
                        drop(slot);
                        return Err(self.abandon_wait(waiter, timeout));
                    }
                    match waiter.condvar.wait_timeout(slot, deadline_at - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }

    /// Leaves the wait queue after a timeout. Lock order is pool state, then
    /// waiter slot, the same order `SlotState` uses when waking. A grant that
    /// landed between the timeout and this call goes back to the pool.
    fn abandon_wait(&self, waiter: &Arc<BlockingWaiter>, timeout: Duration) -> Error {
        let mut state = lock_unpoisoned(&self.inner.state);
        let previous = {
            let mut slot = lock_unpoisoned(&waiter.slot);
            std::mem::replace(&mut *slot, WaiterSlot::Abandoned)
        };
        match previous {
            WaiterSlot::Ready(grant) => state.restore(grant),
            WaiterSlot::Closed => return self.closed_error(),
            WaiterSlot::Waiting | WaiterSlot::Abandoned => {
                state.retain_waiters(|queued| !Arc::ptr_eq(queued, waiter));
            }
        }
        Error::AcquireTimeout {
            destination: self.inner.destination.to_string(),
            timeout_ms: timeout.as_millis(),
        }
    }

    fn fulfil(&self, grant: Grant<Conn>) -> Result<PooledConnection, Error> {
        match grant {
            Grant::Reuse(pooled) => Ok(self.guard(pooled, true)),
            Grant::Create => {
                match self
                    .inner
                    .transport
                    .connect(&self.inner.destination, self.inner.connect_timeout)
                {
                    Ok(conn) => {
                        let id = {
                            let mut state = lock_unpoisoned(&self.inner.state);
                            if state.is_closed() {
                                drop(conn);
                                state.restore(Grant::Create);
                                return Err(self.closed_error());
                            }
                            state.next_connection_id()
                        };
                        debug!(
                            destination = %self.inner.destination,
                            connection_id = id,
                            "opened connection"
                        );
                        Ok(self.guard(Pooled { id, conn }, false))
                    }
                    Err(error) => {
                        lock_unpoisoned(&self.inner.state).restore(Grant::Create);
                        Err(Error::connect(error, &self.inner.destination.to_string()))
                    }
                }
            }
        }
    }

    fn guard(&self, pooled: Pooled<Conn>, reused: bool) -> PooledConnection {
        PooledConnection {
            pool: Arc::clone(&self.inner),
            pooled: Some(pooled),
            reused,
            failed: false,
        }
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            destination: self.inner.destination.to_string(),
        }
    }
}

impl ManagedPool for SlotPool {
    fn close(&self) {
        SlotPool::close(self);
    }

    fn status(&self) -> PoolStatus {
        SlotPool::status(self)
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SlotPool")
            .field("destination", &self.inner.destination)
            .field("status", &self.status())
            .finish()
    }
}

/// A checked-out connection. Dropping it hands the connection back to its
/// pool, or closes it when the exchange left it unusable or the pool was
/// closed in the meantime.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    pooled: Option<Pooled<Conn>>,
    reused: bool,
    failed: bool,
}

impl PooledConnection {
    pub fn connection_id(&self) -> u64 {
        self.pooled.as_ref().map_or(0, |pooled| pooled.id)
    }

    /// Whether this connection already served a previous checkout.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn destination(&self) -> &Destination {
        &self.pool.destination
    }

    pub fn send(&mut self, request: &WireRequest, timeout: Duration) -> io::Result<WireResponse> {
        let Some(pooled) = self.pooled.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let result = pooled.conn.send(request, timeout);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Closes the connection instead of returning it for reuse.
    pub fn discard(mut self) {
        self.failed = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        let reusable = !self.failed && pooled.conn.is_reusable();
        lock_unpoisoned(&self.pool.state).checkin(pooled, reusable);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PooledConnection")
            .field("destination", &self.pool.destination)
            .field("connection_id", &self.connection_id())
            .field("reused", &self.reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::SlotPool;
    use crate::config::{BlockingPolicy, PoolConfig};
    use crate::destination::Destination;
    use crate::error::ErrorCode;
    use crate::transport::{Connection, TransportFactory, WireRequest, WireResponse};

    #[derive(Default)]
    struct CountingTransport {
        opened: AtomicUsize,
        refuse: AtomicBool,
    }

    struct EchoConnection;

    impl Connection for EchoConnection {
        fn send(&mut self, _request: &WireRequest, _timeout: Duration) -> io::Result<WireResponse> {
            Ok(WireResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"ok"),
            })
        }

        fn is_reusable(&self) -> bool {
            true
        }
    }

    impl TransportFactory for CountingTransport {
        fn connect(
            &self,
            _destination: &Destination,
            _timeout: Duration,
        ) -> io::Result<Box<dyn Connection>> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoConnection))
        }
    }

    /// Parks inside `connect` until the test has done its work.
    struct GatedTransport {
        entered: Barrier,
        release: Barrier,
    }

    impl TransportFactory for GatedTransport {
        fn connect(
            &self,
            _destination: &Destination,
            _timeout: Duration,
        ) -> io::Result<Box<dyn Connection>> {
            self.entered.wait();
            self.release.wait();
            Ok(Box::new(EchoConnection))
        }
    }

    fn pool(max_size: usize, policy: BlockingPolicy) -> (SlotPool, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let pool = SlotPool::new(
            Destination::parse("http://pool.test/").expect("destination"),
            PoolConfig::default()
                .with_max_size(max_size)
                .with_blocking_policy(policy),
            transport.clone(),
        );
        (pool, transport)
    }

    fn wait_for_waiters(pool: &SlotPool, count: usize) {
        for _ in 0..500 {
            if pool.status().waiting == count {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {count} waiters, status {:?}", pool.status());
    }

    #[test]
    fn released_connection_is_reused_not_reopened() {
        let (pool, transport) = pool(1, BlockingPolicy::FailFast);
        let first = pool.acquire().expect("first acquire");
        let id = first.connection_id();
        assert!(!first.is_reused());
        drop(first);

        let second = pool.acquire().expect("second acquire");
        assert!(second.is_reused());
        assert_eq!(second.connection_id(), id);
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fail_fast_rejects_immediately_when_full() {
        let (pool, _) = pool(1, BlockingPolicy::FailFast);
        let _held = pool.acquire().expect("acquire");
        let error = pool.acquire().expect_err("pool is full");
        assert_eq!(error.code(), ErrorCode::PoolExhausted);
    }

    #[test]
    fn discarded_connection_frees_its_slot() {
        let (pool, transport) = pool(1, BlockingPolicy::FailFast);
        pool.acquire().expect("acquire").discard();
        assert_eq!(pool.status().live, 0);
        let again = pool.acquire().expect("acquire after discard");
        assert!(!again.is_reused());
        assert_eq!(transport.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blocked_waiters_resume_in_arrival_order() {
        let (pool, _) = pool(1, BlockingPolicy::Block);
        let held = pool.acquire().expect("acquire");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..4 {
            let worker = pool.clone();
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let connection = worker.acquire().expect("blocked acquire");
                order.lock().expect("order lock").push(index);
                drop(connection);
            }));
            wait_for_waiters(&pool, index + 1);
        }

        drop(held);
        for handle in handles {
            handle.join().expect("waiter thread");
        }
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2, 3]);
        let status = pool.status();
        assert_eq!((status.live, status.idle, status.waiting), (1, 1, 0));
    }

    #[test]
    fn acquire_timeout_leaves_the_queue() {
        let (pool, _) = pool(1, BlockingPolicy::Block);
        let held = pool.acquire().expect("acquire");
        let error = pool
            .acquire_timeout(Duration::from_millis(30))
            .expect_err("timed out");
        assert_eq!(error.code(), ErrorCode::AcquireTimeout);
        assert_eq!(pool.status().waiting, 0);

        drop(held);
        let status = pool.status();
        assert_eq!((status.live, status.idle), (1, 1));
    }

    #[test]
    fn close_wakes_waiters_and_rejects_forever() {
        let (pool, _) = pool(1, BlockingPolicy::Block);
        let held = pool.acquire().expect("acquire");
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()))
        };
        wait_for_waiters(&pool, 1);

        pool.close();
        let error = waiter
            .join()
            .expect("waiter thread")
            .expect_err("closed while waiting");
        assert_eq!(error.code(), ErrorCode::PoolClosed);
        for _ in 0..3 {
            assert_eq!(
                pool.acquire().expect_err("closed").code(),
                ErrorCode::PoolClosed
            );
        }

        drop(held);
        assert_eq!(pool.status().live, 0);
    }

    #[test]
    fn close_during_connect_discards_the_new_connection() {
        let transport = Arc::new(GatedTransport {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let pool = SlotPool::new(
            Destination::parse("http://pool.test/").expect("destination"),
            PoolConfig::default().with_max_size(1),
            transport.clone(),
        );

        let acquiring = {
            let worker = pool.clone();
            thread::spawn(move || {
                worker
                    .acquire()
                    .map(|connection| connection.connection_id())
            })
        };
        transport.entered.wait();
        pool.close();
        transport.release.wait();

        let error = acquiring
            .join()
            .expect("acquiring thread")
            .expect_err("pool closed while connecting");
        assert_eq!(error.code(), ErrorCode::PoolClosed);
        let status = pool.status();
        assert_eq!((status.live, status.idle, status.closed), (0, 0, true));
    }

    #[test]
    fn failed_connect_returns_the_slot() {
        let (pool, transport) = pool(1, BlockingPolicy::FailFast);
        transport.refuse.store(true, Ordering::SeqCst);
        let error = pool.acquire().expect_err("connect refused");
        assert_eq!(error.code(), ErrorCode::Connect);
        assert_eq!(pool.status().live, 0);

        transport.refuse.store(false, Ordering::SeqCst);
        pool.acquire().expect("acquire after refusal");
    }

    #[test]
    fn concurrent_use_never_exceeds_max_size() {
        let (pool, transport) = pool(3, BlockingPolicy::Block);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let mut connection = pool.acquire().expect("acquire");
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        let request = WireRequest {
                            method: http::Method::GET,
                            target: "/".to_owned(),
                            headers: HeaderMap::new(),
                            body: None,
                        };
                        connection
                            .send(&request, Duration::from_secs(1))
                            .expect("send");
                        in_use.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(transport.opened.load(Ordering::SeqCst) <= 3);
        assert!(pool.status().live <= 3);
    }
}
