use std::collections::VecDeque;

use serde::Serialize;

use crate::config::{BlockingPolicy, PoolConfig};

/// A connection together with the id it was assigned when opened.
#[derive(Debug)]
pub(crate) struct Pooled<C> {
    pub(crate) id: u64,
    pub(crate) conn: C,
}

/// What a waiter receives when a slot frees up: either a live connection or
/// the right to open a new one (the slot is already counted as live).
#[derive(Debug)]
pub(crate) enum Grant<C> {
    Reuse(Pooled<C>),
    Create,
}

#[derive(Debug)]
pub(crate) enum Checkout<C> {
    Reuse(Pooled<C>),
    Create,
    Wait,
    Closed,
    Exhausted,
}

pub(crate) trait Waiter<C>: Sized {
    /// Hands `grant` to the waiting caller. A caller that already gave up
    /// gives the grant back so it can go to the next waiter.
    fn wake(self, grant: Grant<C>) -> Result<(), Grant<C>>;

    fn close(self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
    pub closed: bool,
}

/// Slot bookkeeping shared by the blocking and async pools. Callers hold it
/// behind a mutex; nothing here blocks or awaits.
///
/// Invariants: `live <= max_size`, `idle.len() <= live`, and once `closed`
/// no checkout ever yields a connection again.
#[derive(Debug)]
pub(crate) struct SlotState<C, W> {
    max_size: usize,
    policy: BlockingPolicy,
    live: usize,
    next_id: u64,
    idle: VecDeque<Pooled<C>>,
    waiters: VecDeque<W>,
    closed: bool,
}

impl<C, W: Waiter<C>> SlotState<C, W> {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            policy: config.blocking_policy,
            live: 0,
            next_id: 0,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            closed: false,
        }
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn checkout(&mut self) -> Checkout<C> {
        if self.closed {
            return Checkout::Closed;
        }
        if let Some(pooled) = self.idle.pop_back() {
            return Checkout::Reuse(pooled);
        }
        if self.live < self.max_size {
            self.live += 1;
            return Checkout::Create;
        }
        match self.policy {
            BlockingPolicy::FailFast => Checkout::Exhausted,
            BlockingPolicy::Block => Checkout::Wait,
        }
    }

    pub(crate) fn push_waiter(&mut self, waiter: W) {
        self.waiters.push_back(waiter);
    }

    pub(crate) fn retain_waiters(&mut self, keep: impl FnMut(&W) -> bool) {
        self.waiters.retain(keep);
    }

    pub(crate) fn next_connection_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Returns a checked-out connection. Connections that cannot carry
    /// another request are dropped and their slot is passed on instead.
    pub(crate) fn checkin(&mut self, pooled: Pooled<C>, reusable: bool) {
        if reusable {
            self.restore(Grant::Reuse(pooled));
        } else {
            drop(pooled);
            self.restore(Grant::Create);
        }
    }

    /// Gives a slot back: a reserved `Create` whose connect failed, or any
    /// grant a caller abandoned.
    pub(crate) fn restore(&mut self, grant: Grant<C>) {
        if self.closed {
            drop(grant);
            self.live = self.live.saturating_sub(1);
            return;
        }

        let mut grant = grant;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.wake(grant) {
                Ok(()) => return,
                Err(returned) => grant = returned,
            }
        }
        match grant {
            Grant::Reuse(pooled) => self.idle.push_back(pooled),
            Grant::Create => self.live = self.live.saturating_sub(1),
        }
    }

    /// Marks the pool closed, drops idle connections and fails every waiter.
    /// Returns how many idle connections were closed.
    pub(crate) fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        let drained = self.idle.len();
        self.idle.clear();
        self.live = self.live.saturating_sub(drained);
        for waiter in self.waiters.drain(..) {
            waiter.close();
        }
        drained
    }

    pub(crate) fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.max_size,
            live: self.live,
            idle: self.idle.len(),
            waiting: self.waiters.len(),
            closed: self.closed,
        }
    }
}
