//! Per-identity pool of idle agent connections.
//!
//! A pool is a bounded FIFO queue. Agents contribute connections at the tail
//! (suspending while the pool is full) and relays acquire from the head
//! (suspending while it is empty). Suspended acquirers are served in arrival
//! order: a contributed connection is handed straight to the oldest waiter,
//! so no later caller can overtake an earlier one.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::debug;

/// Default maximum idle connections per identity.
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// Largest capacity a pool can track.
pub const MAX_POOL_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// The pool was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection pool closed")]
pub struct PoolClosed;

/// A pooled item that owns a transport which must be shut down when the
/// item is discarded without being used.
#[async_trait]
pub trait Closable: Send + 'static {
    async fn close(self);
}

struct Slots<C> {
    idle: VecDeque<C>,
    waiters: VecDeque<oneshot::Sender<C>>,
    closed: bool,
}

/// A bounded FIFO of idle connections for one identity.
pub struct Pool<C> {
    identity: String,
    capacity: usize,
    slots: Mutex<Slots<C>>,
    /// One permit per free slot. Taken by `contribute`, returned once the
    /// connection leaves the pool.
    vacancies: Semaphore,
}

impl<C: Send> Pool<C> {
    /// Create a pool with the default capacity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self::with_capacity(identity, DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool holding at most `capacity` idle connections, clamped
    /// to `1..=MAX_POOL_CAPACITY`.
    pub fn with_capacity(identity: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_POOL_CAPACITY);
        Self {
            identity: identity.into(),
            capacity,
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(capacity.min(16)),
                waiters: VecDeque::new(),
                closed: false,
            }),
            vacancies: Semaphore::new(capacity),
        }
    }

    /// Identity this pool serves.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Maximum number of idle connections.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle connections currently queued.
    pub fn idle_count(&self) -> usize {
        self.slots().idle.len()
    }

    /// Whether the pool was torn down.
    pub fn is_closed(&self) -> bool {
        self.slots().closed
    }

    /// Append a connection, suspending while the pool is full.
    pub async fn contribute(&self, conn: C) -> Result<(), PoolClosed> {
        let vacancy = self.vacancies.acquire().await.map_err(|_| PoolClosed)?;
        vacancy.forget();

        let mut slots = self.slots();
        if slots.closed {
            return Err(PoolClosed);
        }
        self.offer(&mut slots, conn, false);
        debug!(
            identity = %self.identity,
            idle = slots.idle.len(),
            "Connection contributed"
        );
        Ok(())
    }

    /// Remove and return the head connection, suspending until one exists.
    ///
    /// Cancel-safe: dropping the returned future never loses a connection.
    pub async fn acquire(&self) -> Result<C, PoolClosed> {
        let rx = {
            let mut slots = self.slots();
            if slots.closed {
                return Err(PoolClosed);
            }
            if let Some(conn) = slots.idle.pop_front() {
                drop(slots);
                self.vacancies.add_permits(1);
                return Ok(conn);
            }
            slots.waiters.retain(|tx| !tx.is_closed());
            let (tx, rx) = oneshot::channel();
            slots.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter { pool: self, rx };
        let conn = (&mut waiter.rx).await.map_err(|_| PoolClosed)?;
        self.vacancies.add_permits(1);
        Ok(conn)
    }

    /// Remove every idle connection without blocking.
    pub fn drain(&self) -> Vec<C> {
        let drained: Vec<C> = self.slots().idle.drain(..).collect();
        self.vacancies.add_permits(drained.len());
        drained
    }

    /// Tear the pool down. Suspended and future callers fail with
    /// [`PoolClosed`]; the idle connections are returned to the caller.
    pub fn close(&self) -> Vec<C> {
        let mut slots = self.slots();
        slots.closed = true;
        slots.waiters.clear();
        self.vacancies.close();
        slots.idle.drain(..).collect()
    }

    /// Hand `conn` to the oldest live waiter, or queue it.
    fn offer(&self, slots: &mut Slots<C>, mut conn: C, front: bool) {
        while let Some(waiter) = slots.waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => return,
                Err(returned) => conn = returned,
            }
        }
        if front {
            slots.idle.push_front(conn);
        } else {
            slots.idle.push_back(conn);
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<C>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A suspended `acquire`. If dropped after a connection was handed over but
/// before it was received, the connection goes back to the head of the pool.
struct Waiter<'a, C: Send> {
    pool: &'a Pool<C>,
    rx: oneshot::Receiver<C>,
}

impl<C: Send> Drop for Waiter<'_, C> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(conn) = self.rx.try_recv() {
            let mut slots = self.pool.slots();
            if !slots.closed {
                self.pool.offer(&mut slots, conn, true);
            }
        }
    }
}
