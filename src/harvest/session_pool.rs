//! Fixed-size pool of browser sessions
//!
//! This module provides:
//! 1. Eager creation of `size` sessions, tolerating partial failure
//! 2. Polling acquire with a timeout, returning `None` instead of failing
//! 3. Leases that hand the session back on drop
//! 4. Idempotent bulk shutdown and waiting for outstanding leases

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::harvest::browser::{BrowserSession, DriverHandle, SessionFactory};

/// How often `acquire` and `wait_for_all_released` re-check the pool
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No browser session could be created (requested {requested})")]
    NoSessions { requested: usize },
}

pub type PoolResult<T> = Result<T, PoolError>;

struct PoolEntry<S> {
    id: usize,
    session: Arc<S>,
    created_at: Instant,
    busy: bool,
}

struct PoolState<S> {
    entries: Vec<PoolEntry<S>>,
    closed: bool,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub busy: usize,
    pub available: usize,
}

/// Shared pool of sessions. Cloning gives another handle to the same pool.
pub struct SessionPool<S> {
    state: Arc<Mutex<PoolState<S>>>,
}

impl<S> Clone for SessionPool<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: BrowserSession> SessionPool<S> {
    /// Creates `size` sessions concurrently. Fails only if none could be created.
    pub async fn new<F>(factory: &F, size: usize) -> PoolResult<Self>
    where
        F: SessionFactory<Session = S>,
    {
        let results = join_all((0..size).map(|id| factory.create(id))).await;

        let mut entries = Vec::with_capacity(size);
        for (id, result) in results.into_iter().enumerate() {
            match result {
                Ok(session) => entries.push(PoolEntry {
                    id,
                    session: Arc::new(session),
                    created_at: Instant::now(),
                    busy: false,
                }),
                Err(e) => error!("Failed to create browser session {}: {}", id, e),
            }
        }

        if entries.is_empty() {
            return Err(PoolError::NoSessions { requested: size });
        }
        if entries.len() < size {
            warn!(
                "Session pool running with {} of {} requested sessions",
                entries.len(),
                size
            );
        } else {
            info!("Session pool ready with {} sessions", entries.len());
        }

        Ok(Self::from_entries(entries))
    }

    fn from_entries(entries: Vec<PoolEntry<S>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                entries,
                closed: false,
            })),
        }
    }

    /// Waits until a session is free or `timeout` elapses
    pub async fn acquire(&self, timeout: Duration) -> Option<SessionLease<S>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((id, session)) = self.try_acquire() {
                debug!("Acquired browser session {}", id);
                return Some(SessionLease {
                    id,
                    session,
                    pool: self.clone(),
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline || self.state.lock().closed {
                return None;
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn try_acquire(&self) -> Option<(usize, Arc<S>)> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let entry = state.entries.iter_mut().find(|entry| !entry.busy)?;
        entry.busy = true;
        Some((entry.id, Arc::clone(&entry.session)))
    }

    /// Marks session `id` as available again
    pub fn release(&self, id: usize) {
        let mut state = self.state.lock();
        match state.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) if entry.busy => {
                entry.busy = false;
                debug!("Released browser session {}", id);
            }
            Some(_) => warn!("Browser session {} released while not in use", id),
            None => debug!("Released browser session {} after the pool was closed", id),
        }
    }

    /// Quits every session and empties the pool. Safe to call more than once.
    pub async fn close_all(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        if entries.is_empty() {
            return;
        }

        info!("Closing {} browser sessions", entries.len());
        let closing = entries.into_iter().map(|entry| async move {
            let age = entry.created_at.elapsed();
            if let Err(e) = entry.session.quit().await {
                warn!("Failed to close browser session {}: {}", entry.id, e);
            } else {
                debug!("Closed browser session {} after {:?}", entry.id, age);
            }
        });
        join_all(closing).await;
    }

    /// Polls until no session is busy. Returns false on timeout.
    pub async fn wait_for_all_released(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self.status().busy;
            if busy == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("{} browser sessions still in use after {:?}", busy, timeout);
                return false;
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let busy = state.entries.iter().filter(|entry| entry.busy).count();
        PoolStatus {
            total: state.entries.len(),
            busy,
            available: state.entries.len() - busy,
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// A borrowed session. Returned to the pool when released or dropped.
pub struct SessionLease<S: BrowserSession> {
    id: usize,
    session: Arc<S>,
    pool: SessionPool<S>,
    released: bool,
}

impl<S: BrowserSession> SessionLease<S> {
    pub fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub fn session(&self) -> &S {
        &self.session
    }

    /// A handle whose `close` leaves the pooled session running
    pub fn handle(&self) -> DriverHandle<S> {
        DriverHandle::Borrowed(Arc::clone(&self.session))
    }

    pub fn release(mut self) {
        self.released = true;
        self.pool.release(self.id);
    }
}

impl<S: BrowserSession> Drop for SessionLease<S> {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(self.id);
        }
    }
}
