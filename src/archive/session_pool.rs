use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Condvar, Mutex};

use anyhow::Error;

use staf_api_types::{ArchiveAccessMode, StafConfiguration};

use super::ArchiveError;

/// Identifies a reserved session slot inside one [SessionPool]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PoolState {
    reserved: BTreeSet<SessionId>,
    next_id: u64,
    next_ticket: u64,
    // tickets of blocked requests, served in FIFO order
    queue: VecDeque<u64>,
}

/// Bounded set of archive sessions for one access mode
///
/// Blocking requests are queued and served in arrival order. A
/// non-blocking request never takes a slot while a blocking request
/// waits for one.
pub struct SessionPool {
    mode: ArchiveAccessMode,
    capacity: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl SessionPool {
    pub fn new(mode: ArchiveAccessMode, capacity: usize) -> Self {
        Self {
            mode,
            capacity,
            state: Mutex::new(PoolState {
                reserved: BTreeSet::new(),
                next_id: 1,
                next_ticket: 0,
                queue: VecDeque::new(),
            }),
            released: Condvar::new(),
        }
    }

    pub fn mode(&self) -> ArchiveAccessMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently reserved sessions.
    pub fn reserved(&self) -> usize {
        self.state.lock().unwrap().reserved.len()
    }

    /// Number of blocked requests.
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn free_slots(&self, state: &PoolState) -> usize {
        self.capacity.saturating_sub(state.reserved.len())
    }

    fn take(state: &mut PoolState, count: usize) -> Vec<SessionId> {
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            let id = SessionId(state.next_id);
            state.next_id += 1;
            state.reserved.insert(id);
            list.push(id);
        }
        list
    }

    /// Reserve up to `count` sessions.
    ///
    /// Non-blocking requests return what is available right now, which may
    /// be nothing. Blocking requests wait until at least one session is
    /// free, then return as many as are available (up to `count`).
    pub fn reserve_many(&self, count: usize, blocking: bool) -> Vec<SessionId> {
        if count == 0 {
            return Vec::new();
        }

        let mut state = self.state.lock().unwrap();

        if !blocking {
            if !state.queue.is_empty() {
                return Vec::new();
            }
            let count = count.min(self.free_slots(&state));
            return Self::take(&mut state, count);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        while state.queue.front() != Some(&ticket) || self.free_slots(&state) == 0 {
            state = self.released.wait(state).unwrap();
        }
        state.queue.pop_front();

        let count = count.min(self.free_slots(&state));
        let list = Self::take(&mut state, count);

        // the next waiter may get the remaining slots
        self.released.notify_all();

        log::debug!("reserved {} {} session(s)", list.len(), self.mode);

        list
    }

    pub fn reserve_one(&self, blocking: bool) -> Option<SessionId> {
        self.reserve_many(1, blocking).pop()
    }

    pub fn release(&self, id: SessionId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.reserved.remove(&id) {
            return Err(ArchiveError::SessionNotReserved(id).into());
        }
        self.released.notify_all();
        Ok(())
    }

    /// Drop all reservations (waiting requests stay queued).
    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.reserved.clear();
        self.released.notify_all();
    }
}

/// Releases the session when dropped
pub struct SessionGuard<'a> {
    pool: &'a SessionPool,
    id: SessionId,
}

impl SessionGuard<'_> {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.pool.release(self.id) {
            log::warn!("releasing {} session failed - {}", self.pool.mode(), err);
        }
    }
}

/// Session pools for both access modes
///
/// Created once (usually from the [StafConfiguration]) and shared by all
/// controllers using an `Arc`.
pub struct SessionPoolManager {
    archiving: SessionPool,
    restitution: SessionPool,
}

impl SessionPoolManager {
    pub fn new(config: &StafConfiguration) -> Self {
        Self::with_capacity(
            config
                .session_limits(ArchiveAccessMode::Archiving)
                .max_sessions,
            config
                .session_limits(ArchiveAccessMode::Restitution)
                .max_sessions,
        )
    }

    pub fn with_capacity(archiving: usize, restitution: usize) -> Self {
        Self {
            archiving: SessionPool::new(ArchiveAccessMode::Archiving, archiving),
            restitution: SessionPool::new(ArchiveAccessMode::Restitution, restitution),
        }
    }

    pub fn pool(&self, mode: ArchiveAccessMode) -> &SessionPool {
        match mode {
            ArchiveAccessMode::Archiving => &self.archiving,
            ArchiveAccessMode::Restitution => &self.restitution,
        }
    }

    pub fn reserve_one(&self, mode: ArchiveAccessMode, blocking: bool) -> Option<SessionId> {
        self.pool(mode).reserve_one(blocking)
    }

    pub fn reserve_many(
        &self,
        count: usize,
        mode: ArchiveAccessMode,
        blocking: bool,
    ) -> Vec<SessionId> {
        self.pool(mode).reserve_many(count, blocking)
    }

    pub fn release(&self, id: SessionId, mode: ArchiveAccessMode) -> Result<(), Error> {
        self.pool(mode).release(id)
    }

    pub fn release_all(&self) {
        self.archiving.release_all();
        self.restitution.release_all();
    }

    /// Wait for a session and return a guard releasing it on drop.
    pub fn reserve_session(&self, mode: ArchiveAccessMode) -> SessionGuard<'_> {
        let pool = self.pool(mode);
        loop {
            // a blocking request always returns at least one session
            if let Some(id) = pool.reserve_one(true) {
                return SessionGuard { pool, id };
            }
        }
    }
}
