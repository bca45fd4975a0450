// Session pool tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Error;

use staf_api_types::ArchiveAccessMode;

use super::*;
use crate::archive::{ArchiveError, SessionPool};

#[test]
fn test_session_capacity() -> Result<(), Error> {
    let pool = SessionPool::new(ArchiveAccessMode::Archiving, 3);

    let list = pool.reserve_many(5, false);
    assert_eq!(list.len(), 3);
    assert_eq!(pool.reserved(), 3);

    // nothing left
    assert!(pool.reserve_one(false).is_none());
    assert!(pool.reserve_many(2, false).is_empty());

    pool.release(list[0])?;
    assert_eq!(pool.reserved(), 2);

    let id = pool.reserve_one(false);
    assert!(id.is_some());
    assert_ne!(id, Some(list[0]));

    pool.release_all();
    assert_eq!(pool.reserved(), 0);
    assert!(pool.reserve_many(0, false).is_empty());

    Ok(())
}

#[test]
fn test_release_unknown_session() -> Result<(), Error> {
    let pool = SessionPool::new(ArchiveAccessMode::Restitution, 1);

    let id = pool
        .reserve_one(false)
        .ok_or_else(|| anyhow::format_err!("no session"))?;
    pool.release(id)?;

    let err = match pool.release(id) {
        Ok(()) => anyhow::bail!("double release not detected"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::SessionNotReserved(_))
    ));

    Ok(())
}

#[test]
fn test_manager_modes_are_independent() -> Result<(), Error> {
    let manager = SessionPoolManager::with_capacity(1, 2);

    let archiving = manager.reserve_one(ArchiveAccessMode::Archiving, false);
    assert!(archiving.is_some());
    assert!(manager
        .reserve_one(ArchiveAccessMode::Archiving, false)
        .is_none());

    let restitution = manager.reserve_many(5, ArchiveAccessMode::Restitution, false);
    assert_eq!(restitution.len(), 2);

    for id in restitution {
        manager.release(id, ArchiveAccessMode::Restitution)?;
    }
    assert_eq!(manager.pool(ArchiveAccessMode::Restitution).reserved(), 0);
    assert_eq!(manager.pool(ArchiveAccessMode::Archiving).reserved(), 1);

    {
        let _guard = manager.reserve_session(ArchiveAccessMode::Restitution);
        assert_eq!(manager.pool(ArchiveAccessMode::Restitution).reserved(), 1);
    }
    assert_eq!(manager.pool(ArchiveAccessMode::Restitution).reserved(), 0);

    manager.release_all();
    assert_eq!(manager.pool(ArchiveAccessMode::Archiving).reserved(), 0);

    Ok(())
}

fn wait_for_waiters(pool: &SessionPool, count: usize) {
    for _ in 0..500 {
        if pool.waiting() >= count {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("expected {} waiting requests", count);
}

#[test]
fn test_blocking_reserve() -> Result<(), Error> {
    let pool = Arc::new(SessionPool::new(ArchiveAccessMode::Archiving, 1));

    let id = pool
        .reserve_one(false)
        .ok_or_else(|| anyhow::format_err!("no session"))?;

    let (tx, rx) = mpsc::channel();
    let worker = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let list = pool.reserve_many(3, true);
            tx.send(list.len()).unwrap();
        })
    };

    wait_for_waiters(&pool, 1);

    // still waiting
    assert!(rx.try_recv().is_err());

    pool.release(id)?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 1);
    worker.join().unwrap();

    assert_eq!(pool.reserved(), 1);
    assert_eq!(pool.waiting(), 0);

    Ok(())
}

#[test]
fn test_blocking_fifo_order() -> Result<(), Error> {
    let pool = Arc::new(SessionPool::new(ArchiveAccessMode::Archiving, 1));

    let id = pool
        .reserve_one(false)
        .ok_or_else(|| anyhow::format_err!("no session"))?;

    let (tx, rx) = mpsc::channel();
    let mut workers = Vec::new();
    for nr in 0..3 {
        let pool = Arc::clone(&pool);
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            let list = pool.reserve_many(1, true);
            tx.send(nr).unwrap();
            thread::sleep(Duration::from_millis(20));
            for id in list {
                pool.release(id).unwrap();
            }
        }));
        // make sure the requests queue up in order
        wait_for_waiters(&pool, nr + 1);
    }

    // queued requests win against new non-blocking ones
    assert!(pool.reserve_one(false).is_none());

    pool.release(id)?;

    let order: Vec<usize> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)))
        .collect::<Result<_, _>>()?;
    assert_eq!(order, vec![0, 1, 2]);

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(pool.reserved(), 0);

    Ok(())
}

#[test]
fn test_concurrent_reservations() -> Result<(), Error> {
    let pool = Arc::new(SessionPool::new(ArchiveAccessMode::Restitution, 2));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..10 {
                    let list = pool.reserve_many(1, true);
                    assert_eq!(list.len(), 1);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    active.fetch_sub(1, Ordering::SeqCst);
                    pool.release(list[0]).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.reserved(), 0);
    assert_eq!(pool.waiting(), 0);

    Ok(())
}
