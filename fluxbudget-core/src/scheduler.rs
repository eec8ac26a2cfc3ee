//! Parallel tile processing
//!
//! Tiles are dealt round-robin to a fixed number of worker threads: worker `w` gets
//! tiles `w, w + n, w + 2n, ...`. Workers write their output into a shared
//! [`OutputStore`], and synchronise after every tile with the workers that still have
//! tiles left ([`ActiveSetBarrier`]). Once every worker has finished, worker 0 flushes
//! the store.
//!
//! The first error raised by any worker is returned as [`BudgetError::Worker`]. A
//! failing worker still leaves the barrier, so the remaining workers do not deadlock.

use crate::errors::{BudgetError, BudgetResult};
use crate::store::OutputStore;
use crate::tiles::Tile;
use log::{debug, error, info};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Life cycle of one worker
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Assigned,
    Computing,
    Writing,
    Done,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Tracker {
    worker: usize,
    state: WorkerState,
}

impl Tracker {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            state: WorkerState::Idle,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("Worker {}: {} -> {}", self.worker, self.state, next);
        self.state = next;
    }
}

#[derive(Debug)]
struct BarrierState {
    active: BTreeSet<usize>,
    arrived: BTreeSet<usize>,
    leaving: BTreeSet<usize>,
    generation: u64,
}

/// Barrier over a shrinking set of workers.
///
/// A round completes when every active worker has either arrived or left. Workers that
/// arrive with `leaving = true` are removed from the active set when the round
/// completes.
#[derive(Debug)]
pub struct ActiveSetBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl ActiveSetBarrier {
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                active: (0..workers).collect(),
                arrived: BTreeSet::new(),
                leaving: BTreeSet::new(),
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> BudgetResult<MutexGuard<'_, BarrierState>> {
        self.state
            .lock()
            .map_err(|_| BudgetError::InvalidField("barrier lock poisoned".into()))
    }

    fn complete_round(state: &mut BarrierState) -> bool {
        if !state.active.is_subset(&state.arrived) {
            return false;
        }
        for w in std::mem::take(&mut state.leaving) {
            state.active.remove(&w);
        }
        state.arrived.clear();
        state.generation += 1;
        true
    }

    /// Wait for all active workers
    pub fn arrive(&self, worker: usize, leaving: bool) -> BudgetResult<()> {
        let mut state = self.lock()?;
        state.arrived.insert(worker);
        if leaving {
            state.leaving.insert(worker);
        }
        if Self::complete_round(&mut state) {
            self.cond.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation {
            state = self
                .cond
                .wait(state)
                .map_err(|_| BudgetError::InvalidField("barrier lock poisoned".into()))?;
        }
        Ok(())
    }

    /// Leave the active set without waiting
    pub fn leave(&self, worker: usize) -> BudgetResult<()> {
        let mut state = self.lock()?;
        state.active.remove(&worker);
        state.arrived.remove(&worker);
        state.leaving.remove(&worker);
        if !state.active.is_empty() && !state.arrived.is_empty() && Self::complete_round(&mut state) {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Number of workers still taking part
    pub fn active(&self) -> BudgetResult<usize> {
        Ok(self.lock()?.active.len())
    }
}

/// Countdown that releases all waiters once every worker has arrived
struct Rendezvous {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Rendezvous {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn arrive_and_wait(&self) -> BudgetResult<()> {
        let poisoned = |_| BudgetError::InvalidField("join lock poisoned".into());
        let mut remaining = self.remaining.lock().map_err(poisoned)?;
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
            return Ok(());
        }
        while *remaining > 0 {
            remaining = self.cond.wait(remaining).map_err(poisoned)?;
        }
        Ok(())
    }
}

/// Tiles of worker `worker` out of `workers`
pub fn assign(tiles: &[Tile], worker: usize, workers: usize) -> Vec<Tile> {
    tiles
        .iter()
        .skip(worker)
        .step_by(workers.max(1))
        .cloned()
        .collect()
}

fn run_worker<F>(
    worker: usize,
    tiles: Vec<Tile>,
    process: &F,
    barrier: &ActiveSetBarrier,
) -> BudgetResult<()>
where
    F: Fn(&Tile) -> BudgetResult<()> + Sync,
{
    let mut tracker = Tracker::new(worker);
    if tiles.is_empty() {
        barrier.leave(worker)?;
        tracker.transition(WorkerState::Done);
        return Ok(());
    }
    tracker.transition(WorkerState::Assigned);
    let n = tiles.len();
    for (i, tile) in tiles.iter().enumerate() {
        tracker.transition(WorkerState::Computing);
        info!("Worker {}: process tile {}", worker, tile.task);
        if let Err(e) = process(tile) {
            barrier.leave(worker)?;
            tracker.transition(WorkerState::Done);
            return Err(e);
        }
        tracker.transition(WorkerState::Writing);
        barrier.arrive(worker, i == n - 1)?;
    }
    tracker.transition(WorkerState::Done);
    Ok(())
}

/// Process `tiles` with `workers` threads, then flush `store`.
///
/// `process` computes one tile and writes its output into the store.
pub fn run_tiles<F>(
    tiles: &[Tile],
    workers: usize,
    store: &dyn OutputStore,
    process: F,
) -> BudgetResult<()>
where
    F: Fn(&Tile) -> BudgetResult<()> + Sync,
{
    let workers = workers.max(1);
    let barrier = ActiveSetBarrier::new(workers);
    let join = Rendezvous::new(workers);
    let first_error: Mutex<Option<BudgetError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let own = assign(tiles, worker, workers);
            let barrier = &barrier;
            let join = &join;
            let process = &process;
            let first_error = &first_error;
            scope.spawn(move || {
                let result = run_worker(worker, own, process, barrier);
                if let Err(e) = result {
                    error!("Worker {} failed: {}", worker, e);
                    if let Ok(mut slot) = first_error.lock() {
                        if slot.is_none() {
                            *slot = Some(BudgetError::Worker {
                                worker,
                                message: e.to_string(),
                            });
                        }
                    }
                }
                if let Err(e) = join.arrive_and_wait() {
                    error!("Worker {} could not join: {}", worker, e);
                }
            });
        }
    });

    let first_error = first_error
        .into_inner()
        .map_err(|_| BudgetError::InvalidField("error slot poisoned".into()))?;
    if let Some(e) = first_error {
        return Err(e);
    }
    info!("All tiles processed, flush output");
    store.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::field::{Dim, GridAxis};
    use crate::stagger::Periodicity;
    use crate::tiles::create_tiles;
    use ndarray::Array;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiles(n: usize) -> Vec<Tile> {
        let mut coords = BTreeMap::new();
        coords.insert(Dim::X, Array::range(0.5, n as f64, 1.0));
        create_tiles(&coords, &[(GridAxis::X, 1)], Periodicity::default()).unwrap()
    }

    #[test]
    fn test_round_robin_assignment() {
        let all = tiles(7);
        let own: Vec<usize> = assign(&all, 1, 3).iter().map(|t| t.task).collect();
        assert_eq!(own, vec![1, 4]);
        assert!(assign(&all, 2, 10).len() == 1);
        assert!(assign(&all, 8, 10).is_empty());
    }

    #[test]
    fn test_all_tiles_processed_with_idle_workers() {
        let all = tiles(5);
        let count = AtomicUsize::new(0);
        let store = MemoryStore::new();
        run_tiles(&all, 8, &store, |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_worker_error_is_reported() {
        let all = tiles(6);
        let store = MemoryStore::new();
        let err = run_tiles(&all, 3, &store, |tile| {
            if tile.task == 4 {
                Err(BudgetError::missing("RHOD_MEAN"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        match err {
            BudgetError::Worker { worker, message } => {
                assert_eq!(worker, 1);
                assert!(message.contains("RHOD_MEAN"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_barrier_shrinks() {
        let barrier = ActiveSetBarrier::new(2);
        barrier.leave(1).unwrap();
        barrier.arrive(0, false).unwrap();
        assert_eq!(barrier.active().unwrap(), 1);
        barrier.arrive(0, true).unwrap();
        assert_eq!(barrier.active().unwrap(), 0);
    }
}
