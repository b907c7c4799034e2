//! # Barrier
//!
//! Rendezvous point for the lanes of one iteration. No lane may start a timed phase until every
//! lane has arrived, which bounds the measurement window to the time all lanes are actually
//! running together. The barrier is generation counted so one instance serves every phase of an
//! iteration.
//!
//! There is deliberately no timeout: a lane that never arrives stalls the run instead of silently
//! skewing the timing. The only escape hatch is [`Barrier::abort`], used by the driver when a lane
//! could not even be created.
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug)]
struct State {
    arrived: usize,
    generation: u64,
    /// Whether every arrival of the current generation voted ok so far
    all_ok: bool,
    /// Vote outcome of the last released generation
    last_outcome: bool,
    aborted: bool,
}

/// Reusable barrier releasing `parties` waiters at once
#[derive(Debug)]
pub struct Barrier {
    parties: usize,
    state: Mutex<State>,
    cvar: Condvar,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Barrier {
            parties,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
                all_ok: true,
                last_outcome: true,
                aborted: false,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until all parties have called `wait` (or `vote`) on the current generation.
    pub fn wait(&self) {
        self.arrive(true);
    }

    /// Like [`Barrier::wait`], but every party also reports whether it is ready. Returns `true`
    /// only if all parties of this generation voted `ok` and the barrier was not aborted.
    ///
    /// Lanes vote after setting up their memory, so a lane whose allocation failed still arrives
    /// and its siblings can skip the timed phases instead of waiting forever.
    pub fn vote(&self, ok: bool) -> bool {
        self.arrive(ok)
    }

    /// Release every current and future waiter. After this `wait` returns immediately and `vote`
    /// returns `false`.
    pub fn abort(&self) {
        let mut state = self.lock();
        state.aborted = true;
        self.cvar.notify_all();
    }

    /// Number of generations released so far
    pub fn releases(&self) -> u64 {
        self.lock().generation
    }

    fn arrive(&self, ok: bool) -> bool {
        let mut state = self.lock();
        if state.aborted {
            return false;
        }

        state.all_ok &= ok;
        state.arrived += 1;

        if state.arrived < self.parties {
            let generation = state.generation;
            while state.generation == generation && !state.aborted {
                state = self
                    .cvar
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.generation == generation {
                // woken by abort before the generation completed
                return false;
            }
            state.last_outcome
        } else {
            // last arrival: publish the outcome and open the next generation
            let outcome = state.all_ok;
            state.last_outcome = outcome;
            state.arrived = 0;
            state.all_ok = true;
            state.generation += 1;
            self.cvar.notify_all();
            outcome
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state stays consistent even if a holder panicked, every update is a single step
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_party_never_blocks() {
        let barrier = Barrier::new(1);
        barrier.wait();
        barrier.wait();
        assert_eq!(barrier.releases(), 2);
    }

    #[test]
    fn nobody_leaves_before_everyone_arrives() {
        const PARTIES: usize = 6;
        let barrier = Barrier::new(PARTIES);
        let arrived = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..PARTIES {
                s.spawn(|| {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    barrier.wait();
                    assert_eq!(arrived.load(Ordering::SeqCst), PARTIES);
                });
            }
        });
        assert_eq!(barrier.releases(), 1);
    }

    #[test]
    fn reusable_across_phases() {
        const PARTIES: usize = 4;
        const PHASES: usize = 25;
        let barrier = Barrier::new(PARTIES);
        let counter = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..PARTIES {
                s.spawn(|| {
                    for phase in 0..PHASES {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait();
                        // every party has finished this phase's increment
                        assert!(counter.load(Ordering::SeqCst) >= (phase + 1) * PARTIES);
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(barrier.releases(), (PHASES * 2) as u64);
    }

    #[test]
    fn failed_vote_is_seen_by_all() {
        const PARTIES: usize = 3;
        let barrier = Barrier::new(PARTIES);

        let outcomes: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..PARTIES)
                .map(|id| {
                    let barrier = &barrier;
                    s.spawn(move || barrier.vote(id != 1))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outcomes, vec![false; PARTIES]);

        // the next generation starts clean
        let outcomes: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..PARTIES)
                .map(|_| {
                    let barrier = &barrier;
                    s.spawn(move || barrier.vote(true))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outcomes, vec![true; PARTIES]);
    }

    #[test]
    fn abort_releases_parked_waiter() {
        let barrier = Barrier::new(2);
        thread::scope(|s| {
            let waiter = s.spawn(|| barrier.vote(true));
            thread::sleep(Duration::from_millis(20));
            barrier.abort();
            assert!(!waiter.join().unwrap());
        });
        // later arrivals do not block either
        barrier.wait();
        assert!(!barrier.vote(true));
        assert_eq!(barrier.releases(), 0);
    }
}
