//! Scoped coordinator
//!
//! A single-consumer action queue that any thread may feed. `run()` drains
//! the queue on the calling thread and keeps blocking for more work while
//! at least one watched disposable is still live.
//!
//! Design:
//! - Actions in a `VecDeque` behind `Mutex + Condvar`
//! - Watched disposables re-checked after every action
//! - The consumer is woken when the queue goes from empty to non-empty

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::ktrace;

pub type Action = Box<dyn FnOnce() + Send>;

/// Something whose lifetime can be ended explicitly.
pub trait Disposable: Send + Sync {
    fn dispose(&self);

    fn disposed(&self) -> bool;
}

/// Plain flag implementing [`Disposable`].
#[derive(Debug, Clone, Default)]
pub struct DisposableFlag(Arc<AtomicBool>);

impl DisposableFlag {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Disposable for DisposableFlag {
    fn dispose(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn disposed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct State {
    actions: VecDeque<Action>,
    watched: Vec<Arc<dyn Disposable>>,
}

#[derive(Default)]
pub struct ScopedCoordinator {
    state: Mutex<State>,
    cond: Condvar,
}

impl ScopedCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `action` from any thread.
    pub fn schedule(&self, action: Action) {
        let wake = {
            let mut st = self.lock();
            st.actions.push_back(action);
            st.actions.len() == 1
        };
        if wake {
            self.cond.notify_all();
        }
    }

    /// Enqueue `action` from inside a running action. Never wakes anyone.
    pub fn post_internally(&self, action: Action) {
        self.lock().actions.push_back(action);
    }

    /// Keep `run()` alive until `what` is disposed.
    pub fn watch(&self, what: Arc<dyn Disposable>) {
        self.lock().watched.push(what);
    }

    pub fn pending(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn watched(&self) -> usize {
        self.lock().watched.len()
    }

    /// Run queued actions until the queue is empty and nothing is watched.
    ///
    /// A disposable disposed from another thread is only noticed after the
    /// next action, so disposal should be paired with a `schedule`.
    pub fn run(&self) {
        self.drop_disposed();
        loop {
            let next = {
                let mut st = self.lock();
                loop {
                    if let Some(action) = st.actions.pop_front() {
                        break action;
                    }
                    if st.watched.is_empty() {
                        return;
                    }
                    st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
                }
            };
            next();
            self.drop_disposed();
        }
    }

    /// Run whatever is queued right now without blocking. Returns the
    /// number of actions executed.
    pub fn run_some(&self) -> usize {
        let mut n = 0;
        loop {
            let Some(action) = self.lock().actions.pop_front() else {
                break;
            };
            action();
            n += 1;
        }
        self.drop_disposed();
        n
    }

    fn drop_disposed(&self) {
        let mut st = self.lock();
        let before = st.watched.len();
        st.watched.retain(|d| !d.disposed());
        let dropped = before - st.watched.len();
        if dropped > 0 {
            ktrace!("dropped {} disposed watches", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_run_drains_and_returns() {
        let coord = ScopedCoordinator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            coord.schedule(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        coord.run();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(coord.pending(), 0);
    }

    #[test]
    fn test_post_internally_runs_in_same_pass() {
        let coord = ScopedCoordinator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let c = coord.clone();
        let h = hits.clone();
        coord.schedule(Box::new(move || {
            let h2 = h.clone();
            c.post_internally(Box::new(move || {
                h2.fetch_add(10, Ordering::SeqCst);
            }));
            h.fetch_add(1, Ordering::SeqCst);
        }));
        coord.run();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_run_blocks_while_watched() {
        let coord = ScopedCoordinator::new();
        let flag = DisposableFlag::new();
        coord.watch(Arc::new(flag.clone()));

        let c = coord.clone();
        let f = flag.clone();
        let producer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            c.schedule(Box::new(move || f.dispose()));
        });

        coord.run();
        producer.join().unwrap();
        assert!(flag.disposed());
        assert_eq!(coord.watched(), 0);
    }

    #[test]
    fn test_already_disposed_watch_does_not_block() {
        let coord = ScopedCoordinator::new();
        let flag = DisposableFlag::new();
        flag.dispose();
        coord.watch(Arc::new(flag));
        coord.run();
        assert_eq!(coord.watched(), 0);
    }

    #[test]
    fn test_run_some() {
        let coord = ScopedCoordinator::new();
        assert_eq!(coord.run_some(), 0);
        coord.schedule(Box::new(|| {}));
        coord.schedule(Box::new(|| {}));
        assert_eq!(coord.run_some(), 2);
    }
}
