//! Pipeline scheduler — drives a fixed pool of `n_threads` OS threads
//! through an ordered list of tasks, synchronized by a barrier at every
//! task boundary. No thread begins task `t+1` until every thread has
//! returned from task `t`.
//!
//! Mirrors `original_source/barrier.hpp`'s hand-rolled condvar barrier
//! one-to-one with `std::sync::Barrier`.

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Compute,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    Stop,
}

/// One scheduled step. `run` receives `(n_threads, thread_index)` and must
/// return the same `TaskOutcome` from every thread for a given invocation
/// (the loop stops the whole pool, not just one thread, on `Stop`).
pub struct Task<Ctx> {
    pub name: &'static str,
    pub kind: TaskKind,
    pub run: fn(n_threads: usize, thread_index: usize, ctx: &Ctx) -> TaskOutcome,
}

/// Accumulated timing, reported from thread 0 only.
#[derive(Debug, Default, Clone)]
pub struct TaskStats {
    pub execution_time: [Duration; 2],
    pub detailed_time: Vec<Duration>,
}

impl TaskStats {
    fn new(n_tasks: usize) -> Self {
        TaskStats {
            execution_time: [Duration::ZERO, Duration::ZERO],
            detailed_time: vec![Duration::ZERO; n_tasks],
        }
    }

    fn kind_index(kind: TaskKind) -> usize {
        match kind {
            TaskKind::Compute => 0,
            TaskKind::Transfer => 1,
        }
    }
}

/// Runs `tasks` repeatedly (one full pass = one forward-pass step) across
/// `n_threads` worker threads until a task returns `Stop`.
pub struct TaskLoop<Ctx: Send + Sync> {
    n_threads: usize,
    tasks: Arc<Vec<Task<Ctx>>>,
    ctx: Arc<Ctx>,
}

impl<Ctx: Send + Sync + 'static> TaskLoop<Ctx> {
    pub fn new(n_threads: usize, tasks: Vec<Task<Ctx>>, ctx: Ctx) -> Self {
        assert!(n_threads > 0, "TaskLoop requires at least one thread");
        TaskLoop {
            n_threads,
            tasks: Arc::new(tasks),
            ctx: Arc::new(ctx),
        }
    }

    /// Run every task in order exactly once. Stops early (skipping the
    /// remaining tasks in this pass) if any task returns `Stop`. Returns
    /// this pass's stats plus whether `Stop` was observed, for `run` to
    /// decide whether to restart from task 0.
    fn run_pass(&self) -> (TaskStats, bool) {
        let barrier = Arc::new(Barrier::new(self.n_threads));
        let stats = Arc::new(std::sync::Mutex::new(TaskStats::new(self.tasks.len())));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        std::thread::scope(|scope| {
            for thread_index in 0..self.n_threads {
                let tasks = Arc::clone(&self.tasks);
                let ctx = Arc::clone(&self.ctx);
                let barrier = Arc::clone(&barrier);
                let stats = Arc::clone(&stats);
                let stop = Arc::clone(&stop);
                let n_threads = self.n_threads;

                scope.spawn(move || {
                    for (idx, task) in tasks.iter().enumerate() {
                        let start = Instant::now();
                        let outcome = (task.run)(n_threads, thread_index, &ctx);
                        let elapsed = start.elapsed();

                        if outcome == TaskOutcome::Stop {
                            stop.store(true, std::sync::atomic::Ordering::Relaxed);
                        }

                        if thread_index == 0 {
                            let mut stats = stats.lock().unwrap();
                            stats.execution_time[TaskStats::kind_index(task.kind)] += elapsed;
                            stats.detailed_time[idx] += elapsed;
                        }

                        // The barrier establishes happens-before for `stop`: every
                        // thread's write above is visible to every thread's read below.
                        barrier.wait();
                        if stop.load(std::sync::atomic::Ordering::Relaxed) {
                            break;
                        }
                    }
                });
            }
        });

        let stopped = stop.load(std::sync::atomic::Ordering::Relaxed);
        let stats = Arc::try_unwrap(stats)
            .map(|mutex| mutex.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone());
        (stats, stopped)
    }

    /// Run every task in order exactly once, returning accumulated stats.
    /// Stops early (skipping the remaining tasks in this pass) if any task
    /// returns `Stop`.
    pub fn run_once(&self) -> TaskStats {
        self.run_pass().0
    }

    /// Restart from task 0 every time a pass completes without any task
    /// returning `Stop`, until one finally does. One call drives one full
    /// token forward pass: every block in the model runs in turn, ending at
    /// whichever task is wired to emit `Stop` once the layer stack wraps
    /// (root's `finalize` task, or a worker's `nextBlock` task).
    pub fn run(&self) -> TaskStats {
        let mut total = TaskStats::new(self.tasks.len());
        loop {
            let (pass, stopped) = self.run_pass();
            total.execution_time[0] += pass.execution_time[0];
            total.execution_time[1] += pass.execution_time[1];
            for (t, p) in total.detailed_time.iter_mut().zip(pass.detailed_time) {
                *t += p;
            }
            if stopped {
                return total;
            }
        }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    fn bump(_n: usize, thread_index: usize, ctx: &Counter) -> TaskOutcome {
        if thread_index == 0 {
            ctx.0.fetch_add(1, Ordering::SeqCst);
        }
        TaskOutcome::Continue
    }

    fn stop_immediately(_n: usize, _t: usize, _ctx: &Counter) -> TaskOutcome {
        TaskOutcome::Stop
    }

    #[test]
    fn runs_every_task_once_per_pass() {
        let tasks = vec![
            Task { name: "a", kind: TaskKind::Compute, run: bump },
            Task { name: "b", kind: TaskKind::Compute, run: bump },
        ];
        let loop_ = TaskLoop::new(4, tasks, Counter(AtomicUsize::new(0)));
        loop_.run_once();
        assert_eq!(loop_.ctx().0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_halts_remaining_tasks_in_the_pass() {
        let tasks = vec![
            Task { name: "stop", kind: TaskKind::Compute, run: stop_immediately },
            Task { name: "never", kind: TaskKind::Compute, run: bump },
        ];
        let loop_ = TaskLoop::new(2, tasks, Counter(AtomicUsize::new(0)));
        loop_.run_once();
        assert_eq!(loop_.ctx().0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn accumulates_per_kind_timing() {
        let tasks = vec![
            Task { name: "compute", kind: TaskKind::Compute, run: bump },
            Task { name: "transfer", kind: TaskKind::Transfer, run: bump },
        ];
        let loop_ = TaskLoop::new(2, tasks, Counter(AtomicUsize::new(0)));
        let stats = loop_.run_once();
        assert_eq!(stats.detailed_time.len(), 2);
    }
}
