//! Fixed set of I/O worker threads
//!
//! Each worker is one OS thread driving its own current-thread runtime, so
//! a task spawned on a worker never migrates and everything it does for its
//! connection happens in order on that thread.

use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

struct Worker {
    handle: Handle,
    tracker: TaskTracker,
    /// Tasks currently running on this worker
    load: Arc<AtomicUsize>,
}

/// Decrements a worker's load when its task finishes
struct LoadGuard(Arc<AtomicUsize>);

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    shutdown: Mutex<Vec<oneshot::Sender<()>>>,
    exited: Mutex<mpsc::Receiver<usize>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `count` worker threads
    pub(crate) fn start(count: usize) -> io::Result<Self> {
        let (exited_tx, exited_rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(count);
        let mut shutdown = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);

        for index in 0..count {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            let tracker = TaskTracker::new();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let thread_tracker = tracker.clone();
            let exited_tx = exited_tx.clone();
            let handle = runtime.handle().clone();
            let thread = std::thread::Builder::new()
                .name(format!("sessionpool-io-{}", index))
                .spawn(move || {
                    runtime.block_on(async move {
                        let _ = stop_rx.await;
                        thread_tracker.close();
                        thread_tracker.wait().await;
                    });
                    // Dropping the runtime cancels helper tasks left behind
                    drop(runtime);
                    debug!("Worker {} exited", index);
                    let _ = exited_tx.send(index);
                })?;

            workers.push(Worker {
                handle,
                tracker,
                load: Arc::new(AtomicUsize::new(0)),
            });
            shutdown.push(stop_tx);
            threads.push(thread);
        }

        debug!("Started {} worker thread(s)", count);

        Ok(WorkerPool {
            workers,
            shutdown: Mutex::new(shutdown),
            exited: Mutex::new(exited_rx),
            threads: Mutex::new(threads),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Index of the least loaded worker
    pub(crate) fn pick(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.load.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    /// Run `f` inside the runtime context of worker `index`
    ///
    /// I/O resources created in `f` are registered with that worker.
    pub(crate) fn enter<R>(&self, index: usize, f: impl FnOnce() -> R) -> R {
        let _guard = self.workers[index % self.workers.len()].handle.enter();
        f()
    }

    /// Spawn a task on worker `index`
    pub(crate) fn spawn_on<F>(&self, index: usize, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = &self.workers[index % self.workers.len()];
        worker.load.fetch_add(1, Ordering::AcqRel);
        let guard = LoadGuard(worker.load.clone());
        worker.tracker.spawn_on(
            async move {
                let _guard = guard;
                task.await
            },
            &worker.handle,
        );
    }

    /// Spawn a task on the least loaded worker
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_on(self.pick(), task);
    }

    /// Current number of tasks per worker
    pub(crate) fn loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|w| w.load.load(Ordering::Acquire))
            .collect()
    }

    /// Signal every worker to finish and wait up to `timeout` for them
    ///
    /// Returns the number of workers that did not exit in time; their
    /// threads are detached.
    pub(crate) fn shutdown(&self, timeout: Duration) -> usize {
        for stop in self.shutdown.lock().drain(..) {
            let _ = stop.send(());
        }

        let total = self.workers.len();
        let deadline = Instant::now() + timeout;
        let exited = self.exited.lock();
        let mut done = 0;
        while done < total {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match exited.recv_timeout(remaining) {
                Ok(_) => done += 1,
                Err(_) => break,
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }

        let stuck = total - done;
        if stuck > 0 {
            warn!("{} worker(s) did not stop within {:?}", stuck, timeout);
        }
        stuck
    }
}
