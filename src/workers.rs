use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// The relay's long-running loops, one named thread each.
pub struct WorkerGroup {
    workers: Vec<Worker>,
    done_tx: Sender<usize>,
    done_rx: Receiver<usize>,
}

struct Worker {
    id: usize,
    name: String,
    thread: Option<thread::JoinHandle<()>>,
    finished: bool,
}

/// Reports the worker as finished when its thread unwinds or returns.
struct DoneGuard {
    id: usize,
    done: Sender<usize>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.done.send(self.id);
    }
}

impl WorkerGroup {
    pub fn new() -> WorkerGroup {
        let (done_tx, done_rx) = mpsc::channel();
        WorkerGroup {
            workers: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.workers.len();
        let name = name.into();
        let guard = DoneGuard {
            id,
            done: self.done_tx.clone(),
        };

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            f();
        })?;

        self.workers.push(Worker {
            id,
            name,
            thread: Some(thread),
            finished: false,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits up to `timeout` for every worker to finish and joins those that
    /// did. Returns the names of workers still running at the deadline; their
    /// threads are left detached.
    pub fn join_within(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;

        while self.workers.iter().any(|w| !w.finished) {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(left) {
                Ok(id) => {
                    if let Some(worker) = self.workers.iter_mut().find(|w| w.id == id) {
                        worker.finished = true;
                    }
                }
                Err(_) => break,
            }
        }

        let mut stragglers = Vec::new();
        for worker in &mut self.workers {
            if !worker.finished {
                warn!("worker {} did not stop in time", worker.name);
                stragglers.push(worker.name.clone());
                continue;
            }
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!("worker {} panicked", worker.name);
                } else {
                    debug!("joined worker {}", worker.name);
                }
            }
        }
        self.workers.clear();
        stragglers
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        WorkerGroup::new()
    }
}
