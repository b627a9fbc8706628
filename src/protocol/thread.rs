use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
};

use log::debug;
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("thread pool is closed")]
    Closed,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stop: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // jobs run outside the lock, so a poisoned guard still holds a consistent queue
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed set of workers draining a shared FIFO of jobs.
pub struct ThreadPool {
    workers: Vec<Worker>,
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let shared = Arc::new(Shared::default());
        let workers = (0..size)
            .map(|id| Worker::new(id, Arc::clone(&shared)))
            .collect();

        Self { workers, shared }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` and wakes one idle worker.
    ///
    /// Rejected once [`ThreadPool::close`] has begun.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            if queue.stop {
                return Err(PoolError::Closed);
            }
            queue.jobs.push_back(Box::new(f));
        }

        self.shared.available.notify_one();
        Ok(())
    }

    /// Stops the pool.
    ///
    /// With `clear_pending`, queued jobs that no worker picked up yet are dropped; running jobs
    /// always finish. With `wait`, blocks until every worker exited, otherwise the workers are
    /// detached. Closing a closed pool does nothing.
    pub fn close(&mut self, wait: bool, clear_pending: bool) {
        {
            let mut queue = self.shared.lock();
            if self.workers.is_empty() {
                return;
            }

            debug!("closing pool with {} queued jobs", queue.jobs.len());
            queue.stop = true;
            if clear_pending {
                queue.jobs.clear();
            }
        }

        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            if wait {
                debug!("shutting down worker {}", worker.id);
                if worker.thread.join().is_err() {
                    debug!("worker {} panicked", worker.id);
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close(true, false);
    }
}

struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, shared: Arc<Shared>) -> Self {
        let thread = thread::spawn(move || {
            debug!("worker {id} started");
            loop {
                let job = {
                    let mut queue = shared.lock();
                    while !queue.stop && queue.jobs.is_empty() {
                        queue = shared
                            .available
                            .wait(queue)
                            .unwrap_or_else(|e| e.into_inner());
                    }

                    match queue.jobs.pop_front() {
                        Some(job) => job,
                        None => break,
                    }
                };

                debug!("worker {id} handling a job");
                job();
            }
            debug!("worker {id} finished");
        });

        Self { id, thread }
    }
}
