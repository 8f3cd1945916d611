use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::queue::TimedQueue;

/// Outcome of a non-blocking request: received bytes for a recv, `None` for
/// a completed send
pub(crate) type JobResult = Result<Option<Vec<u8>>>;

enum PoolJob {
    Run {
        request_id: u64,
        thunk: Box<dyn FnOnce() -> JobResult + Send>,
        promise: Sender<JobResult>,
    },
    Shutdown,
}

/// Fixed pool of worker threads draining one shared queue of non-blocking
/// requests. No stealing, no priorities; each worker runs its job to
/// completion, fulfils the promise and loops.
pub(crate) struct MpiAsyncPool {
    queue: Arc<TimedQueue<PoolJob>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl MpiAsyncPool {
    pub(crate) fn new(size: usize) -> MpiAsyncPool {
        debug!("starting MPI async pool with {} workers", size);

        let queue: Arc<TimedQueue<PoolJob>> = Arc::new(TimedQueue::new());
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let worker_queue = queue.clone();
            workers.push(thread::spawn(move || {
                trace!("MPI async worker {} running", i);
                loop {
                    match worker_queue.dequeue(None) {
                        Ok(PoolJob::Run {
                            request_id,
                            thunk,
                            promise,
                        }) => {
                            trace!("MPI async worker {} request {}", i, request_id);
                            let result = thunk();
                            // The awaiter may already be gone
                            let _res = promise.send(result);
                        }
                        Ok(PoolJob::Shutdown) | Err(_) => break,
                    }
                }
                trace!("MPI async worker {} shutting down", i);
            }));
        }

        MpiAsyncPool {
            queue,
            workers: Mutex::new(workers),
            size,
        }
    }

    /// Queue a request; the returned receiver completes when a worker has
    /// run it
    pub(crate) fn submit(
        &self,
        request_id: u64,
        thunk: Box<dyn FnOnce() -> JobResult + Send>,
    ) -> Receiver<JobResult> {
        let (promise, future) = bounded(1);
        self.queue.enqueue(PoolJob::Run {
            request_id,
            thunk,
            promise,
        });
        future
    }
}

impl Drop for MpiAsyncPool {
    fn drop(&mut self) {
        for _ in 0..self.size {
            self.queue.enqueue(PoolJob::Shutdown);
        }
        for handle in self.workers.lock().drain(..) {
            let _res = handle.join();
        }
    }
}
