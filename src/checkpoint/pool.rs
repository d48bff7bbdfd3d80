//! Persistent checkpoint worker pool
//!
//! `numa_nodes × workers_per_node` OS threads, each with its own job channel
//! and QSBR slot. Worker `w` belongs to node `w / workers_per_node`. A stage
//! hands every worker one input and the coordinator waits for all results,
//! which doubles as the barrier between stages.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

use crate::error::{Result, TierError};
use crate::shim::Retired;
use crate::sync::Qsbr;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    slot: usize,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    per_node: usize,
    qsbr: Arc<Qsbr<Retired>>,
}

impl WorkerPool {
    /// Spawn the workers, claiming QSBR slots from `first_slot` upwards
    pub fn spawn(nodes: usize, per_node: usize, qsbr: Arc<Qsbr<Retired>>, first_slot: usize) -> Result<Self> {
        let count = nodes * per_node;
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            per_node,
            qsbr: Arc::clone(&qsbr),
        };

        for w in 0..count {
            let slot = qsbr
                .register_in(first_slot..first_slot + count)
                .ok_or(TierError::TooManyThreads { max: first_slot + count })?;
            let (tx, rx) = channel::unbounded::<Job>();
            let qsbr = Arc::clone(&qsbr);
            let handle = thread::Builder::new()
                .name(format!("tierkv-worker-{}", w))
                .spawn(move || {
                    for job in rx.iter() {
                        let _op = qsbr.guard(slot);
                        job();
                    }
                })?;
            pool.workers.push(Worker {
                jobs: Some(tx),
                handle: Some(handle),
                slot,
            });
        }

        debug!(workers = count, nodes, "spawned checkpoint workers");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn per_node(&self) -> usize {
        self.per_node
    }

    pub fn node_of(&self, worker: usize) -> usize {
        worker / self.per_node
    }

    /// Run `f(w, inputs[w])` on every worker `w` and gather the results in
    /// worker order. The first error wins; a panic becomes `WorkerPanicked`.
    pub fn map<T, R, F>(&self, inputs: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Result<R> + Send + Sync + 'static,
    {
        debug_assert_eq!(inputs.len(), self.workers.len());
        let f = Arc::new(f);
        let (tx, rx) = channel::bounded::<(usize, Result<R>)>(inputs.len());

        for (w, input) in inputs.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let tx = tx.clone();
            let job: Job = Box::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(w, input)))
                    .unwrap_or_else(|payload| Err(TierError::WorkerPanicked(panic_message(payload))));
                let _ = tx.send((w, result));
            });
            let sent = self.workers[w].jobs.as_ref().map(|jobs| jobs.send(job));
            if !matches!(sent, Some(Ok(()))) {
                return Err(TierError::WorkerPanicked(format!("worker {} is gone", w)));
            }
        }
        drop(tx);

        let mut out: Vec<Option<R>> = (0..self.workers.len()).map(|_| None).collect();
        let mut failure = None;
        for (w, result) in rx.iter() {
            match result {
                Ok(r) => out[w] = Some(r),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        out.into_iter()
            .enumerate()
            .map(|(w, r)| r.ok_or_else(|| TierError::WorkerPanicked(format!("worker {} returned nothing", w))))
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // closing the channel ends the worker loop
            worker.jobs.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!(slot = worker.slot, "checkpoint worker exited by panic");
                }
            }
            self.qsbr.unregister(worker.slot);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
