//! Worker pool for CPU-bound envelope work.
//!
//! Block payloads dominate envelope time, so a store may off-load seal and
//! unseal onto a small fixed pool instead of the caller's thread. Jobs carry
//! their owning buffers into the pool and the result buffer travels back
//! over a per-job channel; any worker may complete any job, and ordering
//! across independent calls is not guaranteed.
//!
//! Dropping the pool closes the job channel and joins every worker.

use std::sync::{
    mpsc::{channel, Receiver, Sender},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};

use log::trace;

use crate::{
    crypto::{self, DbKey},
    error::{Error, Result},
};

enum Job {
    Seal {
        key: DbKey,
        plaintext: Vec<u8>,
        reply: Sender<Result<Vec<u8>>>,
    },
    Unseal {
        key: DbKey,
        sealed: Vec<u8>,
        reply: Sender<Option<Vec<u8>>>,
    },
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers (at least one) sharing a single job queue.
    pub fn new(count: usize) -> Self {
        let (jobs, queue) = channel::<Job>();
        let queue = Arc::new(Mutex::new(queue));
        let workers = (0..count.max(1))
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::Builder::new()
                    .name(format!("sealfs-worker-{i}"))
                    .spawn(move || Self::run(&queue))
                    .unwrap_or_else(|e| panic!("worker spawn failed: {e}"))
            })
            .collect();
        Self {
            jobs: Some(jobs),
            workers,
        }
    }

    fn run(queue: &Mutex<Receiver<Job>>) {
        loop {
            let job = {
                let queue = match queue.lock() {
                    Ok(q) => q,
                    Err(poisoned) => poisoned.into_inner(),
                };
                queue.recv()
            };
            match job {
                Ok(Job::Seal {
                    key,
                    plaintext,
                    reply,
                }) => {
                    let _ = reply.send(crypto::seal(&key, &plaintext));
                }
                Ok(Job::Unseal { key, sealed, reply }) => {
                    let _ = reply.send(crypto::unseal(&key, &sealed));
                }
                // Channel closed: the pool is shutting down.
                Err(_) => return,
            }
        }
    }

    pub fn seal(&self, key: DbKey, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, result) = channel();
        self.submit(Job::Seal {
            key,
            plaintext,
            reply,
        })?;
        result
            .recv()
            .map_err(|_| Error::Transport("worker pool hung up".into()))?
    }

    pub fn unseal(&self, key: DbKey, sealed: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let (reply, result) = channel();
        self.submit(Job::Unseal { key, sealed, reply })?;
        result
            .recv()
            .map_err(|_| Error::Transport("worker pool hung up".into()))
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .as_ref()
            .and_then(|jobs| jobs.send(job).ok())
            .ok_or_else(|| Error::Transport("worker pool closed".into()))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.jobs.take());
        trace!("joining {} envelope workers", self.workers.len());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
