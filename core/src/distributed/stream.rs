//! A dedicated communication stream.
//!
//! Gradients produced early in the backward pass can be reduced while the
//! compute thread keeps walking earlier layers. [`CommStream`] owns the
//! process's collective backend on a worker thread; the compute thread
//! submits buffers and later joins with [`CommStream::synchronize`].
//!
//! Jobs run strictly in submission order, so as long as every process submits
//! the same parameters in the same order (backprop visits layers
//! identically on every replica), the collectives line up across the group.

use super::backend::CollectiveBackend;
use crate::error::{Result, ZeroError};
use crate::tensor::{TensorElem, TensorId};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::debug;

struct Job<T> {
    tensor: TensorId,
    buffer: Vec<T>,
}

type Completion<T> = Result<(TensorId, Vec<T>)>;

/// Worker thread running all-reduces concurrently with the caller.
pub struct CommStream<T: TensorElem> {
    jobs: Option<Sender<Job<T>>>,
    done: Receiver<Completion<T>>,
    in_flight: usize,
    worker: Option<JoinHandle<()>>,
    rank: usize,
}

impl<T: TensorElem> CommStream<T> {
    /// Moves `backend` onto a new worker thread.
    pub fn spawn<B>(backend: B) -> Result<Self>
    where
        B: CollectiveBackend + 'static,
    {
        let rank = backend.rank();
        let (job_tx, job_rx) = unbounded::<Job<T>>();
        let (done_tx, done_rx) = unbounded::<Completion<T>>();

        let worker = thread::Builder::new()
            .name(format!("comm-stream-{}", rank))
            .spawn(move || {
                for Job { tensor, mut buffer } in job_rx {
                    let outcome = backend
                        .all_reduce_sum(&mut buffer)
                        .map(|_| (tensor, buffer));
                    if done_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| ZeroError::Collective(format!("failed to spawn comm stream: {}", e)))?;

        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            in_flight: 0,
            worker: Some(worker),
            rank,
        })
    }

    /// Queues an all-reduce of `buffer` and returns immediately.
    pub fn submit(&mut self, tensor: TensorId, buffer: Vec<T>) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| ZeroError::Collective("comm stream is shut down".into()))?;
        debug!(rank = self.rank, %tensor, len = buffer.len(), "comm stream submit");
        jobs.send(Job { tensor, buffer })
            .map_err(|_| ZeroError::Collective("comm stream worker exited".into()))?;
        self.in_flight += 1;
        Ok(())
    }

    /// Number of submitted all-reduces not yet collected.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Blocks until every submitted job has finished and returns the reduced
    /// buffers in submission order.
    ///
    /// The first failed collective is returned as an error; the stream should
    /// be considered unusable after that.
    pub fn synchronize(&mut self) -> Result<Vec<(TensorId, Vec<T>)>> {
        let mut finished = Vec::with_capacity(self.in_flight);
        while self.in_flight > 0 {
            let outcome = self
                .done
                .recv()
                .map_err(|_| ZeroError::Collective("comm stream worker exited".into()))?;
            self.in_flight -= 1;
            finished.push(outcome?);
        }
        Ok(finished)
    }
}

impl<T: TensorElem> Drop for CommStream<T> {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
