//! Batched parallel layer pipeline
//!
//! Splits a layer-index range into fixed-size chunks, fans each chunk out
//! across a bounded worker pool, then runs a strictly sequential phase
//! that consumes the chunk's results in ascending layer-index order.
//! Formats need the sequential phase because per-layer offset tables are
//! populated in encounter order and a file stream has one cursor.
//!
//! Every unit of work first passes a cooperative pause gate and a
//! cancellation check; cancellation propagates as
//! [`PipelineError::Cancelled`], never as a partial result.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, PipelineError, Result};

/// How many chunks each worker gets per batch; chunk size is this times
/// the worker count.
const CHUNK_FACTOR: usize = 4;

#[derive(Default)]
struct ProgressState {
    processed: AtomicUsize,
    total: AtomicUsize,
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

/// Shared progress, pause and cancellation handle for a long-running
/// decode/encode/convert call.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone, Default)]
pub struct ProgressToken {
    state: Arc<ProgressState>,
}

impl ProgressToken {
    /// Fresh token with nothing processed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of items the operation will process.
    pub fn set_total(&self, total: usize) {
        self.state.total.store(total, Ordering::Relaxed);
        self.state.processed.store(0, Ordering::Relaxed);
    }

    /// Items processed so far.
    pub fn processed(&self) -> usize {
        self.state.processed.load(Ordering::Relaxed)
    }

    /// Items the operation will process in total.
    pub fn total(&self) -> usize {
        self.state.total.load(Ordering::Relaxed)
    }

    /// Count one finished item.
    pub fn advance(&self) {
        self.state.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Request cancellation. Workers notice at their next checkpoint; a
    /// paused pipeline is woken so it can observe the cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Relaxed);
        let mut paused = self.state.paused.lock();
        *paused = false;
        self.state.resumed.notify_all();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Relaxed)
    }

    /// Pause the pipeline before its next unit of work.
    pub fn pause(&self) {
        *self.state.paused.lock() = true;
    }

    /// Resume a paused pipeline.
    pub fn resume(&self) {
        let mut paused = self.state.paused.lock();
        *paused = false;
        self.state.resumed.notify_all();
    }

    /// Block while paused, then fail if cancelled. Called by every worker
    /// before starting a unit of work.
    pub fn checkpoint(&self) -> Result<()> {
        let mut paused = self.state.paused.lock();
        while *paused {
            self.state.resumed.wait(&mut paused);
        }
        drop(paused);
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }
}

/// Resolve a worker budget: `0` means "use the available parallelism".
pub fn effective_workers(requested: usize) -> usize {
    if requested == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        requested
    }
}

/// Run `work` over `0..count` in parallel batches, handing results to
/// `sink` strictly in ascending index order.
///
/// `work` runs on the pool and must be thread-safe; `sink` runs on the
/// calling thread between batches. The first error (including
/// cancellation) aborts the whole run.
pub fn run_batched<T, W, S>(
    count: usize,
    workers: usize,
    progress: &ProgressToken,
    work: W,
    mut sink: S,
) -> Result<()>
where
    T: Send,
    W: Fn(usize) -> Result<T> + Sync,
    S: FnMut(usize, T) -> Result<()>,
{
    let workers = effective_workers(workers);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| PipelineError::WorkerPool {
            reason: e.to_string(),
        })?;
    let chunk_size = workers * CHUNK_FACTOR;
    progress.set_total(count);
    debug!(count, workers, chunk_size, "starting batched pipeline");

    let mut start = 0usize;
    while start < count {
        let end = (start + chunk_size).min(count);
        let chunk: std::result::Result<Vec<(usize, T)>, Error> = pool.install(|| {
            (start..end)
                .into_par_iter()
                .map(|index| {
                    progress.checkpoint()?;
                    let item = work(index)?;
                    progress.advance();
                    Ok((index, item))
                })
                .collect()
        });
        // Parallel collect preserves the input order, so the sequential
        // phase sees strictly ascending indices.
        for (index, item) in chunk? {
            sink(index, item)?;
        }
        start = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_sink_sees_ascending_order() {
        let progress = ProgressToken::new();
        let mut seen = Vec::new();
        run_batched(
            100,
            4,
            &progress,
            |i| Ok(i * 2),
            |i, v| {
                seen.push((i, v));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(progress.processed(), 100);
    }

    #[test]
    fn test_cancellation_aborts() {
        let progress = ProgressToken::new();
        progress.cancel();
        let touched = AtomicUsize::new(0);
        let result: Result<()> = run_batched(
            10,
            2,
            &progress,
            |_| {
                touched.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            |_, _: ()| Ok(()),
        );
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(touched.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_work_error_propagates() {
        let progress = ProgressToken::new();
        let result: Result<()> = run_batched(
            10,
            2,
            &progress,
            |i| {
                if i == 5 {
                    Err(Error::other("boom"))
                } else {
                    Ok(())
                }
            },
            |_, _: ()| Ok(()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_effective_workers() {
        assert!(effective_workers(0) >= 1);
        assert_eq!(effective_workers(3), 3);
    }

    #[test]
    fn test_pause_blocks_until_resumed() {
        let progress = ProgressToken::new();
        progress.pause();
        let resumer = progress.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            resumer.resume();
        });
        run_batched(8, 2, &progress, |i| Ok(i), |_, _| Ok(())).unwrap();
        handle.join().unwrap();
        assert_eq!(progress.processed(), 8);
    }

    #[test]
    fn test_cancel_wakes_paused_workers() {
        let progress = ProgressToken::new();
        progress.pause();
        let canceller = progress.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });
        let result: Result<()> = run_batched(8, 2, &progress, |_| Ok(()), |_, _: ()| Ok(()));
        handle.join().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }
}
