use log::{debug, error};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::aggregate::{Batch, Sample};

/// Success and failure tallies updated by workers as they finish.
#[derive(Debug, Default)]
pub struct BatchCounters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchCounters {
    fn record<T>(&self, sample: &Sample<T>) {
        if sample.is_success() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

/// A finished batch together with the tallies its workers kept.
#[derive(Debug)]
pub struct BatchRun<T> {
    pub batch: Batch<T>,
    pub counters: Arc<BatchCounters>,
}

/// Launch one task per worker index, wait for every one of them, and
/// collect the samples by index.
///
/// Workers are fresh tasks for every batch. A worker that panics leaves its
/// slot unwritten, which the batch records as a failure.
pub async fn fan_out<T, F, Fut>(concurrency: usize, worker: F) -> BatchRun<T>
where
    T: Send + 'static,
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Sample<T>> + Send + 'static,
{
    let counters = Arc::new(BatchCounters::default());
    let mut handles = Vec::with_capacity(concurrency);

    for index in 0..concurrency {
        let future = worker(index);
        let counters = Arc::clone(&counters);
        handles.push(tokio::spawn(async move {
            let sample = future.await;
            counters.record(&sample);
            sample
        }));
    }

    let mut slots: Vec<Option<Sample<T>>> = Vec::with_capacity(concurrency);
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(sample) => slots.push(Some(sample)),
            Err(e) => {
                error!("Worker {} did not complete: {}", index, e);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                slots.push(None);
            }
        }
    }

    debug!(
        "Batch of {} complete: {} succeeded, {} failed",
        concurrency,
        counters.succeeded(),
        counters.failed()
    );

    BatchRun {
        batch: Batch::from_slots(slots),
        counters,
    }
}
