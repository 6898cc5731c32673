//! Dynamic batching: coalesce independently submitted requests into fused
//! forward passes under a bounded wait.
//!
//! Worker threads block on a shared queue; the first request of a batch
//! opens a deadline window of `max_wait_ms`, and the worker keeps draining
//! with a shrinking timeout until the batch is full, the deadline passes,
//! or the queue runs dry. Outputs are routed back per request id. No
//! request waits longer than `max_wait_ms` plus one batch compute time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::tensor::Tensor;

/// Poll interval for idle workers so `stop()` is observed promptly.
const IDLE_TICK: Duration = Duration::from_millis(100);

pub type ProcessFn = dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync;

#[derive(Clone, Debug)]
pub struct BatchProcessorConfig {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
    pub num_workers: usize,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait_ms: 10,
            num_workers: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub inputs: Tensor,
    pub request_id: String,
    pub enqueued_at: Instant,
}

#[derive(Clone, Debug)]
pub struct BatchResponse {
    pub outputs: Tensor,
    pub request_id: String,
    pub latency_ms: f64,
}

// ============================================================
// Blocking queue
// ============================================================

#[derive(Default)]
struct RequestQueue {
    inner: Mutex<VecDeque<BatchRequest>>,
    cond: Condvar,
}

impl RequestQueue {
    fn push(&self, request: BatchRequest) {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .push_back(request);
        self.cond.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<BatchRequest> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        loop {
            if let Some(request) = guard.pop_front() {
                return Some(request);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, wait) = self
                .cond
                .wait_timeout(guard, deadline - now)
                .expect("queue lock poisoned");
            guard = g;
            if wait.timed_out() && guard.is_empty() {
                return None;
            }
        }
    }

    fn notify_all(&self) {
        self.cond.notify_all();
    }
}

// ============================================================
// Processor
// ============================================================

pub struct BatchProcessor {
    config: BatchProcessorConfig,
    process_fn: Arc<ProcessFn>,
    queue: Arc<RequestQueue>,
    responders: Arc<Mutex<HashMap<String, SyncSender<BatchResponse>>>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchProcessor {
    pub fn new<F>(process_fn: F, config: BatchProcessorConfig) -> Self
    where
        F: Fn(&Tensor) -> Result<Tensor> + Send + Sync + 'static,
    {
        Self {
            config,
            process_fn: Arc::new(process_fn),
            queue: Arc::new(RequestQueue::default()),
            responders: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn worker threads. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        for _ in 0..self.config.num_workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let responders = Arc::clone(&self.responders);
            let process_fn = Arc::clone(&self.process_fn);
            let running = Arc::clone(&self.running);
            let max_batch = self.config.max_batch_size.max(1);
            let max_wait = Duration::from_millis(self.config.max_wait_ms);

            workers.push(std::thread::spawn(move || {
                worker_loop(queue, responders, process_fn, running, max_batch, max_wait);
            }));
        }
        tracing::info!("started {} batch workers", self.config.num_workers.max(1));
    }

    /// Clear the running flag and join workers. Workers finish their current
    /// batch and observe the flag within one idle tick. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.notify_all();
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("stopped batch workers");
    }

    /// Enqueue one request and await its routed response. Returns `None` on
    /// deadline expiry; the per-request channel is always unregistered on
    /// exit, so a late batch result for this id is dropped, not leaked.
    pub fn submit(
        &self,
        inputs: Tensor,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> Option<BatchResponse> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.responders
            .lock()
            .expect("responder lock poisoned")
            .insert(request_id.to_string(), tx);

        self.queue.push(BatchRequest {
            inputs,
            request_id: request_id.to_string(),
            enqueued_at: Instant::now(),
        });

        let response = match timeout {
            Some(t) => rx.recv_timeout(t).ok(),
            None => rx.recv().ok(),
        };

        self.responders
            .lock()
            .expect("responder lock poisoned")
            .remove(request_id);
        response
    }

    /// Synchronous convenience path: chunk, stack, and run the process
    /// function directly without the queue. Order preserving.
    pub fn process_batch_sync(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut results = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(self.config.max_batch_size.max(1)) {
            let stacked = Tensor::stack(chunk)?;
            let outputs = (self.process_fn)(&stacked)?;
            for i in 0..chunk.len() {
                results.push(outputs.index_axis0(i)?);
            }
        }
        Ok(results)
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    queue: Arc<RequestQueue>,
    responders: Arc<Mutex<HashMap<String, SyncSender<BatchResponse>>>>,
    process_fn: Arc<ProcessFn>,
    running: Arc<AtomicBool>,
    max_batch: usize,
    max_wait: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let Some(first) = queue.pop_timeout(IDLE_TICK) else {
            continue;
        };

        // First request opens the deadline window; keep draining with the
        // remaining time until full, expired, or empty.
        let deadline = Instant::now() + max_wait;
        let mut batch = vec![first];
        while batch.len() < max_batch {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match queue.pop_timeout(deadline - now) {
                Some(request) => batch.push(request),
                None => break,
            }
        }

        run_batch(&batch, &responders, &process_fn);
    }
}

fn run_batch(
    batch: &[BatchRequest],
    responders: &Mutex<HashMap<String, SyncSender<BatchResponse>>>,
    process_fn: &Arc<ProcessFn>,
) {
    let start = Instant::now();

    let inputs: Vec<Tensor> = batch.iter().map(|r| r.inputs.clone()).collect();
    let stacked = match Tensor::stack(&inputs) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!("dropping batch of {}: {}", batch.len(), e);
            return;
        }
    };

    let outputs = match process_fn(&stacked) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!("process function failed on batch of {}: {}", batch.len(), e);
            return;
        }
    };

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    // FIFO within the batch: outputs row i belongs to submitter i. A missing
    // responder means the submitter already timed out; its row is dropped.
    for (i, request) in batch.iter().enumerate() {
        let row = match outputs.index_axis0(i) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("output row {} unavailable: {}", i, e);
                continue;
            }
        };
        let sender = responders
            .lock()
            .expect("responder lock poisoned")
            .get(&request.request_id)
            .cloned();
        if let Some(tx) = sender {
            let _ = tx.try_send(BatchResponse {
                outputs: row,
                request_id: request.request_id.clone(),
                latency_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubler() -> BatchProcessor {
        BatchProcessor::new(
            |t: &Tensor| t.scale(2.0),
            BatchProcessorConfig {
                max_batch_size: 4,
                max_wait_ms: 10,
                num_workers: 2,
            },
        )
    }

    #[test]
    fn concurrent_submissions_route_by_id() {
        let processor = doubler();
        processor.start();

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for i in 0..10 {
                let processor = &processor;
                handles.push(scope.spawn(move || {
                    let id = format!("r{i}");
                    let input = Tensor::from_vec(vec![i as f32], &[1]).unwrap();
                    let response = processor
                        .submit(input, &id, Some(Duration::from_secs(5)))
                        .expect("response expected");
                    assert_eq!(response.request_id, id);
                    assert_eq!(response.outputs.as_f32().unwrap(), &[2.0 * i as f32]);
                    assert!(response.latency_ms >= 0.0);
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
        });

        processor.stop();
    }

    #[test]
    fn submit_without_workers_times_out() {
        let processor = doubler();
        // Not started: nothing drains the queue.
        let out = processor.submit(
            Tensor::from_vec(vec![1.0], &[1]).unwrap(),
            "orphan",
            Some(Duration::from_millis(50)),
        );
        assert!(out.is_none());
    }

    #[test]
    fn sync_path_preserves_order() {
        let processor = doubler();
        let inputs: Vec<Tensor> = (0..9)
            .map(|i| Tensor::from_vec(vec![i as f32], &[1]).unwrap())
            .collect();
        let outputs = processor.process_batch_sync(&inputs).unwrap();
        assert_eq!(outputs.len(), 9);
        for (i, out) in outputs.iter().enumerate() {
            assert_eq!(out.as_f32().unwrap(), &[2.0 * i as f32]);
        }
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let processor = doubler();
        processor.start();
        processor.start();
        processor.stop();
        processor.stop();
    }
}
