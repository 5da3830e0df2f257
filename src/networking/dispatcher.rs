//! Per-observer ordered delivery.
//!
//! Each observer gets an outbox. Batches are appended on the tick thread and
//! drained by at most one job per outbox at a time, so a batch is never
//! handed to the sink before the previous batch for the same observer. Drain
//! jobs run on a delivery pool of their own: a slow sink call only backs up
//! its own outbox and never holds a worker the tick waits on.
//!
//! Closing an observer is also routed through its drain, so `EventSink::close`
//! runs after the last `dispatch` for that observer has returned.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};

use crate::core::types::ObserverId;
use crate::networking::event_sink::{EventBatch, EventSink};
use crate::threading::ThreadPool;

#[derive(Debug, Default)]
struct Outbox {
    queue: Mutex<VecDeque<EventBatch>>,
    draining: AtomicBool,
    closed: AtomicBool,
    close_sent: AtomicBool,
}

impl Outbox {
    fn push(&self, batch: EventBatch) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(batch);
    }

    fn pop(&self) -> Option<EventBatch> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // Claims the drain. Only the caller that gets `true` may start a job
    fn claim(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    fn drain(&self, observer: ObserverId, sink: &dyn EventSink, failures: &AtomicU64) {
        loop {
            while let Some(batch) = self.pop() {
                if self.closed.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = sink.dispatch(observer, &batch) {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Dispatch of tick {} to observer {} failed: {}", batch.tick, observer, e);
                }
            }
            self.draining.store(false, Ordering::SeqCst);
            if self.len() == 0 {
                break;
            }
            // A push landed after the last pop; whoever claims the drain handles it
            if !self.claim() {
                return;
            }
        }

        if self.closed.load(Ordering::SeqCst) && !self.close_sent.swap(true, Ordering::SeqCst) {
            sink.close(observer);
        }
    }
}

pub struct Dispatcher {
    sink: Arc<dyn EventSink>,
    delivery: Arc<ThreadPool>,
    outboxes: HashMap<ObserverId, Arc<Outbox>>,
    failures: Arc<AtomicU64>,
}

impl Dispatcher {
    /// `delivery` runs the sink calls. It should not be a pool the tick blocks on.
    pub fn new(sink: Arc<dyn EventSink>, delivery: Arc<ThreadPool>) -> Self {
        Dispatcher {
            sink,
            delivery,
            outboxes: HashMap::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    fn start_drain(&self, observer: ObserverId, outbox: Arc<Outbox>) {
        let sink = Arc::clone(&self.sink);
        let failures = Arc::clone(&self.failures);
        self.delivery.execute(move || outbox.drain(observer, sink.as_ref(), &failures));
    }

    /// Queues each batch on its observer's outbox and makes sure a drain job is running.
    pub fn dispatch(&mut self, batches: Vec<EventBatch>) -> usize {
        let count = batches.len();
        for batch in batches {
            let observer = batch.observer;
            let outbox = Arc::clone(self.outboxes.entry(observer).or_default());
            outbox.push(batch);
            if outbox.claim() {
                self.start_drain(observer, outbox);
            }
        }
        count
    }

    /// Drops the observer's outbox. Batches not yet handed to the sink are
    /// discarded, and the sink is told once any in-flight dispatch returns.
    pub fn close(&mut self, observer: ObserverId) {
        let Some(outbox) = self.outboxes.remove(&observer) else {
            self.sink.close(observer);
            return;
        };
        outbox.closed.store(true, Ordering::SeqCst);
        debug!("Outbox for observer {} closed with {} undelivered batches", observer, outbox.len());
        if outbox.claim() {
            self.start_drain(observer, outbox);
        }
    }

    /// Batches queued but not yet handed to the sink, over all observers.
    pub fn backlog(&self) -> usize {
        self.outboxes.values().map(|o| o.len()).sum()
    }

    /// Sink calls that returned an error since creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
