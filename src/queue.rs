//! Bounded work queues with panic-isolated workers.
//!
//! Each queue is a bounded channel (capacity 0 means a synchronous handoff)
//! feeding a fixed set of worker threads. Workers convert panics into errors
//! routed through the unit's own completion protocol so a buggy unit cannot
//! kill a pipeline stage or leave a fan-in counting forever.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::logger::SyncLog;

/// A one-shot completion callback. `FnOnce` makes more-than-once impossible;
/// the queue and stage protocol make less-than-once impossible.
pub type Callback = Box<dyn FnOnce(Result<(), SyncError>) + Send + 'static>;

/// A unit of pipeline work.
///
/// `handle` runs the work and eventually routes exactly one completion
/// through the unit's callback, either directly or by transferring the
/// callback to a downstream unit. `fail` is invoked by the queue only when
/// `handle` panics; implementations keep the callback in an `Option` so the
/// panic path cannot fire a callback that `handle` already consumed.
pub trait Handler: Send + 'static {
    fn handle(&mut self);
    fn fail(&mut self, err: SyncError);
}

pub struct WorkQueue<T: Handler> {
    log: SyncLog,
    tx: Mutex<Option<Sender<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Handler> WorkQueue<T> {
    /// Spawn `count` workers over a channel of capacity `buffer`.
    pub fn new(name: &str, log: &SyncLog, count: usize, buffer: usize) -> Self {
        let (tx, rx) = bounded::<T>(buffer);
        let mut workers = Vec::with_capacity(count);
        for idx in 0..count {
            let rx = rx.clone();
            let worker_log = log.with_prefix(&format!("{name}-worker-{idx}"));
            workers.push(std::thread::spawn(move || worker_loop(rx, worker_log)));
        }
        WorkQueue {
            log: log.with_prefix(&format!("{name}-queue")),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Hand a unit to the workers, blocking until one accepts it. If the
    /// queue has been closed the unit is failed through its own protocol so
    /// its callback still fires exactly once.
    pub fn send(&self, mut unit: T) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                self.log.trace("sending unit");
                if let Err(returned) = tx.send(unit) {
                    self.log.error("queue closed mid-send; failing unit");
                    let mut unit = returned.into_inner();
                    unit.fail(SyncError::ChannelClosed);
                }
            }
            None => {
                self.log.error("send on closed queue; failing unit");
                unit.fail(SyncError::ChannelClosed);
            }
        }
    }

    /// Close the channel and wait for the workers to drain in-flight units.
    pub fn close(&self) {
        self.log.debug("closing queue");
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        self.log.debug("queue drained");
    }
}

fn worker_loop<T: Handler>(rx: Receiver<T>, log: SyncLog) {
    log.debug("worker started");
    while let Ok(mut unit) = rx.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| unit.handle())) {
            let msg = panic_text(payload);
            log.error(&format!("recovered from panic: {msg}"));
            let failed = panic::catch_unwind(AssertUnwindSafe(|| {
                unit.fail(SyncError::PanicRecovered(msg.clone()))
            }));
            if failed.is_err() {
                log.critical(&format!("panic while failing unit: {msg}"));
            }
        }
    }
    log.debug("worker exited");
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    enum Mode {
        Succeed,
        Fail,
        PanicBeforeCallback,
        Sleep(Duration),
    }

    struct TestUnit {
        mode: Mode,
        callback: Option<Callback>,
    }

    impl TestUnit {
        fn new(mode: Mode, callback: Callback) -> Self {
            TestUnit {
                mode,
                callback: Some(callback),
            }
        }

        fn complete(&mut self, result: Result<(), SyncError>) {
            if let Some(cb) = self.callback.take() {
                cb(result);
            }
        }
    }

    impl Handler for TestUnit {
        fn handle(&mut self) {
            match self.mode {
                Mode::Succeed => self.complete(Ok(())),
                Mode::Fail => self.complete(Err(SyncError::PoolClosed)),
                Mode::PanicBeforeCallback => panic!("unit exploded"),
                Mode::Sleep(d) => {
                    std::thread::sleep(d);
                    self.complete(Ok(()));
                }
            }
        }

        fn fail(&mut self, err: SyncError) {
            self.complete(Err(err));
        }
    }

    fn counting_callback(
        ok: Arc<AtomicUsize>,
        errs: Arc<AtomicUsize>,
    ) -> Callback {
        Box::new(move |result| {
            match result {
                Ok(()) => ok.fetch_add(1, Ordering::SeqCst),
                Err(_) => errs.fetch_add(1, Ordering::SeqCst),
            };
        })
    }

    #[test]
    fn test_every_unit_calls_back_exactly_once() {
        let ok = Arc::new(AtomicUsize::new(0));
        let errs = Arc::new(AtomicUsize::new(0));

        let queue = WorkQueue::new("test", &SyncLog::discard(), 4, 0);
        for i in 0..20 {
            let mode = match i % 3 {
                0 => Mode::Succeed,
                1 => Mode::Fail,
                _ => Mode::PanicBeforeCallback,
            };
            queue.send(TestUnit::new(
                mode,
                counting_callback(ok.clone(), errs.clone()),
            ));
        }
        queue.close();

        assert_eq!(ok.load(Ordering::SeqCst) + errs.load(Ordering::SeqCst), 20);
        assert_eq!(ok.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_panic_is_routed_as_error() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let queue = WorkQueue::new("test", &SyncLog::discard(), 1, 0);
        queue.send(TestUnit::new(
            Mode::PanicBeforeCallback,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        ));

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match result {
            Err(SyncError::PanicRecovered(msg)) => assert!(msg.contains("unit exploded")),
            other => panic!("expected PanicRecovered, got {other:?}"),
        }
        queue.close();
    }

    #[test]
    fn test_worker_survives_panicking_unit() {
        let ok = Arc::new(AtomicUsize::new(0));
        let errs = Arc::new(AtomicUsize::new(0));

        let queue = WorkQueue::new("test", &SyncLog::discard(), 1, 0);
        queue.send(TestUnit::new(
            Mode::PanicBeforeCallback,
            counting_callback(ok.clone(), errs.clone()),
        ));
        queue.send(TestUnit::new(
            Mode::Succeed,
            counting_callback(ok.clone(), errs.clone()),
        ));
        queue.close();

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(errs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_waits_for_in_flight_units() {
        let ok = Arc::new(AtomicUsize::new(0));
        let errs = Arc::new(AtomicUsize::new(0));

        let queue = WorkQueue::new("test", &SyncLog::discard(), 2, 4);
        for _ in 0..6 {
            queue.send(TestUnit::new(
                Mode::Sleep(Duration::from_millis(20)),
                counting_callback(ok.clone(), errs.clone()),
            ));
        }
        queue.close();

        assert_eq!(ok.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_send_after_close_fails_the_unit() {
        let ok = Arc::new(AtomicUsize::new(0));
        let errs = Arc::new(AtomicUsize::new(0));

        let queue = WorkQueue::new("test", &SyncLog::discard(), 1, 0);
        queue.close();
        queue.send(TestUnit::new(
            Mode::Succeed,
            counting_callback(ok.clone(), errs.clone()),
        ));

        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(errs.load(Ordering::SeqCst), 1);
    }
}
