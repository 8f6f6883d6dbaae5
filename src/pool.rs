//! Generic pool of reusable resources.
//!
//! A single manager thread owns the idle list and serves get/put/update
//! requests from a channel, so no lock guards the list and the TTL behavior
//! is observable by time advancement alone. Idle items age oldest-first;
//! eviction drops from the front while the list is over `max_idle` or the
//! oldest item is past `max_idle_time`.

use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::logger::SyncLog;

pub type NewItem<T> = Box<dyn Fn(&SyncLog) -> Result<T, SyncError> + Send>;
pub type RefreshItem<T> = Box<dyn Fn(&SyncLog, &mut T) -> Result<(), SyncError> + Send>;
pub type DropItem<T> = Box<dyn Fn(T) + Send>;

pub struct PoolConfig<T> {
    new_item: NewItem<T>,
    refresh_item: Option<RefreshItem<T>>,
    drop_item: Option<DropItem<T>>,
    max_idle: usize,
    max_idle_time: Option<Duration>,
    debug: Option<SyncLog>,
}

impl<T> PoolConfig<T> {
    pub fn new(new_item: impl Fn(&SyncLog) -> Result<T, SyncError> + Send + 'static) -> Self {
        PoolConfig {
            new_item: Box::new(new_item),
            refresh_item: None,
            drop_item: None,
            max_idle: 0,
            max_idle_time: None,
            debug: None,
        }
    }

    /// Validity check applied when an idle item is reused. An item whose
    /// refresh fails is disposed and never handed to a caller; the next idle
    /// item (or a fresh construction) is used instead.
    pub fn refresh_item(
        mut self,
        refresh: impl Fn(&SyncLog, &mut T) -> Result<(), SyncError> + Send + 'static,
    ) -> Self {
        self.refresh_item = Some(Box::new(refresh));
        self
    }

    /// Disposer for evicted items. Without one, items are simply dropped.
    pub fn drop_item(mut self, drop: impl Fn(T) + Send + 'static) -> Self {
        self.drop_item = Some(Box::new(drop));
        self
    }

    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = Some(max_idle_time);
        self
    }

    pub fn set_max_idle(&mut self, max_idle: usize) {
        self.max_idle = max_idle;
    }

    pub fn set_max_idle_time(&mut self, max_idle_time: Option<Duration>) {
        self.max_idle_time = max_idle_time;
    }

    /// Lifecycle trace sink.
    pub fn debug(mut self, log: SyncLog) -> Self {
        self.debug = Some(log);
        self
    }

    fn trace(&self, msg: &str) {
        if let Some(log) = &self.debug {
            log.trace(msg);
        }
    }

    fn dispose(&self, item: T) {
        match &self.drop_item {
            Some(drop) => drop(item),
            None => drop(item),
        }
    }
}

enum Request<T> {
    Get {
        log: SyncLog,
        reply: Sender<Result<T, SyncError>>,
    },
    Put(T),
    Update(Box<dyn FnOnce(&mut PoolConfig<T>) + Send>),
}

pub struct Pool<T: Send + 'static> {
    tx: Mutex<Option<Sender<Request<T>>>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(config: PoolConfig<T>) -> Self {
        let (tx, rx) = unbounded();
        let manager = std::thread::spawn(move || manage(rx, config));
        Pool {
            tx: Mutex::new(Some(tx)),
            manager: Mutex::new(Some(manager)),
        }
    }

    /// Take an item out of the pool, reusing the oldest idle item when one
    /// survives its refresh, constructing a new one otherwise. Construction
    /// errors surface unchanged; the pool keeps no state from a failed
    /// construction.
    pub fn get(&self, log: &SyncLog) -> Result<T, SyncError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.request(Request::Get {
            log: log.clone(),
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| SyncError::PoolClosed)?
    }

    /// Return an item to the idle list. Excess and stale items are evicted by
    /// the manager, oldest first.
    pub fn put(&self, item: T) -> Result<(), SyncError> {
        self.request(Request::Put(item))
    }

    /// Mutate the pool configuration under the manager's serialization.
    pub fn update(
        &self,
        update: impl FnOnce(&mut PoolConfig<T>) + Send + 'static,
    ) -> Result<(), SyncError> {
        self.request(Request::Update(Box::new(update)))
    }

    /// Drain the idle list through the disposer and stop the manager. Any
    /// call after close returns `PoolClosed`.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(manager) = self.manager.lock().take() {
            let _ = manager.join();
        }
    }

    fn request(&self, request: Request<T>) -> Result<(), SyncError> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(request).map_err(|_| SyncError::PoolClosed),
            None => Err(SyncError::PoolClosed),
        }
    }
}

impl<T: Send + 'static> Drop for Pool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

struct Idle<T> {
    item: T,
    since: Instant,
}

fn manage<T>(rx: Receiver<Request<T>>, mut config: PoolConfig<T>) {
    let mut idle: VecDeque<Idle<T>> = VecDeque::new();

    loop {
        evict(&mut idle, &config);

        let timer: Receiver<Instant> = match deadline(&idle, &config) {
            Some(wait) => after(wait),
            None => never(),
        };

        crossbeam_channel::select! {
            recv(rx) -> request => match request {
                Ok(Request::Get { log, reply }) => {
                    let _ = reply.send(checkout(&mut idle, &config, &log));
                }
                Ok(Request::Put(item)) => {
                    config.trace("item returned to pool");
                    idle.push_back(Idle { item, since: Instant::now() });
                }
                Ok(Request::Update(update)) => update(&mut config),
                Err(_) => break,
            },
            recv(timer) -> _ => {}
        }
    }

    config.trace("pool closing; draining idle items");
    for entry in idle {
        config.dispose(entry.item);
    }
}

fn evict<T>(idle: &mut VecDeque<Idle<T>>, config: &PoolConfig<T>) {
    loop {
        let drop_oldest = match idle.front() {
            None => false,
            Some(oldest) => {
                idle.len() > config.max_idle
                    || config
                        .max_idle_time
                        .is_some_and(|ttl| oldest.since.elapsed() > ttl)
            }
        };
        if !drop_oldest {
            break;
        }
        if let Some(entry) = idle.pop_front() {
            config.trace("dropping idle item");
            config.dispose(entry.item);
        }
    }
}

fn deadline<T>(idle: &VecDeque<Idle<T>>, config: &PoolConfig<T>) -> Option<Duration> {
    let ttl = config.max_idle_time?;
    let oldest = idle.front()?;
    Some(ttl.saturating_sub(oldest.since.elapsed()))
}

fn checkout<T>(
    idle: &mut VecDeque<Idle<T>>,
    config: &PoolConfig<T>,
    log: &SyncLog,
) -> Result<T, SyncError> {
    while let Some(entry) = idle.pop_front() {
        let mut item = entry.item;
        match &config.refresh_item {
            None => {
                config.trace("reusing idle item");
                return Ok(item);
            }
            Some(refresh) => match refresh(log, &mut item) {
                Ok(()) => {
                    config.trace("refreshed idle item");
                    return Ok(item);
                }
                Err(err) => {
                    config.trace(&format!("refresh failed, dropping item: {err}"));
                    config.dispose(item);
                }
            },
        }
    }

    config.trace("creating new item");
    (config.new_item)(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixture {
        made: Arc<AtomicUsize>,
        dropped: Arc<Mutex<Vec<usize>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                made: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn config(&self) -> PoolConfig<usize> {
            let made = self.made.clone();
            let dropped = self.dropped.clone();
            PoolConfig::new(move |_log| Ok(made.fetch_add(1, Ordering::SeqCst)))
                .drop_item(move |item| dropped.lock().push(item))
        }
    }

    #[test]
    fn test_get_constructs_and_put_reuses() {
        let fx = Fixture::new();
        let pool = Pool::new(fx.config().max_idle(4));
        let log = SyncLog::discard();

        let a = pool.get(&log).unwrap();
        assert_eq!(a, 0);
        pool.put(a).unwrap();

        // The idle item comes back instead of a new construction.
        let b = pool.get(&log).unwrap();
        assert_eq!(b, 0);
        assert_eq!(fx.made.load(Ordering::SeqCst), 1);
        pool.close();
    }

    #[test]
    fn test_excess_idle_items_drop_oldest_first() {
        let fx = Fixture::new();
        let pool = Pool::new(fx.config().max_idle(1));
        let log = SyncLog::discard();

        let a = pool.get(&log).unwrap();
        let b = pool.get(&log).unwrap();
        pool.put(a).unwrap();
        pool.put(b).unwrap();

        // Give the manager a beat to run eviction.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fx.dropped.lock().as_slice(), &[0]);
        pool.close();
    }

    #[test]
    fn test_stale_items_evicted_and_get_builds_fresh() {
        let fx = Fixture::new();
        let pool = Pool::new(
            fx.config()
                .max_idle(1)
                .max_idle_time(Duration::from_millis(50)),
        );
        let log = SyncLog::discard();

        let a = pool.get(&log).unwrap();
        let b = pool.get(&log).unwrap();
        pool.put(a).unwrap();
        pool.put(b).unwrap();

        std::thread::sleep(Duration::from_millis(150));

        // `a` fell to the idle cap, `b` to the TTL; the next get constructs.
        let c = pool.get(&log).unwrap();
        assert_eq!(c, 2);
        assert_eq!(fx.dropped.lock().as_slice(), &[0, 1]);
        pool.close();
    }

    #[test]
    fn test_construction_error_surfaces_unchanged() {
        let pool: Pool<usize> =
            Pool::new(PoolConfig::new(|_log| Err(SyncError::Config("nope".into()))));
        let err = pool.get(&SyncLog::discard()).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        pool.close();
    }

    #[test]
    fn test_failed_refresh_discards_item() {
        let fx = Fixture::new();
        let pool = Pool::new(
            fx.config()
                .max_idle(4)
                .refresh_item(|_log, item| {
                    if *item == 0 {
                        Err(SyncError::Ssh {
                            op: "keepalive",
                            reason: "gone".into(),
                        })
                    } else {
                        Ok(())
                    }
                }),
        );
        let log = SyncLog::discard();

        let a = pool.get(&log).unwrap();
        pool.put(a).unwrap();

        // Item 0 fails its refresh and is disposed; a fresh item replaces it.
        let b = pool.get(&log).unwrap();
        assert_eq!(b, 1);
        assert_eq!(fx.dropped.lock().as_slice(), &[0]);
        pool.close();
    }

    #[test]
    fn test_update_config_applies_under_serialization() {
        let fx = Fixture::new();
        let pool = Pool::new(fx.config().max_idle(4));
        let log = SyncLog::discard();

        let a = pool.get(&log).unwrap();
        pool.put(a).unwrap();
        pool.update(|config| config.set_max_idle(0)).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fx.dropped.lock().as_slice(), &[0]);
        pool.close();
    }

    #[test]
    fn test_close_drains_idle_and_rejects_calls() {
        let fx = Fixture::new();
        let pool = Pool::new(fx.config().max_idle(4));
        let log = SyncLog::discard();

        let a = pool.get(&log).unwrap();
        pool.put(a).unwrap();
        pool.close();

        assert_eq!(fx.dropped.lock().as_slice(), &[0]);
        assert!(matches!(pool.get(&log), Err(SyncError::PoolClosed)));
        assert!(matches!(pool.put(9), Err(SyncError::PoolClosed)));
    }
}
