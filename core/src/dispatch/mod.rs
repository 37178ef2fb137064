// Delivery dispatch: best-effort notification of registered handlers
//
// A handler failing (error or panic) is logged and skipped. It never reaches
// the sender and never stops later recipients from being notified.
//
// In background mode a coordinator thread walks each send's recipients in
// order and hands every delivery to that recipient's own lane thread. The
// coordinator waits on a delivery for at most the handler timeout, so a stuck
// handler only holds up messages for its own user.

use crate::message::Message;
use crate::CourierError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handlers taking longer than this are reported
pub const DEFAULT_SLOW_HANDLER_MS: u64 = 500;
/// How long one delivery may hold up the next recipient
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 250;
/// How long shutdown waits for queued deliveries
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;

/// Receives new messages addressed to (or sent by) one user
pub trait DeliveryHandler: Send + Sync {
    fn deliver(&self, message: &Message) -> anyhow::Result<()>;
}

impl<F> DeliveryHandler for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn deliver(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

/// Where handlers run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// On the sending thread, before `send` returns
    Inline,
    /// On per-recipient delivery threads, off the sending thread
    #[default]
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub slow_handler_ms: u64,
    /// Background only: wait this long for a delivery before moving on
    pub handler_timeout_ms: u64,
    /// Background only: upper bound on `drain`
    pub drain_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Background,
            slow_handler_ms: DEFAULT_SLOW_HANDLER_MS,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }
}

impl DispatchConfig {
    pub fn inline() -> Self {
        Self {
            mode: DispatchMode::Inline,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    slow: Duration,
    handler_timeout: Duration,
    drain_timeout: Duration,
}

impl From<&DispatchConfig> for Timing {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            slow: Duration::from_millis(config.slow_handler_ms),
            handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        }
    }
}

type Target = (String, Arc<dyn DeliveryHandler>);

/// One send's worth of notifications, in delivery order
struct DispatchJob {
    message: Message,
    targets: Vec<Target>,
}

/// Handler registry plus the machinery that invokes handlers
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn DeliveryHandler>>>>,
    worker: Option<Arc<Worker>>,
    timing: Timing,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig) -> Result<Self, CourierError> {
        let timing = Timing::from(config);
        let worker = match config.mode {
            DispatchMode::Inline => None,
            DispatchMode::Background => Some(Arc::new(Worker::spawn(timing)?)),
        };

        Ok(Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            worker,
            timing,
        })
    }

    /// Set the handler for `username`. Returns true if it replaced an existing one.
    pub fn register(&self, username: &str, handler: Arc<dyn DeliveryHandler>) -> bool {
        let replaced = self
            .handlers
            .write()
            .insert(username.to_string(), handler)
            .is_some();
        debug!("Registered delivery handler for {} (replaced: {})", username, replaced);
        replaced
    }

    /// Remove the handler for `username`. Returns false if none was registered.
    pub fn unregister(&self, username: &str) -> bool {
        self.handlers.write().remove(username).is_some()
    }

    /// Remove the handler for `username` only if it is still `handler`
    pub fn release(&self, username: &str, handler: &Arc<dyn DeliveryHandler>) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get(username) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                handlers.remove(username);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, username: &str) -> bool {
        self.handlers.read().contains_key(username)
    }

    /// Notify the handlers of `recipients`, in the given order.
    ///
    /// Recipients without a handler are skipped. A recipient listed twice is
    /// notified twice. In background mode a recipient whose handler is stuck
    /// is passed over, and later recipients are not kept waiting for it.
    pub fn dispatch(&self, message: &Message, recipients: &[String]) {
        let targets: Vec<Target> = {
            let handlers = self.handlers.read();
            recipients
                .iter()
                .filter_map(|name| {
                    handlers
                        .get(name)
                        .map(|handler| (name.clone(), Arc::clone(handler)))
                })
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let job = DispatchJob {
            message: message.clone(),
            targets,
        };

        match &self.worker {
            Some(worker) => {
                if let Err(job) = worker.submit(job) {
                    warn!(
                        "Dispatch worker stopped; delivering message {} inline",
                        job.message.id
                    );
                    run_job(&job, self.timing.slow);
                }
            }
            None => run_job(&job, self.timing.slow),
        }
    }

    /// Stop accepting background jobs and wait, at most the drain timeout,
    /// for queued deliveries. Returns false if deliveries were left running.
    pub fn drain(&self) -> bool {
        match &self.worker {
            Some(worker) => worker.shutdown(),
            None => true,
        }
    }
}

fn run_job(job: &DispatchJob, slow: Duration) {
    for (username, handler) in &job.targets {
        run_delivery(username, handler.as_ref(), &job.message, slow);
    }
}

fn run_delivery(username: &str, handler: &dyn DeliveryHandler, message: &Message, slow: Duration) {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.deliver(message)));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            "Delivery of message {} to {} failed: {:#}",
            message.id, username, e
        ),
        Err(_) => warn!(
            "Delivery handler for {} panicked on message {}",
            username, message.id
        ),
    }

    let elapsed = started.elapsed();
    if elapsed > slow {
        warn!(
            "Delivery handler for {} took {:?} on message {}",
            username, elapsed, message.id
        );
    }
}

/// A single delivery handed to a lane
struct LaneJob {
    message: Message,
    handler: Arc<dyn DeliveryHandler>,
    done: std_mpsc::SyncSender<()>,
}

/// One recipient's delivery thread. Deliveries to the same user run one at a
/// time, in the order the coordinator handed them over.
struct Lane {
    tx: mpsc::UnboundedSender<LaneJob>,
    /// Set while a delivery has outlived the handler timeout
    stalled: Arc<AtomicBool>,
}

impl Lane {
    fn spawn(
        username: &str,
        slow: Duration,
        exited: std_mpsc::Sender<String>,
    ) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
        let stalled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stalled);
        let name = username.to_string();

        std::thread::Builder::new()
            .name(format!("courier-deliver-{}", username))
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_delivery(&name, job.handler.as_ref(), &job.message, slow);
                    flag.store(false, Ordering::SeqCst);
                    // the coordinator may have stopped waiting
                    let _ = job.done.try_send(());
                }
                let _ = exited.send(name);
            })?;

        Ok(Self { tx, stalled })
    }
}

/// Runs on the dispatch thread: fans each job out to the recipients' lanes
struct Coordinator {
    lanes: HashMap<String, Lane>,
    timing: Timing,
    exited_tx: std_mpsc::Sender<String>,
    exited_rx: std_mpsc::Receiver<String>,
}

impl Coordinator {
    fn new(timing: Timing) -> Self {
        let (exited_tx, exited_rx) = std_mpsc::channel();
        Self {
            lanes: HashMap::new(),
            timing,
            exited_tx,
            exited_rx,
        }
    }

    fn run_job(&mut self, job: DispatchJob) {
        for (username, handler) in job.targets {
            self.deliver(username, handler, &job.message);
        }
    }

    fn deliver(&mut self, username: String, handler: Arc<dyn DeliveryHandler>, message: &Message) {
        if !self.lanes.contains_key(&username) {
            match Lane::spawn(&username, self.timing.slow, self.exited_tx.clone()) {
                Ok(lane) => {
                    self.lanes.insert(username.clone(), lane);
                }
                Err(e) => {
                    warn!(
                        "Failed to start delivery lane for {}: {}; delivering inline",
                        username, e
                    );
                    run_delivery(&username, handler.as_ref(), message, self.timing.slow);
                    return;
                }
            }
        }
        let Some(lane) = self.lanes.get(&username) else {
            return;
        };

        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        let job = LaneJob {
            message: message.clone(),
            handler,
            done: done_tx,
        };
        if lane.tx.send(job).is_err() {
            warn!(
                "Delivery lane for {} is gone; dropping message {}",
                username, message.id
            );
            return;
        }

        if lane.stalled.load(Ordering::SeqCst) {
            debug!(
                "Message {} queued for {} behind a stuck handler",
                message.id, username
            );
            return;
        }

        if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(self.timing.handler_timeout) {
            lane.stalled.store(true, Ordering::SeqCst);
            warn!(
                "Delivery handler for {} still running after {:?} on message {}; moving on",
                username, self.timing.handler_timeout, message.id
            );
        }
    }

    /// Close every lane and wait for them to finish their queues, up to `deadline`
    fn close(self, deadline: Instant) {
        let Coordinator {
            lanes,
            exited_tx,
            exited_rx,
            ..
        } = self;
        drop(exited_tx);

        // dropping each lane's sender ends its loop once its queue is empty
        let mut pending: HashSet<String> = lanes.into_keys().collect();
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match exited_rx.recv_timeout(remaining) {
                Ok(name) => {
                    pending.remove(&name);
                }
                Err(_) => break,
            }
        }

        if !pending.is_empty() {
            warn!("Delivery lanes still busy at shutdown: {:?}", pending);
        }
    }
}

/// Background dispatch thread draining jobs in FIFO order
struct Worker {
    tx: Mutex<Option<mpsc::UnboundedSender<DispatchJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<std_mpsc::Receiver<()>>,
    drain_timeout: Duration,
}

impl Worker {
    fn spawn(timing: Timing) -> Result<Self, CourierError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("courier-dispatch".to_string())
            .spawn(move || {
                let mut coordinator = Coordinator::new(timing);
                while let Some(job) = rx.blocking_recv() {
                    coordinator.run_job(job);
                }
                coordinator.close(Instant::now() + timing.drain_timeout);
                debug!("Dispatch worker stopped");
                let _ = done_tx.send(());
            })
            .map_err(|e| CourierError::Internal(format!("Failed to spawn dispatch worker: {}", e)))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            done: Mutex::new(done_rx),
            drain_timeout: timing.drain_timeout,
        })
    }

    fn submit(&self, job: DispatchJob) -> Result<(), DispatchJob> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    fn shutdown(&self) -> bool {
        // Dropping the sender lets the worker finish the queue and exit
        self.tx.lock().take();

        let Some(handle) = self.handle.lock().take() else {
            return true;
        };
        if handle.thread().id() == std::thread::current().id() {
            return false;
        }

        match self.done.lock().recv_timeout(self.drain_timeout) {
            Ok(()) => {
                if handle.join().is_err() {
                    warn!("Dispatch worker exited abnormally");
                }
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Dispatch worker exited abnormally");
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Dispatch worker still busy after {:?}; leaving it behind",
                    self.drain_timeout
                );
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
