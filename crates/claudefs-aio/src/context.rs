//! Per-file AIO engine.
//!
//! An [`IoContext`] owns an open file, a kernel AIO context and two worker
//! threads. Callers submit reads and writes; the harvest thread reaps kernel
//! completions, frees gate slots and classifies latency; the dispatch thread
//! runs the slow-disk detector and invokes each request's callback.
//!
//! ```text
//!  submit ──▶ gate ──▶ pool ──▶ io_submit
//!                                   │
//!  harvest:  io_getevents ──▶ classify ──▶ queue (or inline callback)
//!                                              │
//!  dispatch: take ──▶ detector ──▶ callback ──▶ pool
//! ```

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::AlignedBuffer;
use crate::clock;
use crate::config::{AioConfig, SlowDiskConfig, SlowDiskPolicy};
use crate::detector::{SlowDiskCallback, SlowDiskDetector, SlowDiskReport};
use crate::error::{AioError, AioResult};
use crate::gate::SubmissionGate;
use crate::pattern::{CompletedIo, HarvestBatch, IoClass, IoPatternState, PatternClassifier};
use crate::pool::{ControlBlockPool, SlotId};
use crate::queue::HandoffQueue;
use crate::stats::{AioStats, AioStatsSnapshot};
use crate::sys::{AioBackend, IoEvent, IoOp, Iocb, LinuxAio};

/// Completion notification, invoked exactly once per submission.
pub type IoCallback = Box<dyn FnOnce(IoCompletion) + Send + 'static>;

/// Outcome of one submitted request.
#[derive(Debug)]
pub struct IoCompletion {
    /// Operation kind.
    pub op: IoOp,
    /// File offset the request targeted.
    pub offset: u64,
    /// Bytes transferred, or why the request failed.
    pub result: AioResult<usize>,
    /// The request's buffer, handed back to the caller.
    pub buffer: AlignedBuffer,
}

/// Lifecycle of an [`IoContext`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextState {
    /// Resources being set up.
    Open = 0,
    /// Accepting submissions.
    Running = 1,
    /// Close requested; waiting for in-flight requests.
    Stopping = 2,
    /// Harvest finished; dispatch draining the queue.
    Draining = 3,
    /// Both workers exited.
    Closed = 4,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Open,
            1 => ContextState::Running,
            2 => ContextState::Stopping,
            3 => ContextState::Draining,
            _ => ContextState::Closed,
        }
    }
}

struct DiskCheck {
    policy: SlowDiskPolicy,
    detector: Mutex<Option<SlowDiskDetector>>,
    notify: Mutex<Option<SlowDiskCallback>>,
}

struct Shared {
    path: String,
    config: AioConfig,
    file: Mutex<Option<File>>,
    backend: Mutex<Option<Arc<dyn AioBackend>>>,
    state: AtomicU8,
    gate: SubmissionGate,
    pool: ControlBlockPool,
    queue: HandoffQueue<SlotId>,
    pattern: IoPatternState,
    disk_check: OnceLock<DiskCheck>,
    disk_slow: AtomicBool,
    submitting: AtomicUsize,
    harvest_finished: AtomicBool,
    dispatch_finished: AtomicBool,
    stats: AioStats,
}

/// Counts a caller inside `submit` so harvest does not exit under it.
struct SubmitGuard<'a>(&'a AtomicUsize);

impl<'a> SubmitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ContextState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn policy(&self) -> SlowDiskPolicy {
        self.disk_check
            .get()
            .map(|check| check.policy)
            .unwrap_or(SlowDiskPolicy::Disabled)
    }

    /// Descriptor and backend for a new submission; `None` once released.
    fn io_handles(&self) -> Option<(RawFd, Arc<dyn AioBackend>)> {
        let fd = self.file.lock().as_ref()?.as_raw_fd();
        let backend = self.backend.lock().clone()?;
        Some((fd, backend))
    }

    /// Frees what the workers used. Only called once both have been joined.
    fn release_resources(&self) {
        let leftover = self.pool.clear();
        if leftover > 0 {
            warn!("{}: {} control blocks still held a request at close", self.path, leftover);
        }
        if let Some(check) = self.disk_check.get() {
            check.detector.lock().take();
            check.notify.lock().take();
        }
        // Dropping the backend destroys the kernel context; the file closes its descriptor.
        self.backend.lock().take();
        self.file.lock().take();
    }

    fn harvest_loop(&self) {
        let Some(backend) = self.backend.lock().clone() else {
            error!("{}: harvest started without a backend", self.path);
            self.harvest_finished.store(true, Ordering::SeqCst);
            return;
        };
        let mut classifier = PatternClassifier::new();
        let mut events = vec![IoEvent::default(); self.config.max_events];
        let poll = self.config.poll_interval();

        loop {
            let batch_start = clock::now_ns();
            let reaped = match backend.get_events(&mut events, poll) {
                Ok(n) => n,
                Err(e) => {
                    error!("{}: io_getevents failed: {}", self.path, e);
                    thread::sleep(Duration::from_millis(10));
                    0
                }
            };

            if reaped == 0 {
                // Submitters are checked before in-flight: a request counted
                // by neither cannot exist once the state is Stopping.
                if self.state() >= ContextState::Stopping
                    && self.submitting.load(Ordering::SeqCst) == 0
                    && self.gate.in_flight() == 0
                {
                    break;
                }
                continue;
            }

            let completed_at_ns = clock::now_ns();
            let batch = HarvestBatch {
                start_ns: batch_start,
                events: reaped,
                in_flight: self.gate.in_flight(),
            };
            self.gate.release(reaped as u32);
            let policy = self.policy();

            for event in &events[..reaped] {
                let slot = SlotId::from_user_data(event.data);
                if !self.pool.contains(slot) {
                    error!(
                        "{}: completion for unknown slot {} (res={})",
                        self.path, event.data, event.res
                    );
                    continue;
                }

                {
                    let mut block = self.pool.slot(slot);
                    block.res = event.res;
                    block.res2 = event.res2;
                    block.completed_at_ns = completed_at_ns;
                    if let Some(op) = block.op {
                        let io = CompletedIo {
                            op,
                            offset: block.offset,
                            len: block.len,
                            submitted_at_ns: block.submitted_at_ns,
                            completed_at_ns,
                            contiguous: block.contiguous,
                        };
                        if let Some(c) = classifier.classify(policy, &io, &batch) {
                            block.io_class = c.class;
                            block.cost_ns = c.cost_ns;
                        }
                    }
                }

                if let Err(slot) = self.queue.offer(slot) {
                    self.stats.add_inline_dispatch();
                    debug!(
                        "{}: hand-off queue full ({}), completing inline",
                        self.path,
                        self.queue.capacity()
                    );
                    self.complete(slot, false);
                }
            }
        }

        self.harvest_finished.store(true, Ordering::SeqCst);
        debug!("{}: harvest thread finished", self.path);
    }

    fn dispatch_loop(&self) {
        let poll = self.config.poll_interval();
        loop {
            let batch = self.queue.take(self.config.dispatch_batch, poll);
            if batch.is_empty() {
                if self.state() >= ContextState::Stopping
                    && self.harvest_finished.load(Ordering::SeqCst)
                    && self.queue.is_empty()
                    && self.gate.in_flight() == 0
                {
                    break;
                }
                continue;
            }
            for slot in batch {
                self.complete(slot, true);
            }
        }

        self.dispatch_finished.store(true, Ordering::SeqCst);
        debug!("{}: dispatch thread finished", self.path);
    }

    /// Finishes a harvested request: detector, callback, slot back to the pool.
    fn complete(&self, slot: SlotId, check_latency: bool) {
        let (op, offset, len, res, class, cost_ns, buffer, callback) = {
            let mut block = self.pool.slot(slot);
            (
                block.op,
                block.offset,
                block.len,
                block.res,
                block.io_class,
                block.cost_ns,
                block.buffer.take(),
                block.callback.take(),
            )
        };

        let Some(op) = op else {
            error!("{}: slot {} completed without a request", self.path, slot.0);
            self.pool.release(slot);
            return;
        };

        if check_latency && class != IoClass::Unclassified {
            self.check_latency(op, class, cost_ns);
        }

        self.stats.add_completion(res.max(0) as u64);
        let result = if res < 0 {
            self.stats.add_error();
            warn!(
                "{}: {} offset={} len={} failed: errno {}",
                self.path,
                op.as_str(),
                offset,
                len,
                -res
            );
            Err(AioError::Io(std::io::Error::from_raw_os_error(-res as i32)))
        } else if res as u64 != len {
            self.stats.add_error();
            warn!(
                "{}: {} offset={} short transfer {}/{}",
                self.path,
                op.as_str(),
                offset,
                res,
                len
            );
            Err(AioError::ShortTransfer {
                expected: len,
                actual: res,
            })
        } else {
            trace!("{}: {} offset={} len={} done", self.path, op.as_str(), offset, len);
            Ok(res as usize)
        };

        match (buffer, callback) {
            (Some(buffer), Some(callback)) => callback(IoCompletion {
                op,
                offset,
                result,
                buffer,
            }),
            _ => error!("{}: slot {} lost its buffer or callback", self.path, slot.0),
        }
        self.pool.release(slot);
    }

    fn check_latency(&self, op: IoOp, class: IoClass, cost_ns: u64) {
        if self.disk_slow.load(Ordering::Acquire) {
            return;
        }
        let Some(check) = self.disk_check.get() else {
            return;
        };
        let Some(report) = check
            .detector
            .lock()
            .as_mut()
            .and_then(|detector| detector.observe(op, class, cost_ns))
        else {
            return;
        };

        if self
            .disk_slow
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!(
                "{}: disk flagged slow by {} window under {:?} policy",
                self.path, report.window, report.policy
            );
            if let Some(notify) = check.notify.lock().take() {
                notify(report);
            }
        }
    }
}

/// Asynchronous I/O engine bound to one file.
pub struct IoContext {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoContext {
    /// Opens `path` for reading and writing (creating it if needed) on a
    /// kernel AIO context.
    pub fn open(path: impl AsRef<Path>, config: AioConfig) -> AioResult<Self> {
        config.validate()?;
        let path = path.as_ref();
        let file = open_file(path, config.direct_io)?;
        let backend = LinuxAio::setup(config.aio_nr)?;
        debug!(
            "{}: kernel AIO context sized for {} events, depth {}",
            path.display(),
            backend.nr_events(),
            config.io_depth
        );
        Self::start(path, file, config, Arc::new(backend))
    }

    /// Opens `path` on a caller-supplied backend.
    pub fn open_with_backend(
        path: impl AsRef<Path>,
        config: AioConfig,
        backend: Arc<dyn AioBackend>,
    ) -> AioResult<Self> {
        config.validate()?;
        let path = path.as_ref();
        let file = open_file(path, config.direct_io)?;
        Self::start(path, file, config, backend)
    }

    fn start(
        path: &Path,
        file: File,
        config: AioConfig,
        backend: Arc<dyn AioBackend>,
    ) -> AioResult<Self> {
        clock::init();
        let name = path.display().to_string();
        let shared = Arc::new(Shared {
            gate: SubmissionGate::new(name.clone(), config.io_depth, config.poll_interval()),
            pool: ControlBlockPool::for_depth(config.io_depth as usize, config.pool_slack()),
            queue: HandoffQueue::new(name.clone(), config.queue_capacity),
            pattern: IoPatternState::new(),
            path: name,
            file: Mutex::new(Some(file)),
            backend: Mutex::new(Some(backend)),
            state: AtomicU8::new(ContextState::Open as u8),
            disk_check: OnceLock::new(),
            disk_slow: AtomicBool::new(false),
            submitting: AtomicUsize::new(0),
            harvest_finished: AtomicBool::new(false),
            dispatch_finished: AtomicBool::new(false),
            stats: AioStats::default(),
            config,
        });

        let harvest = spawn_worker("aio-harvest", &shared, Shared::harvest_loop)?;
        let dispatch = match spawn_worker("aio-dispatch", &shared, Shared::dispatch_loop) {
            Ok(handle) => handle,
            Err(e) => {
                shared.set_state(ContextState::Stopping);
                if harvest.join().is_err() {
                    error!("{}: harvest thread panicked", shared.path);
                }
                return Err(e);
            }
        };

        shared.set_state(ContextState::Running);
        info!(
            "opened {}: depth={} direct_io={} pool={} queue={}",
            shared.path,
            shared.config.io_depth,
            shared.config.direct_io,
            shared.pool.capacity(),
            shared.config.queue_capacity
        );
        Ok(Self {
            shared,
            workers: Mutex::new(vec![harvest, dispatch]),
        })
    }

    /// Submits a read filling `buffer` from `offset`.
    pub fn submit_read<F>(&self, buffer: AlignedBuffer, offset: u64, callback: F)
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit(IoOp::Read, buffer, offset, Box::new(callback));
    }

    /// Submits a write of `buffer` at `offset`.
    pub fn submit_write<F>(&self, buffer: AlignedBuffer, offset: u64, callback: F)
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit(IoOp::Write, buffer, offset, Box::new(callback));
    }

    /// Submits one request; blocks while the context is at its depth.
    ///
    /// `callback` runs exactly once: with the kernel's result on a worker
    /// thread, or with an error on the calling thread if the request could
    /// not be issued.
    pub fn submit(&self, op: IoOp, mut buffer: AlignedBuffer, offset: u64, callback: IoCallback) {
        let shared = &*self.shared;
        let _guard = SubmitGuard::enter(&shared.submitting);

        let handles = match shared.state() {
            ContextState::Running => shared.io_handles(),
            _ => None,
        };
        let Some((fd, backend)) = handles else {
            debug!("{}: {} rejected, context closed", shared.path, op.as_str());
            shared.stats.add_submit_failure();
            callback(IoCompletion {
                op,
                offset,
                result: Err(AioError::Closed),
                buffer,
            });
            return;
        };

        shared.gate.acquire();

        let Some(slot) = shared.pool.acquire() else {
            error!(
                "{}: control-block pool exhausted ({} blocks)",
                shared.path,
                shared.pool.capacity()
            );
            shared.gate.release(1);
            shared.stats.add_submit_failure();
            callback(IoCompletion {
                op,
                offset,
                result: Err(AioError::ResourceExhausted {
                    resource: "control-block pool",
                }),
                buffer,
            });
            return;
        };

        let contiguous = shared.pattern.on_submit(op);
        let len = buffer.len() as u64;
        let mut iocb = Iocb::prep(
            op,
            fd,
            buffer.as_mut_ptr(),
            len,
            offset,
            slot.as_user_data(),
        );
        {
            let mut block = shared.pool.slot(slot);
            block.op = Some(op);
            block.len = len;
            block.offset = offset;
            block.contiguous = contiguous;
            block.index = shared.stats.add_submit(op);
            block.buffer = Some(buffer);
            block.callback = Some(callback);
            block.submitted_at_ns = clock::now_ns();
        }

        if let Err(e) = backend.submit(&mut iocb) {
            error!(
                "{}: {} offset={} len={} submit failed: {}",
                shared.path,
                op.as_str(),
                offset,
                len,
                e
            );
            let (buffer, callback) = {
                let mut block = shared.pool.slot(slot);
                (block.buffer.take(), block.callback.take())
            };
            shared.pool.release(slot);
            shared.gate.release(1);
            shared.stats.add_submit_failure();
            if let (Some(buffer), Some(callback)) = (buffer, callback) {
                callback(IoCompletion {
                    op,
                    offset,
                    result: Err(e),
                    buffer,
                });
            }
            return;
        }

        trace!(
            "{}: {} offset={} len={} submitted in slot {}",
            shared.path,
            op.as_str(),
            offset,
            len,
            slot.0
        );
    }

    /// Turns on slow-disk checking.
    ///
    /// `notify` fires at most once, on the dispatch thread, the first time a
    /// latency window reports slow. May only be called once per context; a
    /// [`Disabled`](SlowDiskPolicy::Disabled) policy counts as that call.
    pub fn enable_disk_check<F>(&self, config: SlowDiskConfig, notify: F) -> AioResult<()>
    where
        F: FnOnce(SlowDiskReport) + Send + 'static,
    {
        config.validate()?;
        let shared = &*self.shared;
        let detector = match config.policy {
            SlowDiskPolicy::Disabled => None,
            _ => Some(SlowDiskDetector::new(shared.path.clone(), config)?),
        };
        let check = DiskCheck {
            policy: config.policy,
            detector: Mutex::new(detector),
            notify: Mutex::new(Some(Box::new(notify))),
        };
        if shared.disk_check.set(check).is_err() {
            warn!("{}: disk check already enabled", shared.path);
            return Err(AioError::InvalidArgument(format!(
                "disk check already enabled for {}",
                shared.path
            )));
        }
        info!(
            "{}: disk check enabled, policy={:?} seq_threshold={}ns random_threshold={}ns",
            shared.path, config.policy, config.sequential_threshold_ns, config.random_threshold_ns
        );
        Ok(())
    }

    /// Stops the context, waiting for outstanding requests to complete.
    ///
    /// Each shutdown phase gets the configured close budget. Once both
    /// workers exit they are joined and the file descriptor, kernel context,
    /// detector and leftover control blocks are released. If a phase
    /// overruns, everything stays in place for the still-running workers and
    /// [`AioError::ShutdownIncomplete`] is returned; calling `close` again
    /// resumes waiting. Closing a closed context is a no-op.
    pub fn close(&self) -> AioResult<()> {
        let shared = &*self.shared;
        match shared.state.compare_exchange(
            ContextState::Running as u8,
            ContextState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => info!(
                "closing {}: in_flight={}",
                shared.path,
                shared.gate.in_flight()
            ),
            Err(current) => {
                let current = ContextState::from_u8(current);
                if current == ContextState::Closed {
                    warn!("{}: already closed", shared.path);
                    return Ok(());
                }
                warn!("{}: close retried in state {:?}", shared.path, current);
            }
        }

        let budget = shared.config.close_timeout();
        if !wait_for_flag(&shared.harvest_finished, budget) {
            return Err(self.shutdown_incomplete());
        }
        shared.set_state(ContextState::Draining);

        if !wait_for_flag(&shared.dispatch_finished, budget) {
            return Err(self.shutdown_incomplete());
        }

        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("{}: worker thread panicked", shared.path);
            }
        }
        shared.release_resources();
        shared.set_state(ContextState::Closed);
        info!("closed {}: {:?}", shared.path, shared.stats.snapshot());
        Ok(())
    }

    fn shutdown_incomplete(&self) -> AioError {
        let shared = &*self.shared;
        let harvest_finished = shared.harvest_finished.load(Ordering::SeqCst);
        let dispatch_finished = shared.dispatch_finished.load(Ordering::SeqCst);
        error!(
            "{}: close timed out after {:?}: harvest_finished={} dispatch_finished={} in_flight={}",
            shared.path,
            shared.config.close_timeout(),
            harvest_finished,
            dispatch_finished,
            shared.gate.in_flight()
        );
        AioError::ShutdownIncomplete {
            path: shared.path.clone(),
            harvest_finished,
            dispatch_finished,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AioStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Requests currently held by the kernel.
    pub fn in_flight(&self) -> u32 {
        self.shared.gate.in_flight()
    }

    /// Whether the slow-disk detector has fired.
    pub fn is_disk_slow(&self) -> bool {
        self.shared.disk_slow.load(Ordering::Acquire)
    }

    /// Path the context was opened on.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Configuration in effect.
    pub fn config(&self) -> &AioConfig {
        &self.shared.config
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if self.state() != ContextState::Closed {
            if let Err(e) = self.close() {
                error!("{}: close on drop failed: {}", self.shared.path, e);
            }
        }
    }
}

fn open_file(path: &Path, direct_io: bool) -> AioResult<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).mode(0o644);
    if direct_io {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path).map_err(|e| {
        error!("failed to open {}: {}", path.display(), e);
        AioError::Io(e)
    })
}

fn spawn_worker(
    role: &str,
    shared: &Arc<Shared>,
    body: fn(&Shared),
) -> AioResult<JoinHandle<()>> {
    let name = format!("{}-{}", role, clock::next_thread_index());
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            debug!("{} started for {}", name, shared.path);
            body(&shared);
        })
        .map_err(|e| {
            error!("failed to spawn {} thread: {}", role, e);
            AioError::Io(e)
        })
}

fn wait_for_flag(flag: &AtomicBool, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while !flag.load(Ordering::SeqCst) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}
