//! The key-indexed push/pull synchronization engine.
//!
//! Each key runs an independent state machine: devices push their
//! contributions, the last arrival triggers the finish handler (reduce,
//! optionally update weights server-side), and pull workers deliver the
//! authoritative result back to every device that asked for it. Double
//! buffering lets the next round's pushes stage while the previous
//! round's result is still being drained.

mod pull;
mod push;

pub use pull::PullCallback;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::{EngineConfig, ThreadMode};
use crate::device::DeviceRuntime;
use crate::keymap::KeyMap;
use crate::queue::TaskQueue;
use crate::reduce;
use crate::types::{DataType, DeviceId, Key, Priority, PushOp, Shape2, TensorView};
use crate::updater::{ModelUpdater, SgdUpdater, UpdaterFactory};

use pull::{PullEntry, SrcView};
use push::{PushEntry, PushTask};

/// Which devices a worker thread serves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WorkerScope {
    /// One worker per device; `tid` is the work index it owns.
    PerDevice(usize),
    /// A single worker serving every device through the shared queue.
    Global,
}

impl WorkerScope {
    fn work_indices(self, ndevice: usize) -> Vec<usize> {
        match self {
            WorkerScope::PerDevice(tid) => vec![tid],
            WorkerScope::Global => (0..ndevice).collect(),
        }
    }
}

/// State shared between the public API and the worker threads.
pub(crate) struct Inner {
    pub runtime: Arc<dyn DeviceRuntime>,
    pub cfg: EngineConfig,
    pub devices: Vec<DeviceId>,
    pub dev2index: HashMap<DeviceId, usize>,
    pub push_queues: Vec<TaskQueue<PushTask>>,
    pub pull_queues: Vec<TaskQueue<(Key, DeviceId)>>,
    pub push_map: KeyMap<PushEntry>,
    pub pull_map: KeyMap<PullEntry>,
    pub updater: Option<Mutex<Box<dyn ModelUpdater>>>,
    pub destroy: AtomicBool,
}

impl Inner {
    /// Compact work index for a device id. Unknown ids are a program
    /// bug and abort.
    pub fn work_index(&self, devid: DeviceId) -> usize {
        *self
            .dev2index
            .get(&devid)
            .unwrap_or_else(|| panic!("unknown device id {devid}"))
    }

    fn push_queue(&self, wid: usize) -> &TaskQueue<PushTask> {
        match self.cfg.push_mode {
            ThreadMode::PerDevice => &self.push_queues[wid],
            ThreadMode::Single => &self.push_queues[0],
        }
    }

    fn pull_queue(&self, wid: usize) -> &TaskQueue<(Key, DeviceId)> {
        match self.cfg.pull_mode {
            ThreadMode::PerDevice => &self.pull_queues[wid],
            ThreadMode::Single => &self.pull_queues[0],
        }
    }
}

/// Runs exactly once per completed rendezvous, outside the rendezvous
/// lock: applies the key's op to the frozen slot, optionally feeds the
/// updater, then marks the pull side ready.
pub(crate) fn handle_push_finish(inner: &Inner, entry: &PushEntry, key: Key, version: usize) {
    let shape = entry.shape;
    let slot = entry.slot_ptr(version);

    if let Some(updater) = &inner.updater {
        // Server path always reduces by sum, whatever the key's op.
        unsafe {
            reduce::reduce_sum(
                slot,
                entry.ndevice,
                shape.rows,
                shape.cols,
                entry.dtype,
                inner.cfg.reduce_threads,
                inner.cfg.bigarray_bound,
            )
            .expect("sum reduction failed");
            updater
                .lock()
                .unwrap()
                .update(key, slot, shape.nelem(), entry.dtype);
        }
        let weight = entry.weight.as_ref().expect("weight buffer in server mode");
        pull_ready(
            inner,
            key,
            SrcView {
                ptr: weight.as_u64(),
                len_bytes: entry.plane_bytes(),
            },
        );
        return;
    }

    match inner.cfg.push_op(key) {
        PushOp::Sum => {
            unsafe {
                reduce::reduce_sum(
                    slot,
                    entry.ndevice,
                    shape.rows,
                    shape.cols,
                    entry.dtype,
                    inner.cfg.reduce_threads,
                    inner.cfg.bigarray_bound,
                )
                .expect("sum reduction failed");
            }
            pull_ready(
                inner,
                key,
                SrcView {
                    ptr: slot,
                    len_bytes: entry.plane_bytes(),
                },
            );
        }
        PushOp::Gather => {
            // Concatenation is a view: the slot already holds the
            // per-device planes back to back.
            pull_ready(
                inner,
                key,
                SrcView {
                    ptr: slot,
                    len_bytes: entry.ndevice * entry.plane_bytes(),
                },
            );
        }
    }
}

/// Publish `src` as the authoritative value for `key` and release every
/// pending pull request.
pub(crate) fn pull_ready(inner: &Inner, key: Key, src: SrcView) {
    let entry = inner.pull_map.get_ref(key);
    let mut state = entry.requests.lock().unwrap();
    state.src = Some(src);
    for wid in 0..inner.devices.len() {
        let record = &mut state.req[wid];
        record.ready = true;
        if record.pending {
            record.pending = false;
            inner
                .pull_queue(wid)
                .push((key, inner.devices[wid]), record.priority);
        }
    }
}

/// Local multi-threaded parameter synchronization engine.
///
/// Configure with [`set_param`](Self::set_param), fix the device set
/// with [`init`](Self::init), then drive the per-key push/pull cycle
/// from the training loop. Dropping the engine aborts the queues, joins
/// every worker, and releases all per-key state.
///
/// Usage errors (data operations before `init`, unknown device ids or
/// keys, mismatched shapes, duplicate pending pull requests) indicate a
/// bug in the calling program; the engine cannot recover from them and
/// aborts with a message. Device runtime failures are fatal the same
/// way.
pub struct LocalEngine {
    runtime: Arc<dyn DeviceRuntime>,
    config: EngineConfig,
    updater_factory: Option<UpdaterFactory>,
    inner: Option<Arc<Inner>>,
    workers: Vec<JoinHandle<()>>,
}

impl LocalEngine {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self::with_config(runtime, EngineConfig::default())
    }

    pub fn with_config(runtime: Arc<dyn DeviceRuntime>, config: EngineConfig) -> Self {
        Self {
            runtime,
            config,
            updater_factory: None,
            inner: None,
            workers: Vec::new(),
        }
    }

    /// Apply one configuration pair. Only valid before `init`: the
    /// configuration is frozen once workers start, so the finish handler
    /// can read it without locks.
    pub fn set_param(&mut self, name: &str, value: &str) {
        assert!(
            self.inner.is_none(),
            "set_param after init: configuration is frozen once workers start"
        );
        self.config.set(name, value);
    }

    /// Install the factory used to construct the server-side updater
    /// when `update_on_server` is set. Without one, a plain SGD updater
    /// is built.
    pub fn set_updater_factory<F>(&mut self, factory: F)
    where
        F: FnOnce() -> Box<dyn ModelUpdater> + Send + Sync + 'static,
    {
        assert!(
            self.inner.is_none(),
            "set_updater_factory after init: configuration is frozen once workers start"
        );
        self.updater_factory = Some(Box::new(factory));
    }

    /// Fix the device set and start the worker pools. Callable exactly
    /// once, with a non-empty list of distinct device ids.
    pub fn init(&mut self, devices: &[DeviceId]) {
        assert!(self.inner.is_none(), "init may only be called once");
        assert!(!devices.is_empty(), "init must at least contain 1 device");
        let mut dev2index = HashMap::new();
        for (i, &devid) in devices.iter().enumerate() {
            assert!(
                dev2index.insert(devid, i).is_none(),
                "duplicate device id {devid} in init"
            );
        }

        let updater = if self.config.update_on_server {
            let mut updater: Box<dyn ModelUpdater> = match self.updater_factory.take() {
                Some(factory) => factory(),
                None => Box::new(SgdUpdater::default()),
            };
            for (name, value) in &self.config.history {
                updater.set_param(name, value);
            }
            updater.init_updater(0, &[]);
            Some(Mutex::new(updater))
        } else {
            None
        };

        let npush = match self.config.push_mode {
            ThreadMode::PerDevice => devices.len(),
            ThreadMode::Single => 1,
        };
        let npull = match self.config.pull_mode {
            ThreadMode::PerDevice => devices.len(),
            ThreadMode::Single => 1,
        };
        let inner = Arc::new(Inner {
            runtime: Arc::clone(&self.runtime),
            cfg: self.config.clone(),
            devices: devices.to_vec(),
            dev2index,
            push_queues: (0..npush).map(|_| TaskQueue::new()).collect(),
            pull_queues: (0..npull).map(|_| TaskQueue::new()).collect(),
            push_map: KeyMap::new(),
            pull_map: KeyMap::new(),
            updater,
            destroy: AtomicBool::new(false),
        });

        let mut workers = Vec::new();
        match self.config.push_mode {
            ThreadMode::PerDevice => {
                for tid in 0..devices.len() {
                    let inner = Arc::clone(&inner);
                    workers.push(std::thread::spawn(move || {
                        push::push_worker(inner, WorkerScope::PerDevice(tid))
                    }));
                }
            }
            ThreadMode::Single => {
                let inner = Arc::clone(&inner);
                workers.push(std::thread::spawn(move || {
                    push::push_worker(inner, WorkerScope::Global)
                }));
            }
        }
        match self.config.pull_mode {
            ThreadMode::PerDevice => {
                for tid in 0..devices.len() {
                    let inner = Arc::clone(&inner);
                    workers.push(std::thread::spawn(move || {
                        pull::pull_worker(inner, WorkerScope::PerDevice(tid))
                    }));
                }
            }
            ThreadMode::Single => {
                let inner = Arc::clone(&inner);
                workers.push(std::thread::spawn(move || {
                    pull::pull_worker(inner, WorkerScope::Global)
                }));
            }
        }

        tracing::debug!(
            ndevice = devices.len(),
            push_workers = npush,
            pull_workers = npull,
            "engine initialized"
        );
        self.inner = Some(inner);
        self.workers = workers;
    }

    fn inner(&self) -> &Arc<Inner> {
        self.inner
            .as_ref()
            .expect("engine not initialized: call init before data operations")
    }

    /// Create the push/pull state for `key` if absent. Idempotent; the
    /// first caller fixes the shape and dtype, later callers must match.
    pub fn init_key(&self, shape: Shape2, dtype: DataType, key: Key, devid: DeviceId) {
        let inner = self.inner();
        inner.work_index(devid);
        let ndevice = inner.devices.len();
        inner.pull_map.init_with(key, || PullEntry::new(ndevice));
        let need_weight = inner.updater.is_some();
        let (entry, created) = inner.push_map.init_with(key, || {
            PushEntry::new(
                Arc::clone(&inner.runtime),
                ndevice,
                shape,
                dtype,
                inner.cfg.use_pin_memory,
                need_weight,
            )
            .unwrap_or_else(|e| panic!("allocating staging for key {key} failed: {e}"))
        });
        assert_eq!(
            entry.shape, shape,
            "tensors with key {key} must share the same shape"
        );
        assert_eq!(
            entry.dtype, dtype,
            "tensors with key {key} must share the same dtype"
        );
        if created {
            if let Some(updater) = &inner.updater {
                // Register the zeroed weight buffer and make the key
                // immediately pullable, so clients can fetch initial
                // weights before the first push.
                let weight = entry.weight.as_ref().expect("weight buffer in server mode");
                unsafe {
                    updater
                        .lock()
                        .unwrap()
                        .init_model(key, weight.as_u64(), shape.nelem(), dtype);
                }
                pull_ready(
                    inner,
                    key,
                    SrcView {
                        ptr: weight.as_u64(),
                        len_bytes: entry.plane_bytes(),
                    },
                );
            }
        }
    }

    /// Enqueue `devid`'s contribution for `key`.
    ///
    /// Clears the device's `ready` edge first, so a pull request that
    /// follows this push waits for the new rendezvous instead of racing
    /// against the previous result.
    pub fn push(&self, tensor: TensorView, key: Key, devid: DeviceId, priority: Priority) {
        let inner = self.inner();
        let wid = inner.work_index(devid);
        let push_entry = inner
            .push_map
            .get(key)
            .unwrap_or_else(|| panic!("key {key} not initialized: call init_key before push"));
        assert_eq!(
            push_entry.shape,
            tensor.shape(),
            "tensors with key {key} must share the same shape"
        );
        assert_eq!(
            push_entry.dtype,
            tensor.dtype(),
            "tensors with key {key} must share the same dtype"
        );
        let pull_entry = inner.pull_map.get_ref(key);
        pull_entry.requests.lock().unwrap().req[wid].ready = false;
        inner
            .push_queue(wid)
            .push(PushTask { tensor, key, devid }, priority);
    }

    /// Register `dest` to receive the authoritative value for `key`.
    ///
    /// At most one pull request may be outstanding per `(key, devid)`.
    /// The optional callback fires on the pull worker after the copy is
    /// enqueued and before the stream drains.
    pub fn pull_req(
        &self,
        dest: TensorView,
        key: Key,
        devid: DeviceId,
        priority: Priority,
        callback: Option<PullCallback>,
    ) {
        let inner = self.inner();
        let wid = inner.work_index(devid);
        let entry = inner
            .pull_map
            .get(key)
            .unwrap_or_else(|| panic!("key {key} not initialized: call init_key before pull_req"));
        let push_entry = inner
            .push_map
            .get(key)
            .unwrap_or_else(|| panic!("key {key} not initialized: call init_key before pull_req"));

        let expected = if inner.updater.is_none() && inner.cfg.push_op(key) == PushOp::Gather {
            Shape2::new(
                push_entry.shape.rows * push_entry.ndevice,
                push_entry.shape.cols,
            )
        } else {
            push_entry.shape
        };
        assert_eq!(
            dest.dtype(),
            push_entry.dtype,
            "pull destination for key {key} must share the key's dtype"
        );
        assert_eq!(
            dest.nelem(),
            expected.nelem(),
            "pull destination for key {key} must hold {expected} elements"
        );

        {
            let mut state = entry.requests.lock().unwrap();
            let record = &mut state.req[wid];
            assert!(
                !record.pending,
                "key = {key}, cannot send duplicate pull request before it finishes"
            );
            record.dest = Some(dest);
            record.priority = priority;
            record.callback = callback;
        }
        {
            let mut wait = entry.wait.lock().unwrap();
            wait[wid].finished = false;
        }
        {
            let mut state = entry.requests.lock().unwrap();
            let record = &mut state.req[wid];
            if record.ready {
                inner.pull_queue(wid).push((key, devid), priority);
            } else {
                record.pending = true;
            }
        }
    }

    /// Block until the outstanding pull for `(key, devid)` has been
    /// delivered. Returns immediately if none was ever posted.
    pub fn pull_wait(&self, key: Key, devid: DeviceId) {
        let inner = self.inner();
        let wid = inner.work_index(devid);
        let Some(entry) = inner.pull_map.get(key) else {
            return;
        };
        let mut wait = entry.wait.lock().unwrap();
        if wait[wid].finished {
            return;
        }
        wait[wid].nwait += 1;
        while !wait[wid].finished {
            wait = entry.wait_cv.wait(wait).unwrap();
        }
        wait[wid].nwait -= 1;
    }

    /// Device ids the engine was initialized with.
    pub fn devices(&self) -> &[DeviceId] {
        self.inner
            .as_ref()
            .map(|i| i.devices.as_slice())
            .unwrap_or(&[])
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.destroy.store(true, Ordering::Release);
        for queue in &inner.push_queues {
            queue.abort();
        }
        for queue in &inner.pull_queues {
            queue.abort();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }
}
