//! Push-side state: double-buffered staging entries and the worker loop
//! driving device→host contribution copies and the rendezvous.

use std::sync::{Arc, Mutex};

use crate::device::{CopyKind, StreamHandle};
use crate::error::Result;
use crate::memory::HostBuffer;
use crate::queue::TaskQueue;
use crate::types::{DataType, DeviceId, Key, Shape2, TensorView};

use super::{handle_push_finish, Inner, WorkerScope};

/// One queued push: a device's contribution for a key.
pub(crate) struct PushTask {
    pub tensor: TensorView,
    pub key: Key,
    pub devid: DeviceId,
}

/// Rendezvous bookkeeping for one key.
///
/// `copied[wid]` marks which devices have staged their contribution into
/// the active slot; the moment the last one lands, the slot rotates and
/// the finish handler runs on the frozen slot. Invariant:
/// `num_copied == copied.iter().filter(|c| **c).count()` whenever the
/// lock is not held.
pub(crate) struct PushState {
    pub copied: Vec<bool>,
    pub num_copied: usize,
    pub copyin_version: usize,
}

/// Per-key staging for pushed contributions.
///
/// `data` holds two slots of `ndevice` contribution planes each (the
/// double buffer); `weight` exists only when server-side update is
/// enabled and carries the authoritative weights between rendezvous.
pub(crate) struct PushEntry {
    pub data: HostBuffer,
    pub weight: Option<HostBuffer>,
    pub ndevice: usize,
    pub shape: Shape2,
    pub dtype: DataType,
    pub state: Mutex<PushState>,
}

impl PushEntry {
    pub fn new(
        runtime: Arc<dyn crate::device::DeviceRuntime>,
        ndevice: usize,
        shape: Shape2,
        dtype: DataType,
        pinned: bool,
        need_weight: bool,
    ) -> Result<Self> {
        let plane_bytes = shape.nelem() * dtype.size_in_bytes();
        let data = HostBuffer::alloc(Arc::clone(&runtime), 2 * ndevice * plane_bytes, pinned)?;
        let weight = if need_weight {
            Some(HostBuffer::alloc(runtime, plane_bytes, pinned)?)
        } else {
            None
        };
        Ok(Self {
            data,
            weight,
            ndevice,
            shape,
            dtype,
            state: Mutex::new(PushState {
                copied: vec![false; ndevice],
                num_copied: 0,
                copyin_version: 0,
            }),
        })
    }

    /// Bytes in one contribution plane (`rows * cols` elements).
    pub fn plane_bytes(&self) -> usize {
        self.shape.nelem() * self.dtype.size_in_bytes()
    }

    /// Pointer to device `wid`'s contribution plane in `version`.
    pub fn contrib_ptr(&self, version: usize, wid: usize) -> u64 {
        self.data.as_u64() + ((version * self.ndevice + wid) * self.plane_bytes()) as u64
    }

    /// Pointer to the start of `version`'s slot (`ndevice` planes).
    pub fn slot_ptr(&self, version: usize) -> u64 {
        self.contrib_ptr(version, 0)
    }
}

/// Body of a push worker thread. Owns the copy streams for the devices
/// in its scope, drains its queue until shutdown, then tears the
/// streams down.
pub(crate) fn push_worker(inner: Arc<Inner>, scope: WorkerScope) {
    let owned = scope.work_indices(inner.devices.len());
    let mut streams: Vec<Option<StreamHandle>> = vec![None; inner.devices.len()];
    for &wid in &owned {
        let devid = inner.devices[wid];
        inner
            .runtime
            .bind_device(devid)
            .expect("bind device for push stream setup");
        streams[wid] = Some(
            inner
                .runtime
                .new_stream(devid)
                .expect("create push copy stream"),
        );
    }
    tracing::debug!(?scope, "push worker started");

    let queue = match scope {
        WorkerScope::PerDevice(tid) => &inner.push_queues[tid],
        WorkerScope::Global => &inner.push_queues[0],
    };
    push_proc(&inner, queue, &streams);

    for &wid in &owned {
        let devid = inner.devices[wid];
        inner
            .runtime
            .bind_device(devid)
            .expect("bind device for push stream teardown");
        inner
            .runtime
            .delete_stream(devid, streams[wid].expect("stream created at startup"));
    }
    tracing::debug!(?scope, "push worker exiting");
}

fn push_proc(inner: &Inner, queue: &TaskQueue<PushTask>, streams: &[Option<StreamHandle>]) {
    use std::sync::atomic::Ordering;

    while !inner.destroy.load(Ordering::Acquire) {
        let Some(task) = queue.pop() else {
            assert!(
                inner.destroy.load(Ordering::Acquire),
                "push queue aborted without destroy signal"
            );
            break;
        };
        let wid = inner.work_index(task.devid);
        let stream = streams[wid].expect("push task routed to a worker without its stream");
        let entry = inner.push_map.get_ref(task.key);
        debug_assert_eq!(entry.shape, task.tensor.shape());

        // The active slot cannot rotate while this device's contribution
        // is outstanding, so the captured pointer stays valid through
        // the unlocked copy below.
        let dst = {
            let state = entry.state.lock().unwrap();
            assert!(
                !state.copied[wid],
                "second push for key {} on device {} before rendezvous",
                task.key, task.devid
            );
            entry.contrib_ptr(state.copyin_version, wid)
        };

        inner
            .runtime
            .bind_device(task.devid)
            .expect("bind device for push copy");
        unsafe {
            inner
                .runtime
                .copy(
                    dst,
                    task.tensor.as_u64(),
                    entry.plane_bytes(),
                    CopyKind::DeviceToHost,
                    stream,
                )
                .expect("push copy failed");
        }
        inner
            .runtime
            .stream_wait(stream)
            .expect("push stream wait failed");

        let (finished, version) = {
            let mut state = entry.state.lock().unwrap();
            state.copied[wid] = true;
            state.num_copied += 1;
            debug_assert_eq!(
                state.num_copied,
                state.copied.iter().filter(|&&c| c).count()
            );
            let version = state.copyin_version;
            let finished = state.num_copied == entry.ndevice;
            if finished {
                // Rotate: the next round stages into the other slot while
                // the finish handler and pull workers drain this one.
                state.copyin_version ^= 1;
                state.copied.fill(false);
                state.num_copied = 0;
            }
            (finished, version)
        };
        if finished {
            handle_push_finish(inner, &entry, task.key, version);
        }
    }
}
