//! Pull-side state: per-device request and wait records plus the worker
//! loop that delivers the authoritative value back to devices.

use std::sync::{Arc, Condvar, Mutex};

use crate::device::{CopyKind, StreamHandle};
use crate::queue::TaskQueue;
use crate::types::{DeviceId, Key, Priority, TensorView};

use super::{Inner, WorkerScope};

/// Invoked after the pull copy is enqueued and before the stream is
/// drained, so it may chain further stream-ordered work. Must not block
/// indefinitely or call back into the engine.
pub type PullCallback = Box<dyn FnOnce(StreamHandle) + Send>;

/// View of the authoritative post-reduction tensor on host.
///
/// Aliases either a push slot or the updater's weight buffer; the
/// double-buffer rotation keeps it valid until the following rendezvous
/// rotates back onto the same slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SrcView {
    pub ptr: u64,
    pub len_bytes: usize,
}

/// One device's registered pull request.
///
/// `ready` means the authoritative value may be copied out right away;
/// `pending` means the request arrived before the value and will be
/// enqueued by the next `pull_ready`.
pub(crate) struct PullReqRecord {
    pub ready: bool,
    pub pending: bool,
    pub dest: Option<TensorView>,
    pub priority: Priority,
    pub callback: Option<PullCallback>,
}

impl Default for PullReqRecord {
    fn default() -> Self {
        Self {
            ready: false,
            pending: false,
            dest: None,
            priority: 0,
            callback: None,
        }
    }
}

/// One device's wait state. Starts `finished` so a wait posted before
/// any pull request returns immediately.
#[derive(Debug, Clone)]
pub(crate) struct WaitRecord {
    pub nwait: usize,
    pub finished: bool,
}

impl Default for WaitRecord {
    fn default() -> Self {
        Self {
            nwait: 0,
            finished: true,
        }
    }
}

pub(crate) struct RequestState {
    pub src: Option<SrcView>,
    pub req: Vec<PullReqRecord>,
}

/// Per-key pull state.
pub(crate) struct PullEntry {
    pub requests: Mutex<RequestState>,
    pub wait: Mutex<Vec<WaitRecord>>,
    pub wait_cv: Condvar,
}

impl PullEntry {
    pub fn new(ndevice: usize) -> Self {
        Self {
            requests: Mutex::new(RequestState {
                src: None,
                req: (0..ndevice).map(|_| PullReqRecord::default()).collect(),
            }),
            wait: Mutex::new(vec![WaitRecord::default(); ndevice]),
            wait_cv: Condvar::new(),
        }
    }
}

/// Body of a pull worker thread; mirrors the push worker's stream
/// ownership discipline.
pub(crate) fn pull_worker(inner: Arc<Inner>, scope: WorkerScope) {
    let owned = scope.work_indices(inner.devices.len());
    let mut streams: Vec<Option<StreamHandle>> = vec![None; inner.devices.len()];
    for &wid in &owned {
        let devid = inner.devices[wid];
        inner
            .runtime
            .bind_device(devid)
            .expect("bind device for pull stream setup");
        streams[wid] = Some(
            inner
                .runtime
                .new_stream(devid)
                .expect("create pull copy stream"),
        );
    }
    tracing::debug!(?scope, "pull worker started");

    let queue = match scope {
        WorkerScope::PerDevice(tid) => &inner.pull_queues[tid],
        WorkerScope::Global => &inner.pull_queues[0],
    };
    pull_proc(&inner, queue, &streams);

    for &wid in &owned {
        let devid = inner.devices[wid];
        inner
            .runtime
            .bind_device(devid)
            .expect("bind device for pull stream teardown");
        inner
            .runtime
            .delete_stream(devid, streams[wid].expect("stream created at startup"));
    }
    tracing::debug!(?scope, "pull worker exiting");
}

fn pull_proc(inner: &Inner, queue: &TaskQueue<(Key, DeviceId)>, streams: &[Option<StreamHandle>]) {
    use std::sync::atomic::Ordering;

    while !inner.destroy.load(Ordering::Acquire) {
        let Some((key, devid)) = queue.pop() else {
            assert!(
                inner.destroy.load(Ordering::Acquire),
                "pull queue aborted without destroy signal"
            );
            break;
        };
        let wid = inner.work_index(devid);
        let stream = streams[wid].expect("pull task routed to a worker without its stream");
        let entry = inner.pull_map.get_ref(key);

        let (src, dest, callback) = {
            let mut state = entry.requests.lock().unwrap();
            let src = state.src.expect("pull task enqueued before data was ready");
            let record = &mut state.req[wid];
            let dest = record
                .dest
                .expect("pull task without a registered destination");
            (src, dest, record.callback.take())
        };
        debug_assert_eq!(dest.size_bytes(), src.len_bytes);

        inner
            .runtime
            .bind_device(devid)
            .expect("bind device for pull copy");
        unsafe {
            inner
                .runtime
                .copy(
                    dest.as_u64(),
                    src.ptr,
                    src.len_bytes,
                    CopyKind::HostToDevice,
                    stream,
                )
                .expect("pull copy failed");
        }
        // Runs before the drain so the client can chain stream-ordered
        // work behind the copy.
        if let Some(cb) = callback {
            cb(stream);
        }
        inner
            .runtime
            .stream_wait(stream)
            .expect("pull stream wait failed");

        {
            let mut wait = entry.wait.lock().unwrap();
            let record = &mut wait[wid];
            record.finished = true;
            if record.nwait > 0 {
                entry.wait_cv.notify_all();
            }
        }
    }
}
