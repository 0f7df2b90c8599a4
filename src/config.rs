//! Engine tuning parameters and the string `set_param` surface.
//!
//! All values have sensible defaults. Override through
//! [`LocalEngine::set_param`](crate::LocalEngine::set_param) before `init`,
//! or via environment variables (prefixed `GRADBUS_`) with
//! [`EngineConfig::from_env`].

use std::collections::HashMap;

use crate::types::{Key, PushOp};

/// Whether a worker pool runs one thread per device or a single shared
/// thread draining one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadMode {
    /// One worker and one queue per device.
    #[default]
    PerDevice,
    /// A single worker draining a single shared queue.
    Single,
}

/// Tuning parameters for the synchronization engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-key reduction applied at push rendezvous. Keys absent from the
    /// map use [`PushOp::Sum`].
    pub push_ops: HashMap<Key, PushOp>,

    /// Worker count for parallel sum reduction. Zero disables the
    /// parallel schedule entirely.
    pub reduce_threads: usize,

    /// Pin host staging buffers (page-locked allocation) so async
    /// device copies can run at full speed.
    pub use_pin_memory: bool,

    /// Tensor element count at or above which sum reduction parallelizes.
    pub bigarray_bound: usize,

    /// Pull worker pool shape.
    pub pull_mode: ThreadMode,

    /// Push worker pool shape.
    pub push_mode: ThreadMode,

    /// Run the pluggable updater on the reduced gradient instead of
    /// handing the raw sum back to devices.
    pub update_on_server: bool,

    /// Every `(name, value)` pair seen by `set`, in order, replayed into
    /// the updater when it is constructed.
    pub(crate) history: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_ops: HashMap::new(),
            reduce_threads: 8,
            use_pin_memory: true,
            bigarray_bound: 1_000_000,
            pull_mode: ThreadMode::PerDevice,
            push_mode: ThreadMode::PerDevice,
            update_on_server: false,
            history: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GRADBUS_REDUCE_THREAD`
    /// - `GRADBUS_BIGARRAY_BOUND`
    /// - `GRADBUS_USE_PIN_MEMORY`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GRADBUS_REDUCE_THREAD") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.reduce_threads = n;
            }
        }
        if let Ok(v) = std::env::var("GRADBUS_BIGARRAY_BOUND") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.bigarray_bound = n;
            }
        }
        if let Ok(v) = std::env::var("GRADBUS_USE_PIN_MEMORY") {
            if let Ok(n) = v.parse::<i64>() {
                cfg.use_pin_memory = n != 0;
            }
        }

        cfg
    }

    /// Apply one `(name, value)` configuration pair.
    ///
    /// Recognized names follow the engine's documented parameter table
    /// (`push_op[K]`, `reduce_thread`, `use_pin_memory`, `bigarray_bound`,
    /// `pull_thread`, `push_thread`, `update_on_server`). Unrecognized
    /// names are recorded and later forwarded to the updater, which may
    /// understand them (`lr`, for instance).
    ///
    /// A recognized name with a malformed value is a program bug and
    /// aborts with a message.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(key) = parse_push_op_key(name) {
            let op = match value {
                "sum" => PushOp::Sum,
                "gather" => PushOp::Gather,
                _ => panic!("unknown push operation {value:?}: expected `sum` or `gather`"),
            };
            self.push_ops.insert(key, op);
            return;
        }
        match name {
            "reduce_thread" => {
                self.reduce_threads = parse_int("reduce_thread", value);
            }
            "use_pin_memory" => {
                self.use_pin_memory = parse_int::<i64>("use_pin_memory", value) != 0;
            }
            "bigarray_bound" => {
                self.bigarray_bound = parse_int("bigarray_bound", value);
            }
            "pull_thread" => {
                self.pull_mode = parse_thread_mode("pull_thread", value);
            }
            "push_thread" => {
                self.push_mode = parse_thread_mode("push_thread", value);
            }
            "update_on_server" => {
                self.update_on_server = parse_int::<i64>("update_on_server", value) != 0;
            }
            _ => {}
        }
        self.history.push((name.to_string(), value.to_string()));
    }

    /// Reduction for a key, defaulting to sum.
    pub(crate) fn push_op(&self, key: Key) -> PushOp {
        self.push_ops.get(&key).copied().unwrap_or_default()
    }
}

/// Extract `K` from a `push_op[K]` parameter name.
fn parse_push_op_key(name: &str) -> Option<Key> {
    name.strip_prefix("push_op[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn parse_int<T: std::str::FromStr>(name: &str, value: &str) -> T {
    value
        .parse()
        .unwrap_or_else(|_| panic!("invalid value {value:?} for parameter {name}"))
}

fn parse_thread_mode(name: &str, value: &str) -> ThreadMode {
    match value {
        "ndev" => ThreadMode::PerDevice,
        "one" => ThreadMode::Single,
        _ => panic!("invalid value {value:?} for parameter {name}, can only be ndev or one"),
    }
}
