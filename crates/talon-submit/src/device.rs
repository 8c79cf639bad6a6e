use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use talon_mem::{BufferTable, PlacementBackend};
use talon_sync::SyncObjTable;

use crate::context::{Context, JobSink, QueueSelector};
use crate::error::{Result, SubmitError};
use crate::throttle::{Clock, MigrationBudget, MonotonicClock};

/// Device-wide admission knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// log2 of the maximum migration rate in bytes per microsecond
    /// (equivalently MB/s). Zero disables throttled migration credit.
    pub log2_max_migration_rate: u32,
    /// Integrated device: VRAM is carved out of host memory, so the
    /// throttle resets rather than fast-fills a mostly-free pool.
    pub integrated: bool,
    /// Per-queue completion-fence history window; bounds in-flight
    /// submissions per queue.
    pub fence_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log2_max_migration_rate: 6, // 64 MB/s
            integrated: false,
            fence_history: 32,
        }
    }
}

/// Admission-path device state.
///
/// Constructed once at device initialization and torn down only at
/// shutdown; in particular the migration budget is never reconstructed
/// mid-run. All registries hand out reference-counted objects, so lookups
/// pin their results against concurrent destruction.
pub struct Device {
    cfg: Config,
    placement: Arc<dyn PlacementBackend>,
    buffers: BufferTable,
    sync_objs: SyncObjTable,
    contexts: Mutex<HashMap<u32, Arc<Context>>>,
    next_context_id: Mutex<u32>,
    queues: Mutex<HashMap<QueueSelector, Arc<dyn JobSink>>>,
    budget: MigrationBudget,
    /// Serializes commit phase 2: the user-page recheck, fence
    /// publication and ticket release happen atomically with respect to
    /// other committers.
    pub(crate) commit_lock: Mutex<()>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(cfg: Config, placement: Arc<dyn PlacementBackend>) -> Self {
        Self::with_clock(cfg, placement, Arc::new(MonotonicClock))
    }

    /// Like [`Device::new`] with an injected time source for the
    /// migration budget.
    pub fn with_clock(
        cfg: Config,
        placement: Arc<dyn PlacementBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let budget =
            MigrationBudget::new(cfg.log2_max_migration_rate, cfg.integrated, clock);
        Self {
            cfg,
            placement,
            buffers: BufferTable::new(),
            sync_objs: SyncObjTable::new(),
            contexts: Mutex::new(HashMap::new()),
            next_context_id: Mutex::new(1),
            queues: Mutex::new(HashMap::new()),
            budget,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn buffers(&self) -> &BufferTable {
        &self.buffers
    }

    pub fn sync_objs(&self) -> &SyncObjTable {
        &self.sync_objs
    }

    pub fn placement(&self) -> &dyn PlacementBackend {
        &*self.placement
    }

    pub fn budget(&self) -> &MigrationBudget {
        &self.budget
    }

    pub fn create_context(&self) -> (u32, Arc<Context>) {
        let mut next = self.next_context_id.lock().unwrap();
        let id = *next;
        *next += 1;
        let ctx = Arc::new(Context::new(id, self.cfg.fence_history));
        self.contexts.lock().unwrap().insert(id, ctx.clone());
        (id, ctx)
    }

    pub fn context(&self, id: u32) -> Result<Arc<Context>> {
        self.contexts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(SubmitError::UnknownContext { id })
    }

    pub fn destroy_context(&self, id: u32) -> bool {
        self.contexts.lock().unwrap().remove(&id).is_some()
    }

    /// Bind an execution queue to an engine selector. Submissions naming
    /// an unregistered selector are malformed.
    pub fn register_queue(&self, selector: QueueSelector, sink: Arc<dyn JobSink>) {
        self.queues.lock().unwrap().insert(selector, sink);
    }

    pub fn queue(&self, selector: QueueSelector) -> Result<Arc<dyn JobSink>> {
        self.queues
            .lock()
            .unwrap()
            .get(&selector)
            .cloned()
            .ok_or(SubmitError::UnknownQueue {
                class: selector.engine_class,
                instance: selector.engine_instance,
                index: selector.index,
            })
    }
}
