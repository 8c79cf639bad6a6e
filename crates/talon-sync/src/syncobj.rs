use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::fence::Fence;

/// A named, re-bindable fence slot.
///
/// Each attach replaces the previous fence; readers always observe the most
/// recently attached one. An empty slot is valid and simply contributes no
/// dependency.
#[derive(Debug, Default)]
pub struct SyncObj {
    slot: Mutex<Option<Fence>>,
}

pub type SyncObjRef = Arc<SyncObj>;

impl SyncObj {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot's fence with `fence`.
    pub fn attach(&self, fence: Fence) {
        *self.slot.lock().unwrap() = Some(fence);
    }

    /// The most recently attached fence, if any.
    pub fn current(&self) -> Option<Fence> {
        self.slot.lock().unwrap().clone()
    }
}

/// Handle registry for sync objects.
///
/// Handles are small, never reused within a table's lifetime, and start at 1
/// so 0 can stay an invalid-handle sentinel on the wire.
#[derive(Debug, Default)]
pub struct SyncObjTable {
    objs: Mutex<HashMap<u32, SyncObjRef>>,
    next_handle: Mutex<u32>,
}

impl SyncObjTable {
    pub fn new() -> Self {
        Self {
            objs: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        }
    }

    pub fn create(&self) -> (u32, SyncObjRef) {
        let obj = Arc::new(SyncObj::new());
        let mut next = self.next_handle.lock().unwrap();
        let handle = *next;
        *next += 1;
        self.objs.lock().unwrap().insert(handle, obj.clone());
        (handle, obj)
    }

    pub fn lookup(&self, handle: u32) -> Option<SyncObjRef> {
        self.objs.lock().unwrap().get(&handle).cloned()
    }

    pub fn destroy(&self, handle: u32) -> bool {
        self.objs.lock().unwrap().remove(&handle).is_some()
    }
}
