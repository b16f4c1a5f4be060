//! Environment resolver
//!
//! Obtains the host calling context for a VM. Host runtimes register into a
//! process-wide table (the one genuine singleton in this layer — the host
//! runtime's attachment API is per-process by nature); resolution then
//! attaches the calling OS thread on demand and caches the attachment in
//! thread-local state so repeated resolution is a cheap lookup.
//!
//! Everything else threads the resolved [`HostContext`] through calls
//! explicitly.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use torii_sdk::HostRuntime;
use torii_vm::Vm;

use crate::error::{BridgeError, BridgeResult};

static NEXT_RUNTIME_ID: AtomicU32 = AtomicU32::new(1);

static REGISTRY: Lazy<RwLock<FxHashMap<u32, Weak<dyn HostRuntime>>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));

thread_local! {
    static ATTACHED: RefCell<FxHashSet<u32>> = RefCell::new(FxHashSet::default());
}

/// Process-unique identifier of a registered host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(u32);

impl RuntimeId {
    /// The raw id value
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        RuntimeId(raw)
    }
}

/// Bridge state attached to a VM by [`open_bridge`](crate::open_bridge)
#[derive(Debug, Clone, Copy)]
pub(crate) struct BridgeState {
    pub runtime_id: RuntimeId,
}

/// A resolved host calling context: the runtime plus the guarantee that the
/// current OS thread is attached to it.
///
/// Cheap to clone; valid for the lifetime of the current call. Do not stash
/// one across VM re-entry — resolve again instead.
#[derive(Clone)]
pub struct HostContext {
    /// The registry id this context was resolved from
    pub id: RuntimeId,
    /// The host runtime
    pub runtime: Arc<dyn HostRuntime>,
}

/// Register a host runtime, making it resolvable by id.
///
/// The registry holds a weak reference: dropping the last `Arc` makes every
/// later resolution fail with `BridgeUnavailable` instead of keeping a dead
/// runtime alive.
pub fn register_runtime(runtime: Arc<dyn HostRuntime>) -> RuntimeId {
    let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
    REGISTRY.write().insert(id, Arc::downgrade(&runtime));
    RuntimeId(id)
}

/// Remove a runtime from the registry (process/VM shutdown)
pub fn unregister_runtime(id: RuntimeId) {
    REGISTRY.write().remove(&id.0);
    ATTACHED.with(|set| {
        set.borrow_mut().remove(&id.0);
    });
}

/// Resolve a calling context for `id`, attaching the current thread to the
/// host runtime if this thread has not attached before.
pub fn resolve(id: RuntimeId) -> BridgeResult<HostContext> {
    let runtime = REGISTRY
        .read()
        .get(&id.0)
        .and_then(Weak::upgrade)
        .ok_or_else(|| BridgeError::Unavailable {
            reason: format!("host runtime #{} is not registered", id.0),
        })?;
    let first_use = ATTACHED.with(|set| !set.borrow().contains(&id.0));
    if first_use {
        runtime
            .attach_current_thread()
            .map_err(|e| BridgeError::Unavailable {
                reason: e.to_string(),
            })?;
        ATTACHED.with(|set| {
            set.borrow_mut().insert(id.0);
        });
    }
    Ok(HostContext { id, runtime })
}

/// Resolve the calling context of a VM the bridge has been opened on
pub fn context(vm: &Vm) -> BridgeResult<HostContext> {
    let state = vm
        .extension::<BridgeState>()
        .ok_or_else(|| BridgeError::Unavailable {
            reason: "bridge not opened on this VM".to_string(),
        })?;
    resolve(state.runtime_id)
}
