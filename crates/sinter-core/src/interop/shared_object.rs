//! Dynamic resolution of the optimizer entry points and the process-wide
//! runtime handle.
//!
//! The optimizer ships as a shared object versioned independently of the
//! compiler; the entry points are looked up by versioned symbol name at
//! init time. A missing library or symbol is reported, never retried — the
//! pass then runs with fusion disabled.

use std::sync::{Arc, OnceLock};

use libloading::Library;
use parking_lot::RwLock;

use super::backend::{BackendError, FuserStatus, FusionBackend};
use super::ir::{IrGraph, IrNode};

pub const FUSE_GRAPH_SYMBOL: &str = "sinter_fuse_graph_v4";
pub const PRE_GRAPH_SYMBOL: &str = "sinter_fused_pre_graph_v4";
pub const RELEASE_GRAPH_SYMBOL: &str = "sinter_release_graph_v4";

/// `(graph, out, supports_dynamic_shapes) -> status`. The library allocates
/// the output graph; ownership passes to the caller.
type FuseGraphFn = unsafe extern "C" fn(*const IrGraph, *mut *mut IrGraph, u8) -> i32;
/// `(node, out) -> status`. Ownership of the pre-graph passes to the caller.
type PreGraphFn = unsafe extern "C" fn(*const IrNode, *mut *mut IrGraph) -> i32;
/// `(graph) -> status`. Frees library-owned payloads inside the graph.
type ReleaseFn = unsafe extern "C" fn(*mut IrGraph) -> i32;

/// Entry points resolved from one loaded library. The `Library` is kept
/// alive for as long as the raw function pointers are.
pub struct SharedObjectBackend {
    _lib: Library,
    fuse_graph: FuseGraphFn,
    pre_graph: PreGraphFn,
    release_graph: ReleaseFn,
}

impl SharedObjectBackend {
    pub fn load(lib_name: &str) -> Result<Self, BackendError> {
        log::debug!("loading fusion library {lib_name}");
        let lib = unsafe { Library::new(lib_name) }
            .map_err(|e| BackendError::LibraryLoad(lib_name.into(), e.to_string()))?;

        unsafe {
            let fuse_graph = *lib
                .get::<FuseGraphFn>(FUSE_GRAPH_SYMBOL.as_bytes())
                .map_err(|_| BackendError::MissingEntryPoint(FUSE_GRAPH_SYMBOL))?;
            let pre_graph = *lib
                .get::<PreGraphFn>(PRE_GRAPH_SYMBOL.as_bytes())
                .map_err(|_| BackendError::MissingEntryPoint(PRE_GRAPH_SYMBOL))?;
            let release_graph = *lib
                .get::<ReleaseFn>(RELEASE_GRAPH_SYMBOL.as_bytes())
                .map_err(|_| BackendError::MissingEntryPoint(RELEASE_GRAPH_SYMBOL))?;
            Ok(Self {
                _lib: lib,
                fuse_graph,
                pre_graph,
                release_graph,
            })
        }
    }
}

impl FusionBackend for SharedObjectBackend {
    fn optimize(
        &self,
        graph: &IrGraph,
        supports_dynamic_shapes: bool,
    ) -> Result<IrGraph, BackendError> {
        let mut out: *mut IrGraph = std::ptr::null_mut();
        let status = unsafe {
            FuserStatus::from_raw((self.fuse_graph)(
                graph,
                &mut out,
                supports_dynamic_shapes as u8,
            ))
        };
        if status != FuserStatus::Success || out.is_null() {
            return Err(BackendError::OptimizeFailed(status));
        }
        Ok(*unsafe { Box::from_raw(out) })
    }

    fn pre_graph(&self, node: &IrNode) -> Result<IrGraph, BackendError> {
        let mut out: *mut IrGraph = std::ptr::null_mut();
        let status = unsafe { FuserStatus::from_raw((self.pre_graph)(node, &mut out)) };
        if status != FuserStatus::Success || out.is_null() {
            return Err(BackendError::PreGraphFailed(node.unique_id, status));
        }
        Ok(*unsafe { Box::from_raw(out) })
    }

    fn release(&self, graph: &mut IrGraph) -> Result<(), BackendError> {
        let status = unsafe { FuserStatus::from_raw((self.release_graph)(graph)) };
        if status != FuserStatus::Success {
            return Err(BackendError::ReleaseFailed(status));
        }
        Ok(())
    }
}

/// The process-wide optimizer handle, constructed and torn down explicitly
/// with compiler-instance startup and shutdown.
pub struct FuserRuntime {
    lib_name: String,
    backend: Arc<SharedObjectBackend>,
}

static RUNTIME: OnceLock<RwLock<Option<FuserRuntime>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<FuserRuntime>> {
    RUNTIME.get_or_init(|| RwLock::new(None))
}

impl FuserRuntime {
    /// Load the fusion library and resolve its entry points. Re-initializing
    /// with the same library name is a no-op; a different name reloads.
    pub fn init(lib_name: &str) -> Result<(), BackendError> {
        if lib_name.is_empty() {
            log::error!("fusion library name is empty, fuser stays uninitialized");
            return Err(BackendError::NotInitialized);
        }
        let mut guard = slot().write();
        if let Some(runtime) = guard.as_ref() {
            if runtime.lib_name == lib_name {
                return Ok(());
            }
        }
        match SharedObjectBackend::load(lib_name) {
            Ok(backend) => {
                log::info!("fusion library loaded successfully");
                *guard = Some(FuserRuntime {
                    lib_name: lib_name.into(),
                    backend: Arc::new(backend),
                });
                Ok(())
            }
            Err(e) => {
                log::error!("fusion library could not be loaded: {e}");
                *guard = None;
                Err(e)
            }
        }
    }

    pub fn destroy() {
        log::debug!("unloading fusion library");
        *slot().write() = None;
    }

    pub fn initialized() -> bool {
        slot().read().is_some()
    }

    /// The resolved entry points, if the runtime was initialized.
    pub fn backend() -> Option<Arc<SharedObjectBackend>> {
        slot().read().as_ref().map(|r| Arc::clone(&r.backend))
    }
}
