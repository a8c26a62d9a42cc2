//! The kernel-fusion pass.
//!
//! Driver control flow: drop redundant control edges, partition the eligible
//! node set into clusters (with cycle repair), package the whole node set as
//! one interchange subgraph, hand it to the external optimizer, validate the
//! answer, splice it back, and release the optimizer's result exactly once.

pub mod adapter;
pub mod cluster;
pub mod integrate;
pub mod sif;
pub mod union_find;
pub mod validate;

pub use adapter::{build_cluster_context, optimize_cluster, ClusterContext};
pub use cluster::{can_cluster_basic, ClusterBuilder, ClusterId};
pub use integrate::{ApplyOutcome, ResultIntegrator};
pub use sif::{MultiSifInfo, SifEntry, SifRegistry};
pub use validate::{validate_optimized, ValidationReject};

use crate::config::FusionConfig;
use crate::graph::{Graph, NodeId};
use crate::interop::{BackendError, FuserRuntime, FusionBackend};

#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    /// External-boundary failure: the graph is left in its pre-call state
    /// and the compilation aborts.
    #[error("fusion backend failure: {0}")]
    Backend(#[from] BackendError),
    /// Contract breach between components; aborts with a description rather
    /// than attempting recovery.
    #[error("fusion invariant violated: {0}")]
    Invariant(String),
}

/// Run the fusion pass against the process-wide optimizer runtime. An
/// uninitialized runtime skips the pass; this is not an error.
pub fn run_pass(
    graph: &mut Graph,
    cfg: &FusionConfig,
    sifs: &SifRegistry,
) -> Result<(), FuseError> {
    let Some(backend) = FuserRuntime::backend() else {
        log::debug!("fusion runtime is not initialized, pass will not run");
        return Ok(());
    };
    run(graph, cfg, backend.as_ref(), sifs)
}

/// Run the fusion pass with an explicit backend.
pub fn run(
    graph: &mut Graph,
    cfg: &FusionConfig,
    backend: &dyn FusionBackend,
    sifs: &SifRegistry,
) -> Result<(), FuseError> {
    if !cfg.enabled {
        log::debug!("fusion is disabled, pass will not run");
        return Ok(());
    }

    // Control edges shadowed by a data path would only block clustering.
    graph.drop_redundant_control_edges();

    let mut builder = ClusterBuilder::new(graph, cfg);
    let clusters = builder.compute()?;
    log::debug!("computed {} connected clusters", clusters.len());
    drop(builder);

    // The whole node set goes out as one interchange subgraph; the computed
    // partition bounds what the optimizer may fuse and already honors every
    // clustering invariant.
    let members: Vec<NodeId> = graph.topo_sorted();
    let Some((ctx, mut optimized)) =
        optimize_cluster(graph, &members, backend, cfg.supports_dynamic_shapes)?
    else {
        log::info!("there are no clusters to fuse");
        return Ok(());
    };

    let result = integrate_checked(graph, &ctx, &optimized, backend, sifs);

    // The optimizer's result is released exactly once, even when unused.
    match backend.release(&mut optimized) {
        Ok(()) => {
            for node in &optimized.nodes {
                assert!(
                    node.params.is_empty(),
                    "release left parameters on node {}",
                    node.name
                );
            }
        }
        Err(e) => log::warn!("release of the optimized subgraph failed: {e}"),
    }

    match result? {
        None => Ok(()),
        Some(ApplyOutcome::Rejected(reason)) => {
            log::warn!("optimized subgraph rejected, not fusing: {reason}");
            Ok(())
        }
        Some(ApplyOutcome::Applied { fused, new, skipped }) => {
            log::info!(
                "fusion applied: {fused} fused kernels, {new} new nodes, {skipped} skipped \
                 replacements"
            );
            Ok(())
        }
    }
}

/// Validate then integrate; `None` means validation rejected the subgraph.
fn integrate_checked(
    graph: &mut Graph,
    ctx: &ClusterContext,
    optimized: &crate::interop::IrGraph,
    backend: &dyn FusionBackend,
    sifs: &SifRegistry,
) -> Result<Option<ApplyOutcome>, FuseError> {
    if let Err(reject) = validate_optimized(graph, ctx, optimized) {
        log::warn!("optimized subgraph failed validation, not fusing: {reject}");
        return Ok(None);
    }
    let mut integrator = ResultIntegrator::new(backend, sifs);
    integrator.apply(graph, ctx, optimized).map(Some)
}
