//! The context-insensitive whole-program pass.
//!
//! All per-function graphs are spliced into one result graph without
//! cloning; call sites are then resolved in place, iterating to a fixpoint
//! because each resolution round can surface new callees for other sites.

use crate::callgraph::DsCallGraph;
use crate::graph::{CalleeKind, CloneFlags, DsGraph, IncompleteFlags, RemoveDeadPolicy};
use crate::ir::{FuncId, Linkage, Module, SiteRef, Value};
use crate::local::LocalDsa;
use crate::log::*;
use crate::nodes::NodeFlags;
use std::collections::{BTreeMap, BTreeSet};

/// Driver configuration. One driver, parameterized, instead of two nearly
/// identical passes that differ only in bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct DriverMode {
    /// Track still-unresolved sites on the auxiliary list and prune it
    /// after the fixpoint, so resolved sites stop seeding incompleteness.
    pub use_aux_call_sites: bool,
    /// Clear the alloca bit when cloning the globals graph back in.
    pub strip_alloca_on_clone: bool,
    /// Compute the derived external and int<->ptr flag closures.
    pub compute_external_flags: bool,
}

impl Default for DriverMode {
    fn default() -> Self {
        Self {
            use_aux_call_sites: false,
            strip_alloca_on_clone: false,
            compute_external_flags: true,
        }
    }
}

/// Driver options selectable from the command line.
#[derive(clap::ArgEnum, Clone, Debug)]
pub enum DriverOption {
    UseAuxCallSites,
    StripAllocaOnClone,
    DisableExternalFlagComputation,
}

impl From<Vec<DriverOption>> for DriverMode {
    fn from(v: Vec<DriverOption>) -> Self {
        use DriverOption::*;
        let mut r = DriverMode::default();
        for v in v {
            match v {
                UseAuxCallSites => {
                    r.use_aux_call_sites = true;
                }
                StripAllocaOnClone => {
                    r.strip_alloca_on_clone = true;
                }
                DisableExternalFlagComputation => {
                    r.compute_external_flags = false;
                }
            }
        }
        r
    }
}

/// The published result: one graph for the whole program, the refined
/// globals graph, and the call graph with SCC structure.
pub struct SteensgaardAnalysis {
    result: DsGraph,
    globals: DsGraph,
    call_graph: DsCallGraph,
}

impl SteensgaardAnalysis {
    /// Build the result graph for `module`, consuming the per-function
    /// graphs of `local`.
    pub fn run(module: &Module, local: &mut impl LocalDsa, mode: DriverMode) -> Self {
        info!("Running Steensgaard pass"; "functions" => module.functions.len());

        // One copy of the globals graph anchors the result; every global
        // referenced by a function graph unifies with it while splicing.
        let mut globals = DsGraph::new();
        globals.clone_into(local.globals_graph(), CloneFlags::empty());
        let mut result = DsGraph::new();
        result.clone_into(&globals, CloneFlags::empty());

        for (fid, f) in module.functions_iter() {
            if !f.is_declaration {
                result.splice_from(local.take_ds_graph(fid));
            }
        }

        result.remove_trivially_dead_nodes();
        result.mask_incomplete_markers();
        result.mark_incomplete_nodes(
            module,
            IncompleteFlags::MARK_FORMALS | IncompleteFlags::IGNORE_GLOBALS,
        );

        // It is quite possible that a site gains potential callees during
        // merging, so iterate until no callee set changes. Termination:
        // callee sets only grow, and the function universe is finite.
        let mut callee_sets: BTreeMap<SiteRef, BTreeSet<FuncId>> = BTreeMap::new();
        let mut iterations = 0usize;
        while build_callee_sets(module, local, &result, &mut callee_sets) {
            iterations += 1;
            assert!(
                iterations <= module.functions.len() + 1,
                "Call-resolution fixpoint failed to settle"
            );
            let sites = result.call_sites().to_vec();
            for cs in &sites {
                for &callee in &callee_sets[&cs.site] {
                    if !module.function(callee).is_declaration {
                        result.merge_in_graph(cs, callee, module, None, CloneFlags::empty());
                    }
                }
            }
        }
        debug!("Call-resolution fixpoint settled"; "iterations" => iterations);

        // Return classes of internal functions are fully accounted for by
        // the merging above; visible functions keep theirs so their formals
        // stay marked.
        result.retain_return_nodes(|f| module.function(f).linkage == Linkage::External);

        result.mask_incomplete_markers();
        result.mark_incomplete_nodes(
            module,
            IncompleteFlags::MARK_FORMALS | IncompleteFlags::IGNORE_GLOBALS,
        );

        if mode.use_aux_call_sites {
            // Resolved sites stop seeding incompleteness: drop every site
            // that is direct or whose callee class is completely known.
            result.retain_aux_call_sites(|store, cs| match &cs.callee {
                CalleeKind::Direct(_) => false,
                CalleeKind::Indirect(h) => {
                    let flags = store.node(*h).flags();
                    flags.contains(NodeFlags::INCOMPLETE) || flags.contains(NodeFlags::EXTERNAL)
                }
            });
            result.mask_incomplete_markers();
            result.mark_incomplete_nodes(
                module,
                IncompleteFlags::MARK_FORMALS | IncompleteFlags::IGNORE_GLOBALS,
            );
        }

        globals.remove_trivially_dead_nodes();
        globals.mask_incomplete_markers();
        globals.mark_incomplete_nodes(module, IncompleteFlags::IGNORE_GLOBALS);

        // Clone the refined global classes back in, re-forming global
        // equivalence classes through the shared scalar-map keys.
        let mut clone_flags =
            CloneFlags::DONT_CLONE_CALL_SITES | CloneFlags::DONT_CLONE_AUX_CALL_SITES;
        if mode.strip_alloca_on_clone {
            clone_flags |= CloneFlags::STRIP_ALLOCA;
        }
        result.clone_into(&globals, clone_flags);

        if mode.compute_external_flags {
            result.propagate_flag_through_edges(NodeFlags::EXTERNAL);
            result.propagate_flag_through_edges(NodeFlags::INT_TO_PTR);
            result.propagate_flag_through_edges(NodeFlags::PTR_TO_INT);
        }

        let call_graph = DsCallGraph::build(module, callee_sets);

        result.remove_dead_nodes(RemoveDeadPolicy::KeepUnreachableGlobals);

        Self {
            result,
            globals,
            call_graph,
        }
    }

    /// The shared result graph; identical for every function.
    pub fn result_graph(&self) -> &DsGraph {
        &self.result
    }

    pub fn globals_graph(&self) -> &DsGraph {
        &self.globals
    }

    pub fn call_graph(&self) -> &DsCallGraph {
        &self.call_graph
    }

    /// The canonical test predicate: do `a` and `b` point into the same
    /// class?
    pub fn same_node(&self, a: Value, b: Value) -> bool {
        match (self.result.lookup(a), self.result.lookup(b)) {
            (Some(x), Some(y)) => self.result.store().index_eq(x, y),
            _ => false,
        }
    }
}

/// Recompute the candidate callee set of every site. Returns whether any
/// set changed; comparison is by content, so growth is what drives the
/// driver's fixpoint loop.
fn build_callee_sets(
    module: &Module,
    local: &impl LocalDsa,
    result: &DsGraph,
    callee_sets: &mut BTreeMap<SiteRef, BTreeSet<FuncId>>,
) -> bool {
    let mut changed = false;
    for cs in result.call_sites() {
        let callees: BTreeSet<FuncId> = match &cs.callee {
            CalleeKind::Direct(f) => {
                if module.function(*f).is_declaration {
                    BTreeSet::new()
                } else {
                    std::iter::once(*f).collect()
                }
            }
            CalleeKind::Indirect(h) => {
                // Even mid-unification, refuse call edges that cannot exist
                // in a valid program.
                result
                    .store()
                    .node(*h)
                    .functions()
                    .filter(|&f| local.function_is_callable(cs, f))
                    .collect()
            }
        };
        match callee_sets.get_mut(&cs.site) {
            Some(old) => {
                if *old != callees {
                    changed = true;
                    *old = callees;
                }
            }
            None => {
                changed = true;
                callee_sets.insert(cs.site, callees);
            }
        }
    }
    changed
}
