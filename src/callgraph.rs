//! The refined call graph produced by the whole-program pass.

use crate::ir::{FuncId, Module, SiteRef};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

/// Call-site to callee-set mapping plus the SCC structure over it.
/// Everything is keyed by stable ids, so iteration order is deterministic
/// for a given module.
pub struct DsCallGraph {
    callees: BTreeMap<SiteRef, BTreeSet<FuncId>>,
    /// SCC id per function; functions in the same SCC are mutually
    /// recursive (or a singleton).
    scc_index: BTreeMap<FuncId, usize>,
    /// Members of each SCC, ascending by id.
    sccs: Vec<Vec<FuncId>>,
    /// Defined functions that no site calls.
    roots: Vec<FuncId>,
}

impl DsCallGraph {
    pub fn build(module: &Module, callees: BTreeMap<SiteRef, BTreeSet<FuncId>>) -> Self {
        let mut graph: DiGraph<FuncId, ()> = DiGraph::new();
        let mut node_of: BTreeMap<FuncId, NodeIndex> = BTreeMap::new();
        for (fid, _) in module.functions_iter() {
            node_of.insert(fid, graph.add_node(fid));
        }
        for (site, fs) in &callees {
            for f in fs {
                graph.update_edge(node_of[&site.func], node_of[f], ());
            }
        }

        let mut scc_index = BTreeMap::new();
        let mut sccs = Vec::new();
        for scc in petgraph::algo::tarjan_scc(&graph) {
            let mut members: Vec<FuncId> = scc.into_iter().map(|n| graph[n]).collect();
            members.sort();
            let id = sccs.len();
            for &m in &members {
                scc_index.insert(m, id);
            }
            sccs.push(members);
        }

        let called: BTreeSet<FuncId> = callees.values().flatten().copied().collect();
        let roots: Vec<FuncId> = module
            .functions_iter()
            .filter(|(fid, f)| !f.is_declaration && !called.contains(fid))
            .map(|(fid, _)| fid)
            .collect();

        Self {
            callees,
            scc_index,
            sccs,
            roots,
        }
    }

    /// The callee set resolved for `site`, in ascending function-id order.
    pub fn callees(&self, site: SiteRef) -> impl Iterator<Item = FuncId> + '_ {
        self.callees.get(&site).into_iter().flatten().copied()
    }

    pub fn sites_iter(&self) -> impl Iterator<Item = (SiteRef, &BTreeSet<FuncId>)> {
        self.callees.iter().map(|(&s, fs)| (s, fs))
    }

    /// Members of `f`'s SCC, including `f` itself.
    pub fn scc_members(&self, f: FuncId) -> &[FuncId] {
        &self.sccs[self.scc_index[&f]]
    }

    /// A stable representative of `f`'s SCC: its smallest member.
    pub fn scc_leader(&self, f: FuncId) -> FuncId {
        self.scc_members(f)[0]
    }

    pub fn roots(&self) -> &[FuncId] {
        &self.roots
    }
}
