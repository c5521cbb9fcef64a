//! Resolution of call sites to candidate callees.
//!
//! A utility layer over the finished analysis, for passes that only care
//! about sites and callees (a devirtualizer, say): every call site of the
//! module is mapped to its candidates, with a per-site verdict on whether
//! the candidate list is certified complete.

use crate::callgraph::DsCallGraph;
use crate::containers::unordered::UnorderedSet;
use crate::graph::DsGraph;
use crate::ir::{FuncId, Insn, Module, Operand, SiteRef, Value};
use crate::log::*;
use crate::nodes::NodeFlags;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};

/// The output capability set consumed here; any analysis variant that can
/// answer these three queries can drive the finder.
pub trait DsaResult {
    /// The graph summarizing `f`. A context-insensitive analysis returns
    /// the same graph for every function.
    fn ds_graph(&self, f: FuncId) -> &DsGraph;
    fn globals_graph(&self) -> &DsGraph;
    fn call_graph(&self) -> &DsCallGraph;
}

impl DsaResult for crate::steensgaard::SteensgaardAnalysis {
    fn ds_graph(&self, _f: FuncId) -> &DsGraph {
        self.result_graph()
    }

    fn globals_graph(&self) -> &DsGraph {
        self.globals_graph()
    }

    fn call_graph(&self) -> &DsCallGraph {
        self.call_graph()
    }
}

/// Explicit tallies over the module's call sites.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct TargetCounters {
    pub direct: usize,
    pub indirect: usize,
    pub complete_indirect: usize,
    /// Indirect sites that resolved, with certainty, to nothing at all;
    /// usually dead code or a bug in the program under analysis.
    pub complete_empty: usize,
}

/// Per-site candidate callees and completeness verdicts.
pub struct CallTargetFinder {
    ind_map: BTreeMap<SiteRef, Vec<FuncId>>,
    complete_sites: BTreeSet<SiteRef>,
    /// Sites that are not direct calls, in module order; the report covers
    /// exactly these.
    indirect_sites: Vec<SiteRef>,
    counters: TargetCounters,
}

impl CallTargetFinder {
    pub fn find(module: &Module, dsa: &impl DsaResult) -> Self {
        let mut finder = Self {
            ind_map: BTreeMap::new(),
            complete_sites: BTreeSet::new(),
            indirect_sites: Vec::new(),
            counters: TargetCounters::default(),
        };
        let callgraph = dsa.call_graph();
        let globals_sm = dsa.globals_graph();

        for (site, insn) in module.call_sites_iter() {
            let callee = match insn {
                Insn::Call { callee, .. } => *callee,
                _ => unreachable!(),
            };
            match callee {
                Operand::Undef => continue,
                Operand::Func(f) => {
                    finder.counters.direct += 1;
                    finder.ind_map.entry(site).or_default().push(f);
                    finder.complete_sites.insert(site);
                }
                Operand::NullPtr => {
                    // A call that can never execute; trivially complete.
                    finder.counters.direct += 1;
                    finder.complete_sites.insert(site);
                }
                Operand::Local(_) | Operand::Global(_) => {
                    finder.counters.indirect += 1;
                    finder.indirect_sites.push(site);
                    let mut candidates: Vec<FuncId> = Vec::new();
                    let mut seen: UnorderedSet<FuncId> = UnorderedSet::new();
                    let mut add_scc_of = |f: FuncId| {
                        for &m in callgraph.scc_members(f) {
                            // Only functions whose address flowed into the
                            // graph can really be called from here.
                            if globals_sm.lookup(Value::Func(m)).is_some() && seen.insert(m) {
                                candidates.push(m);
                            }
                        }
                    };
                    for f in callgraph.callees(site) {
                        add_scc_of(f);
                    }
                    // The caller's own cluster rides along; recursive
                    // indirect dispatch can point back into it.
                    add_scc_of(site.func);

                    let callee_value = match callee {
                        Operand::Local(l) => Value::Local {
                            func: site.func,
                            local: l,
                        },
                        Operand::Global(g) => Value::Global(g),
                        _ => unreachable!(),
                    };
                    let graph = dsa.ds_graph(site.func);
                    let node_flags = graph
                        .lookup(callee_value)
                        .map(|h| graph.store().node(h).flags())
                        .expect("No class for an indirect callee");
                    let closed = !node_flags.contains(NodeFlags::INCOMPLETE)
                        && !node_flags.contains(NodeFlags::EXTERNAL);
                    if closed && !candidates.is_empty() {
                        finder.complete_sites.insert(site);
                        finder.counters.complete_indirect += 1;
                    } else if closed {
                        finder.complete_sites.insert(site);
                        finder.counters.complete_empty += 1;
                        debug!(
                            "Call site resolved to no candidates";
                            "caller" => &module.function(site.func).name,
                            "insn" => site.insn,
                        );
                    }
                    finder.ind_map.insert(site, candidates);
                }
            }
        }
        finder
    }

    /// Whether the candidate list for `site` is certified to include every
    /// real callee. Every direct call is complete.
    pub fn is_complete(&self, site: SiteRef) -> bool {
        self.complete_sites.contains(&site)
    }

    /// The candidate callees of `site`, in discovery order.
    pub fn targets(&self, site: SiteRef) -> &[FuncId] {
        self.ind_map.get(&site).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn counters(&self) -> TargetCounters {
        self.counters
    }

    /// The `[* = incomplete]` report over the module's indirect sites.
    pub fn write_report(
        &self,
        module: &Module,
        w: &mut impl std::io::Write,
    ) -> std::io::Result<()> {
        writeln!(w, "[* = incomplete] CS: func list")?;
        for &site in &self.indirect_sites {
            let caller = module.function(site.func);
            let result_name = match &caller.insns[site.insn] {
                Insn::Call { dst: Some(d), .. } => format!("%{}", caller.local_name(*d)),
                _ => String::new(),
            };
            if !self.is_complete(site) {
                write!(w, "* ")?;
            }
            write!(w, "{}#{} {} {} :", caller.name, site.insn, caller.name, result_name)?;
            let targets = self
                .targets(site)
                .iter()
                .map(|&f| module.function(f).name.as_str())
                .join(" ");
            if targets.is_empty() {
                writeln!(w)?;
            } else {
                writeln!(w, " {}", targets)?;
            }
        }
        Ok(())
    }
}
