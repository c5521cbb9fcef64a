//! The per-function seeding pass behind the whole-program driver.
//!
//! Deliberately simple: it records allocations, load/store edges, address
//! arithmetic and call sites, which is all the unification pass needs as
//! input. Field-sensitive precision beyond recorded offsets is not its job.

use crate::graph::{CalleeKind, DsCallSite, DsGraph};
use crate::ir::{FuncId, GepOffset, GlobalSym, Insn, Linkage, LocalId, Module, Operand, SiteRef, Value};
use crate::log::*;
use crate::nodes::{NodeFlags, NodeHandle};
use std::collections::BTreeMap;

/// The input interface the whole-program driver consumes. See also
/// [`crate::call_targets::DsaResult`], the output-side counterpart.
pub trait LocalDsa {
    /// Hand over the graph of a defined function. Owned transfer: the
    /// driver splices from it, and the function must not be asked for
    /// again.
    fn take_ds_graph(&mut self, f: FuncId) -> DsGraph;

    /// The module-wide globals graph. The driver clones it once.
    fn globals_graph(&self) -> &DsGraph;

    /// Whether `f` is a signature-compatible target for the call at `cs`.
    fn function_is_callable(&self, cs: &DsCallSite, f: FuncId) -> bool;
}

/// Builds one graph per defined function, plus the globals graph.
pub struct LocalGraphBuilder<'m> {
    module: &'m Module,
    graphs: BTreeMap<FuncId, DsGraph>,
    globals: DsGraph,
}

impl<'m> LocalGraphBuilder<'m> {
    pub fn build(module: &'m Module) -> Self {
        let globals = build_globals_graph(module);
        let mut graphs = BTreeMap::new();
        for (fid, f) in module.functions_iter() {
            if f.is_declaration {
                continue;
            }
            graphs.insert(fid, build_function_graph(module, fid));
        }
        Self {
            module,
            graphs,
            globals,
        }
    }
}

impl LocalDsa for LocalGraphBuilder<'_> {
    fn take_ds_graph(&mut self, f: FuncId) -> DsGraph {
        self.graphs
            .remove(&f)
            .unwrap_or_else(|| panic!("No graph for @{}", self.module.function(f).name))
    }

    fn globals_graph(&self) -> &DsGraph {
        &self.globals
    }

    fn function_is_callable(&self, cs: &DsCallSite, f: FuncId) -> bool {
        let f = self.module.function(f);
        if f.is_vararg {
            cs.num_args >= f.params.len()
        } else {
            cs.num_args == f.params.len()
        }
    }
}

fn symbol_is_external(module: &Module, sym: GlobalSym) -> bool {
    match sym {
        GlobalSym::Var(g) => {
            let g = module.global(g);
            g.is_declaration || g.linkage != Linkage::Internal
        }
        GlobalSym::Func(f) => {
            let f = module.function(f);
            f.is_declaration || f.linkage != Linkage::Internal
        }
    }
}

/// Bind a module-level symbol into `g`'s scalar map, decorating its class
/// with the symbol and its visibility.
fn symbol_handle(g: &mut DsGraph, module: &Module, sym: GlobalSym) -> NodeHandle {
    let v = match sym {
        GlobalSym::Var(gid) => Value::Global(gid),
        GlobalSym::Func(fid) => Value::Func(fid),
    };
    let h = g.node_for_value(v);
    let node = g.store_mut().node_mut(h);
    node.add_flags(NodeFlags::GLOBAL);
    node.add_global(sym);
    if symbol_is_external(module, sym) {
        node.add_flags(NodeFlags::EXTERNAL);
    }
    h
}

/// Bind `op` into `g`'s scalar map. Constants have no class.
fn operand_handle(
    g: &mut DsGraph,
    module: &Module,
    func: FuncId,
    op: Operand,
) -> Option<NodeHandle> {
    match op {
        Operand::Local(local) => Some(g.node_for_value(Value::Local { func, local })),
        Operand::Global(gid) => Some(symbol_handle(g, module, GlobalSym::Var(gid))),
        Operand::Func(fid) => Some(symbol_handle(g, module, GlobalSym::Func(fid))),
        Operand::NullPtr | Operand::Undef => None,
    }
}

fn build_globals_graph(module: &Module) -> DsGraph {
    let mut g = DsGraph::new();
    for (gid, gv) in module.globals_iter() {
        let h = symbol_handle(&mut g, module, GlobalSym::Var(gid));
        match gv.init {
            Some(Operand::Global(init)) => {
                let ih = symbol_handle(&mut g, module, GlobalSym::Var(init));
                g.merge_link(h, ih);
            }
            Some(Operand::Func(init)) => {
                let ih = symbol_handle(&mut g, module, GlobalSym::Func(init));
                g.merge_link(h, ih);
            }
            Some(Operand::NullPtr) | Some(Operand::Undef) | None => {}
            Some(other) => panic!("Invalid initializer {:?} for @{}", other, gv.name),
        }
    }
    // Only address-taken functions can flow into an indirect call, so only
    // they appear here.
    for fid in module.address_taken_functions() {
        symbol_handle(&mut g, module, GlobalSym::Func(fid));
    }
    g
}

fn build_function_graph(module: &Module, fid: FuncId) -> DsGraph {
    let f = module.function(fid);
    let mut g = DsGraph::new();

    // Pointer formals get their classes up front, so they exist even when
    // the body never touches them.
    for (i, p) in f.params.iter().enumerate() {
        if p.ty.is_pointer() {
            g.node_for_value(Value::Local {
                func: fid,
                local: LocalId(i),
            });
        }
    }

    for (idx, insn) in f.insns.iter().enumerate() {
        match insn {
            Insn::Alloca { dst, size } => {
                let h = g.node_for_value(Value::Local { func: fid, local: *dst });
                let node = g.store_mut().node_mut(h);
                node.add_flags(NodeFlags::ALLOCA);
                node.grow_size(*size);
            }
            Insn::HeapAlloc { dst, size } => {
                let h = g.node_for_value(Value::Local { func: fid, local: *dst });
                let node = g.store_mut().node_mut(h);
                node.add_flags(NodeFlags::HEAP);
                node.grow_size(*size);
            }
            Insn::Load { dst, ptr, ty } => {
                let ph = match operand_handle(&mut g, module, fid, *ptr) {
                    Some(h) => h,
                    None => {
                        trace!("Load through a constant pointer; ignoring"; "func" => &f.name);
                        continue;
                    }
                };
                let node = g.store_mut().node_mut(ph);
                node.add_flags(NodeFlags::READ);
                node.grow_size(ph.offset() + ty.size_bytes());
                if node.record_type(ph.offset(), *ty) {
                    g.store_mut().fold_completely(ph);
                }
                if ty.is_pointer() {
                    let target = g.link(ph);
                    let dh = g.node_for_value(Value::Local { func: fid, local: *dst });
                    g.store_mut().merge(dh, target);
                }
            }
            Insn::Store { val, ptr, ty } => {
                let ph = match operand_handle(&mut g, module, fid, *ptr) {
                    Some(h) => h,
                    None => {
                        trace!("Store through a constant pointer; ignoring"; "func" => &f.name);
                        continue;
                    }
                };
                let node = g.store_mut().node_mut(ph);
                node.add_flags(NodeFlags::MODIFIED);
                node.grow_size(ph.offset() + ty.size_bytes());
                if node.record_type(ph.offset(), *ty) {
                    g.store_mut().fold_completely(ph);
                }
                if ty.is_pointer() {
                    if let Some(vh) = operand_handle(&mut g, module, fid, *val) {
                        g.merge_link(ph, vh);
                    }
                }
            }
            Insn::Gep { dst, base, offset } => {
                let bh = match operand_handle(&mut g, module, fid, *base) {
                    Some(h) => h,
                    None => continue,
                };
                let target = match offset {
                    GepOffset::Const(c) => {
                        g.store_mut().node_mut(bh).grow_size(bh.offset() + c + 1);
                        NodeHandle::new(bh.node(), bh.offset() + c)
                    }
                    GepOffset::Unknown => {
                        // Variable indexing: the base is indexable and the
                        // result may land anywhere in it.
                        g.store_mut().node_mut(bh).add_flags(NodeFlags::ARRAY);
                        NodeHandle::new(bh.node(), 0)
                    }
                };
                g.bind_value(Value::Local { func: fid, local: *dst }, target);
            }
            Insn::Cast { dst, src } => {
                if let Some(sh) = operand_handle(&mut g, module, fid, *src) {
                    g.bind_value(Value::Local { func: fid, local: *dst }, sh);
                }
            }
            Insn::IntToPtr { dst } => {
                let h = g.node_for_value(Value::Local { func: fid, local: *dst });
                g.store_mut()
                    .node_mut(h)
                    .add_flags(NodeFlags::UNKNOWN | NodeFlags::INT_TO_PTR);
            }
            Insn::PtrToInt { src } => {
                if let Some(h) = operand_handle(&mut g, module, fid, *src) {
                    g.store_mut().node_mut(h).add_flags(NodeFlags::PTR_TO_INT);
                }
            }
            Insn::Call { dst, callee, args } => {
                let callee_kind = match callee {
                    Operand::Func(target) => CalleeKind::Direct(*target),
                    Operand::NullPtr | Operand::Undef => {
                        debug!(
                            "Call through a constant callee; skipping site";
                            "func" => &f.name, "insn" => idx,
                        );
                        continue;
                    }
                    _ => match operand_handle(&mut g, module, fid, *callee) {
                        Some(h) => CalleeKind::Indirect(h),
                        None => continue,
                    },
                };
                let ret = dst.map(|d| g.node_for_value(Value::Local { func: fid, local: d }));
                let arg_handles: Vec<NodeHandle> = args
                    .iter()
                    .filter_map(|a| operand_handle(&mut g, module, fid, *a))
                    .collect();
                // A callee defined elsewhere can do anything with what it
                // receives.
                if let CalleeKind::Direct(target) = callee_kind {
                    if module.function(target).is_declaration {
                        for &h in arg_handles.iter().chain(ret.iter()) {
                            g.store_mut().node_mut(h).add_flags(NodeFlags::EXTERNAL);
                        }
                    }
                }
                g.add_call_site(
                    DsCallSite {
                        site: SiteRef { func: fid, insn: idx },
                        callee: callee_kind,
                        ret,
                        va: None,
                        args: arg_handles,
                        num_args: args.len(),
                    },
                    true,
                );
            }
            Insn::Ret { val } => {
                if let Some(op) = val {
                    if let Some(vh) = operand_handle(&mut g, module, fid, *op) {
                        let ret = g.return_node_for(fid);
                        g.store_mut().merge(ret, vh);
                    }
                }
            }
        }
    }
    g
}
