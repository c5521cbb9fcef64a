//! The points-to graph: one node store plus the maps that anchor IR values,
//! function returns, varargs and call sites into it.

use crate::containers::unordered::UnorderedSet;
use crate::ir::{FuncId, Linkage, LocalId, Module, SiteRef, Value};
use crate::log::*;
use crate::nodes::{NodeFlags, NodeHandle, NodeStore};
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Behavior selection for [`DsGraph::clone_into`].
    pub struct CloneFlags: u8 {
        /// Do not carry the primary call-site list over.
        const DONT_CLONE_CALL_SITES = 1 << 0;
        /// Do not carry the auxiliary call-site list over.
        const DONT_CLONE_AUX_CALL_SITES = 1 << 1;
        /// Clear the alloca bit on every cloned node.
        const STRIP_ALLOCA = 1 << 2;
    }
}

bitflags! {
    /// Behavior selection for [`DsGraph::mark_incomplete_nodes`].
    pub struct IncompleteFlags: u8 {
        /// Seed from the formals, return and vararg classes of externally
        /// visible functions.
        const MARK_FORMALS = 1 << 0;
        /// Do not seed from global nodes. External globals still seed; an
        /// external symbol is never fully summarized.
        const IGNORE_GLOBALS = 1 << 1;
    }
}

/// Policy for [`DsGraph::remove_dead_nodes`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RemoveDeadPolicy {
    /// Globals stay alive even when nothing else reaches them.
    KeepUnreachableGlobals,
    /// Globals unreachable from the non-global roots are dropped, along
    /// with their scalar-map entries.
    KillUnreachableGlobals,
}

/// What a call site calls.
#[derive(Clone, Debug)]
pub enum CalleeKind {
    Direct(FuncId),
    Indirect(NodeHandle),
}

/// One call site, with its actuals anchored into the owning graph.
#[derive(Clone, Debug)]
pub struct DsCallSite {
    pub site: SiteRef,
    pub callee: CalleeKind,
    /// Where the call's pointer result lands, when it has one.
    pub ret: Option<NodeHandle>,
    /// Caller-side varargs object, when one is known.
    pub va: Option<NodeHandle>,
    /// Pointer actuals, in argument order.
    pub args: Vec<NodeHandle>,
    /// Count of all actuals, pointer or not; used for callability checks.
    pub num_args: usize,
}

impl DsCallSite {
    pub fn caller(&self) -> FuncId {
        self.site.func
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.callee, CalleeKind::Direct(_))
    }

    pub(crate) fn handles_mut(&mut self) -> impl Iterator<Item = &mut NodeHandle> {
        let callee = match &mut self.callee {
            CalleeKind::Indirect(h) => Some(h),
            CalleeKind::Direct(_) => None,
        };
        callee
            .into_iter()
            .chain(self.ret.iter_mut())
            .chain(self.va.iter_mut())
            .chain(self.args.iter_mut())
    }

    fn handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        let callee = match &self.callee {
            CalleeKind::Indirect(h) => Some(*h),
            CalleeKind::Direct(_) => None,
        };
        callee
            .into_iter()
            .chain(self.ret.iter().copied())
            .chain(self.va.iter().copied())
            .chain(self.args.iter().copied())
    }
}

/// A points-to graph. Owns its nodes; every handle stored in it points into
/// its own store.
pub struct DsGraph {
    store: NodeStore,
    /// IR value to the class holding what it may point at. Grows
    /// monotonically: looking up an absent value binds a fresh empty node.
    scalar_map: BTreeMap<Value, NodeHandle>,
    return_nodes: BTreeMap<FuncId, NodeHandle>,
    vararg_nodes: BTreeMap<FuncId, NodeHandle>,
    call_sites: Vec<DsCallSite>,
    /// The variant bookkeeping list: sites not yet known to be resolved.
    aux_call_sites: Vec<DsCallSite>,
}

impl DsGraph {
    pub fn new() -> Self {
        Self {
            store: NodeStore::new(),
            scalar_map: BTreeMap::new(),
            return_nodes: BTreeMap::new(),
            vararg_nodes: BTreeMap::new(),
            call_sites: Vec::new(),
            aux_call_sites: Vec::new(),
        }
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut NodeStore {
        &mut self.store
    }

    /// The handle bound to `v`, binding a fresh empty node if absent.
    pub fn node_for_value(&mut self, v: Value) -> NodeHandle {
        if let Some(&h) = self.scalar_map.get(&v) {
            let h = self.store.canonicalize(h);
            self.scalar_map.insert(v, h);
            return h;
        }
        let h = NodeHandle::new(self.store.insert_empty(), 0);
        self.scalar_map.insert(v, h);
        h
    }

    /// The handle bound to `v`, if any, normalized.
    pub fn lookup(&self, v: Value) -> Option<NodeHandle> {
        self.scalar_map.get(&v).map(|&h| self.store.resolve(h))
    }

    /// Bind `v` to `h`, merging when `v` was already bound.
    pub fn bind_value(&mut self, v: Value, h: NodeHandle) {
        match self.scalar_map.get(&v) {
            Some(&existing) => self.store.merge(existing, h),
            None => {
                self.scalar_map.insert(v, h);
            }
        }
    }

    /// The target of the pointer stored at `h`, created empty on demand.
    pub fn link(&mut self, h: NodeHandle) -> NodeHandle {
        let h = self.store.canonicalize(h);
        if let Some(t) = self.store.node(h).edge(h.offset()) {
            return self.store.canonicalize(t);
        }
        let t = NodeHandle::new(self.store.insert_empty(), 0);
        self.store.node_mut(h).set_edge(h.offset(), t);
        t
    }

    /// Merge the pointer target at `h` with `target`.
    pub fn merge_link(&mut self, h: NodeHandle, target: NodeHandle) {
        let l = self.link(h);
        self.store.merge(l, target);
    }

    pub fn return_node_for(&mut self, f: FuncId) -> NodeHandle {
        if let Some(&h) = self.return_nodes.get(&f) {
            return self.store.canonicalize(h);
        }
        let h = NodeHandle::new(self.store.insert_empty(), 0);
        self.return_nodes.insert(f, h);
        h
    }

    pub fn lookup_return_node(&self, f: FuncId) -> Option<NodeHandle> {
        self.return_nodes.get(&f).map(|&h| self.store.resolve(h))
    }

    pub fn lookup_vararg_node(&self, f: FuncId) -> Option<NodeHandle> {
        self.vararg_nodes.get(&f).map(|&h| self.store.resolve(h))
    }

    pub fn vararg_node_for(&mut self, f: FuncId) -> NodeHandle {
        if let Some(&h) = self.vararg_nodes.get(&f) {
            return self.store.canonicalize(h);
        }
        let h = NodeHandle::new(self.store.insert_empty(), 0);
        self.vararg_nodes.insert(f, h);
        h
    }

    /// Drop return-node entries for functions `keep` rejects.
    pub fn retain_return_nodes(&mut self, keep: impl Fn(FuncId) -> bool) {
        self.return_nodes.retain(|&f, _| keep(f));
    }

    pub fn add_call_site(&mut self, cs: DsCallSite, also_aux: bool) {
        if also_aux {
            self.aux_call_sites.push(cs.clone());
        }
        self.call_sites.push(cs);
    }

    pub fn call_sites(&self) -> &[DsCallSite] {
        &self.call_sites
    }

    pub fn aux_call_sites(&self) -> &[DsCallSite] {
        &self.aux_call_sites
    }

    pub fn retain_aux_call_sites(&mut self, mut keep: impl FnMut(&NodeStore, &DsCallSite) -> bool) {
        let store = &self.store;
        self.aux_call_sites.retain(|cs| keep(store, cs));
    }

    pub fn scalar_entries(&self) -> impl Iterator<Item = (Value, NodeHandle)> + '_ {
        self.scalar_map.iter().map(|(&v, &h)| (v, h))
    }

    /// Move every node and mapping of `other` into `self`, without cloning.
    /// `other` must no longer be referenced by anyone else. Values bound in
    /// both graphs (globals, typically) have their classes merged, which is
    /// how global equivalence classes re-form.
    pub fn splice_from(&mut self, other: DsGraph) {
        let DsGraph {
            store,
            scalar_map,
            return_nodes,
            vararg_nodes,
            call_sites,
            aux_call_sites,
        } = other;
        let sid = self.store.store_id();
        let base = self.store.absorb(store);
        for (v, h) in scalar_map {
            let h = h.rebased(sid, base);
            self.bind_value(v, h);
        }
        for (f, h) in return_nodes {
            let h = h.rebased(sid, base);
            match self.return_nodes.get(&f) {
                Some(&existing) => self.store.merge(existing, h),
                None => {
                    self.return_nodes.insert(f, h);
                }
            }
        }
        for (f, h) in vararg_nodes {
            let h = h.rebased(sid, base);
            match self.vararg_nodes.get(&f) {
                Some(&existing) => self.store.merge(existing, h),
                None => {
                    self.vararg_nodes.insert(f, h);
                }
            }
        }
        for mut cs in call_sites {
            for h in cs.handles_mut() {
                *h = h.rebased(sid, base);
            }
            self.call_sites.push(cs);
        }
        for mut cs in aux_call_sites {
            for h in cs.handles_mut() {
                *h = h.rebased(sid, base);
            }
            self.aux_call_sites.push(cs);
        }
    }

    /// Deep-copy `src`'s nodes and mappings into `self`. Shared values
    /// merge, exactly as in [`Self::splice_from`]; `flags` selects whether
    /// call sites and the alloca bit come along.
    pub fn clone_into(&mut self, src: &DsGraph, flags: CloneFlags) {
        let sid = self.store.store_id();
        let base = self.store.clone_slots_from(&src.store);
        if flags.contains(CloneFlags::STRIP_ALLOCA) {
            self.store.clear_flags_from(base, NodeFlags::ALLOCA);
        }
        for (&v, &h) in &src.scalar_map {
            self.bind_value(v, h.rebased(sid, base));
        }
        for (&f, &h) in &src.return_nodes {
            let h = h.rebased(sid, base);
            match self.return_nodes.get(&f) {
                Some(&existing) => self.store.merge(existing, h),
                None => {
                    self.return_nodes.insert(f, h);
                }
            }
        }
        for (&f, &h) in &src.vararg_nodes {
            let h = h.rebased(sid, base);
            match self.vararg_nodes.get(&f) {
                Some(&existing) => self.store.merge(existing, h),
                None => {
                    self.vararg_nodes.insert(f, h);
                }
            }
        }
        if !flags.contains(CloneFlags::DONT_CLONE_CALL_SITES) {
            for cs in &src.call_sites {
                let mut cs = cs.clone();
                for h in cs.handles_mut() {
                    *h = h.rebased(sid, base);
                }
                self.call_sites.push(cs);
            }
        }
        if !flags.contains(CloneFlags::DONT_CLONE_AUX_CALL_SITES) {
            for cs in &src.aux_call_sites {
                let mut cs = cs.clone();
                for h in cs.handles_mut() {
                    *h = h.rebased(sid, base);
                }
                self.aux_call_sites.push(cs);
            }
        }
    }

    /// Resolve one call of `callee` at `cs`: merge the callee's return and
    /// vararg classes with the site's, then pairwise-merge formals with
    /// actuals. Trailing extras on either side land in the vararg class.
    ///
    /// When `callee_graph` is given, its contents are cloned in first; when
    /// it is `None` the callee is expected to have been spliced into `self`
    /// already and the merging happens in place.
    pub fn merge_in_graph(
        &mut self,
        cs: &DsCallSite,
        callee: FuncId,
        module: &Module,
        callee_graph: Option<&DsGraph>,
        flags: CloneFlags,
    ) {
        let f = module.function(callee);
        debug!(
            "Resolving call";
            "site" => ?cs.site, "callee" => &f.name,
        );
        if let Some(src) = callee_graph {
            self.clone_into(src, flags);
        }

        if let (Some(csret), Some(&ret)) = (cs.ret, self.return_nodes.get(&callee)) {
            self.store.merge(ret, csret);
        }
        if let (Some(csva), Some(&va)) = (cs.va, self.vararg_nodes.get(&callee)) {
            self.store.merge(va, csva);
        }

        let formals: Vec<NodeHandle> = f
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ty.is_pointer())
            .filter_map(|(i, _)| {
                self.scalar_map
                    .get(&Value::Local {
                        func: callee,
                        local: LocalId(i),
                    })
                    .copied()
            })
            .collect();
        let paired = formals.len().min(cs.args.len());
        for k in 0..paired {
            self.store.merge(formals[k], cs.args[k]);
        }
        if cs.args.len() > paired {
            let va = self.vararg_node_for(callee);
            for &a in &cs.args[paired..] {
                self.store.merge(va, a);
            }
        }
        if formals.len() > paired {
            if let Some(csva) = cs.va {
                for &p in &formals[paired..] {
                    self.store.merge(p, csva);
                }
            }
        }
    }

    /// Clear the incomplete bit everywhere, ahead of a fresh marking pass.
    pub fn mask_incomplete_markers(&mut self) {
        let slots: Vec<usize> = self.store.live_slots().map(|(s, _)| s).collect();
        for slot in slots {
            let h = self.store.handle_for_slot(slot);
            self.store.node_mut(h).clear_flags(NodeFlags::INCOMPLETE);
        }
    }

    /// Mark incomplete everything whose summary is not closed: formals and
    /// returns of externally visible functions, actuals and returns of
    /// unresolved call sites, global classes (per `flags`), external
    /// classes, and everything reachable from any of those through edges.
    pub fn mark_incomplete_nodes(&mut self, module: &Module, flags: IncompleteFlags) {
        let mut seeds: Vec<NodeHandle> = Vec::new();

        if flags.contains(IncompleteFlags::MARK_FORMALS) {
            for (&f, &ret) in &self.return_nodes {
                if module.function(f).linkage != Linkage::External {
                    continue;
                }
                seeds.push(ret);
                if let Some(&va) = self.vararg_nodes.get(&f) {
                    seeds.push(va);
                }
                for (i, p) in module.function(f).params.iter().enumerate() {
                    if !p.ty.is_pointer() {
                        continue;
                    }
                    if let Some(&h) = self.scalar_map.get(&Value::Local {
                        func: f,
                        local: LocalId(i),
                    }) {
                        seeds.push(h);
                    }
                }
            }
        }

        for cs in &self.aux_call_sites {
            seeds.extend(cs.ret);
            seeds.extend(cs.args.iter().copied());
        }

        for (slot, n) in self.store.live_slots() {
            let is_global = n.flags().contains(NodeFlags::GLOBAL);
            let is_external = n.flags().contains(NodeFlags::EXTERNAL);
            if is_external || (is_global && !flags.contains(IncompleteFlags::IGNORE_GLOBALS)) {
                seeds.push(self.store.handle_for_slot(slot));
            }
        }

        let mut worklist = seeds;
        while let Some(h) = worklist.pop() {
            let h = self.store.canonicalize(h);
            let node = self.store.node_mut(h);
            if node.flags().contains(NodeFlags::INCOMPLETE) {
                continue;
            }
            node.add_flags(NodeFlags::INCOMPLETE);
            worklist.extend(self.store.node(h).edges_iter().map(|(_, t)| t));
        }
    }

    /// Spread `flag` from every node carrying it to everything reachable
    /// through edges.
    pub fn propagate_flag_through_edges(&mut self, flag: NodeFlags) {
        let mut worklist: Vec<NodeHandle> = self
            .store
            .live_slots()
            .filter(|(_, n)| n.flags().contains(flag))
            .map(|(s, _)| self.store.handle_for_slot(s))
            .collect();
        let mut visited: UnorderedSet<usize> = UnorderedSet::new();
        while let Some(h) = worklist.pop() {
            let h = self.store.canonicalize(h);
            if !visited.insert(h.node().slot()) {
                continue;
            }
            self.store.node_mut(h).add_flags(flag);
            worklist.extend(self.store.node(h).edges_iter().map(|(_, t)| t));
        }
    }

    fn root_handles(&self) -> Vec<NodeHandle> {
        let mut roots: Vec<NodeHandle> = Vec::new();
        roots.extend(self.scalar_map.values().copied());
        roots.extend(self.return_nodes.values().copied());
        roots.extend(self.vararg_nodes.values().copied());
        for cs in self.call_sites.iter().chain(self.aux_call_sites.iter()) {
            roots.extend(cs.handles());
        }
        roots
    }

    fn canonicalize_stored_handles(&mut self) {
        let Self {
            store,
            scalar_map,
            return_nodes,
            vararg_nodes,
            call_sites,
            aux_call_sites,
        } = self;
        for h in scalar_map.values_mut() {
            *h = store.canonicalize(*h);
        }
        for h in return_nodes.values_mut() {
            *h = store.canonicalize(*h);
        }
        for h in vararg_nodes.values_mut() {
            *h = store.canonicalize(*h);
        }
        for cs in call_sites.iter_mut().chain(aux_call_sites.iter_mut()) {
            for h in cs.handles_mut() {
                *h = store.canonicalize(*h);
            }
        }
        store.canonicalize_all_edges();
    }

    /// Drop nodes that nothing references and that carry no flag out of
    /// `{Global, External, Incomplete, Modified, Read, Unknown}`, no globals
    /// and no recorded types. A single pass; not a reachability sweep.
    pub fn remove_trivially_dead_nodes(&mut self) {
        self.canonicalize_stored_handles();
        let mut referenced: UnorderedSet<usize> = UnorderedSet::new();
        for h in self.root_handles() {
            referenced.insert(self.store.canonical_slot(h));
        }
        let edge_targets: Vec<usize> = self
            .store
            .live_slots()
            .flat_map(|(_, n)| n.edges_iter())
            .map(|(_, t)| self.store.canonical_slot(t))
            .collect();
        referenced.extend(edge_targets);
        let keep = NodeFlags::GLOBAL
            | NodeFlags::EXTERNAL
            | NodeFlags::INCOMPLETE
            | NodeFlags::MODIFIED
            | NodeFlags::READ
            | NodeFlags::UNKNOWN;
        let before = self.store.num_live();
        self.store.sweep_unreferenced(&referenced, keep);
        trace!(
            "Removed trivially dead nodes";
            "before" => before, "after" => self.store.num_live(),
        );
    }

    /// Reachability-based sweep from the scalar map, return/vararg maps and
    /// call sites. Per `policy`, globals either stay as roots or survive
    /// only when reached from the non-global roots.
    pub fn remove_dead_nodes(&mut self, policy: RemoveDeadPolicy) {
        self.canonicalize_stored_handles();

        let mut roots: Vec<NodeHandle> = Vec::new();
        for (&v, &h) in &self.scalar_map {
            if !matches!(v, Value::Global(_) | Value::Func(_)) {
                roots.push(h);
            }
        }
        roots.extend(self.return_nodes.values().copied());
        roots.extend(self.vararg_nodes.values().copied());
        for cs in self.call_sites.iter().chain(self.aux_call_sites.iter()) {
            roots.extend(cs.handles());
        }

        let reached = match policy {
            RemoveDeadPolicy::KeepUnreachableGlobals => {
                for (&v, &h) in &self.scalar_map {
                    if matches!(v, Value::Global(_) | Value::Func(_)) {
                        roots.push(h);
                    }
                }
                self.store.reachable_slots(roots)
            }
            RemoveDeadPolicy::KillUnreachableGlobals => {
                let base_reach = self.store.reachable_slots(roots.iter().copied());
                let store = &self.store;
                self.scalar_map.retain(|v, h| {
                    !matches!(v, Value::Global(_) | Value::Func(_))
                        || base_reach.contains(&store.canonical_slot(*h))
                });
                for (&v, &h) in &self.scalar_map {
                    if matches!(v, Value::Global(_) | Value::Func(_)) {
                        roots.push(h);
                    }
                }
                self.store.reachable_slots(roots)
            }
        };

        let dead: Vec<usize> = self
            .store
            .live_slots()
            .map(|(s, _)| s)
            .filter(|s| !reached.contains(s))
            .collect();
        debug!(
            "Removing dead nodes";
            "dead" => dead.len(), "live" => self.store.num_live(),
        );
        for slot in dead {
            self.store.remove_slot(slot);
        }
    }
}

impl Default for DsGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DsGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let DsGraph {
            store,
            scalar_map,
            return_nodes,
            vararg_nodes,
            call_sites,
            aux_call_sites,
        } = self;
        f.debug_struct("DsGraph")
            .field("store", store)
            .field(
                "scalar_map",
                &scalar_map
                    .iter()
                    .map(|(v, h)| (v, store.resolve(*h).node().slot()))
                    .collect::<BTreeMap<_, _>>(),
            )
            .field("return_nodes", return_nodes)
            .field("vararg_nodes", vararg_nodes)
            .field("call_sites", &call_sites.len())
            .field("aux_call_sites", &aux_call_sites.len())
            .finish()
    }
}
