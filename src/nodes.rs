//! DS-node storage and unification.
//!
//! Nodes live in an arena ([`NodeStore`]) and are referred to through opaque
//! [`NodeHandle`]s. A merged-away node leaves a forwarding handle behind that
//! carries the offset delta into its representative; reads chase and shorten
//! these chains.

use crate::containers::unordered::UnorderedSet;
use crate::containers::InsertionOrderedSet;
use crate::ir::{FuncId, GlobalSym, Ty};
use crate::log::*;
use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

static STORE_COUNT: AtomicUsize = AtomicUsize::new(0);

bitflags! {
    /// Property bits of a [`DsNode`].
    pub struct NodeFlags: u16 {
        /// Contents are not yet fully summarized (escapes into external
        /// code, formals of visible functions, returns of unknown callees).
        const INCOMPLETE = 1 << 0;
        /// Memory visible to code outside the analyzed module.
        const EXTERNAL = 1 << 1;
        /// Holds at least one stack allocation.
        const ALLOCA = 1 << 2;
        /// Holds at least one heap allocation.
        const HEAP = 1 << 3;
        /// Holds at least one module-level object.
        const GLOBAL = 1 << 4;
        /// Object of unknown provenance.
        const UNKNOWN = 1 << 5;
        /// A pointer manufactured from an integer reaches this class.
        const INT_TO_PTR = 1 << 6;
        /// A pointer in this class has been observed escaping into an
        /// integer.
        const PTR_TO_INT = 1 << 7;
        /// Internal structure has been collapsed; every offset reads as 0.
        const FOLDED = 1 << 8;
        const MODIFIED = 1 << 9;
        const READ = 1 << 10;
        /// Treated as indexable; offsets wrap modulo the size.
        const ARRAY = 1 << 11;
    }
}

/// An opaque reference to a node in a specific [`NodeStore`].
///
/// NOTE: Does *not* implement PartialEq, Eq, ...; two distinct ids may come
/// to denote the same node after merging. Use [`NodeStore::index_eq`] to
/// compare, or [`NodeId::surely_equal`] for the cheap one-sided check.
#[derive(Clone, Copy, Debug)]
pub struct NodeId {
    store_id: usize,
    idx: usize,
}

impl NodeId {
    /// Equality comparison that returns true if the two ids are guaranteed
    /// to denote the same node. If it returns false, nothing can be said
    /// about the ids; see [`NodeStore::index_eq`] for the real comparison.
    pub fn surely_equal(&self, other: &Self) -> bool {
        let Self { store_id, idx } = *other;
        self.store_id == store_id && self.idx == idx
    }

    /// Convert to a string. This should only be used for debugging or `.dot`
    /// generation purposes.
    #[allow(clippy::inherent_to_string)]
    pub fn to_string(self) -> String {
        self.idx.to_string()
    }

    pub(crate) fn slot(&self) -> usize {
        self.idx
    }
}

/// `(node, offset)`: the universal reference held by scalar maps, edge maps,
/// return maps and call sites. The offset is a byte offset into the target.
///
/// Stored handles may be stale; [`NodeStore::resolve`] (or
/// [`NodeStore::canonicalize`], which also shortens chains) normalizes them.
/// Normalization is idempotent.
#[derive(Clone, Copy, Debug)]
pub struct NodeHandle {
    node: NodeId,
    offset: usize,
}

impl NodeHandle {
    pub fn new(node: NodeId, offset: usize) -> Self {
        Self { node, offset }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn rebased(self, store_id: usize, base: usize) -> Self {
        Self {
            node: NodeId {
                store_id,
                idx: self.node.idx + base,
            },
            offset: self.offset,
        }
    }
}

/// An equivalence class of memory objects.
#[derive(Clone, Default)]
pub struct DsNode {
    /// Known byte size; 0 means collapsed or no size known yet.
    size: usize,
    flags: NodeFlags,
    /// Byte offset to the IR types observed living there.
    types: BTreeMap<usize, BTreeSet<Ty>>,
    /// Byte offset to what the pointer stored there may point at.
    edges: BTreeMap<usize, NodeHandle>,
    /// Globals whose address is classified into this node, in first-seen
    /// order.
    globals: InsertionOrderedSet<GlobalSym>,
}

impl Default for NodeFlags {
    fn default() -> Self {
        NodeFlags::empty()
    }
}

impl DsNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn add_flags(&mut self, flags: NodeFlags) {
        self.flags |= flags;
    }

    pub fn clear_flags(&mut self, mask: NodeFlags) {
        self.flags &= !mask;
    }

    pub fn is_folded(&self) -> bool {
        self.flags.contains(NodeFlags::FOLDED)
    }

    /// Grow the size to at least `at_least` bytes. Size never shrinks while
    /// the node is unfolded; a folded node stays at the 0 sentinel.
    pub fn grow_size(&mut self, at_least: usize) {
        if self.is_folded() {
            return;
        }
        if at_least > self.size {
            self.size = at_least;
        }
    }

    /// Record that a value of type `ty` lives at `offset`. Returns `true`
    /// when `ty` conflicts with a differently-sized type already recorded
    /// there; the caller is expected to fold.
    pub fn record_type(&mut self, offset: usize, ty: Ty) -> bool {
        if self.is_folded() {
            return false;
        }
        let set = self.types.entry(offset).or_default();
        let conflict = !set.is_empty()
            && !set.contains(&ty)
            && set.iter().any(|t| t.size_bytes() != ty.size_bytes());
        set.insert(ty);
        conflict
    }

    pub fn edge(&self, offset: usize) -> Option<NodeHandle> {
        self.edges.get(&offset).copied()
    }

    pub fn set_edge(&mut self, offset: usize, target: NodeHandle) {
        let offset = if self.is_folded() { 0 } else { offset };
        let prev = self.edges.insert(offset, target);
        assert!(prev.is_none(), "Overwrote an existing edge; merge instead");
    }

    pub fn edges_iter(&self) -> impl Iterator<Item = (usize, NodeHandle)> + '_ {
        self.edges.iter().map(|(&o, &h)| (o, h))
    }

    pub fn types_iter(&self) -> impl Iterator<Item = (usize, &BTreeSet<Ty>)> {
        self.types.iter().map(|(&o, tys)| (o, tys))
    }

    pub fn add_global(&mut self, sym: GlobalSym) {
        self.globals.insert(sym);
    }

    pub fn globals_iter(&self) -> impl Iterator<Item = &GlobalSym> {
        self.globals.iter()
    }

    pub fn has_globals(&self) -> bool {
        !self.globals.is_empty()
    }

    /// The functions whose address reaches this class, in first-seen order.
    /// These are the possible targets of an indirect call through this node.
    pub fn functions(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.globals.iter().filter_map(|g| g.as_func())
    }

    pub(crate) fn handles_mut(&mut self) -> impl Iterator<Item = &mut NodeHandle> {
        self.edges.values_mut()
    }

    fn has_no_interesting_content(&self) -> bool {
        self.globals.is_empty() && self.types.is_empty()
    }
}

impl std::fmt::Debug for DsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let DsNode {
            size,
            flags,
            types,
            edges,
            globals,
        } = self;
        let mut p = f.debug_struct("DsNode");
        p.field("size", size);
        if !flags.is_empty() {
            p.field("flags", flags);
        }
        if !types.is_empty() {
            p.field("types", types);
        }
        if !edges.is_empty() {
            p.field(
                "edges",
                &edges
                    .iter()
                    .map(|(o, h)| (*o, h.node.idx))
                    .collect::<BTreeMap<_, _>>(),
            );
        }
        if !globals.is_empty() {
            p.field("globals", globals);
        }
        p.finish_non_exhaustive()
    }
}

enum Slot {
    Live(DsNode),
    /// Merged away; the handle records the representative and the offset
    /// delta by which this node's offsets shift when viewed inside it.
    Forwarded(NodeHandle),
    /// Removed by a dead-node sweep. Using a handle to a dead slot is a
    /// programming error.
    Dead,
}

/// The arena that owns every node of one graph and performs unification.
pub struct NodeStore {
    store_id: usize,
    slots: Vec<Slot>,
    /// Merges discovered while a merge is in progress; drained before any
    /// public mutation returns. Queueing instead of recursing is what keeps
    /// deeply-linked structures from blowing the stack.
    pending: VecDeque<(NodeHandle, NodeHandle)>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            store_id: STORE_COUNT.fetch_add(1, Ordering::SeqCst),
            slots: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, node: DsNode) -> NodeId {
        let idx = self.slots.len();
        self.slots.push(Slot::Live(node));
        NodeId {
            store_id: self.store_id,
            idx,
        }
    }

    pub fn insert_empty(&mut self) -> NodeId {
        self.insert(DsNode::new())
    }

    fn assert_same_store(&self, h: NodeHandle) {
        assert_eq!(
            h.node.store_id, self.store_id,
            "Using a handle for store {} on store {}",
            h.node.store_id, self.store_id,
        );
    }

    fn live(&self, slot: usize) -> &DsNode {
        match &self.slots[slot] {
            Slot::Live(n) => n,
            Slot::Forwarded(_) => panic!("Expected a representative at slot {}", slot),
            Slot::Dead => panic!("Handle used after its node was removed"),
        }
    }

    fn live_mut(&mut self, slot: usize) -> &mut DsNode {
        match &mut self.slots[slot] {
            Slot::Live(n) => n,
            Slot::Forwarded(_) => panic!("Expected a representative at slot {}", slot),
            Slot::Dead => panic!("Handle used after its node was removed"),
        }
    }

    fn adjusted_offset(n: &DsNode, offset: usize) -> usize {
        if n.is_folded() || n.size == 0 {
            0
        } else if n.flags.contains(NodeFlags::ARRAY) {
            offset % n.size
        } else {
            offset.min(n.size - 1)
        }
    }

    /// Chase `h`'s forwarding chain without modifying anything. The returned
    /// handle points at a representative.
    pub fn resolve(&self, h: NodeHandle) -> NodeHandle {
        self.assert_same_store(h);
        let mut idx = h.node.idx;
        let mut off = h.offset;
        loop {
            match &self.slots[idx] {
                Slot::Live(n) => {
                    return NodeHandle {
                        node: NodeId {
                            store_id: self.store_id,
                            idx,
                        },
                        offset: Self::adjusted_offset(n, off),
                    }
                }
                Slot::Forwarded(f) => {
                    off += f.offset;
                    idx = f.node.idx;
                }
                Slot::Dead => panic!("Handle used after its node was removed"),
            }
        }
    }

    /// Like [`Self::resolve`], but also rewrites the chased chain so that
    /// every link points directly at the representative.
    pub fn canonicalize(&mut self, h: NodeHandle) -> NodeHandle {
        self.assert_same_store(h);
        let mut idx = h.node.idx;
        let mut off = h.offset;
        let mut chain: Vec<(usize, usize)> = Vec::new();
        loop {
            match &self.slots[idx] {
                Slot::Live(_) => break,
                Slot::Forwarded(f) => {
                    chain.push((idx, f.offset));
                    off += f.offset;
                    idx = f.node.idx;
                }
                Slot::Dead => panic!("Handle used after its node was removed"),
            }
        }
        let root = NodeId {
            store_id: self.store_id,
            idx,
        };
        let mut delta = 0;
        for &(slot, fwd_off) in chain.iter().rev() {
            delta += fwd_off;
            self.slots[slot] = Slot::Forwarded(NodeHandle {
                node: root,
                offset: delta,
            });
        }
        NodeHandle {
            node: root,
            offset: Self::adjusted_offset(self.live(idx), off),
        }
    }

    /// Read access to the node `h` denotes (after normalization).
    pub fn node(&self, h: NodeHandle) -> &DsNode {
        let h = self.resolve(h);
        self.live(h.node.idx)
    }

    /// Mutable access to the node `h` denotes (after normalization).
    pub fn node_mut(&mut self, h: NodeHandle) -> &mut DsNode {
        let h = self.canonicalize(h);
        self.live_mut(h.node.idx)
    }

    /// Check if two handles denote the same node.
    pub fn index_eq(&self, a: NodeHandle, b: NodeHandle) -> bool {
        self.resolve(a).node.idx == self.resolve(b).node.idx
    }

    pub fn num_live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    pub(crate) fn store_id(&self) -> usize {
        self.store_id
    }

    pub(crate) fn live_slots(&self) -> impl Iterator<Item = (usize, &DsNode)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Live(n) => Some((i, n)),
            _ => None,
        })
    }

    pub(crate) fn handle_for_slot(&self, slot: usize) -> NodeHandle {
        assert!(matches!(self.slots[slot], Slot::Live(_)));
        NodeHandle {
            node: NodeId {
                store_id: self.store_id,
                idx: slot,
            },
            offset: 0,
        }
    }

    pub(crate) fn canonical_slot(&self, h: NodeHandle) -> usize {
        self.resolve(h).node.idx
    }

    pub(crate) fn remove_slot(&mut self, slot: usize) {
        self.slots[slot] = Slot::Dead;
    }

    /// Merge the equivalence classes denoted by `h1` and `h2`, so that both
    /// normalize to the same `(representative, offset)` afterwards. Total:
    /// never fails, at worst folds.
    pub fn merge(&mut self, h1: NodeHandle, h2: NodeHandle) {
        self.pending.push_back((h1, h2));
        self.drain_pending();
    }

    /// Collapse the node's internal structure: size becomes the 0 sentinel,
    /// the type record empties, and all edges merge into a single edge at
    /// offset 0. Subsequent reads treat every offset as 0.
    pub fn fold_completely(&mut self, h: NodeHandle) {
        self.fold_one(h);
        self.drain_pending();
    }

    fn drain_pending(&mut self) {
        while let Some((a, b)) = self.pending.pop_front() {
            self.merge_one(a, b);
        }
    }

    fn merge_one(&mut self, h1: NodeHandle, h2: NodeHandle) {
        let a = self.canonicalize(h1);
        let b = self.canonicalize(h2);

        if a.node.idx == b.node.idx {
            if a.offset != b.offset {
                // One node, two aliasing offsets.
                self.fold_one(a);
            }
            return;
        }

        // A folded node forces its partner folded too, so that both sides
        // agree every offset is zero.
        let a_folded = self.live(a.node.idx).is_folded();
        let b_folded = self.live(b.node.idx).is_folded();
        if a_folded && !b_folded {
            self.fold_one(b);
        } else if b_folded && !a_folded {
            self.fold_one(a);
        }
        let a = self.canonicalize(a);
        let b = self.canonicalize(b);
        if a.node.idx == b.node.idx {
            if a.offset != b.offset {
                self.fold_one(a);
            }
            return;
        }

        // Representative: larger size wins; ties go to the earlier
        // allocation.
        let size_a = self.live(a.node.idx).size;
        let size_b = self.live(b.node.idx).size;
        let (r, s) = if size_a > size_b {
            (a, b)
        } else if size_b > size_a {
            (b, a)
        } else if a.node.idx <= b.node.idx {
            (a, b)
        } else {
            (b, a)
        };

        if r.offset < s.offset {
            // The offset map cannot express the negative shift this merge
            // would need; collapse both sides and retry at offset zero.
            trace!(
                "Merge with negative shift; folding both sides";
                "rep_offset" => r.offset, "other_offset" => s.offset,
            );
            self.fold_one(r);
            self.fold_one(s);
            self.pending
                .push_back((NodeHandle::new(r.node, 0), NodeHandle::new(s.node, 0)));
            return;
        }
        let delta = r.offset - s.offset;

        // Unhook `s`, leaving its forwarding handle behind. Everything it
        // knew moves into `r`, shifted by `delta`.
        let snode = match std::mem::replace(
            &mut self.slots[s.node.idx],
            Slot::Forwarded(NodeHandle::new(r.node, delta)),
        ) {
            Slot::Live(n) => n,
            _ => unreachable!(),
        };
        let DsNode {
            size,
            flags,
            types,
            edges,
            globals,
        } = snode;

        let mut queued: Vec<(NodeHandle, NodeHandle)> = Vec::new();
        let mut conflict = false;
        {
            let rnode = self.live_mut(r.node.idx);
            if flags.contains(NodeFlags::ARRAY) {
                rnode.flags.insert(NodeFlags::ARRAY);
            }
            let r_folded = rnode.is_folded();
            let r_array = rnode.flags.contains(NodeFlags::ARRAY);
            if !r_folded && !r_array && size + delta > rnode.size {
                rnode.size = size + delta;
            }
            rnode.flags |= flags & !NodeFlags::FOLDED;
            for g in globals.iter() {
                rnode.globals.insert(*g);
            }
            // Shifted offsets must land where a normalized read will look
            // for them: 0 when folded, wrapped when indexable.
            let rsize = rnode.size;
            let place = |o: usize| {
                if r_folded {
                    0
                } else if r_array && rsize > 0 {
                    (o + delta) % rsize
                } else {
                    o + delta
                }
            };
            for (o, tys) in types {
                for ty in tys {
                    conflict |= rnode.record_type(place(o), ty);
                }
            }
            for (o, h) in edges {
                let o = place(o);
                match rnode.edges.get(&o) {
                    Some(&existing) => queued.push((existing, h)),
                    None => {
                        rnode.edges.insert(o, h);
                    }
                }
            }
        }
        self.pending.extend(queued);
        if conflict {
            debug!("Type conflict while merging; folding representative");
            self.fold_one(r);
        }
    }

    fn fold_one(&mut self, h: NodeHandle) {
        let h = self.canonicalize(h);
        let slot = h.node.idx;
        let (first, rest) = {
            let node = self.live_mut(slot);
            if node.is_folded() {
                return;
            }
            node.flags.insert(NodeFlags::FOLDED);
            node.size = 0;
            node.types.clear();
            let mut it = std::mem::take(&mut node.edges).into_values();
            let first = it.next();
            (first, it.collect::<Vec<_>>())
        };
        if let Some(first) = first {
            self.live_mut(slot).edges.insert(0, first);
            for other in rest {
                self.pending.push_back((first, other));
            }
        }
    }

    /// Move every slot of `other` into `self`, re-tagging handles as it
    /// goes. Returns the slot base the moved nodes now start at; a handle
    /// of `other` translates via [`NodeHandle::rebased`] with that base.
    pub(crate) fn absorb(&mut self, other: NodeStore) -> usize {
        assert!(
            other.pending.is_empty(),
            "Absorbing a store in the middle of a merge"
        );
        let base = self.slots.len();
        let sid = self.store_id;
        for mut slot in other.slots {
            match &mut slot {
                Slot::Live(n) => {
                    for h in n.handles_mut() {
                        *h = h.rebased(sid, base);
                    }
                }
                Slot::Forwarded(f) => *f = f.rebased(sid, base),
                Slot::Dead => {}
            }
            self.slots.push(slot);
        }
        base
    }

    /// Deep-copy every slot of `src` into `self`. Returns the slot base,
    /// exactly as [`Self::absorb`] does.
    pub(crate) fn clone_slots_from(&mut self, src: &NodeStore) -> usize {
        assert!(
            src.pending.is_empty(),
            "Cloning a store in the middle of a merge"
        );
        let base = self.slots.len();
        let sid = self.store_id;
        for slot in &src.slots {
            let cloned = match slot {
                Slot::Live(n) => {
                    let mut n = n.clone();
                    for h in n.handles_mut() {
                        *h = h.rebased(sid, base);
                    }
                    Slot::Live(n)
                }
                Slot::Forwarded(f) => Slot::Forwarded(f.rebased(sid, base)),
                Slot::Dead => Slot::Dead,
            };
            self.slots.push(cloned);
        }
        base
    }

    /// Strip `mask` from every live node at slot `from` onward. Used right
    /// after a clone to honor clone-behavior flags.
    pub(crate) fn clear_flags_from(&mut self, from: usize, mask: NodeFlags) {
        for slot in &mut self.slots[from..] {
            if let Slot::Live(n) = slot {
                n.flags &= !mask;
            }
        }
    }

    /// Rewrite every edge of every live node to canonical form, so that
    /// forwarding slots become unreferenced.
    pub(crate) fn canonicalize_all_edges(&mut self) {
        for slot in 0..self.slots.len() {
            let edges: Vec<(usize, NodeHandle)> = match &self.slots[slot] {
                Slot::Live(n) => n.edges_iter().collect(),
                _ => continue,
            };
            let canon: Vec<(usize, NodeHandle)> = edges
                .into_iter()
                .map(|(o, h)| (o, self.canonicalize(h)))
                .collect();
            match &mut self.slots[slot] {
                Slot::Live(n) => n.edges = canon.into_iter().collect(),
                _ => unreachable!(),
            }
        }
    }

    /// The canonical slots reachable from `roots` through edges.
    pub(crate) fn reachable_slots(
        &self,
        roots: impl IntoIterator<Item = NodeHandle>,
    ) -> UnorderedSet<usize> {
        let mut reached = UnorderedSet::new();
        let mut worklist: Vec<usize> = roots
            .into_iter()
            .map(|h| self.canonical_slot(h))
            .collect();
        while let Some(slot) = worklist.pop() {
            if !reached.insert(slot) {
                continue;
            }
            for (_, t) in self.live(slot).edges_iter() {
                let t = self.canonical_slot(t);
                if !reached.contains(&t) {
                    worklist.push(t);
                }
            }
        }
        reached
    }

    /// Drop live nodes that nothing references and that carry none of the
    /// flags in `keep_mask`, no globals and no recorded types.
    pub(crate) fn sweep_unreferenced(
        &mut self,
        referenced: &UnorderedSet<usize>,
        keep_mask: NodeFlags,
    ) {
        let dead: Vec<usize> = self
            .live_slots()
            .filter(|(slot, n)| {
                !referenced.contains(slot)
                    && (n.flags & keep_mask).is_empty()
                    && n.has_no_interesting_content()
            })
            .map(|(slot, _)| slot)
            .collect();
        for slot in dead {
            self.remove_slot(slot);
        }
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeStore {
    /// A custom debug formatter that collapses forwarded slots into their
    /// representatives, giving a cleaner view on the store.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            match slot {
                Slot::Dead => {}
                Slot::Live(_) => groups.entry(idx).or_default().push(idx),
                Slot::Forwarded(_) => {
                    let rep = self
                        .resolve(NodeHandle {
                            node: NodeId {
                                store_id: self.store_id,
                                idx,
                            },
                            offset: 0,
                        })
                        .node
                        .idx;
                    groups.entry(rep).or_default().push(idx);
                }
            }
        }
        let mut p = f.debug_map();
        for (rep, idxs) in groups {
            p.entry(&format_args!("{:?}", idxs), self.live(rep));
        }
        p.finish()
    }
}
