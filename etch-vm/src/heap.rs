//! The managed heap: allocation, reference counting, and cycle detection
//! (`spec.md` §3.2, §4.B).
//!
//! Heap ids are dense, recycled through a free list, and 1-based; id `0`
//! means "no object" everywhere in this crate. Edge sets described by
//! `spec.md` §3.2 are not stored eagerly — they're recomputed from a slot's
//! payload on demand by [`Heap::edges_of`], which is the "recomputed lazily
//! on cycle scan" the spec calls for.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use etch_asm::FuncIdx;

use crate::value::{EtchString, HeapId, Value, ValueTag};

#[derive(Debug, Clone)]
enum Payload {
    Table {
        fields: HashMap<EtchString, Value>,
        destructor: Option<FuncIdx>,
    },
    Array(Vec<Value>),
    Closure {
        func_idx: FuncIdx,
        captures: Vec<Value>,
    },
    Scalar(Value),
    /// A heap-allocated reference cell (`Ref` kind of `NewRef`, not to be
    /// confused with `Value::Ref`, which just names a heap id).
    Cell(Value),
    /// `target` is `None` once nullified, matching the spec's "-1 once
    /// freed" using an `Option` instead of a sentinel integer. `kind` is the
    /// tag `Value` the strong side was wrapped in, so `weak_to_strong`'s
    /// caller can rebuild the right variant without a separate lookup.
    Weak { target: Option<HeapId>, kind: ValueTag },
    /// Tombstone left behind after `finish_free` until the slot is reused.
    Freed,
}

#[derive(Debug, Clone)]
struct Slot {
    strong: u32,
    weak: u32,
    dirty: bool,
    being_destroyed: bool,
    payload: Payload,
}

/// What the caller (the call-protocol layer, `etch-vm::call`) must do after
/// a `dec_ref` drops an object's strong count to zero: invoke `destructor`,
/// if any, with the object still intact, then call [`Heap::finish_free`].
/// Re-running `dec_ref` on an id already mid-free is a logged no-op — see
/// [`Heap::dec_ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFree {
    pub id: HeapId,
    pub destructor: Option<FuncIdx>,
}

/// Outcome of a completed (possibly time-sliced) cycle scan.
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub candidates_scanned: usize,
    pub components_found: usize,
    pub objects_freed: usize,
}

/// A per-frame microsecond allowance for incremental cycle detection
/// (`spec.md` §4.B "frame-budgeted mode").
#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    budget: Duration,
    started: Instant,
}

impl FrameBudget {
    pub fn new(budget_us: u64) -> Self {
        FrameBudget { budget: Duration::from_micros(budget_us), started: Instant::now() }
    }

    /// `spec.md` §4.B: "Callers check `has_budget_remaining(minimum)` and
    /// refuse to begin or continue work below the threshold."
    pub fn has_remaining(&self, minimum_us: u64) -> bool {
        let elapsed = self.started.elapsed();
        elapsed + Duration::from_micros(minimum_us) <= self.budget
    }

    pub fn used_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn budget_us(&self) -> u64 {
        self.budget.as_micros() as u64
    }
}

struct TarjanFrame {
    node: HeapId,
    child_idx: usize,
}

/// Serializable state for a time-sliced Tarjan strongly-connected-components
/// scan (`spec.md` §4.B, §9: "the Tarjan state must be serializable across
/// slices"). Held by the caller across `run_slice` calls; `in_progress` is
/// true until the scan completes.
pub struct CycleScan {
    edges: HashMap<HeapId, Vec<HeapId>>,
    order: Vec<HeapId>,
    next_root_idx: usize,
    index_counter: u32,
    indices: HashMap<HeapId, u32>,
    lowlink: HashMap<HeapId, u32>,
    on_stack: BTreeSet<HeapId>,
    tarjan_stack: Vec<HeapId>,
    work: Vec<TarjanFrame>,
    sccs: Vec<Vec<HeapId>>,
    pub in_progress: bool,
}

/// Steps processed per slice budget check; keeps `has_remaining` polling
/// cheap relative to the real work done between checks.
const STEPS_PER_BUDGET_CHECK: usize = 64;

pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<HeapId>,
    /// Ids whose outgoing edges may have changed since the last scan.
    dirty: BTreeSet<HeapId>,
    /// Ids currently holding a `Weak` payload, scanned on nullification
    /// instead of the whole heap (`spec.md` §4.B).
    weak_ids: BTreeSet<HeapId>,
    op_counter: u64,
    threshold: u64,
    min_threshold: u64,
    max_threshold: u64,
    alloc_rate_ema: f64,
}

impl Default for Heap {
    fn default() -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            dirty: BTreeSet::new(),
            weak_ids: BTreeSet::new(),
            op_counter: 0,
            threshold: 1000,
            min_threshold: 100,
            max_threshold: 10_000,
            alloc_rate_ema: 0.0,
        }
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(id: HeapId) -> usize {
        (id - 1) as usize
    }

    fn alloc_slot(&mut self, payload: Payload, dirty: bool) -> HeapId {
        self.record_alloc();
        let slot = Slot { strong: 1, weak: 0, dirty, being_destroyed: false, payload };
        let id = if let Some(id) = self.free_list.pop() {
            self.slots[Self::index_of(id)] = slot;
            id
        } else {
            self.slots.push(slot);
            self.slots.len() as HeapId
        };
        if dirty {
            self.dirty.insert(id);
        }
        id
    }

    pub fn alloc_table(&mut self, destructor: Option<FuncIdx>) -> HeapId {
        self.alloc_slot(Payload::Table { fields: HashMap::new(), destructor }, true)
    }

    pub fn alloc_array(&mut self, size: usize) -> HeapId {
        self.alloc_slot(Payload::Array(vec![Value::Nil; size]), true)
    }

    pub fn alloc_scalar(&mut self, v: Value) -> HeapId {
        self.alloc_slot(Payload::Scalar(v), false)
    }

    pub fn alloc_closure(&mut self, func_idx: FuncIdx, captures: Vec<Value>) -> HeapId {
        self.alloc_slot(Payload::Closure { func_idx, captures }, true)
    }

    pub fn alloc_ref_cell(&mut self, v: Value) -> HeapId {
        self.alloc_slot(Payload::Cell(v), true)
    }

    /// `spec.md` §4.B `alloc_weak`. Registers `id` in the weak-id set used
    /// by nullification. `weak_to_strong`'s observed re-dirtying of the
    /// target is how a promoted weak reference re-enters cycle-scan
    /// consideration without a separate "promoted" set.
    pub fn alloc_weak(&mut self, target: &Value) -> HeapId {
        let target_id = target.heap_id().unwrap_or(0);
        let id = self.alloc_slot(Payload::Weak { target: Some(target_id), kind: target.tag() }, false);
        self.weak_ids.insert(id);
        if let Some(slot) = self.slots.get_mut(Self::index_of(target_id)) {
            slot.weak += 1;
        }
        id
    }

    /// Non-mutating check for `spec.md` §8 invariant 3 ("a weak reference
    /// either targets a live object or has been nullified"): true once the
    /// target has been freed, without promoting or touching any refcount.
    /// Unlike [`Heap::weak_to_strong`], this never mutates, so it's safe to
    /// call from comparison opcodes (`Eq` et al.) on every dispatch.
    pub fn weak_is_nullified(&self, weak_id: HeapId) -> bool {
        matches!(
            self.slots.get(Self::index_of(weak_id)),
            Some(Slot { payload: Payload::Weak { target: None, .. }, .. })
        )
    }

    /// The tag the strong side was wrapped in when this weak ref was made,
    /// regardless of whether the target has since been freed.
    pub fn weak_kind(&self, weak_id: HeapId) -> Option<ValueTag> {
        match self.slots.get(Self::index_of(weak_id)) {
            Some(Slot { payload: Payload::Weak { kind, .. }, .. }) => Some(*kind),
            _ => None,
        }
    }

    /// Reconstructs the `Value` a promoted weak reference should become,
    /// given the tag recorded at `alloc_weak` time.
    pub fn value_for(kind: ValueTag, id: HeapId) -> Value {
        match kind {
            ValueTag::Table => Value::Table(id),
            ValueTag::Array => Value::Array(id),
            ValueTag::Closure => Value::Closure(id),
            _ => Value::Ref(id),
        }
    }

    /// `In`/`NotIn` membership test against a table's fields by string key.
    pub fn table_has_key(&self, id: HeapId, key: &str) -> bool {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Table { fields, .. }, .. }) => fields.contains_key(key),
            _ => false,
        }
    }

    /// `In`/`NotIn` membership test against an array's elements by [`crate::arith::eq`].
    pub fn array_contains(&self, id: HeapId, needle: &Value) -> bool {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Array(items), .. }) => {
                crate::arith::array_contains(items, needle)
            }
            _ => false,
        }
    }

    /// A snapshot copy of an array's elements, for `ConcatArray`/`Slice`.
    pub fn array_items(&self, id: HeapId) -> Vec<Value> {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Array(items), .. }) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn inc_ref(&mut self, id: HeapId) {
        if id == 0 {
            return;
        }
        if let Some(slot) = self.slots.get_mut(Self::index_of(id)) {
            slot.strong += 1;
        } else {
            tracing::warn!(id, "inc_ref on unknown heap id");
        }
    }

    /// Drops `id`'s strong count by one. Returns [`PendingFree`] when it
    /// reaches zero; the caller must run the destructor (if any) and then
    /// call [`Heap::finish_free`]. A no-op, logged, for an unknown id or an
    /// id already mid-free (`spec.md` §4.B failure model).
    pub fn dec_ref(&mut self, id: HeapId) -> Option<PendingFree> {
        if id == 0 {
            return None;
        }
        let idx = Self::index_of(id);
        let Some(slot) = self.slots.get_mut(idx) else {
            tracing::warn!(id, "dec_ref on unknown heap id");
            return None;
        };
        if matches!(slot.payload, Payload::Freed) {
            tracing::warn!(id, "dec_ref on already-freed heap id");
            return None;
        }
        if slot.strong == 0 {
            tracing::warn!(id, "dec_ref underflow on heap id");
            return None;
        }
        slot.strong -= 1;
        if slot.strong > 0 {
            return None;
        }
        if slot.being_destroyed {
            // Re-entrant free attempt on an object already being torn down.
            return None;
        }
        slot.being_destroyed = true;
        let destructor = match &slot.payload {
            Payload::Table { destructor, .. } => *destructor,
            _ => None,
        };
        Some(PendingFree { id, destructor })
    }

    /// `set_scalar`: retain the new value's heap edge (if any), swap it in,
    /// release the old one. Fatal-assertion-free: `id` naming a non-scalar
    /// slot is a logged no-op, matching the heap's general failure model.
    pub fn set_scalar(&mut self, id: HeapId, v: Value) -> Option<PendingFree> {
        let idx = Self::index_of(id);
        let Some(slot) = self.slots.get_mut(idx) else {
            tracing::warn!(id, "set_scalar on unknown heap id");
            return None;
        };
        let Payload::Scalar(old) = std::mem::replace(&mut slot.payload, Payload::Scalar(Value::Nil)) else {
            tracing::warn!(id, "set_scalar on non-scalar heap id");
            return None;
        };
        if let Some(new_child) = v.heap_id() {
            self.inc_ref(new_child);
        }
        slot.payload = Payload::Scalar(v);
        self.dirty.insert(id);
        self.slots[idx].dirty = true;
        if let Some(old_child) = old.heap_id() {
            self.dec_ref(old_child)
        } else {
            None
        }
    }

    /// Returns `0` if the target was freed (matches `spec.md` §4.B: "returns
    /// 0 if target was freed"). A successful promotion marks the target
    /// dirty so the next cycle scan re-considers it.
    pub fn weak_to_strong(&mut self, weak_id: HeapId) -> HeapId {
        let target = match self.slots.get(Self::index_of(weak_id)) {
            Some(Slot { payload: Payload::Weak { target }, .. }) => *target,
            _ => {
                tracing::warn!(weak_id, "weak_to_strong on non-weak heap id");
                return 0;
            }
        };
        match target {
            Some(id) => {
                self.inc_ref(id);
                self.dirty.insert(id);
                if let Some(slot) = self.slots.get_mut(Self::index_of(id)) {
                    slot.dirty = true;
                }
                id
            }
            None => 0,
        }
    }

    /// Marks `parent_id` dirty: an edge may have changed since the last scan.
    pub fn track_edge(&mut self, parent_id: HeapId, _child: &Value) {
        if let Some(slot) = self.slots.get_mut(Self::index_of(parent_id)) {
            slot.dirty = true;
            self.dirty.insert(parent_id);
        }
    }

    pub fn get_table_field(&self, id: HeapId, key: &str) -> Value {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Table { fields, .. }, .. }) => {
                fields.get(key).cloned().unwrap_or(Value::Nil)
            }
            _ => Value::Nil,
        }
    }

    pub fn set_table_field(&mut self, id: HeapId, key: EtchString, v: Value) -> Option<PendingFree> {
        let idx = Self::index_of(id);
        let old = match self.slots.get_mut(idx) {
            Some(Slot { payload: Payload::Table { fields, .. }, dirty, .. }) => {
                *dirty = true;
                fields.insert(key, v.clone())
            }
            _ => {
                tracing::warn!(id, "set_table_field on non-table heap id");
                return None;
            }
        };
        self.dirty.insert(id);
        if let Some(child) = v.heap_id() {
            self.inc_ref(child);
        }
        old.and_then(|old_v| old_v.heap_id()).and_then(|old_id| self.dec_ref(old_id))
    }

    pub fn get_array_index(&self, id: HeapId, idx: usize) -> Option<Value> {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Array(items), .. }) => items.get(idx).cloned(),
            _ => None,
        }
    }

    pub fn set_array_index(&mut self, id: HeapId, idx: usize, v: Value) -> Option<PendingFree> {
        let slot_idx = Self::index_of(id);
        let old = match self.slots.get_mut(slot_idx) {
            Some(Slot { payload: Payload::Array(items), dirty, .. }) if idx < items.len() => {
                *dirty = true;
                std::mem::replace(&mut items[idx], v.clone())
            }
            _ => {
                tracing::warn!(id, idx, "set_array_index out of bounds or wrong kind");
                return None;
            }
        };
        self.dirty.insert(id);
        if let Some(child) = v.heap_id() {
            self.inc_ref(child);
        }
        old.heap_id().and_then(|old_id| self.dec_ref(old_id))
    }

    pub fn array_len(&self, id: HeapId) -> usize {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Array(items), .. }) => items.len(),
            _ => 0,
        }
    }

    pub fn closure_captures(&self, id: HeapId) -> &[Value] {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Closure { captures, .. }, .. }) => captures,
            _ => &[],
        }
    }

    pub fn get_ref_cell(&self, id: HeapId) -> Value {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Cell(v), .. }) => v.clone(),
            _ => Value::Nil,
        }
    }

    pub fn set_ref_cell(&mut self, id: HeapId, v: Value) -> Option<PendingFree> {
        let idx = Self::index_of(id);
        let old = match self.slots.get_mut(idx) {
            Some(Slot { payload: Payload::Cell(cell), dirty, .. }) => {
                *dirty = true;
                std::mem::replace(cell, v.clone())
            }
            _ => {
                tracing::warn!(id, "set_ref_cell on non-ref heap id");
                return None;
            }
        };
        self.dirty.insert(id);
        if let Some(child) = v.heap_id() {
            self.inc_ref(child);
        }
        old.heap_id().and_then(|old_id| self.dec_ref(old_id))
    }

    pub fn closure_func_idx(&self, id: HeapId) -> Option<FuncIdx> {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Closure { func_idx, .. }, .. }) => Some(*func_idx),
            _ => None,
        }
    }

    /// Releases a freed object's children, nullifies weak references aimed
    /// at it, and recycles its slot. Returns further [`PendingFree`]s for
    /// any child whose own count just hit zero (`spec.md` §4.B: "release
    /// every child value, which may transitively free"); the caller drains
    /// this worklist the same way, running each child's destructor (if any)
    /// before recursing into its own `finish_free`.
    pub fn finish_free(&mut self, id: HeapId) -> Vec<PendingFree> {
        let idx = Self::index_of(id);
        let payload = std::mem::replace(&mut self.slots[idx].payload, Payload::Freed);
        let children: Vec<HeapId> = match &payload {
            Payload::Table { fields, .. } => fields.values().filter_map(Value::heap_id).collect(),
            Payload::Array(items) => items.iter().filter_map(Value::heap_id).collect(),
            Payload::Closure { captures, .. } => captures.iter().filter_map(Value::heap_id).collect(),
            Payload::Scalar(v) | Payload::Cell(v) => v.heap_id().into_iter().collect(),
            Payload::Weak { .. } | Payload::Freed => Vec::new(),
        };

        self.nullify_weak_refs_to(id);

        self.dirty.remove(&id);
        self.weak_ids.remove(&id);
        self.slots[idx].being_destroyed = false;
        self.slots[idx].dirty = false;
        self.free_list.push(id);

        children.into_iter().filter_map(|child| self.dec_ref(child)).collect()
    }

    /// Scans only the weak-id set (`spec.md` §4.B), not the whole heap.
    fn nullify_weak_refs_to(&mut self, freed_id: HeapId) {
        for &weak_id in &self.weak_ids {
            if let Some(slot) = self.slots.get_mut(Self::index_of(weak_id)) {
                if let Payload::Weak { target } = &mut slot.payload {
                    if *target == Some(freed_id) {
                        *target = None;
                    }
                }
            }
        }
    }

    /// Outgoing heap-id edges of `id`, recomputed from its payload.
    fn edges_of(&self, id: HeapId) -> Vec<HeapId> {
        match self.slots.get(Self::index_of(id)) {
            Some(Slot { payload: Payload::Table { fields, .. }, .. }) => {
                fields.values().filter_map(Value::heap_id).collect()
            }
            Some(Slot { payload: Payload::Array(items), .. }) => {
                items.iter().filter_map(Value::heap_id).collect()
            }
            Some(Slot { payload: Payload::Closure { captures, .. }, .. }) => {
                captures.iter().filter_map(Value::heap_id).collect()
            }
            Some(Slot { payload: Payload::Cell(v), .. }) => v.heap_id().into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn is_live(&self, id: HeapId) -> bool {
        matches!(self.slots.get(Self::index_of(id)), Some(s) if !matches!(s.payload, Payload::Freed))
    }

    /// `record_op`/`on_scan_result` implement the adaptive-scheduling
    /// policy of `spec.md` §4.B: grow the threshold on a clean scan, shrink
    /// it (bounded below) when a scan actually finds cycles.
    pub fn record_op(&mut self) -> bool {
        self.op_counter += 1;
        self.op_counter >= self.threshold
    }

    pub fn on_scan_result(&mut self, found_cycles: bool) {
        self.op_counter = 0;
        if found_cycles {
            self.threshold = (self.threshold / 2).max(self.min_threshold);
        } else {
            self.threshold = (self.threshold * 2).min(self.max_threshold);
        }
    }

    fn record_alloc(&mut self) {
        const EMA_ALPHA: f64 = 0.1;
        self.alloc_rate_ema = EMA_ALPHA + (1.0 - EMA_ALPHA) * self.alloc_rate_ema;
        // High allocation pressure pulls the threshold down, independent of
        // the scan-result-driven adjustment above.
        if self.alloc_rate_ema > 0.8 {
            self.threshold = (self.threshold * 9 / 10).max(self.min_threshold);
        }
    }

    /// Builds the dirty-restricted (or, if `force_full`, whole-heap)
    /// candidate set and its edge snapshot, ready for [`Heap::run_slice`].
    pub fn begin_cycle_scan(&self, force_full: bool) -> CycleScan {
        let seeds: Vec<HeapId> = if force_full {
            (1..=self.slots.len() as HeapId).filter(|&id| self.is_live(id)).collect()
        } else {
            self.dirty.iter().copied().collect()
        };

        let mut candidates: BTreeSet<HeapId> = BTreeSet::new();
        let mut stack = seeds;
        while let Some(id) = stack.pop() {
            if !candidates.insert(id) {
                continue;
            }
            for child in self.edges_of(id) {
                if self.is_live(child) && !candidates.contains(&child) {
                    stack.push(child);
                }
            }
        }

        let mut edges = HashMap::new();
        for &id in &candidates {
            edges.insert(id, self.edges_of(id));
        }
        let order: Vec<HeapId> = candidates.into_iter().collect();

        CycleScan {
            edges,
            order,
            next_root_idx: 0,
            index_counter: 0,
            indices: HashMap::new(),
            lowlink: HashMap::new(),
            on_stack: BTreeSet::new(),
            tarjan_stack: Vec::new(),
            work: Vec::new(),
            sccs: Vec::new(),
            in_progress: true,
        }
    }

    /// Runs the iterative Tarjan algorithm until either the scan completes
    /// or the budget runs out, whichever comes first. Returns the completed
    /// SCC list once `scan.in_progress` goes false.
    pub fn run_slice(&self, scan: &mut CycleScan, budget: Option<&FrameBudget>) {
        let mut steps = 0usize;
        loop {
            if scan.work.is_empty() {
                while scan.next_root_idx < scan.order.len() {
                    let root = scan.order[scan.next_root_idx];
                    scan.next_root_idx += 1;
                    if !scan.indices.contains_key(&root) {
                        scan.work.push(TarjanFrame { node: root, child_idx: 0 });
                        break;
                    }
                }
                if scan.work.is_empty() {
                    scan.in_progress = false;
                    return;
                }
            }

            let frame = scan.work.last_mut().expect("just ensured non-empty");
            if frame.child_idx == 0 {
                let idx = scan.index_counter;
                scan.index_counter += 1;
                scan.indices.insert(frame.node, idx);
                scan.lowlink.insert(frame.node, idx);
                scan.tarjan_stack.push(frame.node);
                scan.on_stack.insert(frame.node);
            }

            let children = scan.edges.get(&frame.node).cloned().unwrap_or_default();
            if frame.child_idx < children.len() {
                let child = children[frame.child_idx];
                frame.child_idx += 1;
                if !scan.edges.contains_key(&child) {
                    // Edge leaves the candidate set; can't participate in a
                    // cycle back into it, so it's simply not traversed.
                } else if !scan.indices.contains_key(&child) {
                    scan.work.push(TarjanFrame { node: child, child_idx: 0 });
                } else if scan.on_stack.contains(&child) {
                    let child_idx = scan.indices[&child];
                    let cur = scan.lowlink[&frame.node];
                    scan.lowlink.insert(frame.node, cur.min(child_idx));
                }
            } else {
                let node = frame.node;
                let popped = scan.work.pop().expect("frame exists");
                if let Some(parent) = scan.work.last() {
                    let child_low = scan.lowlink[&node];
                    let parent_low = scan.lowlink[&parent.node];
                    scan.lowlink.insert(parent.node, parent_low.min(child_low));
                }
                if scan.lowlink[&node] == scan.indices[&node] {
                    let mut component = Vec::new();
                    loop {
                        let w = scan.tarjan_stack.pop().expect("stack non-empty for own SCC");
                        scan.on_stack.remove(&w);
                        component.push(w);
                        if w == popped.node {
                            break;
                        }
                    }
                    scan.sccs.push(component);
                }
            }

            steps += 1;
            if steps % STEPS_PER_BUDGET_CHECK == 0 {
                if let Some(b) = budget {
                    if !b.has_remaining(0) {
                        return;
                    }
                }
            }
        }
    }

    /// Mark-and-sweep over the scan's candidate components: marks objects
    /// reachable from `roots`, then frees any cycle component (size > 1, or
    /// size 1 with a self-edge) whose members are entirely unmarked
    /// (`spec.md` §4.B, §8 invariant 6).
    pub fn sweep_cycles(&mut self, scan: CycleScan, roots: &[HeapId]) -> CycleStats {
        let mut stats = CycleStats { candidates_scanned: scan.order.len(), ..Default::default() };

        let mut marked: BTreeSet<HeapId> = BTreeSet::new();
        let mut stack: Vec<HeapId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            for child in self.edges_of(id) {
                if !marked.contains(&child) {
                    stack.push(child);
                }
            }
        }

        for component in &scan.sccs {
            let is_cycle = component.len() > 1
                || component.first().is_some_and(|&n| scan.edges.get(&n).is_some_and(|e| e.contains(&n)));
            if !is_cycle {
                continue;
            }
            if component.iter().any(|id| marked.contains(id)) {
                continue;
            }
            stats.components_found += 1;
            for &id in component {
                // Force to 1 rather than 0: `dec_ref` treats an
                // already-zero count as underflow and bails without
                // returning `PendingFree`, so the cycle's internal edges
                // need one decrement left to trigger the real free path.
                if let Some(slot) = self.slots.get_mut(Self::index_of(id)) {
                    slot.strong = 1;
                }
            }
            let mut worklist: Vec<PendingFree> =
                component.iter().filter_map(|&id| self.dec_ref(id)).collect();
            while let Some(pf) = worklist.pop() {
                // Destructors on cycle members run with no guaranteed
                // ordering relative to each other, only before their own
                // children are released; a full call-protocol integration
                // point is `etch_vm::call::run_destructor`.
                stats.objects_freed += 1;
                worklist.extend(self.finish_free(pf.id));
            }
        }

        stats
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn live_count(&self) -> usize {
        (1..=self.slots.len() as HeapId).filter(|&id| self.is_live(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_inc_dec_frees_at_zero() {
        let mut h = Heap::new();
        let id = h.alloc_scalar(Value::Int(1));
        assert!(h.is_live(id));
        let pending = h.dec_ref(id).expect("strong count hit zero");
        assert_eq!(pending.destructor, None);
        h.finish_free(pending.id);
        assert!(!h.is_live(id));
    }

    #[test]
    fn unknown_dec_ref_is_noop() {
        let mut h = Heap::new();
        assert!(h.dec_ref(999).is_none());
    }

    #[test]
    fn weak_to_strong_returns_zero_after_free() {
        let mut h = Heap::new();
        let obj = h.alloc_scalar(Value::Int(1));
        let w = h.alloc_weak(&Value::Ref(obj));
        let pending = h.dec_ref(obj).unwrap();
        h.finish_free(pending.id);
        assert_eq!(h.weak_to_strong(w), 0);
    }

    #[test]
    fn self_cycle_table_is_collected() {
        let mut h = Heap::new();
        let t = h.alloc_table(None);
        h.inc_ref(t);
        h.set_table_field(t, "next".into(), Value::Table(t));
        // Drop the test's own strong ref; only the self-edge keeps it alive.
        let pending = h.dec_ref(t);
        assert!(pending.is_none(), "self-referencing table shouldn't free via plain dec_ref");

        let mut scan = h.begin_cycle_scan(false);
        h.run_slice(&mut scan, None);
        assert!(!scan.in_progress);
        let stats = h.sweep_cycles(scan, &[]);
        assert_eq!(stats.components_found, 1);
        assert!(!h.is_live(t));
    }

    #[test]
    fn cycle_reachable_from_root_survives() {
        let mut h = Heap::new();
        let a = h.alloc_table(None);
        let b = h.alloc_table(None);
        h.inc_ref(b);
        h.set_table_field(a, "b".into(), Value::Table(b));
        h.inc_ref(a);
        h.set_table_field(b, "a".into(), Value::Table(a));
        h.dec_ref(a);
        h.dec_ref(b);

        let scan = h.begin_cycle_scan(true);
        let mut scan = scan;
        h.run_slice(&mut scan, None);
        let stats = h.sweep_cycles(scan, &[a]);
        assert_eq!(stats.components_found, 0);
        assert!(h.is_live(a));
        assert!(h.is_live(b));
    }

    #[test]
    fn weak_is_nullified_reflects_target_freed_state() {
        let mut h = Heap::new();
        let obj = h.alloc_scalar(Value::Int(1));
        let w = h.alloc_weak(&Value::Ref(obj));
        assert!(!h.weak_is_nullified(w));
        let pending = h.dec_ref(obj).unwrap();
        h.finish_free(pending.id);
        assert!(h.weak_is_nullified(w));
    }

    #[test]
    fn frame_budget_reports_exhaustion() {
        let budget = FrameBudget::new(0);
        std::thread::sleep(Duration::from_micros(1));
        assert!(!budget.has_remaining(1));
    }
}
