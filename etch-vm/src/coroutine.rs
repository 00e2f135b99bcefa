//! Cooperative coroutines (`spec.md` §4.I).

use etch_asm::FuncIdx;

use crate::frame::Frame;
use crate::value::{CoroutineId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    Suspended,
    Running,
    Completed,
    Dead,
}

#[derive(Debug)]
pub struct Coroutine {
    pub state: CoroutineState,
    pub frame: Frame,
    pub func_idx: FuncIdx,
    pub last_yielded: Value,
    pub final_return: Value,
    pub parent: Option<CoroutineId>,
    pub strong_refs: u32,
}

/// Owns every live coroutine, addressed by dense id (mirrors
/// `crate::heap::Heap`'s id/free-list discipline, but coroutines have no
/// weak references or cycles to collect — only their own refcount).
#[derive(Debug, Default)]
pub struct CoroutineTable {
    slots: Vec<Option<Coroutine>>,
    free_list: Vec<CoroutineId>,
}

impl CoroutineTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(id: CoroutineId) -> usize {
        (id - 1) as usize
    }

    pub fn spawn(&mut self, func_idx: FuncIdx, frame: Frame, parent: Option<CoroutineId>) -> CoroutineId {
        let co = Coroutine {
            state: CoroutineState::Suspended,
            frame,
            func_idx,
            last_yielded: Value::Nil,
            final_return: Value::Nil,
            parent,
            strong_refs: 1,
        };
        if let Some(id) = self.free_list.pop() {
            self.slots[Self::index_of(id)] = Some(co);
            id
        } else {
            self.slots.push(Some(co));
            self.slots.len() as CoroutineId
        }
    }

    pub fn get(&self, id: CoroutineId) -> Option<&Coroutine> {
        self.slots.get(Self::index_of(id))?.as_ref()
    }

    pub fn get_mut(&mut self, id: CoroutineId) -> Option<&mut Coroutine> {
        self.slots.get_mut(Self::index_of(id))?.as_mut()
    }

    /// Every live coroutine, for the cycle collector's root scan (a
    /// suspended coroutine's registers are live roots too).
    pub fn iter(&self) -> impl Iterator<Item = &Coroutine> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn inc_ref(&mut self, id: CoroutineId) {
        if let Some(co) = self.get_mut(id) {
            co.strong_refs += 1;
        }
    }

    /// Drops the strong count; returns the now-abandoned coroutine (still
    /// carrying its saved frame and defer stack) when it reaches zero, so
    /// the caller can run its defers (`spec.md` §4.I "Coroutine
    /// abandonment").
    pub fn dec_ref(&mut self, id: CoroutineId) -> Option<Coroutine> {
        let idx = Self::index_of(id);
        let should_remove = match self.slots.get_mut(idx) {
            Some(Some(co)) => {
                co.strong_refs = co.strong_refs.saturating_sub(1);
                co.strong_refs == 0
            }
            _ => {
                tracing::warn!(id, "dec_ref on unknown coroutine id");
                false
            }
        };
        if should_remove {
            let co = self.slots[idx].take();
            self.free_list.push(id);
            co
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_starts_suspended() {
        let mut table = CoroutineTable::new();
        let id = table.spawn(0, Frame::default(), None);
        assert_eq!(table.get(id).unwrap().state, CoroutineState::Suspended);
    }

    #[test]
    fn dec_ref_to_zero_returns_coroutine_for_abandonment() {
        let mut table = CoroutineTable::new();
        let id = table.spawn(0, Frame::default(), None);
        let co = table.dec_ref(id);
        assert!(co.is_some());
        assert!(table.get(id).is_none());
    }
}
