//! The mark phase.
//!
//! Marking recurses through the object graph up to a fixed depth and a
//! native-stack watermark; anything deeper is deferred to a bounded mark
//! stack. When even the mark stack fills up, the overflow flag flips and the
//! drain loop falls back to linear full-heap rescans, which bounds native
//! stack usage at a constant regardless of reference-graph depth.

use crate::config::Config;
use crate::error::corrupt_heap;
use crate::heap::HeapRegistry;
use crate::mark_table::MarkTable;
use crate::object::{ArrayBody, ObjectBody, SlotBody, StrBody};
use crate::value::{SlotRef, Value};

// ============================================================================
// Mark stack
// ============================================================================

/// Bounded stack of references whose children still need marking.
///
/// Lives only for the duration of one mark phase; never persisted across
/// cycles.
#[derive(Debug)]
pub(crate) struct MarkStack {
    entries: Vec<Value>,
    capacity: usize,
    overflow: bool,
}

impl MarkStack {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            overflow: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.overflow = false;
    }

    /// Push a pending reference. Once the stack has overflowed, further
    /// pushes are dropped; the fallback rescan will find the children.
    fn push(&mut self, value: Value) {
        if self.overflow {
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(value);
        } else {
            self.overflow = true;
        }
    }

    fn take_batch(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) const fn overflowed(&self) -> bool {
        self.overflow
    }
}

// ============================================================================
// Marker
// ============================================================================

/// Approximate current native stack position.
#[inline(never)]
fn stack_position() -> usize {
    let probe = 0u8;
    std::ptr::addr_of!(probe) as usize
}

/// Borrowed view of the collector state the mark phase needs.
pub(crate) struct Marker<'a> {
    pub heap: &'a HeapRegistry,
    pub table: &'a mut dyn MarkTable,
    pub stack: &'a mut MarkStack,
    pub config: &'a Config,
    /// Native stack position at cycle entry; the watermark is measured
    /// against it.
    pub stack_base: usize,
}

impl Marker<'_> {
    fn native_stack_exceeded(&self) -> bool {
        self.stack_base.abs_diff(stack_position()) > self.config.native_stack_budget
    }

    /// Mark `value` and, depth permitting, its children.
    pub(crate) fn mark(&mut self, value: Value, depth: u32) {
        let Some(slot) = value.as_slot() else {
            return;
        };
        // SAFETY: marked values either come from typed object payloads or
        // passed `is_heap_address`, so the slot is in an owned arena.
        let s = unsafe { slot.as_ref() };
        if s.is_free() {
            return;
        }
        if self.table.contains(self.heap, slot) {
            return;
        }
        self.table.add(self.heap, slot);

        if depth > self.config.mark_recursion_limit
            || (depth == 0 && self.native_stack_exceeded())
        {
            self.stack.push(value);
            return;
        }
        self.mark_children(value, depth + 1);
    }

    /// Mark `addr` if it is a heap address; used for conservative words.
    pub(crate) fn mark_maybe(&mut self, addr: usize) {
        if self.heap.is_heap_address(addr) {
            // SAFETY: is_heap_address proved this is an aligned slot address
            // inside an owned arena, hence non-null.
            let slot = unsafe { SlotRef::new_unchecked(addr as *mut crate::object::Slot) };
            self.mark(Value::Object(slot), 0);
        }
    }

    /// Mark the children of `value`, which is already in the table.
    ///
    /// Kind-directed dispatch. The last owned reference of each kind is not
    /// recursed into but looped over in place, so long chains through
    /// tail positions (superclass links, shared-buffer origins, node
    /// continuations) cost no native stack.
    pub(crate) fn mark_children(&mut self, value: Value, depth: u32) {
        let mut current = value;
        let mut first = true;
        loop {
            let Some(slot) = current.as_slot() else {
                return;
            };
            // SAFETY: as in `mark`.
            let s = unsafe { slot.as_ref() };
            if !first {
                // Tail reference: run the same gate `mark` would have.
                if s.is_free() {
                    return;
                }
                if self.table.contains(self.heap, slot) {
                    return;
                }
                self.table.add(self.heap, slot);
            }
            first = false;

            let (class, body) = match s.body() {
                SlotBody::Live { class, body } => (*class, body),
                // Freshly allocated, nothing to traverse yet.
                SlotBody::Reserved => return,
                SlotBody::Free { .. } => {
                    corrupt_heap!("marking children of a free slot {:p}", slot.as_ptr())
                }
            };

            // Nodes carry no class link worth tracing; their filename goes
            // through the table's filename channel.
            if let ObjectBody::Node(node) = body {
                self.table.add_filename(node.file);
                let shape = node.kind.shape();
                let mut tail = None;
                for (index, is_child) in shape.iter().enumerate() {
                    if *is_child {
                        if let Some(prev) = tail.replace(node.refs[index]) {
                            self.mark(prev, depth);
                        }
                    }
                }
                match tail {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return,
                }
            }

            self.mark(class, depth);
            match body {
                ObjectBody::Object { ivars } => {
                    for v in ivars.values() {
                        self.mark(*v, depth);
                    }
                    return;
                }
                ObjectBody::Class(class_body) => {
                    for v in class_body.methods.values() {
                        self.mark(*v, depth);
                    }
                    for v in class_body.ivars.values() {
                        self.mark(*v, depth);
                    }
                    current = class_body.superclass;
                }
                ObjectBody::Array(ArrayBody::Owned(elems)) => {
                    for v in elems {
                        self.mark(*v, depth);
                    }
                    return;
                }
                ObjectBody::Array(ArrayBody::Shared { origin })
                | ObjectBody::Str(StrBody::Shared { origin }) => {
                    current = *origin;
                }
                ObjectBody::Hash(hash) => {
                    for (k, v) in &hash.entries {
                        self.mark(*k, depth);
                        self.mark(*v, depth);
                    }
                    current = hash.default;
                }
                ObjectBody::Struct { fields } => {
                    for v in fields.iter() {
                        self.mark(*v, depth);
                    }
                    return;
                }
                ObjectBody::Data(data) => {
                    if let Some(mark) = data.mark {
                        let payload: &dyn std::any::Any = data.payload.as_ref();
                        mark(payload, &mut |v| self.mark(v, 0));
                    }
                    return;
                }
                ObjectBody::Str(StrBody::Owned(_))
                | ObjectBody::Float(_)
                | ObjectBody::Bignum { .. }
                | ObjectBody::Regexp { .. }
                | ObjectBody::File(_) => return,
                ObjectBody::Node(_) => unreachable!("handled above"),
            }
        }
    }

    /// Drain pending work until the graph is fully marked.
    ///
    /// An overflowed stack is recovered by rescanning every arena for
    /// marked objects and re-running their child marking; the rescan may
    /// overflow again, so the loop runs until a pass completes clean.
    pub(crate) fn drain(&mut self) {
        while self.stack.overflowed() || !self.stack.is_empty() {
            if self.stack.overflowed() {
                self.mark_all();
            } else {
                self.mark_rest();
            }
        }
    }

    /// Fallback: linear scan of every arena, re-marking children of every
    /// marked, populated slot.
    fn mark_all(&mut self) {
        self.stack.reset();
        let heap = self.heap;
        for arena in heap.arenas() {
            for index in 0..arena.limit() {
                let slot = arena.slot_at(index);
                // SAFETY: index is within the arena's live range.
                let s = unsafe { slot.as_ref() };
                if s.is_live() && self.table.contains_in_arena(arena, slot) {
                    self.mark_children(Value::Object(slot), 0);
                }
            }
        }
    }

    /// Drain the current stack contents in LIFO order.
    fn mark_rest(&mut self) {
        let batch = self.stack.take_batch();
        for value in batch.into_iter().rev() {
            self.mark_children(value, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MarkStack;
    use crate::value::Value;

    #[test]
    fn stack_overflows_at_capacity_and_drops_excess() {
        let mut stack = MarkStack::new(2);
        stack.push(Value::Fixnum(1));
        stack.push(Value::Fixnum(2));
        assert!(!stack.overflowed());
        stack.push(Value::Fixnum(3));
        assert!(stack.overflowed());
        // Dropped, not queued.
        assert_eq!(stack.take_batch().len(), 2);
        stack.reset();
        assert!(!stack.overflowed());
        assert!(stack.is_empty());
    }
}
