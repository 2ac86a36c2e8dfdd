//! Mark-bit storage strategies.
//!
//! The mark table records which objects the active cycle has reached. Two
//! interchangeable strategies implement the same contract:
//!
//! - [`InlineMarkTable`] keeps the mark bit inside the object's own flags
//!   word. O(1) and cache-friendly, but every mark dirties the page holding
//!   the object, so pages shared copy-on-write with a forked process get
//!   duplicated during collection.
//! - [`BitfieldMarkTable`] keeps marks in each arena's separate bit array
//!   (off-arena addresses fall back to a [`PointerSet`]), leaving object
//!   memory untouched across the whole cycle. Slower per operation; this is
//!   the copy-on-write-friendly mode.
//!
//! Both strategies also carry the filename channel used to mark interned
//! source filenames, which live outside every arena.

use std::cell::Cell;

use crate::heap::{Arena, HeapRegistry};
use crate::object::SlotFlags;
use crate::pointer_set::PointerSet;
use crate::source_files::FileName;
use crate::value::SlotRef;

/// Mark-bit storage contract, one instance live per collector.
///
/// `prepare` runs once per cycle before marking; `finalize` once after
/// sweep. The `*_in_arena` variants skip the arena lookup when the caller
/// already iterates arena slots.
pub trait MarkTable {
    /// Reset per-cycle state (the bitfield strategy's last-hit arena cache).
    fn prepare(&mut self);
    /// Record `slot` as reached.
    fn add(&mut self, heap: &HeapRegistry, slot: SlotRef);
    /// Whether `slot` has been reached this cycle.
    fn contains(&self, heap: &HeapRegistry, slot: SlotRef) -> bool;
    /// Forget `slot`.
    fn remove(&mut self, heap: &HeapRegistry, slot: SlotRef);
    /// [`MarkTable::add`] when the owning arena is already known.
    fn add_in_arena(&mut self, arena: &Arena, slot: SlotRef);
    /// [`MarkTable::contains`] when the owning arena is already known.
    fn contains_in_arena(&self, arena: &Arena, slot: SlotRef) -> bool;
    /// [`MarkTable::remove`] when the owning arena is already known.
    fn remove_in_arena(&mut self, arena: &Arena, slot: SlotRef);
    /// Clear whatever marks sweep left behind.
    fn finalize(&mut self, heap: &HeapRegistry);
    /// Record an interned filename as reached.
    fn add_filename(&mut self, file: FileName);
    /// Whether an interned filename has been reached this cycle.
    fn contains_filename(&self, file: FileName) -> bool;
    /// Forget an interned filename.
    fn remove_filename(&mut self, file: FileName);
    /// Whether this strategy avoids writing into object memory.
    fn is_cow_friendly(&self) -> bool;
}

// ============================================================================
// Inline strategy
// ============================================================================

/// Mark bits stored in the objects themselves.
#[derive(Debug, Default)]
pub struct InlineMarkTable;

impl InlineMarkTable {
    /// Create the inline table. It carries no state of its own.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MarkTable for InlineMarkTable {
    fn prepare(&mut self) {}

    fn add(&mut self, _heap: &HeapRegistry, slot: SlotRef) {
        // SAFETY: mark-table callers only pass slots inside owned arenas.
        unsafe { slot.as_ref() }.set_flag(SlotFlags::MARK);
    }

    fn contains(&self, _heap: &HeapRegistry, slot: SlotRef) -> bool {
        // SAFETY: as in `add`.
        unsafe { slot.as_ref() }.test_flag(SlotFlags::MARK)
    }

    fn remove(&mut self, _heap: &HeapRegistry, slot: SlotRef) {
        // SAFETY: as in `add`.
        unsafe { slot.as_ref() }.unset_flag(SlotFlags::MARK);
    }

    fn add_in_arena(&mut self, _arena: &Arena, slot: SlotRef) {
        // SAFETY: as in `add`.
        unsafe { slot.as_ref() }.set_flag(SlotFlags::MARK);
    }

    fn contains_in_arena(&self, _arena: &Arena, slot: SlotRef) -> bool {
        // SAFETY: as in `add`.
        unsafe { slot.as_ref() }.test_flag(SlotFlags::MARK)
    }

    fn remove_in_arena(&mut self, _arena: &Arena, slot: SlotRef) {
        // SAFETY: as in `add`.
        unsafe { slot.as_ref() }.unset_flag(SlotFlags::MARK);
    }

    fn finalize(&mut self, _heap: &HeapRegistry) {
        // Bits are cleared lazily by sweep.
    }

    fn add_filename(&mut self, file: FileName) {
        file.set_marked(true);
    }

    fn contains_filename(&self, file: FileName) -> bool {
        file.is_marked()
    }

    fn remove_filename(&mut self, file: FileName) {
        file.set_marked(false);
    }

    fn is_cow_friendly(&self) -> bool {
        false
    }
}

// ============================================================================
// Bitfield strategy
// ============================================================================

/// Mark bits stored in per-arena bit arrays, off-arena addresses in a
/// pointer set.
#[derive(Debug, Default)]
pub struct BitfieldMarkTable {
    set: PointerSet,
    /// Last arena a lookup hit. Lookups cluster heavily, so checking it
    /// first usually skips the linear arena scan.
    last_arena: Cell<Option<usize>>,
}

impl BitfieldMarkTable {
    /// Create the bitfield table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find_arena<'h>(&self, heap: &'h HeapRegistry, slot: SlotRef) -> Option<&'h Arena> {
        let ptr = slot.as_ptr().cast_const();
        if let Some(index) = self.last_arena.get() {
            if let Some(arena) = heap.arenas().get(index) {
                if arena.contains(ptr) {
                    return Some(arena);
                }
            }
        }
        let index = heap.arena_index_of(slot)?;
        self.last_arena.set(Some(index));
        Some(&heap.arenas()[index])
    }
}

impl MarkTable for BitfieldMarkTable {
    fn prepare(&mut self) {
        self.last_arena.set(None);
    }

    fn add(&mut self, heap: &HeapRegistry, slot: SlotRef) {
        match self.find_arena(heap, slot) {
            Some(arena) => arena.set_mark_bit(arena.slot_index(slot)),
            None => self.set.insert(slot.as_ptr() as usize),
        }
    }

    fn contains(&self, heap: &HeapRegistry, slot: SlotRef) -> bool {
        match self.find_arena(heap, slot) {
            Some(arena) => arena.test_mark_bit(arena.slot_index(slot)),
            None => self.set.contains(slot.as_ptr() as usize),
        }
    }

    fn remove(&mut self, heap: &HeapRegistry, slot: SlotRef) {
        match self.find_arena(heap, slot) {
            Some(arena) => arena.clear_mark_bit(arena.slot_index(slot)),
            None => self.set.remove(slot.as_ptr() as usize),
        }
    }

    fn add_in_arena(&mut self, arena: &Arena, slot: SlotRef) {
        arena.set_mark_bit(arena.slot_index(slot));
    }

    fn contains_in_arena(&self, arena: &Arena, slot: SlotRef) -> bool {
        arena.test_mark_bit(arena.slot_index(slot))
    }

    fn remove_in_arena(&mut self, arena: &Arena, slot: SlotRef) {
        arena.clear_mark_bit(arena.slot_index(slot));
    }

    fn finalize(&mut self, heap: &HeapRegistry) {
        if !self.set.is_empty() {
            self.set.reset();
        }
        for arena in heap.arenas() {
            arena.clear_all_mark_bits();
        }
    }

    fn add_filename(&mut self, file: FileName) {
        self.set.insert(file.addr());
    }

    fn contains_filename(&self, file: FileName) -> bool {
        self.set.contains(file.addr())
    }

    fn remove_filename(&mut self, file: FileName) {
        self.set.remove(file.addr());
    }

    fn is_cow_friendly(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{BitfieldMarkTable, InlineMarkTable, MarkTable};
    use crate::config::Config;
    use crate::heap::HeapRegistry;
    use arena_alloc::BlockSource;

    fn heap_with_one_arena() -> HeapRegistry {
        let config = Config {
            min_arena_slots: 64,
            ..Config::default()
        };
        let mut heap = HeapRegistry::new(&config, BlockSource::Anonymous);
        heap.grow().unwrap();
        heap
    }

    #[test]
    fn inline_marks_live_in_object_flags() {
        let heap = heap_with_one_arena();
        let slot = heap.arenas()[0].slot_at(3);
        let mut table = InlineMarkTable::new();

        assert!(!table.contains(&heap, slot));
        table.add(&heap, slot);
        assert!(table.contains(&heap, slot));
        // The arena bit array stays untouched.
        assert!(!heap.arenas()[0].test_mark_bit(3));
        table.remove(&heap, slot);
        assert!(!table.contains(&heap, slot));
    }

    #[test]
    fn bitfield_marks_never_touch_object_flags() {
        let heap = heap_with_one_arena();
        let slot = heap.arenas()[0].slot_at(5);
        let mut table = BitfieldMarkTable::new();

        table.add(&heap, slot);
        assert!(table.contains(&heap, slot));
        assert!(heap.arenas()[0].test_mark_bit(5));
        // SAFETY: the slot sits in an arena the test owns.
        assert!(unsafe { slot.as_ref() }.flags().is_empty());

        table.finalize(&heap);
        assert!(!table.contains(&heap, slot));
    }

    #[test]
    fn bitfield_cache_survives_cross_arena_lookups() {
        let config = Config {
            min_arena_slots: 64,
            ..Config::default()
        };
        let mut heap = HeapRegistry::new(&config, BlockSource::Anonymous);
        heap.grow().unwrap();
        heap.grow().unwrap();

        let mut table = BitfieldMarkTable::new();
        table.prepare();
        let a = heap.arenas()[0].slot_at(0);
        let b = heap.arenas()[1].slot_at(7);
        table.add(&heap, a);
        table.add(&heap, b);
        table.add(&heap, a);
        assert!(table.contains(&heap, a));
        assert!(table.contains(&heap, b));
        assert!(!table.contains(&heap, heap.arenas()[1].slot_at(8)));
    }
}
