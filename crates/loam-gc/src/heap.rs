//! Arenas and the heap registry.
//!
//! Objects live in fixed-size slots carved out of contiguous arenas. The
//! registry owns the arenas, the global free list threaded through free
//! slots, and the low/high address watermarks that let conservative root
//! scanning reject non-heap words cheaply.

use std::cell::Cell;
use std::mem::size_of;
use std::ptr::NonNull;

use arena_alloc::{Block, BlockSource};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::object::Slot;
use crate::value::SlotRef;

/// Bits per mark word in an arena's bit array.
const MARK_WORD_BITS: usize = 32;

// ============================================================================
// Arena
// ============================================================================

/// A contiguous slab of object slots.
///
/// The base pointer is aligned up so every slot address is a multiple of
/// `size_of::<Slot>()`, which makes the registry's alignment check a plain
/// modulo. An arena is never relocated; retiring it sets its capacity to 0
/// and its memory is released once nothing defers on it.
pub struct Arena {
    /// Backing block; dropped when the arena is released.
    block: Block,
    slots: NonNull<Slot>,
    limit: usize,
    /// Separate mark bit array for the bitfield strategy, one bit per slot.
    marks: Box<[Cell<u32>]>,
}

impl Arena {
    /// Carve an arena of `slot_count` slots out of a fresh block, linking
    /// every slot onto `freelist` (which is updated to the new head).
    fn carve(
        slot_count: usize,
        source: BlockSource,
        freelist: &mut Option<SlotRef>,
    ) -> std::io::Result<Self> {
        let slot_size = size_of::<Slot>();
        // One spare slot of slack pays for aligning the base up.
        let block = Block::acquire((slot_count + 1) * slot_size, source)?;

        let base = block.ptr() as usize;
        let aligned = base.next_multiple_of(slot_size);
        let slots = NonNull::new(aligned as *mut Slot).expect("block base is never null");

        let words = slot_count.div_ceil(MARK_WORD_BITS);
        let marks = std::iter::repeat_with(|| Cell::new(0u32))
            .take(words)
            .collect::<Box<[_]>>();

        let arena = Self {
            block,
            slots,
            limit: slot_count,
            marks,
        };

        for i in 0..slot_count {
            let slot = arena.slot_at(i);
            // SAFETY: the block is freshly mapped and exclusively ours; each
            // slot address is in bounds and properly aligned.
            unsafe {
                slot.as_ptr().write(Slot::new_free(*freelist));
            }
            *freelist = Some(slot);
        }

        Ok(arena)
    }

    /// First slot address.
    #[must_use]
    pub const fn begin(&self) -> *const Slot {
        self.slots.as_ptr()
    }

    /// One past the last slot.
    #[must_use]
    pub fn end(&self) -> *const Slot {
        // SAFETY: limit slots were carved from the owned block.
        unsafe { self.slots.as_ptr().add(self.limit) }
    }

    /// Slot capacity; 0 once retired.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Whether the arena has been retired by a sweep.
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.limit == 0
    }

    /// Retire the arena: capacity drops to 0 and its slots leave the free
    /// list; the memory is released later, once no finalization defers on
    /// it.
    pub(crate) const fn retire(&mut self) {
        self.limit = 0;
    }

    /// Whether `ptr` points at a slot of this arena.
    #[must_use]
    pub fn contains(&self, ptr: *const Slot) -> bool {
        ptr >= self.begin() && ptr < self.end()
    }

    /// Index of `slot` within this arena.
    ///
    /// The caller must know the slot belongs to this arena; retired arenas
    /// still resolve indices for slots parked on the deferred list.
    #[must_use]
    pub fn slot_index(&self, slot: SlotRef) -> usize {
        debug_assert!(slot.as_ptr() as usize >= self.slots.as_ptr() as usize);
        (slot.as_ptr() as usize - self.slots.as_ptr() as usize) / size_of::<Slot>()
    }

    /// Slot at `index`.
    #[must_use]
    pub fn slot_at(&self, index: usize) -> SlotRef {
        // SAFETY: callers iterate up to the carve-time limit; the backing
        // block outlives the arena.
        unsafe { NonNull::new_unchecked(self.slots.as_ptr().add(index)) }
    }

    fn mark_position(index: usize) -> (usize, u32) {
        (index / MARK_WORD_BITS, 1 << (index % MARK_WORD_BITS))
    }

    /// Set the bitfield mark for the slot at `index`.
    pub(crate) fn set_mark_bit(&self, index: usize) {
        let (word, bit) = Self::mark_position(index);
        let cell = &self.marks[word];
        cell.set(cell.get() | bit);
    }

    /// Test the bitfield mark for the slot at `index`.
    #[must_use]
    pub(crate) fn test_mark_bit(&self, index: usize) -> bool {
        let (word, bit) = Self::mark_position(index);
        self.marks[word].get() & bit != 0
    }

    /// Clear the bitfield mark for the slot at `index`.
    pub(crate) fn clear_mark_bit(&self, index: usize) {
        let (word, bit) = Self::mark_position(index);
        let cell = &self.marks[word];
        cell.set(cell.get() & !bit);
    }

    /// Clear the whole bit array.
    pub(crate) fn clear_all_mark_bits(&self) {
        for word in &self.marks {
            word.set(0);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("begin", &self.begin())
            .field("limit", &self.limit)
            .field("block_len", &self.block.len())
            .finish()
    }
}

// ============================================================================
// Heap registry
// ============================================================================

/// Owns every arena, the global free list and the growth state.
pub struct HeapRegistry {
    arenas: Vec<Arena>,
    freelist: Option<SlotRef>,
    /// Lowest slot address across all arenas.
    lomem: usize,
    /// One past the highest slot address across all arenas.
    himem: usize,
    /// Slot count for the next growth; multiplied by the growth factor after
    /// each success, reset to the minimum on backing-allocation failure.
    heap_slots: usize,
    min_slots: usize,
    growth_factor: f64,
    /// Payload bytes accounted since the last cycle.
    alloc_increase: usize,
    /// Adaptive trigger threshold for `alloc_increase`.
    alloc_limit: usize,
    initial_alloc_limit: usize,
    block_source: BlockSource,
}

impl HeapRegistry {
    pub(crate) fn new(config: &Config, block_source: BlockSource) -> Self {
        Self {
            arenas: Vec::new(),
            freelist: None,
            lomem: usize::MAX,
            himem: 0,
            heap_slots: config.min_arena_slots,
            min_slots: config.min_arena_slots,
            growth_factor: config.growth_factor,
            alloc_increase: 0,
            alloc_limit: config.initial_alloc_limit,
            initial_alloc_limit: config.initial_alloc_limit,
            block_source,
        }
    }

    /// Add one arena at the current growth target, retrying once at the
    /// minimum size when the backing allocator refuses; failure at the
    /// minimum is out-of-memory.
    pub(crate) fn grow(&mut self) -> Result<()> {
        loop {
            match Arena::carve(self.heap_slots, self.block_source, &mut self.freelist) {
                Ok(arena) => {
                    self.lomem = self.lomem.min(arena.begin() as usize);
                    self.himem = self.himem.max(arena.end() as usize);
                    self.arenas.push(arena);
                    break;
                }
                Err(_) if self.heap_slots > self.min_slots => {
                    // Fall back to the minimum so growth still makes
                    // progress under memory pressure.
                    self.heap_slots = self.min_slots;
                }
                Err(_) => return Err(Error::OutOfMemory),
            }
        }
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        {
            self.heap_slots = (self.heap_slots as f64 * self.growth_factor) as usize;
        }
        if self.heap_slots == 0 {
            self.heap_slots = self.min_slots;
        }
        Ok(())
    }

    /// Pop the free-list head.
    pub(crate) fn pop_free(&mut self) -> Option<SlotRef> {
        let head = self.freelist?;
        // SAFETY: free-list entries are valid slots in owned arenas.
        let next = unsafe { head.as_ref() }
            .free_next()
            .expect("free list entry must be a free slot");
        self.freelist = next;
        Some(head)
    }

    /// Push a slot onto the free list.
    pub(crate) fn push_free(&mut self, slot: SlotRef) {
        // SAFETY: the caller hands us a slot it owns exclusively.
        unsafe { (*slot.as_ptr()).relink_free(self.freelist) };
        self.freelist = Some(slot);
    }

    pub(crate) const fn freelist_is_empty(&self) -> bool {
        self.freelist.is_none()
    }

    pub(crate) const fn set_freelist(&mut self, head: Option<SlotRef>) {
        self.freelist = head;
    }

    /// Whether `addr` is a properly aligned address of a slot inside a live
    /// arena. Used to reject non-pointer words during conservative root
    /// scanning and to validate decoded identities.
    #[must_use]
    pub fn is_heap_address(&self, addr: usize) -> bool {
        if addr < self.lomem || addr >= self.himem {
            return false;
        }
        if addr % size_of::<Slot>() != 0 {
            return false;
        }
        let ptr = addr as *const Slot;
        self.arenas.iter().any(|arena| arena.contains(ptr))
    }

    /// Index of the arena holding `slot`, if any.
    #[must_use]
    pub(crate) fn arena_index_of(&self, slot: SlotRef) -> Option<usize> {
        let ptr = slot.as_ptr().cast_const();
        self.arenas.iter().position(|arena| arena.contains(ptr))
    }

    /// All arenas, including retired ones awaiting release.
    #[must_use]
    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    pub(crate) fn arenas_mut(&mut self) -> &mut [Arena] {
        &mut self.arenas
    }

    /// Total slot capacity across live arenas.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.arenas.iter().map(Arena::limit).sum()
    }

    /// Release the memory of retired arenas. The first arena is never
    /// released.
    pub(crate) fn release_retired(&mut self) {
        let mut index = 0;
        self.arenas.retain(|arena| {
            let keep = index == 0 || !arena.is_retired();
            index += 1;
            keep
        });
    }

    // ------------------------------------------------------------------
    // Adaptive allocation accounting
    // ------------------------------------------------------------------

    /// Record `bytes` of payload allocation; returns true when the adaptive
    /// limit is crossed and a cycle should run.
    pub(crate) const fn account(&mut self, bytes: usize) -> bool {
        self.alloc_increase += bytes;
        self.alloc_increase > self.alloc_limit
    }

    /// Raise the adaptive limit in proportion to how much of the heap
    /// survived the cycle, and restart accounting.
    pub(crate) fn adapt_alloc_limit(&mut self, live: usize, freed: usize) {
        if self.alloc_increase > self.alloc_limit && live + freed > 0 {
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            {
                let over = (self.alloc_increase - self.alloc_limit) as f64;
                self.alloc_limit += (over * live as f64 / (live + freed) as f64) as usize;
            }
            if self.alloc_limit < self.initial_alloc_limit {
                self.alloc_limit = self.initial_alloc_limit;
            }
        }
        self.alloc_increase = 0;
    }
}

impl std::fmt::Debug for HeapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegistry")
            .field("arenas", &self.arenas.len())
            .field("total_slots", &self.total_slots())
            .field("lomem", &(self.lomem as *const Slot))
            .field("himem", &(self.himem as *const Slot))
            .finish_non_exhaustive()
    }
}
