//! The sweep phase.
//!
//! Runs once per cycle, immediately after the mark drain completes. Every
//! unmarked slot is reclaimed (or parked for deferred finalization), fully
//! free arenas are retired once the free target is met, and the adaptive
//! allocation threshold is rebalanced against the live/freed ratio.
//!
//! Free-slot relinking writes only fields whose value actually changes, so
//! pages full of already-free slots are not dirtied and stay shared with a
//! forked process.

use crate::config::Config;
use crate::debug::DebugOptions;
use crate::error::Result;
use crate::heap::HeapRegistry;
use crate::mark_table::MarkTable;
use crate::object::SlotFlags;
use crate::source_files::SourceFileTable;
use crate::value::SlotRef;

/// Borrowed view of the collector state the sweep phase needs.
pub(crate) struct Sweeper<'a> {
    pub heap: &'a mut HeapRegistry,
    pub table: &'a mut dyn MarkTable,
    pub files: &'a mut SourceFileTable,
    pub config: &'a Config,
    pub debug: &'a DebugOptions,
    /// Whether any finalizer has ever been registered; when false the
    /// pending-finalizer check is skipped entirely.
    pub need_call_final: bool,
}

impl Sweeper<'_> {
    /// Sweep the whole heap. `deferred` is the existing deferred
    /// finalization list; the returned list replaces it. Retired arena
    /// memory is released now unless slots were parked for finalization,
    /// in which case it is held until that pass runs.
    pub(crate) fn sweep(mut self, deferred: Option<SlotRef>) -> Result<Option<SlotRef>> {
        let total = self.heap.total_slots();
        let free_target = self.config.free_min.max(total / 5);

        self.files.mark_current(self.table);
        self.files.sweep(self.table);

        // The free list is rebuilt from scratch each sweep.
        let mut freelist: Option<SlotRef> = None;
        let mut final_list = deferred;
        let mut freed = 0usize;
        let mut live = 0usize;

        for i in 0..self.heap.arenas().len() {
            let limit = self.heap.arenas()[i].limit();
            let mut swept_in_arena = 0usize;
            let freelist_save = freelist;
            let final_save = final_list;

            for index in 0..limit {
                let slot = self.heap.arenas()[i].slot_at(index);
                let marked = self
                    .table
                    .contains_in_arena(&self.heap.arenas()[i], slot);

                // SAFETY (slot derefs below): the sweep owns the heap
                // exclusively for the cycle; no other reference to this
                // slot exists, and each &mut is confined to one statement.
                if !marked {
                    if unsafe { slot.as_ref() }.is_live() {
                        if self.debug.print_swept_objects {
                            self.debug
                                .print(&format!("Swept object: {:p}", slot.as_ptr()));
                        }
                        tracing::trace!(addr = ?slot.as_ptr(), "sweep");
                        unsafe { (*slot.as_ptr()).release_owned() };
                    }
                    if self.need_call_final
                        && unsafe { slot.as_ref() }.test_flag(SlotFlags::FINALIZE)
                    {
                        // Not freed yet: park it and keep it marked so the
                        // slot cannot be reused before its finalizers run.
                        self.table
                            .add_in_arena(&self.heap.arenas()[i], slot);
                        unsafe { (*slot.as_ptr()).relink_free(final_list) };
                        final_list = Some(slot);
                    } else {
                        unsafe {
                            let s = &mut *slot.as_ptr();
                            s.clear_flags();
                            s.relink_free(freelist);
                        }
                        freelist = Some(slot);
                    }
                    swept_in_arena += 1;
                } else if unsafe { slot.as_ref() }.is_reserved() {
                    // Freshly allocated, payload pending: stays marked.
                } else {
                    self.table
                        .remove_in_arena(&self.heap.arenas()[i], slot);
                    live += 1;
                }
            }

            if swept_in_arena == limit && freed > free_target {
                self.heap.arenas_mut()[i].retire();
                // Slots just parked from this arena must survive retirement
                // without ever rejoining the free list.
                let mut parked = final_list;
                while parked != final_save {
                    let p = parked.expect("parked walk cannot pass the saved tail");
                    // SAFETY: parked slots are free-linked by this sweep.
                    let s = unsafe { p.as_ref() };
                    s.set_flag(SlotFlags::SINGLETON);
                    parked = s.free_next().expect("parked slot is free-linked");
                }
                // Cancel this arena's slots from the rebuilt free list.
                freelist = freelist_save;
            } else {
                freed += swept_in_arena;
            }
        }

        self.heap.set_freelist(freelist);
        self.heap.adapt_alloc_limit(live, freed);
        if freed < free_target {
            self.heap.grow()?;
        }

        let deferred = final_list.is_some();
        if !deferred {
            self.heap.release_retired();
        }
        tracing::debug!(freed, live, deferred, "sweep complete");

        Ok(final_list)
    }
}
