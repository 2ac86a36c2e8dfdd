//! The collector.
//!
//! One [`Collector`] owns one heap: arenas, free list, mark table, mark
//! stack, finalizer table and root registrations. There are no process-wide
//! globals; independent collectors (e.g. one per test) do not interact.
//!
//! A cycle is stop-the-world: once entered it runs mark then sweep to
//! completion. Entry is guarded by the owning-thread check and a reentrancy
//! flag — an allocation made while collecting grows the heap instead of
//! recursing into another cycle.

use std::ptr::NonNull;
use std::thread::{self, ThreadId};

use arena_alloc::BlockSource;

use crate::config::Config;
use crate::debug::DebugOptions;
use crate::error::{Error, Result};
use crate::finalize::FinalizerTable;
use crate::heap::HeapRegistry;
use crate::mark_table::{BitfieldMarkTable, InlineMarkTable, MarkTable};
use crate::marker::{MarkStack, Marker};
use crate::object::{Kind, ObjectBody, Slot, SlotBody, SlotFlags};
use crate::roots::{RootList, RootProvider, RootSink};
use crate::source_files::{FileName, SourceFileTable};
use crate::stats::{self, HeapStatistics};
use crate::sweep::Sweeper;
use crate::trace_log::{self, Phase};
use crate::value::{decode_identity, DecodedId, ObjectId, SlotRef, Value};

/// A tracing, non-moving, stop-the-world mark-sweep collector.
pub struct Collector {
    heap: HeapRegistry,
    table: Box<dyn MarkTable>,
    mark_stack: MarkStack,
    finalizers: FinalizerTable,
    files: SourceFileTable,
    providers: Vec<Box<dyn RootProvider>>,
    registered: RootList,
    /// Head of the deferred-finalization list built by sweep.
    deferred: Option<SlotRef>,
    /// Whether any finalizer has ever been registered.
    need_call_final: bool,
    /// Automatic collection suppressed by [`Collector::disable`].
    disabled: bool,
    /// Reentrancy flag for the active cycle (and finalization pass).
    during_gc: bool,
    /// Out-of-memory recursion guard.
    in_oom: bool,
    cycles: u64,
    owner: ThreadId,
    config: Config,
    debug: DebugOptions,
}

impl Collector {
    /// Create a collector with the default configuration and the inline
    /// mark-table strategy, growing the first arena eagerly.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the first arena cannot be obtained.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    /// Create a collector with an explicit configuration.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the first arena cannot be obtained.
    pub fn with_config(config: Config) -> Result<Self> {
        let debug = DebugOptions::from_env();
        let source = if debug.alloc_arena_with_file {
            BlockSource::ZeroFile
        } else {
            BlockSource::Anonymous
        };
        let mut heap = HeapRegistry::new(&config, source);
        heap.grow()?;
        Ok(Self {
            heap,
            table: Box::new(InlineMarkTable::new()),
            mark_stack: MarkStack::new(config.mark_stack_capacity),
            finalizers: FinalizerTable::new(),
            files: SourceFileTable::new(),
            providers: Vec::new(),
            registered: RootList::default(),
            deferred: None,
            need_call_final: false,
            disabled: false,
            during_gc: false,
            in_oom: false,
            cycles: 0,
            owner: thread::current().id(),
            config,
            debug,
        })
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Claim a zeroed, reserved slot from the free list, collecting (or
    /// growing, when collection is disabled) on exhaustion.
    ///
    /// The slot is not yet an object; install a payload with
    /// [`Collector::install`] before the next cycle can see it as live.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when no slot can be obtained even after a
    /// cycle and a minimum-size growth attempt.
    pub fn allocate(&mut self) -> Result<SlotRef> {
        match self.allocate_inner() {
            Ok(slot) => {
                self.in_oom = false;
                Ok(slot)
            }
            Err(Error::OutOfMemory) => Err(self.out_of_memory()),
            Err(err) => Err(err),
        }
    }

    fn allocate_inner(&mut self) -> Result<SlotRef> {
        if self.heap.freelist_is_empty() {
            self.garbage_collect()?;
        }
        if self.heap.freelist_is_empty() {
            self.heap.grow()?;
        }
        let slot = self.heap.pop_free().ok_or(Error::OutOfMemory)?;
        // SAFETY: the slot came off the free list; nothing else owns it.
        unsafe { slot.as_ptr().write(Slot::new_reserved()) };
        Ok(slot)
    }

    /// Install an object into a reserved slot.
    pub fn install(&mut self, slot: SlotRef, class: Value, body: ObjectBody) {
        let shared = body.is_shared();
        // SAFETY: the caller received the slot from `allocate` and has not
        // installed into it yet; we own it exclusively.
        unsafe {
            *(*slot.as_ptr()).body_mut() = SlotBody::Live { class, body };
        }
        if shared {
            // SAFETY: as above.
            unsafe { slot.as_ref() }.set_flag(SlotFlags::SHARED_ELEMS);
        }
    }

    /// Allocate and install in one step.
    ///
    /// Creating the object may itself trigger a cycle; values embedded in
    /// `body` (and `class`) must be reachable from the root set or they
    /// can be reclaimed before the new object exists to hold them.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] as in [`Collector::allocate`].
    pub fn new_object(&mut self, class: Value, body: ObjectBody) -> Result<Value> {
        self.account_allocation(body.payload_bytes());
        let slot = self.allocate()?;
        self.install(slot, class, body);
        Ok(Value::Object(slot))
    }

    /// Record payload bytes allocated on behalf of managed objects. When
    /// the accounted volume crosses the adaptive threshold, a cycle runs.
    pub fn account_allocation(&mut self, bytes: usize) {
        if self.heap.account(bytes) && !self.during_gc && !self.disabled {
            if let Err(err) = self.garbage_collect() {
                tracing::warn!(%err, "allocation-triggered cycle failed");
            }
        }
    }

    fn out_of_memory(&mut self) -> Error {
        if self.in_oom {
            eprintln!("[FATAL] failed to allocate memory");
            std::process::abort();
        }
        self.in_oom = true;
        Error::OutOfMemory
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Force a synchronous collection cycle, then run deferred finalizers.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the post-sweep shortfall growth fails.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that created
    /// the collector.
    pub fn collect(&mut self) -> Result<()> {
        self.garbage_collect()?;
        self.finalize_deferred();
        Ok(())
    }

    fn garbage_collect(&mut self) -> Result<()> {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "cross-thread violation: collect on a foreign thread"
        );
        if self.disabled || self.during_gc {
            if self.heap.freelist_is_empty() {
                self.heap.grow()?;
            }
            return Ok(());
        }
        self.during_gc = true;
        let result = self.run_cycle();
        self.during_gc = false;
        result
    }

    fn run_cycle(&mut self) -> Result<()> {
        let _cycle = trace_log::cycle_span(self.cycles, self.table.is_cow_friendly());

        if self.debug.prompt_before_gc {
            self.debug
                .prompt("Press Enter to initiate garbage collection.\n");
        }

        self.table.prepare();
        self.mark_stack.reset();

        {
            let _mark = trace_log::phase_span(Phase::Mark);
            let probe = 0u8;
            let Self {
                heap,
                table,
                mark_stack,
                providers,
                registered,
                config,
                ..
            } = self;
            let mut marker = Marker {
                heap: &*heap,
                table: table.as_mut(),
                stack: mark_stack,
                config: &*config,
                stack_base: std::ptr::addr_of!(probe) as usize,
            };

            for provider in providers.iter_mut() {
                let mut sink = RootSink {
                    marker: &mut marker,
                };
                provider.enumerate_roots(&mut sink);
            }
            registered.for_each(|addr| {
                // SAFETY: registration promises the address outlives its
                // registration and holds an initialized Value.
                let value = unsafe { addr.as_ptr().read() };
                marker.mark(value, 0);
            });

            marker.drain();
        }

        if self.debug.prompt_before_sweep {
            self.debug
                .prompt("Press Enter to initiate sweeping phase.\n");
        }

        let deferred_in = self.deferred.take();
        let deferred_out = {
            let _sweep = trace_log::phase_span(Phase::Sweep);
            let Self {
                heap,
                table,
                files,
                config,
                debug,
                need_call_final,
                ..
            } = self;
            let sweeper = Sweeper {
                heap,
                table: table.as_mut(),
                files,
                config: &*config,
                debug: &*debug,
                need_call_final: *need_call_final,
            };
            sweeper.sweep(deferred_in)?
        };
        self.deferred = deferred_out;

        if self.debug.prompt_after_sweep {
            self.debug
                .prompt("Press Enter to confirm finalization of sweeping phase.\n");
        }

        self.table.finalize(&self.heap);
        self.remark_deferred();
        self.cycles += 1;
        Ok(())
    }

    /// Deferred slots must read as marked in every later cycle so they are
    /// neither reused nor re-swept before their finalizers run; restore
    /// their marks after the table's end-of-cycle reset.
    fn remark_deferred(&mut self) {
        let mut cursor = self.deferred;
        while let Some(slot) = cursor {
            self.table.add(&self.heap, slot);
            // SAFETY: deferred slots are free-linked by the sweep that
            // parked them.
            cursor = unsafe { slot.as_ref() }
                .free_next()
                .expect("deferred slot is free-linked");
        }
    }

    /// Enable automatic collection; returns whether it was disabled.
    pub fn enable(&mut self) -> bool {
        let old = self.disabled;
        self.disabled = false;
        old
    }

    /// Disable automatic collection; returns whether it was already
    /// disabled. Allocation grows the heap unchecked until re-enabled.
    pub fn disable(&mut self) -> bool {
        let old = self.disabled;
        self.disabled = true;
        old
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Register a root provider consulted at the start of every cycle.
    pub fn register_root_provider(&mut self, provider: Box<dyn RootProvider>) {
        self.providers.push(provider);
    }

    /// Register a permanent external root pointer.
    ///
    /// # Safety
    ///
    /// `addr` must point at an initialized `Value` that remains valid (and
    /// is kept current by its owner) until unregistered.
    pub unsafe fn register_address(&mut self, addr: NonNull<Value>) {
        self.registered.register(addr);
    }

    /// Remove a previously registered root pointer.
    pub fn unregister_address(&mut self, addr: NonNull<Value>) {
        self.registered.unregister(addr);
    }

    // ------------------------------------------------------------------
    // Finalizers
    // ------------------------------------------------------------------

    /// Register a finalizer for `obj`, capturing `permission` for the run.
    /// Finalizers run in registration order during the deferred pass after
    /// the object becomes unreachable.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidReference`] when `obj` is not a live heap object.
    pub fn define_finalizer(
        &mut self,
        obj: Value,
        permission: u8,
        func: impl FnMut(ObjectId, u8) + 'static,
    ) -> Result<()> {
        let id = crate::value::identity_of(obj);
        let Some(slot) = obj.as_slot() else {
            return Err(Error::InvalidReference(id));
        };
        // SAFETY: a host-held Value names a slot in an owned arena.
        if !unsafe { slot.as_ref() }.is_live() {
            return Err(Error::InvalidReference(id));
        }
        self.need_call_final = true;
        // SAFETY: as above.
        unsafe { slot.as_ref() }.set_flag(SlotFlags::FINALIZE);
        self.finalizers.register(id, permission, Box::new(func));
        Ok(())
    }

    /// Remove every finalizer registered for `obj`.
    pub fn undefine_finalizer(&mut self, obj: Value) {
        if let Some(slot) = obj.as_slot() {
            // SAFETY: as in `define_finalizer`.
            unsafe { slot.as_ref() }.unset_flag(SlotFlags::FINALIZE);
        }
        self.finalizers.unregister(crate::value::identity_of(obj));
    }

    /// Run the deferred-finalization pass: execute the finalizers of every
    /// slot the last sweep parked, then recycle the slots and release any
    /// arena memory sweeping held back.
    ///
    /// Collection triggered from inside a finalizer does not start a
    /// nested cycle; it grows the heap instead.
    pub fn finalize_deferred(&mut self) {
        let mut cursor = self.deferred.take();
        if cursor.is_none() {
            return;
        }
        let saved = self.during_gc;
        self.during_gc = true;
        while let Some(slot) = cursor {
            // SAFETY: parked slots are free-linked and stay valid until
            // this pass recycles them.
            cursor = unsafe { slot.as_ref() }
                .free_next()
                .expect("deferred slot is free-linked");
            self.finalizers.run(slot.as_ptr() as ObjectId);
            // SAFETY: as above.
            let s = unsafe { slot.as_ref() };
            if !s.test_flag(SlotFlags::SINGLETON) && !s.flags().is_empty() {
                s.clear_flags();
                self.table.remove(&self.heap, slot);
                self.heap.push_free(slot);
            }
        }
        self.during_gc = saved;
        self.heap.release_retired();
    }

    /// Shutdown pass: run every pending finalizer and the native
    /// destructors of still-open external resources, unconditionally.
    pub fn finalize_all(&mut self) {
        self.finalize_deferred();

        if self.need_call_final {
            for i in 0..self.heap.arenas().len() {
                for index in 0..self.heap.arenas()[i].limit() {
                    let slot = self.heap.arenas()[i].slot_at(index);
                    // SAFETY: slots in owned arenas stay valid for the
                    // collector's lifetime.
                    if !unsafe { slot.as_ref() }.test_flag(SlotFlags::FINALIZE) {
                        continue;
                    }
                    unsafe { slot.as_ref() }.unset_flag(SlotFlags::FINALIZE);
                    // SAFETY: exclusive access; finalizers must not be able
                    // to resurrect the object through its class.
                    unsafe {
                        if let SlotBody::Live { class, .. } = (*slot.as_ptr()).body_mut() {
                            *class = Value::Nil;
                        }
                    }
                    self.finalizers.run(slot.as_ptr() as ObjectId);
                }
            }
        }

        for i in 0..self.heap.arenas().len() {
            for index in 0..self.heap.arenas()[i].limit() {
                let slot = self.heap.arenas()[i].slot_at(index);
                // SAFETY: as above.
                let open_resource = match unsafe { slot.as_ref() }.body() {
                    SlotBody::Live {
                        body: ObjectBody::File(file),
                        ..
                    } => file.handle.is_some(),
                    SlotBody::Live {
                        body: ObjectBody::Data(data),
                        ..
                    } => data.release.is_some(),
                    _ => false,
                };
                if open_resource {
                    // SAFETY: exclusive access during shutdown.
                    unsafe { (*slot.as_ptr()).release_owned() };
                    self.table.remove(&self.heap, slot);
                    unsafe { slot.as_ref() }.clear_flags();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Stable identity of `value`; constant for as long as the object
    /// stays reachable.
    #[must_use]
    pub fn identity_of(&self, value: Value) -> ObjectId {
        crate::value::identity_of(value)
    }

    /// Decode an identity back to its value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidReference`] when the identity names an address that
    /// was never allocated, a recycled slot, or an internal object.
    pub fn resolve(&self, id: ObjectId) -> Result<Value> {
        match decode_identity(id) {
            DecodedId::Immediate(value) => Ok(value),
            DecodedId::Invalid => Err(Error::InvalidReference(id)),
            DecodedId::Address(addr) => {
                if !self.heap.is_heap_address(addr) {
                    return Err(Error::InvalidReference(id));
                }
                // SAFETY: is_heap_address proved this is an aligned slot
                // address inside an owned arena.
                let slot = unsafe { SlotRef::new_unchecked(addr as *mut Slot) };
                match unsafe { slot.as_ref() }.body() {
                    SlotBody::Live { class, .. } if *class != Value::Nil => {
                        Ok(Value::Object(slot))
                    }
                    _ => Err(Error::InvalidReference(id)),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Yield every live, non-internal object, optionally filtered by kind;
    /// returns how many were yielded. Nodes, singleton classes and
    /// classless objects are internal.
    pub fn each_object<F: FnMut(Value)>(&self, kind: Option<Kind>, mut f: F) -> usize {
        let mut count = 0;
        for arena in self.heap.arenas() {
            for index in 0..arena.limit() {
                let slot = arena.slot_at(index);
                // SAFETY: index is within the arena's live range.
                let s = unsafe { slot.as_ref() };
                let SlotBody::Live { class, body } = s.body() else {
                    continue;
                };
                let k = body.kind();
                if k == Kind::Node {
                    continue;
                }
                if matches!(k, Kind::Class | Kind::Module) && s.test_flag(SlotFlags::SINGLETON)
                {
                    continue;
                }
                if *class == Value::Nil {
                    continue;
                }
                if kind.is_some_and(|want| want != k) {
                    continue;
                }
                f(Value::Object(slot));
                count += 1;
            }
        }
        count
    }

    /// Snapshot heap occupancy.
    #[must_use]
    pub fn statistics(&self) -> HeapStatistics {
        stats::gather(&self.heap, self.cycles)
    }

    /// The heap registry, for address checks and arena inspection.
    #[must_use]
    pub const fn heap(&self) -> &HeapRegistry {
        &self.heap
    }

    /// Completed collection cycles.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    // ------------------------------------------------------------------
    // Mark-table strategy
    // ------------------------------------------------------------------

    /// Switch to the inline strategy: fastest, but collection dirties the
    /// pages of every live object.
    pub fn use_inline_strategy(&mut self) {
        self.table = Box::new(InlineMarkTable::new());
        self.reset_marks_after_switch();
    }

    /// Switch to the bitfield strategy: collection leaves object memory
    /// untouched, preserving copy-on-write page sharing after a fork.
    pub fn use_bitfield_strategy(&mut self) {
        self.table = Box::new(BitfieldMarkTable::new());
        self.reset_marks_after_switch();
    }

    /// Whether the active strategy avoids writing into object memory.
    #[must_use]
    pub fn is_cow_friendly(&self) -> bool {
        self.table.is_cow_friendly()
    }

    fn reset_marks_after_switch(&mut self) {
        for arena in self.heap.arenas() {
            arena.clear_all_mark_bits();
            for index in 0..arena.limit() {
                // SAFETY: index is within the arena's live range.
                unsafe { arena.slot_at(index).as_ref() }.unset_flag(SlotFlags::MARK);
            }
        }
        self.remark_deferred();
    }

    // ------------------------------------------------------------------
    // Filenames and recycling
    // ------------------------------------------------------------------

    /// Intern a source filename for use in node payloads.
    pub fn intern_filename(&mut self, name: &str) -> FileName {
        self.files.intern(name)
    }

    /// Set (or clear) the filename of the in-flight compilation; it is
    /// always kept live.
    pub fn set_current_file(&mut self, file: Option<FileName>) {
        self.files.set_current(file);
    }

    /// Immediately return an object's slot to the free list, dropping its
    /// payload. The caller asserts nothing references the object.
    pub fn force_recycle(&mut self, value: Value) {
        let Some(slot) = value.as_slot() else {
            return;
        };
        // SAFETY: the caller owns the only reference.
        unsafe { (*slot.as_ptr()).release_owned() };
        unsafe { slot.as_ref() }.clear_flags();
        self.table.remove(&self.heap, slot);
        self.heap.push_free(slot);
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.finalize_all();
        // Release every remaining live payload so arena teardown leaks
        // nothing.
        for i in 0..self.heap.arenas().len() {
            for index in 0..self.heap.arenas()[i].limit() {
                let slot = self.heap.arenas()[i].slot_at(index);
                // SAFETY: exclusive access during drop.
                if unsafe { slot.as_ref() }.is_live() {
                    unsafe { (*slot.as_ptr()).release_owned() };
                }
            }
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("heap", &self.heap)
            .field("cycles", &self.cycles)
            .field("cow_friendly", &self.is_cow_friendly())
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}
