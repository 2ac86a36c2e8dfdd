//! Root enumeration.
//!
//! The collector itself owns no roots. At cycle start it asks every
//! registered [`RootProvider`] to enumerate its roots into a [`RootSink`],
//! and additionally walks the list of permanently registered root
//! addresses. Conservative machine-state scanning (registers + native
//! stack) is just one provider, [`MachineStackRoots`], so the
//! platform-specific part stays in one place.

use std::ptr::NonNull;

use crate::marker::Marker;
use crate::value::Value;

// ============================================================================
// Sink and provider
// ============================================================================

/// Receives roots from a provider during the mark phase.
pub struct RootSink<'m, 'h> {
    pub(crate) marker: &'m mut Marker<'h>,
}

impl RootSink<'_, '_> {
    /// Mark a value known to be a valid root.
    pub fn mark(&mut self, value: Value) {
        self.marker.mark(value, 0);
    }

    /// Mark a word that may or may not be a heap address; non-heap words
    /// are ignored.
    pub fn mark_maybe(&mut self, addr: usize) {
        self.marker.mark_maybe(addr);
    }

    /// Conservatively scan `count` words starting at `start`.
    ///
    /// # Safety
    ///
    /// `start` must be valid for reading `count` words.
    pub unsafe fn mark_range(&mut self, start: *const usize, count: usize) {
        for i in 0..count {
            // SAFETY: caller guarantees the range is readable.
            let word = unsafe { start.add(i).read() };
            self.marker.mark_maybe(word);
        }
    }
}

/// A source of roots: an execution context, a thread's stack, a global
/// table, in-flight compiler state.
pub trait RootProvider {
    /// Report every root this provider owns into `sink`.
    fn enumerate_roots(&mut self, sink: &mut RootSink<'_, '_>);
}

/// The simplest provider: a fixed set of values kept alive by the host.
#[derive(Debug, Default)]
pub struct ValueRoots {
    /// The rooted values.
    pub values: Vec<Value>,
}

impl RootProvider for ValueRoots {
    fn enumerate_roots(&mut self, sink: &mut RootSink<'_, '_>) {
        for value in &self.values {
            sink.mark(*value);
        }
    }
}

// ============================================================================
// Registered root addresses
// ============================================================================

struct RootNode {
    addr: NonNull<Value>,
    next: Option<Box<RootNode>>,
}

/// Singly linked list of permanent external root pointers.
#[derive(Default)]
pub(crate) struct RootList {
    head: Option<Box<RootNode>>,
}

impl RootList {
    pub(crate) fn register(&mut self, addr: NonNull<Value>) {
        self.head = Some(Box::new(RootNode {
            addr,
            next: self.head.take(),
        }));
    }

    /// Remove the first registration of `addr`; absent addresses are a
    /// no-op.
    pub(crate) fn unregister(&mut self, addr: NonNull<Value>) {
        fn remove(list: &mut Option<Box<RootNode>>, addr: NonNull<Value>) {
            match list {
                None => {}
                Some(node) => {
                    if node.addr == addr {
                        let next = node.next.take();
                        *list = next;
                    } else {
                        remove(&mut node.next, addr);
                    }
                }
            }
        }
        remove(&mut self.head, addr);
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(NonNull<Value>)) {
        let mut cursor = &self.head;
        while let Some(node) = cursor {
            f(node.addr);
            cursor = &node.next;
        }
    }
}

impl std::fmt::Debug for RootList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut count = 0;
        self.for_each(|_| count += 1);
        f.debug_struct("RootList").field("len", &count).finish()
    }
}

// ============================================================================
// Machine-state scanning
// ============================================================================

/// Conservative register and native-stack scanner.
///
/// Captures an opaque machine-state snapshot (callee-saved registers
/// spilled to the stack) and scans it together with the stack range from
/// the current frame up to the recorded base. Every word that passes the
/// heap's address check is treated as a root.
#[derive(Debug)]
pub struct MachineStackRoots {
    base: usize,
}

impl MachineStackRoots {
    /// Create a scanner for the current thread. `stack_base` must be the
    /// address of a local in a frame below every frame that can hold
    /// references (typically captured in `main`).
    #[must_use]
    pub fn new(stack_base: *const u8) -> Self {
        Self {
            base: stack_base as usize,
        }
    }
}

impl RootProvider for MachineStackRoots {
    fn enumerate_roots(&mut self, sink: &mut RootSink<'_, '_>) {
        spill_registers_and_scan(self.base, &mut |word| sink.mark_maybe(word));
    }
}

/// Spill callee-saved registers onto the stack and feed every word between
/// the current stack position and `base` to `scan`.
#[inline(never)]
fn spill_registers_and_scan(base: usize, scan: &mut dyn FnMut(usize)) {
    #[cfg(target_arch = "x86_64")]
    let regs = {
        let mut regs = [0usize; 6];
        // SAFETY: reads callee-saved registers into locals; no memory is
        // touched.
        unsafe {
            std::arch::asm!(
                "mov {0}, rbx",
                "mov {1}, rbp",
                "mov {2}, r12",
                "mov {3}, r13",
                "mov {4}, r14",
                "mov {5}, r15",
                out(reg) regs[0],
                out(reg) regs[1],
                out(reg) regs[2],
                out(reg) regs[3],
                out(reg) regs[4],
                out(reg) regs[5],
            );
        }
        regs
    };
    #[cfg(not(target_arch = "x86_64"))]
    let regs = [0usize; 8];
    std::hint::black_box(&regs);

    for word in &regs {
        scan(*word);
    }

    let sp = std::ptr::addr_of!(regs) as usize;
    let align = std::mem::align_of::<usize>();
    let (mut current, end) = if sp <= base {
        (sp & !(align - 1), base)
    } else {
        (base & !(align - 1), sp)
    };
    while current < end {
        // SAFETY: the range lies within the current thread's own stack,
        // between a live frame and the recorded base.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        scan(word);
        current += std::mem::size_of::<usize>();
    }
}

#[cfg(test)]
mod tests {
    use super::RootList;
    use crate::value::Value;
    use std::ptr::NonNull;

    #[test]
    fn register_and_unregister_addresses() {
        let mut a = Value::Fixnum(1);
        let mut b = Value::Fixnum(2);
        let pa = NonNull::from(&mut a);
        let pb = NonNull::from(&mut b);

        let mut list = RootList::default();
        list.register(pa);
        list.register(pb);

        let mut seen = Vec::new();
        list.for_each(|p| seen.push(p));
        assert_eq!(seen, vec![pb, pa]);

        list.unregister(pa);
        let mut seen = Vec::new();
        list.for_each(|p| seen.push(p));
        assert_eq!(seen, vec![pb]);

        // Unregistering an absent address changes nothing.
        list.unregister(pa);
        let mut count = 0;
        list.for_each(|_| count += 1);
        assert_eq!(count, 1);
    }
}
