//! Collector configuration.
//!
//! All sizes and thresholds are tunable; the defaults match the behavior of
//! the collector in production shape. Tests shrink them to exercise growth,
//! overflow and retirement paths cheaply.

/// Configuration for a [`Collector`](crate::Collector).
///
/// # Example
///
/// ```ignore
/// use loam_gc::Config;
///
/// // Small heap for tests: tiny arenas, aggressive overflow.
/// let config = Config {
///     min_arena_slots: 256,
///     mark_stack_capacity: 8,
///     ..Config::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Slot count of the first arena and of every growth retry after a
    /// backing-allocation failure.
    ///
    /// Default: 10 000
    pub min_arena_slots: usize,

    /// Factor applied to the arena growth target after each successful
    /// growth.
    ///
    /// Default: 1.8
    pub growth_factor: f64,

    /// Lower bound on the sweep's free-slot target. A sweep that frees
    /// fewer slots than `max(free_min, total_slots / 5)` grows the heap.
    ///
    /// Default: 4096
    pub free_min: usize,

    /// Capacity of the bounded mark stack. Exceeding it flips the overflow
    /// flag and degrades the drain into full-heap rescans.
    ///
    /// Default: 1024
    pub mark_stack_capacity: usize,

    /// Recursion ceiling for the marking traversal; deeper references are
    /// deferred to the mark stack.
    ///
    /// Default: 250
    pub mark_recursion_limit: u32,

    /// Native stack bytes the mark phase may consume before top-level marks
    /// are deferred to the mark stack instead of recursing.
    ///
    /// Default: 1 MiB
    pub native_stack_budget: usize,

    /// Initial value of the adaptive allocation limit: payload bytes
    /// accounted between cycles before allocation itself triggers one. The
    /// sweep raises the limit in proportion to the live/freed ratio.
    ///
    /// Default: 8 000 000
    pub initial_alloc_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_arena_slots: 10_000,
            growth_factor: 1.8,
            free_min: 4096,
            mark_stack_capacity: 1024,
            mark_recursion_limit: 250,
            native_stack_budget: 1024 * 1024,
            initial_alloc_limit: 8_000_000,
        }
    }
}
