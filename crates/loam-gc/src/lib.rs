//! A tracing garbage collector for a managed-object runtime.
//!
//! `loam-gc` owns all heap memory for runtime objects and reclaims it with
//! a **stop-the-world mark-sweep** cycle over fixed-size slots carved from
//! contiguous arenas. Objects never move, so an object's address doubles as
//! its stable identity.
//!
//! # Mark-bit storage strategies
//!
//! Where a cycle records "this object is reachable" is pluggable:
//!
//! - **Inline** (default): the mark bit lives in the object's own flags
//!   word. Fast, but marking dirties every live object's memory page, so a
//!   forked child process loses copy-on-write sharing of the whole heap
//!   during its first collection.
//! - **Bitfield**: marks live in per-arena bit arrays (plus a pointer set
//!   for off-arena addresses) and object memory is never written during
//!   collection. Choose it with [`Collector::use_bitfield_strategy`] when
//!   heap pages are shared with a forked process.
//!
//! # Quick start
//!
//! ```ignore
//! use loam_gc::{Collector, ObjectBody, ArrayBody, Value, roots::ValueRoots};
//!
//! let mut gc = Collector::new()?;
//! let a = gc.new_object(Value::True, ObjectBody::Array(ArrayBody::Owned(vec![])))?;
//!
//! // Roots come from providers; anything they do not reach is reclaimed.
//! gc.register_root_provider(Box::new(ValueRoots { values: vec![a] }));
//! gc.collect()?;
//! ```
//!
//! # What the collector is not
//!
//! Not moving/compacting, not generational, not incremental, not
//! concurrent: every cycle is a full-heap mark+sweep performed by exactly
//! one thread, and a cycle once started always runs to completion.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod collector;
mod config;
mod debug;
mod error;
mod finalize;
mod marker;
mod source_files;
mod stats;
mod sweep;
mod trace_log;
mod value;

pub mod heap;
pub mod mark_table;
pub mod object;
pub mod pointer_set;
pub mod roots;

pub use collector::Collector;
pub use config::Config;
pub use error::{Error, Result};
pub use heap::{Arena, HeapRegistry};
pub use mark_table::{BitfieldMarkTable, InlineMarkTable, MarkTable};
pub use object::{
    ArrayBody, ClassBody, DataBody, FileBody, HashBody, IdentTable, Kind, NodeBody, NodeKind,
    ObjectBody, Slot, SlotBody, SlotFlags, StrBody,
};
pub use pointer_set::PointerSet;
pub use roots::{MachineStackRoots, RootProvider, RootSink, ValueRoots};
pub use source_files::FileName;
pub use stats::{HeapStatistics, FREE_RUN_BUCKETS};
pub use value::{identity_of, Ident, ObjectId, SlotRef, Value};
