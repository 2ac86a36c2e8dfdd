//! Managed object slots.
//!
//! Every heap object occupies one fixed-size [`Slot`]: a flags word plus a
//! tagged body. A free slot's body carries the intrusive free-list link; a
//! live slot's body carries the kind-specific payload. The kind discriminant
//! is the body's enum tag.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;

use crate::source_files::FileName;
use crate::value::{Ident, SlotRef, Value};

// ============================================================================
// Flags
// ============================================================================

/// Attribute bits carried in a slot's flags word.
///
/// The mark bit is only meaningful under the inline mark-table strategy; the
/// bitfield strategy never touches it (that is the point of the strategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotFlags(u32);

impl SlotFlags {
    /// Inline-strategy mark bit.
    pub const MARK: u32 = 1 << 0;
    /// The object has externally stored instance variables.
    pub const EXTERNAL_VARS: u32 = 1 << 1;
    /// The object's element buffer is shared with another object.
    pub const SHARED_ELEMS: u32 = 1 << 2;
    /// A finalizer is registered for this object.
    pub const FINALIZE: u32 = 1 << 3;
    /// The object is a singleton (or, on a deferred-finalization slot, its
    /// arena was retired and the slot must not be recycled).
    pub const SINGLETON: u32 = 1 << 4;

    /// No attribute bits set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether no attribute bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all bits in `mask` are set.
    #[must_use]
    pub const fn test(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    #[must_use]
    const fn with(self, mask: u32) -> Self {
        Self(self.0 | mask)
    }

    #[must_use]
    const fn without(self, mask: u32) -> Self {
        Self(self.0 & !mask)
    }
}

// ============================================================================
// Object kinds
// ============================================================================

/// The kind discriminant of a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Plain object with instance variables.
    Object,
    /// Class: method table, class variables, superclass link.
    Class,
    /// Module: same payload as a class, no instantiation.
    Module,
    /// Array of values, possibly sharing its buffer.
    Array,
    /// Association table of value pairs plus a default value.
    Hash,
    /// Byte string, possibly sharing its buffer.
    Str,
    /// Fixed-shape record of value fields.
    Struct,
    /// Syntax tree node with up to three child references.
    Node,
    /// Boxed floating point number.
    Float,
    /// Arbitrary-precision integer.
    Bignum,
    /// Compiled pattern.
    Regexp,
    /// Open operating-system file resource.
    File,
    /// Extension-supplied payload with caller callbacks.
    Data,
}

/// Table of named values (instance variables, method bodies).
pub type IdentTable = HashMap<Ident, Value>;

/// Payload of a class or module.
#[derive(Debug)]
pub struct ClassBody {
    /// Superclass link, `Value::Nil` at the root.
    pub superclass: Value,
    /// Method name to method body (typically a node).
    pub methods: IdentTable,
    /// Class-level variables.
    pub ivars: IdentTable,
    /// Distinguishes modules from instantiable classes.
    pub module: bool,
}

/// Array payload: either an owned element buffer or a back-reference to the
/// object that owns the shared buffer.
#[derive(Debug)]
pub enum ArrayBody {
    /// Exclusively owned elements.
    Owned(Vec<Value>),
    /// The elements belong to `origin`; this object only keeps it alive.
    Shared {
        /// Owner of the shared buffer.
        origin: Value,
    },
}

/// String payload, with the same sharing structure as [`ArrayBody`].
#[derive(Debug)]
pub enum StrBody {
    /// Exclusively owned bytes.
    Owned(Box<str>),
    /// The bytes belong to `origin`.
    Shared {
        /// Owner of the shared buffer.
        origin: Value,
    },
}

/// Hash payload.
#[derive(Debug, Default)]
pub struct HashBody {
    /// Key/value pairs.
    pub entries: Vec<(Value, Value)>,
    /// Default value yielded on missing keys.
    pub default: Value,
}

/// Syntax tree node kinds.
///
/// Each kind has a fixed shape declaring which of the three payload slots
/// hold child references; everything else in a node is non-reference data
/// owned by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NodeKind {
    // All three slots are children.
    If,
    For,
    When,
    Rescue,
    ClassDef,
    // First and third.
    Block,
    List,
    Call,
    Ensure,
    MethodDefn,
    // Third only.
    Super,
    // First and second.
    While,
    Until,
    And,
    Or,
    ModuleDef,
    // Second only.
    MethodRef,
    Not,
    Assign,
    // First only.
    Literal,
    StrLit,
    Return,
    Yield,
    Splat,
    // Second and third.
    Scope,
    Decl,
    // Leaves.
    SelfRef,
    NilLit,
    Redo,
    Retry,
}

impl NodeKind {
    /// Which of the three payload slots are child references.
    #[must_use]
    pub const fn shape(self) -> [bool; 3] {
        match self {
            Self::If | Self::For | Self::When | Self::Rescue | Self::ClassDef => {
                [true, true, true]
            }
            Self::Block | Self::List | Self::Call | Self::Ensure | Self::MethodDefn => {
                [true, false, true]
            }
            Self::Super => [false, false, true],
            Self::While | Self::Until | Self::And | Self::Or | Self::ModuleDef => {
                [true, true, false]
            }
            Self::MethodRef | Self::Not | Self::Assign => [false, true, false],
            Self::Literal | Self::StrLit | Self::Return | Self::Yield | Self::Splat => {
                [true, false, false]
            }
            Self::Scope | Self::Decl => [false, true, true],
            Self::SelfRef | Self::NilLit | Self::Redo | Self::Retry => {
                [false, false, false]
            }
        }
    }
}

/// Syntax tree node payload.
#[derive(Debug)]
pub struct NodeBody {
    /// Node kind, which fixes the child shape.
    pub kind: NodeKind,
    /// Interned source filename the node was parsed from.
    pub file: FileName,
    /// Payload slots; only the ones named by the shape are references.
    pub refs: [Value; 3],
}

/// Open file payload. The handle is the external resource; dropping it is
/// the native destructor.
#[derive(Debug, Default)]
pub struct FileBody {
    /// The open handle, `None` once closed.
    pub handle: Option<std::fs::File>,
}

/// Child-enumeration callback for extension data: receives the payload and a
/// sink to report each owned reference into.
pub type DataMarkFn = fn(&dyn Any, &mut dyn FnMut(Value));

/// Resource-release callback for extension data, run before the payload is
/// dropped.
pub type DataReleaseFn = fn(&mut dyn Any);

/// Extension-supplied payload.
pub struct DataBody {
    /// Opaque extension state.
    pub payload: Box<dyn Any>,
    /// Enumerates owned references, if the payload holds any.
    pub mark: Option<DataMarkFn>,
    /// Releases owned external resources, if the payload holds any.
    pub release: Option<DataReleaseFn>,
}

impl std::fmt::Debug for DataBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBody")
            .field("mark", &self.mark.is_some())
            .field("release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

/// Kind-specific payload of a live object.
#[derive(Debug)]
pub enum ObjectBody {
    /// Plain object.
    Object {
        /// Instance variables.
        ivars: IdentTable,
    },
    /// Class or module.
    Class(ClassBody),
    /// Array.
    Array(ArrayBody),
    /// Hash.
    Hash(HashBody),
    /// String.
    Str(StrBody),
    /// Struct record.
    Struct {
        /// Field values in declaration order.
        fields: Box<[Value]>,
    },
    /// Syntax tree node.
    Node(NodeBody),
    /// Float.
    Float(f64),
    /// Bignum.
    Bignum {
        /// Magnitude digits, least significant first.
        digits: Box<[u32]>,
        /// Sign.
        negative: bool,
    },
    /// Regexp.
    Regexp {
        /// Pattern source.
        source: Box<str>,
    },
    /// File.
    File(FileBody),
    /// Extension data.
    Data(DataBody),
}

impl ObjectBody {
    /// The kind discriminant for this payload.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Object { .. } => Kind::Object,
            Self::Class(c) => {
                if c.module {
                    Kind::Module
                } else {
                    Kind::Class
                }
            }
            Self::Array(_) => Kind::Array,
            Self::Hash(_) => Kind::Hash,
            Self::Str(_) => Kind::Str,
            Self::Struct { .. } => Kind::Struct,
            Self::Node(_) => Kind::Node,
            Self::Float(_) => Kind::Float,
            Self::Bignum { .. } => Kind::Bignum,
            Self::Regexp { .. } => Kind::Regexp,
            Self::File(_) => Kind::File,
            Self::Data(_) => Kind::Data,
        }
    }

    /// Whether the payload's buffer is shared with another object.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(
            self,
            Self::Array(ArrayBody::Shared { .. }) | Self::Str(StrBody::Shared { .. })
        )
    }

    /// Rough byte count of heap memory the payload owns outside its slot,
    /// fed into the adaptive allocation accounting.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        match self {
            Self::Object { ivars } | Self::Class(ClassBody { ivars, .. }) => {
                ivars.len() * std::mem::size_of::<(Ident, Value)>()
            }
            Self::Array(ArrayBody::Owned(elems)) => {
                elems.capacity() * std::mem::size_of::<Value>()
            }
            Self::Hash(h) => h.entries.capacity() * std::mem::size_of::<(Value, Value)>(),
            Self::Str(StrBody::Owned(s)) => s.len(),
            Self::Struct { fields } => fields.len() * std::mem::size_of::<Value>(),
            Self::Bignum { digits, .. } => digits.len() * std::mem::size_of::<u32>(),
            Self::Regexp { source } => source.len(),
            _ => 0,
        }
    }
}

// ============================================================================
// Slot
// ============================================================================

/// State of one heap slot.
#[derive(Debug)]
pub enum SlotBody {
    /// The slot is free; `next` is the intrusive free-list link.
    Free {
        /// Next free slot.
        next: Option<SlotRef>,
    },
    /// Freshly allocated: the slot is claimed but its payload has not been
    /// installed yet. The overflow fallback scan must not descend into it.
    Reserved,
    /// A live object.
    Live {
        /// The object's class, `Value::Nil` for internal objects.
        class: Value,
        /// Kind-specific payload.
        body: ObjectBody,
    },
}

/// One fixed-size heap slot.
#[derive(Debug)]
pub struct Slot {
    flags: Cell<SlotFlags>,
    body: SlotBody,
}

impl Slot {
    pub(crate) const fn new_free(next: Option<SlotRef>) -> Self {
        Self {
            flags: Cell::new(SlotFlags::empty()),
            body: SlotBody::Free { next },
        }
    }

    pub(crate) const fn new_reserved() -> Self {
        Self {
            flags: Cell::new(SlotFlags::empty()),
            body: SlotBody::Reserved,
        }
    }

    /// Current attribute bits.
    #[must_use]
    pub fn flags(&self) -> SlotFlags {
        self.flags.get()
    }

    /// Whether all bits in `mask` are set.
    #[must_use]
    pub fn test_flag(&self, mask: u32) -> bool {
        self.flags.get().test(mask)
    }

    /// Set the bits in `mask`.
    pub fn set_flag(&self, mask: u32) {
        self.flags.set(self.flags.get().with(mask));
    }

    /// Clear the bits in `mask`.
    pub fn unset_flag(&self, mask: u32) {
        self.flags.set(self.flags.get().without(mask));
    }

    /// Clear every attribute bit, skipping the write when already clear.
    pub(crate) fn clear_flags(&self) {
        if !self.flags.get().is_empty() {
            self.flags.set(SlotFlags::empty());
        }
    }

    /// The slot body.
    #[must_use]
    pub const fn body(&self) -> &SlotBody {
        &self.body
    }

    /// Mutable access to the slot body.
    pub(crate) const fn body_mut(&mut self) -> &mut SlotBody {
        &mut self.body
    }

    /// Whether the slot is on the free list.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.body, SlotBody::Free { .. })
    }

    /// Whether the slot is allocated but not yet populated.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self.body, SlotBody::Reserved)
    }

    /// Whether the slot holds a live object.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.body, SlotBody::Live { .. })
    }

    /// Kind of the live object, `None` for free or reserved slots.
    #[must_use]
    pub const fn kind(&self) -> Option<Kind> {
        match &self.body {
            SlotBody::Live { body, .. } => Some(body.kind()),
            _ => None,
        }
    }

    /// Class of the live object, `None` for free or reserved slots.
    #[must_use]
    pub const fn class(&self) -> Option<Value> {
        match &self.body {
            SlotBody::Live { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Free-list link, `None` when the slot is not free.
    pub(crate) const fn free_next(&self) -> Option<Option<SlotRef>> {
        match &self.body {
            SlotBody::Free { next } => Some(*next),
            _ => None,
        }
    }

    /// Turn the slot into a free slot linked to `next`, writing only what
    /// actually changes so untouched free slots never dirty their page.
    pub(crate) fn relink_free(&mut self, next: Option<SlotRef>) {
        match &mut self.body {
            SlotBody::Free { next: n } => {
                if *n != next {
                    *n = next;
                }
            }
            _ => self.body = SlotBody::Free { next },
        }
    }

    /// Release the resources a live object owns, leaving the slot's body
    /// free (unlinked) but its flags untouched.
    ///
    /// Extension data runs its release callback first; files close their
    /// handle; every other kind's resources are dropped with the payload.
    /// Shared buffers are not touched: they belong to the origin object.
    pub(crate) fn release_owned(&mut self) {
        let body = std::mem::replace(&mut self.body, SlotBody::Free { next: None });
        if let SlotBody::Live {
            body: ObjectBody::Data(mut data),
            ..
        } = body
        {
            if let Some(release) = data.release {
                release(data.payload.as_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ArrayBody, NodeKind, ObjectBody, Slot, SlotFlags, StrBody};
    use crate::value::Value;

    #[test]
    fn flags_are_independent_bits() {
        let slot = Slot::new_free(None);
        assert!(slot.flags().is_empty());
        slot.set_flag(SlotFlags::MARK);
        slot.set_flag(SlotFlags::FINALIZE);
        assert!(slot.test_flag(SlotFlags::MARK));
        assert!(slot.test_flag(SlotFlags::FINALIZE));
        assert!(!slot.test_flag(SlotFlags::SINGLETON));
        slot.unset_flag(SlotFlags::MARK);
        assert!(!slot.test_flag(SlotFlags::MARK));
        assert!(slot.test_flag(SlotFlags::FINALIZE));
    }

    #[test]
    fn leaf_node_kinds_have_no_children() {
        assert_eq!(NodeKind::Retry.shape(), [false, false, false]);
        assert_eq!(NodeKind::If.shape(), [true, true, true]);
        assert_eq!(NodeKind::Scope.shape(), [false, true, true]);
    }

    #[test]
    fn shared_payloads_report_sharing() {
        let shared = ObjectBody::Array(ArrayBody::Shared { origin: Value::Nil });
        assert!(shared.is_shared());
        let owned = ObjectBody::Str(StrBody::Owned("x".into()));
        assert!(!owned.is_shared());
    }

    #[test]
    fn relink_is_idempotent_on_free_slots() {
        let mut slot = Slot::new_free(None);
        slot.relink_free(None);
        assert_eq!(slot.free_next(), Some(None));
    }
}
