//! Interned source filenames.
//!
//! Syntax tree nodes reference the file they were parsed from. The strings
//! live outside any arena and are deduplicated here; the mark phase reports
//! them through the mark table's filename channel and the sweep phase drops
//! the entries no surviving node references.

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::mark_table::MarkTable;

/// One interned filename entry. Boxed so its address is stable; the inline
/// strategy stores the mark directly in the entry, the bitfield strategy
/// keys its pointer set by the entry's address.
#[derive(Debug)]
pub(crate) struct FileEntry {
    marked: Cell<bool>,
    name: Box<str>,
}

/// Handle to an interned filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileName(NonNull<FileEntry>);

impl FileName {
    /// Stable address of the entry, used as its pointer-set key.
    #[must_use]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The interned string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // SAFETY: entries are owned by the collector's filename table and
        // outlive every node referencing them; sweep only drops entries no
        // live node can name.
        unsafe { &self.0.as_ref().name }
    }

    pub(crate) fn set_marked(self, marked: bool) {
        // SAFETY: as in `as_str`.
        unsafe { self.0.as_ref().marked.set(marked) };
    }

    pub(crate) fn is_marked(self) -> bool {
        // SAFETY: as in `as_str`.
        unsafe { self.0.as_ref().marked.get() }
    }
}

/// Filename interner with a mark-channel sweep.
#[derive(Debug, Default)]
pub(crate) struct SourceFileTable {
    entries: HashMap<Box<str>, Box<FileEntry>>,
    /// The file currently being compiled, always treated as live.
    current: Option<FileName>,
}

impl SourceFileTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning the canonical handle for it.
    pub(crate) fn intern(&mut self, name: &str) -> FileName {
        if let Some(entry) = self.entries.get(name) {
            return FileName(NonNull::from(&**entry));
        }
        let entry = Box::new(FileEntry {
            marked: Cell::new(false),
            name: name.into(),
        });
        let handle = FileName(NonNull::from(&*entry));
        self.entries.insert(name.into(), entry);
        handle
    }

    pub(crate) const fn set_current(&mut self, file: Option<FileName>) {
        self.current = file;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Mark the in-flight compilation's filename before sweeping.
    pub(crate) fn mark_current(&self, table: &mut dyn MarkTable) {
        if let Some(file) = self.current {
            table.add_filename(file);
        }
    }

    /// Drop every entry the mark phase did not reach, clearing the mark of
    /// the survivors.
    pub(crate) fn sweep(&mut self, table: &mut dyn MarkTable) {
        self.entries.retain(|_, entry| {
            let handle = FileName(NonNull::from(&**entry));
            let live = table.contains_filename(handle);
            table.remove_filename(handle);
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::SourceFileTable;

    #[test]
    fn intern_deduplicates() {
        let mut table = SourceFileTable::new();
        let a = table.intern("main.lm");
        let b = table.intern("main.lm");
        let c = table.intern("lib.lm");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(a.as_str(), "main.lm");
    }
}
