//! Environment-gated heap debugging support.
//!
//! These switches exist to observe the collector's copy-on-write behavior
//! from outside: pausing before/after phases makes it possible to snapshot
//! dirty-page counts, and file-backed arenas expose arena memory to
//! inspection tooling. All of them are read once at collector creation.
//!
//! | Variable | Effect |
//! |---|---|
//! | `LOAM_GC_TERMINAL` | append prompts/logs to this file instead of stderr |
//! | `LOAM_GC_ALLOC_ARENA_WITH_FILE` | back arenas with `/dev/zero` mappings |
//! | `LOAM_GC_PROMPT_BEFORE_GC` | wait for Enter before marking |
//! | `LOAM_GC_PROMPT_BEFORE_SWEEP` | wait for Enter before sweeping |
//! | `LOAM_GC_PROMPT_AFTER_SWEEP` | wait for Enter after sweeping |
//! | `LOAM_GC_PRINT_SWEPT_OBJECTS` | log every swept slot address |

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Read, Write};

fn option_enabled(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0")
}

/// Debugging switches, captured from the environment.
#[derive(Debug, Default)]
pub(crate) struct DebugOptions {
    terminal: Option<RefCell<File>>,
    pub alloc_arena_with_file: bool,
    pub prompt_before_gc: bool,
    pub prompt_before_sweep: bool,
    pub prompt_after_sweep: bool,
    pub print_swept_objects: bool,
}

impl DebugOptions {
    pub(crate) fn from_env() -> Self {
        let terminal = std::env::var("LOAM_GC_TERMINAL").ok().and_then(|path| {
            match OpenOptions::new().append(true).read(true).open(&path) {
                Ok(file) => Some(RefCell::new(file)),
                Err(err) => {
                    eprintln!("cannot open {path}: {err}");
                    None
                }
            }
        });
        Self {
            terminal,
            alloc_arena_with_file: option_enabled("LOAM_GC_ALLOC_ARENA_WITH_FILE"),
            prompt_before_gc: option_enabled("LOAM_GC_PROMPT_BEFORE_GC"),
            prompt_before_sweep: option_enabled("LOAM_GC_PROMPT_BEFORE_SWEEP"),
            prompt_after_sweep: option_enabled("LOAM_GC_PROMPT_AFTER_SWEEP"),
            print_swept_objects: option_enabled("LOAM_GC_PRINT_SWEPT_OBJECTS"),
        }
    }

    /// Write a line to the debug terminal, or stderr without one.
    pub(crate) fn print(&self, message: &str) {
        match &self.terminal {
            Some(terminal) => {
                let mut terminal = terminal.borrow_mut();
                let _ = writeln!(terminal, "{message}");
                let _ = terminal.flush();
            }
            None => {
                eprintln!("{message}");
            }
        }
    }

    /// Show `prompt` and block until the operator presses Enter.
    pub(crate) fn prompt(&self, prompt: &str) {
        match &self.terminal {
            Some(terminal) => {
                let mut terminal = terminal.borrow_mut();
                let _ = write!(terminal, "{prompt}");
                let _ = terminal.flush();
                let mut byte = [0u8; 1];
                while terminal.read(&mut byte).is_ok_and(|n| n == 1) && byte[0] != b'\n' {}
            }
            None => {
                eprint!("{prompt}");
                let _ = std::io::stderr().flush();
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
            }
        }
    }
}
