//! Stable identifiers for the threads seen in a capture.

use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

/// Dense per-run thread identifier, minted in order of first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered thread and the name it was first seen with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadEntry {
    pub id: ThreadId,
    pub pid: u32,
    pub tid: u32,
    pub name: String,
}

/// Maps `(pid, tid)` pairs to stable ids and display names.
///
/// The first reported command name wins; perf reports a new `comm` after
/// `exec` or `prctl(PR_SET_NAME)`, but renaming a track halfway through a
/// trace would split it, so later names are ignored.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    ids: HashMap<(u32, u32), ThreadId>,
    entries: Vec<ThreadEntry>,
    process_names: HashMap<u32, String>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or mint the id for a thread.
    pub fn resolve(&mut self, pid: u32, tid: u32, command: &str) -> ThreadId {
        match self.ids.entry((pid, tid)) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                let known = &self.entries[id.0 as usize].name;
                if known != command {
                    log::debug!(
                        "thread {pid}/{tid} reported as '{command}', keeping '{known}'"
                    );
                }
                id
            }
            Entry::Vacant(entry) => {
                let id = ThreadId(self.entries.len() as u32);
                entry.insert(id);
                self.entries.push(ThreadEntry {
                    id,
                    pid,
                    tid,
                    name: command.to_string(),
                });
                self.process_names
                    .entry(pid)
                    .or_insert_with(|| command.to_string());
                id
            }
        }
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Display name for a process: the name of its first observed thread.
    pub fn process_name(&self, pid: u32) -> Option<&str> {
        self.process_names.get(&pid).map(String::as_str)
    }
}
