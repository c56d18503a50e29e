use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::raft_storage::{read_json, write_json_atomic};
use crate::{Command, LogIndex};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<E> {
    /// Unique across the cluster. Minted by the leader from a nanosecond
    /// timestamp, so indexes are ordered but not contiguous.
    pub index: LogIndex,
    pub data: E,
    /// Set once a majority has acknowledged the entry.
    pub commit: bool,
}

impl<E> LogEntry<E> {
    pub fn new(index: LogIndex, data: E) -> Self {
        LogEntry {
            index,
            data,
            commit: false,
        }
    }

    pub fn committed(mut self) -> Self {
        self.commit = true;
        self
    }
}

pub trait Log: Send + 'static {
    type Command: crate::Command;

    fn get(&self, index: LogIndex) -> Option<&LogEntry<Self::Command>>;
    fn last_index(&self) -> LogIndex;
    fn len(&self) -> usize;
    fn iter(&self) -> Box<dyn Iterator<Item = &LogEntry<Self::Command>> + '_>;

    /// Inserts the entry, or merges it into the one already stored at the
    /// same index: the stored payload is kept and `commit` only goes
    /// false -> true.
    fn upsert(&mut self, entry: LogEntry<Self::Command>) -> Result<(), RaftError>;

    /// Drops every entry with `index <= upto`. Returns how many were removed.
    fn discard_up_to(&mut self, upto: LogIndex) -> Result<usize, RaftError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Volatile log.
#[derive(Clone, Debug)]
pub struct MemLog<E> {
    entries: BTreeMap<LogIndex, LogEntry<E>>,
}

impl<E> MemLog<E> {
    pub fn new() -> Self {
        MemLog {
            entries: BTreeMap::new(),
        }
    }

    fn from_entries(entries: Vec<LogEntry<E>>) -> Self {
        let mut log = MemLog::new();
        for entry in entries {
            log.merge(entry);
        }
        log
    }

    fn merge(&mut self, entry: LogEntry<E>) {
        match self.entries.get_mut(&entry.index) {
            Some(existing) => existing.commit |= entry.commit,
            None => {
                self.entries.insert(entry.index, entry);
            }
        }
    }

    fn remove_up_to(&mut self, upto: LogIndex) -> usize {
        let before = self.entries.len();
        self.entries = match upto.checked_add(1) {
            Some(first_kept) => self.entries.split_off(&first_kept),
            None => BTreeMap::new(),
        };
        before - self.entries.len()
    }
}

impl<E> Default for MemLog<E> {
    fn default() -> Self {
        MemLog::new()
    }
}

impl<E: Command> Log for MemLog<E> {
    type Command = E;

    fn get(&self, index: LogIndex) -> Option<&LogEntry<E>> {
        self.entries.get(&index)
    }

    fn last_index(&self) -> LogIndex {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &LogEntry<E>> + '_> {
        Box::new(self.entries.values())
    }

    fn upsert(&mut self, entry: LogEntry<E>) -> Result<(), RaftError> {
        self.merge(entry);
        Ok(())
    }

    fn discard_up_to(&mut self, upto: LogIndex) -> Result<usize, RaftError> {
        Ok(self.remove_up_to(upto))
    }
}

/// Log mirrored to a JSON file, rewritten whole on every mutation.
#[derive(Debug)]
pub struct FileLog<E> {
    path: PathBuf,
    mem: MemLog<E>,
}

impl<E: Command> FileLog<E> {
    /// Loads the log at `path`; a missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RaftError> {
        let path = path.into();
        let entries: Vec<LogEntry<E>> = read_json(&path)?.unwrap_or_default();
        log::debug!("Loaded {} log entries from {}", entries.len(), path.display());
        Ok(FileLog {
            path,
            mem: MemLog::from_entries(entries),
        })
    }

    /// Writes `next` to disk and only then makes it the live log, so a
    /// failed write leaves memory matching the file.
    fn replace(&mut self, next: MemLog<E>) -> Result<(), RaftError> {
        let entries: Vec<&LogEntry<E>> = next.entries.values().collect();
        write_json_atomic(&self.path, &entries)?;
        self.mem = next;
        Ok(())
    }
}

impl<E: Command> Log for FileLog<E> {
    type Command = E;

    fn get(&self, index: LogIndex) -> Option<&LogEntry<E>> {
        self.mem.get(index)
    }

    fn last_index(&self) -> LogIndex {
        self.mem.last_index()
    }

    fn len(&self) -> usize {
        self.mem.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &LogEntry<E>> + '_> {
        self.mem.iter()
    }

    fn upsert(&mut self, entry: LogEntry<E>) -> Result<(), RaftError> {
        if let Some(existing) = self.mem.get(entry.index) {
            if existing.commit || !entry.commit {
                // nothing would change on disk
                return Ok(());
            }
        }
        let mut next = self.mem.clone();
        next.merge(entry);
        self.replace(next)
    }

    fn discard_up_to(&mut self, upto: LogIndex) -> Result<usize, RaftError> {
        let mut next = self.mem.clone();
        let removed = next.remove_up_to(upto);
        if removed > 0 {
            self.replace(next)?;
        }
        Ok(removed)
    }
}
