//! File persistence and the cluster term table.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RaftError;
use crate::{NodeId, Term};

/// Writes `value` as pretty JSON to a sibling temp file, syncs it, then
/// renames it over `path`. Readers see either the old or the new content.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), RaftError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| RaftError::persistence(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| RaftError::persistence(dir, e))?;
        }
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let write = || -> io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    write().map_err(|e| RaftError::persistence(path, e))
}

/// `Ok(None)` when the file does not exist yet.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RaftError> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RaftError::persistence(path, e)),
    };
    serde_json::from_slice(&blob)
        .map(Some)
        .map_err(|e| RaftError::persistence(path, io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Durable `NodeId -> Term` table.
///
/// One table can be shared by every node living in the same process; the
/// consensus layer only ever reads and writes its own row, peers' terms
/// travel inside messages. Every `set` rewrites the whole table atomically
/// before returning.
#[derive(Debug)]
pub struct TermStore {
    path: Option<PathBuf>,
    terms: Mutex<BTreeMap<NodeId, Term>>,
}

impl TermStore {
    /// Opens (or creates) the table at `path`. Members absent from an
    /// existing file start at term 0.
    pub fn open(
        path: impl Into<PathBuf>,
        members: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self, RaftError> {
        let path = path.into();
        let mut terms: BTreeMap<NodeId, Term> = read_json(&path)?.unwrap_or_default();
        for id in members {
            terms.entry(id).or_insert(0);
        }
        write_json_atomic(&path, &terms)?;

        log::debug!("Loaded term table {} with {} members", path.display(), terms.len());
        Ok(TermStore {
            path: Some(path),
            terms: Mutex::new(terms),
        })
    }

    /// Volatile table, for tests.
    pub fn in_memory(members: impl IntoIterator<Item = NodeId>) -> Self {
        TermStore {
            path: None,
            terms: Mutex::new(members.into_iter().map(|id| (id, 0)).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NodeId, Term>> {
        self.terms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: NodeId) -> Result<Term, RaftError> {
        self.lock().get(&id).copied().ok_or(RaftError::UnknownNode(id))
    }

    pub fn set(&self, id: NodeId, term: Term) -> Result<(), RaftError> {
        let mut terms = self.lock();
        let slot = terms.get_mut(&id).ok_or(RaftError::UnknownNode(id))?;
        let previous = *slot;
        *slot = term;

        if let Some(path) = &self.path {
            if let Err(e) = write_json_atomic(path, &*terms) {
                // keep memory in step with what is on disk
                terms.insert(id, previous);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.lock().keys().copied().collect()
    }
}
