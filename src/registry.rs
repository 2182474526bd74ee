//! Client-wide table of opened indexes.
//!
//! The registry is the single source of truth for which index ids exist.
//! Sessions only remember which ids they have opened themselves; on reconnect
//! the supervisor replays every confirmed registration onto the fresh session.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{HsError, HsResult};

/// The (database, table, index, columns) tuple bound to an index id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexDescriptor {
    pub index_id: i32,
    pub database: String,
    pub table: String,
    pub index_name: String,
    pub columns: Vec<String>,
}

impl IndexDescriptor {
    /// Build a descriptor, rejecting anything the server could never open
    pub fn new<S: AsRef<str>>(
        index_id: i32,
        database: &str,
        table: &str,
        index_name: &str,
        columns: &[S],
    ) -> HsResult<Self> {
        if index_id <= 0 {
            return Err(HsError::invalid(format!(
                "index id must be positive, got {}",
                index_id
            )));
        }
        if database.is_empty() {
            return Err(HsError::invalid("database name must not be empty"));
        }
        if table.is_empty() {
            return Err(HsError::invalid("table name must not be empty"));
        }
        if index_name.is_empty() {
            return Err(HsError::invalid("index name must not be empty"));
        }
        if columns.is_empty() {
            return Err(HsError::invalid("at least one column is required"));
        }
        if columns.iter().any(|c| c.as_ref().is_empty()) {
            return Err(HsError::invalid("column names must not be empty"));
        }

        Ok(Self {
            index_id,
            database: database.to_string(),
            table: table.to_string(),
            index_name: index_name.to_string(),
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
        })
    }

    /// Position of a column in the opened column list
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({}) [{}]",
            self.database,
            self.table,
            self.index_name,
            self.columns.join(",")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The id was unknown and is now bound, pending its first server ack
    New,
    /// The id was already bound to an identical descriptor
    Existing,
}

pub(crate) struct Entry {
    descriptor: Arc<IndexDescriptor>,
    confirmed: bool,
}

/// Index ids bound by `open_index`.
///
/// A registration starts out pending. Only once a server has accepted the
/// open is it confirmed, and only confirmed entries are visible to callers
/// and replayed onto reconnecting sessions. Pending entries still reserve
/// their id against conflicting descriptors.
#[derive(Default)]
pub struct IndexRegistry {
    entries: RwLock<BTreeMap<i32, Entry>>,
    generation: AtomicU64,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: IndexDescriptor) -> HsResult<Registration> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&descriptor.index_id) {
            if *existing.descriptor == descriptor {
                return Ok(Registration::Existing);
            }
            return Err(conflict(&descriptor, &existing.descriptor));
        }
        entries.insert(
            descriptor.index_id,
            Entry {
                descriptor: Arc::new(descriptor),
                confirmed: false,
            },
        );
        Ok(Registration::New)
    }

    /// Mark the descriptor as accepted by the server.
    ///
    /// Re-binds the id if a failed concurrent open already dropped the
    /// pending entry.
    pub(crate) fn confirm(&self, descriptor: &IndexDescriptor) -> HsResult<()> {
        let mut entries = self.entries.write();
        match entries.get_mut(&descriptor.index_id) {
            Some(entry) if *entry.descriptor != *descriptor => {
                Err(conflict(descriptor, &entry.descriptor))
            }
            Some(entry) if entry.confirmed => Ok(()),
            Some(entry) => {
                entry.confirmed = true;
                self.generation.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => {
                entries.insert(
                    descriptor.index_id,
                    Entry {
                        descriptor: Arc::new(descriptor.clone()),
                        confirmed: true,
                    },
                );
                self.generation.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Drop a registration whose first open failed.
    ///
    /// Confirmed entries are kept: another caller already had the open
    /// accepted. Returns whether the entry was removed.
    pub(crate) fn rollback(&self, index_id: i32) -> bool {
        let mut entries = self.entries.write();
        if entries.get(&index_id).is_some_and(|e| !e.confirmed) {
            entries.remove(&index_id);
            return true;
        }
        false
    }

    pub fn describe(&self, index_id: i32) -> HsResult<Arc<IndexDescriptor>> {
        self.entries
            .read()
            .get(&index_id)
            .filter(|e| e.confirmed)
            .map(|e| e.descriptor.clone())
            .ok_or(HsError::IndexNotOpened(index_id))
    }

    pub fn contains(&self, index_id: i32) -> bool {
        self.entries.read().get(&index_id).is_some_and(|e| e.confirmed)
    }

    /// Whether the id is reserved by an open that has not been accepted yet
    pub fn is_pending(&self, index_id: i32) -> bool {
        self.entries.read().get(&index_id).is_some_and(|e| !e.confirmed)
    }

    pub fn for_each<F: FnMut(&IndexDescriptor)>(&self, mut f: F) {
        for entry in self.entries.read().values().filter(|e| e.confirmed) {
            f(&entry.descriptor);
        }
    }

    /// Copy of every confirmed descriptor, ordered by index id
    pub fn snapshot(&self) -> Vec<Arc<IndexDescriptor>> {
        self.versioned_snapshot().1
    }

    /// Confirmed descriptors together with the generation they belong to
    pub fn versioned_snapshot(&self) -> (u64, Vec<Arc<IndexDescriptor>>) {
        let entries = self.entries.read();
        let descriptors = entries
            .values()
            .filter(|e| e.confirmed)
            .map(|e| e.descriptor.clone())
            .collect();
        (self.generation.load(Ordering::SeqCst), descriptors)
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| e.confirmed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped whenever the confirmed set changes
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Generation read under a shared lock that is held until the guard is
    /// dropped, so no confirmation can land while a session is promoted.
    pub(crate) fn hold_generation(&self) -> (RwLockReadGuard<'_, BTreeMap<i32, Entry>>, u64) {
        let guard = self.entries.read();
        let generation = self.generation.load(Ordering::SeqCst);
        (guard, generation)
    }
}

fn conflict(wanted: &IndexDescriptor, existing: &IndexDescriptor) -> HsError {
    HsError::IndexConflict {
        id: wanted.index_id,
        existing: existing.to_string(),
    }
}
