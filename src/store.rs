//! # Store Module
//!
//! The relational store behind the registry: sourceable tables, source tables,
//! association links and registry entries. Reads go through [`Predicate`]s and
//! point lookups; writes go through an atomic [`UnitOfWork`].

use crate::error::{ProvenanceError, Result};
use crate::model::{EntryId, RegistryEntry, Source, SourceKind, SourceableRef};
use crate::query::Predicate;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single write inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    InsertSourceable(SourceableRef),
    /// Deletes the row; `cascade` also drops its registry entry
    DeleteSourceable {
        sourceable: SourceableRef,
        cascade: bool,
    },
    InsertSource(Source),
    DeleteSource(Source),
    Link {
        sourceable: SourceableRef,
        association: String,
        target: SourceableRef,
    },
    Unlink {
        sourceable: SourceableRef,
        association: String,
        target: SourceableRef,
    },
    /// Insert or replace the entry for `entry.sourceable`
    PutEntry(RegistryEntry),
    DeleteEntry(SourceableRef),
    SetCacheFlag {
        sourceable: SourceableRef,
        column: String,
        value: bool,
    },
}

/// Ordered writes committed all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOfWork {
    writes: Vec<Write>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn insert_sourceable(&mut self, sourceable: SourceableRef) -> &mut Self {
        self.push(Write::InsertSourceable(sourceable))
    }

    pub fn delete_sourceable(&mut self, sourceable: SourceableRef, cascade: bool) -> &mut Self {
        self.push(Write::DeleteSourceable {
            sourceable,
            cascade,
        })
    }

    pub fn insert_source(&mut self, source: Source) -> &mut Self {
        self.push(Write::InsertSource(source))
    }

    pub fn delete_source(&mut self, source: Source) -> &mut Self {
        self.push(Write::DeleteSource(source))
    }

    pub fn link(
        &mut self,
        sourceable: SourceableRef,
        association: impl Into<String>,
        target: SourceableRef,
    ) -> &mut Self {
        self.push(Write::Link {
            sourceable,
            association: association.into(),
            target,
        })
    }

    pub fn unlink(
        &mut self,
        sourceable: SourceableRef,
        association: impl Into<String>,
        target: SourceableRef,
    ) -> &mut Self {
        self.push(Write::Unlink {
            sourceable,
            association: association.into(),
            target,
        })
    }

    pub fn put_entry(&mut self, entry: RegistryEntry) -> &mut Self {
        self.push(Write::PutEntry(entry))
    }

    pub fn delete_entry(&mut self, sourceable: SourceableRef) -> &mut Self {
        self.push(Write::DeleteEntry(sourceable))
    }

    pub fn set_cache_flag(
        &mut self,
        sourceable: SourceableRef,
        column: impl Into<String>,
        value: bool,
    ) -> &mut Self {
        self.push(Write::SetCacheFlag {
            sourceable,
            column: column.into(),
            value,
        })
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Storage interface used by the provenance layer.
///
/// Implementations must make [`commit`](ProvenanceStore::commit) atomic and must
/// evaluate predicates without handing rows back to the caller.
pub trait ProvenanceStore: Send + Sync {
    /// Registry entry of a sourceable, if any
    fn entry(&self, sourceable: &SourceableRef) -> Result<Option<RegistryEntry>>;

    fn sourceable_exists(&self, sourceable: &SourceableRef) -> Result<bool>;

    /// `None` when the row is missing; unset columns read as `false`
    fn cache_flag(&self, sourceable: &SourceableRef, column: &str) -> Result<Option<bool>>;

    /// Targets of an association that still exist
    fn association_targets(
        &self,
        sourceable: &SourceableRef,
        association: &str,
    ) -> Result<Vec<SourceableRef>>;

    /// Subset of `ids` still present in the table of `kind`
    fn existing_source_ids(&self, kind: SourceKind, ids: &BTreeSet<u64>)
        -> Result<BTreeSet<u64>>;

    /// Distinct sourceable types with at least one registry entry
    fn registry_types(&self) -> Result<Vec<String>>;

    /// Entries of `type_name` whose sourceable row no longer exists
    fn dangling_entries(&self, type_name: &str) -> Result<Vec<SourceableRef>>;

    /// Entries whose id-set for `kind` references at least one missing id
    fn entries_referencing_missing(&self, kind: SourceKind) -> Result<Vec<RegistryEntry>>;

    /// Ids of `type_name` rows matching the predicate, ascending
    fn select(&self, type_name: &str, predicate: &Predicate) -> Result<Vec<u64>>;

    fn count(&self, type_name: &str, predicate: &Predicate) -> Result<usize> {
        Ok(self.select(type_name, predicate)?.len())
    }

    fn entry_count(&self) -> Result<usize>;

    fn commit(&self, work: UnitOfWork) -> Result<()>;
}

/// Host-side row of a sourceable table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SourceableRow {
    pub flags: BTreeMap<String, bool>,
    pub associations: BTreeMap<String, BTreeSet<SourceableRef>>,
}

/// Final state of every key a unit of work touched; `None` means deleted
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    pub rows: BTreeMap<SourceableRef, Option<SourceableRow>>,
    pub sources: BTreeMap<Source, bool>,
    pub entries: BTreeMap<SourceableRef, Option<RegistryEntry>>,
    pub next_entry_id: u64,
}

#[derive(Debug, Clone)]
struct StoreState {
    tables: HashMap<String, BTreeMap<u64, SourceableRow>>,
    sources: HashMap<SourceKind, BTreeSet<u64>>,
    entries: HashMap<SourceableRef, RegistryEntry>,
    /// sourceable_type -> sourceable ids with an entry
    entries_by_type: HashMap<String, BTreeSet<u64>>,
    /// (sourceable_type, source) -> sourceable ids; membership index over the id-sets
    entries_by_source: HashMap<(String, Source), BTreeSet<u64>>,
    next_entry_id: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            sources: HashMap::new(),
            entries: HashMap::new(),
            entries_by_type: HashMap::new(),
            entries_by_source: HashMap::new(),
            next_entry_id: 1,
        }
    }
}

impl StoreState {
    fn row(&self, sourceable: &SourceableRef) -> Option<&SourceableRow> {
        self.tables
            .get(&sourceable.type_name)
            .and_then(|table| table.get(&sourceable.id))
    }

    fn source_exists(&self, source: &Source) -> bool {
        self.sources
            .get(&source.kind())
            .is_some_and(|ids| ids.contains(&source.id()))
    }

    /// Association targets are sources when their type names a source kind
    fn target_exists(&self, target: &SourceableRef) -> bool {
        match Source::from_target(target) {
            Some(source) => self.source_exists(&source),
            None => self.row(target).is_some(),
        }
    }

    fn has_live_target(&self, row: &SourceableRow, association: &str) -> bool {
        row.associations
            .get(association)
            .is_some_and(|targets| targets.iter().any(|target| self.target_exists(target)))
    }

    /// Only targets that are existing sources count
    fn has_live_source(&self, row: &SourceableRow, association: &str) -> bool {
        row.associations.get(association).is_some_and(|targets| {
            targets
                .iter()
                .filter_map(Source::from_target)
                .any(|source| self.source_exists(&source))
        })
    }

    fn staged_row(&self, changes: &ChangeSet, sourceable: &SourceableRef) -> Option<SourceableRow> {
        match changes.rows.get(sourceable) {
            Some(staged) => staged.clone(),
            None => self.row(sourceable).cloned(),
        }
    }

    fn staged_entry(
        &self,
        changes: &ChangeSet,
        sourceable: &SourceableRef,
    ) -> Option<RegistryEntry> {
        match changes.entries.get(sourceable) {
            Some(staged) => staged.clone(),
            None => self.entries.get(sourceable).cloned(),
        }
    }

    /// Validate every write and compute the resulting state of touched keys.
    /// Nothing is mutated, so a failed unit of work leaves no trace.
    fn stage(&self, work: UnitOfWork) -> Result<ChangeSet> {
        let mut changes = ChangeSet {
            next_entry_id: self.next_entry_id,
            ..ChangeSet::default()
        };

        for write in work.writes {
            match write {
                Write::InsertSourceable(sourceable) => {
                    require_type(&sourceable)?;
                    if self.staged_row(&changes, &sourceable).is_none() {
                        changes
                            .rows
                            .insert(sourceable, Some(SourceableRow::default()));
                    }
                }
                Write::DeleteSourceable {
                    sourceable,
                    cascade,
                } => {
                    if cascade {
                        changes.entries.insert(sourceable.clone(), None);
                    }
                    changes.rows.insert(sourceable, None);
                }
                Write::InsertSource(source) => {
                    changes.sources.insert(source, true);
                }
                Write::DeleteSource(source) => {
                    changes.sources.insert(source, false);
                }
                Write::Link {
                    sourceable,
                    association,
                    target,
                } => {
                    if association.is_empty() {
                        return Err(ProvenanceError::constraint(format!(
                            "link from {sourceable} requires an association name"
                        )));
                    }
                    let mut row = self.staged_row(&changes, &sourceable).ok_or_else(|| {
                        ProvenanceError::constraint(format!(
                            "cannot link {association} on missing sourceable {sourceable}"
                        ))
                    })?;
                    row.associations.entry(association).or_default().insert(target);
                    changes.rows.insert(sourceable, Some(row));
                }
                Write::Unlink {
                    sourceable,
                    association,
                    target,
                } => {
                    if let Some(mut row) = self.staged_row(&changes, &sourceable) {
                        if let Some(targets) = row.associations.get_mut(&association) {
                            targets.remove(&target);
                            if targets.is_empty() {
                                row.associations.remove(&association);
                            }
                        }
                        changes.rows.insert(sourceable, Some(row));
                    }
                }
                Write::PutEntry(mut entry) => {
                    require_type(&entry.sourceable)?;
                    if entry.sources.is_empty() {
                        return Err(ProvenanceError::constraint(format!(
                            "registry entry for {} would be empty",
                            entry.sourceable
                        )));
                    }
                    match self.staged_entry(&changes, &entry.sourceable) {
                        Some(existing) => {
                            entry.id = existing.id;
                            entry.created_at = existing.created_at;
                        }
                        None if entry.id.0 == 0 => {
                            entry.id = EntryId(changes.next_entry_id);
                            changes.next_entry_id += 1;
                        }
                        None => {
                            changes.next_entry_id = changes.next_entry_id.max(entry.id.0 + 1);
                        }
                    }
                    changes
                        .entries
                        .insert(entry.sourceable.clone(), Some(entry));
                }
                Write::DeleteEntry(sourceable) => {
                    changes.entries.insert(sourceable, None);
                }
                Write::SetCacheFlag {
                    sourceable,
                    column,
                    value,
                } => {
                    // An update of a missing row touches nothing
                    if let Some(mut row) = self.staged_row(&changes, &sourceable) {
                        row.flags.insert(column, value);
                        changes.rows.insert(sourceable, Some(row));
                    }
                }
            }
        }

        Ok(changes)
    }

    fn apply(&mut self, changes: ChangeSet) {
        for (sourceable, row) in changes.rows {
            match row {
                Some(row) => {
                    self.tables
                        .entry(sourceable.type_name)
                        .or_default()
                        .insert(sourceable.id, row);
                }
                None => {
                    if let Some(table) = self.tables.get_mut(&sourceable.type_name) {
                        table.remove(&sourceable.id);
                    }
                }
            }
        }

        for (source, present) in changes.sources {
            let ids = self.sources.entry(source.kind()).or_default();
            if present {
                ids.insert(source.id());
            } else {
                ids.remove(&source.id());
            }
        }

        for (sourceable, entry) in changes.entries {
            self.unindex(&sourceable);
            if let Some(entry) = entry {
                self.index(&entry);
                self.entries.insert(sourceable, entry);
            }
        }

        self.next_entry_id = self.next_entry_id.max(changes.next_entry_id);
    }

    fn index(&mut self, entry: &RegistryEntry) {
        let type_name = &entry.sourceable.type_name;
        let id = entry.sourceable.id;
        self.entries_by_type
            .entry(type_name.clone())
            .or_default()
            .insert(id);
        for source in entry.sources.iter() {
            self.entries_by_source
                .entry((type_name.clone(), source))
                .or_default()
                .insert(id);
        }
    }

    fn unindex(&mut self, sourceable: &SourceableRef) {
        let Some(old) = self.entries.remove(sourceable) else {
            return;
        };
        if let Some(ids) = self.entries_by_type.get_mut(&sourceable.type_name) {
            ids.remove(&sourceable.id);
            if ids.is_empty() {
                self.entries_by_type.remove(&sourceable.type_name);
            }
        }
        for source in old.sources.iter() {
            let key = (sourceable.type_name.clone(), source);
            if let Some(ids) = self.entries_by_source.get_mut(&key) {
                ids.remove(&sourceable.id);
                if ids.is_empty() {
                    self.entries_by_source.remove(&key);
                }
            }
        }
    }

    /// Keep only ids that are rows of `table`, which turns index lookups into joins
    fn join(ids: Option<&BTreeSet<u64>>, table: &BTreeMap<u64, SourceableRow>) -> BTreeSet<u64> {
        ids.map(|ids| {
            ids.iter()
                .copied()
                .filter(|id| table.contains_key(id))
                .collect()
        })
        .unwrap_or_default()
    }

    fn eval(
        &self,
        type_name: &str,
        table: &BTreeMap<u64, SourceableRow>,
        predicate: &Predicate,
    ) -> BTreeSet<u64> {
        match predicate {
            Predicate::All => table.keys().copied().collect(),
            Predicate::HasEntry => Self::join(self.entries_by_type.get(type_name), table),
            Predicate::CacheFlag { column, value } => table
                .iter()
                .filter(|(_, row)| row.flags.get(column).copied().unwrap_or(false) == *value)
                .map(|(id, _)| *id)
                .collect(),
            Predicate::SourcedBy(source) => Self::join(
                self.entries_by_source.get(&(type_name.to_string(), *source)),
                table,
            ),
            Predicate::Present { association } => table
                .iter()
                .filter(|(_, row)| self.has_live_target(row, association))
                .map(|(id, _)| *id)
                .collect(),
            Predicate::SourcePresent { association } => table
                .iter()
                .filter(|(_, row)| self.has_live_source(row, association))
                .map(|(id, _)| *id)
                .collect(),
            Predicate::Targets {
                association,
                target,
            } => {
                if !self.target_exists(target) {
                    return BTreeSet::new();
                }
                table
                    .iter()
                    .filter(|(_, row)| {
                        row.associations
                            .get(association)
                            .is_some_and(|targets| targets.contains(target))
                    })
                    .map(|(id, _)| *id)
                    .collect()
            }
            Predicate::Not(inner) => {
                let excluded = self.eval(type_name, table, inner);
                table
                    .keys()
                    .copied()
                    .filter(|id| !excluded.contains(id))
                    .collect()
            }
            Predicate::And(parts) => {
                let mut parts = parts.iter();
                let Some(first) = parts.next() else {
                    return table.keys().copied().collect();
                };
                let mut matched = self.eval(type_name, table, first);
                for part in parts {
                    if matched.is_empty() {
                        break;
                    }
                    let next = self.eval(type_name, table, part);
                    matched.retain(|id| next.contains(id));
                }
                matched
            }
            Predicate::Or(parts) => parts.iter().fold(BTreeSet::new(), |mut matched, part| {
                matched.extend(self.eval(type_name, table, part));
                matched
            }),
        }
    }
}

fn require_type(sourceable: &SourceableRef) -> Result<()> {
    if sourceable.type_name.is_empty() {
        return Err(ProvenanceError::constraint(format!(
            "sourceable #{} is missing its type",
            sourceable.id
        )));
    }
    Ok(())
}

/// In-memory store; also the read path of [`PersistentStore`](crate::PersistentStore)
#[derive(Debug, Default)]
pub struct Store {
    state: RwLock<StoreState>,
}

impl Store {
    /// Create a new store
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `work`, hand the result to `persist`, then apply it.
    ///
    /// The write lock is held throughout, so readers never observe a partially
    /// applied unit of work, and a `persist` failure leaves memory untouched.
    pub(crate) fn commit_with<F>(&self, work: UnitOfWork, persist: F) -> Result<()>
    where
        F: FnOnce(&ChangeSet) -> anyhow::Result<()>,
    {
        let mut state = self.state.write();
        let changes = state.stage(work)?;
        persist(&changes)?;
        state.apply(changes);
        Ok(())
    }

    /// Apply already-persisted state without validation (used when loading from disk)
    pub(crate) fn restore(&self, changes: ChangeSet) {
        self.state.write().apply(changes);
    }
}

impl ProvenanceStore for Store {
    fn entry(&self, sourceable: &SourceableRef) -> Result<Option<RegistryEntry>> {
        Ok(self.state.read().entries.get(sourceable).cloned())
    }

    fn sourceable_exists(&self, sourceable: &SourceableRef) -> Result<bool> {
        Ok(self.state.read().row(sourceable).is_some())
    }

    fn cache_flag(&self, sourceable: &SourceableRef, column: &str) -> Result<Option<bool>> {
        Ok(self
            .state
            .read()
            .row(sourceable)
            .map(|row| row.flags.get(column).copied().unwrap_or(false)))
    }

    fn association_targets(
        &self,
        sourceable: &SourceableRef,
        association: &str,
    ) -> Result<Vec<SourceableRef>> {
        let state = self.state.read();
        Ok(state
            .row(sourceable)
            .and_then(|row| row.associations.get(association))
            .map(|targets| {
                targets
                    .iter()
                    .filter(|target| state.target_exists(target))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn existing_source_ids(
        &self,
        kind: SourceKind,
        ids: &BTreeSet<u64>,
    ) -> Result<BTreeSet<u64>> {
        let state = self.state.read();
        Ok(match state.sources.get(&kind) {
            Some(existing) => ids.intersection(existing).copied().collect(),
            None => BTreeSet::new(),
        })
    }

    fn registry_types(&self) -> Result<Vec<String>> {
        let mut types: Vec<String> = self.state.read().entries_by_type.keys().cloned().collect();
        types.sort();
        Ok(types)
    }

    fn dangling_entries(&self, type_name: &str) -> Result<Vec<SourceableRef>> {
        let state = self.state.read();
        let Some(ids) = state.entries_by_type.get(type_name) else {
            return Ok(Vec::new());
        };
        let table = state.tables.get(type_name);
        Ok(ids
            .iter()
            .filter(|id| !table.is_some_and(|rows| rows.contains_key(*id)))
            .map(|id| SourceableRef::new(type_name, *id))
            .collect())
    }

    fn entries_referencing_missing(&self, kind: SourceKind) -> Result<Vec<RegistryEntry>> {
        let state = self.state.read();
        let existing = state.sources.get(&kind);
        let mut stale: Vec<RegistryEntry> = state
            .entries
            .values()
            .filter(|entry| {
                let recorded = entry.sources.ids(kind);
                let live = recorded
                    .iter()
                    .filter(|id| existing.is_some_and(|ids| ids.contains(*id)))
                    .count();
                live < recorded.len()
            })
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.sourceable.cmp(&b.sourceable));
        Ok(stale)
    }

    fn select(&self, type_name: &str, predicate: &Predicate) -> Result<Vec<u64>> {
        let state = self.state.read();
        let Some(table) = state.tables.get(type_name) else {
            return Ok(Vec::new());
        };
        Ok(state.eval(type_name, table, predicate).into_iter().collect())
    }

    fn entry_count(&self) -> Result<usize> {
        Ok(self.state.read().entries.len())
    }

    fn commit(&self, work: UnitOfWork) -> Result<()> {
        self.commit_with(work, |_| Ok(()))
    }
}
