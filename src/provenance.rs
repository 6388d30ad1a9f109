//! # Provenance API
//!
//! Entry point for callers: per-record mutation and reads, batch operations over
//! scopes, cross-type queries and the garbage collector hook.
//!
//! Every mutation of one record is a read-modify-write of its registry entry,
//! serialized by a striped row lock and committed together with the cache flag
//! as a single [`UnitOfWork`].

use crate::cache::CacheSync;
use crate::config::{GcConfig, LockingConfig, ProvenanceConfig, SourceableType, Strategy, TypeRegistry};
use crate::error::{BatchFailure, ProvenanceError, Result};
use crate::gc::{GarbageCollector, GcReport, MaintenanceReport};
use crate::model::{RegistryEntry, Source, SourceSet, SourceableRef};
use crate::query::{Page, Paged, Scope, ScopeQueryEngine};
use crate::store::{ProvenanceStore, UnitOfWork};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Provenance tracking over a store and a fixed set of registered types
pub struct Provenance<S: ProvenanceStore> {
    store: Arc<S>,
    types: Arc<TypeRegistry>,
    locks: RowLocks,
    gc: GcConfig,
}

impl<S: ProvenanceStore> Provenance<S> {
    pub fn new(store: Arc<S>, types: TypeRegistry) -> Self {
        Self::with_locking(store, types, &LockingConfig::default())
    }

    pub fn with_locking(store: Arc<S>, types: TypeRegistry, locking: &LockingConfig) -> Self {
        Self {
            store,
            types: Arc::new(types),
            locks: RowLocks::new(locking.row_lock_stripes),
            gc: GcConfig::default(),
        }
    }

    /// Build the type registry from `config` and wire it to `store`
    pub fn from_config(store: Arc<S>, config: &ProvenanceConfig) -> Result<Self> {
        let types = TypeRegistry::from_config(config)?;
        let mut provenance = Self::with_locking(store, types, &config.locking);
        provenance.gc = config.gc.clone();
        Ok(provenance)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn scopes(&self) -> ScopeQueryEngine<'_> {
        ScopeQueryEngine::new(&self.types)
    }

    /// Registered type that accepts source writes
    fn writable(&self, type_name: &str) -> Result<&SourceableType> {
        let ty = self.types.get(type_name)?;
        if let Strategy::Through(association) = &ty.strategy {
            return Err(ProvenanceError::configuration(
                type_name,
                format!("sources are derived from the `{association}` association and are read-only"),
            ));
        }
        Ok(ty)
    }

    /// Add sources to a record. Adding a pair that already exists is a no-op.
    pub fn add_sources(&self, record: &SourceableRef, sources: &[Source]) -> Result<()> {
        let ty = self.writable(&record.type_name)?;
        self.mutate(ty, record, |set| {
            for source in sources {
                set.insert(*source);
            }
        })
    }

    /// Remove sources from a record; removing the last one deletes its entry
    pub fn remove_sources(&self, record: &SourceableRef, sources: &[Source]) -> Result<()> {
        let ty = self.writable(&record.type_name)?;
        self.mutate(ty, record, |set| {
            for source in sources {
                set.remove(source);
            }
        })
    }

    /// Replace the full source set of a record
    pub fn set_sources(&self, record: &SourceableRef, sources: &[Source]) -> Result<()> {
        let ty = self.writable(&record.type_name)?;
        self.mutate(ty, record, |set| *set = SourceSet::from_sources(sources))
    }

    pub fn unsource(&self, record: &SourceableRef) -> Result<()> {
        let ty = self.writable(&record.type_name)?;
        self.mutate(ty, record, |set| *set = SourceSet::new())
    }

    /// Writable type with a `sourced_by` association
    fn derived(&self, type_name: &str) -> Result<(&SourceableType, &str)> {
        let ty = self.writable(type_name)?;
        let association = ty.sourced_by.as_deref().ok_or_else(|| {
            ProvenanceError::configuration(
                type_name,
                "update_sources requires a sourced_by association",
            )
        })?;
        Ok((ty, association))
    }

    /// Replace the sources of `record` with the union of the sources of every
    /// live target of its `sourced_by` association. No targets means unsourced.
    pub fn update_sources(&self, record: &SourceableRef) -> Result<()> {
        let (ty, association) = self.derived(&record.type_name)?;
        let mut inherited = SourceSet::new();
        for target in self.store.association_targets(record, association)? {
            for source in self.target_sources(&target)? {
                inherited.insert(source);
            }
        }
        self.mutate(ty, record, |set| *set = inherited)
    }

    /// A source target stands for itself; a record target lends its own sources
    fn target_sources(&self, target: &SourceableRef) -> Result<Vec<Source>> {
        if let Some(source) = Source::from_target(target) {
            return Ok(vec![source]);
        }
        match self.types.lookup(&target.type_name) {
            Some(_) => self.sources(target),
            None => Ok(self
                .store
                .entry(target)?
                .map(|entry| entry.sources.to_vec())
                .unwrap_or_default()),
        }
    }

    fn mutate<F>(&self, ty: &SourceableType, record: &SourceableRef, change: F) -> Result<()>
    where
        F: FnOnce(&mut SourceSet),
    {
        let _guard = self.locks.lock(record);
        if let Some(column) = ty.cache_column() {
            // The flag lives on the row, so without one it could not follow the registry
            if !self.store.sourceable_exists(record)? {
                return Err(ProvenanceError::constraint(format!(
                    "cannot maintain `{column}` on missing sourceable {record}"
                )));
            }
        }
        let current = self.store.entry(record)?;
        let mut sources = current
            .as_ref()
            .map(|entry| entry.sources.clone())
            .unwrap_or_default();
        change(&mut sources);

        let mut work = UnitOfWork::new();
        stage_sources(ty, &mut work, record, current.as_ref(), sources);
        if work.is_empty() {
            return Ok(());
        }
        debug!(record = %record, writes = work.len(), "committing source change");
        self.store.commit(work)
    }

    /// Sources of a record ordered by kind, then id. `through` types read the
    /// live association and skip targets that no longer exist.
    pub fn sources(&self, record: &SourceableRef) -> Result<Vec<Source>> {
        let ty = self.types.get(&record.type_name)?;
        match ty.through() {
            Some(association) => self.through_sources(record, association),
            None => Ok(self
                .store
                .entry(record)?
                .map(|entry| entry.sources.to_vec())
                .unwrap_or_default()),
        }
    }

    pub fn is_sourced(&self, record: &SourceableRef) -> Result<bool> {
        let ty = self.types.get(&record.type_name)?;
        match &ty.strategy {
            Strategy::Registry => Ok(self.store.entry(record)?.is_some()),
            Strategy::CacheColumn(column) => {
                Ok(self.store.cache_flag(record, column)?.unwrap_or(false))
            }
            Strategy::Through(association) => {
                Ok(!self.through_sources(record, association)?.is_empty())
            }
        }
    }

    /// Live association targets that are sources; record targets do not count
    fn through_sources(&self, record: &SourceableRef, association: &str) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .store
            .association_targets(record, association)?
            .iter()
            .filter_map(Source::from_target)
            .collect();
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    pub fn is_unsourced(&self, record: &SourceableRef) -> Result<bool> {
        Ok(!self.is_sourced(record)?)
    }

    /// Delete the sourceable row and its registry entry together
    pub fn destroy(&self, record: &SourceableRef) -> Result<()> {
        self.types.get(&record.type_name)?;
        let _guard = self.locks.lock(record);
        let mut work = UnitOfWork::new();
        work.delete_sourceable(record.clone(), true);
        self.store.commit(work)
    }

    /// Batch operations over every member of `scope`
    pub fn batch(&self, scope: Scope) -> Batch<'_, S> {
        Batch {
            provenance: self,
            scope,
            cancel: None,
        }
    }

    pub fn add_sources_to(&self, scope: Scope, sources: &[Source]) -> Result<BatchReport> {
        self.batch(scope).add_sources(sources)
    }

    pub fn remove_sources_from(&self, scope: Scope, sources: &[Source]) -> Result<BatchReport> {
        self.batch(scope).remove_sources(sources)
    }

    pub fn unsource_scope(&self, scope: Scope) -> Result<BatchReport> {
        self.batch(scope).unsource()
    }

    pub fn update_sources_in(&self, scope: Scope) -> Result<BatchReport> {
        self.batch(scope).update_sources()
    }

    /// Remove one source from every record of every writable registered type
    #[instrument(skip(self), level = "debug")]
    pub fn withdraw_source(&self, source: Source) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for ty in self.types.iter().filter(|ty| !ty.is_read_only()) {
            let scope = self.scopes().sourced_by(&ty.name, source)?;
            report.merge(self.remove_sources_from(scope, &[source])?);
        }
        Ok(report)
    }

    /// Unsourced records across several types, in type then id order.
    /// `None` for `type_names` means every registered type.
    pub fn unsourced_across(
        &self,
        type_names: Option<&[&str]>,
        page: Option<Page>,
    ) -> Result<Paged<SourceableRef>> {
        let names: Vec<String> = match type_names {
            Some(names) => names.iter().map(|name| name.to_string()).collect(),
            None => self.types.names().map(str::to_string).collect(),
        };
        let (offset, limit) = page
            .map(|page| (page.offset(), page.per))
            .unwrap_or((0, usize::MAX));

        let store: &dyn ProvenanceStore = &*self.store;
        let engine = self.scopes();
        let mut items = Vec::new();
        let mut total = 0;
        for name in &names {
            let scope = engine.unsourced(name)?;
            let count = scope.count(store)?;
            let start = total;
            total += count;
            if items.len() < limit && offset < total {
                let skip = offset.saturating_sub(start);
                let wanted = limit - items.len();
                items.extend(
                    scope
                        .ids(store)?
                        .into_iter()
                        .skip(skip)
                        .take(wanted)
                        .map(|id| SourceableRef::new(name.clone(), id)),
                );
            }
        }

        Ok(Paged { items, total, page })
    }

    pub fn garbage_collector(&self) -> GarbageCollector<'_> {
        GarbageCollector::new(&*self.store, &self.types)
            .with_config(self.gc.clone())
            .with_locks(&self.locks)
    }

    pub fn garbage_collect(&self) -> GcReport {
        self.garbage_collector().run()
    }

    /// Collect garbage, then optionally rewrite drifted cache columns of every
    /// cache-column type
    pub fn maintain(&self, resync_cache: bool) -> Result<MaintenanceReport> {
        let gc = self.garbage_collect();
        let mut resynced = Vec::new();
        if resync_cache {
            for ty in self.types.iter() {
                if let Some(sync) = CacheSync::for_type(ty) {
                    resynced.push((ty.name.clone(), sync.resync(&*self.store)?));
                }
            }
        }
        Ok(MaintenanceReport { gc, resynced })
    }
}

/// Stage the registry write and cache flag that move `record` to `sources`.
///
/// Entries are never left empty: an empty target set deletes the entry. The
/// cache flag is written even when the set is unchanged, which also repairs a
/// drifted flag.
pub(crate) fn stage_sources(
    ty: &SourceableType,
    work: &mut UnitOfWork,
    record: &SourceableRef,
    current: Option<&RegistryEntry>,
    sources: SourceSet,
) {
    let sourced = !sources.is_empty();
    match current {
        Some(_) if !sourced => {
            work.delete_entry(record.clone());
        }
        Some(entry) if entry.sources != sources => {
            work.put_entry(entry.with_sources(sources));
        }
        Some(_) => {}
        None if !sourced => {}
        None => {
            work.put_entry(RegistryEntry::new(record.clone(), sources));
        }
    }
    if let Some(sync) = CacheSync::for_type(ty) {
        sync.stage(work, record, sourced);
    }
}

/// Cooperative cancellation for batch operations
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a batch: members are processed independently and successes stay applied
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<BatchFailure>,
    /// Set when a cancel flag stopped the run early
    pub cancelled: bool,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }

    fn merge(&mut self, other: BatchReport) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }

    /// `PartialBatchFailure` when any member failed
    pub fn into_result(self) -> Result<BatchReport> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        Err(ProvenanceError::PartialBatchFailure {
            failed: self.failures.len(),
            total: self.total,
            failures: self.failures,
        })
    }
}

pub struct Batch<'p, S: ProvenanceStore> {
    provenance: &'p Provenance<S>,
    scope: Scope,
    cancel: Option<CancelFlag>,
}

impl<'p, S: ProvenanceStore> Batch<'p, S> {
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[instrument(skip(self, sources), fields(type_name = %self.scope.type_name), level = "debug")]
    pub fn add_sources(self, sources: &[Source]) -> Result<BatchReport> {
        let provenance = self.provenance;
        self.run(|record| provenance.add_sources(record, sources))
    }

    #[instrument(skip(self, sources), fields(type_name = %self.scope.type_name), level = "debug")]
    pub fn remove_sources(self, sources: &[Source]) -> Result<BatchReport> {
        let provenance = self.provenance;
        self.run(|record| provenance.remove_sources(record, sources))
    }

    #[instrument(skip(self), fields(type_name = %self.scope.type_name), level = "debug")]
    pub fn unsource(self) -> Result<BatchReport> {
        let provenance = self.provenance;
        self.run(|record| provenance.unsource(record))
    }

    #[instrument(skip(self), fields(type_name = %self.scope.type_name), level = "debug")]
    pub fn update_sources(self) -> Result<BatchReport> {
        let provenance = self.provenance;
        provenance.derived(&self.scope.type_name)?;
        self.run(|record| provenance.update_sources(record))
    }

    fn run<F>(self, apply: F) -> Result<BatchReport>
    where
        F: Fn(&SourceableRef) -> Result<()>,
    {
        self.provenance.writable(&self.scope.type_name)?;
        let members = self.scope.fetch(&*self.provenance.store)?;

        let mut report = BatchReport {
            total: members.len(),
            ..BatchReport::default()
        };
        for record in members {
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                report.cancelled = true;
                break;
            }
            match apply(&record) {
                Ok(()) => report.succeeded += 1,
                Err(error) => {
                    warn!("Failed to update sources of {}: {}", record, error);
                    report.failures.push(BatchFailure { record, error });
                }
            }
        }

        debug!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed(),
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }
}

/// Fixed pool of mutexes; records hashing to the same stripe serialize
pub(crate) struct RowLocks {
    stripes: Vec<Mutex<()>>,
}

impl RowLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, record: &SourceableRef) -> MutexGuard<'_, ()> {
        let mut hasher = FxHasher::default();
        record.hash(&mut hasher);
        let stripe = hasher.finish() as usize % self.stripes.len();
        self.stripes[stripe].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceableOptions;
    use crate::store::Store;

    fn provenance() -> Provenance<Store> {
        let types = TypeRegistry::builder()
            .register("SourceableRecord", SourceableOptions::default())
            .register(
                "CachedSourceableRecord",
                SourceableOptions::default().cache_column("sourced"),
            )
            .register(
                "SourceableThroughRecord",
                SourceableOptions::default().through("item"),
            )
            .build()
            .unwrap();
        Provenance::new(Arc::new(Store::new()), types)
    }

    #[test]
    fn test_add_then_remove_deletes_entry() {
        let provenance = provenance();
        let record = SourceableRef::new("SourceableRecord", 1);
        provenance
            .add_sources(&record, &[Source::Item(2), Source::Item(1)])
            .unwrap();
        assert_eq!(
            provenance.sources(&record).unwrap(),
            vec![Source::Item(1), Source::Item(2)]
        );

        provenance
            .remove_sources(&record, &[Source::Item(1), Source::Item(2)])
            .unwrap();
        assert!(provenance.store().entry(&record).unwrap().is_none());
        assert!(provenance.is_unsourced(&record).unwrap());
    }

    #[test]
    fn test_empty_change_writes_nothing() {
        let provenance = provenance();
        let record = SourceableRef::new("SourceableRecord", 1);
        provenance.remove_sources(&record, &[Source::Item(1)]).unwrap();
        provenance.add_sources(&record, &[]).unwrap();
        assert_eq!(provenance.store().entry_count().unwrap(), 0);
    }

    #[test]
    fn test_through_types_are_read_only() {
        let provenance = provenance();
        let record = SourceableRef::new("SourceableThroughRecord", 1);
        let err = provenance
            .add_sources(&record, &[Source::Item(1)])
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(provenance.unsource(&record).unwrap_err().is_configuration());
        assert!(provenance.sources(&record).unwrap().is_empty());
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let provenance = provenance();
        let record = SourceableRef::new("Discussion", 1);
        assert!(provenance
            .add_sources(&record, &[Source::Item(1)])
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_row_locks_are_stable_per_record() {
        let locks = RowLocks::new(0);
        assert_eq!(locks.stripes.len(), 1);
        let record = SourceableRef::new("SourceableRecord", 1);
        drop(locks.lock(&record));
        drop(locks.lock(&record));
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_report_into_result() {
        let report = BatchReport {
            total: 2,
            succeeded: 1,
            failures: vec![BatchFailure {
                record: SourceableRef::new("SourceableRecord", 2),
                error: ProvenanceError::constraint("boom"),
            }],
            cancelled: false,
        };
        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err,
            ProvenanceError::PartialBatchFailure { failed: 1, total: 2, .. }
        ));
        assert!(BatchReport::default().into_result().is_ok());
    }
}
