//! # Cache Sync
//!
//! Keeps the denormalized "is sourced" column of cache-column types in step with
//! the registry. The flag write is always staged into the same [`UnitOfWork`] as
//! the registry write, so both land or neither does.

use crate::config::SourceableType;
use crate::error::Result;
use crate::model::SourceableRef;
use crate::query::{Predicate, Scope};
use crate::store::{ProvenanceStore, UnitOfWork};
use tracing::debug;

/// Flag maintenance for one cache-column type
#[derive(Debug, Clone, Copy)]
pub struct CacheSync<'a> {
    type_name: &'a str,
    column: &'a str,
}

impl<'a> CacheSync<'a> {
    /// `None` unless the type is registered with a cache column
    pub fn for_type(ty: &'a SourceableType) -> Option<Self> {
        ty.cache_column().map(|column| Self {
            type_name: &ty.name,
            column,
        })
    }

    pub fn column(&self) -> &str {
        self.column
    }

    pub fn stage(&self, work: &mut UnitOfWork, record: &SourceableRef, sourced: bool) {
        work.set_cache_flag(record.clone(), self.column, sourced);
    }

    /// O(1) read of the flag; a missing row reads as unsourced
    pub fn is_sourced(&self, store: &dyn ProvenanceStore, record: &SourceableRef) -> Result<bool> {
        Ok(store.cache_flag(record, self.column)?.unwrap_or(false))
    }

    /// Rows flagged sourced without a registry entry
    pub fn stale_flags(&self) -> Scope {
        Scope::new(
            self.type_name,
            Predicate::CacheFlag {
                column: self.column.to_string(),
                value: true,
            }
            .and(Predicate::HasEntry.negate()),
        )
    }

    /// Rows with a registry entry but not flagged sourced
    pub fn missing_flags(&self) -> Scope {
        Scope::new(
            self.type_name,
            Predicate::CacheFlag {
                column: self.column.to_string(),
                value: false,
            }
            .and(Predicate::HasEntry),
        )
    }

    /// Rewrite every drifted flag in one unit of work; returns how many changed
    pub fn resync(&self, store: &dyn ProvenanceStore) -> Result<usize> {
        let stale = self.stale_flags().fetch(store)?;
        let missing = self.missing_flags().fetch(store)?;
        if stale.is_empty() && missing.is_empty() {
            return Ok(0);
        }

        let mut work = UnitOfWork::new();
        for record in &stale {
            self.stage(&mut work, record, false);
        }
        for record in &missing {
            self.stage(&mut work, record, true);
        }
        store.commit(work)?;

        debug!(
            type_name = self.type_name,
            cleared = stale.len(),
            set = missing.len(),
            "resynced cache column"
        );
        Ok(stale.len() + missing.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceableOptions;
    use crate::model::{RegistryEntry, Source, SourceSet};
    use crate::store::Store;

    fn cached_type() -> SourceableType {
        SourceableType::from_options(
            "CachedSourceableRecord",
            &SourceableOptions::default().cache_column("sourced"),
        )
        .unwrap()
    }

    fn record(id: u64) -> SourceableRef {
        SourceableRef::new("CachedSourceableRecord", id)
    }

    #[test]
    fn test_only_cache_types_get_a_sync() {
        assert!(CacheSync::for_type(&SourceableType::plain("SourceableRecord")).is_none());
        let ty = cached_type();
        assert_eq!(CacheSync::for_type(&ty).unwrap().column(), "sourced");
    }

    #[test]
    fn test_resync_repairs_drift_both_ways() {
        let ty = cached_type();
        let sync = CacheSync::for_type(&ty).unwrap();
        let store = Store::new();

        // 1 is flagged without an entry, 2 has an entry without the flag
        let mut work = UnitOfWork::new();
        work.insert_sourceable(record(1))
            .insert_sourceable(record(2))
            .insert_sourceable(record(3))
            .insert_source(Source::Item(1))
            .set_cache_flag(record(1), "sourced", true)
            .put_entry(RegistryEntry::new(
                record(2),
                SourceSet::from_sources(&[Source::Item(1)]),
            ));
        store.commit(work).unwrap();

        assert_eq!(sync.resync(&store).unwrap(), 2);
        assert!(!sync.is_sourced(&store, &record(1)).unwrap());
        assert!(sync.is_sourced(&store, &record(2)).unwrap());
        assert!(!sync.is_sourced(&store, &record(3)).unwrap());
        assert_eq!(sync.resync(&store).unwrap(), 0);
    }

    #[test]
    fn test_missing_row_reads_unsourced() {
        let ty = cached_type();
        let sync = CacheSync::for_type(&ty).unwrap();
        let store = Store::new();
        assert!(!sync.is_sourced(&store, &record(99)).unwrap());
    }
}
