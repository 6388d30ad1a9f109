//! # Garbage Collector
//!
//! Reconciles the registry after sourceables or sources were deleted without
//! going through the provenance API. Two passes, in order:
//!
//! 1. entries whose sourceable row is gone are deleted;
//! 2. entries whose id-sets reference missing sources are recomputed against
//!    the sources that still exist, and deleted if nothing is left.
//!
//! A run never aborts on a single failure. It is idempotent, and a second run
//! repairs anything a concurrent writer raced past.

use crate::config::{GcConfig, TypeRegistry};
use crate::error::ProvenanceError;
use crate::model::{SourceKind, SourceSet, SourceableRef};
use crate::provenance::{stage_sources, RowLocks};
use crate::store::{ProvenanceStore, UnitOfWork};
use std::fmt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPass {
    OrphanedSourceables,
    DanglingSources,
}

impl fmt::Display for GcPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcPass::OrphanedSourceables => f.write_str("orphaned-sourceables"),
            GcPass::DanglingSources => f.write_str("dangling-sources"),
        }
    }
}

#[derive(Debug)]
pub struct GcFailure {
    pub pass: GcPass,
    /// Sourceable type, source kind or record the failure is about
    pub target: String,
    pub error: ProvenanceError,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub types_swept: usize,
    pub entries_removed: usize,
    pub entries_repaired: usize,
    pub failures: Vec<GcFailure>,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when the run found nothing to change
    pub fn is_noop(&self) -> bool {
        self.entries_removed == 0 && self.entries_repaired == 0
    }
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "swept {} types, removed {} entries, repaired {} entries, {} failures",
            self.types_swept,
            self.entries_removed,
            self.entries_repaired,
            self.failures.len()
        )
    }
}

/// Collection outcome plus the cache columns rewritten afterwards
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub gc: GcReport,
    /// `(type name, flags rewritten)` per cache-column type
    pub resynced: Vec<(String, usize)>,
}

impl MaintenanceReport {
    /// Process exit status: non-zero when the collector recorded failures
    pub fn exit_code(&self) -> i32 {
        if self.gc.is_clean() {
            0
        } else {
            1
        }
    }
}

enum Repair {
    Unchanged,
    Updated,
    Removed,
}

pub struct GarbageCollector<'a> {
    store: &'a dyn ProvenanceStore,
    types: &'a TypeRegistry,
    config: GcConfig,
    locks: Option<&'a RowLocks>,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(store: &'a dyn ProvenanceStore, types: &'a TypeRegistry) -> Self {
        Self {
            store,
            types,
            config: GcConfig::default(),
            locks: None,
        }
    }

    pub fn with_config(mut self, config: GcConfig) -> Self {
        self.config = config;
        self
    }

    /// Serialize repairs with API writers on the same record
    pub(crate) fn with_locks(mut self, locks: &'a RowLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    #[instrument(skip(self), level = "debug")]
    pub fn run(&self) -> GcReport {
        let mut report = GcReport::default();
        self.sweep_orphaned_sourceables(&mut report);
        self.repair_dangling_sources(&mut report);

        if report.is_clean() {
            info!(
                types_swept = report.types_swept,
                removed = report.entries_removed,
                repaired = report.entries_repaired,
                "garbage collection finished"
            );
        } else {
            warn!(
                failures = report.failures.len(),
                "garbage collection finished with failures: {}", report
            );
        }
        report
    }

    fn fail(&self, report: &mut GcReport, pass: GcPass, target: String, error: ProvenanceError) {
        warn!("{} pass failed for {}: {}", pass, target, error);
        report.failures.push(GcFailure {
            pass,
            target,
            error,
        });
    }

    fn sweep_orphaned_sourceables(&self, report: &mut GcReport) {
        let types = match self.store.registry_types() {
            Ok(types) => types,
            Err(error) => {
                self.fail(
                    report,
                    GcPass::OrphanedSourceables,
                    "registry".to_string(),
                    error,
                );
                return;
            }
        };

        for type_name in types {
            let dangling = match self.store.dangling_entries(&type_name) {
                Ok(dangling) => dangling,
                Err(error) => {
                    self.fail(report, GcPass::OrphanedSourceables, type_name, error);
                    continue;
                }
            };
            report.types_swept += 1;

            let mut removed = 0;
            for sourceable in dangling {
                match self.remove_orphaned(&sourceable) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(error) => self.fail(
                        report,
                        GcPass::OrphanedSourceables,
                        sourceable.to_string(),
                        error,
                    ),
                }
            }
            report.entries_removed += removed;
            debug!(type_name, removed, "swept orphaned entries");
        }
    }

    /// Delete the entry unless the row came back since the scan
    fn remove_orphaned(&self, sourceable: &SourceableRef) -> Result<bool, ProvenanceError> {
        let _guard = self.locks.map(|locks| locks.lock(sourceable));
        if self.store.sourceable_exists(sourceable)? || self.store.entry(sourceable)?.is_none() {
            return Ok(false);
        }
        let mut work = UnitOfWork::new();
        work.delete_entry(sourceable.clone());
        self.store.commit(work)?;
        self.log_repair(format_args!("removing entry of deleted {sourceable}"));
        Ok(true)
    }

    fn repair_dangling_sources(&self, report: &mut GcReport) {
        for kind in SourceKind::ALL {
            let stale = match self.store.entries_referencing_missing(kind) {
                Ok(stale) => stale,
                Err(error) => {
                    self.fail(report, GcPass::DanglingSources, kind.to_string(), error);
                    continue;
                }
            };
            for entry in stale {
                match self.repair_entry(&entry.sourceable) {
                    Ok(Repair::Unchanged) => {}
                    Ok(Repair::Updated) => report.entries_repaired += 1,
                    Ok(Repair::Removed) => report.entries_removed += 1,
                    Err(error) => self.fail(
                        report,
                        GcPass::DanglingSources,
                        entry.sourceable.to_string(),
                        error,
                    ),
                }
            }
        }
    }

    /// Recompute every id-set as recorded ∩ existing and write it back
    fn repair_entry(&self, sourceable: &SourceableRef) -> Result<Repair, ProvenanceError> {
        let _guard = self.locks.map(|locks| locks.lock(sourceable));
        // Re-read: the entry may have changed since the scan
        let Some(entry) = self.store.entry(sourceable)? else {
            return Ok(Repair::Unchanged);
        };
        let mut live = SourceSet::new();
        for kind in SourceKind::ALL {
            *live.ids_mut(kind) = self
                .store
                .existing_source_ids(kind, entry.sources.ids(kind))?;
        }
        if live == entry.sources {
            return Ok(Repair::Unchanged);
        }

        let removed = live.is_empty();
        let ty = self.types.resolve_or_plain(&entry.sourceable.type_name);
        let mut work = UnitOfWork::new();
        stage_sources(&ty, &mut work, &entry.sourceable, Some(&entry), live);
        self.store.commit(work)?;

        if removed {
            self.log_repair(format_args!(
                "removing entry of {}: no sources left",
                entry.sourceable
            ));
            Ok(Repair::Removed)
        } else {
            self.log_repair(format_args!(
                "dropped missing sources from {}",
                entry.sourceable
            ));
            Ok(Repair::Updated)
        }
    }

    fn log_repair(&self, message: fmt::Arguments<'_>) {
        if self.config.log_each_repair {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }
}
