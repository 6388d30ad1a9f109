#[path = "../src/test_support.rs"]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use provenance_rs::config::GcConfig;
use provenance_rs::{GcPass, ProvenanceStore, Source, SourceableRef, UnitOfWork};
use test_support::{FlakyStore, Fixture, CACHED, RECORD};

#[test]
fn deleted_sourceables_lose_their_entries() -> Result<()> {
    let fx = Fixture::new();
    let kept = fx.create(RECORD, 1);
    let gone = fx.create(RECORD, 2);
    fx.provenance.add_sources(&kept, &[fx.h1])?;
    fx.provenance.add_sources(&gone, &[fx.h1, fx.c1])?;

    fx.delete_row(&gone);
    assert!(fx.store.entry(&gone)?.is_some());

    let report = fx.provenance.garbage_collect();
    assert!(report.is_clean());
    assert_eq!(report.entries_removed, 1);
    assert!(fx.store.entry(&gone)?.is_none());
    assert!(fx.store.entry(&kept)?.is_some());
    Ok(())
}

#[test]
fn repair_drops_only_missing_ids_and_converges() -> Result<()> {
    let fx = Fixture::new();
    let a = Source::Item(10);
    let b = Source::Item(11);
    let c = Source::Item(12);
    for source in [a, b, c] {
        fx.create_source(source);
    }
    let r = fx.create(RECORD, 1);
    fx.provenance.add_sources(&r, &[a, b, c])?;

    fx.delete_source(b);
    let first = fx.provenance.garbage_collect();
    assert_eq!(first.entries_repaired, 1);
    assert_eq!(fx.provenance.sources(&r)?, vec![a, c]);

    let second = fx.provenance.garbage_collect();
    assert!(second.is_noop());
    assert_eq!(fx.provenance.sources(&r)?, vec![a, c]);
    Ok(())
}

#[test]
fn repair_removes_entries_left_empty() -> Result<()> {
    let fx = Fixture::new();
    let r = fx.create(CACHED, 1);
    fx.provenance.add_sources(&r, &[fx.i2])?;

    fx.delete_source(fx.i2);
    let report = fx.provenance.garbage_collect();

    assert_eq!(report.entries_removed, 1);
    assert!(fx.store.entry(&r)?.is_none());
    assert!(fx.provenance.is_unsourced(&r)?);
    assert_eq!(fx.store.cache_flag(&r, "sourced")?, Some(false));
    Ok(())
}

#[test]
fn repair_spans_every_kind_of_an_entry() -> Result<()> {
    let fx = Fixture::new();
    let r = fx.create(CACHED, 1);
    fx.provenance.add_sources(&r, &[fx.h1, fx.c1, fx.i1])?;

    fx.delete_source(fx.h1);
    fx.delete_source(fx.i1);
    let report = fx.provenance.garbage_collect();

    assert_eq!(report.entries_repaired, 1);
    assert_eq!(fx.provenance.sources(&r)?, vec![fx.c1]);
    assert!(fx.provenance.is_sourced(&r)?);
    assert!(fx.provenance.garbage_collect().is_noop());
    Ok(())
}

#[test]
fn sweep_runs_before_repair() -> Result<()> {
    let fx = Fixture::new();
    let r = fx.create(RECORD, 1);
    fx.provenance.add_sources(&r, &[fx.i1])?;

    fx.delete_row(&r);
    fx.delete_source(fx.i1);
    let report = fx.provenance.garbage_collect();

    assert_eq!(report.entries_removed, 1);
    assert_eq!(report.entries_repaired, 0);
    assert_eq!(fx.store.entry_count()?, 0);
    Ok(())
}

#[test]
fn failures_are_recorded_and_the_sweep_continues() -> Result<()> {
    let store = Arc::new(FlakyStore::default());
    let fx = Fixture::with_store(store.clone());
    let stuck = fx.create(RECORD, 1);
    let fine = fx.create(CACHED, 1);
    let repaired = fx.create(RECORD, 2);
    fx.provenance.add_sources(&stuck, &[fx.h1])?;
    fx.provenance.add_sources(&fine, &[fx.h1])?;
    fx.provenance.add_sources(&repaired, &[fx.h1, fx.i1])?;

    fx.delete_row(&stuck);
    fx.delete_row(&fine);
    fx.delete_source(fx.i1);
    store.poison(&stuck);

    let report = fx.provenance.garbage_collect();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].pass, GcPass::OrphanedSourceables);
    assert_eq!(report.failures[0].target, stuck.to_string());
    assert!(fx.store.entry(&fine)?.is_none());
    assert_eq!(fx.provenance.sources(&repaired)?, vec![fx.h1]);

    store.heal();
    let rerun = fx.provenance.garbage_collect();
    assert!(rerun.is_clean());
    assert!(fx.store.entry(&stuck)?.is_none());
    Ok(())
}

#[test]
fn maintenance_resyncs_drifted_cache_columns() -> Result<()> {
    let fx = Fixture::new();
    let sourced = fx.create(CACHED, 1);
    let drifted = fx.create(CACHED, 2);
    fx.provenance.add_sources(&sourced, &[fx.h1])?;
    fx.store.commit({
        let mut work = UnitOfWork::new();
        work.set_cache_flag(drifted.clone(), "sourced", true);
        work
    })?;

    let skipped = fx.provenance.maintain(false)?;
    assert!(skipped.resynced.is_empty());
    assert!(fx.provenance.is_sourced(&drifted)?);

    let report = fx.provenance.maintain(true)?;
    assert_eq!(report.exit_code(), 0);
    assert!(report
        .resynced
        .iter()
        .any(|(type_name, changed)| type_name.as_str() == CACHED && *changed == 1));
    assert!(fx.provenance.is_unsourced(&drifted)?);
    assert!(fx.provenance.is_sourced(&sourced)?);
    Ok(())
}

#[test]
fn maintenance_exit_code_reports_failures() -> Result<()> {
    let store = Arc::new(FlakyStore::default());
    let fx = Fixture::with_store(store.clone());
    let r = fx.create(RECORD, 1);
    fx.provenance.add_sources(&r, &[fx.i1])?;
    fx.delete_source(fx.i1);
    store.poison(&r);

    let report = fx.provenance.maintain(true)?;
    assert_eq!(report.gc.failures.len(), 1);
    assert_eq!(report.exit_code(), 1);

    store.heal();
    assert_eq!(fx.provenance.maintain(true)?.exit_code(), 0);
    Ok(())
}

#[test]
fn collector_can_be_configured_directly() -> Result<()> {
    let fx = Fixture::new();
    let r = SourceableRef::new("RetiredRecord", 5);
    fx.store.commit({
        let mut work = provenance_rs::UnitOfWork::new();
        work.put_entry(provenance_rs::RegistryEntry::new(
            r.clone(),
            provenance_rs::SourceSet::from_sources(&[fx.h1]),
        ));
        work
    })?;

    let report = fx
        .provenance
        .garbage_collector()
        .with_config(GcConfig {
            log_each_repair: true,
        })
        .run();
    assert_eq!(report.types_swept, 1);
    assert_eq!(report.entries_removed, 1);
    assert!(fx.store.entry(&r)?.is_none());
    Ok(())
}
