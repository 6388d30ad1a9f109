#[path = "../src/test_support.rs"]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use provenance_rs::{
    PersistentOpenOptions, PersistentStore, Provenance, ProvenanceConfig, ProvenanceStore,
    SourceableRef,
};
use tempfile::tempdir;
use test_support::{test_registry, Fixture, CACHED, RECORD};

#[test]
fn registry_survives_restart() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path();

    {
        let fx = Fixture::with_store(Arc::new(PersistentStore::open(path)?));
        let r = fx.create(RECORD, 1);
        let cached = fx.create(CACHED, 1);
        fx.provenance.add_sources(&r, &[fx.h1, fx.i2])?;
        fx.provenance.add_sources(&cached, &[fx.c1])?;
        fx.store.flush()?;
    }

    let store = Arc::new(PersistentStore::open(path)?);
    let provenance = Provenance::new(store.clone(), test_registry());
    let r = SourceableRef::new(RECORD, 1);
    let cached = SourceableRef::new(CACHED, 1);

    assert_eq!(
        provenance.sources(&r)?,
        vec![
            provenance_rs::Source::HoldingInstitution(1),
            provenance_rs::Source::Item(2)
        ]
    );
    assert!(provenance.is_sourced(&cached)?);
    let by_collection = provenance
        .scopes()
        .sourced_by(CACHED, provenance_rs::Source::Collection(1))?;
    assert_eq!(by_collection.ids(&*store)?, vec![1]);
    Ok(())
}

#[test]
fn garbage_collection_is_durable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path();

    {
        let fx = Fixture::with_store(Arc::new(PersistentStore::open(path)?));
        let r = fx.create(CACHED, 1);
        let gone = fx.create(RECORD, 2);
        fx.provenance.add_sources(&r, &[fx.i1, fx.i2])?;
        fx.provenance.add_sources(&gone, &[fx.h1])?;

        fx.delete_source(fx.i2);
        fx.delete_row(&gone);
        let report = fx.provenance.garbage_collect();
        assert_eq!(report.entries_removed, 1);
        assert_eq!(report.entries_repaired, 1);
    }

    let store = Arc::new(PersistentStore::open(path)?);
    let provenance = Provenance::new(store.clone(), test_registry());
    assert_eq!(store.entry_count()?, 1);
    assert_eq!(
        provenance.sources(&SourceableRef::new(CACHED, 1))?,
        vec![provenance_rs::Source::Item(1)]
    );
    assert!(provenance.garbage_collect().is_noop());
    Ok(())
}

#[test]
fn open_from_config() -> Result<()> {
    let dir = tempdir()?;
    let mut config = ProvenanceConfig::default();
    config.data_dir = Some(dir.path().to_path_buf());
    config.storage.write_buffer_mb = 8;
    config.types.insert(
        RECORD.to_string(),
        provenance_rs::SourceableOptions::default(),
    );

    let data_dir = config.data_dir.clone().expect("data dir");
    let store = PersistentStore::open_with_options(
        &data_dir,
        PersistentOpenOptions::from(&config.storage),
    )?;
    let provenance = Provenance::from_config(Arc::new(store), &config)?;
    assert_eq!(provenance.types().len(), 1);

    let r = SourceableRef::new(RECORD, 3);
    provenance.add_sources(&r, &[provenance_rs::Source::Collection(4)])?;
    assert!(provenance.is_sourced(&r)?);
    assert!(provenance
        .add_sources(
            &SourceableRef::new(CACHED, 1),
            &[provenance_rs::Source::Collection(4)]
        )
        .unwrap_err()
        .is_configuration());
    Ok(())
}
