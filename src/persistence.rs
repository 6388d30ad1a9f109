use crate::config::StorageConfig;
use crate::error::Result as ProvenanceResult;
use crate::model::{RegistryEntry, Source, SourceKind, SourceableRef};
use crate::query::Predicate;
use crate::store::{ChangeSet, ProvenanceStore, SourceableRow, Store, UnitOfWork};
use anyhow::{anyhow, Result};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeSet;
use std::path::Path;

const CF_ENTRIES: &str = "entries";
const CF_SOURCEABLES: &str = "sourceables";
const CF_SOURCES: &str = "sources";
const CF_METADATA: &str = "metadata";

const KEY_NEXT_ENTRY_ID: &[u8] = b"next_entry_id";
const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// RocksDB-backed store. Reads are served from the in-memory [`Store`], which is
/// loaded on open; every commit writes one RocksDB batch before memory changes.
pub struct PersistentStore {
    inner: Store,
    db: DB,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub write_buffer_mb: usize,
    pub max_background_jobs: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for PersistentOpenOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            repair: config.repair,
            write_buffer_mb: config.write_buffer_mb,
            max_background_jobs: config.max_background_jobs,
        }
    }
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path, &options)?;
        validate_or_init_manifest(&db)?;

        let instance = Self {
            inner: Store::new(),
            db,
        };
        instance.load_into_store()?;
        Ok(instance)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn write_changes(&self, changes: &ChangeSet) -> Result<()> {
        let entries_cf = cf(&self.db, CF_ENTRIES)?;
        let sourceables_cf = cf(&self.db, CF_SOURCEABLES)?;
        let sources_cf = cf(&self.db, CF_SOURCES)?;
        let metadata_cf = cf(&self.db, CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for (sourceable, row) in &changes.rows {
            let key = encode_sourceable_key(sourceable);
            match row {
                Some(row) => batch.put_cf(sourceables_cf, key, bincode::serialize(row)?),
                None => batch.delete_cf(sourceables_cf, key),
            }
        }
        for (source, present) in &changes.sources {
            let key = encode_source_key(source);
            if *present {
                batch.put_cf(sources_cf, key, b"");
            } else {
                batch.delete_cf(sources_cf, key);
            }
        }
        for (sourceable, entry) in &changes.entries {
            let key = encode_sourceable_key(sourceable);
            match entry {
                Some(entry) => batch.put_cf(entries_cf, key, bincode::serialize(entry)?),
                None => batch.delete_cf(entries_cf, key),
            }
        }
        batch.put_cf(
            metadata_cf,
            KEY_NEXT_ENTRY_ID,
            bincode::serialize(&changes.next_entry_id)?,
        );

        self.db.write(batch)?;
        Ok(())
    }

    fn load_into_store(&self) -> Result<()> {
        let mut changes = ChangeSet::default();

        let sourceables_cf = cf(&self.db, CF_SOURCEABLES)?;
        for item in self.db.iterator_cf(sourceables_cf, IteratorMode::Start) {
            let (key, value) = item?;
            let sourceable = decode_sourceable_key(&key)
                .ok_or_else(|| anyhow!("corrupt sourceable key: {key:?}"))?;
            let row: SourceableRow = bincode::deserialize(&value)?;
            changes.rows.insert(sourceable, Some(row));
        }

        let sources_cf = cf(&self.db, CF_SOURCES)?;
        for item in self.db.iterator_cf(sources_cf, IteratorMode::Start) {
            let (key, _value) = item?;
            let source =
                decode_source_key(&key).ok_or_else(|| anyhow!("corrupt source key: {key:?}"))?;
            changes.sources.insert(source, true);
        }

        let entries_cf = cf(&self.db, CF_ENTRIES)?;
        let mut max_entry_id = 0;
        for item in self.db.iterator_cf(entries_cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let entry: RegistryEntry = bincode::deserialize(&value)?;
            max_entry_id = max_entry_id.max(entry.id.0);
            changes.entries.insert(entry.sourceable.clone(), Some(entry));
        }

        let next_entry_id = load_metadata::<u64>(&self.db, KEY_NEXT_ENTRY_ID)?.unwrap_or(1);
        changes.next_entry_id = next_entry_id.max(max_entry_id + 1);

        self.inner.restore(changes);
        Ok(())
    }
}

impl ProvenanceStore for PersistentStore {
    fn entry(&self, sourceable: &SourceableRef) -> ProvenanceResult<Option<RegistryEntry>> {
        self.inner.entry(sourceable)
    }

    fn sourceable_exists(&self, sourceable: &SourceableRef) -> ProvenanceResult<bool> {
        self.inner.sourceable_exists(sourceable)
    }

    fn cache_flag(
        &self,
        sourceable: &SourceableRef,
        column: &str,
    ) -> ProvenanceResult<Option<bool>> {
        self.inner.cache_flag(sourceable, column)
    }

    fn association_targets(
        &self,
        sourceable: &SourceableRef,
        association: &str,
    ) -> ProvenanceResult<Vec<SourceableRef>> {
        self.inner.association_targets(sourceable, association)
    }

    fn existing_source_ids(
        &self,
        kind: SourceKind,
        ids: &BTreeSet<u64>,
    ) -> ProvenanceResult<BTreeSet<u64>> {
        self.inner.existing_source_ids(kind, ids)
    }

    fn registry_types(&self) -> ProvenanceResult<Vec<String>> {
        self.inner.registry_types()
    }

    fn dangling_entries(&self, type_name: &str) -> ProvenanceResult<Vec<SourceableRef>> {
        self.inner.dangling_entries(type_name)
    }

    fn entries_referencing_missing(
        &self,
        kind: SourceKind,
    ) -> ProvenanceResult<Vec<RegistryEntry>> {
        self.inner.entries_referencing_missing(kind)
    }

    fn select(&self, type_name: &str, predicate: &Predicate) -> ProvenanceResult<Vec<u64>> {
        self.inner.select(type_name, predicate)
    }

    fn entry_count(&self) -> ProvenanceResult<usize> {
        self.inner.entry_count()
    }

    fn commit(&self, work: UnitOfWork) -> ProvenanceResult<()> {
        self.inner
            .commit_with(work, |changes| self.write_changes(changes))
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| anyhow!("missing column family {name}"))
}

fn open_db(path: impl AsRef<Path>, open: &PersistentOpenOptions) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    options.set_write_buffer_size(open.write_buffer_mb * 1024 * 1024);
    options.set_max_background_jobs(open.max_background_jobs as i32);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_ENTRIES, Options::default()),
        ColumnFamilyDescriptor::new(CF_SOURCEABLES, Options::default()),
        ColumnFamilyDescriptor::new(CF_SOURCES, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

/// `type_name \0 id_be`
fn encode_sourceable_key(sourceable: &SourceableRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(sourceable.type_name.len() + 1 + 8);
    key.extend_from_slice(sourceable.type_name.as_bytes());
    key.push(0);
    key.extend_from_slice(&sourceable.id.to_be_bytes());
    key
}

fn decode_sourceable_key(key: &[u8]) -> Option<SourceableRef> {
    if key.len() < 9 {
        return None;
    }
    let (name, rest) = key.split_at(key.len() - 9);
    if rest[0] != 0 {
        return None;
    }
    let id = u64::from_be_bytes(rest[1..9].try_into().ok()?);
    let type_name = std::str::from_utf8(name).ok()?;
    Some(SourceableRef::new(type_name, id))
}

/// `kind_tag id_be`
fn encode_source_key(source: &Source) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8);
    key.push(source.kind().tag());
    key.extend_from_slice(&source.id().to_be_bytes());
    key
}

fn decode_source_key(key: &[u8]) -> Option<Source> {
    if key.len() != 9 {
        return None;
    }
    let kind = SourceKind::from_tag(key[0])?;
    let id = u64::from_be_bytes(key[1..9].try_into().ok()?);
    Some(Source::new(kind, id))
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceSet;
    use tempfile::tempdir;

    fn record(id: u64) -> SourceableRef {
        SourceableRef::new("SourceableRecord", id)
    }

    #[test]
    fn sourceable_key_round_trip() {
        let sourceable = SourceableRef::new("Cached_Record", 300);
        let key = encode_sourceable_key(&sourceable);
        assert_eq!(decode_sourceable_key(&key), Some(sourceable));
        assert_eq!(decode_sourceable_key(b"short"), None);

        let key = encode_source_key(&Source::Collection(7));
        assert_eq!(decode_source_key(&key), Some(Source::Collection(7)));
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let store = PersistentStore::open(path).unwrap();
        let mut work = UnitOfWork::new();
        work.insert_sourceable(record(1))
            .insert_sourceable(record(2))
            .insert_source(Source::Item(5))
            .set_cache_flag(record(2), "sourced", true)
            .link(record(2), "item", Source::Item(5).into())
            .put_entry(RegistryEntry::new(
                record(1),
                SourceSet::from_sources(&[Source::Item(5)]),
            ));
        store.commit(work).unwrap();
        let entry_id = store.entry(&record(1)).unwrap().unwrap().id;
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        let loaded = store.entry(&record(1)).unwrap().unwrap();
        assert_eq!(loaded.id, entry_id);
        assert!(loaded.sources.contains(&Source::Item(5)));
        assert_eq!(store.cache_flag(&record(2), "sourced").unwrap(), Some(true));
        assert_eq!(
            store.association_targets(&record(2), "item").unwrap(),
            vec![SourceableRef::from(Source::Item(5))]
        );
        assert_eq!(
            store.select("SourceableRecord", &Predicate::HasEntry).unwrap(),
            vec![1]
        );
    }

    #[test]
    fn persistent_store_keeps_entry_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let store = PersistentStore::open(path).unwrap();
        let mut work = UnitOfWork::new();
        work.insert_sourceable(record(1))
            .insert_source(Source::Item(1))
            .put_entry(RegistryEntry::new(
                record(1),
                SourceSet::from_sources(&[Source::Item(1)]),
            ));
        store.commit(work).unwrap();
        let first = store.entry(&record(1)).unwrap().unwrap().id;

        let mut work = UnitOfWork::new();
        work.delete_sourceable(record(1), true);
        store.commit(work).unwrap();
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        assert_eq!(store.entry_count().unwrap(), 0);
        let mut work = UnitOfWork::new();
        work.insert_sourceable(record(2)).put_entry(RegistryEntry::new(
            record(2),
            SourceSet::from_sources(&[Source::Item(1)]),
        ));
        store.commit(work).unwrap();
        let second = store.entry(&record(2)).unwrap().unwrap().id;
        assert!(second > first);
    }

    #[test]
    fn failed_commit_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let store = PersistentStore::open(path).unwrap();
        let mut work = UnitOfWork::new();
        work.insert_sourceable(record(1))
            .put_entry(RegistryEntry::new(record(1), SourceSet::new()));
        assert!(store.commit(work).is_err());
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        assert!(!store.sourceable_exists(&record(1)).unwrap());
    }
}
