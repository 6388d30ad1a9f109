use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;

use provenance_rs::config::SourceableOptions;
use provenance_rs::{
    Predicate, Provenance, ProvenanceStore, RegistryEntry, Source, SourceKind, SourceableRef,
    Store, TypeRegistry, UnitOfWork, Write,
};

#[allow(dead_code)]
pub const RECORD: &str = "SourceableRecord";
#[allow(dead_code)]
pub const CACHED: &str = "CachedSourceableRecord";
#[allow(dead_code)]
pub const THROUGH: &str = "SourceableThroughRecord";
#[allow(dead_code)]
pub const MATERIAL: &str = "Material";
#[allow(dead_code)]
pub const DISCUSSION: &str = "Discussion";
/// Inherits sources from its `parts`
#[allow(dead_code)]
pub const DERIVED: &str = "DerivedRecord";
/// Inherits sources from its `origin` and caches the flag
#[allow(dead_code)]
pub const CACHED_DERIVED: &str = "CachedDerivedRecord";

/// Plain, cached, through, usage-tracked and derived types
#[allow(dead_code)]
pub fn test_registry() -> TypeRegistry {
    TypeRegistry::builder()
        .register(RECORD, SourceableOptions::default())
        .register(CACHED, SourceableOptions::default().cache_column("sourced"))
        .register(THROUGH, SourceableOptions::default().through("item"))
        .register(
            MATERIAL,
            SourceableOptions::default().used_by(["items", "discussions"]),
        )
        .register(DERIVED, SourceableOptions::default().sourced_by("parts"))
        .register(
            CACHED_DERIVED,
            SourceableOptions::default()
                .cache_column("sourced")
                .sourced_by("origin"),
        )
        .build()
        .expect("test registry")
}

/// Store seeded with two holding institutions, a collection and two items
pub struct Fixture<S: ProvenanceStore = Store> {
    pub store: Arc<S>,
    pub provenance: Provenance<S>,
    pub h1: Source,
    pub h2: Source,
    pub c1: Source,
    pub i1: Source,
    pub i2: Source,
}

#[allow(dead_code)]
impl Fixture<Store> {
    pub fn new() -> Self {
        Self::with_store(Arc::new(Store::new()))
    }
}

#[allow(dead_code)]
impl<S: ProvenanceStore> Fixture<S> {
    pub fn with_store(store: Arc<S>) -> Self {
        let fixture = Self {
            provenance: Provenance::new(store.clone(), test_registry()),
            store,
            h1: Source::HoldingInstitution(1),
            h2: Source::HoldingInstitution(2),
            c1: Source::Collection(1),
            i1: Source::Item(1),
            i2: Source::Item(2),
        };
        let mut work = UnitOfWork::new();
        for source in fixture.all_sources() {
            work.insert_source(source);
        }
        fixture.store.commit(work).expect("seed sources");
        fixture
    }

    pub fn all_sources(&self) -> [Source; 5] {
        [self.h1, self.h2, self.c1, self.i1, self.i2]
    }

    pub fn create(&self, type_name: &str, id: u64) -> SourceableRef {
        let record = SourceableRef::new(type_name, id);
        let mut work = UnitOfWork::new();
        work.insert_sourceable(record.clone());
        self.store.commit(work).expect("create sourceable");
        record
    }

    pub fn link(&self, record: &SourceableRef, association: &str, target: SourceableRef) {
        let mut work = UnitOfWork::new();
        work.link(record.clone(), association, target);
        self.store.commit(work).expect("link");
    }

    pub fn create_source(&self, source: Source) {
        let mut work = UnitOfWork::new();
        work.insert_source(source);
        self.store.commit(work).expect("create source");
    }

    /// Delete a source row out-of-band, leaving registry entries behind
    pub fn delete_source(&self, source: Source) {
        let mut work = UnitOfWork::new();
        work.delete_source(source);
        self.store.commit(work).expect("delete source");
    }

    /// Delete a sourceable row out-of-band, leaving its registry entry behind
    pub fn delete_row(&self, record: &SourceableRef) {
        let mut work = UnitOfWork::new();
        work.delete_sourceable(record.clone(), false);
        self.store.commit(work).expect("delete sourceable");
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum SourceOp {
    Add(Vec<Source>),
    Remove(Vec<Source>),
    Set(Vec<Source>),
    Unsource,
}

#[allow(dead_code)]
fn pick_sources(rng: &mut StdRng, pool: &[Source]) -> Vec<Source> {
    let count = rng.random_range(0..=pool.len().min(3));
    (0..count)
        .map(|_| pool[rng.random_range(0..pool.len())])
        .collect()
}

#[allow(dead_code)]
pub fn random_ops(pool: &[Source], count: usize, seed: u64) -> Vec<SourceOp> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        let op = match rng.random_range(0..10) {
            0..=4 => SourceOp::Add(pick_sources(&mut rng, pool)),
            5..=7 => SourceOp::Remove(pick_sources(&mut rng, pool)),
            8 => SourceOp::Set(pick_sources(&mut rng, pool)),
            _ if rng.random_bool(0.5) => SourceOp::Unsource,
            _ => SourceOp::Add(pick_sources(&mut rng, pool)),
        };
        ops.push(op);
    }
    ops
}

#[allow(dead_code)]
pub fn apply_op<S: ProvenanceStore>(
    provenance: &Provenance<S>,
    record: &SourceableRef,
    op: &SourceOp,
) -> provenance_rs::Result<()> {
    match op {
        SourceOp::Add(sources) => provenance.add_sources(record, sources),
        SourceOp::Remove(sources) => provenance.remove_sources(record, sources),
        SourceOp::Set(sources) => provenance.set_sources(record, sources),
        SourceOp::Unsource => provenance.unsource(record),
    }
}

/// Store whose commits fail for chosen records, to exercise partial failures
#[allow(dead_code)]
#[derive(Default)]
pub struct FlakyStore {
    inner: Store,
    poisoned: std::sync::Mutex<Vec<SourceableRef>>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn poison(&self, record: &SourceableRef) {
        self.poisoned.lock().unwrap().push(record.clone());
    }

    pub fn heal(&self) {
        self.poisoned.lock().unwrap().clear();
    }

    fn touches_poisoned(&self, work: &UnitOfWork) -> bool {
        let poisoned = self.poisoned.lock().unwrap();
        work.writes().iter().any(|write| {
            let touched = match write {
                Write::InsertSourceable(record) | Write::DeleteEntry(record) => record,
                Write::DeleteSourceable { sourceable, .. }
                | Write::Link { sourceable, .. }
                | Write::Unlink { sourceable, .. }
                | Write::SetCacheFlag { sourceable, .. } => sourceable,
                Write::PutEntry(entry) => &entry.sourceable,
                Write::InsertSource(_) | Write::DeleteSource(_) => return false,
            };
            poisoned.contains(touched)
        })
    }
}

impl ProvenanceStore for FlakyStore {
    fn entry(&self, sourceable: &SourceableRef) -> provenance_rs::Result<Option<RegistryEntry>> {
        self.inner.entry(sourceable)
    }

    fn sourceable_exists(&self, sourceable: &SourceableRef) -> provenance_rs::Result<bool> {
        self.inner.sourceable_exists(sourceable)
    }

    fn cache_flag(
        &self,
        sourceable: &SourceableRef,
        column: &str,
    ) -> provenance_rs::Result<Option<bool>> {
        self.inner.cache_flag(sourceable, column)
    }

    fn association_targets(
        &self,
        sourceable: &SourceableRef,
        association: &str,
    ) -> provenance_rs::Result<Vec<SourceableRef>> {
        self.inner.association_targets(sourceable, association)
    }

    fn existing_source_ids(
        &self,
        kind: SourceKind,
        ids: &BTreeSet<u64>,
    ) -> provenance_rs::Result<BTreeSet<u64>> {
        self.inner.existing_source_ids(kind, ids)
    }

    fn registry_types(&self) -> provenance_rs::Result<Vec<String>> {
        self.inner.registry_types()
    }

    fn dangling_entries(&self, type_name: &str) -> provenance_rs::Result<Vec<SourceableRef>> {
        self.inner.dangling_entries(type_name)
    }

    fn entries_referencing_missing(
        &self,
        kind: SourceKind,
    ) -> provenance_rs::Result<Vec<RegistryEntry>> {
        self.inner.entries_referencing_missing(kind)
    }

    fn select(&self, type_name: &str, predicate: &Predicate) -> provenance_rs::Result<Vec<u64>> {
        self.inner.select(type_name, predicate)
    }

    fn entry_count(&self) -> provenance_rs::Result<usize> {
        self.inner.entry_count()
    }

    fn commit(&self, work: UnitOfWork) -> provenance_rs::Result<()> {
        if self.touches_poisoned(&work) {
            return Err(anyhow::anyhow!("connection reset by peer").into());
        }
        self.inner.commit(work)
    }
}
