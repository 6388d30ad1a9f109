//! # Data Model
//!
//! Core data structures for provenance tracking: the closed set of source kinds,
//! references to sourceable records, and the registry entries linking the two.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kinds of entity that can originate a sourceable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    HoldingInstitution,
    Collection,
    Item,
}

impl SourceKind {
    /// Every tracked kind, in registry order
    pub const ALL: [SourceKind; 3] = [
        SourceKind::HoldingInstitution,
        SourceKind::Collection,
        SourceKind::Item,
    ];

    /// Type name used when a source is referenced as an association target
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::HoldingInstitution => "HoldingInstitution",
            SourceKind::Collection => "Collection",
            SourceKind::Item => "Item",
        }
    }

    /// Kind named by a type name, if any
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "HoldingInstitution" => Some(SourceKind::HoldingInstitution),
            "Collection" => Some(SourceKind::Collection),
            "Item" => Some(SourceKind::Item),
            _ => None,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            SourceKind::HoldingInstitution => 0,
            SourceKind::Collection => 1,
            SourceKind::Item => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SourceKind::HoldingInstitution),
            1 => Some(SourceKind::Collection),
            2 => Some(SourceKind::Item),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::from_name(s).ok_or_else(|| anyhow::anyhow!("unknown source kind: {s}"))
    }
}

/// A source entity, tagged by kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    HoldingInstitution(u64),
    Collection(u64),
    Item(u64),
}

impl Source {
    pub fn new(kind: SourceKind, id: u64) -> Self {
        match kind {
            SourceKind::HoldingInstitution => Source::HoldingInstitution(id),
            SourceKind::Collection => Source::Collection(id),
            SourceKind::Item => Source::Item(id),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::HoldingInstitution(_) => SourceKind::HoldingInstitution,
            Source::Collection(_) => SourceKind::Collection,
            Source::Item(_) => SourceKind::Item,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Source::HoldingInstitution(id) | Source::Collection(id) | Source::Item(id) => *id,
        }
    }

    /// The source an association target points at, when its type is a source kind
    pub fn from_target(target: &SourceableRef) -> Option<Self> {
        SourceKind::from_name(&target.type_name).map(|kind| Source::new(kind, target.id))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.id())
    }
}

impl TryFrom<&SourceableRef> for Source {
    type Error = anyhow::Error;

    fn try_from(target: &SourceableRef) -> Result<Self, Self::Error> {
        let kind: SourceKind = target.type_name.parse()?;
        Ok(Source::new(kind, target.id))
    }
}

/// Compact identifier for registry entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Weak reference to a record of any tracked type, identified by `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceableRef {
    pub type_name: String,
    pub id: u64,
}

impl SourceableRef {
    pub fn new(type_name: impl Into<String>, id: u64) -> Self {
        Self {
            type_name: type_name.into(),
            id,
        }
    }
}

impl fmt::Display for SourceableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.id)
    }
}

impl From<Source> for SourceableRef {
    fn from(source: Source) -> Self {
        SourceableRef::new(source.kind().as_str(), source.id())
    }
}

/// The three id-sets embedded in a registry row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    pub holding_institution_ids: BTreeSet<u64>,
    pub collection_ids: BTreeSet<u64>,
    pub item_ids: BTreeSet<u64>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources<'a>(sources: impl IntoIterator<Item = &'a Source>) -> Self {
        let mut set = Self::new();
        for source in sources {
            set.insert(*source);
        }
        set
    }

    pub fn ids(&self, kind: SourceKind) -> &BTreeSet<u64> {
        match kind {
            SourceKind::HoldingInstitution => &self.holding_institution_ids,
            SourceKind::Collection => &self.collection_ids,
            SourceKind::Item => &self.item_ids,
        }
    }

    pub fn ids_mut(&mut self, kind: SourceKind) -> &mut BTreeSet<u64> {
        match kind {
            SourceKind::HoldingInstitution => &mut self.holding_institution_ids,
            SourceKind::Collection => &mut self.collection_ids,
            SourceKind::Item => &mut self.item_ids,
        }
    }

    /// Returns true if the source was not already present
    pub fn insert(&mut self, source: Source) -> bool {
        self.ids_mut(source.kind()).insert(source.id())
    }

    /// Returns true if the source was present
    pub fn remove(&mut self, source: &Source) -> bool {
        self.ids_mut(source.kind()).remove(&source.id())
    }

    pub fn contains(&self, source: &Source) -> bool {
        self.ids(source.kind()).contains(&source.id())
    }

    pub fn is_empty(&self) -> bool {
        SourceKind::ALL.iter().all(|kind| self.ids(*kind).is_empty())
    }

    pub fn len(&self) -> usize {
        SourceKind::ALL.iter().map(|kind| self.ids(*kind).len()).sum()
    }

    /// Sources ordered by kind, then id
    pub fn iter(&self) -> impl Iterator<Item = Source> + '_ {
        SourceKind::ALL.into_iter().flat_map(move |kind| {
            self.ids(kind).iter().map(move |id| Source::new(kind, *id))
        })
    }

    pub fn to_vec(&self) -> Vec<Source> {
        self.iter().collect()
    }
}

/// Persisted provenance fact: one row per sourceable, holding every source id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Assigned by the store on first write; `EntryId(0)` means unassigned
    pub id: EntryId,
    pub sourceable: SourceableRef,
    pub sources: SourceSet,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RegistryEntry {
    pub fn new(sourceable: SourceableRef, sources: SourceSet) -> Self {
        let now = now_millis();
        Self {
            id: EntryId(0),
            sourceable,
            sources,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same row with a replacement id-set and a fresh `updated_at`
    pub fn with_sources(&self, sources: SourceSet) -> Self {
        Self {
            id: self.id,
            sourceable: self.sourceable.clone(),
            sources,
            created_at: self.created_at,
            updated_at: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
