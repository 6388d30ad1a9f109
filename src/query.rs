//! # Scope Query Module
//!
//! Compiles the provenance scopes (sourced, unsourced, sourced-by, used, unused,
//! orphaned) into [`Predicate`] trees. Predicates are evaluated by the store, so
//! filtering happens next to the data instead of over materialized rows.

use crate::config::{SourceableType, Strategy, TypeRegistry};
use crate::error::{ProvenanceError, Result};
use crate::model::{Source, SourceableRef};
use crate::store::ProvenanceStore;

/// Row predicate over one sourceable table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Every row of the table
    All,
    /// A registry entry exists for the row (existence join)
    HasEntry,
    /// The row's boolean column equals `value`; unset columns read as false
    CacheFlag { column: String, value: bool },
    /// The row's registry id-set for the source's kind contains its id
    SourcedBy(Source),
    /// The association has at least one existing target
    Present { association: String },
    /// The association has at least one target that is an existing source
    SourcePresent { association: String },
    /// The association targets this record, and the record exists
    Targets {
        association: String,
        target: SourceableRef,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            Predicate::All => other,
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn negate(self) -> Predicate {
        match self {
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }
}

/// A predicate bound to a sourceable type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub type_name: String,
    pub predicate: Predicate,
}

impl Scope {
    pub fn new(type_name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            type_name: type_name.into(),
            predicate,
        }
    }

    pub fn all(type_name: impl Into<String>) -> Self {
        Self::new(type_name, Predicate::All)
    }

    /// Intersection of two scopes over the same type
    pub fn and(self, other: Scope) -> Result<Scope> {
        if self.type_name != other.type_name {
            return Err(ProvenanceError::configuration(
                self.type_name,
                format!("cannot combine with a scope over {}", other.type_name),
            ));
        }
        Ok(Scope {
            type_name: self.type_name,
            predicate: self.predicate.and(other.predicate),
        })
    }

    /// Complement within the type's table
    pub fn negate(self) -> Scope {
        Scope {
            type_name: self.type_name,
            predicate: self.predicate.negate(),
        }
    }

    /// Matching ids, ascending
    pub fn ids(&self, store: &dyn ProvenanceStore) -> Result<Vec<u64>> {
        store.select(&self.type_name, &self.predicate)
    }

    pub fn fetch(&self, store: &dyn ProvenanceStore) -> Result<Vec<SourceableRef>> {
        Ok(self
            .ids(store)?
            .into_iter()
            .map(|id| SourceableRef::new(self.type_name.clone(), id))
            .collect())
    }

    pub fn count(&self, store: &dyn ProvenanceStore) -> Result<usize> {
        store.count(&self.type_name, &self.predicate)
    }
}

/// One-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: usize,
    pub per: usize,
}

impl Page {
    pub fn new(page: usize, per: usize) -> Self {
        Self {
            page: page.max(1),
            per,
        }
    }

    /// Saturates, so an oversized page lands past the end instead of overflowing
    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1).saturating_mul(self.per)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, per: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paged<T> {
    pub items: Vec<T>,
    /// Count across all pages
    pub total: usize,
    pub page: Option<Page>,
}

impl<T> Paged<T> {
    pub fn num_pages(&self) -> usize {
        match self.page {
            Some(page) if page.per > 0 => self.total.div_ceil(page.per),
            _ => 1,
        }
    }
}

/// Builds scopes for registered types
#[derive(Debug, Clone, Copy)]
pub struct ScopeQueryEngine<'a> {
    types: &'a TypeRegistry,
}

impl<'a> ScopeQueryEngine<'a> {
    pub fn new(types: &'a TypeRegistry) -> Self {
        Self { types }
    }

    pub fn all(&self, type_name: &str) -> Result<Scope> {
        self.types.get(type_name)?;
        Ok(Scope::all(type_name))
    }

    pub fn sourced(&self, type_name: &str) -> Result<Scope> {
        let ty = self.types.get(type_name)?;
        Ok(Scope::new(type_name, sourced_predicate(ty)))
    }

    pub fn unsourced(&self, type_name: &str) -> Result<Scope> {
        let ty = self.types.get(type_name)?;
        Ok(Scope::new(type_name, unsourced_predicate(ty)))
    }

    pub fn sourced_by(&self, type_name: &str, source: Source) -> Result<Scope> {
        let ty = self.types.get(type_name)?;
        let predicate = match &ty.strategy {
            Strategy::Through(association) => Predicate::Targets {
                association: association.clone(),
                target: source.into(),
            },
            Strategy::Registry | Strategy::CacheColumn(_) => Predicate::SourcedBy(source),
        };
        Ok(Scope::new(type_name, predicate))
    }

    pub fn used(&self, type_name: &str) -> Result<Scope> {
        let ty = self.types.get(type_name)?;
        Ok(Scope::new(type_name, used_predicate(ty)?))
    }

    pub fn unused(&self, type_name: &str) -> Result<Scope> {
        let ty = self.types.get(type_name)?;
        Ok(Scope::new(type_name, used_predicate(ty)?.negate()))
    }

    /// `unsourced AND unused` when `used_by` is configured, else `unsourced`
    pub fn orphaned(&self, type_name: &str) -> Result<Scope> {
        let ty = self.types.get(type_name)?;
        let unsourced = unsourced_predicate(ty);
        let predicate = if ty.has_usage() {
            unsourced.and(used_predicate(ty)?.negate())
        } else {
            unsourced
        };
        Ok(Scope::new(type_name, predicate))
    }
}

pub fn sourced_predicate(ty: &SourceableType) -> Predicate {
    match &ty.strategy {
        Strategy::Registry => Predicate::HasEntry,
        Strategy::CacheColumn(column) => Predicate::CacheFlag {
            column: column.clone(),
            value: true,
        },
        Strategy::Through(association) => Predicate::SourcePresent {
            association: association.clone(),
        },
    }
}

pub fn unsourced_predicate(ty: &SourceableType) -> Predicate {
    match &ty.strategy {
        Strategy::CacheColumn(column) => Predicate::CacheFlag {
            column: column.clone(),
            value: false,
        },
        _ => sourced_predicate(ty).negate(),
    }
}

/// Logical OR over the configured usage associations
fn used_predicate(ty: &SourceableType) -> Result<Predicate> {
    if !ty.has_usage() {
        return Err(ProvenanceError::configuration(
            &ty.name,
            "used/unused scopes require used_by associations",
        ));
    }
    let mut parts: Vec<Predicate> = ty
        .used_by
        .iter()
        .map(|association| Predicate::Present {
            association: association.clone(),
        })
        .collect();
    Ok(if parts.len() == 1 {
        parts.remove(0)
    } else {
        Predicate::Or(parts)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceableOptions;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .register("SourceableRecord", SourceableOptions::default())
            .register(
                "CachedSourceableRecord",
                SourceableOptions::default().cache_column("sourced"),
            )
            .register("Material", SourceableOptions::default().used_by(["items", "discussions"]))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unsourced_is_anti_join_for_registry_types() {
        let types = registry();
        let engine = ScopeQueryEngine::new(&types);
        let scope = engine.unsourced("SourceableRecord").unwrap();
        assert_eq!(scope.predicate, Predicate::Not(Box::new(Predicate::HasEntry)));
    }

    #[test]
    fn test_cache_column_scopes_read_the_flag() {
        let types = registry();
        let engine = ScopeQueryEngine::new(&types);
        assert_eq!(
            engine.unsourced("CachedSourceableRecord").unwrap().predicate,
            Predicate::CacheFlag {
                column: "sourced".to_string(),
                value: false
            }
        );
        assert_eq!(
            engine
                .sourced_by("CachedSourceableRecord", Source::Item(1))
                .unwrap()
                .predicate,
            Predicate::SourcedBy(Source::Item(1))
        );
    }

    #[test]
    fn test_orphaned_combines_unsourced_and_unused() {
        let types = registry();
        let engine = ScopeQueryEngine::new(&types);
        let orphaned = engine.orphaned("Material").unwrap();
        let Predicate::And(parts) = orphaned.predicate else {
            panic!("expected conjunction");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], Predicate::Not(Box::new(Predicate::HasEntry)));
        assert!(matches!(&parts[1], Predicate::Not(inner) if matches!(**inner, Predicate::Or(_))));

        let plain = engine.orphaned("SourceableRecord").unwrap();
        assert_eq!(plain.predicate, engine.unsourced("SourceableRecord").unwrap().predicate);
    }

    #[test]
    fn test_unused_requires_used_by() {
        let types = registry();
        let engine = ScopeQueryEngine::new(&types);
        assert!(engine.unused("SourceableRecord").unwrap_err().is_configuration());
        assert!(engine.sourced("Unknown").unwrap_err().is_configuration());
    }

    #[test]
    fn test_scopes_over_different_types_do_not_combine() {
        let a = Scope::all("SourceableRecord");
        let b = Scope::all("Material");
        assert!(a.and(b).is_err());
    }

    #[test]
    fn test_page_offsets() {
        assert_eq!(Page::new(1, 10).offset(), 0);
        assert_eq!(Page::new(3, 10).offset(), 20);
        assert_eq!(Page::new(0, 10).offset(), 0);
        assert_eq!(Page::new(usize::MAX, 2).offset(), usize::MAX);
        let paged: Paged<u64> = Paged {
            items: vec![],
            total: 21,
            page: Some(Page::new(1, 10)),
        };
        assert_eq!(paged.num_pages(), 3);
    }
}
