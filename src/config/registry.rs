//! Registration table of sourceable types.
//!
//! Built once at startup from [`ProvenanceConfig`](super::ProvenanceConfig) or the
//! builder, and immutable afterwards.

use super::{ProvenanceConfig, SourceableOptions};
use crate::error::{ProvenanceError, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Where a type's sourced state lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Registry rows only
    Registry,
    /// Registry rows mirrored into a boolean column on the sourceable row
    CacheColumn(String),
    /// Derived from a live association; no registry rows
    Through(String),
}

/// A registered sourceable type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceableType {
    pub name: String,
    pub strategy: Strategy,
    pub used_by: Vec<String>,
    /// Association followed by `update_sources`
    pub sourced_by: Option<String>,
}

impl SourceableType {
    /// Plain registry-backed type with no usage associations
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: Strategy::Registry,
            used_by: Vec::new(),
            sourced_by: None,
        }
    }

    pub fn from_options(name: impl Into<String>, options: &SourceableOptions) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProvenanceError::configuration(
                "<unnamed>",
                "sourceable type name must not be empty",
            ));
        }
        let strategy = match (&options.cache_column, &options.through) {
            (Some(_), Some(_)) => {
                return Err(ProvenanceError::configuration(
                    name,
                    "cache_column and through are mutually exclusive",
                ))
            }
            (Some(column), None) if column.is_empty() => {
                return Err(ProvenanceError::configuration(name, "cache_column is empty"))
            }
            (None, Some(association)) if association.is_empty() => {
                return Err(ProvenanceError::configuration(name, "through is empty"))
            }
            (Some(column), None) => Strategy::CacheColumn(column.clone()),
            (None, Some(association)) => Strategy::Through(association.clone()),
            (None, None) => Strategy::Registry,
        };
        match (&options.sourced_by, &strategy) {
            (Some(_), Strategy::Through(_)) => {
                return Err(ProvenanceError::configuration(
                    name,
                    "sourced_by and through are mutually exclusive",
                ))
            }
            (Some(association), _) if association.is_empty() => {
                return Err(ProvenanceError::configuration(name, "sourced_by is empty"))
            }
            _ => {}
        }
        if options.used_by.iter().any(String::is_empty) {
            return Err(ProvenanceError::configuration(
                name,
                "used_by contains an empty association name",
            ));
        }
        Ok(Self {
            name,
            strategy,
            used_by: options.used_by.clone(),
            sourced_by: options.sourced_by.clone(),
        })
    }

    pub fn cache_column(&self) -> Option<&str> {
        match &self.strategy {
            Strategy::CacheColumn(column) => Some(column),
            _ => None,
        }
    }

    pub fn through(&self) -> Option<&str> {
        match &self.strategy {
            Strategy::Through(association) => Some(association),
            _ => None,
        }
    }

    /// Sources of `through` types are derived and cannot be written
    pub fn is_read_only(&self) -> bool {
        matches!(self.strategy, Strategy::Through(_))
    }

    pub fn has_usage(&self) -> bool {
        !self.used_by.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, SourceableType>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn from_config(config: &ProvenanceConfig) -> Result<Self> {
        config
            .types
            .iter()
            .fold(Self::builder(), |builder, (name, options)| {
                builder.register(name.clone(), options.clone())
            })
            .build()
    }

    /// Registered type by name, or a configuration error
    pub fn get(&self, name: &str) -> Result<&SourceableType> {
        self.types
            .get(name)
            .ok_or_else(|| ProvenanceError::configuration(name, "type is not registered"))
    }

    pub fn lookup(&self, name: &str) -> Option<&SourceableType> {
        self.types.get(name)
    }

    /// Registered type, or a plain registry type for names that are only
    /// present in stored entries
    pub fn resolve_or_plain(&self, name: &str) -> Cow<'_, SourceableType> {
        match self.types.get(name) {
            Some(ty) => Cow::Borrowed(ty),
            None => Cow::Owned(SourceableType::plain(name)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceableType> {
        self.types.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    entries: Vec<(String, SourceableOptions)>,
}

impl TypeRegistryBuilder {
    pub fn register(mut self, name: impl Into<String>, options: SourceableOptions) -> Self {
        self.entries.push((name.into(), options));
        self
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let mut types = BTreeMap::new();
        for (name, options) in self.entries {
            let ty = SourceableType::from_options(name, &options)?;
            if types.contains_key(&ty.name) {
                return Err(ProvenanceError::configuration(
                    ty.name,
                    "type registered more than once",
                ));
            }
            types.insert(ty.name.clone(), ty);
        }
        Ok(TypeRegistry { types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_options() {
        let registry = TypeRegistry::builder()
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

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get("SourceableRecord").unwrap().strategy,
            Strategy::Registry
        );
        assert_eq!(
            registry.get("CachedSourceableRecord").unwrap().cache_column(),
            Some("sourced")
        );
        assert!(registry.get("SourceableThroughRecord").unwrap().is_read_only());
    }

    #[test]
    fn test_through_and_cache_column_are_exclusive() {
        let err = TypeRegistry::builder()
            .register(
                "Broken",
                SourceableOptions::default().cache_column("sourced").through("item"),
            )
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_sourced_by_cannot_combine_with_through() {
        let err = TypeRegistry::builder()
            .register(
                "Broken",
                SourceableOptions::default().through("item").sourced_by("item"),
            )
            .build()
            .unwrap_err();
        assert!(err.is_configuration());

        let registry = TypeRegistry::builder()
            .register(
                "Excerpt",
                SourceableOptions::default()
                    .cache_column("sourced")
                    .sourced_by("documents"),
            )
            .build()
            .unwrap();
        let excerpt = registry.lookup("Excerpt").unwrap();
        assert_eq!(excerpt.sourced_by.as_deref(), Some("documents"));
        assert_eq!(excerpt.cache_column(), Some("sourced"));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let err = TypeRegistry::builder()
            .register("SourceableRecord", SourceableOptions::default())
            .register("SourceableRecord", SourceableOptions::default())
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_type_lookup() {
        let registry = TypeRegistry::default();
        assert!(registry.get("Nope").unwrap_err().is_configuration());
        let plain = registry.resolve_or_plain("Nope");
        assert_eq!(plain.strategy, Strategy::Registry);
    }
}
