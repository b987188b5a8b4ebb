//! Source-to-target identifier mappings of one run.

use crate::error::{TransformError, TransformResult};
use crate::id_table::ScopedIdTable;
use reposync_repo::{ClassName, Id64, RepositoryId};
use std::collections::HashMap;

/// Mappings from source identifiers to target identifiers.
///
/// Entities use sharded tables in both directions; code specs, facets and
/// classes use plain maps. Once a source entity is mapped, remapping it to
/// a different target is an error. The well-known root and dictionary
/// entities are pre-mapped to themselves.
#[derive(Debug, Clone)]
pub struct RemapContext {
    entities: ScopedIdTable<Id64, Id64>,
    reverse: ScopedIdTable<Id64, Id64>,
    code_specs: HashMap<Id64, Id64>,
    facets: HashMap<Id64, Id64>,
    classes: HashMap<ClassName, ClassName>,
    scopes: HashMap<Id64, RepositoryId>,
}

impl RemapContext {
    /// Creates a context with the well-known entities mapped to themselves.
    pub fn new() -> Self {
        let mut ctx = Self {
            entities: ScopedIdTable::new(),
            reverse: ScopedIdTable::new(),
            code_specs: HashMap::new(),
            facets: HashMap::new(),
            classes: HashMap::new(),
            scopes: HashMap::new(),
        };
        for id in [Id64::ROOT_ENTITY, Id64::DICTIONARY] {
            ctx.insert_entity(id, id);
        }
        ctx
    }

    fn insert_entity(&mut self, source: Id64, target: Id64) {
        self.entities.insert(source, target);
        self.reverse.insert(target, source);
    }

    /// Maps a source entity to a target entity.
    ///
    /// Repeating an existing mapping is a no-op; mapping to a different
    /// target fails with `RemapConflict`.
    pub fn remap_entity(&mut self, source: Id64, target: Id64) -> TransformResult<()> {
        match self.entities.get(&source) {
            Some(existing) if *existing == target => Ok(()),
            Some(existing) => Err(TransformError::RemapConflict {
                kind: "entity",
                source_id: source,
                existing: *existing,
                requested: target,
            }),
            None => {
                self.insert_entity(source, target);
                Ok(())
            }
        }
    }

    /// Target of a source entity, or [`Id64::INVALID`] if unmapped.
    pub fn find_target_entity(&self, source: Id64) -> Id64 {
        self.entities.get(&source).copied().unwrap_or(Id64::INVALID)
    }

    /// Source entity mapped to `target`, if any.
    pub fn find_source_entity(&self, target: Id64) -> Option<Id64> {
        self.reverse.get(&target).copied()
    }

    /// Returns true if `source` is mapped.
    pub fn has_entity(&self, source: Id64) -> bool {
        self.entities.has(&source)
    }

    /// Removes the mapping of a source entity, returning its target.
    pub fn unmap_entity(&mut self, source: Id64) -> Option<Id64> {
        let target = self.entities.delete(&source)?;
        self.reverse.delete(&target);
        Some(target)
    }

    /// Number of mapped entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Maps a source code spec to a target code spec.
    pub fn remap_code_spec(&mut self, source: Id64, target: Id64) -> TransformResult<()> {
        remap_plain(&mut self.code_specs, "code spec", source, target)
    }

    /// Target of a source code spec, or [`Id64::INVALID`] if unmapped.
    pub fn find_target_code_spec(&self, source: Id64) -> Id64 {
        self.code_specs.get(&source).copied().unwrap_or(Id64::INVALID)
    }

    /// Maps a source facet to a target facet.
    pub fn remap_facet(&mut self, source: Id64, target: Id64) -> TransformResult<()> {
        remap_plain(&mut self.facets, "facet", source, target)
    }

    /// Target of a source facet, or [`Id64::INVALID`] if unmapped.
    pub fn find_target_facet(&self, source: Id64) -> Id64 {
        self.facets.get(&source).copied().unwrap_or(Id64::INVALID)
    }

    /// Renames a source class in the target. Later calls replace earlier ones.
    pub fn remap_class(&mut self, source: ClassName, target: ClassName) {
        self.classes.insert(source, target);
    }

    /// Target class for a source class, if renamed.
    pub fn find_target_class(&self, source: &ClassName) -> Option<&ClassName> {
        self.classes.get(source)
    }

    /// Target class for a source class, falling back to the same name.
    pub fn target_class(&self, source: &ClassName) -> ClassName {
        self.find_target_class(source)
            .cloned()
            .unwrap_or_else(|| source.clone())
    }

    /// Records that `scope` is paired with `repository`.
    ///
    /// Fails with `ScopeConflict` if the scope is already paired with a
    /// different repository.
    pub fn validate_scope(&mut self, scope: Id64, repository: RepositoryId) -> TransformResult<()> {
        match self.scopes.get(&scope) {
            Some(existing) if *existing != repository => Err(TransformError::ScopeConflict {
                scope,
                existing: *existing,
                requested: repository,
            }),
            Some(_) => Ok(()),
            None => {
                self.scopes.insert(scope, repository);
                Ok(())
            }
        }
    }

    /// Repository `scope` is paired with.
    pub fn scope_repository(&self, scope: Id64) -> Option<RepositoryId> {
        self.scopes.get(&scope).copied()
    }
}

impl Default for RemapContext {
    fn default() -> Self {
        Self::new()
    }
}

fn remap_plain(
    map: &mut HashMap<Id64, Id64>,
    kind: &'static str,
    source: Id64,
    target: Id64,
) -> TransformResult<()> {
    match map.get(&source) {
        Some(existing) if *existing != target => Err(TransformError::RemapConflict {
            kind,
            source_id: source,
            existing: *existing,
            requested: target,
        }),
        Some(_) => Ok(()),
        None => {
            map.insert(source, target);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_entities_map_to_themselves() {
        let ctx = RemapContext::new();
        assert_eq!(ctx.find_target_entity(Id64::ROOT_ENTITY), Id64::ROOT_ENTITY);
        assert_eq!(ctx.find_target_entity(Id64::DICTIONARY), Id64::DICTIONARY);
        assert_eq!(ctx.find_target_entity(Id64::new(0x20)), Id64::INVALID);
    }

    #[test]
    fn remap_is_idempotent_and_conflicts_are_rejected() {
        let mut ctx = RemapContext::new();
        ctx.remap_entity(Id64::new(0x20), Id64::new(0x55)).unwrap();
        ctx.remap_entity(Id64::new(0x20), Id64::new(0x55)).unwrap();
        assert_eq!(ctx.find_source_entity(Id64::new(0x55)), Some(Id64::new(0x20)));

        let err = ctx.remap_entity(Id64::new(0x20), Id64::new(0x56)).unwrap_err();
        assert!(matches!(
            err,
            TransformError::RemapConflict { kind: "entity", existing, .. }
                if existing == Id64::new(0x55)
        ));

        assert_eq!(ctx.unmap_entity(Id64::new(0x20)), Some(Id64::new(0x55)));
        assert_eq!(ctx.find_source_entity(Id64::new(0x55)), None);
        ctx.remap_entity(Id64::new(0x20), Id64::new(0x56)).unwrap();
    }

    #[test]
    fn code_specs_facets_and_classes() {
        let mut ctx = RemapContext::new();
        ctx.remap_code_spec(Id64::new(0x21), Id64::new(0x31)).unwrap();
        assert!(ctx.remap_code_spec(Id64::new(0x21), Id64::new(0x32)).is_err());
        assert_eq!(ctx.find_target_code_spec(Id64::new(0x21)), Id64::new(0x31));

        ctx.remap_facet(Id64::new(0x22), Id64::new(0x42)).unwrap();
        assert_eq!(ctx.find_target_facet(Id64::new(0x22)), Id64::new(0x42));
        assert_eq!(ctx.find_target_facet(Id64::new(0x23)), Id64::INVALID);

        let pump = ClassName::new("Plant:Pump");
        assert_eq!(ctx.target_class(&pump), pump);
        ctx.remap_class(pump.clone(), ClassName::new("Target:Pump"));
        assert_eq!(ctx.target_class(&pump).as_str(), "Target:Pump");
    }

    #[test]
    fn scope_pairing() {
        let mut ctx = RemapContext::new();
        let first = RepositoryId::new();
        ctx.validate_scope(Id64::new(0x20), first).unwrap();
        ctx.validate_scope(Id64::new(0x20), first).unwrap();
        assert!(matches!(
            ctx.validate_scope(Id64::new(0x20), RepositoryId::new()),
            Err(TransformError::ScopeConflict { .. })
        ));
        assert_eq!(ctx.scope_repository(Id64::new(0x20)), Some(first));
    }
}
