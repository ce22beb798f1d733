//! Index over the entities classified during one reconciliation run.

use crate::error::{Result, SyncError};
use crate::identifiable::Identifiable;
use crate::model::{Entity, EntityHandle, RemoteId};
use hashbrown::HashMap;
use rustc_hash::FxHashSet;

/// Entities already known to exist remotely ("existing") or known to be
/// absent ("missing"), reachable by id, path and identifiable.
///
/// Missing entities receive negative placeholder ids, counting down from -1,
/// so they can be referenced by id before they are inserted.
#[derive(Debug)]
pub struct TreatedRecordLookup {
    by_id: HashMap<RemoteId, EntityHandle>,
    by_path: HashMap<String, EntityHandle>,
    by_identifiable: HashMap<String, EntityHandle>,
    existing: Vec<EntityHandle>,
    missing: Vec<EntityHandle>,
    existing_set: FxHashSet<EntityHandle>,
    missing_set: FxHashSet<EntityHandle>,
    next_placeholder: RemoteId,
}

impl Default for TreatedRecordLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl TreatedRecordLookup {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_path: HashMap::new(),
            by_identifiable: HashMap::new(),
            existing: Vec::new(),
            missing: Vec::new(),
            existing_set: FxHashSet::default(),
            missing_set: FxHashSet::default(),
            next_placeholder: -1,
        }
    }

    /// Register a classified entity. Entities without id are missing and get
    /// the next placeholder id.
    pub fn add(
        &mut self,
        handle: EntityHandle,
        entity: &mut Entity,
        identifiable: Option<&Identifiable>,
    ) -> Result<()> {
        if entity.id.is_none() && entity.path.is_none() && identifiable.is_none() {
            return Err(SyncError::Unindexable {
                entity: entity.label(),
            });
        }
        match entity.id {
            None => {
                entity.id = Some(self.next_placeholder);
                self.next_placeholder -= 1;
                self.missing.push(handle);
                self.missing_set.insert(handle);
            }
            Some(_) => {
                self.existing.push(handle);
                self.existing_set.insert(handle);
            }
        }
        if let Some(id) = entity.id {
            self.by_id.insert(id, handle);
        }
        if let Some(path) = &entity.path {
            self.by_path.insert(path.clone(), handle);
        }
        if let Some(identifiable) = identifiable {
            self.by_identifiable
                .insert(identifiable.get_representation(), handle);
        }
        Ok(())
    }

    /// Resolve by id, then path, then identifiable.
    pub fn get_any(
        &self,
        entity: &Entity,
        identifiable: Option<&Identifiable>,
    ) -> Option<EntityHandle> {
        if let Some(found) = entity.id.and_then(|id| self.by_id.get(&id)) {
            return Some(*found);
        }
        if let Some(found) = entity.path.as_ref().and_then(|p| self.by_path.get(p)) {
            return Some(*found);
        }
        identifiable.and_then(|i| self.by_identifiable.get(&i.get_representation()).copied())
    }

    pub fn get_existing(
        &self,
        entity: &Entity,
        identifiable: Option<&Identifiable>,
    ) -> Option<EntityHandle> {
        self.get_any(entity, identifiable)
            .filter(|handle| self.existing_set.contains(handle))
    }

    pub fn get_missing(
        &self,
        entity: &Entity,
        identifiable: Option<&Identifiable>,
    ) -> Option<EntityHandle> {
        self.get_any(entity, identifiable)
            .filter(|handle| self.missing_set.contains(handle))
    }

    /// Whether `id` is the placeholder of a missing entity.
    pub fn is_missing_id(&self, id: RemoteId) -> bool {
        self.by_id
            .get(&id)
            .is_some_and(|handle| self.missing_set.contains(handle))
    }

    pub fn get_missing_list(&self) -> Vec<EntityHandle> {
        self.missing.clone()
    }

    pub fn get_existing_list(&self) -> Vec<EntityHandle> {
        self.existing.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiable::IdentValue;
    use crate::model::Value;

    fn ident(name: &str) -> Identifiable {
        Identifiable {
            record_type: Some("Project".into()),
            properties: vec![("code".into(), Some(IdentValue::Scalar(Value::text(name))))],
            ..Identifiable::default()
        }
    }

    #[test]
    fn test_placeholders_count_down() {
        let mut lookup = TreatedRecordLookup::new();
        let mut a = Entity::record();
        let mut b = Entity::record();
        lookup.add(EntityHandle(0), &mut a, Some(&ident("a"))).unwrap();
        lookup.add(EntityHandle(1), &mut b, Some(&ident("b"))).unwrap();
        assert_eq!(a.id, Some(-1));
        assert_eq!(b.id, Some(-2));
        assert_eq!(lookup.get_missing_list(), vec![EntityHandle(0), EntityHandle(1)]);
        assert!(lookup.get_existing_list().is_empty());
        assert!(lookup.is_missing_id(-2));
    }

    #[test]
    fn test_resolution_order() {
        let mut lookup = TreatedRecordLookup::new();
        let mut by_id = Entity::record().with_id(5);
        let mut by_path = Entity::file("/data/x");
        lookup.add(EntityHandle(0), &mut by_id, Some(&ident("a"))).unwrap();
        lookup.add(EntityHandle(1), &mut by_path, None).unwrap();

        let probe = Entity::record().with_id(5).with_path("/data/x");
        assert_eq!(lookup.get_any(&probe, None), Some(EntityHandle(0)));
        let probe = Entity::record().with_path("/data/x");
        assert_eq!(lookup.get_any(&probe, Some(&ident("a"))), Some(EntityHandle(1)));
        assert_eq!(lookup.get_any(&Entity::record(), Some(&ident("a"))), Some(EntityHandle(0)));
        assert_eq!(lookup.get_any(&Entity::record(), Some(&ident("z"))), None);
    }

    #[test]
    fn test_membership_filters() {
        let mut lookup = TreatedRecordLookup::new();
        let mut existing = Entity::record().with_id(5);
        let mut missing = Entity::record();
        lookup.add(EntityHandle(0), &mut existing, None).unwrap();
        lookup.add(EntityHandle(1), &mut missing, Some(&ident("m"))).unwrap();

        let probe = Entity::record();
        assert_eq!(lookup.get_existing(&probe, Some(&ident("m"))), None);
        assert_eq!(lookup.get_missing(&probe, Some(&ident("m"))), Some(EntityHandle(1)));
        let probe = Entity::record().with_id(5);
        assert_eq!(lookup.get_existing(&probe, None), Some(EntityHandle(0)));
        assert_eq!(lookup.get_missing(&probe, None), None);
    }

    #[test]
    fn test_unindexable_entity_is_rejected() {
        let mut lookup = TreatedRecordLookup::new();
        let mut entity = Entity::record();
        assert!(matches!(
            lookup.add(EntityHandle(0), &mut entity, None),
            Err(SyncError::Unindexable { .. })
        ));
        assert_eq!(entity.id, None);
    }
}
