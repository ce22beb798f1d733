//! # Remote datastore capability
//!
//! The engine talks to the system of record only through [`RemoteStore`].
//! [`MemoryRemote`] keeps the whole datastore in process and answers the
//! identifying subset of the query language; tests, benches and the preview
//! binary run against it.

use crate::error::{Result, SyncError};
use crate::model::{Entity, EntityHandle, Parent, RemoteId, Role, Value};
use crate::query::{convert_value, Condition, FindQuery, FindTarget};
use parking_lot::RwLock;
use std::collections::BTreeMap;

pub trait RemoteStore: Send + Sync {
    /// Fails with [`SyncError::NotFound`] when no entity carries `id`.
    fn retrieve_by_id(&self, id: RemoteId) -> Result<Entity>;

    /// Fails with [`SyncError::NotFound`] when no file lives at `path`.
    fn retrieve_by_path(&self, path: &str) -> Result<Entity>;

    /// The unique entity called `name`.
    fn retrieve_by_name(&self, name: &str) -> Result<Entity>;

    /// With `unique`, anything but exactly one result is an error.
    fn query(&self, query: &str, unique: bool) -> Result<Vec<Entity>>;

    /// Insert a batch and return the new ids in batch order. References of the
    /// form `Value::Entity(EntityHandle(i))` point at the i-th batch entity.
    fn insert(&self, entities: &[Entity], unique_names: bool) -> Result<Vec<RemoteId>>;

    /// Replace existing entities. References follow the same batch convention
    /// as [`RemoteStore::insert`].
    fn update(&self, entities: &[Entity], unique_names: bool) -> Result<()>;

    /// Names of `name` and of all record types inheriting from it.
    fn get_children_of_recordtype(&self, name: &str) -> Result<Vec<String>>;
}

/// Call counters of a [`MemoryRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub retrieves_by_id: usize,
    pub retrieves_by_path: usize,
    pub retrieves_by_name: usize,
    pub queries: usize,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<RemoteId, Entity>,
    next_id: RemoteId,
    max_query_length: Option<usize>,
    stats: RemoteStats,
}

#[derive(Debug)]
pub struct MemoryRemote {
    state: RwLock<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
        }
    }

    /// Load a snapshot; entities keep their ids, entities without id get fresh ones.
    pub fn from_entities(entities: Vec<Entity>) -> Self {
        let remote = Self::new();
        for entity in entities {
            remote.add_entity(entity);
        }
        remote
    }

    /// Queries longer than `length` are rejected, as a server would.
    pub fn with_max_query_length(self, length: usize) -> Self {
        self.state.write().max_query_length = Some(length);
        self
    }

    pub fn add_entity(&self, mut entity: Entity) -> RemoteId {
        let mut state = self.state.write();
        let id = match entity.id {
            Some(id) => id,
            None => state.next_id,
        };
        state.next_id = state.next_id.max(id + 1);
        entity.id = Some(id);
        state.entities.insert(id, entity);
        id
    }

    pub fn add_record_type(&self, name: &str, parent: Option<&str>) -> RemoteId {
        let mut entity = Entity::new(Role::RecordType).with_name(name);
        if let Some(parent) = parent {
            entity.parents.push(Parent::new(parent));
        }
        self.add_entity(entity)
    }

    pub fn add_property(&self, name: &str, datatype: &str) -> RemoteId {
        let mut entity = Entity::new(Role::Property).with_name(name);
        entity.datatype = Some(datatype.to_string());
        self.add_entity(entity)
    }

    pub fn get(&self, id: RemoteId) -> Option<Entity> {
        self.state.read().entities.get(&id).cloned()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.state.read().entities.values().cloned().collect()
    }

    /// Records (not schema entities) currently stored.
    pub fn records(&self) -> Vec<Entity> {
        self.state
            .read()
            .entities
            .values()
            .filter(|e| matches!(e.role, Role::Record | Role::File))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RemoteStats {
        self.state.read().stats
    }

    pub fn reset_stats(&self) {
        self.state.write().stats = RemoteStats::default();
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn record_type_family(&self, name: &str) -> Vec<String> {
        let mut family = Vec::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            let Some(found) = self.entities.values().find(|e| {
                e.role == Role::RecordType
                    && e.name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&current))
            }) else {
                continue;
            };
            let Some(found_name) = found.name.clone() else {
                continue;
            };
            if family.contains(&found_name) {
                continue;
            }
            for child in self.entities.values() {
                if child.role == Role::RecordType && child.has_parent(&found_name) {
                    if let Some(child_name) = &child.name {
                        frontier.push(child_name.clone());
                    }
                }
            }
            family.push(found_name);
        }
        // types unknown to the schema stand for themselves
        if family.is_empty() {
            family.push(name.to_string());
        }
        family
    }

    fn matches(&self, query: &FindQuery, family: &[String], entity: &Entity) -> bool {
        let role_matches = match query.target {
            FindTarget::Record => matches!(entity.role, Role::Record | Role::File),
            FindTarget::RecordType => entity.role == Role::RecordType,
            FindTarget::Entity => true,
        };
        if !role_matches {
            return false;
        }
        if query.record_type.is_some() {
            let typed = match query.target {
                FindTarget::RecordType => entity
                    .name
                    .as_deref()
                    .is_some_and(|name| family.iter().any(|f| f == name)),
                _ => family.iter().any(|f| entity.has_parent(f)),
            };
            if !typed {
                return false;
            }
        }
        let Some(id) = entity.id else {
            return false;
        };
        for referencing in &query.referenced_by {
            let Some(source) = self.entities.get(referencing) else {
                return false;
            };
            let references = source
                .properties
                .iter()
                .any(|p| p.value.as_ref().is_some_and(|value| references_id(value, id)));
            if !references {
                return false;
            }
        }
        query.conditions.iter().all(|condition| match condition {
            Condition::NameEquals(name) => entity.name.as_deref() == Some(name.as_str()),
            Condition::Equals { property, value } => entity.properties.iter().any(|p| {
                &p.name == property
                    && p.value
                        .as_ref()
                        .is_some_and(|v| unescaped_literals(v).contains(value))
            }),
            Condition::Like { property, prefix } => entity.properties.iter().any(|p| {
                &p.name == property
                    && p.value
                        .as_ref()
                        .is_some_and(|v| {
                            unescaped_literals(v).iter().any(|l| l.starts_with(prefix))
                        })
            }),
            Condition::IsNull { property } => entity
                .properties
                .iter()
                .filter(|p| &p.name == property)
                .all(|p| p.value.is_none()),
        })
    }

    fn store_batch(&mut self, entities: &[Entity], ids: &[RemoteId]) -> Result<()> {
        for (entity, id) in entities.iter().zip(ids) {
            let mut stored = entity.clone();
            stored.id = Some(*id);
            for property in &mut stored.properties {
                if let Some(value) = property.value.as_mut() {
                    bind_batch_handles(value, ids)?;
                }
            }
            self.entities.insert(*id, stored);
        }
        Ok(())
    }

    fn check_unique_names(&self, entities: &[Entity], ids: &[RemoteId]) -> Result<()> {
        for (entity, id) in entities.iter().zip(ids) {
            let Some(name) = &entity.name else {
                continue;
            };
            let clash = self
                .entities
                .values()
                .any(|other| other.id != Some(*id) && other.name.as_ref() == Some(name));
            let batch_clash = entities
                .iter()
                .zip(ids)
                .any(|(other, other_id)| other_id != id && other.name.as_ref() == Some(name));
            if clash || batch_clash {
                return Err(SyncError::remote(format!("name '{name}' is not unique")));
            }
        }
        Ok(())
    }
}

fn references_id(value: &Value, id: RemoteId) -> bool {
    match value {
        Value::Id(target) => *target == id,
        Value::List(items) => items.iter().any(|item| references_id(item, id)),
        _ => false,
    }
}

/// Literal forms as they appear after unescaping a query literal.
fn unescaped_literals(value: &Value) -> Vec<String> {
    match value {
        Value::List(items) => items.iter().flat_map(unescaped_literals).collect(),
        Value::Text(text) => vec![text.clone()],
        other => vec![convert_value(other)],
    }
}

fn bind_batch_handles(value: &mut Value, ids: &[RemoteId]) -> Result<()> {
    match value {
        Value::Entity(handle) => {
            let id = ids
                .get(handle.index())
                .copied()
                .ok_or_else(|| SyncError::remote(format!("unresolved reference {handle}")))?;
            *value = Value::Id(id);
        }
        Value::List(items) => {
            for item in items {
                bind_batch_handles(item, ids)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl RemoteStore for MemoryRemote {
    fn retrieve_by_id(&self, id: RemoteId) -> Result<Entity> {
        let mut state = self.state.write();
        state.stats.retrieves_by_id += 1;
        state
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("entity {id}")))
    }

    fn retrieve_by_path(&self, path: &str) -> Result<Entity> {
        let mut state = self.state.write();
        state.stats.retrieves_by_path += 1;
        state
            .entities
            .values()
            .find(|e| e.path.as_deref() == Some(path))
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("file {path}")))
    }

    fn retrieve_by_name(&self, name: &str) -> Result<Entity> {
        let mut state = self.state.write();
        state.stats.retrieves_by_name += 1;
        let mut found = state
            .entities
            .values()
            .filter(|e| e.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)));
        match (found.next(), found.next()) {
            (Some(entity), None) => Ok(entity.clone()),
            (None, _) => Err(SyncError::not_found(format!("entity named '{name}'"))),
            (Some(_), Some(_)) => Err(SyncError::QueryNotUnique {
                query: format!("name='{name}'"),
                count: 2,
            }),
        }
    }

    fn query(&self, query: &str, unique: bool) -> Result<Vec<Entity>> {
        let mut state = self.state.write();
        state.stats.queries += 1;
        if let Some(max) = state.max_query_length {
            if query.len() > max {
                return Err(SyncError::QueryRejected {
                    message: format!("query of {} bytes exceeds {max}", query.len()),
                });
            }
        }
        let parsed = FindQuery::parse(query)?;
        let family = match &parsed.record_type {
            Some(record_type) => state.record_type_family(record_type),
            None => Vec::new(),
        };
        let results: Vec<Entity> = state
            .entities
            .values()
            .filter(|entity| state.matches(&parsed, &family, entity))
            .cloned()
            .collect();
        if unique && results.len() != 1 {
            return Err(SyncError::QueryNotUnique {
                query: query.to_string(),
                count: results.len(),
            });
        }
        Ok(results)
    }

    fn insert(&self, entities: &[Entity], unique_names: bool) -> Result<Vec<RemoteId>> {
        let mut state = self.state.write();
        if let Some(entity) = entities.iter().find(|e| e.id.is_some()) {
            return Err(SyncError::remote(format!(
                "{} already has an id and cannot be inserted",
                entity.label()
            )));
        }
        let first = state.next_id;
        let ids: Vec<RemoteId> = (0..entities.len() as RemoteId).map(|i| first + i).collect();
        if unique_names {
            state.check_unique_names(entities, &ids)?;
        }
        for entity in entities {
            for property in &entity.properties {
                if let Some(bad) = property
                    .value
                    .as_ref()
                    .map(Value::entity_handles)
                    .unwrap_or_default()
                    .into_iter()
                    .find(|h: &EntityHandle| h.index() >= ids.len())
                {
                    return Err(SyncError::remote(format!("unresolved reference {bad}")));
                }
            }
        }
        state.store_batch(entities, &ids)?;
        state.next_id = first + entities.len() as RemoteId;
        state.stats.inserted += entities.len();
        Ok(ids)
    }

    fn update(&self, entities: &[Entity], unique_names: bool) -> Result<()> {
        let mut state = self.state.write();
        let mut ids = Vec::with_capacity(entities.len());
        for entity in entities {
            match entity.id {
                Some(id) if state.entities.contains_key(&id) => ids.push(id),
                _ => {
                    return Err(SyncError::remote(format!(
                        "{} does not exist and cannot be updated",
                        entity.label()
                    )))
                }
            }
        }
        if unique_names {
            state.check_unique_names(entities, &ids)?;
        }
        state.store_batch(entities, &ids)?;
        state.stats.updated += entities.len();
        Ok(())
    }

    fn get_children_of_recordtype(&self, name: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        Ok(state.record_type_family(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.add_record_type("Experiment", None);
        remote.add_record_type("SpecialExperiment", Some("Experiment"));
        remote.add_record_type("Project", None);
        remote
    }

    #[test]
    fn test_query_matches_children_and_conditions() {
        let remote = seeded();
        let project = remote.add_entity(Entity::record().with_parent("Project").with_name("p1"));
        remote.add_entity(
            Entity::record()
                .with_parent("SpecialExperiment")
                .with_property("date", "2024-01-01")
                .with_property("project", Value::Id(project)),
        );

        let found = remote
            .query(
                &format!(
                    "FIND RECORD 'Experiment' WITH 'date'='2024-01-01' \
                     AND 'project'='{project}'"
                ),
                false,
            )
            .unwrap();
        assert_eq!(found.len(), 1);

        let found = remote
            .query("FIND RECORD 'Experiment' WITH 'date' LIKE '2024*'", false)
            .unwrap();
        assert_eq!(found.len(), 1);

        let found = remote
            .query("FIND RECORD 'Project' WITH name='p1' AND 'comment' IS NULL", true)
            .unwrap();
        assert_eq!(found[0].id, Some(project));

        assert!(remote.query("FIND RECORD 'Project' WITH name='p2'", true).is_err());
        assert_eq!(remote.stats().queries, 4);
    }

    #[test]
    fn test_referenced_by() {
        let remote = seeded();
        let project = remote.add_entity(Entity::record().with_parent("Project").with_name("p1"));
        let experiment = remote.add_entity(
            Entity::record()
                .with_parent("Experiment")
                .with_property("project", Value::Id(project)),
        );
        let query = format!("FIND RECORD 'Project' WHICH IS REFERENCED BY {experiment}");
        assert_eq!(remote.query(&query, false).unwrap().len(), 1);
        let query = format!("FIND RECORD 'Project' WHICH IS REFERENCED BY {project}");
        assert!(remote.query(&query, false).unwrap().is_empty());
    }

    #[test]
    fn test_insert_binds_batch_handles() {
        let remote = seeded();
        let batch = vec![
            Entity::record()
                .with_parent("Experiment")
                .with_property("project", EntityHandle(1)),
            Entity::record().with_parent("Project").with_name("p"),
        ];
        let ids = remote.insert(&batch, true).unwrap();
        let experiment = remote.get(ids[0]).unwrap();
        assert_eq!(
            experiment.get_property("project").and_then(|p| p.value.clone()),
            Some(Value::Id(ids[1]))
        );
        assert!(remote.insert(&batch[1..], true).is_err());
        assert_eq!(remote.records().len(), 2);
    }

    #[test]
    fn test_children_and_rejection() {
        let remote = seeded().with_max_query_length(30);
        let mut children = remote.get_children_of_recordtype("experiment").unwrap();
        children.sort();
        assert_eq!(children, vec!["Experiment", "SpecialExperiment"]);
        assert!(matches!(
            remote.query("FIND RECORD 'Experiment' WITH 'a'='b'", false),
            Err(SyncError::QueryRejected { .. })
        ));
    }

    #[test]
    fn test_retrieve_errors_are_not_found() {
        let remote = seeded();
        assert!(matches!(remote.retrieve_by_id(999), Err(SyncError::NotFound { .. })));
        assert!(matches!(
            remote.retrieve_by_path("/nope"),
            Err(SyncError::NotFound { .. })
        ));
        assert_eq!(remote.retrieve_by_name("project").unwrap().role, Role::RecordType);
    }
}
