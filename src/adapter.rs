//! # Identifiable adapters
//!
//! An [`IdentifiableAdapter`] turns an entity into its [`Identifiable`] and
//! looks identifiables up. [`LocalStorageIdentifiableAdapter`] keeps records
//! in memory; [`RemoteIdentifiableAdapter`] queries a [`RemoteStore`].

use crate::error::{Result, SyncError};
use crate::graph::{EntityGraph, Referencing};
use crate::identifiable::{IdentValue, Identifiable};
use crate::model::{Entity, EntityHandle, RemoteId, Value};
use crate::query::create_query_for_identifiable;
use crate::registry::{IdentifiableRegistry, IdentifyingProperty, RegisteredIdentifiable};
use crate::remote::RemoteStore;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub trait IdentifiableAdapter {
    /// The template that applies to `entity`, chosen by its first parent.
    fn get_registered_identifiable(&self, entity: &Entity)
        -> Result<Option<RegisteredIdentifiable>>;

    /// `name` plus every record type inheriting from it.
    fn get_children_of_recordtype(&self, name: &str) -> Result<Vec<String>>;

    /// The stored entity matching `identifiable`; more than one match is an error.
    fn retrieve_identified_record_for_identifiable(
        &self,
        identifiable: &Identifiable,
    ) -> Result<Option<Entity>>;

    /// Forget cached lookups so later calls observe fresh writes.
    fn clear_cache(&self) {}

    /// Ids of the entities that make up the `is_referenced_by` part of the identity.
    fn get_identifying_referencing_entities(
        &self,
        referencing: &Referencing,
        registered: &RegisteredIdentifiable,
    ) -> Result<Vec<Option<RemoteId>>> {
        let mut backrefs = Vec::new();
        for types in registered.referencing_types() {
            let mut found = false;
            for record_type in types {
                if record_type == "*" {
                    for ids in referencing.values() {
                        found |= !ids.is_empty();
                        backrefs.extend(ids.iter().copied());
                    }
                    continue;
                }
                for child in self.get_children_of_recordtype(record_type)? {
                    if let Some(ids) = referencing.get(&child) {
                        found = true;
                        backrefs.extend(ids.iter().copied());
                    }
                }
            }
            if !found {
                return Err(SyncError::MissingReferencingEntities {
                    types: types.to_vec(),
                    available: referencing.keys().cloned().collect(),
                });
            }
        }
        Ok(backrefs)
    }

    /// Build the identifiable of `handle` from its registered template.
    fn get_identifiable(
        &self,
        graph: &EntityGraph,
        handle: EntityHandle,
        referencing: &Referencing,
    ) -> Result<Identifiable> {
        let entity = graph.get(handle);
        let Some(registered) = self.get_registered_identifiable(entity)? else {
            if entity.id.is_none() && entity.path.is_none() {
                return Err(SyncError::NoIdentifiable {
                    entity: entity.label(),
                });
            }
            return Ok(Identifiable {
                record_id: entity.id,
                path: entity.path.clone(),
                ..Identifiable::default()
            });
        };

        let backrefs = self.get_identifying_referencing_entities(referencing, &registered)?;
        let mut properties: Vec<(String, Option<IdentValue>)> = Vec::new();
        for identifying in &registered.properties {
            let IdentifyingProperty::Property(name) = identifying else {
                continue;
            };
            if entity.property_count(name) > 1 || properties.iter().any(|(n, _)| n == name) {
                return Err(SyncError::MultiProperty {
                    entity: entity.label(),
                    property: name.clone(),
                });
            }
            let property =
                entity
                    .get_property(name)
                    .ok_or_else(|| SyncError::MissingIdentifyingProperty {
                        entity: entity.label(),
                        property: name.clone(),
                    })?;
            properties.push((
                property.name.clone(),
                property
                    .value
                    .as_ref()
                    .map(|value| IdentValue::from_value(graph, value)),
            ));
        }

        Ok(Identifiable {
            record_id: entity.id,
            record_type: Some(registered.record_type.clone()),
            name: if registered.declares_name() {
                entity.name.clone()
            } else {
                None
            },
            properties,
            path: entity.path.clone(),
            backrefs,
        })
    }
}

/// Entities referenced by the identifying properties of `handle`.
pub fn get_identifying_referenced_entities(
    graph: &EntityGraph,
    handle: EntityHandle,
    registered: &RegisteredIdentifiable,
) -> Vec<EntityHandle> {
    let entity = graph.get(handle);
    registered
        .property_names()
        .filter_map(|name| entity.get_property(name))
        .filter_map(|property| property.value.as_ref())
        .flat_map(Value::entity_handles)
        .map(|target| graph.resolve(target))
        .collect()
}

/// Whether a stored value equals an identifying value. References compare by id.
pub fn value_matches(expected: &Option<IdentValue>, actual: Option<&Value>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(expected), Some(actual)) => ident_value_matches(expected, actual),
        _ => false,
    }
}

fn ident_value_matches(expected: &IdentValue, actual: &Value) -> bool {
    match (expected, actual) {
        (IdentValue::Reference { id: Some(id), .. }, Value::Id(other)) => id == other,
        (IdentValue::Scalar(expected), actual) => expected == actual,
        (IdentValue::List(items), Value::List(values)) => {
            items.len() == values.len()
                && items
                    .iter()
                    .zip(values)
                    .all(|(item, value)| ident_value_matches(item, value))
        }
        _ => false,
    }
}

/// Whether `record` carries every identifying value of `identifiable`.
pub fn check_record(record: &Entity, identifiable: &Identifiable) -> bool {
    if let Some(record_type) = &identifiable.record_type {
        if !record.has_parent(record_type) {
            return false;
        }
    }
    if identifiable.name.is_some() && record.name != identifiable.name {
        return false;
    }
    identifiable.properties.iter().all(|(name, expected)| {
        record
            .get_property(name)
            .is_some_and(|property| value_matches(expected, property.value.as_ref()))
    })
}

/// Adapter over records held in memory, used by tests.
#[derive(Debug, Default)]
pub struct LocalStorageIdentifiableAdapter {
    identifiables: Vec<(String, RegisteredIdentifiable)>,
    records: Vec<Entity>,
    /// Record type -> direct subtypes.
    schema: BTreeMap<String, Vec<String>>,
}

impl LocalStorageIdentifiableAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_identifiable(
        &mut self,
        name: impl Into<String>,
        definition: RegisteredIdentifiable,
    ) {
        self.identifiables.push((name.into(), definition));
    }

    pub fn add_record(&mut self, record: Entity) {
        self.records.push(record);
    }

    pub fn add_subtype(&mut self, parent: impl Into<String>, child: impl Into<String>) {
        self.schema.entry(parent.into()).or_default().push(child.into());
    }

    pub fn records(&self) -> &[Entity] {
        &self.records
    }

    fn is_identifiable_for_record(definition: &RegisteredIdentifiable, record: &Entity) -> bool {
        record.has_parent(&definition.record_type)
            && definition
                .property_names()
                .all(|name| record.get_property(name).is_some())
    }
}

impl IdentifiableAdapter for LocalStorageIdentifiableAdapter {
    fn get_registered_identifiable(
        &self,
        entity: &Entity,
    ) -> Result<Option<RegisteredIdentifiable>> {
        let mut candidates = self
            .identifiables
            .iter()
            .filter(|(_, definition)| Self::is_identifiable_for_record(definition, entity));
        match (candidates.next(), candidates.next()) {
            (None, _) => Ok(None),
            (Some((_, definition)), None) => Ok(Some(definition.clone())),
            (Some(_), Some(_)) => Err(SyncError::AmbiguousRegisteredIdentifiable {
                entity: entity.label(),
            }),
        }
    }

    fn get_children_of_recordtype(&self, name: &str) -> Result<Vec<String>> {
        let mut family = Vec::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            if family.contains(&current) {
                continue;
            }
            if let Some(children) = self.schema.get(&current) {
                frontier.extend(children.iter().cloned());
            }
            family.push(current);
        }
        Ok(family)
    }

    fn retrieve_identified_record_for_identifiable(
        &self,
        identifiable: &Identifiable,
    ) -> Result<Option<Entity>> {
        let candidates: Vec<&Entity> = self
            .records
            .iter()
            .filter(|record| check_record(record, identifiable))
            .collect();
        match candidates.as_slice() {
            [] => Ok(None),
            [record] => Ok(Some((*record).clone())),
            many => Err(SyncError::AmbiguousIdentifiable {
                identifiable: identifiable.get_representation(),
                count: many.len(),
            }),
        }
    }
}

/// Production adapter that resolves identifiables with remote queries.
pub struct RemoteIdentifiableAdapter {
    registry: IdentifiableRegistry,
    remote: Arc<dyn RemoteStore>,
    prefix_length: usize,
    queries: Mutex<LruCache<String, Vec<Entity>>>,
    children: Mutex<LruCache<String, Vec<String>>>,
}

impl RemoteIdentifiableAdapter {
    pub fn new(registry: IdentifiableRegistry, remote: Arc<dyn RemoteStore>) -> Self {
        Self::with_query_settings(
            registry,
            remote,
            crate::config::DEFAULT_QUERY_PREFIX_LENGTH,
            crate::config::DEFAULT_QUERY_CACHE_CAPACITY,
        )
    }

    pub fn with_query_settings(
        registry: IdentifiableRegistry,
        remote: Arc<dyn RemoteStore>,
        prefix_length: usize,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            remote,
            prefix_length,
            queries: Mutex::new(LruCache::new(capacity)),
            children: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Read registered identifiables from a JSON definition file.
    pub fn load_from_json_definition(
        path: impl AsRef<Path>,
        remote: Arc<dyn RemoteStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(IdentifiableRegistry::load(path)?, remote))
    }

    pub fn registry(&self) -> &IdentifiableRegistry {
        &self.registry
    }

    fn cached_query(&self, query: &str) -> Result<Vec<Entity>> {
        if let Some(hit) = self.queries.lock().get(query) {
            return Ok(hit.clone());
        }
        let result = self.remote.query(query, false)?;
        self.queries.lock().put(query.to_string(), result.clone());
        Ok(result)
    }
}

impl IdentifiableAdapter for RemoteIdentifiableAdapter {
    fn get_registered_identifiable(
        &self,
        entity: &Entity,
    ) -> Result<Option<RegisteredIdentifiable>> {
        Ok(entity
            .first_parent_name()
            .and_then(|record_type| self.registry.get(record_type))
            .cloned())
    }

    fn get_children_of_recordtype(&self, name: &str) -> Result<Vec<String>> {
        if let Some(hit) = self.children.lock().get(name) {
            return Ok(hit.clone());
        }
        let children = self.remote.get_children_of_recordtype(name)?;
        self.children.lock().put(name.to_string(), children.clone());
        Ok(children)
    }

    fn retrieve_identified_record_for_identifiable(
        &self,
        identifiable: &Identifiable,
    ) -> Result<Option<Entity>> {
        let query = create_query_for_identifiable(identifiable, None);
        let mut candidates = match self.cached_query(&query) {
            Ok(candidates) => candidates,
            Err(SyncError::QueryRejected { message }) => {
                warn!(%message, "identifiable query rejected, retrying with prefix match");
                let query = create_query_for_identifiable(identifiable, Some(self.prefix_length));
                self.cached_query(&query)?
                    .into_iter()
                    .filter(|candidate| {
                        identifiable.properties.iter().all(|(name, expected)| {
                            candidate.get_property(name).is_some_and(|property| {
                                value_matches(expected, property.value.as_ref())
                            })
                        })
                    })
                    .collect()
            }
            Err(err) => return Err(err),
        };
        debug!(%query, candidates = candidates.len(), "identifiable lookup");
        match candidates.len() {
            0 => Ok(None),
            1 => Ok(candidates.pop()),
            count => Err(SyncError::AmbiguousIdentifiable {
                identifiable: identifiable.get_representation(),
                count,
            }),
        }
    }

    fn clear_cache(&self) {
        self.queries.lock().clear();
        self.children.lock().clear();
    }
}
