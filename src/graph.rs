//! # Entity graph
//!
//! Arena holding every entity of one crawl. Entities are addressed by
//! [`EntityHandle`]; merging a duplicate into its canonical counterpart
//! redirects the duplicate's handle so that every reference to it resolves to
//! the survivor, following the union-find discipline of path compression.

use crate::error::{Result, SyncError};
use crate::model::{Entity, EntityHandle, RemoteId, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;

/// Referencing record type name -> ids of the referencing entities (None while unidentified).
pub type Referencing = BTreeMap<String, Vec<Option<RemoteId>>>;

/// Referenced entity -> entities referencing it, grouped by record type.
pub type ReferenceMap = FxHashMap<EntityHandle, Referencing>;

#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    slots: Vec<Entity>,
    /// Duplicate handle -> canonical handle.
    redirects: FxHashMap<EntityHandle, EntityHandle>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a list where `Value::Entity(EntityHandle(i))` refers
    /// to the i-th element of the list.
    pub fn from_entities(entities: Vec<Entity>) -> Result<Self> {
        let len = entities.len();
        for entity in &entities {
            for property in &entity.properties {
                let Some(value) = &property.value else {
                    continue;
                };
                if let Some(bad) = value
                    .entity_handles()
                    .into_iter()
                    .find(|handle| handle.index() >= len)
                {
                    return Err(SyncError::DanglingReference {
                        entity: entity.label(),
                        target: bad.to_string(),
                    });
                }
            }
        }
        Ok(Self {
            slots: entities,
            redirects: FxHashMap::default(),
        })
    }

    pub fn add(&mut self, entity: Entity) -> EntityHandle {
        let handle = EntityHandle(self.slots.len() as u32);
        self.slots.push(entity);
        handle
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = EntityHandle> {
        (0..self.slots.len() as u32).map(EntityHandle)
    }

    /// The entity stored in the slot itself, ignoring redirects.
    pub fn get(&self, handle: EntityHandle) -> &Entity {
        &self.slots[handle.index()]
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> &mut Entity {
        &mut self.slots[handle.index()]
    }

    /// The handle a reference to `handle` currently points at.
    pub fn resolve(&self, handle: EntityHandle) -> EntityHandle {
        resolve_in(&self.redirects, handle)
    }

    /// The entity a reference to `handle` currently points at.
    pub fn referenced(&self, handle: EntityHandle) -> &Entity {
        self.get(self.resolve(handle))
    }

    pub fn is_redirected(&self, handle: EntityHandle) -> bool {
        self.redirects.contains_key(&handle)
    }

    /// Bend every reference to `from` onto `to`.
    pub fn redirect(&mut self, from: EntityHandle, to: EntityHandle) {
        let target = self.resolve(to);
        if target == from {
            return;
        }
        for parent in self.redirects.values_mut() {
            if *parent == from {
                *parent = target;
            }
        }
        self.redirects.insert(from, target);
    }

    /// Resolved handles referenced by the properties of `handle`, in property order.
    pub fn references(&self, handle: EntityHandle) -> Vec<EntityHandle> {
        self.get(handle)
            .properties
            .iter()
            .filter_map(|property| property.value.as_ref())
            .flat_map(Value::entity_handles)
            .map(|target| self.resolve(target))
            .collect()
    }

    /// All entities reachable from `roots`, each exactly once. Roots come
    /// first, then referenced entities in depth-first order.
    pub fn create_flat_list(&self, roots: &[EntityHandle]) -> Vec<EntityHandle> {
        let mut flat = Vec::with_capacity(roots.len());
        let mut seen = FxHashSet::default();
        for root in roots {
            let root = self.resolve(*root);
            if seen.insert(root) {
                flat.push(root);
            }
        }
        for root in roots {
            let mut stack = vec![(self.references(self.resolve(*root)), 0usize)];
            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                if frame.1 >= frame.0.len() {
                    stack.pop();
                    continue;
                }
                let next = frame.0[frame.1];
                frame.1 += 1;
                if seen.insert(next) {
                    flat.push(next);
                    stack.push((self.references(next), 0));
                }
            }
        }
        flat
    }

    /// Who references whom among `records`, keyed by the referenced handle.
    pub fn create_reference_mapping(&self, records: &[EntityHandle]) -> ReferenceMap {
        let mut map = ReferenceMap::default();
        for handle in records {
            map.entry(*handle).or_default();
        }
        for handle in records {
            let entity = self.get(*handle);
            let Some(record_type) = entity.first_parent_name() else {
                continue;
            };
            for target in self.references(*handle) {
                map.entry(target)
                    .or_default()
                    .entry(record_type.to_string())
                    .or_default()
                    .push(entity.id);
            }
        }
        map
    }

    /// Depth-first walk over the reference edges between members of `flat`,
    /// starting at `flat[0]`. Returns the first cycle found, in reference
    /// order, or `None` once every reachable member has been explored.
    pub fn detect_circular_dependency(&self, flat: &[EntityHandle]) -> Option<Vec<EntityHandle>> {
        let members: FxHashSet<EntityHandle> = flat.iter().map(|h| self.resolve(*h)).collect();
        let edges = |handle: EntityHandle| -> Vec<EntityHandle> {
            self.references(handle)
                .into_iter()
                .filter(|target| members.contains(target))
                .collect()
        };
        let start = self.resolve(*flat.first()?);
        let mut visited = FxHashSet::default();
        visited.insert(start);
        let mut path = vec![start];
        let mut stack = vec![(edges(start), 0usize)];
        while let Some(frame) = stack.last_mut() {
            if frame.1 >= frame.0.len() {
                stack.pop();
                path.pop();
                continue;
            }
            let next = frame.0[frame.1];
            frame.1 += 1;
            if let Some(position) = path.iter().position(|handle| *handle == next) {
                return Some(path[position..].to_vec());
            }
            if visited.insert(next) {
                path.push(next);
                stack.push((edges(next), 0));
            }
        }
        None
    }

    /// Rewrite stored references so they point at their redirect targets.
    pub fn canonicalize_references(&mut self) {
        let redirects = &self.redirects;
        if redirects.is_empty() {
            return;
        }
        for entity in &mut self.slots {
            for property in &mut entity.properties {
                if let Some(value) = property.value.as_mut() {
                    rewrite_handles(value, &mut |handle| {
                        Value::Entity(resolve_in(redirects, handle))
                    });
                }
            }
        }
    }

    /// Point the references of `handle` that resolve to `from` at `to`.
    pub fn replace_reference(
        &mut self,
        handle: EntityHandle,
        from: EntityHandle,
        to: EntityHandle,
    ) {
        let Self { slots, redirects } = self;
        for property in &mut slots[handle.index()].properties {
            if let Some(value) = property.value.as_mut() {
                rewrite_handles(value, &mut |target| {
                    if resolve_in(redirects, target) == from {
                        Value::Entity(to)
                    } else {
                        Value::Entity(target)
                    }
                });
            }
        }
    }

    /// Replace references to entities that already carry a concrete id by that id.
    pub fn replace_entities_with_ids(&mut self, handle: EntityHandle) {
        let mut properties = std::mem::take(&mut self.slots[handle.index()].properties);
        for property in &mut properties {
            if let Some(value) = property.value.as_mut() {
                rewrite_handles(value, &mut |target| match self.referenced(target).id {
                    Some(id) if id >= 0 => Value::Id(id),
                    _ => Value::Entity(target),
                });
            }
        }
        self.slots[handle.index()].properties = properties;
    }

    /// Copy `handles` out of the arena for a remote write. References to
    /// entities with a concrete id become [`Value::Id`]; references to other
    /// members of the batch become batch-local handles (`EntityHandle(i)` is
    /// the i-th entity of the batch).
    pub fn detach_batch(&self, handles: &[EntityHandle]) -> Result<Vec<Entity>> {
        let positions: FxHashMap<EntityHandle, u32> = handles
            .iter()
            .enumerate()
            .map(|(position, handle)| (self.resolve(*handle), position as u32))
            .collect();
        handles
            .iter()
            .map(|handle| {
                let mut entity = self.get(*handle).clone();
                let owner = entity.label();
                for property in &mut entity.properties {
                    if let Some(value) = property.value.as_mut() {
                        self.detach_value(value, &positions, &owner)?;
                    }
                }
                Ok(entity)
            })
            .collect()
    }

    fn detach_value(
        &self,
        value: &mut Value,
        positions: &FxHashMap<EntityHandle, u32>,
        owner: &str,
    ) -> Result<()> {
        match value {
            Value::Entity(handle) => {
                let target = self.resolve(*handle);
                *value = match (self.get(target).id, positions.get(&target)) {
                    (Some(id), _) if id >= 0 => Value::Id(id),
                    (_, Some(position)) => Value::Entity(EntityHandle(*position)),
                    _ => {
                        return Err(SyncError::DanglingReference {
                            entity: owner.to_string(),
                            target: self.get(target).label(),
                        })
                    }
                };
            }
            Value::List(items) => {
                for item in items {
                    self.detach_value(item, positions, owner)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// One line per entity plus its outgoing references, for diagnostics.
    pub fn compact_representation(&self, handles: &[EntityHandle]) -> String {
        let mut text = String::new();
        for handle in handles {
            let entity = self.get(*handle);
            text.push_str(&format!("{} {}\n", handle, entity.label()));
            for property in &entity.properties {
                let Some(value) = &property.value else {
                    continue;
                };
                for target in value.entity_handles() {
                    let target = self.resolve(target);
                    text.push_str(&format!("  {} -> {}\n", property.name, target));
                }
            }
        }
        text
    }
}

fn resolve_in(
    redirects: &FxHashMap<EntityHandle, EntityHandle>,
    mut handle: EntityHandle,
) -> EntityHandle {
    while let Some(next) = redirects.get(&handle) {
        handle = *next;
    }
    handle
}

fn rewrite_handles(value: &mut Value, rewrite: &mut impl FnMut(EntityHandle) -> Value) {
    match value {
        Value::Entity(handle) => {
            let handle = *handle;
            *value = rewrite(handle);
        }
        Value::List(items) => {
            for item in items {
                rewrite_handles(item, rewrite);
            }
        }
        _ => {}
    }
}
