//! # Reconciliation Module
//!
//! Splits a crawled entity graph into entities that must be inserted and
//! entities that already exist remotely.
//!
//! Entities with an id or a path are classified directly. The rest are
//! classified in repeated passes: an entity can only be identified once
//! every entity its identity depends on has been classified, so each pass
//! handles what has become resolvable and the loop stops when a pass makes
//! no progress.

use crate::adapter::{get_identifying_referenced_entities, IdentifiableAdapter};
use crate::error::{Result, SyncError};
use crate::graph::{EntityGraph, ReferenceMap, Referencing};
use crate::identifiable::{IdentValue, Identifiable};
use crate::lookup::TreatedRecordLookup;
use crate::merge::{
    check_identical, find_pairwise_conflict, merge_entities, try_merge, MergeOptions, MergeOutcome,
};
use crate::model::{EntityHandle, Role};
use crate::remote::RemoteStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

/// Result of [`split_into_inserts_and_updates`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    /// Entities absent from the remote; their ids are unset.
    pub missing: Vec<EntityHandle>,
    /// Entities found remotely, carrying their remote id.
    pub existing: Vec<EntityHandle>,
}

/// Classify every entity reachable from `roots` as missing or existing.
///
/// Duplicates are merged into one surviving entity and references to them
/// are redirected to the survivor; stored references are canonicalized
/// before returning. Each call uses a fresh [`TreatedRecordLookup`].
#[instrument(skip_all, fields(roots = roots.len()))]
pub fn split_into_inserts_and_updates(
    graph: &mut EntityGraph,
    roots: &[EntityHandle],
    adapter: &dyn IdentifiableAdapter,
    remote: &dyn RemoteStore,
) -> Result<Split> {
    let mut reconciler = Reconciler {
        graph,
        adapter,
        remote,
        lookup: TreatedRecordLookup::new(),
        all_records: Vec::new(),
        try_to_merge_later: Vec::new(),
    };
    reconciler.run(roots)
}

struct Reconciler<'a> {
    graph: &'a mut EntityGraph,
    adapter: &'a dyn IdentifiableAdapter,
    remote: &'a dyn RemoteStore,
    lookup: TreatedRecordLookup,
    /// Entities not merged away yet; the reference map is built from these.
    all_records: Vec<EntityHandle>,
    /// (canonical, duplicate) pairs whose merge is retried at the end.
    try_to_merge_later: Vec<(EntityHandle, EntityHandle)>,
}

impl Reconciler<'_> {
    fn run(&mut self, roots: &[EntityHandle]) -> Result<Split> {
        let mut flat = self.graph.create_flat_list(roots);
        self.all_records = flat.clone();

        for handle in &flat {
            let entity = self.graph.get(*handle);
            if entity.role == Role::Record && entity.parents.is_empty() {
                return Err(SyncError::MissingParent {
                    entity: entity.label(),
                });
            }
        }

        self.classify_by_id_and_path(&mut flat)?;
        self.classify_by_identifiable(&mut flat)?;

        if !flat.is_empty() {
            let cycle = self.graph.detect_circular_dependency(&flat);
            match &cycle {
                Some(cycle) => error!(
                    "found circular dependency (may include non-identifying references):\n{}",
                    self.graph.compact_representation(cycle)
                ),
                None => error!(
                    "reconciliation stalled without a circular dependency:\n{}",
                    self.graph.compact_representation(&flat)
                ),
            }
            return Err(SyncError::CircularDependency { cycle });
        }

        self.retry_deferred_merges()?;

        let missing = self.lookup.get_missing_list();
        for handle in &missing {
            let entity = self.graph.get_mut(*handle);
            match entity.id {
                Some(id) if id < 0 => entity.id = None,
                other => {
                    return Err(SyncError::internal(format!(
                        "missing entity {} carries id {:?} instead of a placeholder",
                        entity.label(),
                        other
                    )))
                }
            }
        }
        self.graph.canonicalize_references();

        let existing = self.lookup.get_existing_list();
        debug!(
            missing = missing.len(),
            existing = existing.len(),
            "split finished"
        );
        Ok(Split { missing, existing })
    }

    /// Entities with an id or a path need no identifiable.
    fn classify_by_id_and_path(&mut self, flat: &mut Vec<EntityHandle>) -> Result<()> {
        for i in (0..flat.len()).rev() {
            let handle = flat[i];
            let entity = self.graph.get(handle);
            if entity.id.is_some() {
                match self.lookup.get_existing(entity, None) {
                    Some(treated) => self.merge_identified(treated, handle)?,
                    None => self.lookup.add(handle, self.graph.get_mut(handle), None)?,
                }
                flat.remove(i);
            } else if let Some(path) = entity.path.clone() {
                match self.remote.retrieve_by_path(&path) {
                    Ok(existing) => {
                        let entity = self.graph.get_mut(handle);
                        entity.id = existing.id;
                        if entity.role == Role::File {
                            entity.size = existing.size;
                            entity.checksum = existing.checksum;
                        }
                    }
                    Err(SyncError::NotFound { .. }) => {}
                    Err(err) => return Err(err),
                }
                match self.lookup.get_any(self.graph.get(handle), None) {
                    Some(treated) => self.merge_identified(treated, handle)?,
                    None => self.lookup.add(handle, self.graph.get_mut(handle), None)?,
                }
                flat.remove(i);
            }
        }
        Ok(())
    }

    /// Fixed-point passes over the entities that need an identifiable.
    fn classify_by_identifiable(&mut self, flat: &mut Vec<EntityHandle>) -> Result<()> {
        let mut progressed = true;
        while progressed && !flat.is_empty() {
            progressed = false;
            let mut references = self.graph.create_reference_mapping(&self.all_records);

            for i in (0..flat.len()).rev() {
                let handle = flat[i];
                let referencing = references.get(&handle).cloned().unwrap_or_default();
                if self.identity_relies_on_unchecked_entities(handle, &referencing)? {
                    continue;
                }
                let identifiable = self
                    .adapter
                    .get_identifiable(self.graph, handle, &referencing)?;

                if let Some(treated) = self
                    .lookup
                    .get_any(self.graph.get(handle), Some(&identifiable))
                {
                    self.merge_identified(treated, handle)?;
                    references = self.graph.create_reference_mapping(&self.all_records);
                } else if !self.has_reference_value_without_id(&identifiable) {
                    if let Some(found) = self
                        .adapter
                        .retrieve_identified_record_for_identifiable(&identifiable)?
                    {
                        let entity = self.graph.get_mut(handle);
                        entity.id = found.id;
                        entity.path = found.path;
                    }
                    self.lookup
                        .add(handle, self.graph.get_mut(handle), Some(&identifiable))?;
                } else if self.has_missing_object_in_references(&identifiable) {
                    // Depends on something proven absent, so it is absent too.
                    self.lookup
                        .add(handle, self.graph.get_mut(handle), Some(&identifiable))?;
                } else {
                    continue;
                }
                flat.remove(i);
                progressed = true;
            }

            for handle in flat.iter() {
                self.replace_references_with_cached(*handle, &references)?;
            }
        }
        Ok(())
    }

    /// Merge `source` into `target` and redirect every reference to
    /// `source` onto `target`, whatever the merge outcome.
    fn merge_identified(&mut self, target: EntityHandle, source: EntityHandle) -> Result<()> {
        let mut merged = self.graph.get(target).clone();
        let outcome = try_merge(self.graph, &mut merged, self.graph.get(source))?;
        match outcome {
            MergeOutcome::Merged => *self.graph.get_mut(target) = merged,
            MergeOutcome::Conflict(details) => {
                error!(
                    property = %details.property,
                    left = %details.left,
                    right = %details.right,
                    target = %self.graph.get(target).label(),
                    source = %self.graph.get(source).label(),
                    "entities with the same identity disagree on a property"
                );
                return Err(details.into());
            }
            MergeOutcome::DeferRetry => {
                debug!(source = %source, target = %target, "merge deferred");
                self.try_to_merge_later.push((target, source));
                if let Some(id) = self.graph.get(target).id {
                    self.graph.get_mut(source).id = Some(id);
                }
            }
        }
        self.graph.redirect(source, target);
        self.all_records.retain(|handle| *handle != source);
        Ok(())
    }

    fn retry_deferred_merges(&mut self) -> Result<()> {
        for (target, source) in std::mem::take(&mut self.try_to_merge_later) {
            let target = self.graph.resolve(target);
            debug!(target = %target, source = %source, "retrying deferred merge");
            let mut merged = self.graph.get(target).clone();
            let options = MergeOptions {
                merge_id_with_resolved_entity: true,
                ..MergeOptions::default()
            };
            match merge_entities(self.graph, &mut merged, self.graph.get(source), options) {
                Ok(()) => *self.graph.get_mut(target) = merged,
                Err(SyncError::EntityMergeConflict { message }) => {
                    let target_entity = self.graph.get(target);
                    let source_entity = self.graph.get(source);
                    return Err(
                        match find_pairwise_conflict(self.graph, target_entity, source_entity) {
                            Some(details) => {
                                error!(
                                    property = %details.property,
                                    target = %target_entity.label(),
                                    source = %source_entity.label(),
                                    "deferred merge failed on a property"
                                );
                                details.into()
                            }
                            None => SyncError::EntityMergeConflict { message },
                        },
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Whether the identity of `handle` depends on entities that have not
    /// been classified yet.
    fn identity_relies_on_unchecked_entities(
        &self,
        handle: EntityHandle,
        referencing: &Referencing,
    ) -> Result<bool> {
        let Some(registered) = self.adapter.get_registered_identifiable(self.graph.get(handle))?
        else {
            return Ok(false);
        };
        let backrefs = self
            .adapter
            .get_identifying_referencing_entities(referencing, &registered)?;
        if backrefs.iter().any(Option::is_none) {
            return Ok(true);
        }
        Ok(get_identifying_referenced_entities(self.graph, handle, &registered)
            .into_iter()
            .any(|target| self.lookup.get_any(self.graph.get(target), None).is_none()))
    }

    /// Whether a reference of `identifiable` lacks a concrete id. Placeholder
    /// ids are not concrete.
    fn has_reference_value_without_id(&self, identifiable: &Identifiable) -> bool {
        let unresolved = |id: Option<i64>| id.map_or(true, |id| id < 0);
        identifiable
            .properties
            .iter()
            .filter_map(|(_, value)| value.as_ref())
            .flat_map(IdentValue::references)
            .any(|(_, id)| unresolved(id))
            || identifiable.backrefs.iter().any(|id| unresolved(*id))
    }

    /// Whether `identifiable` references an entity known to be missing.
    fn has_missing_object_in_references(&self, identifiable: &Identifiable) -> bool {
        let is_missing = |handle: Option<EntityHandle>, id: Option<i64>| {
            id.is_some_and(|id| self.lookup.is_missing_id(id))
                || handle.is_some_and(|handle| {
                    self.lookup
                        .get_missing(self.graph.referenced(handle), None)
                        .is_some()
                })
        };
        identifiable
            .properties
            .iter()
            .filter_map(|(_, value)| value.as_ref())
            .flat_map(IdentValue::references)
            .any(|(handle, id)| is_missing(handle, id))
            || identifiable
                .backrefs
                .iter()
                .any(|id| is_missing(None, *id))
    }

    /// Point references of `handle` to unclassified entities at the cached
    /// entity with the same identity, if there is one.
    fn replace_references_with_cached(
        &mut self,
        handle: EntityHandle,
        references: &ReferenceMap,
    ) -> Result<()> {
        for target in self.graph.references(handle) {
            let referenced = self.graph.get(target);
            if referenced.id.is_some() {
                continue;
            }
            let referencing = references.get(&target).cloned().unwrap_or_default();
            let identifiable = self
                .adapter
                .get_identifiable(self.graph, target, &referencing)?;
            let Some(cached) = self.lookup.get_any(referenced, Some(&identifiable)) else {
                continue;
            };
            if cached == target {
                continue;
            }
            let cached_entity = self.graph.get(cached);
            if !check_identical(self.graph, cached_entity, referenced, true)? {
                let same_file =
                    referenced.role == Role::File && referenced.path == cached_entity.path;
                if !same_file {
                    return Err(SyncError::ReferenceMismatch {
                        cached: cached_entity.label(),
                        referenced: referenced.label(),
                    });
                }
            }
            self.graph.replace_reference(handle, target, cached);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalStorageIdentifiableAdapter;
    use crate::model::{Entity, Value};
    use crate::registry::RegisteredIdentifiable;
    use crate::remote::MemoryRemote;

    fn adapter() -> LocalStorageIdentifiableAdapter {
        let mut adapter = LocalStorageIdentifiableAdapter::new();
        adapter.register_identifiable(
            "project",
            RegisteredIdentifiable::new("Project").with_name(),
        );
        adapter.register_identifiable(
            "experiment",
            RegisteredIdentifiable::new("Experiment")
                .with_property("project")
                .with_property("date"),
        );
        adapter
    }

    fn project(name: &str) -> Entity {
        Entity::record().with_parent("Project").with_name(name)
    }

    #[test]
    fn test_records_without_parent_are_rejected() {
        let mut graph = EntityGraph::new();
        let orphan = graph.add(Entity::record().with_name("x"));
        let result =
            split_into_inserts_and_updates(&mut graph, &[orphan], &adapter(), &MemoryRemote::new());
        assert!(matches!(result, Err(SyncError::MissingParent { .. })));
    }

    #[test]
    fn test_existing_by_name_and_missing_dependent() {
        let mut adapter = adapter();
        adapter.add_record(project("known").with_id(11));
        let mut graph = EntityGraph::new();
        let known = graph.add(project("known"));
        let unknown = graph.add(project("unknown"));
        let exp_known = graph.add(
            Entity::record()
                .with_parent("Experiment")
                .with_property("project", known)
                .with_property("date", "2024"),
        );
        let exp_unknown = graph.add(
            Entity::record()
                .with_parent("Experiment")
                .with_property("project", unknown)
                .with_property("date", "2024"),
        );

        let split = split_into_inserts_and_updates(
            &mut graph,
            &[exp_known, exp_unknown],
            &adapter,
            &MemoryRemote::new(),
        )
        .unwrap();

        assert_eq!(split.existing, vec![known]);
        let mut missing = split.missing.clone();
        missing.sort();
        assert_eq!(missing, vec![unknown, exp_known, exp_unknown]);
        assert_eq!(graph.get(known).id, Some(11));
        assert!(split.missing.iter().all(|h| graph.get(*h).id.is_none()));
    }

    #[test]
    fn test_duplicates_by_id_are_merged() {
        let mut graph = EntityGraph::new();
        let first = graph.add(project("p").with_id(3).with_property("a", 1i64));
        let second = graph.add(project("p").with_id(3).with_property("b", 2i64));
        let holder = graph.add(
            Entity::record()
                .with_parent("Holder")
                .with_id(4)
                .with_property("p", second),
        );
        let split = split_into_inserts_and_updates(
            &mut graph,
            &[first, second, holder],
            &adapter(),
            &MemoryRemote::new(),
        )
        .unwrap();

        assert_eq!(split.existing.len(), 2);
        let survivor = graph.resolve(second);
        assert!(split.existing.contains(&survivor));
        let merged = graph.get(survivor);
        assert!(merged.get_property("a").is_some() && merged.get_property("b").is_some());
        assert_eq!(
            graph.get(holder).get_property("p").and_then(|p| p.value.clone()),
            Some(Value::Entity(survivor))
        );
    }

    #[test]
    fn test_conflicting_duplicates_fail() {
        let mut graph = EntityGraph::new();
        let a = graph.add(project("p").with_property("budget", 1i64));
        let b = graph.add(project("p").with_property("budget", 2i64));
        let result =
            split_into_inserts_and_updates(&mut graph, &[a, b], &adapter(), &MemoryRemote::new());
        assert!(matches!(result, Err(SyncError::MergeConflict { .. })));
    }

    #[test]
    fn test_reference_to_diverging_copy_of_cached_entity_fails() {
        let mut adapter = LocalStorageIdentifiableAdapter::new();
        adapter.register_identifiable("batch", RegisteredIdentifiable::new("Batch").with_name());
        adapter.register_identifiable(
            "sample",
            RegisteredIdentifiable::new("Sample")
                .with_name()
                .with_property("batch"),
        );
        adapter.register_identifiable(
            "holder",
            RegisteredIdentifiable::new("Holder").with_property("sample"),
        );

        let mut graph = EntityGraph::new();
        let batch = graph.add(Entity::record().with_parent("Batch").with_name("b1"));
        let sample = |note: &str| {
            Entity::record()
                .with_parent("Sample")
                .with_name("s")
                .with_property("batch", batch)
                .with_property("note", note)
        };
        let cached = graph.add(sample("x"));
        let copy = graph.add(sample("y"));
        let holder = graph.add(
            Entity::record()
                .with_parent("Holder")
                .with_property("sample", copy),
        );

        // reverse order: the copy waits for its batch, the cached sample
        // is classified after the batch, the holder waits for the copy
        let result = split_into_inserts_and_updates(
            &mut graph,
            &[holder, cached, batch, copy],
            &adapter,
            &MemoryRemote::new(),
        );
        assert!(matches!(result, Err(SyncError::ReferenceMismatch { .. })));
    }

    #[test]
    fn test_files_are_found_by_path() {
        let remote = MemoryRemote::new();
        let mut stored = Entity::file("/data/a.dat");
        stored.checksum = Some("abc".into());
        stored.size = Some(12);
        let id = remote.add_entity(stored);

        let mut graph = EntityGraph::new();
        let file = graph.add(Entity::file("/data/a.dat"));
        let new_file = graph.add(Entity::file("/data/b.dat"));
        let split =
            split_into_inserts_and_updates(&mut graph, &[file, new_file], &adapter(), &remote)
                .unwrap();
        assert_eq!(split.existing, vec![file]);
        assert_eq!(split.missing, vec![new_file]);
        assert_eq!(graph.get(file).id, Some(id));
        assert_eq!(graph.get(file).checksum.as_deref(), Some("abc"));
        assert_eq!(graph.get(file).size, Some(12));
    }
}
