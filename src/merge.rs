//! # Merge Module
//!
//! Entity comparison and merging: combining duplicates found while
//! reconciling, overlaying crawled data onto remote entities and dropping
//! updates that would not change anything.

use crate::error::{Result, SyncError};
use crate::graph::EntityGraph;
use crate::model::{Entity, EntityHandle, Parent, RemoteId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One side of a property comparison. Each field is `Some` when the
/// attribute differs and then holds this side's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyDiff {
    pub datatype: Option<Option<String>>,
    pub unit: Option<Option<String>>,
    pub importance: Option<Option<String>>,
    pub value: Option<Option<Value>>,
}

impl PropertyDiff {
    pub fn is_empty(&self) -> bool {
        self.datatype.is_none()
            && self.unit.is_none()
            && self.importance.is_none()
            && self.value.is_none()
    }
}

/// One side of an entity comparison.
///
/// A property present on only one side shows up with an empty
/// [`PropertyDiff`] in that side's `properties`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDiff {
    pub id: Option<Option<RemoteId>>,
    pub name: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub path: Option<Option<String>>,
    pub file: Option<Option<String>>,
    pub checksum: Option<Option<String>>,
    pub size: Option<Option<u64>>,
    /// Parents only this side has.
    pub parents: Vec<String>,
    pub properties: BTreeMap<String, PropertyDiff>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.name.is_none()
            && self.description.is_none()
            && self.path.is_none()
            && self.file.is_none()
            && self.checksum.is_none()
            && self.size.is_none()
            && self.parents.is_empty()
            && self.properties.is_empty()
    }
}

/// Flags of [`merge_entities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// Overwrite differing values of the target with the source's.
    pub force: bool,
    /// Treat two referenced entities as equal when their own diff is empty.
    pub merge_references_with_empty_diffs: bool,
    /// Treat a reference to an entity and a reference to its id as equal.
    pub merge_id_with_resolved_entity: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            force: false,
            merge_references_with_empty_diffs: true,
            merge_id_with_resolved_entity: false,
        }
    }
}

impl MergeOptions {
    /// Options used when two crawled entities turn out to be the same object.
    pub fn identified() -> Self {
        Self {
            merge_references_with_empty_diffs: false,
            merge_id_with_resolved_entity: true,
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// The first pair of values that can never be merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetails {
    pub property: String,
    pub left: String,
    pub right: String,
}

impl From<ConflictDetails> for SyncError {
    fn from(details: ConflictDetails) -> Self {
        SyncError::MergeConflict {
            property: details.property,
            left: details.left,
            right: details.right,
        }
    }
}

/// Result of merging a duplicate into its canonical entity.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged,
    Conflict(ConflictDetails),
    /// The structural merge failed without a value conflict; try again once
    /// reconciliation is done.
    DeferRetry,
}

pub(crate) fn parents_match(a: &Parent, b: &Parent) -> bool {
    match (a.id, b.id) {
        (Some(x), Some(y)) => x == y,
        _ => a.name.eq_ignore_ascii_case(&b.name),
    }
}

/// `value` with entity handles resolved; with `resolve_ids`, references to
/// entities carrying a concrete id become that id.
fn normalize(graph: &EntityGraph, value: &Value, resolve_ids: bool) -> Value {
    match value {
        Value::Entity(handle) => {
            let target = graph.resolve(*handle);
            match graph.get(target).id {
                Some(id) if resolve_ids && id >= 0 => Value::Id(id),
                _ => Value::Entity(target),
            }
        }
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| normalize(graph, item, resolve_ids))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn references_equivalent(graph: &EntityGraph, a: &Value, b: &Value) -> Result<bool> {
    match (a, b) {
        (Value::Entity(x), Value::Entity(y)) => {
            let (left, right) = compare_entities(
                graph,
                graph.referenced(*x),
                graph.referenced(*y),
                false,
                false,
            )?;
            Ok(left.is_empty() && right.is_empty())
        }
        (Value::List(xs), Value::List(ys)) if xs.len() == ys.len() => {
            for (x, y) in xs.iter().zip(ys) {
                if normalize(graph, x, false) != normalize(graph, y, false)
                    && !references_equivalent(graph, x, y)?
                {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn diff_attribute<T: Clone + PartialEq>(
    a: &Option<T>,
    b: &Option<T>,
    left: &mut Option<Option<T>>,
    right: &mut Option<Option<T>>,
) {
    if a != b {
        *left = Some(a.clone());
        *right = Some(b.clone());
    }
}

/// Compare two entities attribute by attribute and property by property.
///
/// Returns the differences as seen from `a` and from `b`. Properties are
/// matched by name; more than one property of the same name is unsupported.
pub fn compare_entities(
    graph: &EntityGraph,
    a: &Entity,
    b: &Entity,
    entity_name_id_equivalency: bool,
    compare_referenced_records: bool,
) -> Result<(EntityDiff, EntityDiff)> {
    let mut left = EntityDiff::default();
    let mut right = EntityDiff::default();

    diff_attribute(&a.id, &b.id, &mut left.id, &mut right.id);
    diff_attribute(&a.name, &b.name, &mut left.name, &mut right.name);
    diff_attribute(
        &a.description,
        &b.description,
        &mut left.description,
        &mut right.description,
    );
    diff_attribute(&a.path, &b.path, &mut left.path, &mut right.path);
    diff_attribute(&a.file, &b.file, &mut left.file, &mut right.file);
    diff_attribute(&a.checksum, &b.checksum, &mut left.checksum, &mut right.checksum);
    diff_attribute(&a.size, &b.size, &mut left.size, &mut right.size);

    left.parents = a
        .parents
        .iter()
        .filter(|p| !b.parents.iter().any(|q| parents_match(p, q)))
        .map(|p| p.name.clone())
        .collect();
    right.parents = b
        .parents
        .iter()
        .filter(|p| !a.parents.iter().any(|q| parents_match(p, q)))
        .map(|p| p.name.clone())
        .collect();

    for property in &a.properties {
        let mut matching = b.properties.iter().filter(|p| p.name == property.name);
        let other = match (matching.next(), matching.next()) {
            (None, _) => {
                left.properties.insert(property.name.clone(), PropertyDiff::default());
                continue;
            }
            (Some(other), None) if a.property_count(&property.name) == 1 => other,
            _ => {
                return Err(SyncError::MultiProperty {
                    entity: a.label(),
                    property: property.name.clone(),
                })
            }
        };

        let mut ours = PropertyDiff::default();
        let mut theirs = PropertyDiff::default();
        diff_attribute(
            &property.importance,
            &other.importance,
            &mut ours.importance,
            &mut theirs.importance,
        );
        diff_attribute(
            &property.datatype,
            &other.datatype,
            &mut ours.datatype,
            &mut theirs.datatype,
        );
        diff_attribute(&property.unit, &other.unit, &mut ours.unit, &mut theirs.unit);

        let same_value = match (&property.value, &other.value) {
            (None, None) => true,
            (Some(x), Some(y)) => {
                normalize(graph, x, entity_name_id_equivalency)
                    == normalize(graph, y, entity_name_id_equivalency)
                    || (compare_referenced_records && references_equivalent(graph, x, y)?)
            }
            _ => false,
        };
        if !same_value {
            ours.value = Some(property.value.clone());
            theirs.value = Some(other.value.clone());
        }

        if !ours.is_empty() || !theirs.is_empty() {
            left.properties.insert(property.name.clone(), ours);
            right.properties.insert(property.name.clone(), theirs);
        }
    }
    for property in &b.properties {
        if a.get_property(&property.name).is_none() {
            right
                .properties
                .insert(property.name.clone(), PropertyDiff::default());
        }
    }

    Ok((left, right))
}

fn merge_attribute<T: Clone>(
    slot: &mut Option<T>,
    ours: &Option<Option<T>>,
    theirs: &Option<Option<T>>,
    force: bool,
    describe: impl FnOnce() -> String,
) -> Result<()> {
    let Some(Some(incoming)) = theirs else {
        return Ok(());
    };
    if matches!(ours, Some(Some(_))) && !force {
        return Err(SyncError::EntityMergeConflict {
            message: describe(),
        });
    }
    *slot = Some(incoming.clone());
    Ok(())
}

/// Merge `source` into `target`.
///
/// Parents and properties only `source` has are added. Differing values
/// are taken from `source` when `target` has none, or always with
/// [`MergeOptions::force`]; otherwise the merge fails with
/// [`SyncError::EntityMergeConflict`]. `target` may be partially merged
/// when an error is returned.
pub fn merge_entities(
    graph: &EntityGraph,
    target: &mut Entity,
    source: &Entity,
    options: MergeOptions,
) -> Result<()> {
    let (ours, theirs) = compare_entities(
        graph,
        target,
        source,
        options.merge_id_with_resolved_entity,
        options.merge_references_with_empty_diffs,
    )?;

    for name in &theirs.parents {
        if let Some(parent) = source.parents.iter().find(|p| &p.name == name) {
            target.parents.push(parent.clone());
        }
    }

    for (key, incoming) in &theirs.properties {
        let Some(existing) = ours.properties.get(key) else {
            if let Some(property) = source.get_property(key) {
                target.properties.push(property.clone());
            }
            continue;
        };
        if incoming.importance.is_some() || existing.importance.is_some() {
            return Err(SyncError::unsupported(format!(
                "merging differing importance of property '{key}'"
            )));
        }
        let Some(property) = target.get_property_mut(key) else {
            continue;
        };
        let label = || format!("{:?}", source.label());
        merge_attribute(
            &mut property.datatype,
            &existing.datatype,
            &incoming.datatype,
            options.force,
            || format!("property '{key}' has differing datatypes ({})", label()),
        )?;
        merge_attribute(
            &mut property.unit,
            &existing.unit,
            &incoming.unit,
            options.force,
            || format!("property '{key}' has differing units ({})", label()),
        )?;
        merge_attribute(
            &mut property.value,
            &existing.value,
            &incoming.value,
            options.force,
            || format!("property '{key}' has differing values ({})", label()),
        )?;
    }

    for (slot, incoming, attribute) in [
        (&mut target.name, &source.name, "name"),
        (&mut target.description, &source.description, "description"),
    ] {
        if slot == incoming {
            continue;
        }
        if slot.is_none() || options.force {
            *slot = incoming.clone();
        } else {
            return Err(SyncError::EntityMergeConflict {
                message: format!(
                    "{attribute} differs: {:?} != {:?}",
                    slot.as_deref().unwrap_or_default(),
                    incoming.as_deref().unwrap_or_default()
                ),
            });
        }
    }
    Ok(())
}

/// The id a reference value points at, if any.
fn referenced_id(graph: &EntityGraph, value: &Value) -> Option<Option<RemoteId>> {
    match value {
        Value::Entity(handle) => Some(graph.referenced(*handle).id),
        Value::Id(id) => Some(Some(*id)),
        _ => None,
    }
}

/// Look for two values of the same property that can never be merged:
/// references to different ids, or differing non-list scalars.
pub fn find_pairwise_conflict(
    graph: &EntityGraph,
    target: &Entity,
    source: &Entity,
) -> Option<ConflictDetails> {
    for property in &target.properties {
        let Some(other) = source.get_property(&property.name) else {
            debug!(
                property = %property.name,
                "property missing on one side; not the cause of the merge failure"
            );
            continue;
        };
        let (Some(ours), Some(theirs)) = (&property.value, &other.value) else {
            debug!(property = %property.name, "property unset on one side");
            continue;
        };
        let conflict = match (referenced_id(graph, ours), referenced_id(graph, theirs)) {
            (Some(Some(x)), Some(Some(y))) => x != y,
            (Some(_), Some(_)) => false,
            (None, None) => ours != theirs && !ours.is_list() && !theirs.is_list(),
            _ => false,
        };
        if conflict {
            return Some(ConflictDetails {
                property: property.name.clone(),
                left: format!("{ours:?}"),
                right: format!("{theirs:?}"),
            });
        }
    }
    None
}

/// Merge `source` into `target` as two views of the same object.
pub fn try_merge(
    graph: &EntityGraph,
    target: &mut Entity,
    source: &Entity,
) -> Result<MergeOutcome> {
    let mut merged = target.clone();
    match merge_entities(graph, &mut merged, source, MergeOptions::identified()) {
        Ok(()) => {
            *target = merged;
            Ok(MergeOutcome::Merged)
        }
        Err(SyncError::EntityMergeConflict { message }) => {
            debug!(%message, "structural merge failed");
            Ok(match find_pairwise_conflict(graph, target, source) {
                Some(details) => MergeOutcome::Conflict(details),
                None => MergeOutcome::DeferRetry,
            })
        }
        Err(err) => Err(err),
    }
}

/// Decide whether `crawled` would change `remote` if written.
///
/// Parents, properties added or removed, value changes and the strict
/// attributes (description, name, id, path) always count. File attributes
/// and property datatype, importance and unit only count when `crawled`
/// sets them.
pub fn check_identical(
    graph: &EntityGraph,
    crawled: &Entity,
    remote: &Entity,
    ignore_id: bool,
) -> Result<bool> {
    let (mut ours, mut theirs) = compare_entities(graph, crawled, remote, false, true)?;
    if ignore_id {
        ours.id = None;
        theirs.id = None;
    }

    if !ours.parents.is_empty() || !theirs.parents.is_empty() {
        return Ok(false);
    }
    if ours.description.is_some()
        || ours.name.is_some()
        || ours.id.is_some()
        || ours.path.is_some()
    {
        return Ok(false);
    }
    if matches!(ours.file, Some(Some(_)))
        || matches!(ours.checksum, Some(Some(_)))
        || matches!(ours.size, Some(Some(_)))
    {
        return Ok(false);
    }

    for (name, diff) in &ours.properties {
        if diff.is_empty() {
            // only on the crawled side
            return Ok(false);
        }
        if matches!(diff.datatype, Some(Some(_)))
            || matches!(diff.importance, Some(Some(_)))
            || matches!(diff.unit, Some(Some(_)))
        {
            return Ok(false);
        }
        if diff.value.is_some() {
            debug!(property = %name, "value differs");
            return Ok(false);
        }
    }
    for diff in theirs.properties.values() {
        if diff.is_empty() {
            // removed by the crawler
            return Ok(false);
        }
    }
    Ok(true)
}

/// Overlay each crawled entity onto a copy of its remote counterpart.
///
/// Name and description are taken from the remote side only when the
/// crawled side left them unset. The merged copies are added to the graph
/// and returned in input order.
pub fn merge_properties_from_remote(
    graph: &mut EntityGraph,
    crawled: &[EntityHandle],
    identified: &[Entity],
) -> Result<Vec<EntityHandle>> {
    let mut merged_handles = Vec::with_capacity(crawled.len());
    for (handle, remote) in crawled.iter().zip(identified) {
        {
            let target = graph.get_mut(*handle);
            if target.name.is_none() {
                target.name = remote.name.clone();
            }
            if target.description.is_none() {
                target.description = remote.description.clone();
            }
        }
        let mut merged = remote.clone();
        merge_entities(graph, &mut merged, graph.get(*handle), MergeOptions::forced())?;
        merged_handles.push(graph.add(merged));
    }
    Ok(merged_handles)
}

/// Keep only the updates that differ from their remote counterpart.
pub fn remove_unnecessary_updates(
    graph: &EntityGraph,
    crawled: &[EntityHandle],
    identified: &[Entity],
) -> Result<Vec<EntityHandle>> {
    if crawled.len() != identified.len() {
        return Err(SyncError::internal(
            "the lists of updates and of identified records need to be of the same length",
        ));
    }
    let mut actual = Vec::new();
    for (handle, remote) in crawled.iter().zip(identified) {
        if !check_identical(graph, graph.get(*handle), remote, false)? {
            debug!(entity = %graph.get(*handle).label(), "scheduled update");
            actual.push(*handle);
        }
    }
    Ok(actual)
}
