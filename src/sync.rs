//! # Synchronization
//!
//! Drives a crawled graph through reconciliation, merging with remote data
//! and the remote writes, gated by a [`SecurityMode`]. Writes the mode does
//! not allow are queued in a [`PendingChangeCache`] and announced through a
//! [`PendingChangeNotifier`].

use crate::adapter::IdentifiableAdapter;
use crate::config::{
    NotificationConfig, SyncConfig, DEFAULT_COMMIT_CHANGES, DEFAULT_UNIQUE_NAMES,
};
use crate::error::{Result, SyncError};
use crate::graph::EntityGraph;
use crate::merge::{merge_properties_from_remote, parents_match, remove_unnecessary_updates};
use crate::model::{Entity, EntityHandle, Parent, Property, Role, RunId, Value};
use crate::pending::{PendingChange, PendingChangeCache};
use crate::query::escape_squoted_text;
use crate::reconcile::split_into_inserts_and_updates;
use crate::remote::RemoteStore;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

/// Which remote writes may be executed directly. Ordered
/// `Retrieve < Insert < Update`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// No writes; nothing is queued.
    #[default]
    Retrieve,
    /// Inserts execute; updates are queued for authorization.
    Insert,
    /// Inserts and updates execute.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Reconciling,
    Merging,
    Filtering,
    /// Dry run: log what would be written.
    Reporting,
    ParentUpdating,
    Inserting,
    Updating,
    NotifyingPending,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn can_advance_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Reconciling)
            | (Reconciling, Merging)
            | (Merging, Filtering)
            | (Filtering, Reporting | ParentUpdating)
            | (ParentUpdating, Inserting)
            | (Inserting, Updating)
            | (Updating | Reporting, NotifyingPending)
            | (NotifyingPending, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Done | SyncPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// `false` runs every phase up to the writes and only reports.
    pub commit_changes: bool,
    pub security_mode: SecurityMode,
    pub unique_names: bool,
    /// Records with one of these parents must not be inserted.
    pub no_insert_types: Vec<String>,
    /// Records with one of these parents must not be updated.
    pub no_update_types: Vec<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            commit_changes: DEFAULT_COMMIT_CHANGES,
            security_mode: SecurityMode::default(),
            unique_names: DEFAULT_UNIQUE_NAMES,
            no_insert_types: Vec::new(),
            no_update_types: Vec::new(),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            commit_changes: config.commit_changes,
            security_mode: config.security_mode,
            unique_names: config.unique_names,
            no_insert_types: config.restrictions.no_insert_types.clone(),
            no_update_types: config.restrictions.no_update_types.clone(),
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.commit_changes = false;
        self
    }
}

/// Outcome of [`Orchestrator::synchronize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entities that were (or, in a dry run, would be) inserted.
    pub to_insert: Vec<EntityHandle>,
    /// Merged entities that were (or would be) updated.
    pub to_update: Vec<EntityHandle>,
    pub phase: SyncPhase,
}

/// Receives the writes a run could not execute.
pub trait PendingChangeNotifier {
    fn notify(&self, changes: &[PendingChange], run_id: RunId, inserts: bool)
        -> anyhow::Result<()>;
}

/// Reports pending changes through the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    send_crawler_notifications: bool,
    public_host_url: Option<String>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            send_crawler_notifications: config.send_crawler_notifications,
            public_host_url: config.public_host_url.clone(),
        }
    }
}

impl PendingChangeNotifier for LogNotifier {
    fn notify(
        &self,
        changes: &[PendingChange],
        run_id: RunId,
        inserts: bool,
    ) -> anyhow::Result<()> {
        for (i, change) in changes.iter().enumerate() {
            debug!(
                "unauthorized {} ({} of {}): {:?}",
                if inserts { "insert" } else { "update" },
                i + 1,
                changes.len(),
                change.entity
            );
        }
        let kind = if inserts { "inserts" } else { "updates" };
        if self.send_crawler_notifications {
            match &self.public_host_url {
                Some(url) => info!(
                    %run_id,
                    "curator notified about {} pending {kind}; review at {url}",
                    changes.len()
                ),
                None => info!(%run_id, "curator notified about {} pending {kind}", changes.len()),
            }
        }
        info!(
            "there were unauthorized changes (see above); you can authorize the {kind} \
             by invoking the crawler with the run id: {run_id}"
        );
        Ok(())
    }
}

/// One synchronization run against a remote.
pub struct Orchestrator<'a> {
    adapter: &'a dyn IdentifiableAdapter,
    remote: &'a dyn RemoteStore,
    pending: &'a dyn PendingChangeCache,
    notifier: &'a dyn PendingChangeNotifier,
    run_id: RunId,
    options: SyncOptions,
    phase: SyncPhase,
    /// Schema entities fetched by name during the write phases.
    by_name: FxHashMap<String, Entity>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        adapter: &'a dyn IdentifiableAdapter,
        remote: &'a dyn RemoteStore,
        pending: &'a dyn PendingChangeCache,
        notifier: &'a dyn PendingChangeNotifier,
        run_id: RunId,
        options: SyncOptions,
    ) -> Self {
        Self {
            adapter,
            remote,
            pending,
            notifier,
            run_id,
            options,
            phase: SyncPhase::Idle,
            by_name: FxHashMap::default(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    fn advance(&mut self, next: SyncPhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(SyncError::internal(format!(
                "illegal phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        debug!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        Ok(())
    }

    /// Reconcile `roots` against the remote, merge remote data into the
    /// existing entities and write what changed, as far as the security
    /// mode allows.
    #[instrument(skip_all, fields(run_id = %self.run_id, mode = ?self.options.security_mode))]
    pub fn synchronize(
        &mut self,
        graph: &mut EntityGraph,
        roots: &[EntityHandle],
    ) -> Result<SyncReport> {
        match self.run(graph, roots) {
            Ok(report) => Ok(report),
            Err(err) => {
                if !self.phase.is_terminal() {
                    debug!(from = ?self.phase, "phase transition to Failed");
                    self.phase = SyncPhase::Failed;
                }
                if err.is_forbidden_transaction() {
                    error!("{err}");
                }
                Err(err)
            }
        }
    }

    fn run(&mut self, graph: &mut EntityGraph, roots: &[EntityHandle]) -> Result<SyncReport> {
        self.advance(SyncPhase::Reconciling)?;
        let split = split_into_inserts_and_updates(graph, roots, self.adapter, self.remote)?;
        let to_insert = split.missing;

        self.advance(SyncPhase::Merging)?;
        for handle in &split.existing {
            graph.replace_entities_with_ids(*handle);
        }
        let mut identified = Vec::with_capacity(split.existing.len());
        for handle in &split.existing {
            let entity = graph.get(*handle);
            let id = entity.id.ok_or_else(|| {
                SyncError::internal(format!(
                    "{} is classified as existing but has no id",
                    entity.label()
                ))
            })?;
            identified.push(self.remote.retrieve_by_id(id)?);
        }
        let merged = merge_properties_from_remote(graph, &split.existing, &identified)?;
        let to_update = remove_unnecessary_updates(graph, &merged, &identified)?;

        self.advance(SyncPhase::Filtering)?;
        let insert_problems =
            check_whether_parent_exists(graph, &to_insert, &self.options.no_insert_types);
        let update_problems =
            check_whether_parent_exists(graph, &to_update, &self.options.no_update_types);
        if !insert_problems.is_empty() || !update_problems.is_empty() {
            let first_parents = |handles: &[EntityHandle]| {
                handles
                    .iter()
                    .filter_map(|h| graph.get(*h).first_parent_name().map(str::to_string))
                    .collect::<Vec<_>>()
            };
            return Err(SyncError::ForbiddenTransaction {
                insert_types: first_parents(&insert_problems),
                update_types: first_parents(&update_problems),
            });
        }

        info!(
            "going to insert {} entities and update {} entities",
            to_insert.len(),
            to_update.len()
        );

        if self.options.commit_changes {
            self.adapter.clear_cache();
            self.by_name.clear();

            self.advance(SyncPhase::ParentUpdating)?;
            self.execute_parent_updates_in_list(graph, &to_update)?;
            debug!("added parent record types where necessary");

            self.advance(SyncPhase::Inserting)?;
            self.execute_inserts_in_list(graph, &to_insert)?;
            if !to_insert.is_empty() {
                info!("executed inserts:\n{}", create_entity_summary(graph, &to_insert));
            }

            self.advance(SyncPhase::Updating)?;
            self.execute_updates_in_list(graph, &to_update)?;
            if !to_update.is_empty() {
                info!("executed updates:\n{}", create_entity_summary(graph, &to_update));
            }
        } else {
            self.advance(SyncPhase::Reporting)?;
            if !to_insert.is_empty() {
                info!("would insert:\n{}", create_entity_summary(graph, &to_insert));
            }
            if !to_update.is_empty() {
                info!("would update:\n{}", create_entity_summary(graph, &to_update));
            }
        }

        self.advance(SyncPhase::NotifyingPending)?;
        self.inform_about_pending_changes()?;

        self.advance(SyncPhase::Done)?;
        Ok(SyncReport {
            to_insert,
            to_update,
            phase: self.phase,
        })
    }

    fn inform_about_pending_changes(&self) -> Result<()> {
        let pending_inserts = self.pending.get_inserts(self.run_id)?;
        if !pending_inserts.is_empty() {
            if let Err(err) = self.notifier.notify(&pending_inserts, self.run_id, true) {
                warn!("failed to announce pending inserts: {err:#}");
            }
        }
        let pending_updates = self.pending.get_updates(self.run_id)?;
        if !pending_updates.is_empty() {
            if let Err(err) = self.notifier.notify(&pending_updates, self.run_id, false) {
                warn!("failed to announce pending updates: {err:#}");
            }
        }
        Ok(())
    }

    fn cached_by_name(&mut self, name: &str) -> Result<Entity> {
        if let Some(entity) = self.by_name.get(name) {
            return Ok(entity.clone());
        }
        let entity = self.remote.retrieve_by_name(name)?;
        self.by_name.insert(name.to_string(), entity.clone());
        Ok(entity)
    }

    /// Give parents and properties their remote ids and resolve property
    /// datatypes from the remote schema.
    pub fn set_ids_and_datatype_of_parents_and_properties(
        &mut self,
        graph: &mut EntityGraph,
        handles: &[EntityHandle],
    ) -> Result<()> {
        for handle in handles {
            let parent_names: Vec<(usize, String)> = graph
                .get(*handle)
                .parents
                .iter()
                .enumerate()
                .filter(|(_, parent)| parent.id.is_none())
                .map(|(i, parent)| (i, parent.name.clone()))
                .collect();
            for (i, name) in parent_names {
                let definition = self.cached_by_name(&name)?;
                graph.get_mut(*handle).parents[i].id = definition.id;
            }

            let property_names: Vec<(usize, String)> = graph
                .get(*handle)
                .properties
                .iter()
                .enumerate()
                .filter(|(_, property)| property.id.is_none())
                .map(|(i, property)| (i, property.name.clone()))
                .collect();
            for (i, name) in property_names {
                let definition = self.cached_by_name(&name)?;
                let property = &mut graph.get_mut(*handle).properties[i];
                property.id = definition.id;
                resolve_datatype(property, &definition)?;
            }
        }
        Ok(())
    }

    /// Add parents that the remote version of an update lacks. Runs before
    /// the inserts since some inserts depend on the new parents.
    fn execute_parent_updates_in_list(
        &mut self,
        graph: &mut EntityGraph,
        to_update: &[EntityHandle],
    ) -> Result<()> {
        self.set_ids_and_datatype_of_parents_and_properties(graph, to_update)?;
        let mut parent_updates = Vec::new();
        for handle in to_update {
            let entity = graph.get(*handle);
            let Some(id) = entity.id else {
                return Err(SyncError::internal(format!(
                    "update of {} has no id",
                    entity.label()
                )));
            };
            let mut old = self.remote.retrieve_by_id(id)?;
            let mut changed = false;
            for parent in &entity.parents {
                if !old.parents.iter().any(|existing| parents_match(existing, parent)) {
                    old.parents.push(Parent {
                        name: parent.name.clone(),
                        id: parent.id,
                    });
                    changed = true;
                }
            }
            if changed {
                parent_updates.push(old);
            }
        }
        if parent_updates.is_empty() {
            return Ok(());
        }
        debug!(count = parent_updates.len(), "record types need to be added to entities");
        match self.options.security_mode {
            SecurityMode::Update => self.remote.update(&parent_updates, false)?,
            SecurityMode::Insert => {
                self.pending.insert(&parent_updates, self.run_id, false)?;
                info!(
                    "some entities need to be updated because they are missing \
                     a parent record type; \
                     the update was NOT executed due to the chosen security mode, \
                     which might lead to a failure of inserts that follow"
                );
            }
            SecurityMode::Retrieve => {}
        }
        Ok(())
    }

    fn execute_inserts_in_list(
        &mut self,
        graph: &mut EntityGraph,
        to_insert: &[EntityHandle],
    ) -> Result<()> {
        for handle in to_insert {
            let names: Vec<String> = graph
                .get(*handle)
                .properties
                .iter()
                .map(|property| property.name.clone())
                .collect();
            for (i, name) in names.into_iter().enumerate() {
                if name == "name" {
                    return Err(SyncError::unsupported(
                        "cannot search for the property with name \"name\"",
                    ));
                }
                let definition = self.cached_by_name(&name)?;
                let property = &mut graph.get_mut(*handle).properties[i];
                resolve_datatype(property, &definition)?;
                replace_name_with_referenced_entity_id(property, self.remote)?;
            }
        }
        if to_insert.is_empty() || self.options.security_mode == SecurityMode::Retrieve {
            return Ok(());
        }
        let batch = graph.detach_batch(to_insert)?;
        let ids = self.remote.insert(&batch, self.options.unique_names)?;
        if ids.len() != to_insert.len() {
            return Err(SyncError::remote(format!(
                "insert of {} entities returned {} ids",
                to_insert.len(),
                ids.len()
            )));
        }
        for (handle, id) in to_insert.iter().zip(ids) {
            graph.get_mut(*handle).id = Some(id);
        }
        Ok(())
    }

    fn execute_updates_in_list(
        &mut self,
        graph: &mut EntityGraph,
        to_update: &[EntityHandle],
    ) -> Result<()> {
        self.set_ids_and_datatype_of_parents_and_properties(graph, to_update)?;
        if to_update.is_empty() {
            return Ok(());
        }
        match self.options.security_mode {
            SecurityMode::Update => {
                let batch = graph.detach_batch(to_update)?;
                self.remote.update(&batch, self.options.unique_names)?;
            }
            SecurityMode::Insert => {
                let batch = graph.detach_batch(to_update)?;
                self.pending.insert(&batch, self.run_id, false)?;
            }
            SecurityMode::Retrieve => {}
        }
        Ok(())
    }
}

/// Entities of `handles` having a parent listed in `parents`.
pub fn check_whether_parent_exists(
    graph: &EntityGraph,
    handles: &[EntityHandle],
    parents: &[String],
) -> Vec<EntityHandle> {
    if parents.is_empty() {
        return Vec::new();
    }
    handles
        .iter()
        .copied()
        .filter(|handle| {
            graph
                .get(*handle)
                .parents
                .iter()
                .any(|parent| parents.contains(&parent.name))
        })
        .collect()
}

/// Set the datatype of `property` from its remote definition: a Property
/// contributes its datatype, a RecordType its name. List values get a
/// `LIST<..>` datatype.
pub fn resolve_datatype(property: &mut Property, definition: &Entity) -> Result<()> {
    let datatype = match definition.role {
        Role::Property => definition.datatype.clone().ok_or_else(|| {
            SyncError::unsupported(format!(
                "property definition {} has no datatype",
                definition.label()
            ))
        })?,
        Role::RecordType => definition.name.clone().ok_or_else(|| {
            SyncError::unsupported(format!("record type {} has no name", definition.label()))
        })?,
        _ => {
            return Err(SyncError::unsupported(format!(
                "cannot set datatype of '{}' from {}",
                property.name,
                definition.label()
            )))
        }
    };
    let is_list = property.value.as_ref().is_some_and(Value::is_list);
    property.datatype = Some(if is_list && !datatype.starts_with("LIST") {
        format!("LIST<{datatype}>")
    } else {
        datatype
    });
    Ok(())
}

const PRIMITIVE_DATATYPES: &[&str] = &["INTEGER", "DOUBLE", "TEXT", "DATETIME", "BOOLEAN"];
const GENERIC_REFERENCE_DATATYPES: &[&str] = &["FILE", "REFERENCE"];

fn list_element_datatype(datatype: &str) -> Option<&str> {
    datatype.strip_prefix("LIST<")?.strip_suffix('>')
}

/// Reference datatypes naming a concrete record type.
fn is_specific_reference(datatype: &str) -> bool {
    !PRIMITIVE_DATATYPES.contains(&datatype)
        && !GENERIC_REFERENCE_DATATYPES.contains(&datatype)
        && list_element_datatype(datatype).is_none()
}

fn referenced_id_by_name(
    remote: &dyn RemoteStore,
    property: &str,
    datatype: &str,
    name: &str,
) -> Result<Value> {
    let query = format!(
        "FIND Entity '{}' with name='{}'",
        escape_squoted_text(datatype),
        escape_squoted_text(name)
    );
    let found = remote.query(&query, true).map_err(|err| {
        error!(
            "the property {property} with datatype={datatype} has the value {name} \
             and there is no appropriate entity with such a name"
        );
        err
    })?;
    match found.first().and_then(|entity| entity.id) {
        Some(id) => Ok(Value::Id(id)),
        None => Err(SyncError::not_found(format!("{datatype} named '{name}'"))),
    }
}

/// Text values of a property whose datatype names a record type are taken
/// to be names of entities of that type and replaced by their ids. Lists
/// are handled element-wise.
pub fn replace_name_with_referenced_entity_id(
    property: &mut Property,
    remote: &dyn RemoteStore,
) -> Result<()> {
    let Some(datatype) = property.datatype.clone() else {
        return Ok(());
    };
    match list_element_datatype(&datatype) {
        None => {
            if !is_specific_reference(&datatype) {
                return Ok(());
            }
            if let Some(Value::Text(name)) = &property.value {
                let id = referenced_id_by_name(remote, &property.name, &datatype, name)?;
                property.value = Some(id);
            }
        }
        Some(element) => {
            if !is_specific_reference(element) {
                return Ok(());
            }
            if let Some(Value::List(items)) = &mut property.value {
                for item in items.iter_mut() {
                    if let Value::Text(name) = item {
                        *item = referenced_id_by_name(remote, &property.name, element, name)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Summary of `handles` grouped by parent name, in first-seen order.
pub fn create_entity_summary(graph: &EntityGraph, handles: &[EntityHandle]) -> String {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for handle in handles {
        let entity = graph.get(*handle);
        for parent in &entity.parents {
            match groups.iter_mut().find(|(name, _)| *name == parent.name) {
                Some((_, labels)) => labels.push(entity.label()),
                None => groups.push((parent.name.clone(), vec![entity.label()])),
            }
        }
    }
    let mut output = String::new();
    for (parent, labels) in groups {
        output.push_str(&format!("{parent}:\n{}\n", labels.join(", ")));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    #[test]
    fn test_security_mode_ordering() {
        assert!(SecurityMode::Retrieve < SecurityMode::Insert);
        assert!(SecurityMode::Insert < SecurityMode::Update);
        assert_eq!(SecurityMode::default(), SecurityMode::Retrieve);
    }

    #[test]
    fn test_phase_transitions() {
        use SyncPhase::*;
        assert!(Idle.can_advance_to(Reconciling));
        assert!(Filtering.can_advance_to(Reporting));
        assert!(Filtering.can_advance_to(ParentUpdating));
        assert!(Reporting.can_advance_to(NotifyingPending));
        assert!(!Reporting.can_advance_to(Inserting));
        assert!(!Idle.can_advance_to(Done));
        assert!(Inserting.can_advance_to(Failed));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Reconciling));
    }

    #[test]
    fn test_resolve_datatype() {
        let definition = Entity::new(Role::Property);
        let mut property = Property::new("date", Some(Value::text("2024")));
        assert!(resolve_datatype(&mut property, &definition).is_err());

        let mut definition = Entity::new(Role::Property).with_name("date");
        definition.datatype = Some("DATETIME".into());
        resolve_datatype(&mut property, &definition).unwrap();
        assert_eq!(property.datatype.as_deref(), Some("DATETIME"));

        let record_type = Entity::new(Role::RecordType).with_name("Person");
        let mut authors = Property::new(
            "authors",
            Some(Value::List(vec![Value::text("a"), Value::text("b")])),
        );
        resolve_datatype(&mut authors, &record_type).unwrap();
        assert_eq!(authors.datatype.as_deref(), Some("LIST<Person>"));

        let record = Entity::record().with_name("x");
        assert!(matches!(
            resolve_datatype(&mut authors, &record),
            Err(SyncError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_replace_name_with_referenced_entity_id() {
        let remote = MemoryRemote::new();
        remote.add_record_type("Person", None);
        let ada = remote.add_entity(Entity::record().with_parent("Person").with_name("Ada"));
        let bob = remote.add_entity(Entity::record().with_parent("Person").with_name("Bob"));

        let mut single = Property::new("author", Some(Value::text("Ada")));
        single.datatype = Some("Person".into());
        replace_name_with_referenced_entity_id(&mut single, &remote).unwrap();
        assert_eq!(single.value, Some(Value::Id(ada)));

        let mut list = Property::new(
            "authors",
            Some(Value::List(vec![Value::text("Bob"), Value::Id(ada)])),
        );
        list.datatype = Some("LIST<Person>".into());
        replace_name_with_referenced_entity_id(&mut list, &remote).unwrap();
        assert_eq!(list.value, Some(Value::List(vec![Value::Id(bob), Value::Id(ada)])));

        let mut generic = Property::new("file", Some(Value::text("Ada")));
        generic.datatype = Some("FILE".into());
        replace_name_with_referenced_entity_id(&mut generic, &remote).unwrap();
        assert_eq!(generic.value, Some(Value::text("Ada")));

        let mut unknown = Property::new("author", Some(Value::text("Eve")));
        unknown.datatype = Some("Person".into());
        assert!(replace_name_with_referenced_entity_id(&mut unknown, &remote).is_err());
    }

    #[test]
    fn test_check_whether_parent_exists() {
        let mut graph = EntityGraph::new();
        let a = graph.add(Entity::record().with_parent("Experiment"));
        let b = graph.add(Entity::record().with_parent("Project"));
        let blocked = vec!["Project".to_string()];
        assert_eq!(check_whether_parent_exists(&graph, &[a, b], &blocked), vec![b]);
        assert!(check_whether_parent_exists(&graph, &[a, b], &[]).is_empty());
    }

    #[test]
    fn test_create_entity_summary_groups_by_parent() {
        let mut graph = EntityGraph::new();
        let a = graph.add(Entity::record().with_id(1).with_parent("Experiment"));
        let b = graph.add(Entity::record().with_id(2).with_parent("Project"));
        let c = graph.add(Entity::record().with_id(3).with_parent("Experiment"));
        let summary = create_entity_summary(&graph, &[a, b, c]);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Experiment:");
        assert_eq!(lines[1].matches(", ").count(), 1);
        assert_eq!(lines[2], "Project:");
    }
}
