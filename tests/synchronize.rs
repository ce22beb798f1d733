mod support;

use std::sync::{Arc, Mutex};

use crawler_sync::{
    Entity, EntityGraph, EntityHandle, LogNotifier, MemoryPendingCache, Orchestrator,
    PendingChange, PendingChangeNotifier, RemoteId, RunId, SecurityMode, SyncError, SyncOptions,
    SyncPhase, Value,
};
use support::{crawler, experiment, fixture, project, Fixture};

/// Remote with project "known" and its experiment run 1 dated 2020-01-01.
fn seeded() -> (Fixture, RemoteId, RemoteId) {
    let fixture = fixture();
    let project_id = fixture.remote.add_entity(project("known"));
    let experiment_id = fixture.remote.add_entity(
        Entity::record()
            .with_parent("Experiment")
            .with_property("Project", Value::Id(project_id))
            .with_property("run", 1i64)
            .with_property("date", "2020-01-01"),
    );
    (fixture, project_id, experiment_id)
}

/// Crawl of "known" with run 1 dated `date` and a new run 2.
fn crawl(date: &str) -> (EntityGraph, Vec<EntityHandle>) {
    let mut graph = EntityGraph::new();
    let p = graph.add(project("known"));
    let changed = graph.add(experiment(p, 1).with_property("date", date));
    let fresh = graph.add(experiment(p, 2).with_property("date", "2024-05-01"));
    (graph, vec![changed, fresh])
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    calls: Arc<Mutex<Vec<(usize, bool)>>>,
}

impl PendingChangeNotifier for RecordingNotifier {
    fn notify(
        &self,
        changes: &[PendingChange],
        _run_id: RunId,
        inserts: bool,
    ) -> anyhow::Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .push((changes.len(), inserts));
        Ok(())
    }
}

#[test]
fn dry_run_reports_without_writing() -> anyhow::Result<()> {
    let (fixture, _, _) = seeded();
    let mut crawler = crawler(&fixture, SecurityMode::Update);
    crawler.options_mut().commit_changes = false;
    let (mut graph, roots) = crawl("2024-01-01");

    let report = crawler.synchronize(&mut graph, &roots)?;

    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(report.to_insert, vec![roots[1]]);
    assert_eq!(report.to_update.len(), 1);
    let stats = fixture.remote.stats();
    assert_eq!((stats.inserted, stats.updated), (0, 0));
    assert!(crawler.pending().get_updates(crawler.run_id())?.is_empty());
    Ok(())
}

#[test]
fn update_mode_writes_inserts_and_updates() -> anyhow::Result<()> {
    let (fixture, project_id, experiment_id) = seeded();
    let crawler = crawler(&fixture, SecurityMode::Update);
    let (mut graph, roots) = crawl("2024-01-01");

    let report = crawler.synchronize(&mut graph, &roots)?;

    let stats = fixture.remote.stats();
    assert_eq!((stats.inserted, stats.updated), (1, 1));
    let inserted_id = graph.get(report.to_insert[0]).id.expect("inserted entity has an id");
    let inserted = fixture.remote.get(inserted_id).expect("stored");
    assert_eq!(
        inserted.get_property("Project").and_then(|p| p.value.clone()),
        Some(Value::Id(project_id))
    );
    assert_eq!(
        inserted.get_property("Project").and_then(|p| p.datatype.clone()).as_deref(),
        Some("Project")
    );
    let updated = fixture.remote.get(experiment_id).expect("stored");
    assert_eq!(
        updated.get_property("date").and_then(|p| p.value.clone()),
        Some(Value::text("2024-01-01"))
    );
    assert!(crawler.pending().get_updates(crawler.run_id())?.is_empty());
    Ok(())
}

#[test]
fn insert_mode_queues_updates_for_authorization() -> anyhow::Result<()> {
    let (fixture, _, experiment_id) = seeded();
    let notifier = RecordingNotifier::default();
    let crawler = crawler(&fixture, SecurityMode::Insert).with_notifier(notifier.clone());
    let (mut graph, roots) = crawl("2024-01-01");

    crawler.synchronize(&mut graph, &roots)?;

    let stats = fixture.remote.stats();
    assert_eq!((stats.inserted, stats.updated), (1, 0));
    let pending = crawler.pending().get_updates(crawler.run_id())?;
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].insert);
    assert_eq!(pending[0].entity.id, Some(experiment_id));
    assert!(crawler.pending().get_inserts(crawler.run_id())?.is_empty());
    assert_eq!(
        fixture
            .remote
            .get(experiment_id)
            .and_then(|e| e.get_property("date").and_then(|p| p.value.clone())),
        Some(Value::text("2020-01-01"))
    );
    assert_eq!(*notifier.calls.lock().unwrap(), vec![(1, false)]);
    Ok(())
}

#[test]
fn retrieve_mode_neither_writes_nor_queues() -> anyhow::Result<()> {
    let (fixture, _, _) = seeded();
    let notifier = RecordingNotifier::default();
    let crawler = crawler(&fixture, SecurityMode::Retrieve).with_notifier(notifier.clone());
    let (mut graph, roots) = crawl("2024-01-01");

    let report = crawler.synchronize(&mut graph, &roots)?;

    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!((report.to_insert.len(), report.to_update.len()), (1, 1));
    let stats = fixture.remote.stats();
    assert_eq!((stats.inserted, stats.updated), (0, 0));
    assert!(crawler.pending().get_inserts(crawler.run_id())?.is_empty());
    assert!(crawler.pending().get_updates(crawler.run_id())?.is_empty());
    assert!(notifier.calls.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn blocked_record_types_fail_the_run() {
    let (fixture, _, _) = seeded();
    let pending = MemoryPendingCache::new();
    let notifier = LogNotifier::new();
    let options = SyncOptions {
        security_mode: SecurityMode::Update,
        no_insert_types: vec!["Experiment".to_string()],
        ..SyncOptions::default()
    };
    let mut orchestrator = Orchestrator::new(
        &fixture.adapter,
        &*fixture.remote,
        &pending,
        &notifier,
        RunId::new(),
        options,
    );
    let (mut graph, roots) = crawl("2024-01-01");

    let result = orchestrator.synchronize(&mut graph, &roots);

    match result {
        Err(SyncError::ForbiddenTransaction {
            insert_types,
            update_types,
        }) => {
            assert_eq!(insert_types, vec!["Experiment".to_string()]);
            assert!(update_types.is_empty());
        }
        other => panic!("expected a forbidden transaction, got {other:?}"),
    }
    assert_eq!(orchestrator.phase(), SyncPhase::Failed);
    let stats = fixture.remote.stats();
    assert_eq!((stats.inserted, stats.updated), (0, 0));
}

#[test]
fn identical_crawl_needs_no_update() -> anyhow::Result<()> {
    let (fixture, _, _) = seeded();
    let crawler = crawler(&fixture, SecurityMode::Update);
    let mut graph = EntityGraph::new();
    let p = graph.add(project("known"));
    let unchanged = graph.add(experiment(p, 1).with_property("date", "2020-01-01"));

    let report = crawler.synchronize(&mut graph, &[unchanged])?;

    assert!(report.to_insert.is_empty());
    assert!(report.to_update.is_empty());
    assert_eq!(fixture.remote.stats().updated, 0);
    Ok(())
}

#[test]
fn merge_with_remote_keeps_untouched_properties() -> anyhow::Result<()> {
    let (fixture, _, experiment_id) = seeded();
    fixture.remote.add_property("comment", "TEXT");
    let crawler = crawler(&fixture, SecurityMode::Update);
    let mut graph = EntityGraph::new();
    let p = graph.add(project("known"));
    let commented = graph.add(experiment(p, 1).with_property("comment", "checked"));

    let report = crawler.synchronize(&mut graph, &[commented])?;

    assert_eq!(report.to_update.len(), 1);
    let merged = graph.get(report.to_update[0]);
    assert!(merged.get_property("date").is_some());
    assert!(merged.get_property("comment").is_some());
    let stored = fixture.remote.get(experiment_id).expect("stored");
    assert_eq!(
        stored.get_property("date").and_then(|p| p.value.clone()),
        Some(Value::text("2020-01-01"))
    );
    assert_eq!(
        stored.get_property("comment").and_then(|p| p.value.clone()),
        Some(Value::text("checked"))
    );
    Ok(())
}

#[test]
fn new_parents_are_added_before_updates() -> anyhow::Result<()> {
    let (fixture, _, experiment_id) = seeded();
    fixture.remote.add_record_type("Calibration", None);
    let crawler = crawler(&fixture, SecurityMode::Update);
    let mut graph = EntityGraph::new();
    let p = graph.add(project("known"));
    let calibration = graph.add(
        experiment(p, 1)
            .with_property("date", "2020-01-01")
            .with_parent("Calibration"),
    );

    let report = crawler.synchronize(&mut graph, &[calibration])?;

    assert_eq!(report.to_update.len(), 1);
    // one parent update, then the regular update
    assert_eq!(fixture.remote.stats().updated, 2);
    let stored = fixture.remote.get(experiment_id).expect("stored");
    assert!(stored.has_parent("Experiment"));
    assert!(stored.has_parent("Calibration"));
    Ok(())
}

#[test]
fn reference_by_name_is_resolved_on_insert() -> anyhow::Result<()> {
    let (fixture, project_id, _) = seeded();
    fixture.remote.add_record_type("Note", None);
    let crawler = crawler(&fixture, SecurityMode::Insert);
    let mut graph = EntityGraph::new();
    let note = graph.add(
        Entity::record()
            .with_parent("Note")
            .with_path("/notes/1.txt")
            .with_property("Project", "known"),
    );

    let report = crawler.synchronize(&mut graph, &[note])?;

    assert_eq!(report.to_insert, vec![note]);
    let id = graph.get(note).id.expect("inserted");
    let stored = fixture.remote.get(id).expect("stored");
    assert_eq!(
        stored.get_property("Project").and_then(|p| p.value.clone()),
        Some(Value::Id(project_id))
    );
    Ok(())
}
