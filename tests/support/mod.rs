use std::sync::Arc;

use crawler_sync::test_support::{default_registry, install_schema};
use crawler_sync::{
    Crawler, Entity, EntityHandle, MemoryRemote, RemoteIdentifiableAdapter, RemoteStore,
    SecurityMode, SyncOptions,
};

/// A remote with the generated-crawl schema and an adapter over it.
pub struct Fixture {
    pub remote: Arc<MemoryRemote>,
    pub adapter: RemoteIdentifiableAdapter,
}

pub fn fixture() -> Fixture {
    let remote = Arc::new(MemoryRemote::new());
    install_schema(&remote);
    let shared: Arc<dyn RemoteStore> = remote.clone();
    Fixture {
        adapter: RemoteIdentifiableAdapter::new(default_registry(), shared),
        remote,
    }
}

#[allow(dead_code)]
pub fn crawler(fixture: &Fixture, security_mode: SecurityMode) -> Crawler {
    let shared: Arc<dyn RemoteStore> = fixture.remote.clone();
    let adapter = RemoteIdentifiableAdapter::new(default_registry(), shared.clone());
    Crawler::new(
        adapter,
        shared,
        SyncOptions {
            security_mode,
            ..SyncOptions::default()
        },
    )
}

pub fn project(name: &str) -> Entity {
    Entity::record().with_parent("Project").with_name(name)
}

pub fn experiment(project: EntityHandle, run: i64) -> Entity {
    Entity::record()
        .with_parent("Experiment")
        .with_property("Project", project)
        .with_property("run", run)
}

#[allow(dead_code)]
pub fn measurement(code: &str) -> Entity {
    Entity::record()
        .with_parent("Measurement")
        .with_property("code", code)
}
