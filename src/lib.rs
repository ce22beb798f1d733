//! # Crawler Sync
//!
//! Reconciles crawled entity graphs with a remote system of record and
//! synchronizes them: crawled entities are identified against the remote,
//! duplicates are merged, and the differences are inserted or updated as
//! far as the chosen security mode allows.

pub mod adapter;
pub mod config;
pub mod error;
pub mod graph;
pub mod identifiable;
pub mod lookup;
pub mod merge;
pub mod model;
pub mod pending;
pub mod query;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod sync;
pub mod test_support;

// Re-export main types for convenience
pub use adapter::{
    IdentifiableAdapter, LocalStorageIdentifiableAdapter, RemoteIdentifiableAdapter,
};
pub use config::{ConfigError, ConfigOverrides, SyncConfig};
pub use error::{Result, SyncError};
pub use graph::EntityGraph;
pub use identifiable::{IdentValue, Identifiable};
pub use lookup::TreatedRecordLookup;
pub use model::{Entity, EntityHandle, Parent, Property, RemoteId, Role, RunId, Value};
pub use pending::{MemoryPendingCache, PendingChange, PendingChangeCache, PersistentPendingCache};
pub use reconcile::Split;
pub use registry::{IdentifiableRegistry, RegisteredIdentifiable};
pub use remote::{MemoryRemote, RemoteStore};
pub use sync::{
    LogNotifier, Orchestrator, PendingChangeNotifier, SecurityMode, SyncOptions, SyncPhase,
    SyncReport,
};

use std::sync::Arc;

/// Main API: one crawler bound to a remote, an identifiable adapter and a
/// pending-change cache. Each call to [`Crawler::synchronize`] is a run
/// identified by [`Crawler::run_id`].
pub struct Crawler {
    adapter: Box<dyn IdentifiableAdapter>,
    remote: Arc<dyn RemoteStore>,
    pending: Box<dyn PendingChangeCache>,
    notifier: Box<dyn PendingChangeNotifier>,
    run_id: RunId,
    options: SyncOptions,
}

impl Crawler {
    /// Crawler with an in-memory pending cache and log notifications.
    pub fn new<A>(adapter: A, remote: Arc<dyn RemoteStore>, options: SyncOptions) -> Self
    where
        A: IdentifiableAdapter + 'static,
    {
        Self {
            adapter: Box::new(adapter),
            remote,
            pending: Box::new(MemoryPendingCache::new()),
            notifier: Box::new(LogNotifier::new()),
            run_id: RunId::new(),
            options,
        }
    }

    /// Build a crawler from configuration: registered identifiables from
    /// `config.identifiables`, a RocksDB pending cache when
    /// `config.pending_cache.path` is set.
    pub fn from_config(config: &SyncConfig, remote: Arc<dyn RemoteStore>) -> anyhow::Result<Self> {
        let registry = match &config.identifiables {
            Some(path) => IdentifiableRegistry::load(path)?,
            None => IdentifiableRegistry::new(),
        };
        let adapter = RemoteIdentifiableAdapter::with_query_settings(
            registry,
            remote.clone(),
            config.query.prefix_length,
            config.query.cache_capacity,
        );
        let pending: Box<dyn PendingChangeCache> = match &config.pending_cache.path {
            Some(path) => Box::new(PersistentPendingCache::open(path)?),
            None => Box::new(MemoryPendingCache::new()),
        };
        Ok(Self {
            adapter: Box::new(adapter),
            remote,
            pending,
            notifier: Box::new(LogNotifier::from_config(&config.notifications)),
            run_id: RunId::new(),
            options: SyncOptions::from_config(config),
        })
    }

    pub fn with_pending_cache<C>(mut self, pending: C) -> Self
    where
        C: PendingChangeCache + 'static,
    {
        self.pending = Box::new(pending);
        self
    }

    pub fn with_notifier<N>(mut self, notifier: N) -> Self
    where
        N: PendingChangeNotifier + 'static,
    {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SyncOptions {
        &mut self.options
    }

    pub fn pending(&self) -> &dyn PendingChangeCache {
        self.pending.as_ref()
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Classify every entity reachable from `roots` as missing or existing.
    pub fn split_into_inserts_and_updates(
        &self,
        graph: &mut EntityGraph,
        roots: &[EntityHandle],
    ) -> Result<Split> {
        reconcile::split_into_inserts_and_updates(
            graph,
            roots,
            self.adapter.as_ref(),
            self.remote.as_ref(),
        )
    }

    /// Run a full synchronization of the entities reachable from `roots`.
    pub fn synchronize(
        &self,
        graph: &mut EntityGraph,
        roots: &[EntityHandle],
    ) -> Result<SyncReport> {
        let mut orchestrator = Orchestrator::new(
            self.adapter.as_ref(),
            self.remote.as_ref(),
            self.pending.as_ref(),
            self.notifier.as_ref(),
            self.run_id,
            self.options.clone(),
        );
        orchestrator.synchronize(graph, roots)
    }
}
