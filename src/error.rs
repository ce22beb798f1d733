//! Error taxonomy for reconciliation and synchronization.

use crate::model::EntityHandle;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while reconciling or synchronizing a crawled entity graph.
#[derive(Debug, Error)]
pub enum SyncError {
    /// More than one remote entity matches an identifiable.
    #[error("identifiable {identifiable} is ambiguous: {count} remote entities match")]
    AmbiguousIdentifiable { identifiable: String, count: usize },

    /// More than one registered identifiable fits an entity.
    #[error("more than one registered identifiable fits {entity}")]
    AmbiguousRegisteredIdentifiable { entity: String },

    #[error("{entity} has no identifying property '{property}'")]
    MissingIdentifyingProperty { entity: String, property: String },

    /// None of the declared `is_referenced_by` types reference the entity.
    #[error(
        "could not find referencing entities of type(s) {types:?} \
         (found references from {available:?})"
    )]
    MissingReferencingEntities {
        types: Vec<String>,
        available: Vec<String>,
    },

    #[error("multi-properties are not supported ('{property}' on {entity})")]
    MultiProperty { entity: String, property: String },

    /// The entity has neither id, path nor a registered identifiable.
    #[error("{entity} cannot be identified: no id, no path and no registered identifiable")]
    NoIdentifiable { entity: String },

    /// Two concrete values for the same property disagree.
    #[error("merge conflict on property '{property}': {left} != {right}")]
    MergeConflict {
        property: String,
        left: String,
        right: String,
    },

    /// The structural merge could not combine two entities.
    #[error("entities could not be merged: {message}")]
    EntityMergeConflict { message: String },

    #[error("cached entity {cached} and referenced entity {referenced} differ")]
    ReferenceMismatch { cached: String, referenced: String },

    #[error(
        "could not finish split_into_inserts_and_updates; circular dependency: {}",
        describe_cycle(.cycle)
    )]
    CircularDependency { cycle: Option<Vec<EntityHandle>> },

    /// An insert or update touches a blocked record type.
    #[error(
        "forbidden transaction: inserts of {insert_types:?} and updates of {update_types:?} \
         are not allowed"
    )]
    ForbiddenTransaction {
        insert_types: Vec<String>,
        update_types: Vec<String>,
    },

    #[error("records must have a parent: {entity}")]
    MissingParent { entity: String },

    #[error("{entity} has neither id, path nor identifiable and cannot be indexed")]
    Unindexable { entity: String },

    #[error("{what} not found")]
    NotFound { what: String },

    /// The remote rejected a query (for example because it is too long).
    #[error("query rejected by remote: {message}")]
    QueryRejected { message: String },

    #[error("query `{query}` expected exactly one result, got {count}")]
    QueryNotUnique { query: String, count: usize },

    #[error("invalid query `{query}`: {message}")]
    InvalidQuery { query: String, message: String },

    /// A reference points at an entity that has no id and is not part of the write batch.
    #[error("{entity} references {target} which has no id and is not written in the same batch")]
    DanglingReference { entity: String, target: String },

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("pending change cache: {0}")]
    Cache(#[from] anyhow::Error),

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl SyncError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Whether the error aborts a run. Only remote lookups that found nothing
    /// and rejected queries are handled by the engine itself.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::QueryRejected { .. })
    }

    /// Callers report forbidden transactions with a distinct status.
    pub fn is_forbidden_transaction(&self) -> bool {
        matches!(self, Self::ForbiddenTransaction { .. })
    }
}

fn describe_cycle(cycle: &Option<Vec<EntityHandle>>) -> String {
    match cycle {
        Some(handles) => handles
            .iter()
            .map(|handle| handle.to_string())
            .collect::<Vec<_>>()
            .join(" -> "),
        None => "no cycle found".to_string(),
    }
}
