//! # Data Model
//!
//! Entities of the crawled graph: records, files and the schema entities
//! (record types, properties) they point at. References between entities are
//! either by handle into an [`crate::graph::EntityGraph`] or by remote id.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier assigned by the remote datastore. Negative values are
/// placeholders for entities known to be missing remotely.
pub type RemoteId = i64;

/// Stable arena handle of an entity inside an [`crate::graph::EntityGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(pub u32);

impl EntityHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Identifier of one synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Record,
    File,
    RecordType,
    Property,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Record => "Record",
            Role::File => "File",
            Role::RecordType => "RecordType",
            Role::Property => "Property",
        };
        f.write_str(name)
    }
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    /// Reference by remote id.
    Id(RemoteId),
    /// Reference by value to another entity of the same graph.
    Entity(EntityHandle),
    List(Vec<Value>),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Id(_) | Value::Entity(_))
    }

    /// Handles referenced by this value, including list elements.
    pub fn entity_handles(&self) -> Vec<EntityHandle> {
        match self {
            Value::Entity(handle) => vec![*handle],
            Value::List(items) => items.iter().flat_map(Value::entity_handles).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<EntityHandle> for Value {
    fn from(value: EntityHandle) -> Self {
        Value::Entity(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parent {
    pub name: String,
    pub id: Option<RemoteId>,
}

impl Parent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub id: Option<RemoteId>,
    pub value: Option<Value>,
    pub datatype: Option<String>,
    pub unit: Option<String>,
    pub importance: Option<String>,
}

impl Property {
    pub fn new(name: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            value,
            ..Self::default()
        }
    }
}

/// A node of the crawled graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Entity {
    pub id: Option<RemoteId>,
    pub role: Role,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Datatype of Property-role entities.
    pub datatype: Option<String>,
    pub path: Option<String>,
    pub file: Option<String>,
    pub checksum: Option<String>,
    pub size: Option<u64>,
    pub parents: Vec<Parent>,
    pub properties: Vec<Property>,
}

impl Entity {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    pub fn record() -> Self {
        Self::new(Role::Record)
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(Role::File)
        }
    }

    pub fn with_id(mut self, id: RemoteId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_parent(mut self, name: impl Into<String>) -> Self {
        self.parents.push(Parent::new(name));
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties
            .push(Property::new(name, Some(value.into())));
        self
    }

    pub fn with_empty_property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(Property::new(name, None));
        self
    }

    pub fn first_parent_name(&self) -> Option<&str> {
        self.parents.first().map(|parent| parent.name.as_str())
    }

    pub fn has_parent(&self, name: &str) -> bool {
        self.parents
            .iter()
            .any(|parent| parent.name.eq_ignore_ascii_case(name))
    }

    pub fn get_parent(&self, name: &str) -> Option<&Parent> {
        self.parents.iter().find(|parent| parent.name == name)
    }

    pub fn get_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|property| property.name == name)
    }

    pub fn get_property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties
            .iter_mut()
            .find(|property| property.name == name)
    }

    /// Number of properties carrying `name`.
    pub fn property_count(&self, name: &str) -> usize {
        self.properties
            .iter()
            .filter(|property| property.name == name)
            .count()
    }

    /// Short human readable label used in logs and error messages.
    pub fn label(&self) -> String {
        let kind = self.first_parent_name().unwrap_or("<no parent>");
        match (&self.id, &self.name, &self.path) {
            (Some(id), _, _) => format!("{} {}(id={})", self.role, kind, id),
            (None, Some(name), _) => format!("{} {}(name={})", self.role, kind, name),
            (None, None, Some(path)) => format!("{} {}(path={})", self.role, kind, path),
            (None, None, None) => format!("{} {}", self.role, kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let entity = Entity::record()
            .with_parent("Experiment")
            .with_name("exp")
            .with_property("date", "2024-01-01")
            .with_empty_property("comment");

        assert!(entity.has_parent("experiment"));
        assert_eq!(entity.first_parent_name(), Some("Experiment"));
        assert_eq!(
            entity.get_property("date").and_then(|p| p.value.clone()),
            Some(Value::text("2024-01-01"))
        );
        assert_eq!(entity.get_property("comment").map(|p| p.value.is_none()), Some(true));
        assert_eq!(entity.label(), "Record Experiment(name=exp)");
    }

    #[test]
    fn test_entity_handles_flatten_lists() {
        let value = Value::List(vec![
            Value::Entity(EntityHandle(1)),
            Value::Int(3),
            Value::Entity(EntityHandle(4)),
        ]);
        assert_eq!(value.entity_handles(), vec![EntityHandle(1), EntityHandle(4)]);
        assert_eq!(EntityHandle(7).to_string(), "E7");
    }
}
