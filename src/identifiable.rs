//! Identifying fingerprint of an entity.

use crate::graph::EntityGraph;
use crate::model::{EntityHandle, RemoteId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of an identifying value. References remember the id the
/// referenced entity carried when the identifiable was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdentValue {
    Scalar(Value),
    Reference {
        handle: Option<EntityHandle>,
        id: Option<RemoteId>,
    },
    List(Vec<IdentValue>),
}

impl IdentValue {
    /// Snapshot `value` against the current state of `graph`.
    pub fn from_value(graph: &EntityGraph, value: &Value) -> Self {
        match value {
            Value::Entity(handle) => {
                let target = graph.resolve(*handle);
                IdentValue::Reference {
                    handle: Some(target),
                    id: graph.get(target).id,
                }
            }
            Value::Id(id) => IdentValue::Reference {
                handle: None,
                id: Some(*id),
            },
            Value::List(items) => {
                IdentValue::List(items.iter().map(|v| Self::from_value(graph, v)).collect())
            }
            scalar => IdentValue::Scalar(scalar.clone()),
        }
    }

    /// Reference values, including list elements.
    pub fn references(&self) -> Vec<(Option<EntityHandle>, Option<RemoteId>)> {
        match self {
            IdentValue::Reference { handle, id } => vec![(*handle, *id)],
            IdentValue::List(items) => items.iter().flat_map(IdentValue::references).collect(),
            IdentValue::Scalar(_) => Vec::new(),
        }
    }

    fn representation(&self) -> String {
        match self {
            IdentValue::Scalar(value) => scalar_representation(value),
            IdentValue::Reference { handle, id } => match (id, handle) {
                (Some(id), _) => id.to_string(),
                (None, Some(handle)) => format!("@{}", handle),
                (None, None) => "None".to_string(),
            },
            IdentValue::List(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(IdentValue::representation)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

fn scalar_representation(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        // numeric values are keyed with one decimal
        Value::Double(d) => format!("{:.1}", d),
        Value::Text(text) => escape_representation(text),
        Value::Id(id) => id.to_string(),
        Value::Entity(handle) => format!("@{}", handle),
        Value::List(_) => String::new(),
    }
}

fn escape_representation(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('"');
    for c in text.chars() {
        if matches!(c, '"' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    escaped
}

/// Fingerprint deciding whether two entities denote the same object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identifiable {
    pub record_id: Option<RemoteId>,
    pub record_type: Option<String>,
    /// Set only when the registered identifiable declares `name`.
    pub name: Option<String>,
    /// Identifying properties in registration order; `None` marks an unset value.
    pub properties: Vec<(String, Option<IdentValue>)>,
    pub path: Option<String>,
    /// Ids of the entities that reference this one (`is_referenced_by`).
    pub backrefs: Vec<Option<RemoteId>>,
}

impl Identifiable {
    pub fn get_property(&self, name: &str) -> Option<&Option<IdentValue>> {
        self.properties
            .iter()
            .find(|(pname, _)| pname == name)
            .map(|(_, value)| value)
    }

    /// Canonical key: equal for identifiables built from the same template and values.
    pub fn get_representation(&self) -> String {
        let mut repr = format!(
            "{}<{}>",
            self.record_type.as_deref().unwrap_or("None"),
            self.name
                .as_deref()
                .map(escape_representation)
                .unwrap_or_else(|| "None".to_string())
        );

        let mut properties: Vec<&(String, Option<IdentValue>)> = self.properties.iter().collect();
        properties.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in properties {
            let value = value
                .as_ref()
                .map(IdentValue::representation)
                .unwrap_or_else(|| "None".to_string());
            repr.push_str(&format!("{}:{};", escape_representation(name), value));
        }

        if let Some(path) = &self.path {
            repr.push_str(&format!("path:{};", escape_representation(path)));
        }

        if !self.backrefs.is_empty() {
            let mut ids: Vec<String> = self
                .backrefs
                .iter()
                .map(|id| id.map(|id| id.to_string()).unwrap_or_else(|| "None".into()))
                .collect();
            ids.sort();
            repr.push_str(&format!("backrefs:[{}]", ids.join(", ")));
        }
        repr
    }
}

impl PartialEq for Identifiable {
    fn eq(&self, other: &Self) -> bool {
        self.get_representation() == other.get_representation()
    }
}

impl Eq for Identifiable {}

impl fmt::Display for Identifiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.get_representation())
    }
}
