//! # Registered identifiables
//!
//! Per record type templates that list which properties, whether the name,
//! and which referencing record types make up an entity's identity.
//!
//! Definitions are read from JSON of the form
//! `{"Experiment": ["date", "name", {"is_referenced_by": ["Project", "*"]}]}`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One identifying entry of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifyingProperty {
    Name,
    Property(String),
    /// Record types (or `*` for any) that must reference the entity.
    ReferencedBy(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredIdentifiable {
    pub record_type: String,
    pub properties: Vec<IdentifyingProperty>,
}

impl RegisteredIdentifiable {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_name(mut self) -> Self {
        self.properties.push(IdentifyingProperty::Name);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.properties
            .push(IdentifyingProperty::Property(name.into()));
        self
    }

    pub fn referenced_by<I, S>(mut self, record_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties.push(IdentifyingProperty::ReferencedBy(
            record_types.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn declares_name(&self) -> bool {
        self.properties
            .iter()
            .any(|p| matches!(p, IdentifyingProperty::Name))
    }

    /// Plain identifying property names, in declaration order.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().filter_map(|p| match p {
            IdentifyingProperty::Property(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn referencing_types(&self) -> impl Iterator<Item = &[String]> {
        self.properties.iter().filter_map(|p| match p {
            IdentifyingProperty::ReferencedBy(types) => Some(types.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Plain(String),
    Keyed(BTreeMap<String, Vec<String>>),
}

/// All registered identifiables, in registration order.
#[derive(Debug, Clone, Default)]
pub struct IdentifiableRegistry {
    definitions: Vec<RegisteredIdentifiable>,
}

impl IdentifiableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: RegisteredIdentifiable) {
        self.definitions.push(definition);
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading identifiables from {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("parsing identifiables from {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<RawEntry>> = serde_json::from_str(text)?;
        let mut registry = Self::new();
        for (record_type, entries) in raw {
            if entries.is_empty() {
                return Err(anyhow!(
                    "identifiable of {record_type} must declare at least one property"
                ));
            }
            let mut definition = RegisteredIdentifiable::new(&record_type);
            for entry in entries {
                definition.properties.push(match entry {
                    RawEntry::Plain(name) if name.eq_ignore_ascii_case("name") => {
                        IdentifyingProperty::Name
                    }
                    RawEntry::Plain(name) => IdentifyingProperty::Property(name),
                    RawEntry::Keyed(map) => {
                        let mut entries = map.into_iter();
                        match (entries.next(), entries.next()) {
                            (Some((key, types)), None)
                                if key.eq_ignore_ascii_case("is_referenced_by") =>
                            {
                                IdentifyingProperty::ReferencedBy(types)
                            }
                            _ => {
                                return Err(anyhow!(
                                    "identifiable of {record_type}: \
                                     only `is_referenced_by` may be given as a mapping"
                                ))
                            }
                        }
                    }
                });
            }
            registry.register(definition);
        }
        Ok(registry)
    }

    /// First definition whose record type equals `record_type`, ignoring case.
    pub fn get(&self, record_type: &str) -> Option<&RegisteredIdentifiable> {
        self.definitions
            .iter()
            .find(|d| d.record_type.eq_ignore_ascii_case(record_type))
    }

    pub fn definitions(&self) -> &[RegisteredIdentifiable] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
