//! Entity, reference and wire types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{Id, encode_id};

/// Attribute map of an entity.
pub type Attributes = Map<String, Value>;

/// Relationship map of an entity, keyed by relationship name.
pub type Relationships = BTreeMap<String, Relationship>;

/// A stub pointing at another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ref {
    pub model: String,
    pub id: Id,
}

impl Ref {
    pub fn new(model: impl Into<String>, id: impl Into<Id>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }

    /// Canonical key of the referenced id.
    pub fn key(&self) -> String {
        encode_id(&self.id)
    }

    /// Same model and same canonical id.
    pub fn same_target(&self, other: &Ref) -> bool {
        self.model == other.model && self.key() == other.key()
    }
}

/// A stored relationship value. Only stubs are ever kept at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Relationship {
    Many(Vec<Ref>),
    One(Ref),
    Null,
}

impl Relationship {
    /// Structural equality: refs by (model, id key), arrays pairwise in
    /// order, `Null` only with `Null`.
    pub fn same_as(&self, other: &Relationship) -> bool {
        match (self, other) {
            (Relationship::Null, Relationship::Null) => true,
            (Relationship::One(a), Relationship::One(b)) => a.same_target(b),
            (Relationship::Many(a), Relationship::Many(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_target(b))
            }
            _ => false,
        }
    }
}

/// A normalized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub model: String,
    pub id: Id,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub relationships: Relationships,
}

impl Entity {
    pub fn new(model: impl Into<String>, id: impl Into<Id>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
            attributes: Attributes::new(),
            relationships: Relationships::new(),
        }
    }

    /// Set an attribute, builder style.
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Set a relationship, builder style.
    pub fn with_relationship(mut self, name: impl Into<String>, value: Relationship) -> Self {
        self.relationships.insert(name.into(), value);
        self
    }

    pub fn key(&self) -> String {
        encode_id(&self.id)
    }

    pub fn to_ref(&self) -> Ref {
        Ref {
            model: self.model.clone(),
            id: self.id.clone(),
        }
    }
}

/// An entity as it arrives from a transport.
///
/// `attributes` is absent for stubs. Relationship targets may carry their
/// own attributes (sideloads), which the repository extracts into separate
/// slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub model: String,
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Linkage>,
}

impl Resource {
    /// A bare `{model, id}` resource.
    pub fn stub(model: impl Into<String>, id: impl Into<Id>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
            attributes: None,
            relationships: BTreeMap::new(),
        }
    }

    pub fn is_stub(&self) -> bool {
        self.attributes.is_none()
    }

    pub fn key(&self) -> String {
        encode_id(&self.id)
    }

    pub fn to_ref(&self) -> Ref {
        Ref {
            model: self.model.clone(),
            id: self.id.clone(),
        }
    }
}

impl From<Entity> for Resource {
    fn from(entity: Entity) -> Self {
        let relationships = entity
            .relationships
            .into_iter()
            .map(|(name, relationship)| (name, Linkage::from(relationship)))
            .collect();
        Self {
            model: entity.model,
            id: entity.id,
            attributes: Some(entity.attributes),
            relationships,
        }
    }
}

/// A relationship value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<Resource>),
    One(Box<Resource>),
    Null,
}

impl Linkage {
    /// Reduce to stubs, dropping any embedded attributes.
    pub fn to_relationship(&self) -> Relationship {
        match self {
            Linkage::Many(targets) => {
                Relationship::Many(targets.iter().map(Resource::to_ref).collect())
            }
            Linkage::One(target) => Relationship::One(target.to_ref()),
            Linkage::Null => Relationship::Null,
        }
    }
}

impl From<Relationship> for Linkage {
    fn from(relationship: Relationship) -> Self {
        let stub = |r: Ref| Resource::stub(r.model, r.id);
        match relationship {
            Relationship::Many(refs) => Linkage::Many(refs.into_iter().map(stub).collect()),
            Relationship::One(r) => Linkage::One(Box::new(stub(r))),
            Relationship::Null => Linkage::Null,
        }
    }
}

/// Response of a list read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub items: Vec<Resource>,
    #[serde(rename = "totalCount")]
    pub total_count: u64,
}
