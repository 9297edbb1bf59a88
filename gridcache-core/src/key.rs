//! Cache keys and values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Disassembled entity/collection state as handed over by the ORM.
pub type CacheValue = serde_json::Value;

/// Key of an entry within one region.
///
/// Region membership is implied by the region the key is used with; the key
/// itself only carries what distinguishes entries inside that region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
    /// Entity row by identifier.
    Entity { entity: String, id: String },
    /// Collection owned by an entity.
    Collection { role: String, owner: String },
    /// Natural-id lookup (resolved to the primary id).
    NaturalId { entity: String, values: Vec<String> },
    /// Query result set by query signature.
    Query { signature: String },
    /// Table (query space) in the timestamps region.
    Space { table: String },
}

impl CacheKey {
    pub fn entity(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::Entity {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn collection(role: impl Into<String>, owner: impl ToString) -> Self {
        Self::Collection {
            role: role.into(),
            owner: owner.to_string(),
        }
    }

    pub fn natural_id<I, S>(entity: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::NaturalId {
            entity: entity.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn query(signature: impl Into<String>) -> Self {
        Self::Query {
            signature: signature.into(),
        }
    }

    pub fn space(table: impl Into<String>) -> Self {
        Self::Space {
            table: table.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Entity { entity, id } => write!(f, "{}#{}", entity, id),
            CacheKey::Collection { role, owner } => write!(f, "{}#{}", role, owner),
            CacheKey::NaturalId { entity, values } => {
                write!(f, "{}##NaturalId[{}]", entity, values.join(","))
            }
            CacheKey::Query { signature } => write!(f, "query:{}", signature),
            CacheKey::Space { table } => write!(f, "space:{}", table),
        }
    }
}
