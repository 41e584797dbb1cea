// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifier types shared by all privilege components.
use std::borrow::Borrow;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Wildcard user id standing for "all users".
pub const PUBLIC: &str = "PUBLIC";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a user, or the `PUBLIC` wildcard.
    UserId
);

string_id!(
    /// Identifier of a persisted grant record.
    GrantId
);

string_id!(
    /// Identifier of a persisted entity (property, backref or edge).
    EntityId
);

string_id!(
    /// Identifier of a graph vertex.
    VertexId
);

string_id!(
    /// Identifier of an inbound relation (backref) leading to a vertex.
    RelationId
);

impl UserId {
    /// The wildcard user standing for everybody.
    pub fn public() -> Self {
        Self(PUBLIC.to_owned())
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC
    }
}

impl GrantId {
    /// Generate a fresh random identifier for a new grant record.
    pub fn random() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }
}

#[cfg(test)]
mod tests {
    use super::{GrantId, UserId};

    #[test]
    fn public_wildcard() {
        assert!(UserId::public().is_public());
        assert!(UserId::from("PUBLIC").is_public());
        assert!(!UserId::from("public").is_public());
    }

    #[test]
    fn random_grant_ids_differ() {
        let a = GrantId::random();
        let b = GrantId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn serializes_as_plain_string() {
        let user = UserId::from("alice");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"alice\"");
    }
}
