//! Typed identifiers for every entity in the control plane.
//!
//! Every key is a random 128-bit value (UUID v4). The newtypes exist so a
//! rollout id cannot be passed where a device id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

entity_id!(
    /// Identifier for a tenant (owned by the external identity service).
    TenantId
);
entity_id!(
    /// Identifier for a registered device.
    DeviceId
);
entity_id!(
    /// Identifier for a device group.
    GroupId
);
entity_id!(
    /// Identifier for a registration token.
    TokenId
);
entity_id!(
    /// Identifier for a device API key.
    KeyId
);
entity_id!(
    /// Identifier for a container bundle.
    BundleId
);
entity_id!(
    /// Identifier for a rollout.
    RolloutId
);
entity_id!(
    /// Identifier for a rollout phase.
    PhaseId
);
entity_id!(
    /// Identifier for a rollout device assignment.
    AssignmentId
);
entity_id!(
    /// Identifier for an alert.
    AlertId
);
