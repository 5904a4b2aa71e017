//! Typed identifiers used across the engine.
//!
//! All ids are opaque String wrappers (serde-transparent). Message ids are
//! UUID v4 strings when generated locally, but any string a kernel sends is
//! accepted verbatim since ids are only ever compared for equality.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Fresh random id.
            pub fn new_uuid() -> Self {
                Self::from_string(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from_string(value)
            }
        }
    };
}

typed_id!(
    /// Unique identifier of one protocol message (`header.msg_id`).
    MessageId
);
typed_id!(
    /// Client session identifier stamped on every outgoing header.
    SessionId
);
typed_id!(
    /// Stable kernel reference. Survives restarts of the kernel process.
    KernelId
);
typed_id!(
    /// Caller-defined cell token. Opaque to the engine.
    CellId
);
