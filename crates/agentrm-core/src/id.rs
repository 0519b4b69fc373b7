//! Strongly typed string identifiers.

/// Define a `String`-backed identifier newtype.
///
/// Generates `new()`, `as_str()`, `Display`, `From<String>` and `From<&str>`.
/// The wrapper serializes transparently as its inner string.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
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

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id! {
    /// Stable identifier of an agent across reconnects.
    pub struct AgentId;
}

define_id! {
    /// Identifier of a container launched on an agent.
    pub struct ContainerId;
}

define_id! {
    /// Identifier of the allocation that owns one or more containers.
    pub struct AllocationId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ContainerId::new("c-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c-1\"");

        let back: ContainerId = serde_json::from_str("\"c-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_display_inner_value() {
        assert_eq!(AgentId::from("agent-7").to_string(), "agent-7");
        assert_eq!(AllocationId::new("alloc".to_string()).as_str(), "alloc");
    }
}
