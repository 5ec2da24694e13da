use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConnectionId, "conn");
branded_id!(ToolCallId, "toolu");

/// Kind of renderable node an id addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Text,
    Tool,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Tool => "tool",
        }
    }
}

/// Address of a client-side node: `"{message_seq}-{text|tool}-{local_seq}"`.
///
/// Only `SessionState` mints these; everything else treats them as opaque.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(message_seq: u64, kind: NodeKind, local_seq: u32) -> Self {
        Self(format!("{message_seq}-{}-{local_seq}", kind.as_str()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the id back into its components. `None` for ids not minted by `new`.
    pub fn parts(&self) -> Option<(u64, NodeKind, u32)> {
        let mut it = self.0.splitn(3, '-');
        let message_seq = it.next()?.parse().ok()?;
        let kind = match it.next()? {
            "text" => NodeKind::Text,
            "tool" => NodeKind::Tool,
            _ => return None,
        };
        let local_seq = it.next()?.parse().ok()?;
        Some((message_seq, kind, local_seq))
    }

    pub fn kind(&self) -> Option<NodeKind> {
        self.parts().map(|(_, kind, _)| kind)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
