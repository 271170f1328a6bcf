//! Server-side event filtering.
//!
//! Filters arrive fully resolved: the producer-facing client API maps its
//! `None`-means-my-default-namespace convention and `"*"` wildcards onto
//! these enums before anything goes on the wire, so `Matches(None)` and
//! `Any` never get conflated along the way.

use std::collections::BTreeSet;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::Event;

/// Key predicate. Keys are required and non-empty, so "any non-null key"
/// (`"*"`) collapses into [`KeyFilter::Any`].
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub enum KeyFilter {
    #[default]
    Any,
    Keys(BTreeSet<String>),
}

impl KeyFilter {
    pub fn single(key: impl Into<String>) -> Self {
        let key = key.into();
        if key == "*" {
            return Self::Any;
        }
        Self::Keys(BTreeSet::from([key]))
    }

    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Keys(keys) => keys.contains(key),
        }
    }
}

/// Namespace predicate.
///
/// `Matches(None)` matches only events recorded without a namespace; it is
/// deliberately distinct from `Any` (`"*"` on the caller side).
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub enum NamespaceFilter {
    #[default]
    Any,
    Matches(Option<String>),
}

impl NamespaceFilter {
    /// Resolves a caller-supplied namespace argument against the caller's
    /// default namespace.
    pub fn resolve(arg: Option<&str>, default: Option<&str>) -> Self {
        match arg {
            Some("*") => Self::Any,
            Some(ns) => Self::Matches(Some(ns.to_owned())),
            None => Self::Matches(default.map(ToOwned::to_owned)),
        }
    }

    pub fn matches(&self, namespace: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Matches(expected) => expected.as_deref() == namespace,
        }
    }
}

/// Event type predicate. Absent and `"*"` both mean "any".
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub enum TypeFilter {
    #[default]
    Any,
    Exact(String),
}

impl TypeFilter {
    pub fn resolve(arg: Option<&str>) -> Self {
        match arg {
            None | Some("*") => Self::Any,
            Some(ty) => Self::Exact(ty.to_owned()),
        }
    }

    pub fn matches(&self, event_type: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => event_type == Some(expected.as_str()),
        }
    }
}

/// Sender predicate. Absent means "any"; `"*"` means "any, but present".
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub enum SenderFilter {
    #[default]
    Any,
    Present,
    Exact(String),
}

impl SenderFilter {
    pub fn resolve(arg: Option<&str>) -> Self {
        match arg {
            None => Self::Any,
            Some("*") => Self::Present,
            Some(sender) => Self::Exact(sender.to_owned()),
        }
    }

    pub fn matches(&self, sender: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Present => sender.is_some(),
            Self::Exact(expected) => sender == Some(expected.as_str()),
        }
    }
}

/// Conjunction of the per-field predicates. The default filter matches every
/// event (used by the listen-all surface).
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct EventFilter {
    pub keys: KeyFilter,
    pub namespace: NamespaceFilter,
    pub event_type: TypeFilter,
    pub sender: SenderFilter,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.keys.matches(&event.key)
            && self.namespace.matches(event.namespace.as_deref())
            && self.event_type.matches(event.event_type.as_deref())
            && self.sender.matches(event.sender.as_deref())
    }
}
