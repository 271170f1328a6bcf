pub mod bincode;
pub mod event;
pub mod filter;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ::bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub use self::event::{Event, EventDraft};
pub use self::filter::{EventFilter, KeyFilter, NamespaceFilter, SenderFilter, TypeFilter};

/// Position of an event in the totally ordered log.
///
/// Assigned by the store at persist time; dense and gap-free starting at 1
/// within a single store instance.
#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct Version(u64);

impl Version {
    /// The cursor "before everything": no event carries this version.
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(value: Version) -> Self {
        value.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Encode,
    Decode,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        Self(
            u64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("Dates before the epoch unsupported")
                    .as_millis(),
            )
            .expect("Dates around year 500M unsupported"),
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a registered producer/consumer.
///
/// Allocated monotonically by the client registry; slots are never reused,
/// a closed client keeps its (soft-deleted) record.
#[derive(
    Encode, Decode, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct ClientId(u64);

impl From<u64> for ClientId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ClientId> for u64 {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a listener starts receiving from.
#[derive(Encode, Decode, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
pub enum ListenCursor {
    /// Exclusive lower bound on `version`.
    Version(Version),
    /// Inclusive lower bound on `create_time`.
    Time(Timestamp),
}

impl ListenCursor {
    /// Cursor that replays the whole log.
    pub const BEGINNING: Self = Self::Version(Version::ZERO);
}

/// One peer in an HA deployment, as reported by the membership listing.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Member {
    pub uuid: String,
    pub server_uri: String,
    pub last_heartbeat: Timestamp,
    pub is_alive: bool,
    pub is_leader: bool,
}

/// Per-sender slice of a count result.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct SenderCount {
    pub sender: Option<String>,
    pub count: u64,
}

/// Result of a count query: total matches plus the per-sender breakdown,
/// senders in ascending order.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct EventCounts {
    pub total: u64,
    pub by_sender: Vec<SenderCount>,
}
