mod db;
mod mem;
mod tables;

use async_trait::async_trait;
use evhub_core::filter::NamespaceFilter;
use evhub_core::{ClientId, Event, EventCounts, EventDraft, EventFilter, Member, Timestamp, Version};
use snafu::{Location, Snafu};
use tokio::sync::broadcast;
use tokio::task::JoinError;

pub use self::db::Database;
pub use self::mem::MemoryStore;
pub use self::tables::*;

const LOG_TARGET: &str = "evhub::store";

/// How many committed events the live-tail feed buffers per subscriber
/// before it starts reporting lag. Laggy listeners recover by replaying
/// from the log, so this only bounds memory, not delivery.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Client {client} is not registered"))]
    UnknownClient {
        client: ClientId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("No stored event for client {client} sequence {sequence_number}"))]
    SequenceSlotMissing {
        client: ClientId,
        sequence_number: u64,
        #[snafu(implicit)]
        location: Location,
    },
}

impl StoreError {
    /// Transaction-level conflicts and commit failures may clear on a
    /// retry; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transaction { .. } | Self::Commit { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What an idempotent send did.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The sequence number was new; the event was appended.
    Appended(Event),
    /// The sequence number was already accepted; this is the event stored
    /// for that slot.
    Duplicate(Event),
}

impl SendOutcome {
    pub fn into_event(self) -> Event {
        match self {
            Self::Appended(event) | Self::Duplicate(event) => event,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// The storage contract shared by the in-memory and durable backends.
///
/// `append` (and the idempotent variant) are serialized per store instance,
/// so versions come out dense and gap-free. Committed events are published
/// on the feed returned by [`subscribe_events`], strictly after they became
/// visible to reads.
///
/// [`subscribe_events`]: EventStore::subscribe_events
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Assigns the next version and `create_time`, persists, returns the
    /// completed event.
    async fn append(&self, draft: EventDraft) -> StoreResult<Event>;

    /// Producer-idempotent append: a sequence number at or below the
    /// client's high-water mark returns the event previously stored for
    /// that exact slot instead of appending.
    async fn append_idempotent(
        &self,
        client: ClientId,
        sequence_number: u64,
        draft: EventDraft,
    ) -> StoreResult<SendOutcome>;

    /// Events with `version > after_version` matching `filter`, ascending.
    async fn list(
        &self,
        filter: &EventFilter,
        after_version: Version,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Event>>;

    /// Unfiltered scan over an inclusive version range.
    async fn list_range(
        &self,
        start_version: Version,
        end_version: Option<Version>,
    ) -> StoreResult<Vec<Event>>;

    /// Unfiltered scan over an inclusive `create_time` range.
    async fn list_by_time(
        &self,
        start_time: Timestamp,
        end_time: Option<Timestamp>,
    ) -> StoreResult<Vec<Event>>;

    /// Highest version among events with the given key whose namespace
    /// passes `namespace`, or [`Version::ZERO`].
    async fn latest_version(
        &self,
        key: &str,
        namespace: &NamespaceFilter,
    ) -> StoreResult<Version>;

    async fn count(&self, filter: &EventFilter) -> StoreResult<EventCounts>;

    /// Truncates events, clients and producer-sequence state. Membership
    /// rows survive. Operator/test use.
    async fn clean_up(&self) -> StoreResult<()>;

    async fn register_client(
        &self,
        namespace: Option<String>,
        sender: Option<String>,
    ) -> StoreResult<ClientId>;

    /// True iff a non-deleted record exists.
    async fn is_client_exists(&self, client: ClientId) -> StoreResult<bool>;

    /// Soft delete; idempotent.
    async fn delete_client(&self, client: ClientId) -> StoreResult<()>;

    /// The client's sequence high-water mark (0 if it never sent).
    async fn last_sequence(&self, client: ClientId) -> StoreResult<u64>;

    /// Live tail of committed events.
    fn subscribe_events(&self) -> broadcast::Receiver<Event>;

    /// Upserts this peer's membership row with a fresh heartbeat.
    async fn heartbeat_member(&self, uuid: &str, server_uri: &str) -> StoreResult<()>;

    /// Claims leadership unless another peer currently holds it with a
    /// heartbeat younger than `ttl_ms`. Returns whether `uuid` is leader
    /// afterwards.
    async fn try_acquire_leadership(
        &self,
        uuid: &str,
        server_uri: &str,
        ttl_ms: u64,
    ) -> StoreResult<bool>;

    /// Drops the leader flag, if held. Used on orderly shutdown.
    async fn resign_leadership(&self, uuid: &str) -> StoreResult<()>;

    /// Membership snapshot; `is_alive` is derived from `ttl_ms` at read
    /// time.
    async fn list_members(&self, ttl_ms: u64) -> StoreResult<Vec<Member>>;
}

#[cfg(test)]
mod tests;
