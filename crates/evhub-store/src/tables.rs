//! Table definitions for the durable event store.
//!
//! The log itself lives in [`events`], keyed by version so a plain range
//! scan yields events in delivery order. [`events_by_key`] and
//! [`events_by_time`] are secondary indexes used by the latest-version and
//! time-window queries. Client registry and producer-sequence state live in
//! their own tables; [`members`] holds the HA membership rows shared between
//! peers on the same store.

use bincode::{Decode, Encode};
use evhub_core::{Event, Timestamp};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// The append-only log, keyed by version.
    events: u64 => EventRecord
}

def_table! {
    /// Key index.
    ///
    /// Key: (event key, version)
    /// Lets `latest_version` walk a single key's events newest-first without
    /// scanning the whole log.
    events_by_key: (String, u64) => ()
}

def_table! {
    /// Time index.
    ///
    /// Key: (create_time, version)
    /// Version disambiguates events persisted within the same millisecond.
    events_by_time: (Timestamp, u64) => ()
}

def_table! {
    /// Registered clients. Rows are soft-deleted so ids are never reused.
    clients: u64 => ClientRecord
}

def_table! {
    /// Highest accepted producer sequence number per client.
    client_sequences: u64 => SequenceRecord
}

def_table! {
    /// Which version each accepted `(client, sequence)` send produced.
    ///
    /// A retried send of an already-accepted sequence number is answered
    /// from this table, so the same slot always resolves to the same event.
    client_seq_slots: (u64, u64) => u64
}

def_table! {
    /// HA membership rows, keyed by server uuid.
    members: String => MemberRecord
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct EventRecord {
    pub event: Event,
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct ClientRecord {
    pub namespace: Option<String>,
    pub sender: Option<String>,
    pub create_time: Timestamp,
    pub is_deleted: bool,
}

#[derive(Debug, Encode, Decode, Clone, Copy, Default)]
pub struct SequenceRecord {
    pub last_sequence_number: u64,
}

/// Liveness is derived at read time by comparing `last_heartbeat` against
/// the reader's TTL, never stored.
#[derive(Debug, Encode, Decode, Clone)]
pub struct MemberRecord {
    pub server_uri: String,
    pub last_heartbeat: Timestamp,
    pub is_leader: bool,
}
