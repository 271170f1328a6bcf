use std::collections::BTreeMap;
use std::sync::Mutex;

use evhub_core::filter::NamespaceFilter;
use evhub_core::{
    ClientId, Event, EventCounts, EventDraft, EventFilter, Member, SenderCount, Timestamp, Version,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::tables::{ClientRecord, MemberRecord};
use crate::{
    EVENT_CHANNEL_CAPACITY, EventStore, LOG_TARGET, SendOutcome, SequenceSlotMissingSnafu,
    StoreResult, UnknownClientSnafu,
};

#[derive(Debug, Default)]
struct MemoryInner {
    /// Ascending by version; versions are dense so the next one is always
    /// `last + 1`.
    events: Vec<Event>,
    clients: BTreeMap<u64, ClientRecord>,
    sequences: BTreeMap<u64, u64>,
    seq_slots: BTreeMap<(u64, u64), u64>,
    members: BTreeMap<String, MemberRecord>,
}

impl MemoryInner {
    fn next_version(&self) -> Version {
        self.events
            .last()
            .map(|event| event.version)
            .unwrap_or(Version::ZERO)
            .next()
    }

    fn append(&mut self, draft: EventDraft) -> Event {
        let event = draft.into_event(self.next_version(), Timestamp::now());
        self.events.push(event.clone());
        event
    }

    fn live_client(&self, client: ClientId) -> Option<&ClientRecord> {
        self.clients
            .get(&u64::from(client))
            .filter(|record| !record.is_deleted)
    }
}

/// Volatile event store: the same contract as [`Database`], held in a single
/// mutex-guarded ordered sequence. Used by tests and single-process
/// deployments that do not need durability.
///
/// [`Database`]: crate::Database
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    event_tx: broadcast::Sender<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            event_tx,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, draft: EventDraft) -> StoreResult<Event> {
        let event = self.inner.lock().expect("Locking failed").append(draft);
        let _ = self.event_tx.send(event.clone());
        Ok(event)
    }

    async fn append_idempotent(
        &self,
        client: ClientId,
        sequence_number: u64,
        draft: EventDraft,
    ) -> StoreResult<SendOutcome> {
        let outcome = {
            let mut inner = self.inner.lock().expect("Locking failed");
            if inner.live_client(client).is_none() {
                return UnknownClientSnafu { client }.fail();
            }

            let last = inner
                .sequences
                .get(&u64::from(client))
                .copied()
                .unwrap_or(0);
            if sequence_number <= last {
                let event = inner
                    .seq_slots
                    .get(&(u64::from(client), sequence_number))
                    .and_then(|version| {
                        inner
                            .events
                            .iter()
                            .find(|event| u64::from(event.version) == *version)
                            .cloned()
                    });
                let event = event.ok_or_else(|| {
                    SequenceSlotMissingSnafu {
                        client,
                        sequence_number,
                    }
                    .build()
                })?;
                debug!(
                    target: LOG_TARGET,
                    %client,
                    sequence_number,
                    version = %event.version,
                    "Duplicate send answered from sequence slot"
                );
                return Ok(SendOutcome::Duplicate(event));
            }

            let event = inner.append(draft);
            inner.sequences.insert(u64::from(client), sequence_number);
            inner
                .seq_slots
                .insert((u64::from(client), sequence_number), event.version.into());
            SendOutcome::Appended(event)
        };

        if let SendOutcome::Appended(event) = &outcome {
            let _ = self.event_tx.send(event.clone());
        }
        Ok(outcome)
    }

    async fn list(
        &self,
        filter: &EventFilter,
        after_version: Version,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Event>> {
        let inner = self.inner.lock().expect("Locking failed");
        let mut out: Vec<Event> = inner
            .events
            .iter()
            .filter(|event| after_version < event.version && filter.matches(event))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn list_range(
        &self,
        start_version: Version,
        end_version: Option<Version>,
    ) -> StoreResult<Vec<Event>> {
        let inner = self.inner.lock().expect("Locking failed");
        Ok(inner
            .events
            .iter()
            .filter(|event| {
                start_version <= event.version
                    && end_version.is_none_or(|end| event.version <= end)
            })
            .cloned()
            .collect())
    }

    async fn list_by_time(
        &self,
        start_time: Timestamp,
        end_time: Option<Timestamp>,
    ) -> StoreResult<Vec<Event>> {
        let inner = self.inner.lock().expect("Locking failed");
        Ok(inner
            .events
            .iter()
            .filter(|event| {
                start_time <= event.create_time
                    && end_time.is_none_or(|end| event.create_time <= end)
            })
            .cloned()
            .collect())
    }

    async fn latest_version(
        &self,
        key: &str,
        namespace: &NamespaceFilter,
    ) -> StoreResult<Version> {
        let inner = self.inner.lock().expect("Locking failed");
        Ok(inner
            .events
            .iter()
            .rev()
            .find(|event| event.key == key && namespace.matches(event.namespace.as_deref()))
            .map(|event| event.version)
            .unwrap_or(Version::ZERO))
    }

    async fn count(&self, filter: &EventFilter) -> StoreResult<EventCounts> {
        let inner = self.inner.lock().expect("Locking failed");
        let mut by_sender: BTreeMap<Option<String>, u64> = BTreeMap::new();
        let mut total = 0;
        for event in inner.events.iter().filter(|event| filter.matches(event)) {
            total += 1;
            *by_sender.entry(event.sender.clone()).or_default() += 1;
        }
        Ok(EventCounts {
            total,
            by_sender: by_sender
                .into_iter()
                .map(|(sender, count)| SenderCount { sender, count })
                .collect(),
        })
    }

    async fn clean_up(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("Locking failed");
        inner.events.clear();
        inner.clients.clear();
        inner.sequences.clear();
        inner.seq_slots.clear();
        Ok(())
    }

    async fn register_client(
        &self,
        namespace: Option<String>,
        sender: Option<String>,
    ) -> StoreResult<ClientId> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let client = inner
            .clients
            .last_key_value()
            .map(|(id, _)| id + 1)
            .unwrap_or(1);
        inner.clients.insert(
            client,
            ClientRecord {
                namespace,
                sender,
                create_time: Timestamp::now(),
                is_deleted: false,
            },
        );
        debug!(target: LOG_TARGET, client, "Registered client");
        Ok(ClientId::from(client))
    }

    async fn is_client_exists(&self, client: ClientId) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .expect("Locking failed")
            .live_client(client)
            .is_some())
    }

    async fn delete_client(&self, client: ClientId) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("Locking failed");
        if let Some(record) = inner.clients.get_mut(&u64::from(client)) {
            record.is_deleted = true;
        }
        Ok(())
    }

    async fn last_sequence(&self, client: ClientId) -> StoreResult<u64> {
        Ok(self
            .inner
            .lock()
            .expect("Locking failed")
            .sequences
            .get(&u64::from(client))
            .copied()
            .unwrap_or(0))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    async fn heartbeat_member(&self, uuid: &str, server_uri: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let is_leader = inner
            .members
            .get(uuid)
            .map(|record| record.is_leader)
            .unwrap_or(false);
        inner.members.insert(
            uuid.to_owned(),
            MemberRecord {
                server_uri: server_uri.to_owned(),
                last_heartbeat: Timestamp::now(),
                is_leader,
            },
        );
        Ok(())
    }

    async fn try_acquire_leadership(
        &self,
        uuid: &str,
        server_uri: &str,
        ttl_ms: u64,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let now = Timestamp::now();

        let other_leader_alive = inner.members.iter().any(|(member_uuid, record)| {
            member_uuid != uuid
                && record.is_leader
                && now.saturating_sub(record.last_heartbeat) < ttl_ms
        });
        if other_leader_alive {
            return Ok(false);
        }

        for (member_uuid, record) in inner.members.iter_mut() {
            if member_uuid != uuid {
                record.is_leader = false;
            }
        }
        inner.members.insert(
            uuid.to_owned(),
            MemberRecord {
                server_uri: server_uri.to_owned(),
                last_heartbeat: now,
                is_leader: true,
            },
        );
        Ok(true)
    }

    async fn resign_leadership(&self, uuid: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("Locking failed");
        if let Some(record) = inner.members.get_mut(uuid) {
            record.is_leader = false;
        }
        Ok(())
    }

    async fn list_members(&self, ttl_ms: u64) -> StoreResult<Vec<Member>> {
        let inner = self.inner.lock().expect("Locking failed");
        let now = Timestamp::now();
        Ok(inner
            .members
            .iter()
            .map(|(uuid, record)| Member {
                uuid: uuid.clone(),
                server_uri: record.server_uri.clone(),
                last_heartbeat: record.last_heartbeat,
                is_alive: now.saturating_sub(record.last_heartbeat) < ttl_ms,
                is_leader: record.is_leader,
            })
            .collect())
    }
}
