use std::collections::BTreeMap;
use std::path::PathBuf;
use std::{ops, result};

use backon::{ExponentialBuilder, Retryable as _};
use evhub_core::filter::NamespaceFilter;
use evhub_core::{
    ClientId, Event, EventCounts, EventDraft, EventFilter, Member, SenderCount, Timestamp, Version,
};
use redb_bincode::{ReadTransaction, ReadableTable, WriteTransaction};
use snafu::ResultExt as _;
use tokio::sync::broadcast;
use tracing::debug;

use crate::tables::{
    ClientRecord, EventRecord, MemberRecord, SequenceRecord, client_seq_slots, client_sequences,
    clients, events, events_by_key, events_by_time, members,
};
use crate::{
    CommitSnafu, DatabaseSnafu, EVENT_CHANNEL_CAPACITY, EventStore, JoinSnafu, LOG_TARGET,
    SendOutcome, SequenceSlotMissingSnafu, StoreError, StoreResult, TransactionSnafu,
    UnknownClientSnafu,
};

/// How many times a write is re-attempted on a transaction-level conflict
/// before the error surfaces.
const WRITE_RETRIES: usize = 3;

/// A write transaction that can schedule work to run after a successful
/// commit. Listener notification hooks go through this so subscribers never
/// observe an event that a failed commit rolled back.
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

/// Durable event store backed by a single redb database file.
///
/// redb serializes write transactions, which is what makes version
/// allocation race-free: every append reads the current tail and inserts
/// `tail + 1` inside one transaction.
#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,
    event_tx: broadcast::Sender<Event>,
}

impl Database {
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    pub async fn new_in_memory() -> StoreResult<Database> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> StoreResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, Self::init_tables_tx).await?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self { inner, event_tx })
    }

    fn init_tables_tx(tx: &WriteTransactionCtx) -> StoreResult<()> {
        tx.open_table(&events::TABLE)?;
        tx.open_table(&events_by_key::TABLE)?;
        tx.open_table(&events_by_time::TABLE)?;
        tx.open_table(&clients::TABLE)?;
        tx.open_table(&client_sequences::TABLE)?;
        tx.open_table(&client_seq_slots::TABLE)?;
        tx.open_table(&members::TABLE)?;
        Ok(())
    }

    async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = self.inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    fn retry_policy() -> ExponentialBuilder {
        ExponentialBuilder::default().with_max_times(WRITE_RETRIES)
    }
}

impl Database {
    fn last_version_tx(events_tbl: &impl events::ReadableTable) -> StoreResult<Version> {
        Ok(events_tbl
            .range(..)?
            .next_back()
            .transpose()?
            .map(|(k, _)| Version::from(k.value()))
            .unwrap_or(Version::ZERO))
    }

    fn insert_event_tx(
        event: &Event,
        events_tbl: &mut events::Table,
        by_key_tbl: &mut events_by_key::Table,
        by_time_tbl: &mut events_by_time::Table,
    ) -> StoreResult<()> {
        let version = u64::from(event.version);
        events_tbl.insert(
            &version,
            &EventRecord {
                event: event.clone(),
            },
        )?;
        by_key_tbl.insert(&(event.key.clone(), version), &())?;
        by_time_tbl.insert(&(event.create_time, version), &())?;
        Ok(())
    }

    fn get_event_tx(
        version: u64,
        events_tbl: &impl events::ReadableTable,
    ) -> StoreResult<Option<Event>> {
        Ok(events_tbl.get(&version)?.map(|g| g.value().event))
    }

    fn next_client_id_tx(clients_tbl: &impl clients::ReadableTable) -> StoreResult<ClientId> {
        Ok(ClientId::from(
            clients_tbl
                .range(..)?
                .next_back()
                .transpose()?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1),
        ))
    }

    fn live_client_tx(
        client: ClientId,
        clients_tbl: &impl clients::ReadableTable,
    ) -> StoreResult<Option<ClientRecord>> {
        Ok(clients_tbl
            .get(&u64::from(client))?
            .map(|g| g.value())
            .filter(|record| !record.is_deleted))
    }

    /// Allocate the next version, persist, and schedule the live-tail
    /// notification for after the commit.
    fn append_tx(&self, draft: EventDraft, tx: &WriteTransactionCtx) -> StoreResult<Event> {
        let mut events_tbl = tx.open_table(&events::TABLE)?;
        let mut by_key_tbl = tx.open_table(&events_by_key::TABLE)?;
        let mut by_time_tbl = tx.open_table(&events_by_time::TABLE)?;

        let version = Self::last_version_tx(&events_tbl)?.next();
        let event = draft.into_event(version, Timestamp::now());

        Self::insert_event_tx(&event, &mut events_tbl, &mut by_key_tbl, &mut by_time_tbl)?;

        tx.on_commit({
            let event_tx = self.event_tx.clone();
            let event = event.clone();
            move || {
                let _ = event_tx.send(event);
            }
        });

        debug!(
            target: LOG_TARGET,
            version = %event.version,
            key = %event.key,
            "Appended event"
        );
        Ok(event)
    }

    async fn append_once(&self, draft: EventDraft) -> StoreResult<Event> {
        self.write_with(|tx| self.append_tx(draft, tx)).await
    }

    async fn append_idempotent_once(
        &self,
        client: ClientId,
        sequence_number: u64,
        draft: EventDraft,
    ) -> StoreResult<SendOutcome> {
        self.write_with(|tx| {
            {
                let clients_tbl = tx.open_table(&clients::TABLE)?;
                if Self::live_client_tx(client, &clients_tbl)?.is_none() {
                    return UnknownClientSnafu { client }.fail();
                }
            }

            let mut seq_tbl = tx.open_table(&client_sequences::TABLE)?;
            let mut slots_tbl = tx.open_table(&client_seq_slots::TABLE)?;

            let last = seq_tbl
                .get(&u64::from(client))?
                .map(|g| g.value().last_sequence_number)
                .unwrap_or(0);

            if sequence_number <= last {
                let slot = slots_tbl
                    .get(&(u64::from(client), sequence_number))?
                    .map(|g| g.value());
                let event = match slot {
                    Some(version) => {
                        let events_tbl = tx.open_table(&events::TABLE)?;
                        Self::get_event_tx(version, &events_tbl)?
                    }
                    None => None,
                };
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

            let event = self.append_tx(draft, tx)?;
            seq_tbl.insert(
                &u64::from(client),
                &SequenceRecord {
                    last_sequence_number: sequence_number,
                },
            )?;
            slots_tbl.insert(
                &(u64::from(client), sequence_number),
                &u64::from(event.version),
            )?;
            Ok(SendOutcome::Appended(event))
        })
        .await
    }

    fn clear_table<K, V>(table: &mut redb_bincode::Table<'_, K, V>) -> StoreResult<()>
    where
        K: bincode::Decode<()> + bincode::Encode,
        V: bincode::Decode<()> + bincode::Encode,
    {
        let keys: Vec<K> = table
            .range(..)?
            .map(|entry| entry.map(|(k, _)| k.value()))
            .collect::<result::Result<_, _>>()?;
        for key in keys {
            table.remove(&key)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for Database {
    async fn append(&self, draft: EventDraft) -> StoreResult<Event> {
        (|| {
            let draft = draft.clone();
            async move { self.append_once(draft).await }
        })
        .retry(Self::retry_policy())
        .when(StoreError::is_transient)
        .await
    }

    async fn append_idempotent(
        &self,
        client: ClientId,
        sequence_number: u64,
        draft: EventDraft,
    ) -> StoreResult<SendOutcome> {
        (|| {
            let draft = draft.clone();
            async move {
                self.append_idempotent_once(client, sequence_number, draft)
                    .await
            }
        })
        .retry(Self::retry_policy())
        .when(StoreError::is_transient)
        .await
    }

    async fn list(
        &self,
        filter: &EventFilter,
        after_version: Version,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Event>> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            let mut out = Vec::new();
            for entry in events_tbl.range(u64::from(after_version).saturating_add(1)..)? {
                let (_, record) = entry?;
                let event = record.value().event;
                if filter.matches(&event) {
                    out.push(event);
                    if limit.is_some_and(|limit| limit <= out.len()) {
                        break;
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn list_range(
        &self,
        start_version: Version,
        end_version: Option<Version>,
    ) -> StoreResult<Vec<Event>> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            let end = end_version.map(u64::from).unwrap_or(u64::MAX);
            let mut out = Vec::new();
            for entry in events_tbl.range(u64::from(start_version)..=end)? {
                let (_, record) = entry?;
                out.push(record.value().event);
            }
            Ok(out)
        })
        .await
    }

    async fn list_by_time(
        &self,
        start_time: Timestamp,
        end_time: Option<Timestamp>,
    ) -> StoreResult<Vec<Event>> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            let by_time_tbl = tx.open_table(&events_by_time::TABLE)?;
            let end = end_time.unwrap_or(Timestamp::from(u64::MAX));
            let mut out = Vec::new();
            for entry in by_time_tbl.range((start_time, 0)..=(end, u64::MAX))? {
                let (key, _) = entry?;
                let (_, version) = key.value();
                if let Some(event) = Self::get_event_tx(version, &events_tbl)? {
                    out.push(event);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn latest_version(
        &self,
        key: &str,
        namespace: &NamespaceFilter,
    ) -> StoreResult<Version> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            let by_key_tbl = tx.open_table(&events_by_key::TABLE)?;
            for entry in by_key_tbl
                .range((key.to_owned(), 0)..=(key.to_owned(), u64::MAX))?
                .rev()
            {
                let (index_key, _) = entry?;
                let (_, version) = index_key.value();
                let Some(event) = Self::get_event_tx(version, &events_tbl)? else {
                    continue;
                };
                if namespace.matches(event.namespace.as_deref()) {
                    return Ok(Version::from(version));
                }
            }
            Ok(Version::ZERO)
        })
        .await
    }

    async fn count(&self, filter: &EventFilter) -> StoreResult<EventCounts> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            let mut by_sender: BTreeMap<Option<String>, u64> = BTreeMap::new();
            let mut total = 0;
            for entry in events_tbl.range(..)? {
                let (_, record) = entry?;
                let event = record.value().event;
                if filter.matches(&event) {
                    total += 1;
                    *by_sender.entry(event.sender).or_default() += 1;
                }
            }
            Ok(EventCounts {
                total,
                by_sender: by_sender
                    .into_iter()
                    .map(|(sender, count)| SenderCount { sender, count })
                    .collect(),
            })
        })
        .await
    }

    async fn clean_up(&self) -> StoreResult<()> {
        self.write_with(|tx| {
            Self::clear_table(&mut tx.open_table(&events::TABLE)?)?;
            Self::clear_table(&mut tx.open_table(&events_by_key::TABLE)?)?;
            Self::clear_table(&mut tx.open_table(&events_by_time::TABLE)?)?;
            Self::clear_table(&mut tx.open_table(&clients::TABLE)?)?;
            Self::clear_table(&mut tx.open_table(&client_sequences::TABLE)?)?;
            Self::clear_table(&mut tx.open_table(&client_seq_slots::TABLE)?)?;
            Ok(())
        })
        .await
    }

    async fn register_client(
        &self,
        namespace: Option<String>,
        sender: Option<String>,
    ) -> StoreResult<ClientId> {
        self.write_with(|tx| {
            let mut clients_tbl = tx.open_table(&clients::TABLE)?;
            let client = Self::next_client_id_tx(&clients_tbl)?;
            clients_tbl.insert(
                &u64::from(client),
                &ClientRecord {
                    namespace,
                    sender,
                    create_time: Timestamp::now(),
                    is_deleted: false,
                },
            )?;
            debug!(target: LOG_TARGET, %client, "Registered client");
            Ok(client)
        })
        .await
    }

    async fn is_client_exists(&self, client: ClientId) -> StoreResult<bool> {
        self.read_with(|tx| {
            let clients_tbl = tx.open_table(&clients::TABLE)?;
            Ok(Self::live_client_tx(client, &clients_tbl)?.is_some())
        })
        .await
    }

    async fn delete_client(&self, client: ClientId) -> StoreResult<()> {
        self.write_with(|tx| {
            let mut clients_tbl = tx.open_table(&clients::TABLE)?;
            let Some(mut record) = clients_tbl.get(&u64::from(client))?.map(|g| g.value()) else {
                return Ok(());
            };
            record.is_deleted = true;
            clients_tbl.insert(&u64::from(client), &record)?;
            Ok(())
        })
        .await
    }

    async fn last_sequence(&self, client: ClientId) -> StoreResult<u64> {
        self.read_with(|tx| {
            let seq_tbl = tx.open_table(&client_sequences::TABLE)?;
            Ok(seq_tbl
                .get(&u64::from(client))?
                .map(|g| g.value().last_sequence_number)
                .unwrap_or(0))
        })
        .await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    async fn heartbeat_member(&self, uuid: &str, server_uri: &str) -> StoreResult<()> {
        self.write_with(|tx| {
            let mut members_tbl = tx.open_table(&members::TABLE)?;
            let is_leader = members_tbl
                .get(&uuid.to_owned())?
                .map(|g| g.value().is_leader)
                .unwrap_or(false);
            members_tbl.insert(
                &uuid.to_owned(),
                &MemberRecord {
                    server_uri: server_uri.to_owned(),
                    last_heartbeat: Timestamp::now(),
                    is_leader,
                },
            )?;
            Ok(())
        })
        .await
    }

    async fn try_acquire_leadership(
        &self,
        uuid: &str,
        server_uri: &str,
        ttl_ms: u64,
    ) -> StoreResult<bool> {
        self.write_with(|tx| {
            let mut members_tbl = tx.open_table(&members::TABLE)?;
            let now = Timestamp::now();

            let rows: Vec<(String, MemberRecord)> = members_tbl
                .range::<String>(..)?
                .map(|entry| entry.map(|(k, v)| (k.value(), v.value())))
                .collect::<result::Result<_, _>>()?;

            let other_leader_alive = rows.iter().any(|(member_uuid, record)| {
                member_uuid != uuid
                    && record.is_leader
                    && now.saturating_sub(record.last_heartbeat) < ttl_ms
            });
            if other_leader_alive {
                return Ok(false);
            }

            // Stale leader flags are dropped when the successor takes over.
            for (member_uuid, mut record) in rows {
                if member_uuid != uuid && record.is_leader {
                    record.is_leader = false;
                    members_tbl.insert(&member_uuid, &record)?;
                }
            }
            members_tbl.insert(
                &uuid.to_owned(),
                &MemberRecord {
                    server_uri: server_uri.to_owned(),
                    last_heartbeat: now,
                    is_leader: true,
                },
            )?;
            Ok(true)
        })
        .await
    }

    async fn resign_leadership(&self, uuid: &str) -> StoreResult<()> {
        self.write_with(|tx| {
            let mut members_tbl = tx.open_table(&members::TABLE)?;
            let Some(mut record) = members_tbl.get(&uuid.to_owned())?.map(|g| g.value()) else {
                return Ok(());
            };
            if record.is_leader {
                record.is_leader = false;
                members_tbl.insert(&uuid.to_owned(), &record)?;
            }
            Ok(())
        })
        .await
    }

    async fn list_members(&self, ttl_ms: u64) -> StoreResult<Vec<Member>> {
        self.read_with(|tx| {
            let members_tbl = tx.open_table(&members::TABLE)?;
            let now = Timestamp::now();
            let mut out = Vec::new();
            for entry in members_tbl.range::<String>(..)? {
                let (uuid, record) = entry?;
                let record = record.value();
                out.push(Member {
                    uuid: uuid.value(),
                    server_uri: record.server_uri,
                    is_alive: now.saturating_sub(record.last_heartbeat) < ttl_ms,
                    last_heartbeat: record.last_heartbeat,
                    is_leader: record.is_leader,
                });
            }
            Ok(out)
        })
        .await
    }
}
