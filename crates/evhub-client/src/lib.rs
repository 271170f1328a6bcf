mod listen;
mod seq;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use evhub_core::filter::{KeyFilter, NamespaceFilter, SenderFilter, TypeFilter};
use evhub_core::{
    ClientId, Event, EventCounts, EventDraft, EventFilter, ListenCursor, Member, Timestamp, Version,
};
use evhub_util_err::FmtCompact as _;
use evhub_wire::{
    Connection, CountEventsRequest, DeleteClientRequest, GetLatestVersionRequest,
    IsClientExistsRequest, ListAllEventsRequest, ListEventsRequest, ListMembersRequest,
    RegisterClientRequest, RpcError, RpcRequest, RpcResult, SendEventRequest,
};
use snafu::Snafu;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use self::listen::ListenHandle;
use self::listen::ListenKind;
pub use self::seq::SequenceNumManager;

pub const LOG_TARGET: &str = "evhub::client";

/// Pause between retarget rounds while failing over.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

const DEFAULT_LIST_MEMBER_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RETRY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("Invalid client configuration: {message}"))]
    Config { message: String },
    #[snafu(transparent)]
    Rpc { source: RpcError },
    #[snafu(display("Gave up retargeting after {elapsed_ms}ms"))]
    RetryTimeout { elapsed_ms: u64, source: RpcError },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

pub(crate) struct ClientInner {
    server_uri: String,
    enable_ha: bool,
    retry_timeout: Duration,
    list_member_interval: Duration,
    max_frame_len: Option<u32>,
    default_namespace: std::sync::Mutex<Option<String>>,
    sender: std::sync::Mutex<Option<String>>,
    /// Alive peers learned from `ListMembers`.
    peers: std::sync::Mutex<Vec<String>>,
    /// The uri that last answered us (the leader, once known).
    preferred: std::sync::Mutex<Option<String>>,
}

impl ClientInner {
    async fn rpc_once<R: RpcRequest>(uri: &str, request: &R) -> RpcResult<R::Okay> {
        let mut conn = Connection::connect(uri).await?;
        conn.make_rpc(request).await
    }

    /// Uris to try this round, best guess first, no duplicates.
    fn candidate_uris(&self, hint: Option<String>) -> Vec<String> {
        let mut uris: Vec<String> = Vec::new();
        if let Some(hint) = hint {
            uris.push(hint);
        }
        if let Some(preferred) = self.preferred.lock().expect("Locking failed").clone() {
            if !uris.contains(&preferred) {
                uris.push(preferred);
            }
        }
        for peer in self.peers.lock().expect("Locking failed").iter() {
            if !uris.contains(peer) {
                uris.push(peer.clone());
            }
        }
        if !uris.contains(&self.server_uri) {
            uris.push(self.server_uri.clone());
        }
        uris
    }

    /// Runs `op` against the best-known peer, following "not leader"
    /// redirects and rotating through the member list until it succeeds or
    /// the retry window elapses. Without HA a single round is attempted.
    pub(crate) async fn with_retarget<T, F>(
        &self,
        op: impl Fn(String) -> F,
    ) -> ClientResult<T>
    where
        F: Future<Output = RpcResult<T>>,
    {
        let started = Instant::now();
        let mut hint: Option<String> = None;
        loop {
            let mut last_err: Option<RpcError> = None;
            for uri in self.candidate_uris(hint.take()) {
                match op(uri.clone()).await {
                    Ok(value) => {
                        *self.preferred.lock().expect("Locking failed") = Some(uri);
                        return Ok(value);
                    }
                    Err(err) => match err.not_leader_hint() {
                        Some(leader_uri) => {
                            trace!(target: LOG_TARGET, %uri, ?leader_uri, "Peer is not the leader");
                            hint = leader_uri.map(ToOwned::to_owned);
                            last_err = Some(err);
                        }
                        None => {
                            if matches!(err, RpcError::Rejected { .. }) {
                                return Err(err.into());
                            }
                            trace!(target: LOG_TARGET, %uri, err = %err.fmt_compact(), "Peer unreachable");
                            last_err = Some(err);
                        }
                    },
                }
            }

            let last_err = last_err.expect("At least one candidate uri");
            if !self.enable_ha {
                return Err(last_err.into());
            }
            let elapsed = started.elapsed();
            if self.retry_timeout <= elapsed {
                return Err(ClientError::RetryTimeout {
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    source: last_err,
                });
            }
            self.refresh_members().await;
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }

    pub(crate) async fn rpc<R: RpcRequest>(&self, request: &R) -> ClientResult<R::Okay> {
        self.with_retarget(|uri: String| async move { Self::rpc_once(&uri, request).await })
            .await
    }

    /// Pulls a membership snapshot from any reachable peer and refreshes
    /// the peer list and leader hint. Failures are ignored; the stale view
    /// keeps serving.
    pub(crate) async fn refresh_members(&self) {
        for uri in self.candidate_uris(None) {
            match Self::rpc_once(&uri, &ListMembersRequest).await {
                Ok(members) => {
                    if let Some(leader) = members
                        .iter()
                        .find(|member| member.is_leader && member.is_alive)
                    {
                        *self.preferred.lock().expect("Locking failed") =
                            Some(leader.server_uri.clone());
                    }
                    let alive: Vec<String> = members
                        .into_iter()
                        .filter(|member| member.is_alive)
                        .map(|member| member.server_uri)
                        .collect();
                    if !alive.is_empty() {
                        *self.peers.lock().expect("Locking failed") = alive;
                    }
                    return;
                }
                Err(err) => {
                    trace!(target: LOG_TARGET, %uri, err = %err.fmt_compact(), "Member refresh failed");
                }
            }
        }
    }

    pub(crate) fn max_frame_len(&self) -> Option<u32> {
        self.max_frame_len
    }

    pub(crate) fn enable_ha(&self) -> bool {
        self.enable_ha
    }

    fn resolve_filter(
        &self,
        keys: KeyFilter,
        event_type: Option<&str>,
        namespace: Option<&str>,
        sender: Option<&str>,
    ) -> EventFilter {
        let default_namespace = self.default_namespace.lock().expect("Locking failed");
        EventFilter {
            keys,
            namespace: NamespaceFilter::resolve(namespace, default_namespace.as_deref()),
            event_type: TypeFilter::resolve(event_type),
            sender: SenderFilter::resolve(sender),
        }
    }
}

/// Client to a notification server (or an HA group of them).
///
/// Holds the caller's default namespace and sender, the idempotent-producer
/// state, and, in HA mode, a periodically refreshed view of the membership
/// used to chase the leader across failovers.
pub struct NotificationClient {
    inner: Arc<ClientInner>,
    client_id: Option<ClientId>,
    seq: Option<SequenceNumManager>,
    member_refresh_task: Option<JoinHandle<()>>,
}

#[bon::bon]
impl NotificationClient {
    #[builder(finish_fn = connect)]
    pub async fn builder(
        #[builder(into)] server_uri: String,
        #[builder(into)] namespace: Option<String>,
        #[builder(into)] sender: Option<String>,
        #[builder(default = false)] enable_idempotence: bool,
        client_id: Option<ClientId>,
        initial_sequence_number: Option<u64>,
        max_frame_len: Option<u32>,
        #[builder(default = false)] enable_ha: bool,
        list_member_interval_ms: Option<u64>,
        retry_timeout_ms: Option<u64>,
    ) -> ClientResult<NotificationClient> {
        if namespace.as_deref() == Some("*") {
            return Err(ClientError::Config {
                message: "\"*\" is not a namespace; defaults must name a concrete one".to_owned(),
            });
        }

        let inner = Arc::new(ClientInner {
            server_uri,
            enable_ha,
            retry_timeout: Duration::from_millis(
                retry_timeout_ms.unwrap_or(DEFAULT_RETRY_TIMEOUT_MS),
            ),
            list_member_interval: Duration::from_millis(
                list_member_interval_ms.unwrap_or(DEFAULT_LIST_MEMBER_INTERVAL_MS),
            ),
            max_frame_len,
            default_namespace: std::sync::Mutex::new(namespace.clone()),
            sender: std::sync::Mutex::new(sender.clone()),
            peers: std::sync::Mutex::new(vec![]),
            preferred: std::sync::Mutex::new(None),
        });

        if enable_ha {
            inner.refresh_members().await;
        }

        let (registered_id, seq) = if enable_idempotence {
            let registered_id = inner
                .rpc(&RegisterClientRequest {
                    namespace,
                    sender,
                    rebind: client_id,
                })
                .await?;
            (
                Some(registered_id),
                Some(SequenceNumManager::new(
                    initial_sequence_number.unwrap_or(0),
                )),
            )
        } else {
            (None, None)
        };

        let member_refresh_task = enable_ha.then(|| spawn_member_refresh(&inner));

        Ok(NotificationClient {
            inner,
            client_id: registered_id,
            seq,
            member_refresh_task,
        })
    }
}

fn spawn_member_refresh(inner: &Arc<ClientInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let period = inner.list_member_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // the builder already refreshed once
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                debug!(target: LOG_TARGET, "Client gone, quitting member refresh");
                break;
            };
            inner.refresh_members().await;
        }
    })
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        if let Some(task) = &self.member_refresh_task {
            task.abort();
        }
    }
}

impl NotificationClient {
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn sequence_num_manager(&self) -> Option<&SequenceNumManager> {
        self.seq.as_ref()
    }

    pub fn set_default_namespace(&self, namespace: Option<String>) {
        *self.inner.default_namespace.lock().expect("Locking failed") = namespace;
    }

    pub fn set_sender(&self, sender: Option<String>) {
        *self.inner.sender.lock().expect("Locking failed") = sender;
    }

    /// Sends one event, stamping the client's default namespace and sender
    /// onto fields the draft leaves empty. With idempotence on, the send
    /// carries `(client_id, sequence_number)` and a retry of an accepted
    /// sequence number returns the originally stored event.
    pub async fn send_event(&self, draft: EventDraft) -> ClientResult<Event> {
        let draft = self.stamp(draft);

        match (&self.client_id, &self.seq) {
            (Some(client_id), Some(seq)) => {
                let sequence_number = seq.next_candidate();
                let event = self
                    .inner
                    .rpc(&SendEventRequest {
                        draft,
                        client_id: Some(*client_id),
                        sequence_number: Some(sequence_number),
                    })
                    .await?;
                seq.mark_accepted(sequence_number);
                Ok(event)
            }
            _ => Ok(self
                .inner
                .rpc(&SendEventRequest {
                    draft,
                    client_id: None,
                    sequence_number: None,
                })
                .await?),
        }
    }

    fn stamp(&self, mut draft: EventDraft) -> EventDraft {
        if draft.namespace.is_none() {
            draft.namespace = self
                .inner
                .default_namespace
                .lock()
                .expect("Locking failed")
                .clone();
        }
        if draft.sender.is_none() {
            draft.sender = self.inner.sender.lock().expect("Locking failed").clone();
        }
        draft
    }

    pub async fn list_events(
        &self,
        keys: KeyFilter,
        after_version: Version,
        event_type: Option<&str>,
        namespace: Option<&str>,
        sender: Option<&str>,
    ) -> ClientResult<Vec<Event>> {
        let filter = self
            .inner
            .resolve_filter(keys, event_type, namespace, sender);
        Ok(self
            .inner
            .rpc(&ListEventsRequest {
                filter,
                after_version,
                limit: None,
            })
            .await?)
    }

    pub async fn list_all_events_range(
        &self,
        start: Version,
        end: Option<Version>,
    ) -> ClientResult<Vec<Event>> {
        Ok(self
            .inner
            .rpc(&ListAllEventsRequest::ByVersion { start, end })
            .await?)
    }

    pub async fn list_all_events_from_time(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> ClientResult<Vec<Event>> {
        Ok(self
            .inner
            .rpc(&ListAllEventsRequest::ByTime { start, end })
            .await?)
    }

    pub async fn count_events(
        &self,
        keys: KeyFilter,
        event_type: Option<&str>,
        namespace: Option<&str>,
        sender: Option<&str>,
    ) -> ClientResult<EventCounts> {
        let filter = self
            .inner
            .resolve_filter(keys, event_type, namespace, sender);
        Ok(self.inner.rpc(&CountEventsRequest { filter }).await?)
    }

    pub async fn get_latest_version(
        &self,
        key: &str,
        namespace: Option<&str>,
    ) -> ClientResult<Version> {
        let namespace = {
            let default_namespace = self.inner.default_namespace.lock().expect("Locking failed");
            NamespaceFilter::resolve(namespace, default_namespace.as_deref())
        };
        Ok(self
            .inner
            .rpc(&GetLatestVersionRequest {
                key: key.to_owned(),
                namespace,
            })
            .await?)
    }

    pub async fn is_client_exists(&self, client_id: ClientId) -> ClientResult<bool> {
        Ok(self.inner.rpc(&IsClientExistsRequest { client_id }).await?)
    }

    pub async fn list_members(&self) -> ClientResult<Vec<Member>> {
        Ok(self.inner.rpc(&ListMembersRequest).await?)
    }

    /// Subscribes with a filter; historical matches replay first, then the
    /// live tail follows. In HA mode a broken stream re-registers on the
    /// current leader from the last delivered version.
    pub async fn start_listen_events(
        &self,
        keys: KeyFilter,
        cursor: ListenCursor,
        event_type: Option<&str>,
        namespace: Option<&str>,
        sender: Option<&str>,
    ) -> ClientResult<ListenHandle> {
        let filter = self
            .inner
            .resolve_filter(keys, event_type, namespace, sender);
        Ok(listen::spawn(
            self.inner.clone(),
            ListenKind::Filtered(filter),
            cursor,
        ))
    }

    /// Subscribes to every event above the cursor, no filter.
    pub async fn start_listen_all_events(
        &self,
        cursor: ListenCursor,
    ) -> ClientResult<ListenHandle> {
        Ok(listen::spawn(self.inner.clone(), ListenKind::All, cursor))
    }

    /// Soft-deletes this client's registration.
    pub async fn close(self) -> ClientResult<()> {
        if let Some(client_id) = self.client_id {
            self.inner.rpc(&DeleteClientRequest { client_id }).await?;
        }
        Ok(())
    }
}
