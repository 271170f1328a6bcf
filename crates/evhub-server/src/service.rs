use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use evhub_core::filter::NamespaceFilter;
use evhub_core::{
    ClientId, Event, EventCounts, EventDraft, EventFilter, Member, Timestamp, Version,
};
use evhub_store::{EventStore, StoreError};
use evhub_wire::ErrorReply;
use snafu::Snafu;
use tracing::info;

use crate::LOG_TARGET;
use crate::ha::HaManager;

#[derive(Debug, Snafu)]
pub enum ServiceError {
    #[snafu(display("Invalid request: {message}"))]
    Validation { message: String },
    #[snafu(display("Not the leader"))]
    NotLeader { leader_uri: Option<String> },
    #[snafu(display("Shutting down"))]
    ShuttingDown,
    #[snafu(transparent)]
    Store { source: StoreError },
}

impl ServiceError {
    /// The wire rendition of this error. Client mistakes that the store
    /// reports (unknown client id) surface as validation errors, like any
    /// other bad argument.
    pub fn to_reply(&self) -> ErrorReply {
        match self {
            Self::Validation { message } => ErrorReply::Validation {
                message: message.clone(),
            },
            Self::NotLeader { leader_uri } => ErrorReply::NotLeader {
                leader_uri: leader_uri.clone(),
            },
            Self::ShuttingDown => ErrorReply::ShuttingDown,
            Self::Store {
                source: source @ StoreError::UnknownClient { .. },
            } => ErrorReply::Validation {
                message: source.to_string(),
            },
            Self::Store { source } => ErrorReply::Storage {
                message: source.to_string(),
            },
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// The in-process façade every RPC lands on: validates, enforces
/// leadership, applies producer idempotence, and delegates to the store.
pub struct NotificationService {
    store: Arc<dyn EventStore>,
    ha: Option<Arc<HaManager>>,
    shutting_down: Arc<AtomicBool>,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn EventStore>,
        ha: Option<Arc<HaManager>>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            ha,
            shutting_down,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn ha(&self) -> Option<&Arc<HaManager>> {
        self.ha.as_ref()
    }

    /// Mutating calls are refused while shutting down and redirected when a
    /// different peer is leader.
    fn check_mutable(&self) -> ServiceResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::ShuttingDown);
        }
        if let Some(ha) = &self.ha {
            if !ha.is_leader() {
                return Err(ServiceError::NotLeader {
                    leader_uri: ha.leader_uri(),
                });
            }
        }
        Ok(())
    }

    pub async fn register_client(
        &self,
        namespace: Option<String>,
        sender: Option<String>,
        rebind: Option<ClientId>,
    ) -> ServiceResult<ClientId> {
        self.check_mutable()?;
        if let Some(client) = rebind {
            if !self.store.is_client_exists(client).await? {
                return Err(ServiceError::Validation {
                    message: format!("Cannot rebind to unknown client {client}"),
                });
            }
            return Ok(client);
        }
        let client = self.store.register_client(namespace, sender).await?;
        info!(target: LOG_TARGET, %client, "Client registered");
        Ok(client)
    }

    pub async fn delete_client(&self, client: ClientId) -> ServiceResult<()> {
        self.check_mutable()?;
        self.store.delete_client(client).await?;
        Ok(())
    }

    pub async fn is_client_exists(&self, client: ClientId) -> ServiceResult<bool> {
        Ok(self.store.is_client_exists(client).await?)
    }

    pub async fn send_event(
        &self,
        draft: EventDraft,
        client_id: Option<ClientId>,
        sequence_number: Option<u64>,
    ) -> ServiceResult<Event> {
        self.check_mutable()?;
        draft
            .validate()
            .map_err(|err| ServiceError::Validation {
                message: err.to_string(),
            })?;

        match (client_id, sequence_number) {
            (Some(client), Some(sequence_number)) => Ok(self
                .store
                .append_idempotent(client, sequence_number, draft)
                .await?
                .into_event()),
            (None, None) => Ok(self.store.append(draft).await?),
            _ => Err(ServiceError::Validation {
                message: "client_id and sequence_number must be supplied together".to_owned(),
            }),
        }
    }

    pub async fn list_events(
        &self,
        filter: &EventFilter,
        after_version: Version,
        limit: Option<usize>,
    ) -> ServiceResult<Vec<Event>> {
        Ok(self.store.list(filter, after_version, limit).await?)
    }

    pub async fn list_all_events_by_version(
        &self,
        start: Version,
        end: Option<Version>,
    ) -> ServiceResult<Vec<Event>> {
        Ok(self.store.list_range(start, end).await?)
    }

    pub async fn list_all_events_by_time(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> ServiceResult<Vec<Event>> {
        Ok(self.store.list_by_time(start, end).await?)
    }

    pub async fn count_events(&self, filter: &EventFilter) -> ServiceResult<EventCounts> {
        Ok(self.store.count(filter).await?)
    }

    pub async fn get_latest_version(
        &self,
        key: &str,
        namespace: &NamespaceFilter,
    ) -> ServiceResult<Version> {
        Ok(self.store.latest_version(key, namespace).await?)
    }

    /// Membership snapshot. Outside HA mode the listing is empty and
    /// clients keep talking to their configured uri.
    pub async fn list_members(&self) -> ServiceResult<Vec<Member>> {
        match &self.ha {
            Some(ha) => Ok(ha.alive_members().await?),
            None => Ok(vec![]),
        }
    }
}
