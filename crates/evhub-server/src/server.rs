use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use evhub_core::EventFilter;
use evhub_store::EventStore;
use evhub_util_err::FmtCompact as _;
use evhub_wire::connection::decode_message;
use evhub_wire::{
    Connection, CountEventsRequest, DeleteClientRequest, ErrorReply, GetLatestVersionRequest,
    IsClientExistsRequest, ListAllEventsRequest, ListEventsRequest, ListMembersRequest,
    ListenAllEventsRequest, ListenEventsRequest, ListenStarted, RegisterClientRequest, RpcError,
    RpcId, RpcResult, SendEventRequest,
};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::LOG_TARGET;
use crate::ha::{HaConfig, HaManager};
use crate::listener::run_listener;
use crate::service::NotificationService;

#[derive(Debug, Snafu)]
pub enum ServerError {
    Bind {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Handle for stopping a running server from the outside.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Reject new appends, tear down listeners, and let the accept loop
    /// quit.
    pub fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

/// The wire surface: accepts connections and dispatches request frames to
/// the [`NotificationService`], turning listen calls into streaming
/// workers.
pub struct NotificationServer {
    service: Arc<NotificationService>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
}

#[bon::bon]
impl NotificationServer {
    #[builder(finish_fn = bind)]
    pub async fn builder(
        store: Arc<dyn EventStore>,
        #[builder(into)] bind_addr: String,
        ha: Option<HaConfig>,
    ) -> ServerResult<Self> {
        let listener = TcpListener::bind(&bind_addr).await.context(BindSnafu)?;
        let local_addr = listener.local_addr().context(BindSnafu)?;

        let (shutdown_tx, _) = watch::channel(false);
        let shutting_down = Arc::new(AtomicBool::new(false));

        let ha = ha.map(|config| {
            let server_uri = config
                .server_uri
                .clone()
                .unwrap_or_else(|| local_addr.to_string());
            HaManager::new(store.clone(), server_uri, &config)
        });
        if let Some(ha) = &ha {
            tokio::spawn(ha.clone().run(shutdown_tx.subscribe()));
        }

        let service = Arc::new(NotificationService::new(
            store,
            ha,
            shutting_down.clone(),
        ));

        Ok(Self {
            service,
            listener,
            local_addr,
            shutdown_tx,
            shutting_down,
        })
    }
}

impl NotificationServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            shutdown_tx: self.shutdown_tx.clone(),
            shutting_down: self.shutting_down.clone(),
        }
    }

    pub fn service(&self) -> &Arc<NotificationService> {
        &self.service
    }

    /// Accept loop; runs until [`ServerHandle::stop`].
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub async fn run(self) {
        info!(target: LOG_TARGET, addr = %self.local_addr, "Serving");
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, _peer)) => {
                        tokio::spawn(handle_connection(
                            self.service.clone(),
                            stream,
                            self.shutdown_tx.subscribe(),
                        ));
                    }
                    Err(err) => {
                        warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Failed to accept connection");
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(target: LOG_TARGET, "Accept loop quitting");
    }
}

async fn handle_connection(
    service: Arc<NotificationService>,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) {
    let peer_addr = stream.peer_addr().ok();
    if let Err(err) = handle_connection_try(service, stream, shutdown).await {
        match err {
            // normal disconnects, ignore
            RpcError::Read { .. } | RpcError::Write { .. } => {}
            _ => {
                debug!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    ?peer_addr,
                    "Error handling connection"
                );
            }
        }
    }
}

async fn handle_connection_try(
    service: Arc<NotificationService>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> RpcResult<()> {
    let mut conn = Connection::from(stream);

    loop {
        let request = tokio::select! {
            request = conn.read_request_raw() => request?,
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        let Some((id, body)) = request else {
            return Ok(());
        };

        match id {
            RpcId::RegisterClient => {
                let request: RegisterClientRequest = decode_message(&body)?;
                let reply = service
                    .register_client(request.namespace, request.sender, request.rebind)
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::DeleteClient => {
                let request: DeleteClientRequest = decode_message(&body)?;
                let reply = service
                    .delete_client(request.client_id)
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::IsClientExists => {
                let request: IsClientExistsRequest = decode_message(&body)?;
                let reply = service
                    .is_client_exists(request.client_id)
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::SendEvent => {
                let request: SendEventRequest = decode_message(&body)?;
                let reply = service
                    .send_event(request.draft, request.client_id, request.sequence_number)
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::ListEvents => {
                let request: ListEventsRequest = decode_message(&body)?;
                let reply = service
                    .list_events(
                        &request.filter,
                        request.after_version,
                        request.limit.map(|limit| limit as usize),
                    )
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::ListAllEvents => {
                let request: ListAllEventsRequest = decode_message(&body)?;
                let reply = match request {
                    ListAllEventsRequest::ByVersion { start, end } => {
                        service.list_all_events_by_version(start, end).await
                    }
                    ListAllEventsRequest::ByTime { start, end } => {
                        service.list_all_events_by_time(start, end).await
                    }
                }
                .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::CountEvents => {
                let request: CountEventsRequest = decode_message(&body)?;
                let reply = service
                    .count_events(&request.filter)
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::GetLatestVersion => {
                let request: GetLatestVersionRequest = decode_message(&body)?;
                let reply = service
                    .get_latest_version(&request.key, &request.namespace)
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::ListMembers => {
                let request: ListMembersRequest = decode_message(&body)?;
                let _ = request;
                let reply = service
                    .list_members()
                    .await
                    .map_err(|err| err.to_reply());
                conn.write_reply(&reply).await?;
            }
            RpcId::ListenEvents => {
                let request: ListenEventsRequest = decode_message(&body)?;
                conn.write_reply(&Ok::<_, ErrorReply>(ListenStarted)).await?;
                run_listener(
                    service.store().clone(),
                    request.filter,
                    request.cursor,
                    request.max_frame_len,
                    conn.into_inner(),
                    shutdown,
                )
                .await;
                return Ok(());
            }
            RpcId::ListenAllEvents => {
                let request: ListenAllEventsRequest = decode_message(&body)?;
                conn.write_reply(&Ok::<_, ErrorReply>(ListenStarted)).await?;
                run_listener(
                    service.store().clone(),
                    EventFilter::default(),
                    request.cursor,
                    request.max_frame_len,
                    conn.into_inner(),
                    shutdown,
                )
                .await;
                return Ok(());
            }
        }
    }
}
