//! The logical RPC surface: one request/response pair per endpoint, plus the
//! typed error reply every response can carry.

use bincode::{Decode, Encode};
use evhub_core::filter::NamespaceFilter;
use evhub_core::{
    ClientId, Event, EventCounts, EventDraft, EventFilter, ListenCursor, Member, Timestamp, Version,
};
use snafu::Snafu;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcId {
    RegisterClient,
    DeleteClient,
    IsClientExists,
    SendEvent,
    ListEvents,
    ListAllEvents,
    CountEvents,
    GetLatestVersion,
    ListenEvents,
    ListenAllEvents,
    ListMembers,
}

/// A request type knows its endpoint id and its success payload.
pub trait RpcRequest: Encode {
    const RPC_ID: RpcId;
    type Okay: Encode + Decode<()>;
}

/// Typed failure surface. Everything except `NotLeader` terminates the call;
/// `NotLeader` is the redirect an HA client recovers from.
#[derive(Encode, Decode, Snafu, Debug, Clone, PartialEq, Eq)]
pub enum ErrorReply {
    #[snafu(display("Invalid request: {message}"))]
    Validation { message: String },
    #[snafu(display("Not the leader (leader: {leader_uri:?})"))]
    NotLeader { leader_uri: Option<String> },
    #[snafu(display("Storage failure: {message}"))]
    Storage { message: String },
    #[snafu(display("Server is shutting down"))]
    ShuttingDown,
}

/// Body of every response frame.
pub type WireResult<T> = std::result::Result<T, ErrorReply>;

#[derive(Encode, Decode, Debug, Clone)]
pub struct RegisterClientRequest {
    pub namespace: Option<String>,
    pub sender: Option<String>,
    /// Rebind to an existing client record instead of allocating a new one.
    pub rebind: Option<ClientId>,
}

impl RpcRequest for RegisterClientRequest {
    const RPC_ID: RpcId = RpcId::RegisterClient;
    type Okay = ClientId;
}

#[derive(Encode, Decode, Debug, Clone, Copy)]
pub struct DeleteClientRequest {
    pub client_id: ClientId,
}

impl RpcRequest for DeleteClientRequest {
    const RPC_ID: RpcId = RpcId::DeleteClient;
    type Okay = ();
}

#[derive(Encode, Decode, Debug, Clone, Copy)]
pub struct IsClientExistsRequest {
    pub client_id: ClientId,
}

impl RpcRequest for IsClientExistsRequest {
    const RPC_ID: RpcId = RpcId::IsClientExists;
    type Okay = bool;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct SendEventRequest {
    pub draft: EventDraft,
    /// Present together with `sequence_number` in idempotent mode.
    pub client_id: Option<ClientId>,
    pub sequence_number: Option<u64>,
}

impl RpcRequest for SendEventRequest {
    const RPC_ID: RpcId = RpcId::SendEvent;
    type Okay = Event;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct ListEventsRequest {
    pub filter: EventFilter,
    /// Exclusive lower version bound.
    pub after_version: Version,
    pub limit: Option<u64>,
}

impl RpcRequest for ListEventsRequest {
    const RPC_ID: RpcId = RpcId::ListEvents;
    type Okay = Vec<Event>;
}

/// Unfiltered scan, either by version range or by creation-time window.
#[derive(Encode, Decode, Debug, Clone, Copy)]
pub enum ListAllEventsRequest {
    /// Inclusive version bounds.
    ByVersion {
        start: Version,
        end: Option<Version>,
    },
    /// Inclusive `create_time` bounds.
    ByTime {
        start: Timestamp,
        end: Option<Timestamp>,
    },
}

impl RpcRequest for ListAllEventsRequest {
    const RPC_ID: RpcId = RpcId::ListAllEvents;
    type Okay = Vec<Event>;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct CountEventsRequest {
    pub filter: EventFilter,
}

impl RpcRequest for CountEventsRequest {
    const RPC_ID: RpcId = RpcId::CountEvents;
    type Okay = EventCounts;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct GetLatestVersionRequest {
    pub key: String,
    pub namespace: NamespaceFilter,
}

impl RpcRequest for GetLatestVersionRequest {
    const RPC_ID: RpcId = RpcId::GetLatestVersion;
    type Okay = Version;
}

/// Acknowledgement after which the connection switches to server-push:
/// a sequence of bare length-prefixed [`Event`] frames until either side
/// closes.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenStarted;

#[derive(Encode, Decode, Debug, Clone)]
pub struct ListenEventsRequest {
    pub filter: EventFilter,
    pub cursor: ListenCursor,
    /// The client's inbound frame limit; events whose frame would exceed it
    /// are withheld from this listener.
    pub max_frame_len: Option<u32>,
}

impl RpcRequest for ListenEventsRequest {
    const RPC_ID: RpcId = RpcId::ListenEvents;
    type Okay = ListenStarted;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct ListenAllEventsRequest {
    pub cursor: ListenCursor,
    pub max_frame_len: Option<u32>,
}

impl RpcRequest for ListenAllEventsRequest {
    const RPC_ID: RpcId = RpcId::ListenAllEvents;
    type Okay = ListenStarted;
}

#[derive(Encode, Decode, Debug, Clone, Copy)]
pub struct ListMembersRequest;

impl RpcRequest for ListMembersRequest {
    const RPC_ID: RpcId = RpcId::ListMembers;
    type Okay = Vec<Member>;
}
