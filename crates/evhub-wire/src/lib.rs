pub mod connection;
pub mod message;

use snafu::Snafu;

pub use self::connection::Connection;
pub use self::message::*;

pub const LOG_TARGET: &str = "evhub::wire";

/// Max request size
///
/// Requests carry at most one event; responses can carry whole listing
/// batches, so they get a larger cap.
pub const MAX_REQUEST_SIZE: u32 = 16 * 1024 * 1024;

pub const MAX_RESPONSE_SIZE: u32 = 32 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RpcError {
    Connect {
        source: std::io::Error,
    },
    Write {
        source: std::io::Error,
    },
    Read {
        source: std::io::Error,
    },
    MessageTooLarge {
        len: u32,
        limit: u32,
    },
    UnknownRpcId {
        id: u16,
    },
    Decoding {
        source: bincode::error::DecodeError,
    },
    /// Other side rejected the call with a typed error
    #[snafu(display("Rejected: {reply}"))]
    Rejected {
        reply: ErrorReply,
    },
}

impl RpcError {
    /// The follower-redirect reply, if this is one.
    pub fn not_leader_hint(&self) -> Option<Option<&str>> {
        match self {
            Self::Rejected {
                reply: ErrorReply::NotLeader { leader_uri },
            } => Some(leader_uri.as_deref()),
            _ => None,
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;
