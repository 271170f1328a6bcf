//! The subscription engine: one worker per listener stream.
//!
//! A worker subscribes to the store's live feed *before* replaying history,
//! then filters the feed against its cursor. Every event visible in the
//! store when the listener registered is replayed exactly once, and the
//! cursor check drops feed entries that the replay already covered. Falling
//! behind the feed is not fatal: a lagged listener replays from the log
//! from its cursor, which preserves at-least-once, in-order delivery.

use std::sync::Arc;

use evhub_core::{Event, EventFilter, ListenCursor, Timestamp, Version};
use evhub_store::{EventStore, StoreError};
use evhub_util_err::FmtCompact as _;
use evhub_wire::RpcError;
use evhub_wire::connection::{event_frame_len, write_event_frame};
use snafu::Snafu;
use tokio::io::AsyncReadExt as _;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use crate::LOG_TARGET;

/// Historical events are pulled from the store in batches of this size.
const REPLAY_BATCH: usize = 256;

#[derive(Debug, Snafu)]
enum ListenerError {
    #[snafu(transparent)]
    Store { source: StoreError },
    #[snafu(transparent)]
    Stream { source: RpcError },
}

struct ListenerState {
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    /// Highest version this listener has accounted for (delivered or
    /// deliberately withheld).
    cursor: Version,
    /// Inclusive `create_time` floor for time-cursor listeners.
    min_time: Option<Timestamp>,
    /// The client's declared inbound frame limit.
    max_frame_len: Option<u32>,
}

impl ListenerState {
    fn wants(&self, event: &Event) -> bool {
        self.cursor < event.version
            && self
                .min_time
                .is_none_or(|min_time| min_time <= event.create_time)
            && self.filter.matches(event)
    }

    /// Account for `event` and write it out, unless its frame would
    /// overflow the client's receive window, in which case the event is
    /// withheld and the stream stays healthy.
    async fn deliver(
        &mut self,
        write: &mut OwnedWriteHalf,
        event: &Event,
    ) -> Result<(), ListenerError> {
        self.cursor = event.version;

        let frame_len = event_frame_len(event);
        if self
            .max_frame_len
            .is_some_and(|max_frame_len| max_frame_len < frame_len)
        {
            warn!(
                target: LOG_TARGET,
                version = %event.version,
                frame_len,
                max_frame_len = self.max_frame_len.unwrap_or(0),
                "Withholding event larger than the listener's receive window"
            );
            return Ok(());
        }

        write_event_frame(write, event).await?;
        trace!(target: LOG_TARGET, version = %event.version, "Delivered event");
        Ok(())
    }

    /// Catch up from the log, starting just above the cursor.
    async fn replay(&mut self, write: &mut OwnedWriteHalf) -> Result<(), ListenerError> {
        loop {
            let batch = self
                .store
                .list(&self.filter, self.cursor, Some(REPLAY_BATCH))
                .await?;
            let caught_up = batch.len() < REPLAY_BATCH;
            for event in &batch {
                if self
                    .min_time
                    .is_none_or(|min_time| min_time <= event.create_time)
                {
                    self.deliver(write, event).await?;
                } else {
                    // Too old for a time cursor; never eligible again.
                    self.cursor = event.version;
                }
            }
            if caught_up {
                return Ok(());
            }
        }
    }
}

/// Drives one listener stream to completion. Returns when the client goes
/// away, the stream breaks, or the server shuts down.
pub(crate) async fn run_listener(
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    cursor: ListenCursor,
    max_frame_len: Option<u32>,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = run_listener_try(store, filter, cursor, max_frame_len, stream, shutdown).await
    {
        debug!(target: LOG_TARGET, err = %err.fmt_compact(), "Listener stream ended with error");
    }
}

async fn run_listener_try(
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    cursor: ListenCursor,
    max_frame_len: Option<u32>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ListenerError> {
    let (cursor, min_time) = match cursor {
        ListenCursor::Version(version) => (version, None),
        ListenCursor::Time(start_time) => (Version::ZERO, Some(start_time)),
    };
    let mut state = ListenerState {
        store,
        filter,
        cursor,
        min_time,
        max_frame_len,
    };

    let (mut read_half, mut write_half) = stream.into_split();

    // Subscribing before the replay is what closes the gap between "was in
    // the store at registration" and "arrived on the live feed".
    let mut feed = state.store.subscribe_events();

    state.replay(&mut write_half).await?;

    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            res = feed.recv() => match res {
                Ok(event) => {
                    if state.wants(&event) {
                        state.deliver(&mut write_half, &event).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: LOG_TARGET, skipped, "Listener lagged behind the feed, replaying from the log");
                    state.replay(&mut write_half).await?;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            res = read_half.read(&mut scratch) => match res {
                Ok(0) | Err(_) => {
                    trace!(target: LOG_TARGET, "Listener connection closed by client");
                    break;
                }
                // Listen streams are one-way; stray client bytes are ignored.
                Ok(_) => continue,
            },
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    Ok(())
}
