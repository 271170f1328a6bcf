use std::sync::Arc;

use evhub_core::{Event, EventFilter, ListenCursor};
use evhub_util_err::FmtCompact as _;
use evhub_wire::{Connection, ListenAllEventsRequest, ListenEventsRequest};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{ClientInner, LOG_TARGET};

pub(crate) enum ListenKind {
    Filtered(EventFilter),
    All,
}

/// One active subscription stream.
///
/// Owns the background reader task; events arrive on an internal channel.
/// `stop` (or dropping the handle) tears the stream down.
pub struct ListenHandle {
    events_rx: mpsc::UnboundedReceiver<Event>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenHandle {
    /// Next delivered event; `None` once the stream is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Everything delivered so far without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Stops the stream and returns whatever was delivered but not yet
    /// consumed.
    pub async fn stop(&mut self) -> Vec<Event> {
        let _ = self.stop_tx.send(true);
        let _ = (&mut self.task).await;
        self.drain()
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        self.task.abort();
    }
}

pub(crate) fn spawn(
    inner: Arc<ClientInner>,
    kind: ListenKind,
    cursor: ListenCursor,
) -> ListenHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_listen_stream(inner, kind, cursor, events_tx, stop_rx));
    ListenHandle {
        events_rx,
        stop_tx,
        task,
    }
}

/// Establishes the stream (through the retarget loop in HA mode) and pumps
/// events into the handle's channel. The cursor tracks the last delivered
/// version so re-registration after a broken stream or failover resumes
/// without losing events; an event can be seen twice across a failover,
/// never skipped.
async fn run_listen_stream(
    inner: Arc<ClientInner>,
    kind: ListenKind,
    mut cursor: ListenCursor,
    events_tx: mpsc::UnboundedSender<Event>,
    mut stop_rx: watch::Receiver<bool>,
) {
    'stream: loop {
        let conn = inner
            .with_retarget(|uri: String| {
                let inner = &inner;
                let kind = &kind;
                async move {
                    let mut conn = Connection::connect(&uri).await?;
                    match kind {
                        ListenKind::Filtered(filter) => {
                            conn.make_rpc(&ListenEventsRequest {
                                filter: filter.clone(),
                                cursor,
                                max_frame_len: inner.max_frame_len(),
                            })
                            .await?;
                        }
                        ListenKind::All => {
                            conn.make_rpc(&ListenAllEventsRequest {
                                cursor,
                                max_frame_len: inner.max_frame_len(),
                            })
                            .await?;
                        }
                    }
                    Ok(conn)
                }
            })
            .await;

        let mut conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Failed to establish listen stream, giving up"
                );
                break;
            }
        };

        loop {
            tokio::select! {
                res = conn.read_event() => match res {
                    Ok(Some(event)) => {
                        cursor = ListenCursor::Version(event.version);
                        if events_tx.send(event).is_err() {
                            // receiver gone, nobody cares anymore
                            break 'stream;
                        }
                    }
                    Ok(None) | Err(_) => {
                        if inner.enable_ha() {
                            debug!(
                                target: LOG_TARGET,
                                ?cursor,
                                "Listen stream broken, re-registering"
                            );
                            continue 'stream;
                        }
                        break 'stream;
                    }
                },
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break 'stream;
                    }
                }
            }
        }
    }
}
