use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use evhub_core::Member;
use evhub_store::{EventStore, StoreResult};
use evhub_util_err::FmtCompact as _;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::LOG_TARGET;

/// Simple shared-store HA: peers heartbeat into the membership table and
/// the first one to find no living leader claims the flag.
///
/// Leadership is only as strong as the clocks behind it. A peer whose
/// clock runs far ahead can consider the leader dead while it is not, and
/// elect itself alongside it. This layer accepts that risk; it does not
/// attempt consensus.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Uri peers and clients reach this server at; defaults to the actual
    /// bound address.
    pub server_uri: Option<String>,
    pub heartbeat_interval: Duration,
    pub ttl: Duration,
}

impl HaConfig {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            server_uri: None,
            heartbeat_interval,
            ttl: heartbeat_interval * 3,
        }
    }

    pub fn with_server_uri(mut self, server_uri: impl Into<String>) -> Self {
        self.server_uri = Some(server_uri.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        assert!(
            self.heartbeat_interval * 2 <= ttl,
            "TTL must be at least twice the heartbeat interval"
        );
        self.ttl = ttl;
        self
    }
}

pub struct HaManager {
    uuid: String,
    server_uri: String,
    heartbeat_interval: Duration,
    ttl: Duration,
    store: Arc<dyn EventStore>,
    is_leader: AtomicBool,
    leader_uri: std::sync::Mutex<Option<String>>,
}

impl HaManager {
    pub fn new(store: Arc<dyn EventStore>, server_uri: String, config: &HaConfig) -> Arc<Self> {
        assert!(
            config.heartbeat_interval * 2 <= config.ttl,
            "TTL must be at least twice the heartbeat interval"
        );
        let uuid = format!("{:032x}", rand::random::<u128>());
        info!(
            target: LOG_TARGET,
            %uuid,
            %server_uri,
            "Starting HA membership"
        );
        Arc::new(Self {
            uuid,
            server_uri,
            heartbeat_interval: config.heartbeat_interval,
            ttl: config.ttl,
            store,
            is_leader: AtomicBool::new(false),
            leader_uri: std::sync::Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Last observed leader uri, for redirecting followers' callers.
    pub fn leader_uri(&self) -> Option<String> {
        self.leader_uri.lock().expect("Locking failed").clone()
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).expect("TTL out of range")
    }

    pub async fn alive_members(&self) -> StoreResult<Vec<Member>> {
        self.store.list_members(self.ttl_ms()).await
    }

    /// One heartbeat: refresh our row, contend for leadership if it looks
    /// vacant, and cache the current leader uri.
    async fn tick(&self) -> StoreResult<()> {
        self.store
            .heartbeat_member(&self.uuid, &self.server_uri)
            .await?;

        let acquired = self
            .store
            .try_acquire_leadership(&self.uuid, &self.server_uri, self.ttl_ms())
            .await?;
        let was_leader = self.is_leader.swap(acquired, Ordering::SeqCst);
        if acquired && !was_leader {
            info!(target: LOG_TARGET, uuid = %self.uuid, "Assumed leadership");
        }

        let leader_uri = self
            .alive_members()
            .await?
            .into_iter()
            .find(|member| member.is_leader && member.is_alive)
            .map(|member| member.server_uri);
        *self.leader_uri.lock().expect("Locking failed") = leader_uri;

        Ok(())
    }

    /// Run the heartbeat loop until shutdown.
    #[instrument(skip_all, fields(uuid = %self.uuid))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => (),
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = self.tick().await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Heartbeat failed");
            }
        }

        debug!(target: LOG_TARGET, "Heartbeat loop quitting");
        if self.is_leader.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.store.resign_leadership(&self.uuid).await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Failed to resign leadership");
            }
        }
    }
}
